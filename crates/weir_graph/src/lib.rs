//! Weir Graph - Arena-backed directed graphs
//!
//! Nodes own their payload and refer to their neighbors by [`NodeIdx`].
//! Edge order is significant: a node's child positions are preserved when
//! nodes are spliced out, which the sequence builder relies on.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod graph;
pub mod node;

pub use graph::Graph;
pub use node::{Node, NodeIdx};
