//! Weir Core - Fundamental types for the weir dataflow engine
//!
//! This crate provides the building blocks executed by the runtime:
//! - Task and socket identifiers
//! - Typed sockets sharing lock-protected byte buffers
//! - Tasks wrapping a [`Codelet`] with replication and statistics
//! - The task graph and its binding rules
//! - Built-in codelets for chains and control flow

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builtin;
pub mod error;
pub mod graph;
pub mod id;
pub mod socket;
pub mod stats;
pub mod task;

pub use error::{CoreError, CoreResult};
pub use graph::TaskGraph;
pub use id::{SocketRef, TaskId};
pub use socket::{Datatype, Socket, SocketBuffer, SocketDirection};
pub use stats::{TaskReport, TaskStats};
pub use task::{Codelet, SharedTask, Status, Task, TaskIo, TaskKind, lock_task};
