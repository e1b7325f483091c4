//! Graph nodes and their stable indices.

use serde::{Deserialize, Serialize};

/// Stable index of a node inside its [`crate::Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdx(u32);

impl NodeIdx {
    /// Create from a raw index
    #[must_use]
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Get as a `usize` index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A node: owned payload, ordered neighbor indices and a depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<P> {
    pub(crate) payload: P,
    pub(crate) parents: Vec<NodeIdx>,
    pub(crate) children: Vec<NodeIdx>,
    pub(crate) depth: usize,
}

impl<P> Node<P> {
    pub(crate) fn new(payload: P) -> Self {
        Self {
            payload,
            parents: Vec::new(),
            children: Vec::new(),
            depth: 0,
        }
    }

    /// Payload
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Mutable payload
    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    /// Parents in insertion order
    #[must_use]
    pub fn parents(&self) -> &[NodeIdx] {
        &self.parents
    }

    /// Children in insertion order
    #[must_use]
    pub fn children(&self) -> &[NodeIdx] {
        &self.children
    }

    /// Distance from the root, as computed by the last depth pass
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Position of `child` among the children
    #[must_use]
    pub fn child_pos(&self, child: NodeIdx) -> Option<usize> {
        self.children.iter().position(|&c| c == child)
    }

    /// Position of `parent` among the parents
    #[must_use]
    pub fn parent_pos(&self, parent: NodeIdx) -> Option<usize> {
        self.parents.iter().position(|&p| p == parent)
    }

    /// Insert a child at `pos`, or append it
    pub fn add_child(&mut self, child: NodeIdx, pos: Option<usize>) {
        insert_at(&mut self.children, child, pos);
    }

    /// Insert a parent at `pos`, or append it
    pub fn add_parent(&mut self, parent: NodeIdx, pos: Option<usize>) {
        insert_at(&mut self.parents, parent, pos);
    }

    /// Remove the child at `pos`
    pub fn cut_child(&mut self, pos: usize) -> bool {
        remove_at(&mut self.children, pos)
    }

    /// Remove the parent at `pos`
    pub fn cut_parent(&mut self, pos: usize) -> bool {
        remove_at(&mut self.parents, pos)
    }
}

fn insert_at(list: &mut Vec<NodeIdx>, idx: NodeIdx, pos: Option<usize>) {
    match pos {
        Some(p) if p < list.len() => list.insert(p, idx),
        _ => list.push(idx),
    }
}

fn remove_at(list: &mut Vec<NodeIdx>, pos: usize) -> bool {
    if pos < list.len() {
        list.remove(pos);
        true
    } else {
        false
    }
}
