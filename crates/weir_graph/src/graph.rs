//! Arena of nodes addressed by stable indices.
//!
//! Parent and child links are index lists. Removing a node frees its slot
//! and erases every link pointing at it, so no dangling link survives.

use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::io::{self, Write};

use crate::node::{Node, NodeIdx};

/// Directed graph owning its node payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph<P> {
    slots: Vec<Option<Node<P>>>,
    live: usize,
}

impl<P> Default for Graph<P> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }
}

impl<P> Graph<P> {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// Whether the graph has no live node
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Insert a detached node
    pub fn add_node(&mut self, payload: P) -> NodeIdx {
        let idx = NodeIdx::from_raw(self.slots.len() as u32);
        self.slots.push(Some(Node::new(payload)));
        self.live += 1;
        idx
    }

    /// Remove a node, unlinking it from its neighbors
    pub fn remove_node(&mut self, idx: NodeIdx) -> Option<P> {
        let node = self.slots.get_mut(idx.index())?.take()?;
        self.live -= 1;
        for &parent in &node.parents {
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|&c| c != idx);
            }
        }
        for &child in &node.children {
            if let Some(c) = self.node_mut(child) {
                c.parents.retain(|&p| p != idx);
            }
        }
        Some(node.payload)
    }

    /// Node at `idx`
    #[must_use]
    pub fn node(&self, idx: NodeIdx) -> Option<&Node<P>> {
        self.slots.get(idx.index()).and_then(Option::as_ref)
    }

    /// Mutable node at `idx`
    pub fn node_mut(&mut self, idx: NodeIdx) -> Option<&mut Node<P>> {
        self.slots.get_mut(idx.index()).and_then(Option::as_mut)
    }

    /// Whether `idx` designates a live node
    #[must_use]
    pub fn contains(&self, idx: NodeIdx) -> bool {
        self.node(idx).is_some()
    }

    /// Payload at `idx`
    #[must_use]
    pub fn payload(&self, idx: NodeIdx) -> Option<&P> {
        self.node(idx).map(Node::payload)
    }

    /// Mutable payload at `idx`
    pub fn payload_mut(&mut self, idx: NodeIdx) -> Option<&mut P> {
        self.node_mut(idx).map(Node::payload_mut)
    }

    /// Children of `idx`, empty for unknown nodes
    #[must_use]
    pub fn children(&self, idx: NodeIdx) -> &[NodeIdx] {
        self.node(idx).map_or(&[][..], Node::children)
    }

    /// Parents of `idx`, empty for unknown nodes
    #[must_use]
    pub fn parents(&self, idx: NodeIdx) -> &[NodeIdx] {
        self.node(idx).map_or(&[][..], Node::parents)
    }

    /// Depth of `idx`
    #[must_use]
    pub fn depth(&self, idx: NodeIdx) -> Option<usize> {
        self.node(idx).map(Node::depth)
    }

    /// Live nodes in index order
    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &Node<P>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|n| (NodeIdx::from_raw(i as u32), n)))
    }

    /// Insert `child` in the child list of `node` (at `pos` or appended)
    pub fn add_child(&mut self, node: NodeIdx, child: NodeIdx, pos: Option<usize>) -> bool {
        match self.node_mut(node) {
            Some(n) => {
                n.add_child(child, pos);
                true
            }
            None => false,
        }
    }

    /// Insert `parent` in the parent list of `node` (at `pos` or appended)
    pub fn add_parent(&mut self, node: NodeIdx, parent: NodeIdx, pos: Option<usize>) -> bool {
        match self.node_mut(node) {
            Some(n) => {
                n.add_parent(parent, pos);
                true
            }
            None => false,
        }
    }

    /// Erase the child link at `pos` of `node`
    pub fn cut_child(&mut self, node: NodeIdx, pos: usize) -> bool {
        self.node_mut(node).is_some_and(|n| n.cut_child(pos))
    }

    /// Erase the parent link at `pos` of `node`
    pub fn cut_parent(&mut self, node: NodeIdx, pos: usize) -> bool {
        self.node_mut(node).is_some_and(|n| n.cut_parent(pos))
    }

    /// Position of `child` among the children of `node`
    #[must_use]
    pub fn child_pos(&self, node: NodeIdx, child: NodeIdx) -> Option<usize> {
        self.node(node)?.child_pos(child)
    }

    /// Position of `parent` among the parents of `node`
    #[must_use]
    pub fn parent_pos(&self, node: NodeIdx, parent: NodeIdx) -> Option<usize> {
        self.node(node)?.parent_pos(parent)
    }

    /// Append the edge `parent -> child` on both ends
    pub fn link(&mut self, parent: NodeIdx, child: NodeIdx) -> bool {
        if !self.contains(parent) || !self.contains(child) {
            return false;
        }
        self.add_child(parent, child, None);
        self.add_parent(child, parent, None);
        true
    }

    /// Breadth-first order from `root`, each node visited once
    #[must_use]
    pub fn bfs(&self, root: NodeIdx) -> Vec<NodeIdx> {
        let mut order = Vec::new();
        if !self.contains(root) {
            return order;
        }
        let mut seen = FxHashSet::default();
        let mut queue = VecDeque::from([root]);
        seen.insert(root);
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &child in self.children(idx) {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        order
    }

    /// Set every reachable node's depth to its shortest distance from `root`
    ///
    /// Equivalent to `depth = 1 + min(parent depths)` with the root at zero.
    pub fn compute_depths(&mut self, root: NodeIdx) {
        let mut depths: Vec<Option<usize>> = vec![None; self.slots.len()];
        if !self.contains(root) {
            return;
        }
        depths[root.index()] = Some(0);
        let mut queue = VecDeque::from([root]);
        while let Some(idx) = queue.pop_front() {
            let next = depths[idx.index()].unwrap_or_default() + 1;
            for &child in self.children(idx) {
                if depths[child.index()].is_none() {
                    depths[child.index()] = Some(next);
                    queue.push_back(child);
                }
            }
        }
        for (slot, depth) in self.slots.iter_mut().zip(depths) {
            if let (Some(node), Some(depth)) = (slot.as_mut(), depth) {
                node.depth = depth;
            }
        }
    }

    /// Copy the structure, transforming every payload
    pub fn map<Q>(&self, mut f: impl FnMut(NodeIdx, &P) -> Q) -> Graph<Q> {
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.as_ref().map(|n| Node {
                    payload: f(NodeIdx::from_raw(i as u32), &n.payload),
                    parents: n.parents.clone(),
                    children: n.children.clone(),
                    depth: n.depth,
                })
            })
            .collect();
        Graph {
            slots,
            live: self.live,
        }
    }

    /// Copy the structure, transforming every payload with a fallible map
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map<Q, E>(
        &self,
        mut f: impl FnMut(NodeIdx, &P) -> Result<Q, E>,
    ) -> Result<Graph<Q>, E> {
        let mut slots = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            let mapped = match slot {
                Some(n) => Some(Node {
                    payload: f(NodeIdx::from_raw(i as u32), &n.payload)?,
                    parents: n.parents.clone(),
                    children: n.children.clone(),
                    depth: n.depth,
                }),
                None => None,
            };
            slots.push(mapped);
        }
        Ok(Graph {
            slots,
            live: self.live,
        })
    }

    /// Write a DOT description of the nodes reachable from `root`
    pub fn write_dot<W: Write>(
        &self,
        out: &mut W,
        name: &str,
        root: NodeIdx,
        mut label: impl FnMut(NodeIdx, &P) -> String,
    ) -> io::Result<()> {
        writeln!(out, "digraph \"{name}\" {{")?;
        let order = self.bfs(root);
        for &idx in &order {
            if let Some(payload) = self.payload(idx) {
                let text = label(idx, payload).replace('"', "\\\"");
                writeln!(out, "  {idx} [label=\"{text}\"];")?;
            }
        }
        for &idx in &order {
            for (pos, child) in self.children(idx).iter().enumerate() {
                writeln!(out, "  {idx} -> {child} [label=\"{pos}\"];")?;
            }
        }
        writeln!(out, "}}")
    }
}
