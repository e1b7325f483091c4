//! Construction of the sequence tree from a task graph.
//!
//! The walk creates one node per straight-line run of tasks. A new node
//! starts at a control-flow task, at a join (several in-scope
//! predecessors) and after any fan-out. A pruning pass then splices out the
//! empty single-parent single-child nodes the walk leaves behind.

use indexmap::{IndexMap, IndexSet};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use tracing::debug;
use weir_core::{CoreError, CoreResult, SocketDirection, SocketRef, TaskGraph, TaskId, TaskKind};
use weir_graph::{Graph, NodeIdx};

use crate::subsequence::SubSequence;

/// The built tree, before per-thread compilation
#[derive(Debug)]
pub(crate) struct Blueprint {
    pub tree: Graph<SubSequence>,
    pub root: NodeIdx,
    pub exec_order: Vec<TaskId>,
    pub control_flow: bool,
}

struct TaskInfo {
    kind: TaskKind,
    /// Produced sockets, in socket order
    produced: Vec<usize>,
    /// Consumers of each produced socket
    outputs: Vec<Vec<SocketRef>>,
    /// In-scope predecessor count
    n_preds: usize,
    /// Inputs and the producer they are bound to
    inputs: Vec<(usize, SocketRef)>,
}

struct Builder<'a> {
    lasts: &'a [TaskId],
    info: FxHashMap<TaskId, TaskInfo>,
    tree: Graph<SubSequence>,
    node_of_join: FxHashMap<TaskId, NodeIdx>,
    placed: FxHashSet<TaskId>,
}

pub(crate) fn build(
    graph: &TaskGraph,
    scope: &IndexSet<TaskId>,
    firsts: &[TaskId],
    lasts: &[TaskId],
) -> CoreResult<Blueprint> {
    if scope.is_empty() {
        return Err(CoreError::config("scope", "a sequence needs at least one task"));
    }
    if firsts.is_empty() {
        return Err(CoreError::config("firsts", "a sequence needs at least one first task"));
    }
    for first in firsts {
        if !scope.contains(first) {
            return Err(CoreError::config("firsts", format!("{first} is outside the scope")));
        }
    }

    let mut builder = Builder {
        lasts,
        info: collect_info(graph, scope)?,
        tree: Graph::new(),
        node_of_join: FxHashMap::default(),
        placed: FxHashSet::default(),
    };

    let root = if let [first] = firsts {
        builder.start_node(*first, None)?
    } else {
        let root = builder.tree.add_node(SubSequence::new(TaskKind::Standard));
        for &first in firsts {
            builder.start_node(first, Some((root, None)))?;
        }
        root
    };

    let Builder { mut tree, placed, .. } = builder;
    if let Some(missing) = scope.iter().find(|t| !placed.contains(*t)) {
        return Err(CoreError::config(
            "scope",
            format!("{missing} is not reachable from the first tasks"),
        ));
    }
    if tree.payload(root).is_some_and(|s| s.kind == TaskKind::Select) {
        return Err(CoreError::config("firsts", "a sequence cannot start with a select"));
    }

    check_cycles(&tree, root)?;
    prune(&mut tree, root);
    tree.compute_depths(root);
    assign_ids(&mut tree, root)?;
    let exec_order = linearize(&tree, root);
    let control_flow = tree.iter().any(|(_, n)| n.payload().kind != TaskKind::Standard);

    debug!(
        nodes = tree.len(),
        tasks = exec_order.len(),
        control_flow,
        "sequence tree built"
    );
    Ok(Blueprint {
        tree,
        root,
        exec_order,
        control_flow,
    })
}

fn collect_info(
    graph: &TaskGraph,
    scope: &IndexSet<TaskId>,
) -> CoreResult<FxHashMap<TaskId, TaskInfo>> {
    let mut info = FxHashMap::default();
    for &id in scope {
        let task = graph.task(id)?;
        let kind = task.kind();
        let produced: Vec<usize> = task
            .sockets()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.direction().produces())
            .map(|(i, _)| i)
            .collect();
        let inputs: Vec<(usize, SocketRef)> = task
            .sockets()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.direction() != SocketDirection::Out)
            .filter_map(|(i, s)| s.bound_to().map(|p| (i, p)))
            .collect();
        drop(task);

        let preds: FxHashSet<TaskId> = inputs
            .iter()
            .map(|(_, p)| p.task)
            .filter(|t| scope.contains(t))
            .collect();
        let mut outputs = Vec::with_capacity(produced.len());
        for &socket in &produced {
            let consumers = graph
                .consumers_of(SocketRef::new(id, socket))?
                .into_iter()
                .filter(|c| scope.contains(&c.task))
                .collect();
            outputs.push(consumers);
        }
        info.insert(
            id,
            TaskInfo {
                kind,
                produced,
                outputs,
                n_preds: preds.len(),
                inputs,
            },
        );
    }
    Ok(info)
}

impl Builder<'_> {
    fn info(&self, task: TaskId) -> CoreResult<&TaskInfo> {
        self.info
            .get(&task)
            .ok_or_else(|| CoreError::not_found("Task", task))
    }

    fn is_join(&self, task: TaskId) -> CoreResult<bool> {
        let info = self.info(task)?;
        Ok(info.kind == TaskKind::Select || info.n_preds > 1)
    }

    fn starts_node(&self, task: TaskId) -> CoreResult<bool> {
        Ok(self.info(task)?.kind != TaskKind::Standard || self.is_join(task)?)
    }

    /// In-scope successors, ordered by producing socket
    fn successors(&self, task: TaskId) -> CoreResult<IndexSet<TaskId>> {
        if self.lasts.contains(&task) {
            return Ok(IndexSet::new());
        }
        Ok(self
            .info(task)?
            .outputs
            .iter()
            .flatten()
            .map(|c| c.task)
            .collect())
    }

    /// Input socket of `select` fed by `from` (a task, optionally one socket)
    fn entry_socket(&self, select: TaskId, from: TaskId, socket: Option<usize>) -> CoreResult<usize> {
        self.info(select)?
            .inputs
            .iter()
            .find(|(_, p)| p.task == from && socket.is_none_or(|s| p.socket == s))
            .map(|(i, _)| *i)
            .ok_or_else(|| {
                CoreError::config("select", format!("{select} is not fed by {from}"))
            })
    }

    /// Create (or reuse, for joins) the node starting at `task`
    ///
    /// `parent` is the node leading here, with the producer feeding `task`
    /// from it (task and optional socket) when known.
    fn start_node(
        &mut self,
        task: TaskId,
        parent: Option<(NodeIdx, Option<(TaskId, Option<usize>)>)>,
    ) -> CoreResult<NodeIdx> {
        let kind = self.info(task)?.kind;
        let join = self.is_join(task)?;

        let (node, fresh) = match self.node_of_join.get(&task) {
            Some(&node) if join => (node, false),
            _ => {
                let node = self.tree.add_node(SubSequence::new(kind));
                if join {
                    self.node_of_join.insert(task, node);
                }
                (node, true)
            }
        };

        if let Some((parent, feeder)) = parent {
            self.tree.link(parent, node);
            if kind == TaskKind::Select {
                let (from, socket) = feeder.ok_or_else(|| {
                    CoreError::config("select", format!("{task} is reached without a producer"))
                })?;
                let entry = self.entry_socket(task, from, socket)?;
                if let Some(sub) = self.tree.payload_mut(node) {
                    sub.entries.insert(parent, entry);
                }
            }
        }

        if fresh {
            self.fill(node, task)?;
        }
        Ok(node)
    }

    fn place(&mut self, node: NodeIdx, task: TaskId) -> CoreResult<()> {
        if !self.placed.insert(task) {
            return Err(CoreError::config(
                "graph",
                format!("{task} is reached twice: cycles must go through a select"),
            ));
        }
        if let Some(sub) = self.tree.payload_mut(node) {
            sub.tasks.push(task);
        }
        Ok(())
    }

    fn fill(&mut self, node: NodeIdx, first: TaskId) -> CoreResult<()> {
        let mut task = first;
        loop {
            self.place(node, task)?;

            if self.info(task)?.kind == TaskKind::Commute {
                let outputs = if self.lasts.contains(&task) {
                    Vec::new()
                } else {
                    self.info(task)?.outputs.clone()
                };
                let produced = self.info(task)?.produced.clone();
                for (path, consumers) in outputs.into_iter().enumerate() {
                    let branch = self.tree.add_node(SubSequence::new(TaskKind::Standard));
                    self.tree.link(node, branch);
                    let socket = produced.get(path).copied();
                    let mut seen = IndexSet::new();
                    for consumer in consumers {
                        if seen.insert(consumer.task) {
                            self.start_node(consumer.task, Some((branch, Some((task, socket)))))?;
                        }
                    }
                }
                return Ok(());
            }

            let successors = self.successors(task)?;
            if successors.len() == 1 && !self.starts_node(successors[0])? {
                task = successors[0];
                continue;
            }
            for next in successors {
                self.start_node(next, Some((node, Some((task, None)))))?;
            }
            return Ok(());
        }
    }
}

/// Reject cycles that do not re-enter through a select node
fn check_cycles(tree: &Graph<SubSequence>, root: NodeIdx) -> CoreResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }
    let mut marks: FxHashMap<NodeIdx, Mark> = FxHashMap::default();
    let mut stack = vec![(root, 0usize)];
    marks.insert(root, Mark::Active);
    while let Some((node, next)) = stack.pop() {
        let children = tree.children(node);
        if next >= children.len() {
            marks.insert(node, Mark::Done);
            continue;
        }
        stack.push((node, next + 1));
        let child = children[next];
        if tree.payload(child).is_some_and(|s| s.kind == TaskKind::Select) {
            if marks.get(&child).copied().unwrap_or(Mark::New) == Mark::New {
                marks.insert(child, Mark::Active);
                stack.push((child, 0));
            }
            continue;
        }
        match marks.get(&child).copied().unwrap_or(Mark::New) {
            Mark::New => {
                marks.insert(child, Mark::Active);
                stack.push((child, 0));
            }
            Mark::Active => {
                return Err(CoreError::config(
                    "graph",
                    "cycle without a select task".to_string(),
                ));
            }
            Mark::Done => {}
        }
    }
    Ok(())
}

/// Splice out empty nodes with exactly one parent and one child
fn prune(tree: &mut Graph<SubSequence>, root: NodeIdx) {
    loop {
        let candidate = tree.iter().find_map(|(idx, node)| {
            let removable = idx != root
                && node.payload().is_empty()
                && node.payload().kind == TaskKind::Standard
                && node.parents().len() == 1
                && node.children().len() == 1;
            if !removable {
                return None;
            }
            let (parent, child) = (node.parents()[0], node.children()[0]);
            // keep the node when splicing would duplicate an edge
            if parent == child || tree.child_pos(parent, child).is_some() {
                return None;
            }
            Some((idx, parent, child))
        });
        let Some((idx, parent, child)) = candidate else {
            return;
        };

        let pos = tree.child_pos(parent, idx);
        let ppos = tree.parent_pos(child, idx);
        tree.remove_node(idx);
        tree.add_child(parent, child, pos);
        tree.add_parent(child, parent, ppos);
        if let Some(sub) = tree.payload_mut(child) {
            if let Some(entry) = sub.entries.shift_remove(&idx) {
                sub.entries.insert(parent, entry);
            }
        }
    }
}

/// Number the nodes breadth first; a join waits for the parents that must
/// reach it first
fn assign_ids(tree: &mut Graph<SubSequence>, root: NodeIdx) -> CoreResult<()> {
    let mut arrivals: FxHashMap<NodeIdx, usize> = FxHashMap::default();
    let mut ids: IndexMap<NodeIdx, usize> = IndexMap::new();
    let mut queue = VecDeque::from([root]);

    while let Some(node) = queue.pop_front() {
        if ids.contains_key(&node) {
            continue;
        }
        ids.insert(node, ids.len());
        let depth = tree.depth(node).unwrap_or_default();
        for &child in tree.children(node) {
            if ids.contains_key(&child) {
                continue;
            }
            let child_depth = tree.depth(child).unwrap_or_default();
            let select = tree.payload(child).is_some_and(|s| s.kind == TaskKind::Select);
            let expected = if select {
                if depth >= child_depth {
                    continue;
                }
                tree.parents(child)
                    .iter()
                    .filter(|&&p| tree.depth(p).is_some_and(|d| d < child_depth))
                    .count()
            } else {
                tree.parents(child).len()
            };
            let count = arrivals.entry(child).or_default();
            *count += 1;
            if *count == expected {
                queue.push_back(child);
            }
        }
    }

    if ids.len() != tree.len() {
        return Err(CoreError::invariant(format!(
            "{} of {} sequence nodes could not be numbered",
            tree.len() - ids.len(),
            tree.len()
        )));
    }
    for (node, id) in ids {
        if let Some(sub) = tree.payload_mut(node) {
            sub.id = id;
        }
    }
    Ok(())
}

/// Task order of one pass taking every branch, used for profiling reports
fn linearize(tree: &Graph<SubSequence>, root: NodeIdx) -> Vec<TaskId> {
    let mut order = Vec::new();
    let mut arrivals: FxHashMap<NodeIdx, usize> = FxHashMap::default();
    let mut entered: FxHashSet<NodeIdx> = FxHashSet::default();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        let Some(sub) = tree.payload(node) else {
            continue;
        };
        let parents = tree.parents(node).len();
        if sub.kind != TaskKind::Select && parents > 1 && node != root {
            let count = arrivals.entry(node).or_default();
            *count += 1;
            if *count < parents {
                continue;
            }
        }
        if !entered.insert(node) {
            continue;
        }
        order.extend(sub.tasks.iter().copied());
        for &child in tree.children(node).iter().rev() {
            stack.push(child);
        }
    }
    order
}
