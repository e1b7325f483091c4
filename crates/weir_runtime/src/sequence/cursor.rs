//! Per-thread stepping state machine.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use weir_core::{CoreError, CoreResult, SharedTask, Status, TaskId, TaskKind, TaskReport, lock_task};
use weir_graph::{Graph, NodeIdx};

use crate::subsequence::SubSequence;

/// Result of executing one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// Task that ran
    pub task: TaskId,
    /// Its status
    pub status: Status,
    /// Whether that task ended the pass
    pub round_over: bool,
}

#[derive(Debug)]
struct Cursor {
    node: NodeIdx,
    task: usize,
    round_over: bool,
    /// Nodes scheduled for this pass, with the parent that scheduled them
    pending: Vec<(NodeIdx, NodeIdx)>,
    /// Arrivals counted at joins during this pass
    arrivals: FxHashMap<NodeIdx, usize>,
}

/// One thread's copy of the sequence tree and its cursor
#[derive(Debug)]
pub(crate) struct Replica {
    tid: usize,
    n_threads: usize,
    tree: Graph<SubSequence>,
    root: NodeIdx,
    cursor: Cursor,
    statuses: Vec<Status>,
    pass: u64,
    handles: IndexMap<TaskId, SharedTask>,
}

impl Replica {
    pub(crate) fn new(
        tid: usize,
        n_threads: usize,
        template: &Graph<SubSequence>,
        root: NodeIdx,
        handles: IndexMap<TaskId, SharedTask>,
    ) -> CoreResult<Self> {
        let tree = template.try_map(|_, sub| {
            sub.compile(|task| {
                handles
                    .get(&task)
                    .cloned()
                    .ok_or_else(|| CoreError::not_found("Task", task))
            })
        })?;
        Ok(Self {
            tid,
            n_threads,
            tree,
            root,
            cursor: Cursor {
                node: root,
                task: 0,
                round_over: true,
                pending: Vec::new(),
                arrivals: FxHashMap::default(),
            },
            statuses: Vec::new(),
            pass: 0,
            handles,
        })
    }

    pub(crate) fn statuses(&self) -> &[Status] {
        &self.statuses
    }

    pub(crate) fn handles(&self) -> &IndexMap<TaskId, SharedTask> {
        &self.handles
    }

    pub(crate) fn tree(&self) -> &Graph<SubSequence> {
        &self.tree
    }

    fn sub(&self, node: NodeIdx) -> CoreResult<&SubSequence> {
        self.tree
            .payload(node)
            .ok_or_else(|| CoreError::invariant(format!("sequence node {node} vanished")))
    }

    fn begin_round(&mut self) {
        self.cursor.node = self.root;
        self.cursor.task = 0;
        self.cursor.round_over = false;
        self.cursor.pending.clear();
        self.cursor.arrivals.clear();
        self.statuses.clear();
    }

    fn end_round(&mut self) {
        self.cursor.round_over = true;
        self.pass += 1;
    }

    /// Run exactly one task, starting a new pass if the previous one ended
    pub(crate) fn exec_step(&mut self) -> CoreResult<StepOutcome> {
        if self.cursor.round_over {
            self.begin_round();
            if !self.seek_task()? {
                self.end_round();
                return Err(CoreError::invariant("sequence pass has no task to run"));
            }
        }

        let frame_id = self.pass * self.n_threads as u64 + self.tid as u64;
        let (task, result) = {
            let sub = self.sub(self.cursor.node)?;
            let process = sub.processes.get(self.cursor.task).ok_or_else(|| {
                CoreError::invariant(format!("cursor past the end of node {}", sub.id))
            })?;
            (process.task(), process.exec(frame_id))
        };
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                self.end_round();
                return Err(e);
            }
        };
        self.statuses.push(status);
        self.cursor.task += 1;

        let round_over = status.aborts_pass() || !self.seek_task()?;
        if round_over {
            self.end_round();
        }
        Ok(StepOutcome {
            task,
            status,
            round_over,
        })
    }

    /// Run a whole pass from the root
    pub(crate) fn exec_pass(&mut self) -> CoreResult<()> {
        self.cursor.round_over = true;
        loop {
            if self.exec_step()?.round_over {
                return Ok(());
            }
        }
    }

    /// Move the cursor onto the next task to run; false when the pass is over
    fn seek_task(&mut self) -> CoreResult<bool> {
        loop {
            let node = self.cursor.node;
            if self.cursor.task < self.sub(node)?.processes.len() {
                return Ok(true);
            }
            self.leave(node)?;
            match self.next_node()? {
                Some(next) => {
                    self.cursor.node = next;
                    self.cursor.task = 0;
                }
                None => return Ok(false),
            }
        }
    }

    /// Schedule the successors of a finished node
    fn leave(&mut self, node: NodeIdx) -> CoreResult<()> {
        let sub = self
            .tree
            .payload(node)
            .ok_or_else(|| CoreError::invariant(format!("sequence node {node} vanished")))?;
        let children = self.tree.children(node);
        if sub.kind == TaskKind::Commute {
            if children.is_empty() {
                return Ok(());
            }
            let path = sub.commute_path()?;
            let child = children.get(path).ok_or_else(|| {
                CoreError::invariant(format!(
                    "commute node {} has no branch {path} ({} branches)",
                    sub.id,
                    children.len()
                ))
            })?;
            self.cursor.pending.push((*child, node));
        } else {
            for &child in children.iter().rev() {
                self.cursor.pending.push((child, node));
            }
        }
        Ok(())
    }

    /// Pop the next node that may be entered
    fn next_node(&mut self) -> CoreResult<Option<NodeIdx>> {
        while let Some((node, from)) = self.cursor.pending.pop() {
            let sub = self
                .tree
                .payload(node)
                .ok_or_else(|| CoreError::invariant(format!("sequence node {node} vanished")))?;
            if sub.kind == TaskKind::Select {
                let entry = sub.entries.get(&from).copied().ok_or_else(|| {
                    CoreError::invariant(format!(
                        "select node {} entered from unknown node {from}",
                        sub.id
                    ))
                })?;
                if let Some(select) = sub.processes.first() {
                    select.set_path(entry);
                }
                return Ok(Some(node));
            }
            let parents = self.tree.parents(node).len();
            if parents > 1 {
                let count = self.cursor.arrivals.entry(node).or_default();
                *count += 1;
                if *count < parents {
                    continue;
                }
                *count = 0;
            }
            return Ok(Some(node));
        }
        Ok(None)
    }

    pub(crate) fn stats_enabled(&self) -> bool {
        !self.handles.is_empty()
            && self.handles.values().all(|h| lock_task(h).is_stats_enabled())
    }

    pub(crate) fn set_stats(&self, enabled: bool) {
        for handle in self.handles.values() {
            lock_task(handle).set_stats(enabled);
        }
    }

    pub(crate) fn reset_stats(&self) {
        for handle in self.handles.values() {
            lock_task(handle).reset_stats();
        }
    }

    pub(crate) fn reports(&self, order: &[TaskId]) -> CoreResult<Vec<(TaskId, TaskReport)>> {
        order
            .iter()
            .map(|&task| {
                self.handles
                    .get(&task)
                    .map(|h| (task, lock_task(h).report()))
                    .ok_or_else(|| CoreError::not_found("Task", task))
            })
            .collect()
    }

    pub(crate) fn set_n_frames(&self, n_frames: usize) {
        for handle in self.handles.values() {
            lock_task(handle).set_n_frames(n_frames);
        }
    }
}
