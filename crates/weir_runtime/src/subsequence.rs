//! Sub-sequences: the payload of sequence tree nodes.
//!
//! A sub-sequence is a run of tasks executed unconditionally once its node is
//! reached. Each thread owns its own copy of the tree, whose sub-sequences
//! carry that thread's [`Process`] list.

use indexmap::IndexMap;
use weir_core::{CoreError, CoreResult, SharedTask, Status, TaskId, TaskKind, lock_task};
use weir_graph::NodeIdx;

/// Entry point of one task, bound to one thread's copy of that task
#[derive(Debug, Clone)]
pub struct Process {
    task: TaskId,
    handle: SharedTask,
}

impl Process {
    /// Bind a process to a task copy
    #[must_use]
    pub fn new(task: TaskId, handle: SharedTask) -> Self {
        Self { task, handle }
    }

    /// Graph id of the task this process runs
    #[must_use]
    pub const fn task(&self) -> TaskId {
        self.task
    }

    /// Shared handle on the task copy
    #[must_use]
    pub fn handle(&self) -> &SharedTask {
        &self.handle
    }

    /// Execute the task
    pub fn exec(&self, frame_id: u64) -> CoreResult<Status> {
        lock_task(&self.handle).exec(frame_id)
    }

    /// Path recorded by the task
    #[must_use]
    pub fn path(&self) -> Option<usize> {
        lock_task(&self.handle).path()
    }

    /// Preset the path of the task
    pub fn set_path(&self, path: usize) {
        lock_task(&self.handle).set_path(Some(path));
    }

    /// Task name
    #[must_use]
    pub fn name(&self) -> String {
        lock_task(&self.handle).name().to_string()
    }
}

/// Payload of a sequence tree node
#[derive(Debug, Clone, Default)]
pub struct SubSequence {
    /// Stable id assigned once the tree is final
    pub id: usize,
    /// Control-flow tag
    pub kind: TaskKind,
    /// Tasks run by this node, in order
    pub tasks: Vec<TaskId>,
    /// Select only: input socket of the select task fed by each parent node
    pub entries: IndexMap<NodeIdx, usize>,
    /// Per-thread entry points, one per task
    pub processes: Vec<Process>,
}

impl SubSequence {
    /// Empty node of the given kind
    #[must_use]
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Copy carrying the processes of one thread
    ///
    /// `resolve` maps a graph task id to the thread's copy of that task.
    pub fn compile(
        &self,
        mut resolve: impl FnMut(TaskId) -> CoreResult<SharedTask>,
    ) -> CoreResult<Self> {
        let processes = self
            .tasks
            .iter()
            .map(|&task| resolve(task).map(|handle| Process::new(task, handle)))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            id: self.id,
            kind: self.kind,
            tasks: self.tasks.clone(),
            entries: self.entries.clone(),
            processes,
        })
    }

    /// Whether this node runs no task
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Path taken by the commute task at the end of this node
    pub fn commute_path(&self) -> CoreResult<usize> {
        self.processes
            .last()
            .and_then(Process::path)
            .ok_or_else(|| CoreError::invariant(format!("commute node {} has no path", self.id)))
    }
}
