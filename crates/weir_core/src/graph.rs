//! The task graph: an arena of tasks connected through socket bindings.
//!
//! Edges are not stored separately. An input socket remembers the output it
//! is bound to, and successors are derived from those bindings.

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::id::{SocketRef, TaskId};
use crate::socket::{SocketBuffer, SocketDirection};
use crate::task::{SharedTask, Task, lock_task};

/// Upper bound on chains of forward sockets followed while resolving a buffer
const MAX_FORWARD_CHAIN: usize = 4096;

/// Arena of tasks
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<SharedTask>,
}

impl TaskGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task and return its id
    pub fn add(&mut self, task: Task) -> TaskId {
        let id = TaskId::from_raw(self.tasks.len() as u32);
        debug!(task = %id, name = task.name(), "task added");
        self.tasks.push(Arc::new(Mutex::new(task)));
        id
    }

    /// Number of tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph holds no task
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All task ids in insertion order
    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.tasks.len()).map(|i| TaskId::from_raw(i as u32))
    }

    /// Shared handle on a task
    pub fn handle(&self, id: TaskId) -> CoreResult<&SharedTask> {
        self.tasks
            .get(id.index())
            .ok_or_else(|| CoreError::not_found("Task", id))
    }

    /// Lock a task
    pub fn task(&self, id: TaskId) -> CoreResult<MutexGuard<'_, Task>> {
        self.handle(id).map(lock_task)
    }

    /// Bind `input` to `output`
    ///
    /// The input then reads the output's buffer. Rebinding an already bound
    /// input replaces the previous binding.
    pub fn bind(&mut self, input: SocketRef, output: SocketRef) -> CoreResult<()> {
        let reject = |reason: &str| CoreError::Binding {
            input: input.to_string(),
            output: output.to_string(),
            reason: reason.to_string(),
        };
        if input.task == output.task {
            return Err(reject("a task cannot feed itself"));
        }

        let buffer = {
            let producer = self.task(output.task)?;
            let out = producer.socket(output.socket)?;
            let consumer = self.task(input.task)?;
            let inp = consumer.socket(input.socket)?;

            if !inp.direction().consumes() {
                return Err(reject("consumer socket is an output"));
            }
            if !out.direction().produces() {
                return Err(reject("producer socket is an input"));
            }
            if inp.datatype() != out.datatype() {
                return Err(reject(&format!(
                    "datatype mismatch ({} vs {})",
                    inp.datatype(),
                    out.datatype()
                )));
            }
            if inp.n_bytes() != out.n_bytes() {
                return Err(reject(&format!(
                    "size mismatch ({} vs {} bytes)",
                    inp.n_bytes(),
                    out.n_bytes()
                )));
            }
            out.buffer().clone()
        };

        self.task(input.task)?
            .socket_mut(input.socket)?
            .attach(output, buffer);
        self.propagate(input, 0)?;
        debug!(%input, %output, "sockets bound");
        Ok(())
    }

    /// Remove the binding of `input`, returning the output it was bound to
    pub fn unbind(&mut self, input: SocketRef) -> CoreResult<Option<SocketRef>> {
        let previous = self.task(input.task)?.socket_mut(input.socket)?.detach();
        if previous.is_some() {
            self.propagate(input, 0)?;
            debug!(%input, "socket unbound");
        }
        Ok(previous)
    }

    /// Push the buffer of a rebound forward socket to everything bound to it
    fn propagate(&self, from: SocketRef, depth: usize) -> CoreResult<()> {
        if depth > MAX_FORWARD_CHAIN {
            return Err(CoreError::invariant(format!(
                "forward socket chain through {from} does not terminate"
            )));
        }
        let (direction, buffer) = {
            let task = self.task(from.task)?;
            let socket = task.socket(from.socket)?;
            (socket.direction(), socket.buffer().clone())
        };
        if direction != SocketDirection::Forward {
            return Ok(());
        }
        for consumer in self.consumers_of(from)? {
            self.task(consumer.task)?
                .socket_mut(consumer.socket)?
                .share_buffer(buffer.clone());
            self.propagate(consumer, depth + 1)?;
        }
        Ok(())
    }

    /// Input sockets bound to `output`, in task then socket order
    pub fn consumers_of(&self, output: SocketRef) -> CoreResult<Vec<SocketRef>> {
        let mut consumers = Vec::new();
        for id in self.ids() {
            let task = self.task(id)?;
            for (index, socket) in task.sockets().iter().enumerate() {
                if socket.bound_to() == Some(output) {
                    consumers.push(SocketRef::new(id, index));
                }
            }
        }
        Ok(consumers)
    }

    /// Tasks reading from `id`, ordered by producing socket
    pub fn successors(&self, id: TaskId) -> CoreResult<IndexSet<TaskId>> {
        let produced: Vec<usize> = self
            .task(id)?
            .sockets()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.direction().produces())
            .map(|(i, _)| i)
            .collect();

        let mut next = IndexSet::new();
        for socket in produced {
            for consumer in self.consumers_of(SocketRef::new(id, socket))? {
                next.insert(consumer.task);
            }
        }
        Ok(next)
    }

    /// Tasks `id` reads from, ordered by consuming socket
    pub fn predecessors(&self, id: TaskId) -> CoreResult<IndexSet<TaskId>> {
        Ok(self
            .task(id)?
            .sockets()
            .iter()
            .filter_map(|s| s.bound_to().map(|r| r.task))
            .collect())
    }

    /// Tasks reachable from `firsts`, breadth first
    ///
    /// Traversal stops after any task of `lasts` and never enters `excluded`.
    pub fn scope(
        &self,
        firsts: &[TaskId],
        lasts: &[TaskId],
        excluded: &[TaskId],
    ) -> CoreResult<IndexSet<TaskId>> {
        if firsts.is_empty() {
            return Err(CoreError::config("firsts", "at least one first task is required"));
        }
        let mut scope = IndexSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        for &first in firsts {
            self.handle(first)?;
            if !excluded.contains(&first) && scope.insert(first) {
                queue.push_back(first);
            }
        }
        while let Some(id) = queue.pop_front() {
            if lasts.contains(&id) {
                continue;
            }
            for next in self.successors(id)? {
                if !excluded.contains(&next) && scope.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(scope)
    }

    /// Replicate the tasks of `scope` for another thread
    ///
    /// Bindings between tasks of the scope are resolved to the copies.
    /// Bindings leaving the scope keep reading the graph's buffers.
    pub fn replicate_scope(&self, scope: &IndexSet<TaskId>) -> CoreResult<Vec<Task>> {
        let mut copies = Vec::with_capacity(scope.len());
        for &id in scope {
            copies.push(self.task(id)?.replicate()?);
        }

        let mut rewired = Vec::new();
        for (local, copy) in copies.iter().enumerate() {
            for (index, socket) in copy.sockets().iter().enumerate() {
                if let Some(producer) = socket.bound_to() {
                    let buffer = self.resolve(scope, &copies, producer, 0)?;
                    rewired.push((local, index, buffer));
                }
            }
        }
        for (local, index, buffer) in rewired {
            copies[local].socket_mut(index)?.share_buffer(buffer);
        }
        Ok(copies)
    }

    fn resolve(
        &self,
        scope: &IndexSet<TaskId>,
        copies: &[Task],
        sref: SocketRef,
        depth: usize,
    ) -> CoreResult<SocketBuffer> {
        if depth > MAX_FORWARD_CHAIN {
            return Err(CoreError::invariant(format!(
                "forward socket chain through {sref} does not terminate"
            )));
        }
        match scope.get_index_of(&sref.task) {
            Some(local) => {
                let socket = copies[local].socket(sref.socket)?;
                match (socket.direction(), socket.bound_to()) {
                    (SocketDirection::Forward, Some(upstream)) => {
                        self.resolve(scope, copies, upstream, depth + 1)
                    }
                    _ => Ok(socket.buffer().clone()),
                }
            }
            None => Ok(self.task(sref.task)?.socket(sref.socket)?.buffer().clone()),
        }
    }

    /// Resize every socket of every task
    pub fn set_n_frames(&mut self, n_frames: usize) -> CoreResult<()> {
        if n_frames == 0 {
            return Err(CoreError::config("n_frames", "must be greater than zero"));
        }
        for task in &self.tasks {
            lock_task(task).set_n_frames(n_frames);
        }
        Ok(())
    }

    /// Map of every bound input to its producer
    pub fn bindings(&self) -> CoreResult<FxHashMap<SocketRef, SocketRef>> {
        let mut map = FxHashMap::default();
        for id in self.ids() {
            let task = self.task(id)?;
            for (index, socket) in task.sockets().iter().enumerate() {
                if let Some(producer) = socket.bound_to() {
                    map.insert(SocketRef::new(id, index), producer);
                }
            }
        }
        Ok(map)
    }
}
