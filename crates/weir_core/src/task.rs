//! Tasks: named units of work with an ordered socket list.
//!
//! The computation itself lives behind the [`Codelet`] trait; the task adds
//! sockets, replication and statistics around it.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::{CoreError, CoreResult};
use crate::socket::{Socket, SocketBuffer};
use crate::stats::{TaskReport, TaskStats};

/// Outcome of one task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    /// Frame processed
    #[default]
    Success,
    /// Frame rejected; the rest of the pass is skipped
    Failure,
    /// Frame rejected and the owning sequence must stop
    FailureStop,
    /// Outcome not reported
    Unknown,
}

impl Status {
    /// Whether the rest of the current pass must be skipped
    #[must_use]
    pub const fn aborts_pass(&self) -> bool {
        matches!(self, Self::Failure | Self::FailureStop)
    }

    /// Whether the owning sequence must stop
    #[must_use]
    pub const fn stops(&self) -> bool {
        matches!(self, Self::FailureStop)
    }
}

/// Control-flow role of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskKind {
    /// Plain task
    #[default]
    Standard,
    /// Fan-out: exactly one outgoing branch runs per pass
    Commute,
    /// Fan-in: joins the branches of a commute
    Select,
}

/// View of a task's sockets handed to its codelet
pub struct TaskIo<'a> {
    sockets: &'a [Socket],
    path: &'a mut Option<usize>,
}

impl<'a> TaskIo<'a> {
    /// Number of sockets
    #[must_use]
    pub fn n_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Socket at `index`
    pub fn socket(&self, index: usize) -> CoreResult<&'a Socket> {
        self.sockets
            .get(index)
            .ok_or_else(|| CoreError::not_found("Socket", index))
    }

    /// Buffer of the socket at `index`
    pub fn buffer(&self, index: usize) -> CoreResult<&'a SocketBuffer> {
        self.socket(index).map(Socket::buffer)
    }

    /// Frames carried per execution
    #[must_use]
    pub fn n_frames(&self) -> usize {
        self.sockets.first().map_or(1, Socket::n_frames)
    }

    /// Control-flow path chosen for this execution
    #[must_use]
    pub fn path(&self) -> Option<usize> {
        *self.path
    }

    /// Select the control-flow path
    pub fn set_path(&mut self, path: usize) {
        *self.path = Some(path);
    }
}

/// The computation behind a task
pub trait Codelet: Send + std::fmt::Debug {
    /// Process one batch of frames
    fn exec(&mut self, io: &mut TaskIo<'_>, frame_id: u64) -> CoreResult<Status>;

    /// Build an independent copy for another thread
    fn replicate(&self) -> CoreResult<Box<dyn Codelet>>;

    /// Whether [`Codelet::replicate`] is meaningful
    fn is_replicable(&self) -> bool {
        true
    }
}

/// A task handle shared between a graph and the sequences executing it
pub type SharedTask = Arc<Mutex<Task>>;

/// Lock a shared task
pub fn lock_task(task: &SharedTask) -> MutexGuard<'_, Task> {
    task.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named task
#[derive(Debug)]
pub struct Task {
    name: String,
    kind: TaskKind,
    sockets: Vec<Socket>,
    codelet: Box<dyn Codelet>,
    replicable: bool,
    path: Option<usize>,
    stats: TaskStats,
    stats_enabled: bool,
}

impl Task {
    /// Create a standard task without sockets
    #[must_use]
    pub fn new(name: impl Into<String>, codelet: Box<dyn Codelet>) -> Self {
        let replicable = codelet.is_replicable();
        Self {
            name: name.into(),
            kind: TaskKind::Standard,
            sockets: Vec::new(),
            codelet,
            replicable,
            path: None,
            stats: TaskStats::default(),
            stats_enabled: false,
        }
    }

    /// Set the control-flow role
    #[must_use]
    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Append a socket
    #[must_use]
    pub fn with_socket(mut self, socket: Socket) -> Self {
        self.sockets.push(socket);
        self
    }

    /// Override replicability (cannot make a non-replicable codelet replicable)
    #[must_use]
    pub fn with_replicable(mut self, replicable: bool) -> Self {
        self.replicable = replicable && self.codelet.is_replicable();
        self
    }

    /// Task name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Control-flow role
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Whether the task can run on several threads at once
    #[must_use]
    pub const fn is_replicable(&self) -> bool {
        self.replicable
    }

    /// Ordered sockets
    #[must_use]
    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    /// Socket at `index`
    pub fn socket(&self, index: usize) -> CoreResult<&Socket> {
        self.sockets
            .get(index)
            .ok_or_else(|| CoreError::not_found("Socket", format!("{}.s{}", self.name, index)))
    }

    pub(crate) fn socket_mut(&mut self, index: usize) -> CoreResult<&mut Socket> {
        let name = &self.name;
        self.sockets
            .get_mut(index)
            .ok_or_else(|| CoreError::not_found("Socket", format!("{name}.s{index}")))
    }

    /// Control-flow path of the last execution (commute) or the next one (select)
    #[must_use]
    pub const fn path(&self) -> Option<usize> {
        self.path
    }

    /// Preset the control-flow path
    pub fn set_path(&mut self, path: Option<usize>) {
        self.path = path;
    }

    /// Statistics gathered so far
    #[must_use]
    pub const fn stats(&self) -> &TaskStats {
        &self.stats
    }

    /// Whether durations are measured
    #[must_use]
    pub const fn is_stats_enabled(&self) -> bool {
        self.stats_enabled
    }

    /// Enable or disable duration measurement
    pub fn set_stats(&mut self, enabled: bool) {
        self.stats_enabled = enabled;
    }

    /// Clear statistics
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Snapshot for profilers
    #[must_use]
    pub fn report(&self) -> TaskReport {
        TaskReport {
            name: self.name.clone(),
            replicable: self.replicable,
            n_calls: self.stats.n_calls,
            average: self.stats.average(),
        }
    }

    /// Run the codelet once
    pub fn exec(&mut self, frame_id: u64) -> CoreResult<Status> {
        let mut io = TaskIo {
            sockets: &self.sockets,
            path: &mut self.path,
        };
        if self.stats_enabled {
            let start = Instant::now();
            let status = self.codelet.exec(&mut io, frame_id)?;
            self.stats.record(start.elapsed());
            Ok(status)
        } else {
            let status = self.codelet.exec(&mut io, frame_id)?;
            self.stats.count();
            Ok(status)
        }
    }

    /// Copy for another thread: same layout and bindings, fresh buffers
    pub fn replicate(&self) -> CoreResult<Self> {
        if !self.replicable {
            return Err(CoreError::config(
                self.name.clone(),
                "task is not replicable",
            ));
        }
        Ok(Self {
            name: self.name.clone(),
            kind: self.kind,
            sockets: self.sockets.iter().map(Socket::fresh_copy).collect(),
            codelet: self.codelet.replicate()?,
            replicable: self.replicable,
            path: None,
            stats: TaskStats::default(),
            stats_enabled: self.stats_enabled,
        })
    }

    /// Resize every socket to carry `n_frames` frames
    pub fn set_n_frames(&mut self, n_frames: usize) {
        for socket in &mut self.sockets {
            socket.set_n_frames(n_frames);
        }
    }
}
