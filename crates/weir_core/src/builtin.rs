//! Built-in codelets.
//!
//! These tasks move `u32` frames around. They are enough to assemble chains,
//! control-flow graphs and synthetic workloads for profiling.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::socket::{Datatype, Socket, SocketDirection, read_u32, write_u32};
use crate::task::{Codelet, Status, Task, TaskIo, TaskKind};

/// Frame counter
///
/// Writes `counter` into every element of frame `counter`. Stops the
/// sequence once `limit` frames have been produced.
#[derive(Debug, Default)]
pub struct Source {
    next: u64,
    limit: Option<u64>,
}

impl Source {
    /// Counter producing at most `limit` frames
    #[must_use]
    pub fn new(limit: Option<u64>) -> Self {
        Self { next: 0, limit }
    }

    /// Task with one output socket of `n_elmts` u32 values
    #[must_use]
    pub fn task(name: impl Into<String>, n_elmts: usize, limit: Option<u64>) -> Task {
        Task::new(name, Box::new(Self::new(limit))).with_socket(Socket::new(
            "out",
            SocketDirection::Out,
            Datatype::UInt32,
            n_elmts,
        ))
    }
}

impl Codelet for Source {
    fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        let out = io.socket(0)?;
        let frame_bytes = out.frame_bytes();
        let mut bytes = out.buffer().lock();
        for frame in bytes.chunks_mut(frame_bytes.max(1)) {
            if self.limit.is_some_and(|limit| self.next >= limit) {
                return Ok(Status::FailureStop);
            }
            let value = self.next as u32;
            for i in 0..frame.len() / 4 {
                write_u32(frame, i, value);
            }
            self.next += 1;
        }
        Ok(Status::Success)
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        Err(CoreError::config("source", "a frame counter cannot be replicated"))
    }

    fn is_replicable(&self) -> bool {
        false
    }
}

/// Adds one to every element
#[derive(Debug, Clone, Default)]
pub struct Increment;

impl Increment {
    /// Task with an input and an output socket of `n_elmts` u32 values
    #[must_use]
    pub fn task(name: impl Into<String>, n_elmts: usize) -> Task {
        Task::new(name, Box::new(Self))
            .with_socket(Socket::new("in", SocketDirection::In, Datatype::UInt32, n_elmts))
            .with_socket(Socket::new("out", SocketDirection::Out, Datatype::UInt32, n_elmts))
    }
}

impl Codelet for Increment {
    fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        let input = io.buffer(0)?.lock().clone();
        let mut out = io.buffer(1)?.lock();
        for i in 0..out.len().min(input.len()) / 4 {
            let value = read_u32(&input, i).unwrap_or_default();
            write_u32(&mut out, i, value.wrapping_add(1));
        }
        Ok(Status::Success)
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        Ok(Box::new(self.clone()))
    }
}

/// Busy-waits a fixed duration, leaving its forward socket untouched
#[derive(Debug, Clone)]
pub struct Spin {
    duration: Duration,
    replicable: bool,
}

impl Spin {
    /// Spin for `duration` per execution
    #[must_use]
    pub fn new(duration: Duration, replicable: bool) -> Self {
        Self {
            duration,
            replicable,
        }
    }

    /// Task with one forward socket of `n_elmts` u32 values
    #[must_use]
    pub fn task(
        name: impl Into<String>,
        n_elmts: usize,
        duration: Duration,
        replicable: bool,
    ) -> Task {
        Task::new(name, Box::new(Self::new(duration, replicable))).with_socket(Socket::new(
            "data",
            SocketDirection::Forward,
            Datatype::UInt32,
            n_elmts,
        ))
    }
}

impl Codelet for Spin {
    fn exec(&mut self, _io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        let start = Instant::now();
        while start.elapsed() < self.duration {
            std::hint::spin_loop();
        }
        Ok(Status::Success)
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        if !self.replicable {
            return Err(CoreError::config("spin", "sequential spin task"));
        }
        Ok(Box::new(self.clone()))
    }

    fn is_replicable(&self) -> bool {
        self.replicable
    }
}

/// Frame log shared by every copy of a [`Sink`]
#[derive(Debug, Clone, Default)]
pub struct SinkLog(Arc<Mutex<Vec<u32>>>);

impl SinkLog {
    /// Recorded values in arrival order
    #[must_use]
    pub fn values(&self) -> Vec<u32> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of recorded frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, value: u32) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }
}

/// Records the first element of every frame
#[derive(Debug, Clone, Default)]
pub struct Sink {
    log: SinkLog,
}

impl Sink {
    /// Task with one input socket of `n_elmts` u32 values, and its log
    #[must_use]
    pub fn task(name: impl Into<String>, n_elmts: usize) -> (Task, SinkLog) {
        let sink = Self::default();
        let log = sink.log.clone();
        let task = Task::new(name, Box::new(sink)).with_socket(Socket::new(
            "in",
            SocketDirection::In,
            Datatype::UInt32,
            n_elmts,
        ));
        (task, log)
    }
}

impl Codelet for Sink {
    fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        let input = io.socket(0)?;
        let frame_bytes = input.frame_bytes().max(1);
        let bytes = input.buffer().lock();
        for frame in bytes.chunks(frame_bytes) {
            if let Some(value) = read_u32(frame, 0) {
                self.log.push(value);
            }
        }
        Ok(Status::Success)
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        Ok(Box::new(self.clone()))
    }
}

/// Forwards data and emits a path index taken from a cyclic pattern
#[derive(Debug, Clone)]
pub struct Controller {
    pattern: Vec<u32>,
    next: usize,
}

impl Controller {
    /// Cycle through `pattern`
    pub fn new(pattern: Vec<u32>) -> CoreResult<Self> {
        if pattern.is_empty() {
            return Err(CoreError::config("pattern", "must not be empty"));
        }
        Ok(Self { pattern, next: 0 })
    }

    /// Task with a forward data socket and a one-element path output
    pub fn task(name: impl Into<String>, n_elmts: usize, pattern: Vec<u32>) -> CoreResult<Task> {
        Ok(Task::new(name, Box::new(Self::new(pattern)?))
            .with_socket(Socket::new(
                "data",
                SocketDirection::Forward,
                Datatype::UInt32,
                n_elmts,
            ))
            .with_socket(Socket::new("path", SocketDirection::Out, Datatype::UInt32, 1)))
    }
}

impl Codelet for Controller {
    fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        let path = self.pattern[self.next % self.pattern.len()];
        self.next = (self.next + 1) % self.pattern.len();
        let mut out = io.buffer(1)?.lock();
        for i in 0..out.len() / 4 {
            write_u32(&mut out, i, path);
        }
        Ok(Status::Success)
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        Ok(Box::new(Self {
            pattern: self.pattern.clone(),
            next: 0,
        }))
    }
}

/// Control-flow switch
///
/// The commute side copies its data input to the output chosen by the path
/// input. The select side copies the input it was entered through.
#[derive(Debug, Clone)]
pub struct Switch {
    n_paths: usize,
    kind: TaskKind,
}

impl Switch {
    /// Commute task: sockets `data`, `path`, then `data0..data{n-1}`
    pub fn commute(name: impl Into<String>, n_paths: usize, n_elmts: usize) -> CoreResult<Task> {
        Self::check(n_paths)?;
        let mut task = Task::new(
            name,
            Box::new(Self {
                n_paths,
                kind: TaskKind::Commute,
            }),
        )
        .with_kind(TaskKind::Commute)
        .with_socket(Socket::new("data", SocketDirection::In, Datatype::UInt32, n_elmts))
        .with_socket(Socket::new("path", SocketDirection::In, Datatype::UInt32, 1));
        for p in 0..n_paths {
            task = task.with_socket(Socket::new(
                format!("data{p}"),
                SocketDirection::Out,
                Datatype::UInt32,
                n_elmts,
            ));
        }
        Ok(task)
    }

    /// Select task: sockets `data0..data{n-1}`, then `data`
    pub fn select(name: impl Into<String>, n_paths: usize, n_elmts: usize) -> CoreResult<Task> {
        Self::check(n_paths)?;
        let mut task = Task::new(
            name,
            Box::new(Self {
                n_paths,
                kind: TaskKind::Select,
            }),
        )
        .with_kind(TaskKind::Select);
        for p in 0..n_paths {
            task = task.with_socket(Socket::new(
                format!("data{p}"),
                SocketDirection::In,
                Datatype::UInt32,
                n_elmts,
            ));
        }
        Ok(task.with_socket(Socket::new("data", SocketDirection::Out, Datatype::UInt32, n_elmts)))
    }

    fn check(n_paths: usize) -> CoreResult<()> {
        if n_paths < 2 {
            return Err(CoreError::config("n_paths", "a switch needs at least two paths"));
        }
        Ok(())
    }
}

impl Codelet for Switch {
    fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
        match self.kind {
            TaskKind::Commute => {
                let path = read_u32(&io.buffer(1)?.lock(), 0).unwrap_or_default() as usize;
                if path >= self.n_paths {
                    warn!(path, n_paths = self.n_paths, "switch path out of range");
                    return Ok(Status::Failure);
                }
                io.buffer(2 + path)?.copy_from(io.buffer(0)?);
                io.set_path(path);
            }
            _ => {
                let Some(path) = io.path().filter(|p| *p < self.n_paths) else {
                    return Err(CoreError::invariant("select executed without an entry path"));
                };
                io.buffer(self.n_paths)?.copy_from(io.buffer(path)?);
            }
        }
        Ok(Status::Success)
    }

    fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskGraph;
    use crate::id::SocketRef;

    #[test]
    fn test_source_limit() {
        let mut task = Source::task("src", 2, Some(2));
        assert!(!task.is_replicable());
        assert_eq!(task.exec(0).unwrap(), Status::Success);
        assert_eq!(read_u32(&task.sockets()[0].buffer().lock(), 1), Some(0));
        assert_eq!(task.exec(1).unwrap(), Status::Success);
        assert_eq!(read_u32(&task.sockets()[0].buffer().lock(), 0), Some(1));
        assert_eq!(task.exec(2).unwrap(), Status::FailureStop);
    }

    #[test]
    fn test_source_multi_frame() {
        let mut task = Source::task("src", 1, None);
        task.set_n_frames(3);
        task.exec(0).unwrap();
        let bytes = task.sockets()[0].buffer().lock().clone();
        assert_eq!(
            (0..3).map(|i| read_u32(&bytes, i).unwrap()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_chain_execution() {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, None));
        let inc = graph.add(Increment::task("inc", 1));
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(SocketRef::new(inc, 0), SocketRef::new(src, 0)).unwrap();
        graph.bind(SocketRef::new(sink, 0), SocketRef::new(inc, 1)).unwrap();

        for frame in 0..3 {
            for id in [src, inc, sink] {
                graph.task(id).unwrap().exec(frame).unwrap();
            }
        }
        assert_eq!(log.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_switch_routes_data() {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, None));
        let ctrl = graph.add(Controller::task("ctrl", 1, vec![1]).unwrap());
        let commute = graph.add(Switch::commute("commute", 2, 1).unwrap());
        let select = graph.add(Switch::select("select", 2, 1).unwrap());
        graph.bind(SocketRef::new(ctrl, 0), SocketRef::new(src, 0)).unwrap();
        graph.bind(SocketRef::new(commute, 0), SocketRef::new(ctrl, 0)).unwrap();
        graph.bind(SocketRef::new(commute, 1), SocketRef::new(ctrl, 1)).unwrap();
        graph.bind(SocketRef::new(select, 0), SocketRef::new(commute, 2)).unwrap();
        graph.bind(SocketRef::new(select, 1), SocketRef::new(commute, 3)).unwrap();

        for id in [src, src, ctrl, commute] {
            graph.task(id).unwrap().exec(0).unwrap();
        }
        assert_eq!(graph.task(commute).unwrap().path(), Some(1));

        let mut sel = graph.task(select).unwrap();
        assert!(sel.exec(0).is_err());
        sel.set_path(Some(1));
        sel.exec(0).unwrap();
        assert_eq!(read_u32(&sel.sockets()[2].buffer().lock(), 0), Some(1));
    }

    #[test]
    fn test_switch_out_of_range_fails() {
        let mut task = Switch::commute("commute", 2, 1).unwrap();
        write_u32(&mut task.sockets()[1].buffer().lock(), 0, 5);
        assert_eq!(task.exec(0).unwrap(), Status::Failure);
        assert!(Switch::select("s", 1, 1).is_err());
        assert!(Controller::new(Vec::new()).is_err());
    }
}
