//! Sequences: a task graph compiled into a tree of sub-sequences and run
//! repeatedly by a pool of threads.
//!
//! Thread 0 executes the graph's own tasks. Every other thread executes
//! replicas with private buffers, so all tasks of a multi-threaded sequence
//! must be replicable.

mod build;
mod cursor;

pub use cursor::StepOutcome;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};
use weir_core::{
    CoreError, CoreResult, SharedTask, Status, TaskGraph, TaskId, TaskKind, TaskReport,
};
use weir_graph::{Graph, NodeIdx};

use crate::pool::{Job, ThreadPool};
use crate::stop::StopCondition;
use crate::subsequence::SubSequence;
use cursor::Replica;

/// Hook run by each worker thread when it leaves its execution loop
pub type StopHook = Arc<dyn Fn() + Send + Sync>;

/// Boundaries of a sequence inside a task graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSpec {
    /// Tasks the traversal starts from
    pub firsts: Vec<TaskId>,
    /// Tasks after which the traversal stops
    #[serde(default)]
    pub lasts: Vec<TaskId>,
    /// Tasks never included
    #[serde(default)]
    pub excluded: Vec<TaskId>,
}

impl SequenceSpec {
    /// Sequence starting at `firsts`
    #[must_use]
    pub fn new(firsts: Vec<TaskId>) -> Self {
        Self {
            firsts,
            ..Self::default()
        }
    }

    /// Stop after `lasts`
    #[must_use]
    pub fn with_lasts(mut self, lasts: Vec<TaskId>) -> Self {
        self.lasts = lasts;
        self
    }

    /// Never include `excluded`
    #[must_use]
    pub fn with_excluded(mut self, excluded: Vec<TaskId>) -> Self {
        self.excluded = excluded;
        self
    }
}

/// State shared by the workers of one run
#[derive(Default)]
struct RunState {
    stop: AtomicBool,
    first_error: Mutex<Option<CoreError>>,
}

impl RunState {
    fn record(&self, err: CoreError) {
        let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_error(&self) -> Option<CoreError> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A compiled, replicated task graph
pub struct Sequence {
    name: String,
    n_threads: usize,
    tree: Graph<SubSequence>,
    root: NodeIdx,
    exec_order: Vec<TaskId>,
    control_flow: bool,
    replicas: Arc<Vec<Mutex<Replica>>>,
    pool: Option<ThreadPool>,
    interrupt: Arc<AtomicBool>,
    run: Arc<RunState>,
    on_stop: Option<StopHook>,
}

fn lock_replica(replica: &Mutex<Replica>) -> MutexGuard<'_, Replica> {
    replica.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Sequence {
    /// Build a sequence from the tasks reachable within `spec`
    ///
    /// # Errors
    ///
    /// Configuration errors for empty scopes, cycles without a select,
    /// or several threads over a non-replicable task.
    pub fn new(graph: &TaskGraph, spec: &SequenceSpec, n_threads: usize) -> CoreResult<Self> {
        let scope = graph.scope(&spec.firsts, &spec.lasts, &spec.excluded)?;
        Self::from_scope(graph, "sequence", &scope, &spec.firsts, &spec.lasts, n_threads)
    }

    /// Build a sequence over an explicit task set
    pub fn from_scope(
        graph: &TaskGraph,
        name: impl Into<String>,
        scope: &IndexSet<TaskId>,
        firsts: &[TaskId],
        lasts: &[TaskId],
        n_threads: usize,
    ) -> CoreResult<Self> {
        let name = name.into();
        if n_threads == 0 {
            return Err(CoreError::config("n_threads", "must be greater than zero"));
        }
        let blueprint = build::build(graph, scope, firsts, lasts)?;

        let mut replicas = Vec::with_capacity(n_threads);
        let own: IndexMap<TaskId, SharedTask> = scope
            .iter()
            .map(|&id| graph.handle(id).map(|h| (id, h.clone())))
            .collect::<CoreResult<_>>()?;
        replicas.push(Mutex::new(Replica::new(
            0,
            n_threads,
            &blueprint.tree,
            blueprint.root,
            own,
        )?));
        for tid in 1..n_threads {
            let copies = graph.replicate_scope(scope).map_err(|e| match e {
                CoreError::Configuration { field, .. } => CoreError::config(
                    field,
                    format!("cannot run on {n_threads} threads: task is not replicable"),
                ),
                other => other,
            })?;
            let handles: IndexMap<TaskId, SharedTask> = scope
                .iter()
                .copied()
                .zip(copies.into_iter().map(|t| Arc::new(Mutex::new(t))))
                .collect();
            replicas.push(Mutex::new(Replica::new(
                tid,
                n_threads,
                &blueprint.tree,
                blueprint.root,
                handles,
            )?));
        }

        debug!(sequence = %name, n_threads, tasks = scope.len(), "sequence ready");
        Ok(Self {
            name,
            n_threads,
            tree: blueprint.tree,
            root: blueprint.root,
            exec_order: blueprint.exec_order,
            control_flow: blueprint.control_flow,
            replicas: Arc::new(replicas),
            pool: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            run: Arc::new(RunState::default()),
            on_stop: None,
        })
    }

    /// Sequence name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads
    #[must_use]
    pub const fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Number of tasks per replica
    #[must_use]
    pub fn n_tasks(&self) -> usize {
        self.exec_order.len()
    }

    /// Tasks in execution order
    #[must_use]
    pub fn exec_order(&self) -> &[TaskId] {
        &self.exec_order
    }

    /// Whether any commute or select node exists
    #[must_use]
    pub const fn is_control_flow(&self) -> bool {
        self.control_flow
    }

    /// Flag that stops every worker at its next pass boundary
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Hook run by each worker when it stops
    pub fn set_on_stop(&mut self, hook: Option<StopHook>) {
        self.on_stop = hook;
    }

    /// Whether a run was started and not joined
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pool.as_ref().is_some_and(ThreadPool::is_running)
    }

    fn replica(&self, tid: usize) -> CoreResult<MutexGuard<'_, Replica>> {
        self.replicas
            .get(tid)
            .map(lock_replica)
            .ok_or_else(|| CoreError::not_found("Thread", tid))
    }

    fn ensure_idle(&self) -> CoreResult<()> {
        if self.is_running() {
            return Err(CoreError::invariant(format!(
                "sequence {} is running",
                self.name
            )));
        }
        Ok(())
    }

    /// Run one task on thread `tid`'s replica from the calling thread
    pub fn exec_step(&mut self, tid: usize) -> CoreResult<StepOutcome> {
        self.ensure_idle()?;
        self.replica(tid)?.exec_step()
    }

    /// Run one complete pass on thread `tid`'s replica, returning its statuses
    pub fn exec_seq(&mut self, tid: usize) -> CoreResult<Vec<Status>> {
        self.ensure_idle()?;
        let mut replica = self.replica(tid)?;
        replica.exec_pass()?;
        Ok(replica.statuses().to_vec())
    }

    /// Run on every thread until `stop` holds, a task requests a stop or an
    /// error occurs
    pub fn exec(&mut self, stop: StopCondition) -> CoreResult<()> {
        self.start(stop)?;
        self.join()
    }

    /// Run exactly `passes` passes on every thread
    pub fn exec_n(&mut self, passes: u64) -> CoreResult<()> {
        self.launch(StopCondition::Never, Some(passes))?;
        self.join()
    }

    /// Start the workers without waiting for them
    pub fn start(&mut self, stop: StopCondition) -> CoreResult<()> {
        self.launch(stop, None)
    }

    fn launch(&mut self, stop: StopCondition, max_passes: Option<u64>) -> CoreResult<()> {
        self.ensure_idle()?;
        if self.pool.is_none() {
            self.pool = Some(ThreadPool::new(self.name.clone(), self.n_threads, None)?);
        }
        self.run.stop.store(false, Ordering::SeqCst);

        let replicas = self.replicas.clone();
        let run = self.run.clone();
        let interrupt = self.interrupt.clone();
        let on_stop = self.on_stop.clone();
        let name = self.name.clone();
        let job: Job = Arc::new(move |tid| {
            if let Some(replica) = replicas.get(tid) {
                worker_loop(&name, tid, replica, &run, &interrupt, &stop, max_passes);
            }
            if let Some(hook) = &on_stop {
                hook();
            }
        });
        match self.pool.as_mut() {
            Some(pool) => pool.launch(job),
            None => Err(CoreError::invariant("thread pool missing")),
        }
    }

    /// Wait for the workers started by [`Sequence::start`]
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a worker.
    pub fn join(&mut self) -> CoreResult<()> {
        let waited = match self.pool.as_mut() {
            Some(pool) => pool.wait(),
            None => Ok(()),
        };
        self.interrupt.store(false, Ordering::SeqCst);
        let recorded = self.run.take_error();
        waited?;
        match recorded {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether every task of thread 0 measures durations
    #[must_use]
    pub fn is_stats_enabled(&self) -> bool {
        self.replicas
            .first()
            .is_some_and(|replica| lock_replica(replica).stats_enabled())
    }

    /// Enable or disable duration measurement on every replica
    pub fn set_stats(&self, enabled: bool) {
        for replica in self.replicas.iter() {
            lock_replica(replica).set_stats(enabled);
        }
    }

    /// Clear statistics on every replica
    pub fn reset_stats(&self) {
        for replica in self.replicas.iter() {
            lock_replica(replica).reset_stats();
        }
    }

    /// Statistics of thread `tid`'s tasks, in execution order
    pub fn task_reports(&self, tid: usize) -> CoreResult<Vec<(TaskId, TaskReport)>> {
        self.replica(tid)?.reports(&self.exec_order)
    }

    /// Task handles of thread `tid`'s replica
    pub fn task_handles(&self, tid: usize) -> CoreResult<Vec<(TaskId, SharedTask)>> {
        Ok(self
            .replica(tid)?
            .handles()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect())
    }

    /// Resize every socket of every replica
    pub fn set_n_frames(&mut self, n_frames: usize) -> CoreResult<()> {
        self.ensure_idle()?;
        if n_frames == 0 {
            return Err(CoreError::config("n_frames", "must be greater than zero"));
        }
        for replica in self.replicas.iter() {
            lock_replica(replica).set_n_frames(n_frames);
        }
        Ok(())
    }

    /// Structure of thread 0's tree: `(id, kind, tasks, children ids)` per
    /// node, in node id order
    #[must_use]
    pub fn describe(&self) -> Vec<(usize, TaskKind, Vec<TaskId>, Vec<usize>)> {
        let mut nodes: Vec<_> = self
            .tree
            .iter()
            .map(|(idx, node)| {
                let children = self
                    .tree
                    .children(idx)
                    .iter()
                    .filter_map(|c| self.tree.payload(*c).map(|s| s.id))
                    .collect();
                let sub = node.payload();
                (sub.id, sub.kind, sub.tasks.clone(), children)
            })
            .collect();
        nodes.sort_by_key(|n| n.0);
        nodes
    }

    /// Write the tree of thread 0 as a DOT graph
    pub fn write_dot<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let replica = self
            .replicas
            .first()
            .map(lock_replica)
            .ok_or_else(|| io::Error::other("sequence without replica"))?;
        replica.tree().write_dot(out, &self.name, self.root, |_, sub| {
            let names: Vec<String> = sub.processes.iter().map(|p| p.name()).collect();
            format!("{} {:?}\\n{}", sub.id, sub.kind, names.join("\\n"))
        })
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field("n_threads", &self.n_threads)
            .field("n_tasks", &self.exec_order.len())
            .field("control_flow", &self.control_flow)
            .finish()
    }
}

/// Dropping a running sequence interrupts it and waits for its workers.
///
/// Interrupts are checked between passes. A worker blocked in an adaptor
/// wait only returns once that adaptor is cancelled, so cancel the adaptors
/// feeding the sequence before dropping it mid-run.
impl Drop for Sequence {
    fn drop(&mut self) {
        if self.is_running() {
            self.interrupt.store(true, Ordering::SeqCst);
            if let Err(e) = self.join() {
                warn!(sequence = %self.name, error = %e, "worker failed while the sequence was dropped");
            }
        }
    }
}

fn worker_loop(
    name: &str,
    tid: usize,
    replica: &Mutex<Replica>,
    run: &RunState,
    interrupt: &AtomicBool,
    stop: &StopCondition,
    max_passes: Option<u64>,
) {
    let mut replica = lock_replica(replica);
    let mut passes = 0u64;
    loop {
        if interrupt.load(Ordering::SeqCst) || run.stop.load(Ordering::SeqCst) {
            break;
        }
        if max_passes.is_some_and(|max| passes >= max) {
            break;
        }
        if let Err(err) = replica.exec_pass() {
            error!(sequence = name, tid, error = %err, "worker stopped on error");
            run.record(err);
            run.stop.store(true, Ordering::SeqCst);
            break;
        }
        passes += 1;
        let statuses = replica.statuses();
        if statuses.iter().any(|s| s.stops()) {
            debug!(sequence = name, tid, passes, "task requested a stop");
            run.stop.store(true, Ordering::SeqCst);
            break;
        }
        if stop.holds(statuses) {
            break;
        }
    }
    if interrupt.load(Ordering::SeqCst) {
        warn!(sequence = name, tid, passes, "worker interrupted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use weir_core::builtin::{Controller, Increment, Sink, SinkLog, Source, Spin, Switch};
    use weir_core::socket::{read_u32, write_u32};
    use weir_core::{
        Codelet, Datatype, Socket, SocketDirection, SocketRef, Task, TaskIo, lock_task,
    };

    fn s(task: TaskId, socket: usize) -> SocketRef {
        SocketRef::new(task, socket)
    }

    /// Adds its two inputs
    #[derive(Debug, Clone)]
    struct Sum;

    impl Codelet for Sum {
        fn exec(&mut self, io: &mut TaskIo<'_>, _frame_id: u64) -> CoreResult<Status> {
            let a = read_u32(&io.buffer(0)?.lock(), 0).unwrap_or_default();
            let b = read_u32(&io.buffer(1)?.lock(), 0).unwrap_or_default();
            write_u32(&mut io.buffer(2)?.lock(), 0, a + b);
            Ok(Status::Success)
        }

        fn replicate(&self) -> CoreResult<Box<dyn Codelet>> {
            Ok(Box::new(self.clone()))
        }
    }

    fn sum_task() -> Task {
        Task::new("sum", Box::new(Sum))
            .with_socket(Socket::new("a", SocketDirection::In, Datatype::UInt32, 1))
            .with_socket(Socket::new("b", SocketDirection::In, Datatype::UInt32, 1))
            .with_socket(Socket::new("out", SocketDirection::Out, Datatype::UInt32, 1))
    }

    fn chain(limit: Option<u64>) -> (TaskGraph, [TaskId; 3], SinkLog) {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, limit));
        let inc = graph.add(Increment::task("inc", 1));
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(s(inc, 0), s(src, 0)).unwrap();
        graph.bind(s(sink, 0), s(inc, 1)).unwrap();
        (graph, [src, inc, sink], log)
    }

    #[test]
    fn test_chain_runs_until_source_stops() {
        let (graph, [src, inc, sink], log) = chain(Some(5));
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        assert_eq!(seq.exec_order(), &[src, inc, sink]);
        assert!(!seq.is_control_flow());
        assert_eq!(seq.describe().len(), 1);

        seq.exec(StopCondition::Never).unwrap();
        assert_eq!(log.values(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_exec_step_walks_one_task_at_a_time() {
        let (graph, [src, inc, sink], log) = chain(None);
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();

        let steps: Vec<StepOutcome> = (0..4).map(|_| seq.exec_step(0).unwrap()).collect();
        assert_eq!(
            steps.iter().map(|o| o.task).collect::<Vec<_>>(),
            vec![src, inc, sink, src]
        );
        assert_eq!(
            steps.iter().map(|o| o.round_over).collect::<Vec<_>>(),
            vec![false, false, true, false]
        );
        assert_eq!(log.values(), vec![1]);

        // a fresh pass resets the cursor
        let statuses = seq.exec_seq(0).unwrap();
        assert_eq!(statuses, vec![Status::Success; 3]);
        assert_eq!(log.values(), vec![1, 3]);
        assert!(seq.exec_step(7).is_err());
    }

    #[test]
    fn test_lasts_and_excluded_bound_the_scope() {
        let (graph, [src, inc, _], log) = chain(None);
        let spec = SequenceSpec::new(vec![src]).with_lasts(vec![inc]);
        let mut seq = Sequence::new(&graph, &spec, 1).unwrap();
        assert_eq!(seq.n_tasks(), 2);
        seq.exec_n(2).unwrap();
        assert!(log.is_empty());

        let spec = SequenceSpec::new(vec![src]).with_excluded(vec![inc]);
        assert_eq!(Sequence::new(&graph, &spec, 1).unwrap().n_tasks(), 1);
    }

    #[test]
    fn test_multi_thread_replicas() {
        let mut graph = TaskGraph::new();
        let inc = graph.add(Increment::task("inc", 1));
        let spin = graph.add(Spin::task("spin", 1, Duration::ZERO, true));
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(s(spin, 0), s(inc, 1)).unwrap();
        graph.bind(s(sink, 0), s(spin, 0)).unwrap();

        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![inc]), 3).unwrap();
        assert_eq!(seq.n_threads(), 3);
        seq.exec_n(4).unwrap();
        assert_eq!(log.len(), 12);
        assert!(log.values().iter().all(|&v| v == 1));

        // replicas own private buffers
        let handles = seq.task_handles(1).unwrap();
        let copy = lock_task(&handles[0].1).sockets()[1].buffer().clone();
        assert!(!copy.same_as(graph.task(inc).unwrap().sockets()[1].buffer()));
    }

    #[test]
    fn test_non_replicable_task_rejects_threads() {
        let (graph, [src, ..], _) = chain(None);
        let err = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 2).unwrap_err();
        assert!(err.is_configuration());
        assert!(Sequence::new(&graph, &SequenceSpec::new(vec![src]), 0).is_err());
    }

    #[test]
    fn test_join_waits_for_every_parent() {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, Some(3)));
        let left = graph.add(Increment::task("left", 1));
        let right = graph.add(Increment::task("right", 1));
        let sum = graph.add(sum_task());
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(s(left, 0), s(src, 0)).unwrap();
        graph.bind(s(right, 0), s(src, 0)).unwrap();
        graph.bind(s(sum, 0), s(left, 1)).unwrap();
        graph.bind(s(sum, 1), s(right, 1)).unwrap();
        graph.bind(s(sink, 0), s(sum, 2)).unwrap();

        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        assert_eq!(seq.describe().len(), 4);
        assert_eq!(seq.exec_order(), &[src, left, right, sum, sink]);
        seq.exec(StopCondition::Never).unwrap();
        assert_eq!(log.values(), vec![2, 4, 6]);
    }

    #[test]
    fn test_commute_runs_one_branch() {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, Some(3)));
        let ctrl = graph.add(Controller::task("ctrl", 1, vec![0, 1, 1]).unwrap());
        let commute = graph.add(Switch::commute("commute", 2, 1).unwrap());
        let inc = graph.add(Increment::task("inc", 1));
        let select = graph.add(Switch::select("select", 2, 1).unwrap());
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(s(ctrl, 0), s(src, 0)).unwrap();
        graph.bind(s(commute, 0), s(ctrl, 0)).unwrap();
        graph.bind(s(commute, 1), s(ctrl, 1)).unwrap();
        graph.bind(s(inc, 0), s(commute, 2)).unwrap();
        graph.bind(s(select, 0), s(inc, 1)).unwrap();
        graph.bind(s(select, 1), s(commute, 3)).unwrap();
        graph.bind(s(sink, 0), s(select, 2)).unwrap();

        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        assert!(seq.is_control_flow());
        // [src ctrl] -> [commute] -> {[inc], direct} -> [select sink]
        let nodes = seq.describe();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[1].1, TaskKind::Commute);
        assert_eq!(nodes[1].3.len(), 2);

        seq.exec(StopCondition::Never).unwrap();
        assert_eq!(log.values(), vec![1, 1, 2]);
    }

    #[test]
    fn test_loop_through_select() {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, Some(3)));
        let select = graph.add(Switch::select("select", 2, 1).unwrap());
        let ctrl = graph.add(Controller::task("ctrl", 1, vec![0, 0, 1]).unwrap());
        let commute = graph.add(Switch::commute("commute", 2, 1).unwrap());
        let inc = graph.add(Increment::task("inc", 1));
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(s(select, 0), s(src, 0)).unwrap();
        graph.bind(s(ctrl, 0), s(select, 2)).unwrap();
        graph.bind(s(commute, 0), s(ctrl, 0)).unwrap();
        graph.bind(s(commute, 1), s(ctrl, 1)).unwrap();
        graph.bind(s(inc, 0), s(commute, 2)).unwrap();
        graph.bind(s(select, 1), s(inc, 1)).unwrap();
        graph.bind(s(sink, 0), s(commute, 3)).unwrap();

        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        assert!(seq.is_control_flow());
        seq.exec(StopCondition::Never).unwrap();
        assert_eq!(log.values(), vec![2, 3, 4]);
    }

    #[test]
    fn test_cycle_without_select_is_rejected() {
        let mut graph = TaskGraph::new();
        let a = graph.add(Increment::task("a", 1));
        let b = graph.add(Increment::task("b", 1));
        graph.bind(s(b, 0), s(a, 1)).unwrap();
        graph.bind(s(a, 0), s(b, 1)).unwrap();
        let err = Sequence::new(&graph, &SequenceSpec::new(vec![a]), 1).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_stop_condition_and_interrupt() {
        let (graph, [src, ..], log) = chain(None);
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();

        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();
        seq.exec(StopCondition::plain(move || {
            counter.fetch_add(1, Ordering::SeqCst) + 1 >= 4
        }))
        .unwrap();
        assert_eq!(log.len(), 4);

        seq.exec(StopCondition::statuses(|statuses| statuses.len() == 3))
            .unwrap();
        assert_eq!(log.len(), 5);

        seq.interrupt_flag().store(true, Ordering::SeqCst);
        seq.exec(StopCondition::Never).unwrap();
        assert_eq!(log.len(), 5);
        assert!(!seq.interrupt_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_interrupts_running_sequence() {
        let (graph, [src, ..], log) = chain(None);
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        seq.start(StopCondition::Never).unwrap();
        while log.len() < 3 {
            std::thread::yield_now();
        }
        drop(seq);
        let seen = log.len();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(log.len(), seen);
    }

    #[test]
    fn test_on_stop_hook_runs_per_thread() {
        let (graph, [src, ..], _) = chain(Some(2));
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        seq.set_on_stop(Some(Arc::new(move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        })));
        seq.exec(StopCondition::Never).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_reports_follow_exec_order() {
        let (graph, [src, inc, sink], _) = chain(None);
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        assert!(!seq.is_stats_enabled());
        seq.set_stats(true);
        assert!(seq.is_stats_enabled());
        seq.exec_n(3).unwrap();
        let reports = seq.task_reports(0).unwrap();
        assert_eq!(
            reports.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![src, inc, sink]
        );
        assert!(reports.iter().all(|(_, r)| r.n_calls == 3));
        assert!(!reports[0].1.replicable);

        seq.reset_stats();
        assert!(seq.task_reports(0).unwrap().iter().all(|(_, r)| r.n_calls == 0));
    }

    #[test]
    fn test_set_n_frames_and_dot() {
        let (graph, [src, ..], log) = chain(None);
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        seq.set_n_frames(2).unwrap();
        seq.exec_n(1).unwrap();
        assert_eq!(log.values(), vec![1, 2]);
        assert!(seq.set_n_frames(0).is_err());

        let mut out = Vec::new();
        seq.write_dot(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("digraph \"sequence\""));
        assert!(text.contains("inc"));
    }
}
