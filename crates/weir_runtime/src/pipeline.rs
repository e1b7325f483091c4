//! Pipelines: consecutive sequences ("stages") connected by adaptors.
//!
//! Construction partitions the task graph into stages, inserts a push task at
//! the end of every upstream stage and a pull task at the start of every
//! downstream stage, and records each binding that crossed a boundary so that
//! [`Pipeline::unbind_adaptors`] can restore it.

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};
use weir_core::{CoreError, CoreResult, SocketRef, TaskGraph, TaskId};

use crate::adaptor::{Adaptor, AdaptorConfig, AdaptorSignal, WaitingMode, ZeroCopyRebind};
use crate::adaptor_task::{StreamLayout, pull_task, push_task};
use crate::sequence::{Sequence, StopHook};
use crate::stop::StopCondition;

/// Pipeline-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots per adaptor lane
    pub buffer_size: usize,
    /// Waiting strategy of the adaptors
    pub waiting: WaitingMode,
    /// Swap buffers instead of copying bytes
    pub zero_copy: bool,
    /// Only the first stage evaluates the stop condition; the others drain
    pub auto_stop: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            waiting: WaitingMode::Passive,
            zero_copy: false,
            auto_stop: true,
        }
    }
}

impl PipelineConfig {
    /// Set the slots per lane
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the waiting strategy
    #[must_use]
    pub fn with_waiting(mut self, waiting: WaitingMode) -> Self {
        self.waiting = waiting;
        self
    }

    /// Enable or disable zero-copy transfers
    #[must_use]
    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    /// Enable or disable automatic draining
    #[must_use]
    pub fn with_auto_stop(mut self, auto_stop: bool) -> Self {
        self.auto_stop = auto_stop;
        self
    }
}

/// Per-boundary override of the adaptor settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Slots per lane
    pub buffer_size: usize,
    /// Waiting strategy
    pub waiting: WaitingMode,
}

/// Which tasks belong to a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageBounds {
    /// Tasks reachable from `firsts`, stopping after `lasts`
    Boundary {
        /// Entry tasks
        firsts: Vec<TaskId>,
        /// Exit tasks
        lasts: Vec<TaskId>,
        /// Tasks never included
        excluded: Vec<TaskId>,
    },
    /// An explicit task list
    Tasks(Vec<TaskId>),
}

/// One stage of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Tasks of the stage
    pub bounds: StageBounds,
    /// Replicas running the stage
    pub n_threads: usize,
    /// Abstract processing units, one per replica
    pub pinning: Vec<usize>,
    /// Settings of the adaptor fed by this stage
    pub sync: Option<SyncConfig>,
}

impl StageSpec {
    /// Stage over an explicit task list
    #[must_use]
    pub fn tasks(tasks: Vec<TaskId>, n_threads: usize) -> Self {
        Self {
            bounds: StageBounds::Tasks(tasks),
            n_threads,
            pinning: Vec::new(),
            sync: None,
        }
    }

    /// Stage over the tasks reachable from `firsts` up to `lasts`
    #[must_use]
    pub fn boundary(firsts: Vec<TaskId>, lasts: Vec<TaskId>, n_threads: usize) -> Self {
        Self {
            bounds: StageBounds::Boundary {
                firsts,
                lasts,
                excluded: Vec::new(),
            },
            n_threads,
            pinning: Vec::new(),
            sync: None,
        }
    }

    /// Override the adaptor settings of the outgoing boundary
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Attach processing-unit ids
    #[must_use]
    pub fn with_pinning(mut self, pinning: Vec<usize>) -> Self {
        self.pinning = pinning;
        self
    }
}

/// A binding that crosses a stage boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Crossing {
    input: SocketRef,
    original: SocketRef,
    boundary: usize,
    stream: usize,
}

#[derive(Debug)]
struct Boundary {
    push: TaskId,
    pull: TaskId,
    /// Producer socket of each stream
    streams: Vec<SocketRef>,
}

/// Stages connected by adaptors
pub struct Pipeline {
    graph: TaskGraph,
    config: PipelineConfig,
    specs: Vec<StageSpec>,
    scopes: Vec<IndexSet<TaskId>>,
    stages: Vec<Sequence>,
    adaptors: Vec<Adaptor>,
    boundaries: Vec<Boundary>,
    crossings: Vec<Crossing>,
    bound: bool,
}

impl Pipeline {
    /// Partition `graph` into `stages`, insert the adaptors and bind them
    ///
    /// # Errors
    ///
    /// Configuration errors for overlapping stages, bindings from a task
    /// outside every stage, bindings that skip a stage or point backwards,
    /// and boundaries no data crosses.
    pub fn new(
        mut graph: TaskGraph,
        stages: Vec<StageSpec>,
        config: PipelineConfig,
    ) -> CoreResult<Self> {
        if stages.is_empty() {
            return Err(CoreError::config("stages", "a pipeline needs at least one stage"));
        }
        let mut scopes = Vec::with_capacity(stages.len());
        let mut owner: FxHashMap<TaskId, usize> = FxHashMap::default();
        for (s, spec) in stages.iter().enumerate() {
            let scope = match &spec.bounds {
                StageBounds::Boundary {
                    firsts,
                    lasts,
                    excluded,
                } => graph.scope(firsts, lasts, excluded)?,
                StageBounds::Tasks(tasks) => {
                    for &task in tasks {
                        graph.handle(task)?;
                    }
                    tasks.iter().copied().collect()
                }
            };
            if scope.is_empty() {
                return Err(CoreError::config("stages", format!("stage {s} has no task")));
            }
            for &task in &scope {
                if let Some(other) = owner.insert(task, s) {
                    return Err(CoreError::config(
                        "stages",
                        format!("{task} belongs to stages {other} and {s}"),
                    ));
                }
            }
            scopes.push(scope);
        }

        let crossings = Self::find_crossings(&graph, &scopes, &owner)?;

        let mut boundaries = Vec::with_capacity(stages.len() - 1);
        let mut adaptors = Vec::with_capacity(stages.len() - 1);
        let mut indexed = Vec::with_capacity(crossings.len());
        for b in 0..stages.len() - 1 {
            let mut streams: Vec<SocketRef> = Vec::new();
            for &(input, original, boundary) in &crossings {
                if boundary != b {
                    continue;
                }
                let stream = match streams.iter().position(|s| *s == original) {
                    Some(stream) => stream,
                    None => {
                        streams.push(original);
                        streams.len() - 1
                    }
                };
                indexed.push(Crossing {
                    input,
                    original,
                    boundary: b,
                    stream,
                });
            }
            if streams.is_empty() {
                return Err(CoreError::config(
                    "stages",
                    format!("no data crosses from stage {b} to stage {}", b + 1),
                ));
            }

            let mut layouts = Vec::with_capacity(streams.len());
            let mut n_frames = 1;
            for original in &streams {
                let task = graph.task(original.task)?;
                let socket = task.socket(original.socket)?;
                n_frames = socket.n_frames();
                layouts.push(StreamLayout {
                    name: format!("{}_{}", task.name(), socket.name()),
                    datatype: socket.datatype(),
                    n_elmts: socket.n_elmts(),
                });
            }
            let (buffer_size, waiting) = match stages[b].sync {
                Some(sync) => (sync.buffer_size, sync.waiting),
                None => (config.buffer_size, config.waiting),
            };
            let adaptor = Adaptor::new(
                AdaptorConfig::default()
                    .with_buffer_size(buffer_size)
                    .with_waiting(waiting)
                    .with_zero_copy(config.zero_copy)
                    .with_replicas(stages[b].n_threads, stages[b + 1].n_threads),
                layouts.iter().map(StreamLayout::frame_bytes).collect(),
                n_frames,
            )?;
            let push = graph.add(push_task(format!("push_{b}"), &adaptor, &layouts, n_frames)?);
            let pull = graph.add(pull_task(format!("pull_{b}"), &adaptor, &layouts, n_frames)?);
            scopes[b].insert(push);
            scopes[b + 1].insert(pull);
            debug!(boundary = b, streams = streams.len(), %push, %pull, "adaptor inserted");
            boundaries.push(Boundary {
                push,
                pull,
                streams,
            });
            adaptors.push(adaptor);
        }

        let mut pipeline = Self {
            graph,
            config,
            specs: stages,
            scopes,
            stages: Vec::new(),
            adaptors,
            boundaries,
            crossings: indexed,
            bound: false,
        };
        pipeline.bind_adaptors()?;
        Ok(pipeline)
    }

    /// Every in-scope input whose producer lives in another stage
    fn find_crossings(
        graph: &TaskGraph,
        scopes: &[IndexSet<TaskId>],
        owner: &FxHashMap<TaskId, usize>,
    ) -> CoreResult<Vec<(SocketRef, SocketRef, usize)>> {
        let mut crossings = Vec::new();
        for (s, scope) in scopes.iter().enumerate() {
            for &task in scope {
                let bound: Vec<(usize, SocketRef)> = graph
                    .task(task)?
                    .sockets()
                    .iter()
                    .enumerate()
                    .filter_map(|(i, socket)| socket.bound_to().map(|p| (i, p)))
                    .collect();
                for (socket, producer) in bound {
                    let input = SocketRef::new(task, socket);
                    let ps = owner.get(&producer.task).copied().ok_or_else(|| {
                        CoreError::config(
                            "stages",
                            format!("{input} reads {producer}, which belongs to no stage"),
                        )
                    })?;
                    if ps == s {
                        continue;
                    }
                    if ps + 1 != s {
                        return Err(CoreError::config(
                            "stages",
                            format!(
                                "{input} in stage {s} reads {producer} in stage {ps}; \
                                 bindings may only cross into the next stage"
                            ),
                        ));
                    }
                    crossings.push((input, producer, ps));
                }
            }
        }
        Ok(crossings)
    }

    /// Route every crossing binding through the adaptors and build the stages
    ///
    /// Binding an already bound pipeline is a no-op. On failure the crossing
    /// bindings are restored and the pipeline stays unbound.
    pub fn bind_adaptors(&mut self) -> CoreResult<()> {
        if self.bound {
            warn!("pipeline adaptors are already bound");
            return Ok(());
        }
        if let Err(e) = self.route_through_adaptors() {
            warn!(error = %e, "pipeline binding failed, restoring crossings");
            if let Err(restore) = self.restore_crossings() {
                warn!(error = %restore, "crossings could not be restored");
            }
            return Err(e);
        }
        self.bound = true;
        info!(
            stages = self.stages.len(),
            crossings = self.crossings.len(),
            zero_copy = self.config.zero_copy,
            "pipeline adaptors bound"
        );
        Ok(())
    }

    fn route_through_adaptors(&mut self) -> CoreResult<()> {
        for crossing in &self.crossings {
            let pull = self.boundaries[crossing.boundary].pull;
            self.graph
                .bind(crossing.input, SocketRef::new(pull, crossing.stream))?;
        }
        for boundary in &self.boundaries {
            for (stream, &original) in boundary.streams.iter().enumerate() {
                self.graph
                    .bind(SocketRef::new(boundary.push, stream), original)?;
            }
        }

        let mut stages = Vec::with_capacity(self.specs.len());
        for (s, scope) in self.scopes.iter().enumerate() {
            let entry = s.checked_sub(1).map(|b| self.boundaries[b].pull);
            let mut firsts: Vec<TaskId> = entry.into_iter().collect();
            for &task in scope {
                if Some(task) == entry {
                    continue;
                }
                let preds = self.graph.predecessors(task)?;
                if !preds.iter().any(|p| scope.contains(p)) {
                    firsts.push(task);
                }
            }
            let spec = &self.specs[s];
            if !spec.pinning.is_empty() {
                debug!(stage = s, pinning = ?spec.pinning, "stage processing units");
            }
            stages.push(Sequence::from_scope(
                &self.graph,
                format!("stage_{s}"),
                scope,
                &firsts,
                &[],
                spec.n_threads,
            )?);
        }
        self.stages = stages;

        for adaptor in &self.adaptors {
            adaptor.alloc_buffers()?;
        }
        Ok(())
    }

    /// Drop the stages and restore every crossing binding
    pub fn unbind_adaptors(&mut self) -> CoreResult<()> {
        if !self.bound {
            return Ok(());
        }
        self.restore_crossings()?;
        self.bound = false;
        info!(crossings = self.crossings.len(), "pipeline adaptors unbound");
        Ok(())
    }

    /// Undo whatever part of the adaptor routing is in place; idempotent
    fn restore_crossings(&mut self) -> CoreResult<()> {
        self.stages.clear();
        for adaptor in &self.adaptors {
            adaptor.dealloc_buffers();
            adaptor.reset();
        }
        for boundary in &self.boundaries {
            for stream in 0..boundary.streams.len() {
                self.graph.unbind(SocketRef::new(boundary.push, stream))?;
            }
        }
        for crossing in &self.crossings {
            self.graph.bind(crossing.input, crossing.original)?;
        }
        Ok(())
    }

    /// Whether the adaptors are in place
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound
    }

    /// Run every stage until `stop` holds
    ///
    /// With `auto_stop`, only the first stage evaluates `stop`; each
    /// downstream stage stops once its input adaptor is drained.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by any stage.
    pub fn exec(&mut self, stop: StopCondition) -> CoreResult<()> {
        if !self.bound {
            return Err(CoreError::invariant("pipeline adaptors are not bound"));
        }
        let signals: Vec<AdaptorSignal> = self.adaptors.iter().map(Adaptor::signal).collect();
        let cancel_all = {
            let signals = signals.clone();
            move || {
                for signal in &signals {
                    signal.cancel();
                }
            }
        };

        let mut started = 0;
        let mut first_error = None;
        for (s, stage) in self.stages.iter_mut().enumerate() {
            let (condition, hook): (StopCondition, Option<StopHook>) = if !self.config.auto_stop {
                let cancel = cancel_all.clone();
                let hook: StopHook = Arc::new(move || cancel());
                (stop.clone(), Some(hook))
            } else if s == 0 {
                (stop.clone(), None)
            } else {
                let input = signals[s - 1].clone();
                let cancel = cancel_all.clone();
                let hook: StopHook = Arc::new(move || {
                    if !input.is_cancelled() {
                        cancel();
                    }
                });
                (StopCondition::Never, Some(hook))
            };
            stage.set_on_stop(hook);
            if let Err(err) = stage.start(condition) {
                first_error = Some(err);
                cancel_all();
                break;
            }
            started += 1;
        }

        for (s, stage) in self.stages.iter_mut().take(started).enumerate() {
            if let Err(err) = stage.join() {
                first_error.get_or_insert(err);
            }
            if let Some(signal) = signals.get(s) {
                if self.config.auto_stop {
                    signal.wait_drained();
                }
                signal.cancel();
            }
        }
        for adaptor in &self.adaptors {
            adaptor.reset();
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                debug!(stages = self.stages.len(), "pipeline run finished");
                Ok(())
            }
        }
    }

    /// Resize every socket and adaptor slot
    pub fn set_n_frames(&mut self, n_frames: usize) -> CoreResult<()> {
        let was_bound = self.bound;
        self.unbind_adaptors()?;
        self.graph.set_n_frames(n_frames)?;
        for adaptor in &mut self.adaptors {
            adaptor.set_n_frames(n_frames)?;
        }
        if was_bound {
            self.bind_adaptors()?;
        }
        Ok(())
    }

    /// Settings
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stage `index`, present while bound
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&Sequence> {
        self.stages.get(index)
    }

    /// Mutable stage `index`, present while bound
    pub fn stage_mut(&mut self, index: usize) -> Option<&mut Sequence> {
        self.stages.get_mut(index)
    }

    /// Number of stages
    #[must_use]
    pub fn n_stages(&self) -> usize {
        self.specs.len()
    }

    /// Tasks of stage `index`, adaptor tasks included
    #[must_use]
    pub fn stage_tasks(&self, index: usize) -> Option<&IndexSet<TaskId>> {
        self.scopes.get(index)
    }

    /// Adaptor between stages `index` and `index + 1`
    #[must_use]
    pub fn adaptor(&self, index: usize) -> Option<&Adaptor> {
        self.adaptors.get(index)
    }

    /// Push and pull tasks of boundary `index`
    #[must_use]
    pub fn adaptor_tasks(&self, index: usize) -> Option<(TaskId, TaskId)> {
        self.boundaries.get(index).map(|b| (b.push, b.pull))
    }

    /// The task graph, adaptor tasks included
    #[must_use]
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Export every stage as a DOT digraph
    pub fn write_dot<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for stage in &self.stages {
            stage.write_dot(out)?;
        }
        Ok(())
    }
}

impl ZeroCopyRebind for Pipeline {
    fn supports_zero_copy_rebind(&self) -> bool {
        self.config.zero_copy
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("n_stages", &self.specs.len())
            .field("crossings", &self.crossings.len())
            .field("bound", &self.bound)
            .finish()
    }
}
