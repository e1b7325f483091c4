//! The scheduler contract shared by every partitioning strategy.

use tracing::info;
use weir_core::TaskGraph;
use weir_runtime::{Pipeline, PipelineConfig, Sequence, StageSpec};

use crate::error::{ScheduleError, ScheduleResult};
use crate::profile::{ProfiledTask, profile_sequence};
use crate::solution::{StagePlan, pinning_map, stages, total_replicas};

/// Passes timed by [`Scheduler::profile`] when no count is given
pub const DEFAULT_PROFILING_PASSES: u64 = 16;

/// Profile and solution shared by every scheduler
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    profile: Option<Vec<ProfiledTask>>,
    solution: Option<Vec<StagePlan>>,
}

impl SchedulerState {
    /// Measured chain
    #[must_use]
    pub fn profile(&self) -> Option<&[ProfiledTask]> {
        self.profile.as_deref()
    }

    /// Measured chain, or a configuration error before profiling
    pub fn require_profile(&self) -> ScheduleResult<&[ProfiledTask]> {
        match self.profile.as_deref() {
            None => Err(ScheduleError::config("schedule requested before profiling")),
            Some([]) => Err(ScheduleError::config("the profiled chain is empty")),
            Some(profile) => Ok(profile),
        }
    }

    /// Computed stages
    #[must_use]
    pub fn solution(&self) -> Option<&[StagePlan]> {
        self.solution.as_deref()
    }

    /// Store a solution after checking that it covers the profile
    pub fn set_solution(&mut self, solution: Vec<StagePlan>) -> ScheduleResult<()> {
        let profile = self.require_profile()?;
        stages(profile, &solution)?;
        if solution.iter().any(|s| s.n_replicas == 0 || s.n_tasks == 0) {
            return Err(ScheduleError::config(
                "every stage needs at least one task and one replica",
            ));
        }
        self.solution = Some(solution);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.profile = None;
        self.solution = None;
    }
}

/// A strategy slicing a profiled chain into pipeline stages
pub trait Scheduler {
    /// Shared profile and solution
    fn state(&self) -> &SchedulerState;

    /// Mutable shared state
    fn state_mut(&mut self) -> &mut SchedulerState;

    /// Compute the solution from the stored profile
    ///
    /// # Errors
    ///
    /// Configuration errors before profiling, for an empty chain or an
    /// invalid resource budget.
    fn schedule(&mut self) -> ScheduleResult<()>;

    /// Time `passes` passes of `seq` and store the measured chain
    fn profile(&mut self, seq: &mut Sequence, passes: u64) -> ScheduleResult<&[ProfiledTask]> {
        let profile = profile_sequence(seq, passes)?;
        self.load_profile(profile)?;
        self.state().require_profile()
    }

    /// Store a chain measured elsewhere; drops any previous solution
    fn load_profile(&mut self, profile: Vec<ProfiledTask>) -> ScheduleResult<()> {
        if profile.is_empty() {
            return Err(ScheduleError::config("the profiled chain is empty"));
        }
        let state = self.state_mut();
        state.profile = Some(profile);
        state.solution = None;
        Ok(())
    }

    /// Forget the profile and the solution
    fn reset(&mut self) {
        self.state_mut().clear();
    }

    /// Stages computed by the last [`Scheduler::schedule`]
    fn solution(&self) -> Option<&[StagePlan]> {
        self.state().solution()
    }

    /// Profile `seq` and schedule if needed, then build the pipeline over `graph`
    ///
    /// `seq` must be a single-threaded sequence over `graph`.
    fn generate_pipeline(
        &mut self,
        graph: TaskGraph,
        seq: &mut Sequence,
        config: PipelineConfig,
    ) -> ScheduleResult<Pipeline> {
        if self.state().profile().is_none() {
            self.profile(seq, DEFAULT_PROFILING_PASSES)?;
        }
        if self.solution().is_none() {
            self.schedule()?;
        }
        let profile = self.state().require_profile()?;
        let solution = self
            .solution()
            .ok_or_else(|| ScheduleError::config("scheduler produced no solution"))?;

        let pinning = pinning_map(solution);
        let specs: Vec<StageSpec> = stages(profile, solution)?
            .into_iter()
            .zip(solution)
            .zip(pinning)
            .map(|((tasks, plan), units)| {
                let spec = StageSpec::tasks(tasks.iter().map(|t| t.task).collect(), plan.n_replicas)
                    .with_pinning(units);
                match plan.sync {
                    Some(sync) => spec.with_sync(sync),
                    None => spec,
                }
            })
            .collect();
        info!(
            stages = specs.len(),
            replicas = total_replicas(solution),
            "instantiating pipeline"
        );
        Ok(Pipeline::new(graph, specs, config)?)
    }
}
