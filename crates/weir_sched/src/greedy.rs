//! Greedy replication: one stage per task.

use std::num::NonZeroUsize;
use tracing::info;

use crate::error::{ScheduleError, ScheduleResult};
use crate::scheduler::{Scheduler, SchedulerState};
use crate::solution::StagePlan;

/// Gives every replicable task its own stage with `ceiling` replicas
#[derive(Debug, Clone)]
pub struct GreedyScheduler {
    state: SchedulerState,
    ceiling: usize,
}

impl Default for GreedyScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl GreedyScheduler {
    /// Ceiling set to the available hardware concurrency
    #[must_use]
    pub fn new() -> Self {
        let ceiling = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self::with_ceiling(ceiling)
    }

    /// Explicit replica ceiling per stage
    #[must_use]
    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            state: SchedulerState::default(),
            ceiling,
        }
    }

    /// Replicas given to each replicable task
    #[must_use]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }
}

impl Scheduler for GreedyScheduler {
    fn state(&self) -> &SchedulerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SchedulerState {
        &mut self.state
    }

    fn schedule(&mut self) -> ScheduleResult<()> {
        if self.ceiling == 0 {
            return Err(ScheduleError::config("the replica ceiling must be at least 1"));
        }
        let solution: Vec<StagePlan> = self
            .state
            .require_profile()?
            .iter()
            .map(|task| StagePlan::new(1, if task.replicable { self.ceiling } else { 1 }))
            .collect();
        info!(stages = solution.len(), ceiling = self.ceiling, "greedy schedule");
        self.state.set_solution(solution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfiledTask;
    use crate::solution::total_replicas;
    use std::time::Duration;
    use weir_core::TaskId;

    fn chain(replicable: &[bool]) -> Vec<ProfiledTask> {
        replicable
            .iter()
            .enumerate()
            .map(|(i, &replicable)| ProfiledTask {
                task: TaskId::from_raw(i as u32),
                name: format!("t{i}"),
                duration: Duration::from_nanos(10),
                replicable,
            })
            .collect()
    }

    #[test]
    fn test_one_stage_per_task() {
        let mut gr = GreedyScheduler::with_ceiling(3);
        gr.load_profile(chain(&[false, true, true, false])).unwrap();
        gr.schedule().unwrap();
        let solution = gr.solution().unwrap();
        assert_eq!(solution.len(), 4);
        assert!(solution.iter().all(|s| s.n_tasks == 1));
        assert_eq!(
            solution.iter().map(|s| s.n_replicas).collect::<Vec<_>>(),
            vec![1, 3, 3, 1]
        );
        assert_eq!(total_replicas(solution), 8);
    }

    #[test]
    fn test_errors() {
        let mut gr = GreedyScheduler::with_ceiling(2);
        assert!(gr.schedule().unwrap_err().is_configuration());
        assert!(gr.load_profile(Vec::new()).is_err());

        let mut zero = GreedyScheduler::with_ceiling(0);
        zero.load_profile(chain(&[true])).unwrap();
        assert!(zero.schedule().unwrap_err().is_configuration());
    }

    #[test]
    fn test_reset_forgets_profile() {
        let mut gr = GreedyScheduler::default();
        assert!(gr.ceiling() >= 1);
        gr.load_profile(chain(&[true])).unwrap();
        gr.schedule().unwrap();
        gr.reset();
        assert!(gr.solution().is_none());
        assert!(gr.state().profile().is_none());
    }
}
