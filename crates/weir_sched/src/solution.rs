//! Stage plans and the quantities derived from them.

use serde::{Deserialize, Serialize};
use weir_runtime::SyncConfig;

use crate::error::{ScheduleError, ScheduleResult};
use crate::profile::ProfiledTask;

/// One stage of a solution: the next `n_tasks` profiled tasks on `n_replicas` threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    /// Consecutive tasks in the stage
    pub n_tasks: usize,
    /// Replicas running the stage
    pub n_replicas: usize,
    /// Adaptor settings of the outgoing boundary
    pub sync: Option<SyncConfig>,
}

impl StagePlan {
    /// Stage without adaptor override
    #[must_use]
    pub const fn new(n_tasks: usize, n_replicas: usize) -> Self {
        Self {
            n_tasks,
            n_replicas,
            sync: None,
        }
    }
}

/// Time per cycle of a stage, infinite without replicas
#[must_use]
pub fn weight(total_nanos: f64, n_replicas: usize) -> f64 {
    if n_replicas == 0 {
        return f64::INFINITY;
    }
    total_nanos / n_replicas as f64
}

/// Slice `profile` into the stages of `solution`
///
/// # Errors
///
/// Fails when the task counts of the solution do not add up to the profile.
pub fn stages<'a>(
    profile: &'a [ProfiledTask],
    solution: &[StagePlan],
) -> ScheduleResult<Vec<&'a [ProfiledTask]>> {
    let covered: usize = solution.iter().map(|s| s.n_tasks).sum();
    if covered != profile.len() {
        return Err(ScheduleError::config(format!(
            "solution covers {covered} tasks, the profile has {}",
            profile.len()
        )));
    }
    let mut rest = profile;
    let mut slices = Vec::with_capacity(solution.len());
    for stage in solution {
        let (head, tail) = rest.split_at(stage.n_tasks);
        slices.push(head);
        rest = tail;
    }
    Ok(slices)
}

/// Largest stage weight in nanoseconds
pub fn period(profile: &[ProfiledTask], solution: &[StagePlan]) -> ScheduleResult<f64> {
    let slices = stages(profile, solution)?;
    Ok(slices
        .iter()
        .zip(solution)
        .map(|(tasks, plan)| weight(tasks.iter().map(ProfiledTask::nanos).sum(), plan.n_replicas))
        .fold(0.0, f64::max))
}

/// Threads used by a solution
#[must_use]
pub fn total_replicas(solution: &[StagePlan]) -> usize {
    solution.iter().map(|s| s.n_replicas).sum()
}

/// Consecutive abstract processing-unit ids for every stage replica
#[must_use]
pub fn pinning_map(solution: &[StagePlan]) -> Vec<Vec<usize>> {
    let mut next = 0;
    solution
        .iter()
        .map(|stage| {
            let units: Vec<usize> = (next..next + stage.n_replicas).collect();
            next += stage.n_replicas;
            units
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weir_core::TaskId;

    fn profile(micros: &[u64]) -> Vec<ProfiledTask> {
        micros
            .iter()
            .enumerate()
            .map(|(i, &us)| ProfiledTask {
                task: TaskId::from_raw(i as u32),
                name: format!("t{i}"),
                duration: Duration::from_micros(us),
                replicable: true,
            })
            .collect()
    }

    #[test]
    fn test_weight() {
        assert_eq!(weight(100.0, 4), 25.0);
        assert!(weight(1.0, 0).is_infinite());
    }

    #[test]
    fn test_period_and_stages() {
        let profile = profile(&[10, 20, 30]);
        let solution = vec![StagePlan::new(2, 1), StagePlan::new(1, 3)];
        let slices = stages(&profile, &solution).unwrap();
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices[1][0].name, "t2");
        assert!((period(&profile, &solution).unwrap() - 30_000.0).abs() < 1e-6);
        assert_eq!(total_replicas(&solution), 4);

        let short = vec![StagePlan::new(2, 1)];
        assert!(period(&profile, &short).unwrap_err().is_configuration());
    }

    #[test]
    fn test_pinning_map() {
        let solution = vec![StagePlan::new(1, 1), StagePlan::new(3, 2), StagePlan::new(1, 3)];
        assert_eq!(pinning_map(&solution), vec![vec![0], vec![1, 2], vec![3, 4, 5]]);
    }
}
