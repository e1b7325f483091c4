//! Period-optimal packing of a chain under a replica budget.
//!
//! The scheduler binary-searches the period `P`. For a candidate `P`, a
//! probe walks the chain once and packs consecutive tasks into stages:
//!
//! - tasks are packed at one replica while their summed cost stays within `P`
//! - if that packing holds only replicable tasks, the stage is extended over
//!   the whole replicable run and given `ceil(sum / P)` replicas
//! - the stage is shrunk to `r - 1` replicas when the remainder of the run
//!   fits, together with the next sequential task, in one single-replica stage
//!
//! The probe is feasible when the replica total stays within the budget.

use tracing::{debug, info};

use crate::error::{ScheduleError, ScheduleResult};
use crate::profile::ProfiledTask;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::solution::{StagePlan, weight};

const MAX_SEARCH_STEPS: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Cost {
    nanos: f64,
    replicable: bool,
}

#[derive(Debug, Clone)]
struct Packing {
    stages: Vec<StagePlan>,
    period: f64,
}

fn replicas_for(sum: f64, period: f64) -> usize {
    if sum <= period {
        1
    } else if period <= 0.0 {
        usize::MAX
    } else {
        (sum / period).ceil() as usize
    }
}

/// First index past the cheaper `r - 1` packing of `[start, run_end)`, if it pays off
fn shrink(chain: &[Cost], start: usize, run_end: usize, replicas: usize, period: f64) -> Option<usize> {
    if replicas < 2 || run_end >= chain.len() {
        return None;
    }
    let budget = (replicas - 1) as f64 * period;
    let mut cut = start;
    let mut sum = 0.0;
    while cut < run_end && sum + chain[cut].nanos <= budget {
        sum += chain[cut].nanos;
        cut += 1;
    }
    if cut == start {
        return None;
    }
    let leftover: f64 = chain[cut..=run_end].iter().map(|c| c.nanos).sum();
    (leftover <= period).then_some(cut)
}

fn probe(chain: &[Cost], resources: usize, period: f64) -> Option<Packing> {
    let n = chain.len();
    let mut stages = Vec::new();
    let mut used = 0usize;
    let mut achieved = 0.0f64;
    let mut start = 0;

    while start < n {
        let mut end = start;
        let mut sum = 0.0;
        while end < n && sum + chain[end].nanos <= period {
            sum += chain[end].nanos;
            end += 1;
        }

        let packed_replicable = chain[start..end].iter().all(|c| c.replicable);
        let (stop, replicas) = if end < n && packed_replicable {
            if end == start && !chain[start].replicable {
                return None;
            }
            let mut run_end = end;
            while run_end < n && chain[run_end].replicable {
                run_end += 1;
            }
            let run_sum: f64 = chain[start..run_end].iter().map(|c| c.nanos).sum();
            let replicas = replicas_for(run_sum, period);
            match shrink(chain, start, run_end, replicas, period) {
                Some(cut) => (cut, replicas - 1),
                None => (run_end, replicas),
            }
        } else {
            (end, 1)
        };

        let stage_sum: f64 = chain[start..stop].iter().map(|c| c.nanos).sum();
        achieved = achieved.max(weight(stage_sum, replicas));
        used = used.saturating_add(replicas);
        if used > resources {
            return None;
        }
        stages.push(StagePlan::new(stop - start, replicas));
        start = stop;
    }

    Some(Packing {
        stages,
        period: achieved,
    })
}

fn solve(chain: &[Cost], resources: usize) -> ScheduleResult<Packing> {
    if resources == 0 {
        return Err(ScheduleError::config("the resource budget must be at least 1"));
    }
    if chain.is_empty() {
        return Err(ScheduleError::config("the profiled chain is empty"));
    }
    let total: f64 = chain.iter().map(|c| c.nanos).sum();
    if resources == 1 {
        return Ok(Packing {
            stages: vec![StagePlan::new(chain.len(), 1)],
            period: total,
        });
    }

    let slowest = chain.iter().map(|c| c.nanos).fold(0.0, f64::max);
    let slowest_sequential = chain
        .iter()
        .filter(|c| !c.replicable)
        .map(|c| c.nanos)
        .fold(0.0, f64::max);
    let mut lb = (total / resources as f64).max(slowest_sequential);
    let mut ub = lb + slowest;

    let mut best = match probe(chain, resources, ub) {
        Some(packing) => packing,
        None => probe(chain, resources, ub.max(total)).ok_or_else(|| {
            ScheduleError::Core(weir_core::CoreError::invariant(
                "a single-replica packing of the whole chain was rejected",
            ))
        })?,
    };
    ub = best.period;

    if let Some(packing) = probe(chain, resources, lb) {
        return Ok(packing);
    }

    let width = 1.0 / resources as f64;
    let mut steps = 0;
    while ub - lb > width && steps < MAX_SEARCH_STEPS {
        let mid = (lb + ub) / 2.0;
        match probe(chain, resources, mid) {
            Some(packing) => {
                ub = packing.period.min(mid);
                best = packing;
            }
            None => lb = mid,
        }
        steps += 1;
    }
    debug!(steps, lb, ub, "period search converged");
    Ok(best)
}

/// Minimises the period of the chain with at most `resources` replicas in total
#[derive(Debug, Clone)]
pub struct OtacScheduler {
    state: SchedulerState,
    resources: usize,
    period: Option<f64>,
}

impl OtacScheduler {
    /// Scheduler with a total replica budget
    #[must_use]
    pub fn new(resources: usize) -> Self {
        Self {
            state: SchedulerState::default(),
            resources,
            period: None,
        }
    }

    /// Replica budget
    #[must_use]
    pub const fn resources(&self) -> usize {
        self.resources
    }

    /// Period reached by the last schedule, in nanoseconds
    #[must_use]
    pub const fn period(&self) -> Option<f64> {
        self.period
    }
}

impl Scheduler for OtacScheduler {
    fn state(&self) -> &SchedulerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SchedulerState {
        &mut self.state
    }

    fn schedule(&mut self) -> ScheduleResult<()> {
        if self.resources == 0 {
            return Err(ScheduleError::config("the resource budget must be at least 1"));
        }
        let chain: Vec<Cost> = self
            .state
            .require_profile()?
            .iter()
            .map(|task: &ProfiledTask| Cost {
                nanos: task.nanos(),
                replicable: task.replicable,
            })
            .collect();
        let packing = solve(&chain, self.resources)?;
        info!(
            stages = packing.stages.len(),
            resources = self.resources,
            period_ns = packing.period,
            "otac schedule"
        );
        self.state.set_solution(packing.stages)?;
        self.period = Some(packing.period);
        Ok(())
    }

    fn reset(&mut self) {
        self.state.clear();
        self.period = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::greedy::GreedyScheduler;
    use crate::solution::{period, stages, total_replicas};
    use proptest::prelude::*;
    use std::time::Duration;
    use weir_core::TaskId;

    fn chain(costs: &[(u64, bool)]) -> Vec<ProfiledTask> {
        costs
            .iter()
            .enumerate()
            .map(|(i, &(nanos, replicable))| ProfiledTask {
                task: TaskId::from_raw(i as u32),
                name: format!("t{i}"),
                duration: Duration::from_nanos(nanos),
                replicable,
            })
            .collect()
    }

    fn scheduled(costs: &[(u64, bool)], resources: usize) -> OtacScheduler {
        let mut otac = OtacScheduler::new(resources);
        otac.load_profile(chain(costs)).unwrap();
        otac.schedule().unwrap();
        otac
    }

    #[test]
    fn test_single_resource_is_one_stage() {
        let otac = scheduled(&[(10, true), (30, false), (20, true)], 1);
        assert_eq!(otac.solution().unwrap(), &[StagePlan::new(3, 1)]);
        assert!((otac.period().unwrap() - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_chain_reaches_task_cost() {
        let otac = scheduled(&[(10, true); 5], 5);
        let solution = otac.solution().unwrap();
        assert_eq!(solution.len(), 1);
        assert_eq!((solution[0].n_tasks, solution[0].n_replicas), (5, 5));
        assert!((otac.period().unwrap() - 10.0).abs() < 0.5);
    }

    #[test]
    fn test_sequential_task_stays_isolated() {
        let costs = [(100, true), (10, false), (100, true)];
        let otac = scheduled(&costs, 4);
        let solution = otac.solution().unwrap();
        assert!(total_replicas(solution) <= 4);
        assert!((otac.period().unwrap() - 100.0).abs() < 0.5);

        let profile = chain(&costs);
        let slices = stages(&profile, solution).unwrap();
        let (middle, plan) = slices
            .iter()
            .zip(solution)
            .find(|(tasks, _)| tasks.iter().any(|t| t.name == "t1"))
            .unwrap();
        assert_eq!(middle.len(), 1);
        assert_eq!(plan.n_replicas, 1);

        let mut gr = GreedyScheduler::with_ceiling(1);
        gr.load_profile(profile.clone()).unwrap();
        gr.schedule().unwrap();
        let gr_period = period(&profile, gr.solution().unwrap()).unwrap();
        assert!(otac.period().unwrap() <= gr_period + 1e-6);
    }

    #[test]
    fn test_replicates_heavy_stage() {
        let otac = scheduled(&[(10, false), (400, true), (10, false)], 6);
        let solution = otac.solution().unwrap();
        assert_eq!(solution.len(), 3);
        assert_eq!(solution[1].n_replicas, 4);
        assert!((otac.period().unwrap() - 100.0).abs() < 0.5);
    }

    #[test]
    fn test_shrunk_packing_saves_a_replica() {
        // [60, 30] needs 2 replicas at P = 60 unless the 30 joins the
        // sequential tail.
        let packing = probe(
            &[
                Cost { nanos: 60.0, replicable: true },
                Cost { nanos: 30.0, replicable: true },
                Cost { nanos: 30.0, replicable: false },
            ],
            8,
            60.0,
        )
        .unwrap();
        assert_eq!(packing.stages, vec![StagePlan::new(1, 1), StagePlan::new(2, 1)]);
        assert!((packing.period - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_probe_rejects_slow_sequential_task() {
        let chain = [
            Cost { nanos: 10.0, replicable: true },
            Cost { nanos: 50.0, replicable: false },
        ];
        assert!(probe(&chain, 16, 40.0).is_none());
        assert!(probe(&chain, 16, 50.0).is_some());
    }

    #[test]
    fn test_errors() {
        let mut otac = OtacScheduler::new(4);
        assert!(otac.schedule().unwrap_err().is_configuration());

        let mut none = OtacScheduler::new(0);
        none.load_profile(chain(&[(10, true)])).unwrap();
        assert!(none.schedule().unwrap_err().is_configuration());
        assert_eq!(none.resources(), 0);
    }

    #[test]
    fn test_reset_clears_period() {
        let mut otac = scheduled(&[(10, true), (10, true)], 2);
        assert!(otac.period().is_some());
        otac.reset();
        assert!(otac.period().is_none());
        assert!(otac.solution().is_none());
        assert!(otac.state().profile().is_none());
    }

    fn costs_strategy() -> impl Strategy<Value = Vec<(u64, bool)>> {
        prop::collection::vec((prop::sample::select(vec![10u64, 20, 20, 50, 200]), any::<bool>()), 1..12)
    }

    proptest! {
        #[test]
        fn prop_solution_respects_budget(costs in costs_strategy(), resources in 1usize..16) {
            let otac = scheduled(&costs, resources);
            let solution = otac.solution().unwrap();
            prop_assert!(total_replicas(solution) <= resources);
            prop_assert!(solution.iter().all(|s| s.n_tasks > 0 && s.n_replicas > 0));
        }

        #[test]
        fn prop_partition_preserves_order(costs in costs_strategy(), resources in 1usize..16) {
            let otac = scheduled(&costs, resources);
            let profile = chain(&costs);
            let slices = stages(&profile, otac.solution().unwrap()).unwrap();
            let names: Vec<&str> = slices.iter().flat_map(|s| s.iter()).map(|t| t.name.as_str()).collect();
            let expected: Vec<&str> = profile.iter().map(|t| t.name.as_str()).collect();
            prop_assert_eq!(names, expected);
        }

        #[test]
        fn prop_sequential_tasks_run_alone(costs in costs_strategy(), resources in 1usize..16) {
            let otac = scheduled(&costs, resources);
            let profile = chain(&costs);
            let solution = otac.solution().unwrap();
            for (tasks, plan) in stages(&profile, solution).unwrap().iter().zip(solution) {
                if tasks.iter().any(|t| !t.replicable) {
                    prop_assert_eq!(plan.n_replicas, 1);
                }
            }
        }

        #[test]
        fn prop_period_bounds_every_stage(costs in costs_strategy(), resources in 1usize..16) {
            let otac = scheduled(&costs, resources);
            let profile = chain(&costs);
            let measured = period(&profile, otac.solution().unwrap()).unwrap();
            prop_assert!((measured - otac.period().unwrap()).abs() < 1e-6);

            let total: f64 = profile.iter().map(ProfiledTask::nanos).sum();
            prop_assert!(measured + 1e-6 >= total / resources as f64);
        }
    }
}
