//! Weir Sched - Partitioning task chains into pipeline stages
//!
//! This crate turns a profiled sequence into a pipeline:
//! - Profiling: average cost of every task on a single thread
//! - Greedy replication (GR): one stage per task, a baseline
//! - OTAC: minimal period under a total replica budget
//! - File schedules: stages written by hand in JSON

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod file;
pub mod greedy;
pub mod otac;
pub mod profile;
pub mod scheduler;
pub mod solution;

pub use error::{ScheduleError, ScheduleResult};
pub use file::{FileScheduler, ScheduleFile, StageRecord};
pub use greedy::GreedyScheduler;
pub use otac::OtacScheduler;
pub use profile::{ProfiledTask, profile_sequence};
pub use scheduler::{DEFAULT_PROFILING_PASSES, Scheduler, SchedulerState};
pub use solution::{StagePlan, period, pinning_map, stages, total_replicas, weight};
