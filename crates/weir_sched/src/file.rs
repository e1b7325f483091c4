//! Schedules read from a JSON document.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use weir_runtime::{SyncConfig, WaitingMode};

use crate::error::{ScheduleError, ScheduleResult};
use crate::scheduler::{Scheduler, SchedulerState};
use crate::solution::StagePlan;

/// One stage record of a schedule file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Replicas of the stage
    pub cores: usize,
    /// Consecutive tasks in the stage
    pub tasks: usize,
    /// Buffer size of the outgoing adaptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_buff_size: Option<usize>,
    /// Waiting mode of the outgoing adaptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_waiting_type: Option<WaitingMode>,
}

impl StageRecord {
    fn plan(&self) -> StagePlan {
        let sync = (self.sync_buff_size.is_some() || self.sync_waiting_type.is_some()).then(|| {
            SyncConfig {
                buffer_size: self.sync_buff_size.unwrap_or(1),
                waiting: self.sync_waiting_type.unwrap_or_default(),
            }
        });
        StagePlan {
            n_tasks: self.tasks,
            n_replicas: self.cores,
            sync,
        }
    }
}

/// A complete schedule file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleFile {
    /// Stages in chain order
    pub schedule: Vec<StageRecord>,
}

impl ScheduleFile {
    /// Document describing a computed solution
    #[must_use]
    pub fn from_solution(solution: &[StagePlan]) -> Self {
        let schedule = solution
            .iter()
            .map(|plan| StageRecord {
                cores: plan.n_replicas,
                tasks: plan.n_tasks,
                sync_buff_size: plan.sync.map(|s| s.buffer_size),
                sync_waiting_type: plan.sync.map(|s| s.waiting),
            })
            .collect();
        Self { schedule }
    }

    /// Parse a schedule document
    pub fn from_str(json: &str) -> ScheduleResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a schedule file
    pub fn from_path(path: impl AsRef<Path>) -> ScheduleResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_str(&json)
    }
}

/// Applies a fixed, externally written schedule to the profiled chain
#[derive(Debug, Clone)]
pub struct FileScheduler {
    state: SchedulerState,
    file: ScheduleFile,
}

impl FileScheduler {
    /// Scheduler over a parsed document
    #[must_use]
    pub fn new(file: ScheduleFile) -> Self {
        Self {
            state: SchedulerState::default(),
            file,
        }
    }

    /// Scheduler over a JSON string
    pub fn from_str(json: &str) -> ScheduleResult<Self> {
        ScheduleFile::from_str(json).map(Self::new)
    }

    /// Scheduler over a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> ScheduleResult<Self> {
        ScheduleFile::from_path(path).map(Self::new)
    }

    /// The loaded document
    #[must_use]
    pub const fn file(&self) -> &ScheduleFile {
        &self.file
    }
}

impl Scheduler for FileScheduler {
    fn state(&self) -> &SchedulerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SchedulerState {
        &mut self.state
    }

    fn schedule(&mut self) -> ScheduleResult<()> {
        let n_tasks = self.state.require_profile()?.len();
        if self.file.schedule.is_empty() {
            return Err(ScheduleError::config("the schedule file lists no stage"));
        }
        if let Some(i) = self
            .file
            .schedule
            .iter()
            .position(|r| r.cores == 0 || r.tasks == 0)
        {
            return Err(ScheduleError::config(format!(
                "stage {i} of the schedule file needs at least one core and one task"
            )));
        }
        let listed: usize = self.file.schedule.iter().map(|r| r.tasks).sum();
        if listed != n_tasks {
            return Err(ScheduleError::config(format!(
                "the schedule file lists {listed} tasks, the profile has {n_tasks}"
            )));
        }
        let solution: Vec<StagePlan> = self.file.schedule.iter().map(StageRecord::plan).collect();
        info!(stages = solution.len(), "schedule loaded from file");
        self.state.set_solution(solution)
    }
}
