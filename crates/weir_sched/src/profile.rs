//! Measuring per-task costs on a single-threaded sequence.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use weir_core::TaskId;
use weir_runtime::Sequence;

use crate::error::{ScheduleError, ScheduleResult};

/// Measured cost of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfiledTask {
    /// Task in the profiled graph
    pub task: TaskId,
    /// Task name
    pub name: String,
    /// Average execution time
    pub duration: Duration,
    /// Whether the task can be replicated
    pub replicable: bool,
}

impl ProfiledTask {
    /// Duration in nanoseconds
    #[must_use]
    pub fn nanos(&self) -> f64 {
        self.duration.as_secs_f64() * 1e9
    }
}

/// Run `passes` timed passes and collect the average cost of every task
///
/// Statistics are reset first; the sequence's measurement setting is
/// restored afterwards.
///
/// # Errors
///
/// The sequence must run on one thread and hold no control flow, since
/// per-task costs are ambiguous otherwise.
pub fn profile_sequence(seq: &mut Sequence, passes: u64) -> ScheduleResult<Vec<ProfiledTask>> {
    if seq.n_threads() != 1 {
        return Err(ScheduleError::config(format!(
            "profiling needs a single-threaded sequence, got {} threads",
            seq.n_threads()
        )));
    }
    if seq.is_control_flow() {
        return Err(ScheduleError::config(
            "cannot profile a sequence with commute or select tasks",
        ));
    }
    if passes == 0 {
        return Err(ScheduleError::config("profiling needs at least one pass"));
    }

    let was_enabled = seq.is_stats_enabled();
    seq.reset_stats();
    seq.set_stats(true);
    let run = seq.exec_n(passes);
    seq.set_stats(was_enabled);
    run?;

    let profile: Vec<ProfiledTask> = seq
        .task_reports(0)?
        .into_iter()
        .map(|(task, report)| ProfiledTask {
            task,
            name: report.name,
            duration: report.average,
            replicable: report.replicable,
        })
        .collect();
    info!(
        sequence = seq.name(),
        passes,
        tasks = profile.len(),
        "sequence profiled"
    );
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::builtin::{Controller, Sink, Source, Spin, Switch};
    use weir_core::{SocketRef, TaskGraph};
    use weir_runtime::SequenceSpec;

    #[test]
    fn test_profile_chain() {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, None));
        let spin = graph.add(Spin::task("spin", 1, Duration::from_micros(200), true));
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(SocketRef::new(spin, 0), SocketRef::new(src, 0)).unwrap();
        graph.bind(SocketRef::new(sink, 0), SocketRef::new(spin, 0)).unwrap();

        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        let profile = profile_sequence(&mut seq, 5).unwrap();
        assert_eq!(log.len(), 5);
        let names: Vec<&str> = profile.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["src", "spin", "sink"]);
        assert!(!profile[0].replicable);
        assert!(profile[1].replicable);
        assert!(profile[1].duration >= Duration::from_micros(200));
        assert!(profile[1].nanos() >= 200_000.0);
        assert!(!seq.is_stats_enabled());
    }

    #[test]
    fn test_profile_keeps_stats_setting() {
        let mut graph = TaskGraph::new();
        let src = graph.add(Source::task("src", 1, None));
        let (sink, _) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(SocketRef::new(sink, 0), SocketRef::new(src, 0)).unwrap();

        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
        seq.set_stats(true);
        let profile = profile_sequence(&mut seq, 2).unwrap();
        assert_eq!(profile.len(), 2);
        assert!(seq.is_stats_enabled());

        // the measured calls stay visible to the caller
        seq.exec_n(1).unwrap();
        let reports = seq.task_reports(0).unwrap();
        assert!(reports.iter().all(|(_, r)| r.n_calls == 3));
    }

    #[test]
    fn test_profile_rejects_threads_and_control_flow() {
        let mut graph = TaskGraph::new();
        let spin = graph.add(Spin::task("spin", 1, Duration::ZERO, true));
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![spin]), 2).unwrap();
        assert!(profile_sequence(&mut seq, 1).unwrap_err().is_configuration());
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![spin]), 1).unwrap();
        assert!(profile_sequence(&mut seq, 0).is_err());

        let mut graph = TaskGraph::new();
        let ctrl = graph.add(Controller::task("ctrl", 1, vec![0, 1]).unwrap());
        let commute = graph.add(Switch::commute("commute", 2, 1).unwrap());
        graph.bind(SocketRef::new(commute, 0), SocketRef::new(ctrl, 0)).unwrap();
        graph.bind(SocketRef::new(commute, 1), SocketRef::new(ctrl, 1)).unwrap();
        for path in 0..2 {
            let (sink, _) = Sink::task(format!("sink{path}"), 1);
            let sink = graph.add(sink);
            graph
                .bind(SocketRef::new(sink, 0), SocketRef::new(commute, 2 + path))
                .unwrap();
        }
        let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![ctrl]), 1).unwrap();
        assert!(seq.is_control_flow());
        assert!(profile_sequence(&mut seq, 1).unwrap_err().is_configuration());
    }
}
