//! Synthetic chains: a frame counter, spinning stages, then a sink.

use color_eyre::Result;
use color_eyre::eyre::bail;
use std::time::Duration;
use weir_core::builtin::{Sink, SinkLog, Source, Spin};
use weir_core::{SocketRef, TaskGraph, TaskId};
use weir_runtime::{Sequence, SequenceSpec};

/// A built chain and the handles needed to drive it
pub struct Chain {
    pub graph: TaskGraph,
    pub source: TaskId,
    /// Frames seen by the sink
    pub log: SinkLog,
}

impl Chain {
    /// `source -> spin_0 -> ... -> spin_n -> sink`
    ///
    /// `durations` are in microseconds; the spins listed in `sequential`
    /// refuse replication. The source stops after `limit` frames.
    pub fn build(durations: &[u64], sequential: &[usize], limit: u64) -> Result<Self> {
        if let Some(&bad) = sequential.iter().find(|&&i| i >= durations.len()) {
            bail!(
                "sequential index {bad} is out of range for {} stages",
                durations.len()
            );
        }

        let mut graph = TaskGraph::new();
        let source = graph.add(Source::task("source", 1, Some(limit)));
        let mut tail = source;
        for (i, &us) in durations.iter().enumerate() {
            let spin = graph.add(Spin::task(
                format!("spin_{i}"),
                1,
                Duration::from_micros(us),
                !sequential.contains(&i),
            ));
            graph.bind(SocketRef::new(spin, 0), SocketRef::new(tail, 0))?;
            tail = spin;
        }
        let (sink, log) = Sink::task("sink", 1);
        let sink = graph.add(sink);
        graph.bind(SocketRef::new(sink, 0), SocketRef::new(tail, 0))?;

        Ok(Self { graph, source, log })
    }

    /// Single-threaded sequence over the whole chain
    pub fn sequence(&self) -> Result<Sequence> {
        Ok(Sequence::new(
            &self.graph,
            &SequenceSpec::new(vec![self.source]),
            1,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_shape() {
        let chain = Chain::build(&[10, 20], &[1], 3).unwrap();
        let mut seq = chain.sequence().unwrap();
        assert_eq!(seq.n_tasks(), 4);
        seq.exec_n(3).unwrap();
        assert_eq!(chain.log.values(), vec![0, 1, 2]);
        assert!(!chain.graph.task(TaskId::from_raw(2)).unwrap().is_replicable());
    }

    #[test]
    fn test_bad_sequential_index() {
        assert!(Chain::build(&[10], &[1], 3).is_err());
        assert!(Chain::build(&[], &[], 3).is_ok());
    }
}
