//! Weir Runtime - Executing task graphs on threads and pipelines
//!
//! This crate drives the tasks of `weir_core`:
//! - Sequences: task graphs compiled into sub-sequence trees, replicated per thread
//! - A stepping state machine with commute/select control flow
//! - Persistent thread pools with a startup barrier
//! - Adaptors: bounded multi-lane ring buffers with cooperative cancellation
//! - Pipelines: stages connected by adaptors, with reversible binding

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adaptor;
pub mod adaptor_task;
pub mod pipeline;
pub mod pool;
pub mod sequence;
pub mod stop;
pub mod subsequence;

pub use adaptor::{
    Adaptor, AdaptorConfig, AdaptorSignal, Puller, Pusher, WaitingMode, ZeroCopyRebind,
};
pub use adaptor_task::{StreamLayout, pull_task, push_task};
pub use pipeline::{Pipeline, PipelineConfig, StageBounds, StageSpec, SyncConfig};
pub use pool::ThreadPool;
pub use sequence::{Sequence, SequenceSpec, StepOutcome, StopHook};
pub use stop::StopCondition;
pub use subsequence::{Process, SubSequence};
