//! Scheduling measured and synthetic chains, then running the pipelines.

use std::time::Duration;
use weir_core::builtin::{Sink, SinkLog, Source, Spin};
use weir_core::{SocketRef, TaskGraph, TaskId};
use weir_runtime::{PipelineConfig, Sequence, SequenceSpec, StopCondition, WaitingMode};
use weir_sched::{
    FileScheduler, GreedyScheduler, OtacScheduler, ProfiledTask, Scheduler, period,
    total_replicas,
};

fn synthetic(costs: &[(u64, bool)]) -> Vec<ProfiledTask> {
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

/// src -> spin -> spin -> sink, the source stopping after `limit` frames
fn chain(limit: u64) -> (TaskGraph, TaskId, SinkLog) {
    let mut graph = TaskGraph::new();
    let src = graph.add(Source::task("src", 1, Some(limit)));
    let a = graph.add(Spin::task("spin_a", 1, Duration::from_micros(150), true));
    let b = graph.add(Spin::task("spin_b", 1, Duration::from_micros(150), true));
    let (sink, log) = Sink::task("sink", 1);
    let sink = graph.add(sink);
    graph.bind(SocketRef::new(a, 0), SocketRef::new(src, 0)).unwrap();
    graph.bind(SocketRef::new(b, 0), SocketRef::new(a, 0)).unwrap();
    graph.bind(SocketRef::new(sink, 0), SocketRef::new(b, 0)).unwrap();
    (graph, src, log)
}

fn run_scheduled(scheduler: &mut dyn Scheduler, limit: u64) -> (Vec<u32>, usize) {
    let (graph, src, log) = chain(limit);
    let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
    let mut pipeline = scheduler
        .generate_pipeline(graph, &mut seq, PipelineConfig::default().with_buffer_size(2))
        .unwrap();
    let n_stages = pipeline.n_stages();
    pipeline.exec(StopCondition::Never).unwrap();
    let mut values = log.values();
    values.sort_unstable();
    (values, n_stages)
}

#[test]
fn test_uniform_chain() {
    let profile = synthetic(&[(10, true); 5]);
    let mut otac = OtacScheduler::new(5);
    otac.load_profile(profile.clone()).unwrap();
    otac.schedule().unwrap();
    assert!((otac.period().unwrap() - 10.0).abs() < 0.5);
    // one stage of five replicas: same period and budget as five single-replica stages
    let shape: Vec<(usize, usize)> = otac
        .solution()
        .unwrap()
        .iter()
        .map(|s| (s.n_tasks, s.n_replicas))
        .collect();
    assert_eq!(shape, vec![(5, 5)]);

    let mut gr = GreedyScheduler::with_ceiling(1);
    gr.load_profile(profile.clone()).unwrap();
    gr.schedule().unwrap();
    let gr_solution = gr.solution().unwrap();
    assert_eq!(gr_solution.len(), 5);
    assert!(gr_solution.iter().all(|s| s.n_tasks == 1 && s.n_replicas == 1));
    let gr_period = period(&profile, gr_solution).unwrap();
    assert!((gr_period - 10.0).abs() < 1e-6);
}

#[test]
fn test_sequential_middle_task() {
    let profile = synthetic(&[(100, true), (10, false), (100, true)]);
    let mut otac = OtacScheduler::new(4);
    otac.load_profile(profile.clone()).unwrap();
    otac.schedule().unwrap();
    let solution = otac.solution().unwrap();
    assert!(total_replicas(solution) <= 4);
    assert!(solution.iter().any(|s| s.n_tasks == 1 && s.n_replicas == 1));

    // GR at the same total budget: ceiling 1 uses three replicas
    let mut gr = GreedyScheduler::with_ceiling(1);
    gr.load_profile(profile.clone()).unwrap();
    gr.schedule().unwrap();
    let gr_period = period(&profile, gr.solution().unwrap()).unwrap();
    assert!(otac.period().unwrap() <= gr_period + 1e-6);
}

#[test]
fn test_otac_beats_greedy_at_equal_budget() {
    let profile = synthetic(&[(5, false), (80, true), (80, true), (40, true), (5, false)]);
    let mut otac = OtacScheduler::new(7);
    otac.load_profile(profile.clone()).unwrap();
    otac.schedule().unwrap();

    // ceiling 1 keeps GR within five replicas
    let mut gr = GreedyScheduler::with_ceiling(1);
    gr.load_profile(profile.clone()).unwrap();
    gr.schedule().unwrap();
    let gr_period = period(&profile, gr.solution().unwrap()).unwrap();
    assert!(otac.period().unwrap() < gr_period);
    assert!(total_replicas(otac.solution().unwrap()) <= 7);
}

#[test]
fn test_otac_generated_pipeline() {
    let mut otac = OtacScheduler::new(4);
    let (values, n_stages) = run_scheduled(&mut otac, 40);
    assert_eq!(values, (0..40).collect::<Vec<u32>>());
    let solution = otac.solution().unwrap();
    assert_eq!(n_stages, solution.len());
    assert!(total_replicas(solution) <= 4);
    assert_eq!(otac.state().profile().unwrap().len(), 4);
}

#[test]
fn test_greedy_generated_pipeline() {
    let mut gr = GreedyScheduler::with_ceiling(2);
    let (values, n_stages) = run_scheduled(&mut gr, 30);
    assert_eq!(values, (0..30).collect::<Vec<u32>>());
    assert_eq!(n_stages, 4);
    let replicas: Vec<usize> = gr.solution().unwrap().iter().map(|s| s.n_replicas).collect();
    assert_eq!(replicas, vec![1, 2, 2, 2]);
}

#[test]
fn test_file_generated_pipeline() {
    let mut file = FileScheduler::from_str(
        r#"{ "schedule": [
            { "cores": 1, "tasks": 1, "sync_buff_size": 4, "sync_waiting_type": "active" },
            { "cores": 3, "tasks": 2 },
            { "cores": 1, "tasks": 1 }
        ] }"#,
    )
    .unwrap();
    let (graph, src, log) = chain(25);
    let mut seq = Sequence::new(&graph, &SequenceSpec::new(vec![src]), 1).unwrap();
    let mut pipeline = file
        .generate_pipeline(graph, &mut seq, PipelineConfig::default())
        .unwrap();
    let first = pipeline.adaptor(0).unwrap().config().clone();
    assert_eq!(first.buffer_size, 4);
    assert_eq!(first.waiting, WaitingMode::Active);
    assert_eq!(pipeline.adaptor(1).unwrap().config().buffer_size, 1);

    pipeline.exec(StopCondition::Never).unwrap();
    // a single sink replica sees the frames in order
    assert_eq!(log.values(), (0..25).collect::<Vec<u32>>());
}
