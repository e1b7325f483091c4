//! Weir CLI
//!
//! Profiles, schedules and runs synthetic chains as thread pipelines.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod chain;

use chain::Chain;
use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;
use weir_runtime::{PipelineConfig, StopCondition};
use weir_sched::{
    DEFAULT_PROFILING_PASSES, FileScheduler, GreedyScheduler, OtacScheduler, ScheduleFile,
    Scheduler, period, total_replicas,
};

#[derive(Parser)]
#[command(name = "weir")]
#[command(about = "Weir - Streaming dataflow pipelines on threads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule a chain and run it as a pipeline
    Run {
        #[command(flatten)]
        chain: ChainArgs,
        #[command(flatten)]
        sched: SchedArgs,
        /// Pipeline configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the schedule of a chain as a schedule file
    Schedule {
        #[command(flatten)]
        chain: ChainArgs,
        #[command(flatten)]
        sched: SchedArgs,
    },
    /// Write the graph of a chain in DOT format
    Export {
        #[command(flatten)]
        chain: ChainArgs,
        #[command(flatten)]
        sched: SchedArgs,
        /// Export the scheduled pipeline stages instead of the plain sequence
        #[arg(long)]
        pipeline: bool,
        /// Output path, stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ChainArgs {
    /// Spin durations of the chain stages in microseconds
    #[arg(short, long, value_delimiter = ',', default_value = "100,400,100")]
    durations: Vec<u64>,
    /// Indices of the stages that cannot be replicated
    #[arg(short, long, value_delimiter = ',')]
    sequential: Vec<usize>,
    /// Frames pushed through the pipeline
    #[arg(short, long, default_value_t = 1000)]
    frames: u64,
}

#[derive(Args)]
struct SchedArgs {
    /// Partitioning strategy
    #[arg(long, value_enum, default_value_t = SchedulerKind::Otac)]
    scheduler: SchedulerKind,
    /// Total replicas for OTAC, replicas per stage for GR
    #[arg(short, long)]
    resources: Option<usize>,
    /// Schedule file read by the file scheduler
    #[arg(long)]
    schedule: Option<PathBuf>,
    /// Profiling passes
    #[arg(long, default_value_t = DEFAULT_PROFILING_PASSES)]
    passes: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum SchedulerKind {
    Otac,
    Gr,
    File,
}

fn scheduler(args: &SchedArgs) -> Result<Box<dyn Scheduler>> {
    let resources = args
        .resources
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get));
    Ok(match args.scheduler {
        SchedulerKind::Otac => Box::new(OtacScheduler::new(resources)),
        SchedulerKind::Gr => Box::new(GreedyScheduler::with_ceiling(resources)),
        SchedulerKind::File => {
            let path = args
                .schedule
                .as_ref()
                .ok_or_else(|| eyre!("the file scheduler needs --schedule"))?;
            Box::new(FileScheduler::from_path(path)?)
        }
    })
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&json).wrap_err_with(|| format!("invalid pipeline config {}", path.display()))
}

/// Profile the chain and schedule it
fn plan(chain: &Chain, sched: &SchedArgs) -> Result<Box<dyn Scheduler>> {
    let mut scheduler = scheduler(sched)?;
    let mut seq = chain.sequence()?;
    scheduler.profile(&mut seq, sched.passes)?;
    scheduler.schedule()?;

    let profile = scheduler.state().require_profile()?;
    let solution = scheduler
        .solution()
        .ok_or_else(|| eyre!("no schedule was produced"))?;
    let period_us = period(profile, solution)? / 1e3;
    info!(
        stages = solution.len(),
        replicas = total_replicas(solution),
        period_us,
        "chain scheduled"
    );
    Ok(scheduler)
}

fn run(chain: ChainArgs, sched: SchedArgs, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let built = Chain::build(&chain.durations, &chain.sequential, chain.frames + sched.passes)?;
    let log = built.log.clone();
    let mut scheduler = plan(&built, &sched)?;
    let mut seq = built.sequence()?;
    let mut pipeline = scheduler.generate_pipeline(built.graph, &mut seq, config)?;

    let started = Instant::now();
    pipeline.exec(StopCondition::Never)?;
    let elapsed = started.elapsed();

    let frames = log.len().saturating_sub(sched.passes as usize);
    let solution = scheduler.solution().unwrap_or_default();
    println!(
        "{} stages, {} replicas",
        pipeline.n_stages(),
        total_replicas(solution)
    );
    for (i, stage) in solution.iter().enumerate() {
        println!("  stage {i}: {} tasks x {} replicas", stage.n_tasks, stage.n_replicas);
    }
    println!(
        "{frames} frames in {elapsed:.3?} ({:.1} frames/s)",
        frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}

fn schedule(chain: ChainArgs, sched: SchedArgs) -> Result<()> {
    let built = Chain::build(&chain.durations, &chain.sequential, sched.passes)?;
    let scheduler = plan(&built, &sched)?;
    let file = ScheduleFile::from_solution(scheduler.solution().unwrap_or_default());
    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}

fn export(chain: ChainArgs, sched: SchedArgs, pipeline: bool, output: Option<PathBuf>) -> Result<()> {
    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).wrap_err_with(|| format!("cannot create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    let built = Chain::build(&chain.durations, &chain.sequential, chain.frames + sched.passes)?;
    if pipeline {
        let mut scheduler = plan(&built, &sched)?;
        let mut seq = built.sequence()?;
        let pipeline = scheduler.generate_pipeline(built.graph, &mut seq, PipelineConfig::default())?;
        pipeline.write_dot(&mut out)?;
    } else {
        built.sequence()?.write_dot(&mut out)?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weir=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            chain,
            sched,
            config,
        } => run(chain, sched, config),
        Commands::Schedule { chain, sched } => schedule(chain, sched),
        Commands::Export {
            chain,
            sched,
            pipeline,
            output,
        } => export(chain, sched, pipeline, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_runtime::WaitingMode;

    fn sched_args(kind: SchedulerKind, resources: usize) -> SchedArgs {
        SchedArgs {
            scheduler: kind,
            resources: Some(resources),
            schedule: None,
            passes: 4,
        }
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "weir", "run", "-d", "10,20,30", "-s", "1", "--scheduler", "gr", "-r", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { chain, sched, config } => {
                assert_eq!(chain.durations, vec![10, 20, 30]);
                assert_eq!(chain.sequential, vec![1]);
                assert!(matches!(sched.scheduler, SchedulerKind::Gr));
                assert_eq!(sched.resources, Some(2));
                assert!(config.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_load_config() {
        assert_eq!(load_config(None).unwrap(), PipelineConfig::default());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "buffer_size": 4, "waiting": "active" }"#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.buffer_size, 4);
        assert_eq!(config.waiting, WaitingMode::Active);
        assert!(config.auto_stop);
    }

    #[test]
    fn test_file_scheduler_needs_path() {
        assert!(scheduler(&sched_args(SchedulerKind::File, 1)).is_err());
        assert!(scheduler(&sched_args(SchedulerKind::Otac, 2)).is_ok());
    }

    #[test]
    fn test_plan_covers_chain() {
        let chain = Chain::build(&[5, 50, 5], &[0], 4).unwrap();
        let scheduler = plan(&chain, &sched_args(SchedulerKind::Otac, 3)).unwrap();
        let covered: usize = scheduler.solution().unwrap().iter().map(|s| s.n_tasks).sum();
        assert_eq!(covered, 5);
        assert!(total_replicas(scheduler.solution().unwrap()) <= 3);
    }
}
