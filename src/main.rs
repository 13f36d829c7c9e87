//! trajpar - Parallel Trajectory Frame Processing
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use trajpar::analysis::required_overlap;
use trajpar::comm::{Coordinator, LaunchEnv};
use trajpar::config::{CliArgs, Command, Execution, PlanArgs, RunArgs, RunConfig};
use trajpar::engine::{AggregatedResult, Engine};
use trajpar::partition::{partition, PartitionMode, PartitionPlan};
use trajpar::progress::{format_count, print_header, print_summary};
use trajpar::registry::Registry;
use trajpar::trajectory::{MemoryTrajectory, TrajectorySource};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;

    match args.command {
        Command::Plan(plan) => run_plan(plan),
        Command::Run(run) => run_analyses(run, args.quiet, args.verbose),
    }
}

/// Print the partition for a trajectory of a given length
fn run_plan(args: PlanArgs) -> Result<()> {
    let p = &args.partition;
    let plan = partition(args.frames, p.skip, p.overlap, p.workers, p.mode)
        .context("Invalid partition")?;

    print_header("plan", plan.workers(), plan.total_emitted(), plan.mode);
    print_plan(&plan);
    Ok(())
}

fn print_plan(plan: &PartitionPlan) {
    println!(
        "  {:>6}  {:>8}  {:>8}  {:>6}  {:>7}  {:>8}  {:>8}",
        "worker", "first", "last", "step", "warm-up", "emitted", "offset"
    );
    for span in &plan.spans {
        let (first, last) = match span.range() {
            Some(range) => (range.start.to_string(), range.end.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "  {:>6}  {:>8}  {:>8}  {:>6}  {:>7}  {:>8}  {:>8}",
            span.worker,
            first,
            last,
            span.step,
            span.warmup,
            format_count(span.emitted()),
            span.emit_offset
        );
    }
    println!();
    println!(
        "  {} frames read for {} emitted",
        format_count(plan.total_read()),
        format_count(plan.total_emitted())
    );
}

/// Run the selected analyses over a synthetic trajectory
fn run_analyses(mut args: RunArgs, quiet: bool, verbose: bool) -> Result<()> {
    let launch = LaunchEnv::detect().context("Failed to read launcher environment")?;
    if launch.is_some() {
        args.execution = Execution::Distributed;
    }

    let mut config = RunConfig::from_args(args, quiet, verbose).context("Invalid configuration")?;
    if let Some(env) = &launch {
        config = config.into_distributed(env.rank, env.size);
    }

    let needed = required_overlap(&config.analyses);
    if needed > config.parallel.overlap {
        if config.parallel.effective_mode() == PartitionMode::Block {
            info!(overlap = needed, "Raising overlap for multi-frame analyses");
            config.parallel.overlap = needed;
        } else {
            warn!(
                overlap = needed,
                "Multi-frame analyses need block mode to match a serial run"
            );
        }
    }

    let source = MemoryTrajectory::synthetic(config.frames, config.atoms, config.dt);
    let reference = source
        .reopen()
        .and_then(|mut s| s.frame_at(0))
        .context("Trajectory has no frames")?;

    let mut registry = Registry::new();
    for kind in &config.analyses {
        let name = kind
            .register(&mut registry, &reference)
            .with_context(|| format!("Failed to register analysis '{}'", kind.name()))?;
        debug!(analysis = %name, "Registered");
    }

    let engine = Engine::new(config.parallel.clone(), config.window);
    let show = !quiet;

    let result = match launch {
        Some(env) => {
            let comm = env.connect().context("Failed to join distributed group")?;
            let mut coordinator = Coordinator::new(Box::new(comm), config.parallel.keep_workers_alive);
            if show && coordinator.is_root() {
                header(&engine, &source, coordinator.size())?;
            }
            let result = engine
                .run_distributed(&mut coordinator, &source, &mut registry)
                .context("Distributed run failed")?;
            let Some(result) = result else {
                info!(rank = coordinator.rank(), "Results delivered to root");
                return Ok(());
            };
            result
        }
        None => {
            if show {
                header(&engine, &source, config.parallel.effective_workers())?;
            }
            engine
                .run_parallel(&source, &mut registry)
                .context("Run failed")?
        }
    };

    report(result.into_frame_order(), show);
    Ok(())
}

fn header(engine: &Engine, source: &dyn TrajectorySource, workers: usize) -> Result<()> {
    let range = engine
        .window()
        .resolve(source)
        .context("Invalid frame window")?;
    let config = engine.config();
    print_header(
        &config.execution.to_string(),
        workers,
        range.len(),
        config.effective_mode(),
    );
    Ok(())
}

fn report(result: AggregatedResult, show: bool) {
    for comp in &result.results {
        debug!(name = %comp.name, schema = %comp.schema, rows = comp.data.rows(), "Result");
    }
    if show {
        print_summary(&result, result.elapsed);
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("trajpar=debug,warn")
    } else {
        EnvFilter::new("trajpar=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
