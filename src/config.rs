//! Configuration types for trajpar
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The frame window (`-b`/`-e`/`-fmn`/`-skip`) and its resolution
//! - The immutable parallel configuration handed to every worker

use crate::analysis::AnalysisKind;
use crate::error::ConfigError;
use crate::partition::{FrameRange, PartitionMode};
use crate::progress::{ProgressFormat, ProgressSettings, STATAVG};
use crate::shm;
use crate::trajectory::TrajectorySource;
use clap::{Args, Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 1024;

/// Parallel frame partitioning and result aggregation for trajectory analyses
#[derive(Parser, Debug, Clone)]
#[command(
    name = "trajpar",
    version,
    about = "Parallel frame partitioning and result aggregation for trajectory analyses",
    long_about = "Splits the frames of a trajectory over workers (threads or distributed ranks),\n\
                  runs per-frame analyses on each and aggregates the results into typed buffers.\n\n\
                  Distributed runs are detected from launcher variables (PMI_RANK, SLURM_PROCID, ...);\n\
                  ranks meet at TRAJPAR_MASTER_ADDR:TRAJPAR_MASTER_PORT.",
    after_help = "EXAMPLES:\n    \
        trajpar plan --frames 10 -w 3\n    \
        trajpar plan --frames 1000 -w 4 --overlap 5 --skip 2\n    \
        trajpar run --frames 5000 --atoms 200 -w 8 --analysis rg --analysis centroid\n    \
        trajpar run --frames 500 --execution serial --progress both -b 100 -e 900"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print how frames would be split over workers
    Plan(PlanArgs),

    /// Run analyses over a synthetic trajectory
    Run(RunArgs),
}

/// Partitioning options shared by both subcommands
#[derive(Args, Debug, Clone)]
pub struct PartitionArgs {
    /// Number of workers
    #[arg(short = 'w', long, default_value_t = default_workers(), value_name = "NUM")]
    pub workers: usize,

    /// Partition mode: block or interleaved
    #[arg(short = 'm', long, default_value = "block", value_name = "MODE")]
    pub mode: PartitionMode,

    /// Leading frames each block worker reads without emitting
    #[arg(long, default_value = "0", value_name = "FRAMES")]
    pub overlap: usize,

    /// Analyze every Nth frame
    #[arg(long = "skip", default_value = "1", value_name = "FRAMES")]
    pub skip: usize,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Total frames in the trajectory
    #[arg(long, value_name = "NUM")]
    pub frames: usize,

    #[command(flatten)]
    pub partition: PartitionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Frames in the synthetic trajectory
    #[arg(long, default_value = "1000", value_name = "NUM")]
    pub frames: usize,

    /// Atoms per frame
    #[arg(long, default_value = "100", value_name = "NUM")]
    pub atoms: usize,

    /// Time between frames in ps (0 for a trajectory without time)
    #[arg(long, default_value = "1.0", value_name = "PS")]
    pub dt: f64,

    /// Time (or frame, with --fmn) to begin analysis from
    #[arg(short = 'b', long = "begin", default_value = "0", value_name = "TIME")]
    pub begin: f64,

    /// Time (or frame, with --fmn) to end analysis at
    #[arg(short = 'e', long = "end", value_name = "TIME")]
    pub end: Option<f64>,

    /// Interpret -b and -e as frame numbers
    #[arg(long = "fmn")]
    pub frame_numbers: bool,

    #[command(flatten)]
    pub partition: PartitionArgs,

    /// Execution: serial or smp (distributed is detected from the environment)
    #[arg(short = 'x', long, default_value = "smp", value_name = "MODE")]
    pub execution: Execution,

    /// Analyses to run (repeatable)
    #[arg(short = 'a', long = "analysis", value_enum, value_name = "NAME", action = clap::ArgAction::Append)]
    pub analyses: Vec<AnalysisKind>,

    /// Progress format: frame, pct, both or empty
    #[arg(short = 'p', long, value_name = "FORMAT")]
    pub progress: Option<ProgressFormat>,

    /// Report statistics every N frames
    #[arg(long, default_value = "1", value_name = "FRAMES")]
    pub outstats: usize,

    /// Divide reported s/frame by the number of workers
    #[arg(long)]
    pub scale_dt: bool,

    /// Keep non-root ranks in collectives after the result gather
    #[arg(long)]
    pub keep_workers_alive: bool,

    /// Directory for shared result buffers (default /dev/shm or the temp dir)
    #[arg(long, env = "TRAJPAR_SHM_DIR", value_name = "DIR")]
    pub shm_dir: Option<PathBuf>,
}

/// Get default worker count based on CPU cores
fn default_workers() -> usize {
    num_cpus::get().clamp(2, MAX_WORKERS)
}

/// How workers are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Execution {
    /// One worker on the calling thread
    Serial,
    /// OS threads sharing result regions
    #[default]
    Smp,
    /// One rank per process, results gathered to rank 0
    Distributed,
}

impl Execution {
    pub fn is_parallel(self) -> bool {
        self != Execution::Serial
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Execution::Serial => write!(f, "serial"),
            Execution::Smp => write!(f, "smp"),
            Execution::Distributed => write!(f, "distributed"),
        }
    }
}

impl FromStr for Execution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Execution::Serial),
            "smp" => Ok(Execution::Smp),
            "distributed" => Ok(Execution::Distributed),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Requested analysis window, before it is matched against a trajectory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameWindow {
    /// First time (ps) or frame to analyze
    pub begin: f64,
    /// Last time (ps) or frame to analyze
    pub end: f64,
    /// Interpret `begin`/`end` as frame numbers
    pub frame_numbers: bool,
    /// Analyze every `skip`th frame
    pub skip: usize,
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self {
            begin: 0.0,
            end: f64::INFINITY,
            frame_numbers: false,
            skip: 1,
        }
    }
}

impl FrameWindow {
    /// Every frame, visited every `skip` frames
    pub fn all(skip: usize) -> Self {
        Self {
            skip,
            ..Self::default()
        }
    }

    /// Match the window against a trajectory
    ///
    /// Trajectories without time information fall back to frame numbers.
    pub fn resolve(&self, source: &dyn TrajectorySource) -> Result<FrameRange, ConfigError> {
        for (name, value) in [("begin", self.begin), ("end", self.end)] {
            if value < 0.0 {
                return Err(ConfigError::NegativeBound { name, value });
            }
        }
        if self.begin > self.end {
            return Err(ConfigError::InvertedWindow {
                begin: self.begin,
                end: self.end,
            });
        }
        if self.skip == 0 {
            return Err(ConfigError::InvalidSkip(0));
        }

        let total = source.total_frames();
        if total == 0 {
            return Err(ConfigError::EmptyTrajectory);
        }
        let last = (total - 1) as f64;

        let dt = source.time_step();
        let t0 = source.start_time().filter(|_| dt > 0.0);
        let (start, end) = match t0 {
            Some(t0) if !self.frame_numbers => {
                let start = ((self.begin - t0) / dt).ceil().max(0.0);
                let end = ((self.end - t0) / dt).min(last).floor();
                (start, end)
            }
            _ => {
                if t0.is_none() && !self.frame_numbers {
                    warn!("Trajectory has no time information; interpreting limits as frame numbers");
                }
                (self.begin.floor(), self.end.min(last).floor())
            }
        };

        if start > last {
            return Err(ConfigError::StartBeyondEnd {
                start: start as usize,
                total,
            });
        }
        if end < start {
            return Err(ConfigError::EmptyTrajectory);
        }

        let (start, end) = (start as usize, end as usize);
        let count = (end - start + 1).div_ceil(self.skip);
        FrameRange::from_count(start, self.skip, count).ok_or(ConfigError::EmptyTrajectory)
    }
}

/// Immutable parallel settings, copied into every worker
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelConfig {
    pub execution: Execution,
    pub mode: PartitionMode,
    pub overlap: usize,
    pub workers: usize,
    /// This worker's id (rank in distributed runs)
    pub worker_id: usize,
    /// Divide reported s/frame by the worker count
    pub scale_dt: bool,
    /// Keep non-root ranks in collectives after the result gather
    pub keep_workers_alive: bool,
    /// Explicit progress format; `None` picks one from the mode
    pub progress: Option<ProgressFormat>,
    pub outstats: usize,
    pub statavg: usize,
    /// Suppress progress output entirely
    pub quiet: bool,
    /// Directory for shared result regions
    pub shm_dir: PathBuf,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            execution: Execution::Serial,
            mode: PartitionMode::Block,
            overlap: 0,
            workers: 1,
            worker_id: 0,
            scale_dt: false,
            keep_workers_alive: false,
            progress: None,
            outstats: 1,
            statavg: STATAVG,
            quiet: false,
            shm_dir: shm::default_dir(),
        }
    }
}

impl ParallelConfig {
    /// Single worker on the calling thread
    pub fn serial() -> Self {
        Self::default()
    }

    /// `workers` threads sharing result regions
    pub fn smp(workers: usize) -> Self {
        Self {
            execution: Execution::Smp,
            workers,
            ..Self::default()
        }
    }

    /// One rank of a distributed group; always block mode
    pub fn distributed(rank: usize, size: usize) -> Self {
        Self {
            execution: Execution::Distributed,
            workers: size,
            worker_id: rank,
            ..Self::default()
        }
    }

    pub fn with_mode(self, mode: PartitionMode) -> Self {
        Self { mode, ..self }
    }

    pub fn with_overlap(self, overlap: usize) -> Self {
        Self { overlap, ..self }
    }

    pub fn with_progress(self, progress: ProgressFormat) -> Self {
        Self {
            progress: Some(progress),
            ..self
        }
    }

    pub fn with_shm_dir(self, shm_dir: PathBuf) -> Self {
        Self { shm_dir, ..self }
    }

    pub fn quiet(self) -> Self {
        Self { quiet: true, ..self }
    }

    pub fn keep_workers_alive(self, keep: bool) -> Self {
        Self {
            keep_workers_alive: keep,
            ..self
        }
    }

    /// Copy for one worker
    pub fn for_worker(&self, worker_id: usize) -> Self {
        Self {
            worker_id,
            ..self.clone()
        }
    }

    /// Partition mode actually used; distributed runs are always blocked
    pub fn effective_mode(&self) -> PartitionMode {
        match self.execution {
            Execution::Distributed => PartitionMode::Block,
            _ => self.mode,
        }
    }

    /// Workers actually used
    pub fn effective_workers(&self) -> usize {
        match self.execution {
            Execution::Serial => 1,
            _ => self.workers,
        }
    }

    /// Check settings that do not depend on the trajectory
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.execution {
            Execution::Smp if self.workers < 2 => Err(ConfigError::InvalidWorkerCount {
                count: self.workers,
                min: 2,
            }),
            Execution::Distributed if self.workers < 1 => Err(ConfigError::InvalidWorkerCount {
                count: self.workers,
                min: 1,
            }),
            _ => Ok(()),
        }
    }

    /// Progress settings for worker 0
    pub fn progress_settings(&self) -> ProgressSettings {
        let format = if self.quiet {
            ProgressFormat::Empty
        } else {
            self.progress.unwrap_or_else(|| {
                ProgressFormat::default_for(self.execution.is_parallel(), self.effective_mode())
            })
        };
        ProgressSettings {
            format,
            outstats: self.outstats.max(1),
            statavg: self.statavg.max(1),
            scale_by: if self.scale_dt {
                self.effective_workers()
            } else {
                1
            },
        }
    }
}

/// Validated `run` configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub frames: usize,
    pub atoms: usize,
    pub dt: f64,
    pub window: FrameWindow,
    pub parallel: ParallelConfig,
    pub analyses: Vec<AnalysisKind>,
    pub verbose: bool,
}

impl RunConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: RunArgs, quiet: bool, verbose: bool) -> Result<Self, ConfigError> {
        if args.partition.skip == 0 {
            return Err(ConfigError::InvalidSkip(0));
        }
        if args.dt < 0.0 {
            return Err(ConfigError::NegativeBound {
                name: "dt",
                value: args.dt,
            });
        }

        let shm_dir = match args.shm_dir {
            Some(dir) if !dir.is_dir() => {
                return Err(ConfigError::InvalidShmDir {
                    path: dir,
                    reason: "not a directory".to_string(),
                })
            }
            Some(dir) => dir,
            None => shm::default_dir(),
        };

        let parallel = ParallelConfig {
            execution: args.execution,
            mode: args.partition.mode,
            overlap: args.partition.overlap,
            workers: match args.execution {
                Execution::Serial => 1,
                _ => args.partition.workers,
            },
            worker_id: 0,
            scale_dt: args.scale_dt,
            keep_workers_alive: args.keep_workers_alive,
            progress: args.progress,
            outstats: args.outstats.max(1),
            statavg: STATAVG,
            quiet,
            shm_dir,
        };
        parallel.validate()?;

        let analyses = if args.analyses.is_empty() {
            vec![AnalysisKind::Rg]
        } else {
            args.analyses
        };

        Ok(Self {
            frames: args.frames,
            atoms: args.atoms,
            dt: args.dt,
            window: FrameWindow {
                begin: args.begin,
                end: args.end.unwrap_or(f64::INFINITY),
                frame_numbers: args.frame_numbers,
                skip: args.partition.skip,
            },
            parallel,
            analyses,
            verbose,
        })
    }

    /// Switch to a distributed run for the given rank
    pub fn into_distributed(self, rank: usize, size: usize) -> Self {
        let parallel = ParallelConfig {
            execution: Execution::Distributed,
            mode: PartitionMode::Block,
            workers: size,
            worker_id: rank,
            ..self.parallel
        };
        Self { parallel, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{Frame, MemoryTrajectory};

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("trajpar").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_window_time_based() {
        // frames at t = 10, 12, ..., 28
        let frames = (0..10)
            .map(|index| Frame {
                index,
                time: Some(10.0 + 2.0 * index as f32),
                dimensions: [10.0, 10.0, 10.0, 90.0, 90.0, 90.0],
                positions: vec![[0.0; 3]],
            })
            .collect();
        let traj = MemoryTrajectory::new(frames, 2.0);
        let window = FrameWindow {
            begin: 13.0,
            end: 21.0,
            ..FrameWindow::default()
        };
        let range = window.resolve(&traj).unwrap();
        // first frame at or after t=13 is t=14 (index 2), last at or before t=21 is t=20 (index 5)
        assert_eq!((range.start, range.end, range.step), (2, 5, 1));
    }

    #[test]
    fn test_window_frame_numbers() {
        let traj = MemoryTrajectory::synthetic(10, 1, 1.0);
        let window = FrameWindow {
            begin: 2.0,
            end: 100.0,
            frame_numbers: true,
            skip: 3,
        };
        let range = window.resolve(&traj).unwrap();
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![2, 5, 8]);
    }

    #[test]
    fn test_window_without_time_uses_frames() {
        let traj = MemoryTrajectory::synthetic(10, 1, 0.0);
        let window = FrameWindow {
            begin: 4.0,
            end: 6.0,
            ..FrameWindow::default()
        };
        let range = window.resolve(&traj).unwrap();
        assert_eq!((range.start, range.end), (4, 6));
    }

    #[test]
    fn test_window_errors() {
        let traj = MemoryTrajectory::synthetic(10, 1, 1.0);
        let neg = FrameWindow {
            begin: -1.0,
            ..FrameWindow::default()
        };
        assert!(matches!(neg.resolve(&traj), Err(ConfigError::NegativeBound { .. })));

        let inverted = FrameWindow {
            begin: 5.0,
            end: 2.0,
            ..FrameWindow::default()
        };
        assert!(matches!(
            inverted.resolve(&traj),
            Err(ConfigError::InvertedWindow { .. })
        ));

        let beyond = FrameWindow {
            begin: 20.0,
            frame_numbers: true,
            ..FrameWindow::default()
        };
        assert!(matches!(
            beyond.resolve(&traj),
            Err(ConfigError::StartBeyondEnd { start: 20, total: 10 })
        ));

        let empty = MemoryTrajectory::synthetic(0, 1, 1.0);
        assert_eq!(
            FrameWindow::default().resolve(&empty),
            Err(ConfigError::EmptyTrajectory)
        );
    }

    #[test]
    fn test_smp_needs_two_workers() {
        assert!(matches!(
            ParallelConfig::smp(1).validate(),
            Err(ConfigError::InvalidWorkerCount { count: 1, min: 2 })
        ));
        assert!(ParallelConfig::smp(2).validate().is_ok());
        assert!(ParallelConfig::serial().validate().is_ok());
    }

    #[test]
    fn test_for_worker_copies() {
        let base = ParallelConfig::smp(4).with_overlap(2);
        let w = base.for_worker(3);
        assert_eq!(w.worker_id, 3);
        assert_eq!(w.overlap, 2);
        assert_eq!(base.worker_id, 0);
    }

    #[test]
    fn test_distributed_forces_block() {
        let cfg = ParallelConfig::distributed(1, 3).with_mode(PartitionMode::Interleaved);
        assert_eq!(cfg.effective_mode(), PartitionMode::Block);
        assert_eq!(cfg.progress_settings().format, ProgressFormat::Percent);
    }

    #[test]
    fn test_progress_settings() {
        let cfg = ParallelConfig::serial();
        assert_eq!(cfg.progress_settings().format, ProgressFormat::Frame);
        let quiet = ParallelConfig::smp(2).with_progress(ProgressFormat::Both).quiet();
        assert_eq!(quiet.progress_settings().format, ProgressFormat::Empty);
        let scaled = ParallelConfig {
            scale_dt: true,
            ..ParallelConfig::smp(4)
        };
        assert_eq!(scaled.progress_settings().scale_by, 4);
    }

    #[test]
    fn test_cli_plan() {
        let args = parse(&["plan", "--frames", "10", "-w", "3", "--mode", "interleaved"]);
        match args.command {
            Command::Plan(plan) => {
                assert_eq!(plan.frames, 10);
                assert_eq!(plan.partition.workers, 3);
                assert_eq!(plan.partition.mode, PartitionMode::Interleaved);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_run_config() {
        let args = parse(&[
            "run", "--frames", "50", "-w", "4", "--overlap", "2", "-a", "rg", "-a", "centroid",
            "-p", "both", "-e", "30",
        ]);
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        let config = RunConfig::from_args(run, false, false).unwrap();
        assert_eq!(config.parallel.workers, 4);
        assert_eq!(config.parallel.overlap, 2);
        assert_eq!(config.parallel.progress, Some(ProgressFormat::Both));
        assert_eq!(config.analyses, vec![AnalysisKind::Rg, AnalysisKind::Centroid]);
        assert_eq!(config.window.end, 30.0);
    }

    #[test]
    fn test_cli_run_serial_ignores_workers() {
        let args = parse(&["run", "-x", "serial", "-w", "1"]);
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        let config = RunConfig::from_args(run, true, false).unwrap();
        assert_eq!(config.parallel.execution, Execution::Serial);
        assert_eq!(config.parallel.workers, 1);
        assert_eq!(config.analyses, vec![AnalysisKind::Rg]);
    }

    #[test]
    fn test_cli_rejects_bad_mode() {
        let result = CliArgs::try_parse_from(["trajpar", "plan", "--frames", "3", "--mode", "striped"]);
        assert!(result.is_err());
    }
}
