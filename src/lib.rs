//! trajpar - Parallel Trajectory Frame Processing
//!
//! Runs per-frame computations over a molecular dynamics trajectory on many
//! workers at once, and assembles what they return into contiguous typed
//! arrays in frame order.
//!
//! # Features
//!
//! - **Block and interleaved partitioning**: Contiguous chunks or strided
//!   subsets, with optional warm-up frames so multi-frame analyses give the
//!   same answer no matter how many workers run them.
//!
//! - **Three execution modes**: Serial, threads on one machine (SMP), or
//!   ranks of a distributed group started by an MPI-style launcher.
//!
//! - **Typed result storage**: Numeric results are written straight into
//!   file-backed shared regions; anything else is collected per frame.
//!
//! - **Schema inference**: Each computation is probed once to learn the
//!   shape and type of what it returns.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Frame window + Registry                      │
//! │          (begin/end/skip, named computations + schemas)         │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Engine                                │
//! │  resolve window ─► partition plan ─► memory check ─► allocate   │
//! │                                                                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐         ┌─────────┐      │
//! │  │Worker 0 │  │Worker 1 │  │Worker 2 │  ...    │Worker N │      │
//! │  │ driver  │  │ driver  │  │ driver  │         │ driver  │      │
//! │  └────┬────┘  └────┬────┘  └────┬────┘         └────┬────┘      │
//! │       │ rows       │ rows       │ rows              │ rows      │
//! │       ▼            ▼            ▼                   ▼           │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │   Shared regions (SMP)  /  gather to root (distributed)  │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//!                    ┌────────────────────┐
//!                    │  AggregatedResult  │
//!                    │ one row per frame  │
//!                    └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # How would 10,000 frames split over 8 workers with 4 warm-up frames?
//! trajpar plan --frames 10000 -w 8 --overlap 4
//!
//! # Run two analyses on 8 threads
//! trajpar run --frames 5000 -w 8 -a rg -a running_mean
//!
//! # Same run as 4 ranks
//! mpirun -n 4 trajpar run --frames 5000 -a rg
//! ```

pub mod analysis;
pub mod buffer;
pub mod comm;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod memory;
pub mod partition;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod schema;
pub mod shm;
pub mod timeseries;
pub mod trajectory;

pub use config::{CliArgs, Execution, FrameWindow, ParallelConfig, RunConfig};
pub use engine::{AggregatedResult, ComputationResult, Engine};
pub use error::{Result, TrajparError};
pub use partition::{partition, FrameRange, PartitionMode, PartitionPlan, WorkerSpan};
pub use registry::{Computation, Registry};
pub use schema::{ResultSchema, Value};
pub use trajectory::{Frame, MemoryTrajectory, TrajectorySource};
