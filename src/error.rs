//! Error types for trajpar
//!
//! This module defines the error hierarchy for the parallel engine:
//! - Configuration errors (partition plan, frame window, CLI values)
//! - Probe and registry errors (result schema establishment)
//! - Worker errors (task failures, schema violations)
//! - Resource errors (memory pre-flight, shared regions)
//! - Communication errors (distributed collectives)
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Every error is fatal to the run that raised it; nothing is retried
//! - Preserve error chains for debugging

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for trajpar
#[derive(Error, Debug)]
pub enum TrajparError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Result schema probe errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Memory and shared region errors
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Distributed communication errors
    #[error("Communication error: {0}")]
    Comm(#[from] CommError),

    /// Trajectory access errors
    #[error("Trajectory error: {0}")]
    Trajectory(#[from] TrajectoryError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors, raised before any worker is spawned
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be at least {min}")]
    InvalidWorkerCount { count: usize, min: usize },

    /// Overlap does not fit in the per-worker chunk
    #[error("Overlap of {overlap} frames does not fit in chunks of {frames_per_worker} frames")]
    OverlapTooLarge {
        overlap: usize,
        frames_per_worker: usize,
    },

    /// Overlap requested in a mode that does not support it
    #[error("Overlap is only supported in block mode (got {overlap} frames in {mode} mode)")]
    OverlapUnsupported { overlap: usize, mode: String },

    /// Unknown partition mode string
    #[error("Unrecognized partition mode '{0}': expected 'block' or 'interleaved'")]
    UnknownMode(String),

    /// Unknown progress format string
    #[error("Unrecognized progress format '{0}': expected frame, pct, both or empty")]
    UnknownProgress(String),

    /// Skip/stride of zero
    #[error("Invalid skip {0}: must be at least 1")]
    InvalidSkip(usize),

    /// Negative time or frame bound
    #[error("Argument must be >= 0: {name} = {value}")]
    NegativeBound { name: &'static str, value: f64 },

    /// Begin past end
    #[error("Begin ({begin}) greater than end ({end})")]
    InvertedWindow { begin: f64, end: f64 },

    /// Requested start beyond the trajectory
    #[error("Requested start at frame {start} but trajectory only has {total} frames")]
    StartBeyondEnd { start: usize, total: usize },

    /// Empty trajectory
    #[error("No frames to be read")]
    EmptyTrajectory,

    /// Launcher variables present but incomplete
    #[error("Distributed launch detected but {0}")]
    IncompleteLaunch(String),

    /// Atom selection that cannot be extracted
    #[error("Invalid atom selection: {0}")]
    InvalidSelection(String),

    /// Invalid shared memory directory
    #[error("Invalid shared memory directory '{path}': {reason}")]
    InvalidShmDir { path: PathBuf, reason: String },
}

/// Errors raised while probing a computation's result schema
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The computation failed on the reference frame
    #[error("Computation '{name}' failed during probe on frame {frame}: {message}")]
    CallFailed {
        name: String,
        frame: usize,
        message: String,
    },
}

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Buffer requested before the schema was established
    #[error("Result schema of '{0}' has not been established; probe it before allocating")]
    SchemaPending(String),

    /// Handle count does not match the schema's column count
    #[error("Computation '{name}' expects {expected} region handles, got {got}")]
    HandleMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// No computation registered under this name
    #[error("No computation registered as '{0}'")]
    NotFound(String),

    /// Schemas received for a different set of computations
    #[error("Received {got} result schemas for {expected} registered computations")]
    SchemaCount { expected: usize, got: usize },
}

/// Worker/concurrency errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A pool task failed or panicked
    #[error("Task {index} failed: {message}")]
    TaskFailed { index: usize, message: String },

    /// Worker thread could not be started
    #[error("Failed to initialize worker {id}: {reason}")]
    InitFailed { id: usize, reason: String },

    /// A per-frame computation raised
    #[error("Worker {worker}: computation '{name}' failed on frame {frame}: {message}")]
    ComputationFailed {
        worker: usize,
        name: String,
        frame: usize,
        message: String,
    },

    /// A per-frame result does not match the registered schema
    #[error("Worker {worker}: computation '{name}' returned {found} on frame {frame}, schema expects {expected}")]
    SchemaViolation {
        worker: usize,
        name: String,
        frame: usize,
        expected: String,
        found: String,
    },

    /// Completion channel closed before all results arrived
    #[error("Result channel closed unexpectedly")]
    ResultChannelClosed,
}

/// Memory and shared region errors
#[derive(Error, Debug)]
pub enum ResourceError {
    /// Pre-flight estimate exceeds physical memory
    #[error("Attempting to hold approximately {requested} of results but the system only has {available} of physical memory (at least twice the result size is required)")]
    InsufficientMemory { requested: String, available: String },

    /// Shared region creation/mapping failed
    #[error("Shared region '{path}': {reason}")]
    Region { path: PathBuf, reason: String },

    /// Region length does not match the expected layout
    #[error("Shared region '{path}' holds {actual} bytes, expected at least {expected}")]
    RegionSize {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
}

/// Distributed communication errors
#[derive(Error, Debug)]
pub enum CommError {
    /// Rendezvous with the root failed
    #[error("Rank {rank} failed to reach root at {addr}: {reason}")]
    Rendezvous {
        rank: usize,
        addr: String,
        reason: String,
    },

    /// Peer connection broke mid-collective
    #[error("Lost connection to rank {peer}: {reason}")]
    PeerLost { peer: usize, reason: String },

    /// Unexpected handshake or frame contents
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload encoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Only rank 0 may act as root
    #[error("Unsupported root rank {0}: collectives are rooted at rank 0")]
    UnsupportedRoot(usize),

    /// The root failed while producing a broadcast value
    #[error("Root rank failed: {0}")]
    RootFailed(String),

    /// This rank already contributed its final gather
    #[error("Rank {0} was released after its gather contribution")]
    Released(usize),
}

impl From<bincode::Error> for CommError {
    fn from(err: bincode::Error) -> Self {
        CommError::Serialization(err.to_string())
    }
}

/// Trajectory access errors reported by a frame source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrajectoryError {
    /// Frame index beyond the trajectory
    #[error("Frame {index} out of range for trajectory with {total} frames")]
    OutOfRange { index: usize, total: usize },

    /// Source could not be reopened for a worker
    #[error("Failed to reopen trajectory: {0}")]
    Reopen(String),

    /// Decoding failed
    #[error("Failed to read frame {index}: {reason}")]
    Read { index: usize, reason: String },
}

/// Result type alias for TrajparError
pub type Result<T> = std::result::Result<T, TrajparError>;

/// Result type alias for CommError
pub type CommResult<T> = std::result::Result<T, CommError>;

/// Result type alias for TrajectoryError
pub type TrajResult<T> = std::result::Result<T, TrajectoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let cfg = ConfigError::InvalidWorkerCount { count: 0, min: 1 };
        let err: TrajparError = cfg.into();
        assert!(matches!(err, TrajparError::Config(_)));
    }

    #[test]
    fn test_overlap_message() {
        let err = ConfigError::OverlapTooLarge {
            overlap: 5,
            frames_per_worker: 3,
        };
        assert_eq!(
            err.to_string(),
            "Overlap of 5 frames does not fit in chunks of 3 frames"
        );
    }
}
