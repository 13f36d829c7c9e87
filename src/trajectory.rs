//! Trajectory source abstraction
//!
//! The engine never parses trajectory files itself. It consumes any type
//! implementing [`TrajectorySource`], which must be able to report its
//! length, hand out frames by global index, and reopen itself so that each
//! worker gets an independent handle.

use crate::error::{TrajResult, TrajectoryError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One snapshot of the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Global frame index
    pub index: usize,

    /// Simulation time in ps, if the format carries it
    pub time: Option<f32>,

    /// Box dimensions `[a, b, c, alpha, beta, gamma]`
    pub dimensions: [f32; 6],

    /// Atom positions
    pub positions: Vec<[f32; 3]>,
}

impl Frame {
    /// Number of atoms in the frame
    pub fn n_atoms(&self) -> usize {
        self.positions.len()
    }

    /// Positions of a subset of atoms, or `None` if any index is missing
    pub fn select(&self, indices: &[u32]) -> Option<Vec<[f32; 3]>> {
        indices
            .iter()
            .map(|&i| self.positions.get(i as usize).copied())
            .collect()
    }
}

/// A readable, seekable sequence of frames
///
/// File handles are not shared across workers: every worker calls
/// [`TrajectorySource::reopen`] once before touching its first frame.
pub trait TrajectorySource: Send {
    /// Total number of frames
    fn total_frames(&self) -> usize;

    /// Read the frame at a global index
    fn frame_at(&mut self, index: usize) -> TrajResult<Frame>;

    /// Open an independent handle over the same trajectory
    fn reopen(&self) -> TrajResult<Box<dyn TrajectorySource>>;

    /// Time between consecutive frames in ps (0 when unknown)
    fn time_step(&self) -> f64 {
        0.0
    }

    /// Time of the first frame in ps, if known
    fn start_time(&self) -> Option<f64> {
        None
    }
}

/// Frames held in memory, shared between reopened handles
#[derive(Debug, Clone)]
pub struct MemoryTrajectory {
    frames: Arc<Vec<Frame>>,
    dt: f64,
}

impl MemoryTrajectory {
    /// Wrap a list of frames; `dt` is the time step in ps
    pub fn new(frames: Vec<Frame>, dt: f64) -> Self {
        Self {
            frames: Arc::new(frames),
            dt,
        }
    }

    /// Deterministic trajectory of atoms orbiting the box centre
    ///
    /// Every coordinate is a closed-form function of frame and atom index, so
    /// any worker can regenerate or verify any frame.
    pub fn synthetic(n_frames: usize, n_atoms: usize, dt: f64) -> Self {
        let frames = (0..n_frames)
            .map(|index| synthetic_frame(index, n_atoms, dt))
            .collect();
        Self::new(frames, dt)
    }
}

fn synthetic_frame(index: usize, n_atoms: usize, dt: f64) -> Frame {
    let t = index as f32;
    let edge = 50.0 + 0.01 * (t * 0.05).sin();
    let positions = (0..n_atoms)
        .map(|atom| {
            let a = atom as f32;
            let phase = 0.1 * t + 0.37 * a;
            let radius = 5.0 + (a % 7.0);
            [
                edge / 2.0 + radius * phase.cos(),
                edge / 2.0 + radius * phase.sin(),
                edge / 2.0 + 0.5 * (0.2 * t + a).sin() + 0.1 * a,
            ]
        })
        .collect();
    Frame {
        index,
        time: (dt > 0.0).then(|| (index as f64 * dt) as f32),
        dimensions: [edge, edge, edge, 90.0, 90.0, 90.0],
        positions,
    }
}

impl TrajectorySource for MemoryTrajectory {
    fn total_frames(&self) -> usize {
        self.frames.len()
    }

    fn frame_at(&mut self, index: usize) -> TrajResult<Frame> {
        self.frames
            .get(index)
            .cloned()
            .ok_or(TrajectoryError::OutOfRange {
                index,
                total: self.frames.len(),
            })
    }

    fn reopen(&self) -> TrajResult<Box<dyn TrajectorySource>> {
        Ok(Box::new(self.clone()))
    }

    fn time_step(&self) -> f64 {
        self.dt
    }

    fn start_time(&self) -> Option<f64> {
        self.frames.first().and_then(|f| f.time).map(f64::from)
    }
}
