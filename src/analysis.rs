//! Built-in per-frame analyses
//!
//! Small geometric computations used by the CLI, the benches and the tests.
//! They cover each storage path of the registry: a numeric scalar, a fixed
//! shape array, a composite tuple, an opaque value, and one stateful
//! analysis that needs overlapping frames to stay exact across workers.

use crate::error::ProbeError;
use crate::registry::{ComputeResult, Computation, Registry};
use crate::schema::Value;
use crate::trajectory::Frame;
use std::collections::VecDeque;

/// Frames averaged by [`RunningMean`]
pub const RUNNING_WINDOW: usize = 5;

/// Analyses selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AnalysisKind {
    /// Radius of gyration (float32 scalar)
    Rg,
    /// Geometric centre (float32 [3])
    Centroid,
    /// Box volume and edge lengths (composite)
    Box,
    /// Radius of gyration with a text label (plain values)
    Summary,
    /// Radius of gyration averaged over the last few frames
    RunningMean,
}

impl AnalysisKind {
    pub fn name(self) -> &'static str {
        match self {
            AnalysisKind::Rg => "rg",
            AnalysisKind::Centroid => "centroid",
            AnalysisKind::Box => "box",
            AnalysisKind::Summary => "summary",
            AnalysisKind::RunningMean => "running_mean",
        }
    }

    /// Warm-up frames needed for results independent of the partition
    pub fn overlap(self) -> usize {
        match self {
            AnalysisKind::RunningMean => RUNNING_WINDOW - 1,
            _ => 0,
        }
    }

    /// Register this analysis, probing `reference` for its schema
    pub fn register(self, registry: &mut Registry, reference: &Frame) -> Result<String, ProbeError> {
        let name = Some(self.name());
        match self {
            AnalysisKind::Rg => registry.register(name, rg, vec![], reference),
            AnalysisKind::Centroid => registry.register(name, centroid, vec![], reference),
            AnalysisKind::Box => registry.register(name, box_geometry, vec![], reference),
            AnalysisKind::Summary => registry.register(name, summary, vec![], reference),
            AnalysisKind::RunningMean => {
                registry.register(name, RunningMean::new(RUNNING_WINDOW), vec![], reference)
            }
        }
    }
}

/// Largest overlap required by any of `kinds`
pub fn required_overlap(kinds: &[AnalysisKind]) -> usize {
    kinds.iter().map(|k| k.overlap()).max().unwrap_or(0)
}

fn centre(positions: &[[f32; 3]]) -> [f32; 3] {
    let n = positions.len().max(1) as f32;
    let mut c = [0.0f32; 3];
    for p in positions {
        for axis in 0..3 {
            c[axis] += p[axis];
        }
    }
    c.map(|v| v / n)
}

fn radius_of_gyration(positions: &[[f32; 3]]) -> f32 {
    if positions.is_empty() {
        return 0.0;
    }
    let c = centre(positions);
    let sum: f32 = positions
        .iter()
        .map(|p| (0..3).map(|axis| (p[axis] - c[axis]).powi(2)).sum::<f32>())
        .sum();
    (sum / positions.len() as f32).sqrt()
}

/// Radius of gyration of all atoms
pub fn rg(frame: &Frame, _args: &[Value]) -> ComputeResult<Value> {
    Ok(Value::F32(radius_of_gyration(&frame.positions)))
}

/// Geometric centre of all atoms
pub fn centroid(frame: &Frame, _args: &[Value]) -> ComputeResult<Value> {
    Ok(Value::array_f32(vec![3], centre(&frame.positions).to_vec()))
}

/// Orthorhombic box volume and its edges
pub fn box_geometry(frame: &Frame, _args: &[Value]) -> ComputeResult<Value> {
    let [a, b, c, ..] = frame.dimensions;
    Ok(Value::List(vec![
        Value::F64(f64::from(a) * f64::from(b) * f64::from(c)),
        Value::array_f32(vec![3], vec![a, b, c]),
    ]))
}

/// Radius of gyration with a compactness label
pub fn summary(frame: &Frame, _args: &[Value]) -> ComputeResult<Value> {
    let rg = radius_of_gyration(&frame.positions);
    let label = if rg < 5.0 { "compact" } else { "extended" };
    Ok(Value::List(vec![Value::F32(rg), Value::Text(label.to_string())]))
}

/// Mean radius of gyration over the last `window` frames seen
///
/// The first `window - 1` frames of a fresh instance average fewer frames,
/// so a worker needs that many warm-up frames to match a serial run.
#[derive(Debug, Clone)]
pub struct RunningMean {
    window: usize,
    history: VecDeque<f32>,
}

impl RunningMean {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: VecDeque::with_capacity(window.max(1)),
        }
    }
}

impl Computation for RunningMean {
    fn compute(&mut self, frame: &Frame, _args: &[Value]) -> ComputeResult<Value> {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(radius_of_gyration(&frame.positions));
        let mean = self.history.iter().sum::<f32>() / self.history.len() as f32;
        Ok(Value::F32(mean))
    }

    fn fork(&self) -> Box<dyn Computation> {
        Box::new(RunningMean::new(self.window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NumericKind, NumericSpec, ResultSchema};
    use crate::trajectory::{MemoryTrajectory, TrajectorySource};

    fn frame_with(positions: Vec<[f32; 3]>) -> Frame {
        Frame {
            index: 0,
            time: None,
            dimensions: [2.0, 3.0, 4.0, 90.0, 90.0, 90.0],
            positions,
        }
    }

    #[test]
    fn test_rg_and_centroid() {
        let f = frame_with(vec![[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]]);
        assert_eq!(rg(&f, &[]).unwrap(), Value::F32(1.0));
        assert_eq!(
            centroid(&f, &[]).unwrap(),
            Value::array_f32(vec![3], vec![0.0, 0.0, 0.0])
        );
    }

    #[test]
    fn test_box_volume() {
        let f = frame_with(vec![]);
        match box_geometry(&f, &[]).unwrap() {
            Value::List(items) => assert_eq!(items[0], Value::F64(24.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_running_mean_window() {
        let mut mean = RunningMean::new(2);
        let a = frame_with(vec![[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]]);
        let b = frame_with(vec![[3.0, 0.0, 0.0], [-3.0, 0.0, 0.0]]);
        assert_eq!(mean.compute(&a, &[]).unwrap(), Value::F32(1.0));
        assert_eq!(mean.compute(&b, &[]).unwrap(), Value::F32(2.0));
        assert_eq!(mean.compute(&b, &[]).unwrap(), Value::F32(3.0));

        // forks start empty
        let mut fork = mean.fork();
        assert_eq!(fork.compute(&a, &[]).unwrap(), Value::F32(1.0));
    }

    #[test]
    fn test_registered_schemas() {
        let reference = MemoryTrajectory::synthetic(1, 8, 1.0).frame_at(0).unwrap();
        let mut registry = Registry::new();
        for kind in [
            AnalysisKind::Rg,
            AnalysisKind::Centroid,
            AnalysisKind::Box,
            AnalysisKind::Summary,
        ] {
            kind.register(&mut registry, &reference).unwrap();
        }
        let schemas = registry.schemas().unwrap();
        assert_eq!(
            schemas[0],
            ResultSchema::Numeric(NumericSpec::new(NumericKind::F32, vec![]))
        );
        assert_eq!(
            schemas[1],
            ResultSchema::Numeric(NumericSpec::new(NumericKind::F32, vec![3]))
        );
        assert!(matches!(schemas[2], ResultSchema::Composite(ref specs) if specs.len() == 2));
        assert_eq!(schemas[3], ResultSchema::Opaque);
    }

    #[test]
    fn test_required_overlap() {
        assert_eq!(required_overlap(&[AnalysisKind::Rg]), 0);
        assert_eq!(
            required_overlap(&[AnalysisKind::Rg, AnalysisKind::RunningMean]),
            RUNNING_WINDOW - 1
        );
    }
}
