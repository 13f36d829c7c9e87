//! Per-worker iteration loop
//!
//! An [`IterationDriver`] walks one [`WorkerSpan`] frame by frame, calling
//! every computation on every frame. Results of warm-up frames are thrown
//! away; results of emitted frames are written to the slot matching the
//! frame's position among this worker's emitted frames.
//!
//! ```text
//!  Idle ──► WarmingUp ──► Emitting ──► Done
//!    │                       ▲
//!    └───── warmup == 0 ─────┘
//! ```

use crate::buffer::ResultBuffer;
use crate::error::{Result, WorkerError};
use crate::partition::{CursorFrame, FrameCursor, WorkerSpan};
use crate::progress::ProgressReporter;
use crate::registry::Computation;
use crate::schema::Value;
use crate::trajectory::TrajectorySource;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Where a driver is in its span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    WarmingUp,
    Emitting,
    Done,
}

/// A computation bound to its worker-local result storage
pub struct Slot {
    pub name: String,
    pub computation: Box<dyn Computation>,
    pub args: Vec<Value>,
    pub buffer: ResultBuffer,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.name)
            .field("rows", &self.buffer.rows())
            .finish_non_exhaustive()
    }
}

/// What a finished driver hands back
#[derive(Debug)]
pub struct DriverOutput {
    pub worker: usize,
    /// Global index of every emitted frame, in emission order
    pub frames: Vec<usize>,
    pub slots: Vec<Slot>,
    /// Wall time spent on emitted frames
    pub elapsed: Duration,
}

/// Frame loop for one worker
pub struct IterationDriver {
    worker: usize,
    span: WorkerSpan,
    cursor: FrameCursor,
    state: DriverState,
    slots: Vec<Slot>,
    progress: Option<ProgressReporter>,
    frames: Vec<usize>,
    emit_started: Option<Instant>,
}

impl IterationDriver {
    /// Driver for `span`; `progress` is only given to worker 0
    pub fn new(span: WorkerSpan, slots: Vec<Slot>, progress: Option<ProgressReporter>) -> Self {
        Self {
            worker: span.worker,
            span,
            cursor: span.cursor(),
            state: DriverState::Idle,
            slots,
            progress,
            frames: Vec::with_capacity(span.emitted()),
            emit_started: None,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Process the next frame of the span
    ///
    /// Returns `None` once the span is exhausted.
    pub fn step(&mut self, source: &mut dyn TrajectorySource) -> Result<Option<CursorFrame>> {
        if self.state == DriverState::Done {
            return Ok(None);
        }
        let Some(next) = self.cursor.next() else {
            self.finish();
            return Ok(None);
        };

        if next.emit && self.state != DriverState::Emitting {
            self.state = DriverState::Emitting;
            self.emit_started = Some(Instant::now());
            if let Some(progress) = self.progress.as_mut() {
                progress.start();
            }
        } else if !next.emit {
            self.state = DriverState::WarmingUp;
        }

        let frame = source.frame_at(next.global)?;
        let row = next.local.checked_sub(self.span.warmup);

        for slot in &mut self.slots {
            let value = slot
                .computation
                .compute(&frame, &slot.args)
                .map_err(|e| WorkerError::ComputationFailed {
                    worker: self.worker,
                    name: slot.name.clone(),
                    frame: next.global,
                    message: e.to_string(),
                })?;

            if let (DriverState::Emitting, Some(row)) = (self.state, row) {
                slot.buffer
                    .write(row, value)
                    .map_err(|m| WorkerError::SchemaViolation {
                        worker: self.worker,
                        name: slot.name.clone(),
                        frame: next.global,
                        expected: m.expected,
                        found: m.found,
                    })?;
            }
        }

        if self.state == DriverState::Emitting {
            self.frames.push(next.global);
            if let Some(progress) = self.progress.as_mut() {
                progress.frame_done(next.global, frame.time);
            }
        } else {
            trace!(worker = self.worker, frame = next.global, "Warm-up frame");
        }

        Ok(Some(next))
    }

    fn finish(&mut self) {
        self.state = DriverState::Done;
        if let Some(progress) = self.progress.as_ref() {
            progress.finish();
        }
    }

    /// Run the span to completion
    pub fn run(mut self, source: &mut dyn TrajectorySource) -> Result<DriverOutput> {
        while self.step(source)?.is_some() {}

        let elapsed = self.emit_started.map(|t| t.elapsed()).unwrap_or_default();
        debug!(
            worker = self.worker,
            frames = self.frames.len(),
            warmup = self.span.warmup,
            elapsed_ms = elapsed.as_millis() as u64,
            "Worker finished span"
        );

        Ok(DriverOutput {
            worker: self.worker,
            frames: self.frames,
            slots: self.slots,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrajparError;
    use crate::registry::ComputeResult;
    use crate::schema::{NumericKind, NumericSpec, ResultSchema};
    use crate::trajectory::{Frame, MemoryTrajectory};
    use tempfile::tempdir;

    fn index_of(frame: &Frame, _: &[Value]) -> ComputeResult<Value> {
        Ok(Value::I64(frame.index as i64))
    }

    fn slot(dir: &std::path::Path, rows: usize) -> Slot {
        let schema = ResultSchema::Numeric(NumericSpec::new(NumericKind::I64, vec![]));
        Slot {
            name: "index".into(),
            computation: Box::new(index_of),
            args: vec![],
            buffer: ResultBuffer::allocate(&schema, rows, dir).unwrap(),
        }
    }

    fn span(start: usize, count: usize, warmup: usize) -> WorkerSpan {
        WorkerSpan {
            worker: 0,
            start,
            step: 1,
            count,
            warmup,
            emit_offset: 0,
        }
    }

    #[test]
    fn test_warmup_frames_not_written() {
        let dir = tempdir().unwrap();
        let mut traj = MemoryTrajectory::synthetic(10, 2, 1.0);
        let mut driver = IterationDriver::new(span(2, 5, 2), vec![slot(dir.path(), 3)], None);

        assert_eq!(driver.state(), DriverState::Idle);
        driver.step(&mut traj).unwrap();
        assert_eq!(driver.state(), DriverState::WarmingUp);
        driver.step(&mut traj).unwrap();
        assert_eq!(driver.state(), DriverState::WarmingUp);
        driver.step(&mut traj).unwrap();
        assert_eq!(driver.state(), DriverState::Emitting);

        let out = driver.run(&mut traj).unwrap();
        assert_eq!(out.frames, vec![4, 5, 6]);
        let col = &out.slots[0].buffer.columns()[0];
        assert_eq!(col.values::<i64>().unwrap(), &[4, 5, 6]);
    }

    #[test]
    fn test_no_warmup_goes_straight_to_emitting() {
        let dir = tempdir().unwrap();
        let mut traj = MemoryTrajectory::synthetic(4, 1, 1.0);
        let mut driver = IterationDriver::new(span(0, 2, 0), vec![slot(dir.path(), 2)], None);
        driver.step(&mut traj).unwrap();
        assert_eq!(driver.state(), DriverState::Emitting);
        driver.step(&mut traj).unwrap();
        assert!(driver.step(&mut traj).unwrap().is_none());
        assert_eq!(driver.state(), DriverState::Done);
    }

    #[test]
    fn test_empty_span() {
        let dir = tempdir().unwrap();
        let mut traj = MemoryTrajectory::synthetic(4, 1, 1.0);
        let out = IterationDriver::new(span(4, 0, 0), vec![slot(dir.path(), 0)], None)
            .run(&mut traj)
            .unwrap();
        assert!(out.frames.is_empty());
    }

    #[test]
    fn test_computation_error_aborts() {
        let dir = tempdir().unwrap();
        let mut traj = MemoryTrajectory::synthetic(4, 1, 1.0);
        let mut failing = slot(dir.path(), 4);
        failing.computation = Box::new(|f: &Frame, _: &[Value]| -> ComputeResult<Value> {
            if f.index == 2 {
                Err("bad frame".into())
            } else {
                Ok(Value::I64(0))
            }
        });
        let err = IterationDriver::new(span(0, 4, 0), vec![failing], None)
            .run(&mut traj)
            .unwrap_err();
        assert!(matches!(
            err,
            TrajparError::Worker(WorkerError::ComputationFailed { frame: 2, .. })
        ));
    }

    #[test]
    fn test_schema_violation() {
        let dir = tempdir().unwrap();
        let mut traj = MemoryTrajectory::synthetic(2, 1, 1.0);
        let mut wrong = slot(dir.path(), 2);
        wrong.computation =
            Box::new(|_: &Frame, _: &[Value]| -> ComputeResult<Value> { Ok(Value::F32(1.0)) });
        let err = IterationDriver::new(span(0, 2, 0), vec![wrong], None)
            .run(&mut traj)
            .unwrap_err();
        assert!(matches!(
            err,
            TrajparError::Worker(WorkerError::SchemaViolation { frame: 0, .. })
        ));
    }

    #[test]
    fn test_trajectory_error_propagates() {
        let dir = tempdir().unwrap();
        let mut traj = MemoryTrajectory::synthetic(2, 1, 1.0);
        let err = IterationDriver::new(span(1, 3, 0), vec![slot(dir.path(), 3)], None)
            .run(&mut traj)
            .unwrap_err();
        assert!(matches!(err, TrajparError::Trajectory(_)));
    }
}
