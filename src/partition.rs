//! Frame partitioning across workers
//!
//! Splits a global frame range into one span per worker, either as
//! contiguous blocks or as strided (interleaved) subsets.
//!
//! In block mode each worker can pre-read `overlap` frames before its first
//! emitted frame so that stateful multi-frame computations are warmed up:
//!
//! ```text
//!  global:   0 1 2 3 4 5 6 7 8 9        (overlap = 1, 3 workers)
//!  worker 0: w E E E                    w = warm-up, E = emitted
//!  worker 1:       w E E E
//!  worker 2:             w E E
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How frames are distributed over workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PartitionMode {
    /// Contiguous chunks, remainder to the earliest workers
    #[default]
    Block,
    /// Worker `i` takes every Nth frame starting at offset `i`
    Interleaved,
}

impl fmt::Display for PartitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionMode::Block => write!(f, "block"),
            PartitionMode::Interleaved => write!(f, "interleaved"),
        }
    }
}

impl FromStr for PartitionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(PartitionMode::Block),
            "interleaved" => Ok(PartitionMode::Interleaved),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Inclusive frame range with a stride
///
/// `end` is the last frame actually visited, so `(end - start)` is always a
/// multiple of `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl FrameRange {
    /// Build a range from its first frame, stride and frame count
    ///
    /// Returns `None` for a zero count or zero stride.
    pub fn from_count(start: usize, step: usize, count: usize) -> Option<Self> {
        if count == 0 || step == 0 {
            return None;
        }
        Some(Self {
            start,
            end: start + (count - 1) * step,
            step,
        })
    }

    /// Every `skip`th frame of a trajectory with `total_frames` frames
    pub fn whole(total_frames: usize, skip: usize) -> Option<Self> {
        if skip == 0 {
            return None;
        }
        Self::from_count(0, skip, total_frames.div_ceil(skip))
    }

    /// Number of frames visited
    pub fn len(&self) -> usize {
        (self.end - self.start) / self.step + 1
    }

    /// A valid range always holds at least one frame
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Global index of the `i`th visited frame
    pub fn nth(&self, i: usize) -> usize {
        self.start + i * self.step
    }

    /// Iterate over the visited frame indices
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        (self.start..=self.end).step_by(self.step)
    }
}

/// One worker's share of the global range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpan {
    /// Worker ID (rank in distributed mode)
    pub worker: usize,

    /// First frame read, warm-up included
    pub start: usize,

    /// Stride between consecutive frames read by this worker
    pub step: usize,

    /// Frames read, warm-up included
    pub count: usize,

    /// Leading frames that are computed but not emitted
    pub warmup: usize,

    /// Output row of this worker's first emitted frame
    pub emit_offset: usize,
}

impl WorkerSpan {
    /// Frames this worker contributes to the output
    pub fn emitted(&self) -> usize {
        self.count.saturating_sub(self.warmup)
    }

    /// Whether the worker reads no frames at all
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The frames this worker reads, if any
    pub fn range(&self) -> Option<FrameRange> {
        FrameRange::from_count(self.start, self.step, self.count)
    }

    /// Global indices of the frames this worker emits, in order
    pub fn emitted_frames(&self) -> impl Iterator<Item = usize> + '_ {
        (self.warmup..self.count).map(move |i| self.start + i * self.step)
    }

    /// Cursor over the frames this worker reads
    pub fn cursor(&self) -> FrameCursor {
        FrameCursor {
            span: *self,
            next: 0,
        }
    }
}

/// A frame visited by a [`FrameCursor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorFrame {
    /// Global frame index
    pub global: usize,
    /// Position within the span, warm-up included
    pub local: usize,
    /// Whether the result of this frame is kept
    pub emit: bool,
}

/// Pull-based iteration over a worker span
#[derive(Debug, Clone)]
pub struct FrameCursor {
    span: WorkerSpan,
    next: usize,
}

impl Iterator for FrameCursor {
    type Item = CursorFrame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.span.count {
            return None;
        }
        let local = self.next;
        self.next += 1;
        Some(CursorFrame {
            global: self.span.start + local * self.span.step,
            local,
            emit: local >= self.span.warmup,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.span.count - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for FrameCursor {}

/// Per-worker spans for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub global: FrameRange,
    pub mode: PartitionMode,
    pub overlap: usize,
    pub spans: Vec<WorkerSpan>,
}

impl PartitionPlan {
    /// Number of workers in the plan
    pub fn workers(&self) -> usize {
        self.spans.len()
    }

    /// Span of a given worker
    pub fn span(&self, worker: usize) -> Option<&WorkerSpan> {
        self.spans.get(worker)
    }

    /// Total frames emitted by all workers
    pub fn total_emitted(&self) -> usize {
        self.spans.iter().map(WorkerSpan::emitted).sum()
    }

    /// Total frames read by all workers, warm-up included
    pub fn total_read(&self) -> usize {
        self.spans.iter().map(|s| s.count).sum()
    }

    /// Global frame index of every output row, in worker order
    pub fn output_frames(&self) -> Vec<usize> {
        self.spans
            .iter()
            .flat_map(|s| s.emitted_frames().collect::<Vec<_>>())
            .collect()
    }
}

/// Partition `0..total_frames` visited every `skip` frames
pub fn partition(
    total_frames: usize,
    skip: usize,
    overlap: usize,
    worker_count: usize,
    mode: PartitionMode,
) -> Result<PartitionPlan, ConfigError> {
    if total_frames == 0 {
        return Err(ConfigError::EmptyTrajectory);
    }
    let global = FrameRange::whole(total_frames, skip).ok_or(ConfigError::InvalidSkip(skip))?;
    plan(global, worker_count, overlap, mode)
}

/// Partition a global frame range over `worker_count` workers
pub fn plan(
    global: FrameRange,
    worker_count: usize,
    overlap: usize,
    mode: PartitionMode,
) -> Result<PartitionPlan, ConfigError> {
    if worker_count < 1 {
        return Err(ConfigError::InvalidWorkerCount {
            count: worker_count,
            min: 1,
        });
    }
    if global.step == 0 {
        return Err(ConfigError::InvalidSkip(0));
    }

    let spans = match mode {
        PartitionMode::Block => block_spans(global, worker_count, overlap)?,
        PartitionMode::Interleaved => {
            if overlap > 0 {
                return Err(ConfigError::OverlapUnsupported {
                    overlap,
                    mode: mode.to_string(),
                });
            }
            interleaved_spans(global, worker_count)
        }
    };

    Ok(PartitionPlan {
        global,
        mode,
        overlap,
        spans,
    })
}

fn block_spans(
    global: FrameRange,
    workers: usize,
    overlap: usize,
) -> Result<Vec<WorkerSpan>, ConfigError> {
    let total = global.len();
    if overlap > total {
        return Err(ConfigError::OverlapTooLarge {
            overlap,
            frames_per_worker: total,
        });
    }

    let emitting = total - overlap;
    let base = emitting / workers;
    let rem = emitting % workers;
    if workers > 1 && overlap > 0 && overlap >= base {
        return Err(ConfigError::OverlapTooLarge {
            overlap,
            frames_per_worker: base,
        });
    }

    let mut spans = Vec::with_capacity(workers);
    // Frames consumed so far, counted from the start of the global range
    let mut consumed = overlap;
    let mut emit_offset = 0;
    for worker in 0..workers {
        let emitted = base + usize::from(worker < rem);
        let first_emitted = global.start + consumed * global.step;
        let (start, count) = if emitted == 0 {
            (first_emitted, 0)
        } else {
            (first_emitted - overlap * global.step, emitted + overlap)
        };
        spans.push(WorkerSpan {
            worker,
            start,
            step: global.step,
            count,
            warmup: if count == 0 { 0 } else { overlap },
            emit_offset,
        });
        consumed += emitted;
        emit_offset += emitted;
    }
    Ok(spans)
}

fn interleaved_spans(global: FrameRange, workers: usize) -> Vec<WorkerSpan> {
    let total = global.len();
    let base = total / workers;
    let rem = total % workers;

    let mut emit_offset = 0;
    (0..workers)
        .map(|worker| {
            let count = base + usize::from(worker < rem);
            let span = WorkerSpan {
                worker,
                start: global.start + worker * global.step,
                step: global.step * workers,
                count,
                warmup: 0,
                emit_offset,
            };
            emit_offset += count;
            span
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_of(span: &WorkerSpan) -> Vec<usize> {
        span.emitted_frames().collect()
    }

    #[test]
    fn test_block_remainder_to_earliest() {
        let plan = partition(10, 1, 0, 3, PartitionMode::Block).unwrap();
        let ranges: Vec<_> = plan
            .spans
            .iter()
            .map(|s| {
                let r = s.range().unwrap();
                (r.start, r.end)
            })
            .collect();
        assert_eq!(ranges, vec![(0, 3), (4, 6), (7, 9)]);
        assert_eq!(plan.total_emitted(), 10);
    }

    #[test]
    fn test_interleaved_example() {
        let plan = partition(10, 1, 0, 3, PartitionMode::Interleaved).unwrap();
        assert_eq!(frames_of(&plan.spans[0]), vec![0, 3, 6, 9]);
        assert_eq!(frames_of(&plan.spans[1]), vec![1, 4, 7]);
        assert_eq!(frames_of(&plan.spans[2]), vec![2, 5, 8]);
        assert_eq!(plan.spans[1].step, 3);
    }

    #[test]
    fn test_block_overlap_warmup() {
        let plan = partition(12, 1, 2, 2, PartitionMode::Block).unwrap();
        // 10 emitting frames, 5 per worker
        assert_eq!(plan.spans[0].start, 0);
        assert_eq!(plan.spans[0].count, 7);
        assert_eq!(frames_of(&plan.spans[0]), vec![2, 3, 4, 5, 6]);
        assert_eq!(plan.spans[1].start, 5);
        assert_eq!(plan.spans[1].count, 7);
        assert_eq!(frames_of(&plan.spans[1]), vec![7, 8, 9, 10, 11]);
        assert_eq!(plan.output_frames(), (2..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_block_overlap_with_skip() {
        let plan = partition(20, 2, 1, 2, PartitionMode::Block).unwrap();
        // visited: 0,2,..,18 (10 frames), 9 emitting
        assert_eq!(frames_of(&plan.spans[0]), vec![2, 4, 6, 8, 10]);
        assert_eq!(plan.spans[1].start, 10);
        assert_eq!(frames_of(&plan.spans[1]), vec![12, 14, 16, 18]);
    }

    #[test]
    fn test_invalid_worker_count() {
        assert!(matches!(
            partition(10, 1, 0, 0, PartitionMode::Block),
            Err(ConfigError::InvalidWorkerCount { .. })
        ));
    }

    #[test]
    fn test_overlap_too_large() {
        // base chunk is (10 - 3) / 3 = 2 frames
        assert!(matches!(
            partition(10, 1, 3, 3, PartitionMode::Block),
            Err(ConfigError::OverlapTooLarge { .. })
        ));
        assert!(partition(10, 1, 11, 1, PartitionMode::Block).is_err());
    }

    #[test]
    fn test_interleaved_rejects_overlap() {
        assert!(matches!(
            partition(10, 1, 1, 2, PartitionMode::Interleaved),
            Err(ConfigError::OverlapUnsupported { .. })
        ));
    }

    #[test]
    fn test_more_workers_than_frames() {
        let plan = partition(2, 1, 0, 4, PartitionMode::Block).unwrap();
        assert_eq!(plan.spans[2].count, 0);
        assert_eq!(plan.spans[3].emitted(), 0);
        assert!(plan.spans[3].range().is_none());
        assert_eq!(plan.output_frames(), vec![0, 1]);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("block".parse::<PartitionMode>().unwrap(), PartitionMode::Block);
        assert_eq!(
            "Interleaved".parse::<PartitionMode>().unwrap(),
            PartitionMode::Interleaved
        );
        assert!("striped".parse::<PartitionMode>().is_err());
    }

    #[test]
    fn test_cursor_marks_warmup() {
        let span = WorkerSpan {
            worker: 1,
            start: 4,
            step: 2,
            count: 3,
            warmup: 1,
            emit_offset: 0,
        };
        let visited: Vec<_> = span.cursor().map(|f| (f.global, f.emit)).collect();
        assert_eq!(visited, vec![(4, false), (6, true), (8, true)]);
    }

    #[test]
    fn test_frame_range_whole() {
        let r = FrameRange::whole(10, 3).unwrap();
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![0, 3, 6, 9]);
        assert_eq!(r.len(), 4);
        assert!(FrameRange::whole(10, 0).is_none());
    }
}
