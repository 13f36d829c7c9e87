//! Parallel execution of registered computations over a trajectory
//!
//! The engine turns a frame window and a [`ParallelConfig`] into a
//! [`PartitionPlan`], hands every worker its span together with forks of
//! the registered computations, and assembles what the workers emit into
//! one [`AggregatedResult`].
//!
//! ```text
//!            ┌────────────── Engine ──────────────┐
//!  window ──►│ resolve ─► plan ─► allocate output │
//!            └──────┬──────────────────┬──────────┘
//!                   │ span + handles   │ span + handles
//!              ┌────▼────┐        ┌────▼────┐
//!              │ worker 0│  ...   │ worker N│   reopen source, fork
//!              └────┬────┘        └────┬────┘   computations, drive span
//!                   │ rows at emit_offset
//!              ┌────▼───────────────────▼───┐
//!              │      AggregatedResult      │
//!              └────────────────────────────┘
//! ```
//!
//! Threads share numeric output through file-backed regions; distributed
//! ranks fill local buffers and ship them to root in a single gather.
//!
//! SMP workers are threads of the calling process, not forked children.
//! Each one still rebinds the output regions from their [`RegionHandle`]s
//! rather than borrowing the parent's buffers, but that handoff and the
//! shared mappings it opens never leave the process.

use crate::buffer::{BufferPayload, ResultBuffer};
use crate::comm::Coordinator;
use crate::config::{Execution, FrameWindow, ParallelConfig};
use crate::driver::{DriverOutput, IterationDriver, Slot};
use crate::error::{ConfigError, Result, WorkerError};
use crate::memory;
use crate::partition::{self, FrameRange, PartitionMode, PartitionPlan, WorkerSpan};
use crate::pool::WorkerPool;
use crate::progress::ProgressReporter;
use crate::registry::{Computation, Registry};
use crate::schema::{Element, ResultSchema, Value};
use crate::shm::RegionHandle;
use crate::trajectory::TrajectorySource;
use humansize::{format_size, BINARY};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Emitted results of one computation
#[derive(Debug)]
pub struct ComputationResult {
    pub name: String,
    pub schema: ResultSchema,
    pub data: ResultBuffer,
}

impl ComputationResult {
    /// Values of one numeric column, flattened row by row
    pub fn values<T: Element>(&self, column: usize) -> Option<&[T]> {
        self.data.columns().get(column)?.values()
    }

    /// Per-frame values of an opaque result
    pub fn plain(&self) -> Option<&[Value]> {
        self.data.plain()
    }
}

/// Results of every computation, one row per emitted frame
///
/// Row `i` of every result belongs to global frame `frames[i]`. Block runs
/// are already in frame order; interleaved runs are grouped by worker until
/// [`AggregatedResult::into_frame_order`] is called.
#[derive(Debug)]
pub struct AggregatedResult {
    pub execution: Execution,
    pub mode: PartitionMode,
    pub frames: Vec<usize>,
    pub results: Vec<ComputationResult>,
    pub elapsed: Duration,
}

impl AggregatedResult {
    /// Result of the computation registered as `name`
    pub fn get(&self, name: &str) -> Option<&ComputationResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_frame_ordered(&self) -> bool {
        self.frames.windows(2).all(|w| w[0] < w[1])
    }

    /// Reorder every result so rows follow global frame order
    pub fn into_frame_order(mut self) -> Self {
        if self.is_frame_ordered() {
            return self;
        }
        let mut order: Vec<usize> = (0..self.frames.len()).collect();
        order.sort_by_key(|&i| self.frames[i]);
        for result in &mut self.results {
            result.data.permute(&order);
        }
        self.frames = order.iter().map(|&i| self.frames[i]).collect();
        self
    }
}

/// A computation bound for one worker: a fresh fork plus where to write
struct BoundComputation {
    name: String,
    computation: Box<dyn Computation>,
    args: Vec<Value>,
    schema: ResultSchema,
    handles: Vec<RegionHandle>,
}

/// Everything a worker thread needs; moved into the thread whole
struct WorkerTask {
    span: WorkerSpan,
    config: ParallelConfig,
    source: Box<dyn TrajectorySource>,
    computations: Vec<BoundComputation>,
}

/// What a worker returns; numeric rows are already in shared storage
struct WorkerPart {
    span: WorkerSpan,
    frames: Vec<usize>,
    plain: Vec<Vec<Value>>,
}

/// What a rank ships to root
#[derive(Debug, Serialize, Deserialize)]
struct RankPart {
    rank: usize,
    frames: Vec<usize>,
    payloads: Vec<BufferPayload>,
}

fn reporter(config: &ParallelConfig, span: &WorkerSpan) -> Option<ProgressReporter> {
    (span.worker == 0).then(|| ProgressReporter::new(config.progress_settings(), span.emitted()))
}

fn run_worker(task: WorkerTask) -> Result<WorkerPart> {
    let WorkerTask {
        span,
        config,
        mut source,
        computations,
    } = task;

    let slots = computations
        .into_iter()
        .map(|c| {
            let buffer =
                ResultBuffer::rebind(&c.name, &c.schema, &c.handles, span.emit_offset, span.emitted())?;
            Ok(Slot {
                name: c.name,
                computation: c.computation,
                args: c.args,
                buffer,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        worker = span.worker,
        start = span.start,
        count = span.count,
        warmup = span.warmup,
        "Worker starting"
    );
    let progress = reporter(&config, &span);
    let mut output = IterationDriver::new(span, slots, progress).run(source.as_mut())?;

    let mut plain = Vec::with_capacity(output.slots.len());
    for slot in &mut output.slots {
        slot.buffer.flush()?;
        plain.push(slot.buffer.take_plain());
    }
    Ok(WorkerPart {
        span,
        frames: output.frames,
        plain,
    })
}

/// Runs registered computations over a trajectory
#[derive(Debug, Clone)]
pub struct Engine {
    config: ParallelConfig,
    window: FrameWindow,
}

impl Engine {
    pub fn new(config: ParallelConfig, window: FrameWindow) -> Self {
        Self { config, window }
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn window(&self) -> &FrameWindow {
        &self.window
    }

    /// Partition `global` the way this engine would
    pub fn plan(&self, global: FrameRange) -> Result<PartitionPlan> {
        Ok(partition::plan(
            global,
            self.config.effective_workers(),
            self.config.overlap,
            self.config.effective_mode(),
        )?)
    }

    /// Probe pending computations on the first frame of the window
    fn establish_schemas(
        source: &dyn TrajectorySource,
        registry: &mut Registry,
        global: FrameRange,
    ) -> Result<Vec<ResultSchema>> {
        if registry.has_pending() {
            let frame = source.reopen()?.frame_at(global.start)?;
            registry.resolve_pending(&frame)?;
        }
        Ok(registry.schemas()?)
    }

    /// Run serially or on a thread pool, per the configured execution
    ///
    /// Distributed configurations need a [`Coordinator`]; use
    /// [`Engine::run_distributed`] for those.
    pub fn run_parallel(
        &self,
        source: &dyn TrajectorySource,
        registry: &mut Registry,
    ) -> Result<AggregatedResult> {
        if self.config.execution == Execution::Distributed {
            return Err(ConfigError::IncompleteLaunch(
                "distributed execution requires a coordinator".into(),
            )
            .into());
        }
        self.config.validate()?;

        let global = self.window.resolve(source)?;
        let plan = self.plan(global)?;
        let schemas = Self::establish_schemas(source, registry, global)?;
        let total = plan.total_emitted();

        let requested: usize = registry.iter().map(|c| c.numeric_bytes(total)).sum();
        memory::preflight(requested as u64, memory::physical_memory())?;

        info!(
            execution = %self.config.execution,
            workers = plan.workers(),
            mode = %plan.mode,
            frames = total,
            overlap = plan.overlap,
            output = %format_size(requested, BINARY),
            "Starting run"
        );

        let mut outputs = registry
            .iter()
            .map(|c| c.allocate(total, &self.config.shm_dir))
            .collect::<Result<Vec<_>>>()?;

        let mut tasks = Vec::with_capacity(plan.workers());
        for span in &plan.spans {
            let computations = registry
                .iter()
                .zip(&schemas)
                .zip(&outputs)
                .map(|((c, schema), output)| BoundComputation {
                    name: c.name().to_string(),
                    computation: c.fork(),
                    args: c.args().to_vec(),
                    schema: schema.clone(),
                    handles: output.handles(),
                })
                .collect();
            tasks.push(WorkerTask {
                span: *span,
                config: self.config.for_worker(span.worker),
                source: source.reopen()?,
                computations,
            });
        }

        let started = Instant::now();
        let parts = match self.config.execution {
            Execution::Smp => WorkerPool::new(plan.workers()).map(run_worker, tasks)?,
            _ => tasks
                .into_iter()
                .map(run_worker)
                .collect::<Result<Vec<_>>>()?,
        };
        let elapsed = started.elapsed();

        let mut frames = Vec::with_capacity(total);
        for part in parts {
            for (output, values) in outputs.iter_mut().zip(part.plain) {
                if !values.is_empty() {
                    output.write_payload(part.span.emit_offset, BufferPayload::Plain(values))?;
                }
            }
            frames.extend(part.frames);
        }
        if frames.len() != total {
            return Err(WorkerError::TaskFailed {
                index: 0,
                message: format!("workers emitted {} of {total} frames", frames.len()),
            }
            .into());
        }

        Ok(Self::assemble(
            self.config.execution,
            plan.mode,
            frames,
            registry,
            schemas,
            outputs,
            elapsed,
        ))
    }

    /// Run as one rank of a distributed group
    ///
    /// Root resolves the frame window and every pending schema and shares
    /// them; each rank drives its own block and root gathers the rows.
    /// Returns `None` on every rank but root.
    pub fn run_distributed(
        &self,
        coordinator: &mut Coordinator,
        source: &dyn TrajectorySource,
        registry: &mut Registry,
    ) -> Result<Option<AggregatedResult>> {
        let config = ParallelConfig {
            execution: Execution::Distributed,
            workers: coordinator.size(),
            worker_id: coordinator.rank(),
            ..self.config.clone()
        };
        config.validate()?;

        let global = coordinator.broadcast_with(|| self.window.resolve(source))?;
        let schemas =
            coordinator.broadcast_with(|| Self::establish_schemas(source, registry, global))?;
        if !coordinator.is_root() {
            registry.adopt(&schemas)?;
        }

        let plan = partition::plan(global, config.workers, config.overlap, PartitionMode::Block)?;
        let span = *plan.span(coordinator.rank()).ok_or_else(|| WorkerError::InitFailed {
            id: coordinator.rank(),
            reason: format!("no span in a plan of {} workers", plan.workers()),
        })?;
        if coordinator.is_root() {
            info!(
                ranks = plan.workers(),
                frames = plan.total_emitted(),
                overlap = plan.overlap,
                "Starting distributed run"
            );
        }

        let slots = registry
            .iter()
            .map(|c| {
                Ok(Slot {
                    name: c.name().to_string(),
                    computation: c.fork(),
                    args: c.args().to_vec(),
                    buffer: c.allocate(span.emitted(), &config.shm_dir)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let started = Instant::now();
        let mut local = source.reopen()?;
        let progress = reporter(&config, &span);
        let DriverOutput { frames, slots, .. } =
            IterationDriver::new(span, slots, progress).run(local.as_mut())?;
        let part = RankPart {
            rank: coordinator.rank(),
            frames,
            payloads: slots.iter().map(|s| s.buffer.to_payload()).collect(),
        };
        drop(slots);

        let Some(parts) = coordinator.gather(&part)? else {
            debug!(rank = part.rank, "Results sent to root");
            return Ok(None);
        };
        let elapsed = started.elapsed();

        let total = plan.total_emitted();
        let mut outputs = registry
            .iter()
            .map(|c| c.allocate(total, &config.shm_dir))
            .collect::<Result<Vec<_>>>()?;
        let mut frames = Vec::with_capacity(total);
        for part in parts {
            let offset = plan
                .span(part.rank)
                .map(|s| s.emit_offset)
                .ok_or_else(|| WorkerError::TaskFailed {
                    index: part.rank,
                    message: "result from a rank outside the plan".into(),
                })?;
            for (output, payload) in outputs.iter_mut().zip(part.payloads) {
                output.write_payload(offset, payload)?;
            }
            frames.extend(part.frames);
        }

        Ok(Some(Self::assemble(
            Execution::Distributed,
            PartitionMode::Block,
            frames,
            registry,
            schemas,
            outputs,
            elapsed,
        )))
    }

    fn assemble(
        execution: Execution,
        mode: PartitionMode,
        frames: Vec<usize>,
        registry: &Registry,
        schemas: Vec<ResultSchema>,
        outputs: Vec<ResultBuffer>,
        elapsed: Duration,
    ) -> AggregatedResult {
        let results = registry
            .iter()
            .zip(schemas)
            .zip(outputs)
            .map(|((c, schema), data)| ComputationResult {
                name: c.name().to_string(),
                schema,
                data,
            })
            .collect();
        AggregatedResult {
            execution,
            mode,
            frames,
            results,
            elapsed,
        }
    }
}

/// Run `registry` over `source` with `config`, serially or on threads
pub fn run(
    config: ParallelConfig,
    window: FrameWindow,
    source: &dyn TrajectorySource,
    registry: &mut Registry,
) -> Result<AggregatedResult> {
    Engine::new(config, window).run_parallel(source, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis;
    use crate::comm::LocalGroup;
    use crate::error::{RegistryError, TrajparError};
    use crate::registry::ComputeResult;
    use crate::trajectory::{Frame, MemoryTrajectory};
    use std::thread;
    use tempfile::tempdir;

    fn index_of(frame: &Frame, _: &[Value]) -> ComputeResult<Value> {
        Ok(Value::I64(frame.index as i64))
    }

    fn tagged(frame: &Frame, _: &[Value]) -> ComputeResult<Value> {
        Ok(Value::Text(format!("frame-{}", frame.index)))
    }

    fn registry(reference: &Frame) -> Registry {
        let mut reg = Registry::new();
        reg.register(Some("index"), index_of, vec![], reference).unwrap();
        reg.register(Some("tag"), tagged, vec![], reference).unwrap();
        reg
    }

    fn config(execution: Execution, workers: usize, dir: &std::path::Path) -> ParallelConfig {
        let base = match execution {
            Execution::Serial => ParallelConfig::serial(),
            _ => ParallelConfig::smp(workers),
        };
        base.with_shm_dir(dir.to_path_buf()).quiet()
    }

    #[test]
    fn test_smp_block_matches_frames() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(23, 2, 1.0);
        let mut reg = registry(&traj.clone().frame_at(0).unwrap());

        let result = run(
            config(Execution::Smp, 4, dir.path()),
            FrameWindow::all(2),
            &traj,
            &mut reg,
        )
        .unwrap();

        let expected: Vec<usize> = (0..23).step_by(2).collect();
        assert_eq!(result.frames, expected);
        let index = result.get("index").unwrap().values::<i64>(0).unwrap();
        assert_eq!(index, expected.iter().map(|&f| f as i64).collect::<Vec<_>>());
        let tags = result.get("tag").unwrap().plain().unwrap();
        assert_eq!(tags[3], Value::Text("frame-6".into()));
    }

    #[test]
    fn test_interleaved_reordered() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(10, 1, 1.0);
        let mut reg = registry(&traj.clone().frame_at(0).unwrap());

        let result = run(
            config(Execution::Smp, 3, dir.path()).with_mode(PartitionMode::Interleaved),
            FrameWindow::all(1),
            &traj,
            &mut reg,
        )
        .unwrap();
        assert_eq!(result.frames, vec![0, 3, 6, 9, 1, 4, 7, 2, 5, 8]);
        assert!(!result.is_frame_ordered());

        let ordered = result.into_frame_order();
        assert_eq!(ordered.frames, (0..10).collect::<Vec<_>>());
        let index = ordered.get("index").unwrap().values::<i64>(0).unwrap();
        assert_eq!(index, (0..10).collect::<Vec<i64>>());
        let tags = ordered.get("tag").unwrap().plain().unwrap();
        assert_eq!(tags[4], Value::Text("frame-4".into()));
    }

    #[test]
    fn test_running_mean_independent_of_workers() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(40, 6, 1.0);
        let reference = traj.clone().frame_at(0).unwrap();
        let overlap = analysis::required_overlap(&[analysis::AnalysisKind::RunningMean]);

        let mut serial_reg = Registry::new();
        analysis::AnalysisKind::RunningMean
            .register(&mut serial_reg, &reference)
            .unwrap();
        let serial = run(
            config(Execution::Serial, 1, dir.path()),
            FrameWindow::all(1),
            &traj,
            &mut serial_reg,
        )
        .unwrap();

        let mut smp_reg = Registry::new();
        analysis::AnalysisKind::RunningMean
            .register(&mut smp_reg, &reference)
            .unwrap();
        let smp = run(
            config(Execution::Smp, 4, dir.path()).with_overlap(overlap),
            FrameWindow::all(1),
            &traj,
            &mut smp_reg,
        )
        .unwrap();

        // worker 0 never emits its first `overlap` frames
        assert_eq!(smp.frames, (overlap..40).collect::<Vec<_>>());
        let serial_values = serial.get("running_mean").unwrap().values::<f32>(0).unwrap();
        let smp_values = smp.get("running_mean").unwrap().values::<f32>(0).unwrap();
        assert_eq!(&serial_values[overlap..], smp_values);
    }

    #[test]
    fn test_deferred_schema_resolved_on_first_frame() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(6, 3, 1.0);
        let mut reg = Registry::new();
        reg.register_deferred(Some("index"), index_of, vec![]);
        assert!(matches!(
            reg.schemas(),
            Err(RegistryError::SchemaPending(_))
        ));

        let result = run(
            config(Execution::Smp, 2, dir.path()),
            FrameWindow::all(1),
            &traj,
            &mut reg,
        )
        .unwrap();
        assert!(!reg.has_pending());
        assert_eq!(result.get("index").unwrap().values::<i64>(0).unwrap().len(), 6);
    }

    #[test]
    fn test_worker_failure_aborts_run() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(12, 1, 1.0);
        let mut reg = Registry::new();
        reg.register_with_schema(
            Some("fails"),
            |f: &Frame, _: &[Value]| -> ComputeResult<Value> {
                if f.index == 7 {
                    Err("frame 7 is cursed".into())
                } else {
                    Ok(Value::I64(0))
                }
            },
            vec![],
            crate::schema::infer(&Value::I64(0)),
        );

        let err = run(
            config(Execution::Smp, 3, dir.path()),
            FrameWindow::all(1),
            &traj,
            &mut reg,
        )
        .unwrap_err();
        assert!(err.to_string().contains("frame 7 is cursed"), "{err}");
    }

    #[test]
    fn test_smp_rejects_single_worker() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(4, 1, 1.0);
        let mut reg = Registry::new();
        let err = run(
            config(Execution::Smp, 1, dir.path()),
            FrameWindow::all(1),
            &traj,
            &mut reg,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TrajparError::Config(ConfigError::InvalidWorkerCount { count: 1, .. })
        ));
    }

    #[test]
    fn test_distributed_gathers_on_root() {
        let dir = tempdir().unwrap();
        let traj = MemoryTrajectory::synthetic(17, 2, 1.0);
        let reference = traj.clone().frame_at(0).unwrap();
        let comms = LocalGroup::create(3);

        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let traj = traj.clone();
                let reference = reference.clone();
                let dir = dir.path().to_path_buf();
                thread::spawn(move || {
                    let mut coordinator = Coordinator::new(Box::new(comm), false);
                    let mut reg = Registry::new();
                    reg.register(Some("index"), index_of, vec![], &reference).unwrap();
                    reg.register_deferred(Some("tag"), tagged, vec![]);
                    let engine = Engine::new(
                        ParallelConfig::distributed(coordinator.rank(), coordinator.size())
                            .with_shm_dir(dir)
                            .quiet(),
                        FrameWindow::all(1),
                    );
                    let result = engine.run_distributed(&mut coordinator, &traj, &mut reg).unwrap();
                    (coordinator.rank(), coordinator.is_released(), result)
                })
            })
            .collect();

        for handle in handles {
            let (rank, released, result) = handle.join().unwrap();
            if rank == 0 {
                let result = result.unwrap();
                assert_eq!(result.frames, (0..17).collect::<Vec<_>>());
                let index = result.get("index").unwrap().values::<i64>(0).unwrap();
                assert_eq!(index, (0..17).collect::<Vec<i64>>());
                let tags = result.get("tag").unwrap().plain().unwrap();
                assert_eq!(tags[16], Value::Text("frame-16".into()));
            } else {
                assert!(result.is_none());
                assert!(released);
            }
        }
    }
}
