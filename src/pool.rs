//! Bounded worker pool
//!
//! Runs one task per argument on named scoped threads of the calling
//! process, with at most `workers` in flight at once. Completions arrive on
//! a single channel tagged with their argument index, and the pool hands
//! results back in input order.
//!
//! Any failure (an `Err` or a panic) is fatal: nothing further is
//! dispatched, the tasks still running are waited for, and the whole map
//! fails.

use crate::error::WorkerError;
use crossbeam_channel::{bounded, Sender};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error};

/// Outcome of one task, tagged with its argument index
type Completion<R> = (usize, Result<R, String>);

/// Pool of up to `workers` concurrent tasks
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Apply `task` to every argument and collect results in input order
    ///
    /// Blocks until every dispatched task has finished. On failure returns
    /// the error of the lowest failing index observed.
    pub fn map<A, R, E, F>(&self, task: F, args: Vec<A>) -> Result<Vec<R>, WorkerError>
    where
        A: Send,
        R: Send,
        E: fmt::Display,
        F: Fn(A) -> Result<R, E> + Sync,
    {
        let total = args.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let (tx, rx) = bounded::<Completion<R>>(total);
        let task = &task;

        thread::scope(|scope| {
            let mut pending = args.into_iter().enumerate();
            let mut handles = Vec::with_capacity(total);
            let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
            let mut failure: Option<WorkerError> = None;
            let mut in_flight = 0usize;

            let dispatch = |index: usize, arg: A, handles: &mut Vec<_>| -> Result<(), WorkerError> {
                let tx = tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("trajpar-worker-{index}"))
                    .spawn_scoped(scope, move || run_task(index, arg, task, tx))
                    .map_err(|e| WorkerError::InitFailed {
                        id: index,
                        reason: e.to_string(),
                    })?;
                handles.push(handle);
                Ok(())
            };

            // Fill every slot
            while in_flight < self.workers {
                let Some((index, arg)) = pending.next() else {
                    break;
                };
                match dispatch(index, arg, &mut handles) {
                    Ok(()) => in_flight += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            debug!(workers = self.workers, tasks = total, "Dispatched initial tasks");

            // Refill a slot per completion until done or failed
            while in_flight > 0 {
                let Ok((index, outcome)) = rx.recv() else {
                    failure.get_or_insert(WorkerError::ResultChannelClosed);
                    break;
                };
                in_flight -= 1;

                match outcome {
                    Ok(result) => slots[index] = Some(result),
                    Err(message) => {
                        error!(index, error = %message, "Task failed");
                        let lower = match &failure {
                            Some(WorkerError::TaskFailed { index: prev, .. }) => index < *prev,
                            Some(_) => false,
                            None => true,
                        };
                        if lower {
                            failure = Some(WorkerError::TaskFailed { index, message });
                        }
                    }
                }

                if failure.is_none() {
                    if let Some((index, arg)) = pending.next() {
                        match dispatch(index, arg, &mut handles) {
                            Ok(()) => in_flight += 1,
                            Err(e) => failure = Some(e),
                        }
                    }
                }
            }

            for handle in handles {
                // Panics were caught inside the task
                let _ = handle.join();
            }

            if let Some(err) = failure {
                return Err(err);
            }
            slots
                .into_iter()
                .collect::<Option<Vec<R>>>()
                .ok_or(WorkerError::ResultChannelClosed)
        })
    }
}

fn run_task<A, R, E, F>(index: usize, arg: A, task: &F, tx: Sender<Completion<R>>)
where
    E: fmt::Display,
    F: Fn(A) -> Result<R, E>,
{
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task(arg))) {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    };
    // The receiver outlives every task inside the scope
    let _ = tx.send((index, outcome));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
