//! Fixed-size worker pool with a bounded queue and caller-runs overflow.

use super::FaultSlot;
use crate::errors::IndexflowError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// A unit of work accepted by a pool.
pub type Task = Box<dyn FnOnce() -> Result<(), IndexflowError> + Send + 'static>;

/// Queue slots per worker thread.
pub const QUEUE_SLOTS_PER_WORKER: usize = 3;

/// A pool of persistent OS threads fed through a bounded queue.
///
/// When the queue is full the submitting thread runs the task itself, which
/// throttles producers to the speed of the workers. Errors and panics from
/// tasks never reach the thread that ran them; they are captured in the
/// pool's [`FaultSlot`] and surfaced by [`WorkerPool::check_and_raise`].
///
/// A pool of size 0 is a null pool: every task runs inline before `submit`
/// returns.
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    faults: Arc<FaultSlot>,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool with `size` workers and a queue of `3 × size` slots.
    ///
    /// Workers inherit the calling thread's tracing dispatcher.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self, IndexflowError> {
        let name = name.into();
        if size == 0 {
            return Ok(Self::null(name));
        }

        let (sender, receiver) = bounded::<Task>(size * QUEUE_SLOTS_PER_WORKER);
        let faults = Arc::new(FaultSlot::new());
        let dispatch = tracing::dispatcher::get_default(tracing::Dispatch::clone);

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let faults = faults.clone();
            let pool_name = name.clone();
            let dispatch = dispatch.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        worker_loop(&pool_name, &receiver, &faults);
                    });
                })
                .map_err(|e| {
                    IndexflowError::Internal(format!("failed to spawn worker for pool '{name}': {e}"))
                })?;
            workers.push(handle);
        }

        debug!(pool = %name, size, queue_capacity = size * QUEUE_SLOTS_PER_WORKER, "Worker pool started");

        Ok(Self {
            name,
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            faults,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Creates a null pool that runs every task on the caller.
    #[must_use]
    pub fn null(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            faults: Arc::new(FaultSlot::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Submits a task.
    ///
    /// Runs the task on the calling thread if this is a null pool or the
    /// queue is full. Task failures are captured, not returned.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` if the pool has been shut down.
    pub fn submit<F>(&self, task: F) -> Result<(), IndexflowError>
    where
        F: FnOnce() -> Result<(), IndexflowError> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(self.shut_down_error());
        }
        if self.size == 0 {
            run_captured(&self.name, Box::new(task), &self.faults);
            return Ok(());
        }

        let Some(sender) = self.sender.lock().clone() else {
            return Err(self.shut_down_error());
        };

        match sender.try_send(Box::new(task)) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                trace!(pool = %self.name, "Queue full, running task on caller");
                run_captured(&self.name, task, &self.faults);
            }
            Err(TrySendError::Disconnected(task)) => {
                warn!(pool = %self.name, "All workers have exited, running task on caller");
                run_captured(&self.name, task, &self.faults);
            }
        }
        Ok(())
    }

    /// Re-raises the first fault captured by any task of this pool.
    ///
    /// # Errors
    ///
    /// Returns the captured fault.
    pub fn check_and_raise(&self) -> Result<(), IndexflowError> {
        self.faults.check_and_raise()
    }

    /// Returns the pool's fault slot.
    #[must_use]
    pub fn fault_slot(&self) -> &Arc<FaultSlot> {
        &self.faults
    }

    /// Stops accepting work and waits for queued and running tasks.
    ///
    /// With a timeout, workers still busy at the deadline are logged and
    /// detached. Returns the time spent waiting. Calling this again is a
    /// no-op.
    pub fn shutdown_and_wait(&self, timeout: Option<Duration>) -> Duration {
        let start = Instant::now();
        self.shut_down.store(true, Ordering::SeqCst);
        drop(self.sender.lock().take());

        let mut pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if pending.is_empty() {
            return start.elapsed();
        }

        match timeout {
            None => {
                for handle in pending {
                    if handle.join().is_err() {
                        warn!(pool = %self.name, "Worker thread terminated abnormally");
                    }
                }
            }
            Some(limit) => {
                let deadline = start + limit;
                loop {
                    let (finished, running): (Vec<_>, Vec<_>) =
                        pending.into_iter().partition(JoinHandle::is_finished);
                    for handle in finished {
                        if handle.join().is_err() {
                            warn!(pool = %self.name, "Worker thread terminated abnormally");
                        }
                    }
                    pending = running;
                    if pending.is_empty() {
                        break;
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            pool = %self.name,
                            remaining = pending.len(),
                            timeout_ms = limit.as_millis(),
                            "Timed out waiting for workers, detaching"
                        );
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }

        let elapsed = start.elapsed();
        debug!(pool = %self.name, elapsed_ms = elapsed.as_millis(), "Worker pool drained");
        elapsed
    }

    /// Returns the pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true for a null pool.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.size == 0
    }

    /// Returns the queue capacity.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.size * QUEUE_SLOTS_PER_WORKER
    }

    /// Returns the number of tasks waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, Sender::len)
    }

    /// Returns true once `shutdown_and_wait` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn shut_down_error(&self) -> IndexflowError {
        IndexflowError::usage(format!("submit called on pool '{}' after shutdown", self.name))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets workers finish what is queued and exit.
        self.sender.get_mut().take();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("queue_len", &self.queue_len())
            .field("shut_down", &self.is_shut_down())
            .field("has_fault", &self.faults.has_fault())
            .finish()
    }
}

fn worker_loop(pool: &str, receiver: &Receiver<Task>, faults: &FaultSlot) {
    for task in receiver {
        run_captured(pool, task, faults);
    }
    trace!(pool, "Worker exiting");
}

fn run_captured(pool: &str, task: Task, faults: &FaultSlot) {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            faults.record(err);
        }
        Err(payload) => {
            faults.record(IndexflowError::TaskPanicked {
                pool: pool.to_string(),
                message: panic_message(payload.as_ref()),
            });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
