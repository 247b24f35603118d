//! Schedulers
//!
//! A scheduler decides when a watch effect (or a computed re-evaluation)
//! runs after a dependency fired. Scheduling is cooperative deferral, not
//! extra parallelism: without a scheduler every notification is handled
//! synchronously on the thread that produced it.
//!
//! # Provided Schedulers
//!
//! - [`Immediate`]: run the task right away on the calling thread. This is
//!   what a watch does when no scheduler is configured.
//! - [`QueueScheduler`]: park tasks until the owner drains them with
//!   [`QueueScheduler::run_pending`]. Task failures surface there.
//! - [`TokioScheduler`]: hand tasks to a tokio runtime. Nobody is left to
//!   return a failure to, so failures are logged.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::ReactiveError;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() -> Result<(), ReactiveError> + Send>;

/// Decides when deferred work runs.
pub trait Scheduler: Send + Sync {
    /// Run `task` now or enqueue it.
    ///
    /// A scheduler that runs the task inline returns its result; a deferring
    /// scheduler returns `Ok(())` and reports the outcome elsewhere.
    fn schedule(&self, task: Task) -> Result<(), ReactiveError>;
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl Scheduler for Immediate {
    fn schedule(&self, task: Task) -> Result<(), ReactiveError> {
        task()
    }
}

/// A manually drained FIFO queue of tasks.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl QueueScheduler {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run queued tasks, including tasks enqueued while draining, until the
    /// queue is empty.
    ///
    /// Stops at the first failing task and returns its error; tasks behind
    /// it stay queued. Returns the number of tasks run.
    pub fn run_pending(&self) -> Result<usize, ReactiveError> {
        let mut ran = 0;
        loop {
            // Never hold the queue lock while a task runs: tasks may schedule.
            let next = self.queue.lock().pop_front();
            let Some(task) = next else {
                return Ok(ran);
            };
            ran += 1;
            task()?;
        }
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, task: Task) -> Result<(), ReactiveError> {
        self.queue.lock().push_back(task);
        Ok(())
    }
}

impl fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Spawns every task onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Schedule onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule onto the runtime the caller is running in.
    pub fn current() -> Result<Self, ReactiveError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| ReactiveError::NoRuntime("TokioScheduler"))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) -> Result<(), ReactiveError> {
        self.handle.spawn(async move {
            if let Err(err) = task() {
                tracing::error!(error = %err, "scheduled task failed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    fn counting_task(counter: &Arc<AtomicI32>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn immediate_runs_inline() {
        let counter = Arc::new(AtomicI32::new(0));
        Immediate.schedule(counting_task(&counter)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_defers_until_drained() {
        let queue = QueueScheduler::new();
        let counter = Arc::new(AtomicI32::new(0));

        queue.schedule(counting_task(&counter)).unwrap();
        queue.schedule(counting_task(&counter)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 2);

        assert_eq!(queue.run_pending().unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn queue_stops_at_failure() {
        let queue = QueueScheduler::new();
        let counter = Arc::new(AtomicI32::new(0));

        queue
            .schedule(Box::new(|| Err(ReactiveError::observer(anyhow::anyhow!("tick failed")))))
            .unwrap();
        queue.schedule(counting_task(&counter)).unwrap();

        assert!(queue.run_pending().is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 1);

        assert_eq!(queue.run_pending().unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tokio_scheduler_spawns() {
        let scheduler = TokioScheduler::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler
            .schedule(Box::new(move || {
                let _ = tx.send(42);
                Ok(())
            }))
            .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }
}
