//! Execution context for retry actions.

use std::{
    sync::{Arc, OnceLock},
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// Thread name of the process-wide scheduler.
const SHARED_SCHEDULER_NAME: &str = "lodestar-retry";

static SHARED: OnceLock<RetryScheduler> = OnceLock::new();

/// Handle to one submitted retry action.
///
/// Cancelling is idempotent and never fails. A cancelled action that has not
/// started will not run.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    /// Cancels the action if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns whether the action was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs retry actions, immediately or after a delay.
///
/// Either owns a single-threaded runtime on a named background thread
/// ([`start`](Self::start)) or borrows an existing runtime
/// ([`from_handle`](Self::from_handle)). Clones share the same context.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    name: String,
    handle: Handle,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RetryScheduler {
    /// Starts a scheduler with its own runtime on a thread named `name`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the runtime or the thread cannot be created.
    pub fn start(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            runtime.block_on(stop.cancelled());
        })?;

        debug!(scheduler = %name, "Retry scheduler started");
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                name,
                handle,
                shutdown,
                tracker: TaskTracker::new(),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Creates a scheduler that runs actions on an existing runtime.
    #[must_use]
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                name: "external".to_owned(),
                handle,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Returns the process-wide scheduler, starting it on first use.
    ///
    /// Shutting the shared scheduler down is final for the process.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the scheduler has to be started and cannot be.
    pub fn shared() -> std::io::Result<Self> {
        if let Some(shared) = SHARED.get() {
            return Ok(shared.clone());
        }
        let candidate = Self::start(SHARED_SCHEDULER_NAME)?;
        match SHARED.set(candidate.clone()) {
            Ok(()) => Ok(candidate),
            Err(rejected) => {
                // Lost the race against another initializer.
                rejected.shutdown();
                Ok(SHARED.get().cloned().unwrap_or(rejected))
            },
        }
    }

    /// Installs `scheduler` as the process-wide scheduler.
    ///
    /// # Errors
    ///
    /// Returns the scheduler back if a shared scheduler already exists.
    pub fn install_shared(scheduler: Self) -> Result<(), Self> {
        SHARED.set(scheduler)
    }

    /// Returns the scheduler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Returns the number of actions submitted but not yet finished.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Runs `action` as soon as possible.
    pub fn submit(&self, action: impl FnOnce() + Send + 'static) -> TaskHandle {
        self.schedule(Duration::ZERO, action)
    }

    /// Runs `action` after `delay`.
    ///
    /// After shutdown the action is dropped and the returned handle is already
    /// cancelled.
    pub fn schedule(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> TaskHandle {
        let token = self.inner.shutdown.child_token();
        let handle = TaskHandle { token: token.clone() };
        if self.is_shut_down() {
            warn!(scheduler = %self.inner.name, "Retry scheduler is shut down; dropping action");
            return handle;
        }

        self.inner.tracker.spawn_on(
            async move {
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return,
                        () = tokio::time::sleep(delay) => {},
                    }
                }
                if !token.is_cancelled() {
                    action();
                }
            },
            &self.inner.handle,
        );
        handle
    }

    /// Cancels every pending action and stops the background thread, if any.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!(scheduler = %self.inner.name, "Retry scheduler thread panicked");
            }
            debug!(scheduler = %self.inner.name, "Retry scheduler stopped");
        }
    }

    /// Waits until every submitted action has finished or been cancelled.
    ///
    /// Only returns after [`shutdown`](Self::shutdown).
    pub async fn drained(&self) {
        self.inner.tracker.wait().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    use lodestar_test_utils::{assert_eventually, assert_never};

    use super::*;

    #[tokio::test]
    async fn test_submit_runs_action() {
        let scheduler = RetryScheduler::from_handle(Handle::current());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        scheduler.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(assert_eventually(Duration::from_secs(1), || runs.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_waits_for_delay() {
        let scheduler = RetryScheduler::from_handle(Handle::current());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        scheduler.schedule(Duration::from_secs(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_never_runs() {
        let scheduler = RetryScheduler::from_handle(Handle::current());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = scheduler.schedule(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        handle.cancel();

        assert!(handle.is_cancelled());
        assert!(assert_never(Duration::from_millis(100), || runs.load(Ordering::SeqCst) > 0).await);
    }

    #[test]
    fn test_dedicated_thread_runs_actions() {
        let scheduler = RetryScheduler::start("test-retry").unwrap();
        let (tx, rx) = mpsc::channel();

        scheduler.schedule(Duration::from_millis(5), move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        });

        let thread_name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(thread_name.as_deref(), Some("test-retry"));
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
    }

    #[test]
    fn test_shutdown_cancels_pending_actions() {
        let scheduler = RetryScheduler::start("test-retry-shutdown").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = scheduler.schedule(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.shutdown();

        assert!(handle.is_cancelled());
        let late = scheduler.submit(|| {});
        assert!(late.is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shared_scheduler_is_reused() {
        let a = RetryScheduler::shared().unwrap();
        let b = RetryScheduler::shared().unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(a.name(), SHARED_SCHEDULER_NAME);
    }
}
