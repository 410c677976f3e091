//! Delivery recorder for callback-driven tests.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Collects values pushed from callbacks and lets a test wait for them.
///
/// Clones share the same buffer, so one clone can be moved into a callback
/// while the test keeps another.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use lodestar_test_utils::Recorder;
///
/// # async fn example() {
/// let recorder = Recorder::new();
/// let sink = recorder.clone();
/// tokio::spawn(async move { sink.push(42) });
///
/// assert!(recorder.wait_for_count(1, Duration::from_secs(1)).await);
/// assert_eq!(recorder.snapshot(), vec![42]);
/// # }
/// ```
#[derive(Debug)]
pub struct Recorder<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    values: Mutex<Vec<T>>,
    pushed: Notify,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self { inner: Arc::new(Inner { values: Mutex::new(Vec::new()), pushed: Notify::new() }) }
    }
}

impl<T> Recorder<T> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value and wakes waiters.
    pub fn push(&self, value: T) {
        self.inner.values.lock().push(value);
        self.inner.pushed.notify_waiters();
    }

    /// Returns the number of recorded values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.values.lock().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.inner.values.lock())
    }

    /// Waits until at least `count` values were recorded.
    ///
    /// Returns `false` if `timeout` expires first.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let mut notified = std::pin::pin!(self.inner.pushed.notified());
                notified.as_mut().enable();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl<T: Clone> Recorder<T> {
    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.values.lock().clone()
    }

    /// Returns the most recent value.
    #[must_use]
    pub fn last(&self) -> Option<T> {
        self.inner.values.lock().last().cloned()
    }
}
