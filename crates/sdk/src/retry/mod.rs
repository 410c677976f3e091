//! Immutable retry state machine.
//!
//! [`RetryState`] is a persistent value: every operation that changes it
//! returns a new state and leaves the original untouched, so callers thread
//! the returned value through their own state. The state decides *whether* to
//! retry ([`RetryLimit`]), *when* ([`Backoff`]) and *where* the retry runs
//! ([`RetryScheduler`]).
//!
//! ```no_run
//! use lodestar_sdk::retry::RetryState;
//!
//! # fn example() -> std::io::Result<()> {
//! let state = RetryState::create_default()?.with_max_retries(3);
//! let mut state = state;
//! while state.can_retry() {
//!     state = state.retry(|| println!("retrying"));
//! }
//! # Ok(())
//! # }
//! ```

mod backoff;
mod scheduler;

use std::{fmt, sync::Arc};

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff, FnBackoff, Immediate, backoff_fn};
pub use scheduler::{RetryScheduler, TaskHandle};
use tracing::debug;

/// Hook run synchronously before each retry is submitted.
pub type BeforeRetry = Arc<dyn Fn() + Send + Sync>;

/// How many retries a [`RetryState`] permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// At most this many retries. `Limited(0)` disables retrying.
    Limited(u32),
    /// No limit.
    Unlimited,
}

impl RetryLimit {
    /// Returns whether `retry_count` retries leave room for another one.
    #[must_use]
    pub fn permits(self, retry_count: u32) -> bool {
        match self {
            Self::Limited(max) => retry_count < max,
            Self::Unlimited => true,
        }
    }
}

impl From<i32> for RetryLimit {
    /// Zero means no retries, a negative value means unlimited.
    fn from(max_retries: i32) -> Self {
        u32::try_from(max_retries).map_or(Self::Unlimited, Self::Limited)
    }
}

impl fmt::Display for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(max) => write!(f, "{max}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Retry bookkeeping for one logical operation.
#[derive(Clone)]
pub struct RetryState {
    backoff: Arc<dyn Backoff>,
    limit: RetryLimit,
    retry_count: u32,
    scheduler: RetryScheduler,
    before_retry: Option<BeforeRetry>,
    pending: Option<TaskHandle>,
}

impl fmt::Debug for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryState")
            .field("backoff", &self.backoff)
            .field("limit", &self.limit)
            .field("retry_count", &self.retry_count)
            .field("scheduler", &self.scheduler.name())
            .field("before_retry", &self.before_retry.is_some())
            .field("pending", &self.pending)
            .finish()
    }
}

impl RetryState {
    /// Creates a state with immediate backoff, one permitted retry and no
    /// hook, running retries on the process-wide scheduler.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the shared scheduler cannot be started.
    pub fn create_default() -> std::io::Result<Self> {
        Ok(Self::new(RetryScheduler::shared()?))
    }

    /// Creates a state with immediate backoff and one permitted retry on
    /// `scheduler`.
    #[must_use]
    pub fn new(scheduler: RetryScheduler) -> Self {
        Self {
            backoff: Arc::new(Immediate),
            limit: RetryLimit::Limited(1),
            retry_count: 0,
            scheduler,
            before_retry: None,
            pending: None,
        }
    }

    /// Returns a copy using `backoff`.
    #[must_use]
    pub fn with_backoff(&self, backoff: impl Backoff + 'static) -> Self {
        Self { backoff: Arc::new(backoff), ..self.clone() }
    }

    /// Returns a copy permitting `max_retries` retries; zero disables retrying
    /// and a negative value removes the limit.
    #[must_use]
    pub fn with_max_retries(&self, max_retries: i32) -> Self {
        Self { limit: RetryLimit::from(max_retries), ..self.clone() }
    }

    /// Returns a copy without a retry limit.
    #[must_use]
    pub fn retry_forever(&self) -> Self {
        Self { limit: RetryLimit::Unlimited, ..self.clone() }
    }

    /// Returns a copy running retries on `scheduler`.
    #[must_use]
    pub fn with_scheduler(&self, scheduler: RetryScheduler) -> Self {
        Self { scheduler, ..self.clone() }
    }

    /// Returns a copy running `hook` before each retry.
    #[must_use]
    pub fn with_before_retry(&self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self { before_retry: Some(Arc::new(hook)), ..self.clone() }
    }

    /// Returns whether another retry is permitted.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.limit.permits(self.retry_count)
    }

    /// Returns the number of retries issued so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns the configured limit.
    #[must_use]
    pub fn limit(&self) -> RetryLimit {
        self.limit
    }

    /// Returns the handle of the most recently issued retry.
    #[must_use]
    pub fn pending(&self) -> Option<&TaskHandle> {
        self.pending.as_ref()
    }

    /// Issues a retry of `action`.
    ///
    /// Cancels any retry this state still holds, runs the before-retry hook,
    /// then submits `action` after the backoff delay for the current count.
    /// Returns the successor state holding the new task. The count is not
    /// advanced when retries are disabled.
    ///
    /// Callers are expected to check [`can_retry`](Self::can_retry) first.
    #[must_use = "the returned state holds the pending retry"]
    pub fn retry(&self, action: impl FnOnce() + Send + 'static) -> Self {
        self.cancel();
        if let Some(hook) = &self.before_retry {
            hook();
        }

        let delay = self.backoff.delay(self.retry_count);
        let handle = if delay.is_zero() {
            self.scheduler.submit(action)
        } else {
            self.scheduler.schedule(delay, action)
        };
        debug!(
            retry = self.retry_count.saturating_add(1),
            limit = %self.limit,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );

        let retry_count = match self.limit {
            RetryLimit::Limited(0) => 0,
            _ => self.retry_count.saturating_add(1),
        };
        Self { retry_count, pending: Some(handle), ..self.clone() }
    }

    /// Cancels the pending retry, if any. Idempotent.
    pub fn cancel(&self) {
        if let Some(pending) = &self.pending {
            pending.cancel();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use lodestar_test_utils::{Recorder, assert_eventually};
    use tokio::runtime::Handle;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&runs);
        let make = move || -> Box<dyn FnOnce() + Send> {
            let runs = Arc::clone(&shared);
            Box::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        (runs, make)
    }

    #[test]
    fn test_retry_limit_from_i32() {
        assert_eq!(RetryLimit::from(0), RetryLimit::Limited(0));
        assert_eq!(RetryLimit::from(3), RetryLimit::Limited(3));
        assert_eq!(RetryLimit::from(-1), RetryLimit::Unlimited);
        assert_eq!(RetryLimit::from(i32::MIN), RetryLimit::Unlimited);
        assert_eq!(RetryLimit::Unlimited.to_string(), "unlimited");
    }

    #[tokio::test]
    async fn test_max_retries_two_permits_exactly_two() {
        let (runs, action) = counter();
        let mut state = RetryState::new(RetryScheduler::from_handle(Handle::current())).with_max_retries(2);

        let mut issued = 0;
        while state.can_retry() {
            state = state.retry(action());
            issued += 1;
        }

        assert_eq!(issued, 2);
        assert_eq!(state.retry_count(), 2);
        assert!(assert_eventually(Duration::from_secs(1), || runs.load(Ordering::SeqCst) == 2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_retry_prevents_execution() {
        let (runs, action) = counter();
        let state = RetryState::new(RetryScheduler::from_handle(Handle::current()))
            .with_backoff(FixedBackoff::new(Duration::from_secs(1)));

        let next = state.retry(action());
        next.cancel();
        next.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(next.pending().unwrap().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancels_previous_pending() {
        let (runs, action) = counter();
        let state = RetryState::new(RetryScheduler::from_handle(Handle::current()))
            .with_max_retries(5)
            .with_backoff(FixedBackoff::new(Duration::from_secs(1)));

        let first = state.retry(action());
        let second = first.retry(action());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(first.pending().unwrap().is_cancelled());
        assert!(!second.pending().unwrap().is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_receives_retry_count() {
        let seen = Recorder::new();
        let recorder = seen.clone();
        let mut state = RetryState::new(RetryScheduler::from_handle(Handle::current()))
            .with_max_retries(3)
            .with_backoff(backoff_fn(move |attempt| {
                recorder.push(attempt);
                Duration::from_millis(10)
            }));

        while state.can_retry() {
            state = state.retry(|| {});
        }

        assert_eq!(seen.snapshot(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_states_are_persistent() {
        let base = RetryState::new(RetryScheduler::from_handle(Handle::current()));
        let forever = base.retry_forever();
        let retried = forever.retry(|| {});

        assert_eq!(base.limit(), RetryLimit::Limited(1));
        assert_eq!(base.retry_count(), 0);
        assert!(base.pending().is_none());
        assert_eq!(forever.retry_count(), 0);
        assert_eq!(retried.retry_count(), 1);
        assert!(retried.can_retry());
    }

    #[tokio::test]
    async fn test_zero_limit_never_advances() {
        let (runs, action) = counter();
        let state = RetryState::new(RetryScheduler::from_handle(Handle::current())).with_max_retries(0);
        assert!(!state.can_retry());

        let next = state.retry(action());
        assert_eq!(next.retry_count(), 0);
        assert!(assert_eventually(Duration::from_secs(1), || runs.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn test_unlimited_count_saturates() {
        let (runs, action) = counter();
        let state = RetryState::new(RetryScheduler::from_handle(Handle::current())).retry_forever();
        let state = RetryState { retry_count: u32::MAX, ..state };

        let next = state.retry(action());

        assert_eq!(next.retry_count(), u32::MAX);
        assert!(next.can_retry());
        assert!(assert_eventually(Duration::from_secs(1), || runs.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn test_hook_runs_before_action() {
        let order = Recorder::new();
        let hook_order = order.clone();
        let action_order = order.clone();
        let state = RetryState::new(RetryScheduler::from_handle(Handle::current()))
            .with_before_retry(move || hook_order.push("hook"));

        let _next = state.retry(move || action_order.push("action"));

        assert!(order.wait_for_count(2, Duration::from_secs(1)).await);
        assert_eq!(order.snapshot(), vec!["hook", "action"]);
    }

    #[test]
    fn test_create_default() {
        let state = RetryState::create_default().unwrap();
        assert!(state.can_retry());
        assert_eq!(state.limit(), RetryLimit::Limited(1));
        assert!(format!("{state:?}").contains("lodestar-retry"));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn prop_limited_state_permits_exactly_max_retries(max in 0i32..16) {
            let scheduler = RetryScheduler::shared().unwrap();
            let mut state = RetryState::new(scheduler).with_max_retries(max);

            let mut issued = 0;
            while state.can_retry() {
                state = state.retry(|| {});
                issued += 1;
            }

            prop_assert_eq!(issued, max);
            prop_assert_eq!(state.retry_count(), u32::try_from(max).unwrap());
        }

        #[test]
        fn prop_negative_limit_is_unlimited(max in i32::MIN..0, count in 0u32..10_000) {
            let limit = RetryLimit::from(max);
            prop_assert!(limit.permits(count));
        }
    }
}
