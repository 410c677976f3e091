//! Polling assertions for async tests.
//!
//! Callback-driven code delivers on its own tasks, so tests poll for the
//! expected state instead of sleeping a fixed amount.

use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep};

/// Polling interval shared by the helpers below.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it returns true or `timeout` expires.
///
/// Returns `true` if the condition held before the deadline. The condition is
/// checked one final time after the deadline.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use lodestar_test_utils::assert_eventually;
///
/// #[tokio::test]
/// async fn test_flag_is_set() {
///     let flag = Arc::new(AtomicBool::new(false));
///     let setter = flag.clone();
///     tokio::spawn(async move { setter.store(true, Ordering::SeqCst) });
///
///     assert!(assert_eventually(Duration::from_millis(200), || flag.load(Ordering::SeqCst)).await);
/// }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition()
}

/// Like [`assert_eventually`] for conditions that must await, such as a
/// registry read.
pub async fn assert_eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition().await
}

/// Checks that `condition` stays false for the whole of `window`.
///
/// Returns `false` as soon as the condition is observed true.
pub async fn assert_never<F>(window: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if condition() {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
    !condition()
}
