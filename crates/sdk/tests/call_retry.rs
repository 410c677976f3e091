//! Retry behavior of intercepted calls and of the retry state machine.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use lodestar_sdk::{
    ExponentialBackoff, FixedBackoff, RetryInterceptor, RetryScheduler, RetryState,
    call::{CallOptions, Channel, ClientCall, InterceptedChannel, MethodDescriptor, MethodType},
    mock::{CallScript, RecordingCallListener, ScriptedChannel},
};
use lodestar_test_utils::assert_never;
use tokio::runtime::Handle;
use tonic::{Code, Status, metadata::MetadataMap};

const WAIT: Duration = Duration::from_secs(5);

fn scheduler() -> RetryScheduler {
    RetryScheduler::from_handle(Handle::current())
}

fn unary_call(channel: &dyn Channel) -> (Arc<dyn ClientCall>, Arc<RecordingCallListener>) {
    let listener = Arc::new(RecordingCallListener::new());
    let call = channel.new_call(
        &MethodDescriptor::new("search.v1.Search/Query", MethodType::Unary),
        &CallOptions::default(),
    );
    call.start(listener.clone(), MetadataMap::new());
    call.request(1);
    call.send_message(Bytes::from_static(b"query"));
    call.half_close();
    (call, listener)
}

#[tokio::test]
async fn test_retry_state_with_two_retries() {
    let runs = Arc::new(AtomicUsize::new(0));
    let state = RetryState::new(scheduler()).with_max_retries(2);

    let mut permitted = Vec::new();
    let mut current = state;
    for _ in 0..3 {
        permitted.push(current.can_retry());
        if current.can_retry() {
            let runs = Arc::clone(&runs);
            current = current.retry(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
    }

    assert_eq!(permitted, vec![true, true, false]);
    assert!(
        lodestar_test_utils::assert_eventually(WAIT, || runs.load(Ordering::SeqCst) == 2).await
    );
}

#[tokio::test]
async fn test_cancelled_retry_never_executes() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let state = RetryState::new(scheduler()).with_backoff(FixedBackoff::new(Duration::from_millis(30)));

    let pending = state.retry(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    pending.cancel();

    assert!(assert_never(Duration::from_millis(150), || runs.load(Ordering::SeqCst) > 0).await);
}

#[tokio::test]
async fn test_intercepted_call_recovers_from_restarting_server() {
    let base = Arc::new(
        ScriptedChannel::new("search")
            .with_script(CallScript::fail(Status::unavailable("connection refused")))
            .with_script(CallScript::fail(Status::unavailable("connection refused")))
            .with_script(CallScript::respond(Bytes::from_static(b"results"))),
    );
    let backoff = ExponentialBackoff::builder()
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .jitter(0.0)
        .build()
        .unwrap();
    let state = RetryState::new(scheduler()).with_backoff(backoff).with_max_retries(3);
    let channel = InterceptedChannel::new(base.clone(), Arc::new(RetryInterceptor::new(state)));

    let (_call, listener) = unary_call(&channel);

    let status = listener.wait_for_close(WAIT).await.unwrap();
    assert_eq!(status.code(), Code::Ok);
    assert_eq!(listener.messages(), vec![Bytes::from_static(b"results")]);
    assert_eq!(base.call_count(), 3);
    assert_eq!(listener.close_count(), 1);
}

#[tokio::test]
async fn test_retry_budget_is_per_call() {
    let base = Arc::new(
        ScriptedChannel::new("search")
            .with_script(CallScript::fail(Status::unavailable("down")))
            .with_script(CallScript::respond(Bytes::from_static(b"first")))
            .with_script(CallScript::fail(Status::unavailable("down")))
            .with_script(CallScript::respond(Bytes::from_static(b"second"))),
    );
    let interceptor = RetryInterceptor::new(RetryState::new(scheduler()).with_max_retries(1));
    let channel = InterceptedChannel::new(base.clone(), Arc::new(interceptor));

    let (_first, first) = unary_call(&channel);
    assert_eq!(first.wait_for_close(WAIT).await.unwrap().code(), Code::Ok);
    let (_second, second) = unary_call(&channel);
    assert_eq!(second.wait_for_close(WAIT).await.unwrap().code(), Code::Ok);

    assert_eq!(second.messages(), vec![Bytes::from_static(b"second")]);
    assert_eq!(base.call_count(), 4);
}
