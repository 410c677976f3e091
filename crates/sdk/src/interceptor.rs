//! Transparent retry of calls that fail with `UNAVAILABLE`.
//!
//! Each wrapped call moves through
//!
//! ```text
//! AwaitingFirstAttempt ──► Active ◄──► RetryScheduled
//!                            │               │
//!                            └──► Terminated ◄┘
//! ```
//!
//! The wrapper records the caller's headers, flow-control requests, single
//! request message and half-close, and replays them on a fresh call from the
//! same channel when an attempt closes with `UNAVAILABLE` before any response
//! message arrived. The caller's listener sees exactly one close.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tonic::{Code, Status, metadata::MetadataMap};
use tracing::{debug, warn};

use crate::{
    call::{CallListener, CallOptions, Channel, ClientCall, ClientInterceptor, MethodDescriptor},
    retry::RetryState,
};

/// Retries single-request calls that fail with `UNAVAILABLE`.
///
/// Client-streaming and bidirectional calls pass through untouched.
#[derive(Debug, Clone)]
pub struct RetryInterceptor {
    state: RetryState,
}

impl RetryInterceptor {
    /// Creates an interceptor; every call starts from a copy of `state`.
    #[must_use]
    pub fn new(state: RetryState) -> Self {
        Self { state }
    }

    /// Creates an interceptor with [`RetryState::create_default`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the shared retry scheduler cannot be started.
    pub fn create_default() -> std::io::Result<Self> {
        Ok(Self::new(RetryState::create_default()?))
    }

    /// Returns the state each call starts from.
    #[must_use]
    pub fn state(&self) -> &RetryState {
        &self.state
    }
}

impl ClientInterceptor for RetryInterceptor {
    fn intercept_call(
        &self,
        method: &MethodDescriptor,
        options: &CallOptions,
        next: Arc<dyn Channel>,
    ) -> Arc<dyn ClientCall> {
        if !method.method_type().client_sends_one_message() {
            return next.new_call(method, options);
        }
        Arc::new(RetryingCall {
            shared: Arc::new(CallShared {
                method: method.clone(),
                options: options.clone(),
                next,
                inner: Mutex::new(CallInner::new(self.state.clone())),
            }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingFirstAttempt,
    /// The attempt's call is being started; caller operations are recorded
    /// and forwarded once the start completes.
    Starting,
    Active,
    RetryScheduled,
    Terminated,
}

struct CallInner {
    phase: Phase,
    /// Number of the attempt events are accepted from.
    attempt: u64,
    current: Option<Arc<dyn ClientCall>>,
    retry: RetryState,
    /// Set while the successor retry state is being computed outside the lock.
    arming: bool,
    /// A replay fired before the successor state was stored.
    replay_due: bool,
    /// Close of the attempt that triggered the pending retry.
    last_failure: Option<(Status, MetadataMap)>,
    listener: Option<Arc<dyn CallListener>>,
    headers: MetadataMap,
    message: Option<Bytes>,
    requested: usize,
    half_closed: bool,
    received_response: bool,
    cancel_reason: Option<String>,
}

impl CallInner {
    fn new(retry: RetryState) -> Self {
        Self {
            phase: Phase::AwaitingFirstAttempt,
            attempt: 0,
            current: None,
            retry,
            arming: false,
            replay_due: false,
            last_failure: None,
            listener: None,
            headers: MetadataMap::new(),
            message: None,
            requested: 0,
            half_closed: false,
            received_response: false,
            cancel_reason: None,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel_reason.is_some()
    }

    fn active_call(&self) -> Option<Arc<dyn ClientCall>> {
        match self.phase {
            Phase::Active => self.current.clone(),
            _ => None,
        }
    }

    fn accepts(&self, attempt: u64) -> bool {
        matches!(self.phase, Phase::Starting | Phase::Active) && self.attempt == attempt
    }

    fn should_retry(&self, status: &Status) -> bool {
        status.code() == Code::Unavailable
            && !self.received_response
            && !self.cancelled()
            && self.retry.can_retry()
    }
}

/// What a starting attempt has already been sent.
#[derive(Default)]
struct Forwarded {
    requested: usize,
    message: bool,
    half_closed: bool,
}

/// Caller operations a starting attempt has not seen yet.
struct CatchUp {
    request: usize,
    message: Option<Bytes>,
    half_close: bool,
}

impl CatchUp {
    fn is_empty(&self) -> bool {
        self.request == 0 && self.message.is_none() && !self.half_close
    }

    fn apply(self, call: &dyn ClientCall) {
        if self.request > 0 {
            call.request(self.request);
        }
        if let Some(message) = self.message {
            call.send_message(message);
        }
        if self.half_close {
            call.half_close();
        }
    }
}

impl Forwarded {
    fn catch_up(&mut self, inner: &CallInner) -> CatchUp {
        let request = inner.requested.saturating_sub(self.requested);
        self.requested = inner.requested;

        let message = if self.message { None } else { inner.message.clone() };
        self.message |= message.is_some();

        let half_close = inner.half_closed && !self.half_closed;
        self.half_closed |= half_close;

        CatchUp { request, message, half_close }
    }
}

struct CallShared {
    method: MethodDescriptor,
    options: CallOptions,
    next: Arc<dyn Channel>,
    inner: Mutex<CallInner>,
}

impl CallShared {
    /// Starts `call` as attempt `attempt`, then forwards everything the caller
    /// has sent until the attempt has caught up and can go `Active`.
    fn begin_attempt(self: &Arc<Self>, attempt: u64, call: &Arc<dyn ClientCall>, headers: MetadataMap) {
        call.start(Arc::new(AttemptListener { attempt, shared: Arc::clone(self) }), headers);

        let mut forwarded = Forwarded::default();
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if inner.phase != Phase::Starting || inner.attempt != attempt {
                    return;
                }
                if let Some(reason) = inner.cancel_reason.clone() {
                    inner.phase = Phase::Active;
                    drop(inner);
                    call.cancel(&reason);
                    return;
                }
                let step = forwarded.catch_up(&inner);
                if step.is_empty() {
                    inner.phase = Phase::Active;
                    return;
                }
                step
            };
            step.apply(call.as_ref());
        }
    }

    /// Starts attempt `attempt` and replays everything the caller has sent.
    fn replay(self: &Arc<Self>, attempt: u64) {
        let (call, headers) = {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::RetryScheduled || inner.attempt != attempt || inner.cancelled() {
                return;
            }
            if inner.arming {
                inner.replay_due = true;
                return;
            }
            let call = self.next.new_call(&self.method, &self.options);
            inner.current = Some(Arc::clone(&call));
            inner.phase = Phase::Starting;
            inner.last_failure = None;
            (call, inner.headers.clone())
        };

        debug!(method = %self.method, attempt, "Replaying call");
        self.begin_attempt(attempt, &call, headers);
    }

    fn on_attempt_close(self: &Arc<Self>, attempt: u64, status: Status, trailers: MetadataMap) {
        let (listener, status, trailers) = {
            let mut inner = self.inner.lock();
            if !inner.accepts(attempt) {
                return;
            }

            if inner.should_retry(&status) {
                inner.attempt = attempt + 1;
                inner.phase = Phase::RetryScheduled;
                inner.current = None;
                inner.arming = true;
                let retry = inner.retry.clone();
                drop(inner);

                debug!(method = %self.method, attempt, message = status.message(), "Call unavailable; retrying");
                self.arm_retry(retry, attempt + 1, status, trailers);
                return;
            }

            inner.retry.cancel();
            inner.phase = Phase::Terminated;
            inner.current = None;
            (inner.listener.clone(), status, trailers)
        };

        if status.code() == Code::Unavailable {
            warn!(method = %self.method, attempt, message = status.message(), "Call unavailable; not retrying");
        }
        if let Some(listener) = listener {
            listener.on_close(status, trailers);
        }
    }

    /// Issues the retry for `attempt` outside the lock, so the before-retry
    /// hook may use the call.
    fn arm_retry(self: &Arc<Self>, retry: RetryState, attempt: u64, status: Status, trailers: MetadataMap) {
        self.inner.lock().last_failure = Some((status, trailers));

        let ticket = ReplayTicket { shared: Arc::clone(self), attempt, fired: false };
        let successor = retry.retry(move || ticket.fire());

        let mut inner = self.inner.lock();
        inner.arming = false;
        inner.retry = successor;
        if inner.phase != Phase::RetryScheduled || inner.attempt != attempt || inner.cancelled() {
            inner.retry.cancel();
            return;
        }
        if std::mem::take(&mut inner.replay_due) {
            drop(inner);
            self.replay(attempt);
        }
    }

    /// Fails the call with the last attempt's close when its retry was
    /// dropped without running.
    fn abandon_retry(&self, attempt: u64) {
        let (listener, status, trailers) = {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::RetryScheduled || inner.attempt != attempt || inner.cancelled() {
                return;
            }
            inner.phase = Phase::Terminated;
            let (status, trailers) = inner
                .last_failure
                .take()
                .unwrap_or_else(|| (Status::unavailable("retry abandoned"), MetadataMap::new()));
            (inner.listener.clone(), status, trailers)
        };

        warn!(method = %self.method, attempt, "Retry dropped by the scheduler; failing call");
        if let Some(listener) = listener {
            listener.on_close(status, trailers);
        }
    }

    fn listener_for(&self, attempt: u64) -> Option<Arc<dyn CallListener>> {
        let inner = self.inner.lock();
        if inner.accepts(attempt) { inner.listener.clone() } else { None }
    }
}

/// Scheduled replay of one attempt. Dropping it unfired fails the call.
struct ReplayTicket {
    shared: Arc<CallShared>,
    attempt: u64,
    fired: bool,
}

impl ReplayTicket {
    fn fire(mut self) {
        self.fired = true;
        self.shared.replay(self.attempt);
    }
}

impl Drop for ReplayTicket {
    fn drop(&mut self) {
        if !self.fired {
            self.shared.abandon_retry(self.attempt);
        }
    }
}

/// Receives the events of one attempt and forwards the fresh ones.
struct AttemptListener {
    attempt: u64,
    shared: Arc<CallShared>,
}

impl CallListener for AttemptListener {
    fn on_headers(&self, headers: MetadataMap) {
        if let Some(listener) = self.shared.listener_for(self.attempt) {
            listener.on_headers(headers);
        }
    }

    fn on_message(&self, message: Bytes) {
        let listener = {
            let mut inner = self.shared.inner.lock();
            if !inner.accepts(self.attempt) {
                return;
            }
            inner.received_response = true;
            inner.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_message(message);
        }
    }

    fn on_close(&self, status: Status, trailers: MetadataMap) {
        self.shared.on_attempt_close(self.attempt, status, trailers);
    }

    fn on_ready(&self) {
        if let Some(listener) = self.shared.listener_for(self.attempt) {
            listener.on_ready();
        }
    }
}

/// Call handed to the caller in place of the channel's own call.
struct RetryingCall {
    shared: Arc<CallShared>,
}

impl ClientCall for RetryingCall {
    fn start(&self, listener: Arc<dyn CallListener>, headers: MetadataMap) {
        let call = {
            let mut inner = self.shared.inner.lock();
            let phase = inner.phase;
            match phase {
                Phase::AwaitingFirstAttempt => {},
                Phase::Terminated => {
                    drop(inner);
                    listener.on_close(Status::cancelled("call cancelled before start"), MetadataMap::new());
                    return;
                },
                Phase::Starting | Phase::Active | Phase::RetryScheduled => {
                    warn!(method = %self.shared.method, "Call already started");
                    return;
                },
            }
            let call = self.shared.next.new_call(&self.shared.method, &self.shared.options);
            inner.listener = Some(listener);
            inner.headers = headers.clone();
            inner.attempt = 1;
            inner.current = Some(Arc::clone(&call));
            inner.phase = Phase::Starting;
            call
        };
        self.shared.begin_attempt(1, &call, headers);
    }

    fn request(&self, count: usize) {
        let call = {
            let mut inner = self.shared.inner.lock();
            inner.requested = inner.requested.saturating_add(count);
            inner.active_call()
        };
        if let Some(call) = call {
            call.request(count);
        }
    }

    fn send_message(&self, message: Bytes) {
        let call = {
            let mut inner = self.shared.inner.lock();
            if inner.message.is_some() {
                warn!(method = %self.shared.method, "Second request message on a single-request call");
            }
            inner.message = Some(message.clone());
            inner.active_call()
        };
        if let Some(call) = call {
            call.send_message(message);
        }
    }

    fn half_close(&self) {
        let call = {
            let mut inner = self.shared.inner.lock();
            inner.half_closed = true;
            inner.active_call()
        };
        if let Some(call) = call {
            call.half_close();
        }
    }

    fn cancel(&self, reason: &str) {
        let mut inner = self.shared.inner.lock();
        if inner.cancelled() || inner.phase == Phase::Terminated {
            return;
        }
        inner.cancel_reason = Some(reason.to_owned());
        inner.retry.cancel();

        let phase = inner.phase;
        match phase {
            Phase::Active => {
                let call = inner.current.clone();
                drop(inner);
                if let Some(call) = call {
                    call.cancel(reason);
                }
            },
            // The starting attempt cancels its call once `start` returns.
            Phase::Starting => {},
            Phase::RetryScheduled => {
                inner.phase = Phase::Terminated;
                let listener = inner.listener.clone();
                drop(inner);
                debug!(method = %self.shared.method, "Call cancelled while a retry was pending");
                if let Some(listener) = listener {
                    listener.on_close(Status::cancelled(reason), MetadataMap::new());
                }
            },
            Phase::AwaitingFirstAttempt | Phase::Terminated => {
                inner.phase = Phase::Terminated;
            },
        }
    }

    fn is_ready(&self) -> bool {
        let call = self.shared.inner.lock().active_call();
        call.is_some_and(|call| call.is_ready())
    }
}
