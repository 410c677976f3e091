//! Test doubles for the discovery and call seams.
//!
//! - [`StaticLookup`]: a [`HostLookup`] backed by a fixed host table.
//! - [`RecordingListener`]: a [`ResolverListener`] that records pushes and
//!   errors and lets tests wait for them.
//! - [`ScriptedChannel`]: a [`Channel`] whose calls follow [`CallScript`]s and
//!   record every caller action as a [`CallEvent`].
//! - [`RecordingCallListener`]: a [`CallListener`] that records responses and
//!   the final status.
//! - [`RecordingTransportManager`]: a [`TransportManager`] producing
//!   inspectable [`MockTransport`]s.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use bytes::Bytes;
//! use lodestar_sdk::{
//!     RetryInterceptor,
//!     call::{CallOptions, Channel, InterceptedChannel, MethodDescriptor, MethodType},
//!     mock::{CallScript, RecordingCallListener, ScriptedChannel},
//! };
//! use tonic::{Status, metadata::MetadataMap};
//!
//! # async fn example() -> std::io::Result<()> {
//! let base = Arc::new(
//!     ScriptedChannel::new("billing")
//!         .with_script(CallScript::fail(Status::unavailable("restarting")))
//!         .with_script(CallScript::respond(Bytes::from_static(b"ok"))),
//! );
//! let channel = InterceptedChannel::new(base.clone(), Arc::new(RetryInterceptor::create_default()?));
//!
//! let listener = Arc::new(RecordingCallListener::new());
//! let call = channel.new_call(
//!     &MethodDescriptor::new("billing.v1.Billing/Charge", MethodType::Unary),
//!     &CallOptions::default(),
//! );
//! call.start(listener.clone(), MetadataMap::new());
//! call.request(1);
//! call.send_message(Bytes::from_static(b"charge"));
//! call.half_close();
//!
//! let status = listener.wait_for_close(Duration::from_secs(1)).await;
//! assert!(status.is_some_and(|s| s.code() == tonic::Code::Ok));
//! assert_eq!(base.call_count(), 2);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tonic::{Code, Status, metadata::MetadataMap};

use crate::{
    address_list::TransportManager,
    call::{CallListener, CallOptions, Channel, ClientCall, MethodDescriptor},
    error::{DiscoveryError, ResolutionSnafu, Result},
    lookup::{HostLookup, parse_ip_literal},
    resolver::{ResolvedAddressGroup, ResolverListener},
};

/// Waits on `notify` until `ready` holds or `timeout` expires.
async fn wait_until(notify: &Notify, timeout: Duration, ready: impl Fn() -> bool) -> bool {
    let wait = async {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready() {
                return;
            }
            notified.await;
        }
    };
    tokio::time::timeout(timeout, wait).await.is_ok()
}

// ---------------------------------------------------------------------------
// Host lookup
// ---------------------------------------------------------------------------

/// [`HostLookup`] answering from a fixed table.
///
/// IP literals resolve to themselves; unknown hosts fail with
/// [`DiscoveryError::Resolution`].
#[derive(Debug, Default)]
pub struct StaticLookup {
    hosts: RwLock<HashMap<String, Vec<IpAddr>>>,
}

impl StaticLookup {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `host` with `addresses`. An empty list is allowed.
    #[must_use]
    pub fn with_host(self, host: impl Into<String>, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.set_host(host, addresses);
        self
    }

    /// Replaces the addresses of `host`.
    pub fn set_host(&self, host: impl Into<String>, addresses: impl IntoIterator<Item = IpAddr>) {
        self.hosts.write().insert(host.into(), addresses.into_iter().collect());
    }

    /// Removes `host` so lookups of it fail.
    pub fn remove_host(&self, host: &str) {
        self.hosts.write().remove(host);
    }
}

#[async_trait]
impl HostLookup for StaticLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![ip]);
        }
        self.hosts
            .read()
            .get(host)
            .cloned()
            .ok_or_else(|| ResolutionSnafu { host, message: "no such host" }.build())
    }
}

// ---------------------------------------------------------------------------
// Resolver listener
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Recorded {
    pushes: Vec<Vec<ResolvedAddressGroup>>,
    errors: Vec<String>,
}

/// [`ResolverListener`] that records every push and error.
#[derive(Debug, Default)]
pub struct RecordingListener {
    recorded: Mutex<Recorded>,
    notify: Notify,
}

impl RecordingListener {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every push in arrival order.
    #[must_use]
    pub fn pushes(&self) -> Vec<Vec<ResolvedAddressGroup>> {
        self.recorded.lock().pushes.clone()
    }

    /// Returns the most recent push.
    #[must_use]
    pub fn last_push(&self) -> Option<Vec<ResolvedAddressGroup>> {
        self.recorded.lock().pushes.last().cloned()
    }

    /// Returns the display form of every error in arrival order.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.recorded.lock().errors.clone()
    }

    /// Waits until at least `count` pushes arrived.
    pub async fn wait_for_pushes(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.notify, timeout, || self.recorded.lock().pushes.len() >= count).await
    }

    /// Waits until at least `count` errors arrived.
    pub async fn wait_for_errors(&self, count: usize, timeout: Duration) -> bool {
        wait_until(&self.notify, timeout, || self.recorded.lock().errors.len() >= count).await
    }
}

impl ResolverListener for RecordingListener {
    fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>) {
        self.recorded.lock().pushes.push(groups);
        self.notify.notify_waiters();
    }

    fn on_error(&self, error: DiscoveryError) {
        self.recorded.lock().errors.push(error.to_string());
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// How a [`ScriptedCall`] answers once the caller half-closes.
#[derive(Debug, Clone)]
pub enum CallScript {
    /// Send `messages`, then close with `status`.
    Close {
        /// Response messages delivered before the close.
        messages: Vec<Bytes>,
        /// Final status.
        status: Status,
    },
    /// Never answer; only a cancel closes the call.
    Hang,
}

impl CallScript {
    /// Closes with `status` without responding.
    #[must_use]
    pub fn fail(status: Status) -> Self {
        Self::Close { messages: Vec::new(), status }
    }

    /// Responds with `message` and closes with OK.
    #[must_use]
    pub fn respond(message: Bytes) -> Self {
        Self::Close { messages: vec![message], status: Status::ok("") }
    }

    /// Responds with `messages`, then closes with `status`.
    #[must_use]
    pub fn close(messages: Vec<Bytes>, status: Status) -> Self {
        Self::Close { messages, status }
    }

    /// Never answers.
    #[must_use]
    pub fn hang() -> Self {
        Self::Hang
    }
}

/// Caller action observed by a [`ScriptedCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// `start`.
    Start,
    /// `request(count)`.
    Request(usize),
    /// `send_message`.
    Message(Bytes),
    /// `half_close`.
    HalfClose,
    /// `cancel(reason)`.
    Cancel(String),
}

#[derive(Default)]
struct CallState {
    events: Vec<CallEvent>,
    headers: Option<MetadataMap>,
    listener: Option<Arc<dyn CallListener>>,
    closed: bool,
}

/// Call created by a [`ScriptedChannel`].
pub struct ScriptedCall {
    method: String,
    script: CallScript,
    state: Mutex<CallState>,
}

impl ScriptedCall {
    fn new(method: &MethodDescriptor, script: CallScript) -> Self {
        Self { method: method.full_name().to_owned(), script, state: Mutex::new(CallState::default()) }
    }

    /// Returns the full name of the called method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns every caller action in order.
    #[must_use]
    pub fn events(&self) -> Vec<CallEvent> {
        self.state.lock().events.clone()
    }

    /// Returns the value of request header `key`, if the call was started
    /// with one.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<String> {
        let state = self.state.lock();
        let value = state.headers.as_ref()?.get(key)?;
        value.to_str().ok().map(str::to_owned)
    }

    /// Returns whether the call delivered its close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn record(&self, event: CallEvent) {
        self.state.lock().events.push(event);
    }

    /// Marks the call closed and returns the listener, unless already closed.
    fn take_for_close(&self) -> Option<Arc<dyn CallListener>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.listener.clone()
    }
}

impl ClientCall for ScriptedCall {
    fn start(&self, listener: Arc<dyn CallListener>, headers: MetadataMap) {
        let mut state = self.state.lock();
        state.events.push(CallEvent::Start);
        state.headers = Some(headers);
        state.listener = Some(listener);
    }

    fn request(&self, count: usize) {
        self.record(CallEvent::Request(count));
    }

    fn send_message(&self, message: Bytes) {
        self.record(CallEvent::Message(message));
    }

    fn half_close(&self) {
        self.record(CallEvent::HalfClose);
        let CallScript::Close { messages, status } = &self.script else { return };
        let Some(listener) = self.take_for_close() else { return };

        listener.on_headers(MetadataMap::new());
        for message in messages {
            listener.on_message(message.clone());
        }
        listener.on_close(status.clone(), MetadataMap::new());
    }

    fn cancel(&self, reason: &str) {
        self.record(CallEvent::Cancel(reason.to_owned()));
        if let Some(listener) = self.take_for_close() {
            listener.on_close(Status::cancelled(reason), MetadataMap::new());
        }
    }

    fn is_ready(&self) -> bool {
        !self.state.lock().closed
    }
}

/// [`Channel`] handing out [`ScriptedCall`]s.
///
/// Each new call takes the next queued script; once the queue is empty calls
/// use the default script (an OK close with no response unless changed).
pub struct ScriptedChannel {
    authority: String,
    scripts: Mutex<VecDeque<CallScript>>,
    default: CallScript,
    calls: Mutex<Vec<Arc<ScriptedCall>>>,
}

impl ScriptedChannel {
    /// Creates a channel to `authority`.
    #[must_use]
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            scripts: Mutex::new(VecDeque::new()),
            default: CallScript::Close { messages: Vec::new(), status: Status::ok("") },
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues `script` for the next unscripted call.
    #[must_use]
    pub fn with_script(self, script: CallScript) -> Self {
        self.scripts.lock().push_back(script);
        self
    }

    /// Sets the script used once the queue is empty.
    #[must_use]
    pub fn with_default(mut self, script: CallScript) -> Self {
        self.default = script;
        self
    }

    /// Returns every call created so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Arc<ScriptedCall>> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls created so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Channel for ScriptedChannel {
    fn new_call(&self, method: &MethodDescriptor, _options: &CallOptions) -> Arc<dyn ClientCall> {
        let script = self.scripts.lock().pop_front().unwrap_or_else(|| self.default.clone());
        let call = Arc::new(ScriptedCall::new(method, script));
        self.calls.lock().push(Arc::clone(&call));
        call
    }

    fn authority(&self) -> String {
        self.authority.clone()
    }
}

#[derive(Debug, Default)]
struct CallRecord {
    headers: usize,
    messages: Vec<Bytes>,
    closes: Vec<Status>,
}

/// [`CallListener`] that records responses and closes.
#[derive(Debug, Default)]
pub struct RecordingCallListener {
    record: Mutex<CallRecord>,
    notify: Notify,
}

impl RecordingCallListener {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the response messages in order.
    #[must_use]
    pub fn messages(&self) -> Vec<Bytes> {
        self.record.lock().messages.clone()
    }

    /// Returns how many times headers arrived.
    #[must_use]
    pub fn header_count(&self) -> usize {
        self.record.lock().headers
    }

    /// Returns how many closes arrived.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.record.lock().closes.len()
    }

    /// Returns the first close status, if any.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.record.lock().closes.first().cloned()
    }

    /// Waits for the first close and returns its status.
    pub async fn wait_for_close(&self, timeout: Duration) -> Option<Status> {
        if wait_until(&self.notify, timeout, || self.close_count() > 0).await {
            self.status()
        } else {
            None
        }
    }
}

impl CallListener for RecordingCallListener {
    fn on_headers(&self, _headers: MetadataMap) {
        self.record.lock().headers += 1;
    }

    fn on_message(&self, message: Bytes) {
        self.record.lock().messages.push(message);
    }

    fn on_close(&self, status: Status, _trailers: MetadataMap) {
        self.record.lock().closes.push(status);
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Transport produced by [`RecordingTransportManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockTransport {
    /// A transport to `group`.
    Connected(ResolvedAddressGroup),
    /// A transport failing every call.
    Failing {
        /// Status code calls fail with.
        code: Code,
        /// Status message calls fail with.
        message: String,
    },
}

/// [`TransportManager`] that records which groups transports were requested
/// for.
#[derive(Debug, Default)]
pub struct RecordingTransportManager {
    requested: Mutex<Vec<ResolvedAddressGroup>>,
}

impl RecordingTransportManager {
    /// Creates a manager with no recorded requests.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the groups transports were requested for, in order.
    #[must_use]
    pub fn requested(&self) -> Vec<ResolvedAddressGroup> {
        self.requested.lock().clone()
    }
}

impl TransportManager for RecordingTransportManager {
    type Transport = MockTransport;

    fn get_transport(&self, group: &ResolvedAddressGroup) -> MockTransport {
        self.requested.lock().push(group.clone());
        MockTransport::Connected(group.clone())
    }

    fn create_failing_transport(&self, status: Status) -> MockTransport {
        MockTransport::Failing { code: status.code(), message: status.message().to_owned() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::call::MethodType;

    #[tokio::test]
    async fn test_static_lookup() {
        let lookup = StaticLookup::new().with_host("alpha", [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);

        assert_eq!(lookup.lookup("alpha").await.unwrap(), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
        assert_eq!(lookup.lookup("192.168.1.1").await.unwrap(), vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))]);

        let err = lookup.lookup("beta").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Resolution { .. }));

        lookup.remove_host("alpha");
        assert!(lookup.lookup("alpha").await.is_err());
    }

    #[tokio::test]
    async fn test_recording_listener_waits() {
        let listener = Arc::new(RecordingListener::new());
        assert!(!listener.wait_for_pushes(1, Duration::from_millis(20)).await);

        let pusher = Arc::clone(&listener);
        tokio::spawn(async move { pusher.on_addresses(vec![]) });

        assert!(listener.wait_for_pushes(1, Duration::from_secs(1)).await);
        assert_eq!(listener.last_push(), Some(vec![]));
    }

    #[test]
    fn test_scripted_call_closes_once() {
        let channel = ScriptedChannel::new("svc").with_script(CallScript::fail(Status::unavailable("down")));
        let call = channel.new_call(&MethodDescriptor::new("a/b", MethodType::Unary), &CallOptions::default());
        let listener = Arc::new(RecordingCallListener::new());

        call.start(listener.clone(), MetadataMap::new());
        call.half_close();
        call.cancel("late");

        assert_eq!(listener.close_count(), 1);
        assert_eq!(listener.status().unwrap().code(), Code::Unavailable);
        assert_eq!(
            channel.calls()[0].events(),
            vec![CallEvent::Start, CallEvent::HalfClose, CallEvent::Cancel("late".to_owned())]
        );
    }
}
