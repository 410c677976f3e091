//! In-process echo service and transports used by the walkthrough.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use lodestar_sdk::{
    ResolvedAddressGroup, TransportManager,
    call::{CallListener, CallOptions, Channel, ClientCall, MethodDescriptor},
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tonic::{Status, metadata::MetadataMap};
use tracing::debug;

/// Echo channel that answers `UNAVAILABLE` a fixed number of times first.
#[derive(Debug)]
pub struct FlakyEchoChannel {
    authority: String,
    failures_left: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl FlakyEchoChannel {
    /// Creates a channel to `authority` failing the first `failures` calls.
    pub fn new(authority: impl Into<String>, failures: usize) -> Self {
        Self {
            authority: authority.into(),
            failures_left: Arc::new(AtomicUsize::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of calls made on the channel.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Channel for FlakyEchoChannel {
    fn new_call(&self, method: &MethodDescriptor, _options: &CallOptions) -> Arc<dyn ClientCall> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(method = %method, attempt, "Echo call created");
        Arc::new(EchoCall {
            failures_left: Arc::clone(&self.failures_left),
            state: Mutex::new(EchoState::default()),
        })
    }

    fn authority(&self) -> String {
        self.authority.clone()
    }
}

#[derive(Default)]
struct EchoState {
    listener: Option<Arc<dyn CallListener>>,
    message: Option<Bytes>,
    closed: bool,
}

struct EchoCall {
    failures_left: Arc<AtomicUsize>,
    state: Mutex<EchoState>,
}

impl EchoCall {
    fn close(&self) -> Option<(Arc<dyn CallListener>, Option<Bytes>)> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        let listener = state.listener.clone()?;
        Some((listener, state.message.take()))
    }
}

impl ClientCall for EchoCall {
    fn start(&self, listener: Arc<dyn CallListener>, _headers: MetadataMap) {
        self.state.lock().listener = Some(listener);
    }

    fn request(&self, _count: usize) {}

    fn send_message(&self, message: Bytes) {
        self.state.lock().message = Some(message);
    }

    fn half_close(&self) {
        let Some((listener, message)) = self.close() else { return };
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            listener.on_close(Status::unavailable("echo server restarting"), MetadataMap::new());
            return;
        }
        listener.on_headers(MetadataMap::new());
        if let Some(message) = message {
            listener.on_message(message);
        }
        listener.on_close(Status::ok(""), MetadataMap::new());
    }

    fn cancel(&self, reason: &str) {
        if let Some((listener, _)) = self.close() {
            listener.on_close(Status::cancelled(reason), MetadataMap::new());
        }
    }
}

/// Outcome of one call: the response messages and the final status.
#[derive(Debug)]
pub struct CallOutcome {
    pub messages: Vec<Bytes>,
    pub status: Status,
}

/// Listener that completes a oneshot with the call outcome.
pub struct OutcomeListener {
    messages: Mutex<Vec<Bytes>>,
    done: Mutex<Option<oneshot::Sender<CallOutcome>>>,
}

impl OutcomeListener {
    /// Creates a listener and the receiver of its outcome.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Arc::new(Self { messages: Mutex::new(Vec::new()), done: Mutex::new(Some(tx)) }), rx)
    }
}

impl CallListener for OutcomeListener {
    fn on_message(&self, message: Bytes) {
        self.messages.lock().push(message);
    }

    fn on_close(&self, status: Status, _trailers: MetadataMap) {
        let messages = std::mem::take(&mut *self.messages.lock());
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(CallOutcome { messages, status });
        }
    }
}

/// Transport handle naming where calls would go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoTransport {
    /// Calls go to the first address of a group.
    Server {
        /// Zone of the server.
        zone: String,
        /// Address calls are sent to.
        address: Option<SocketAddr>,
    },
    /// Calls fail immediately.
    Failing(String),
}

impl fmt::Display for DemoTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server { zone, address: Some(address) } => write!(f, "{address} ({zone})"),
            Self::Server { zone, address: None } => write!(f, "<no address> ({zone})"),
            Self::Failing(reason) => write!(f, "failing: {reason}"),
        }
    }
}

/// [`TransportManager`] producing [`DemoTransport`]s.
#[derive(Debug, Default)]
pub struct DemoTransports;

impl TransportManager for DemoTransports {
    type Transport = DemoTransport;

    fn get_transport(&self, group: &ResolvedAddressGroup) -> DemoTransport {
        DemoTransport::Server { zone: group.zone().to_owned(), address: group.addresses().first().copied() }
    }

    fn create_failing_transport(&self, status: Status) -> DemoTransport {
        DemoTransport::Failing(status.message().to_owned())
    }
}
