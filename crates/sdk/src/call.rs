//! Client call seam.
//!
//! A minimal callback-style call model: a [`Channel`] creates
//! [`ClientCall`]s, each call reports to a [`CallListener`], and
//! [`ClientInterceptor`]s wrap calls on their way out. Messages travel as
//! encoded [`Bytes`]; statuses and metadata are tonic's.

use std::{fmt, sync::Arc, time::Instant};

use bytes::Bytes;
use tonic::{Status, metadata::MetadataMap};

/// Message cardinality of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    /// One request, one response.
    Unary,
    /// A request stream, one response.
    ClientStreaming,
    /// One request, a response stream.
    ServerStreaming,
    /// Streams in both directions.
    BidiStreaming,
    /// Cardinality not known.
    Unknown,
}

impl MethodType {
    /// Returns whether the client sends exactly one message.
    #[must_use]
    pub fn client_sends_one_message(self) -> bool {
        matches!(self, Self::Unary | Self::ServerStreaming)
    }

    /// Returns whether the server sends exactly one message.
    #[must_use]
    pub fn server_sends_one_message(self) -> bool {
        matches!(self, Self::Unary | Self::ClientStreaming)
    }
}

/// An RPC method: its full name (`package.Service/Method`) and cardinality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    full_name: String,
    method_type: MethodType,
}

impl MethodDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(full_name: impl Into<String>, method_type: MethodType) -> Self {
        Self { full_name: full_name.into(), method_type }
    }

    /// Returns the full method name.
    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Returns the service part of the full name.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.full_name.rsplit_once('/').map(|(service, _)| service)
    }

    /// Returns the method cardinality.
    #[must_use]
    pub fn method_type(&self) -> MethodType {
        self.method_type
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    deadline: Option<Instant>,
    authority: Option<String>,
}

impl CallOptions {
    /// Returns a copy with `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns a copy overriding the channel authority.
    #[must_use]
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the authority override, if any.
    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }
}

/// Receives the events of one call.
///
/// `on_close` is the last event and arrives exactly once.
pub trait CallListener: Send + Sync {
    /// Response headers arrived.
    fn on_headers(&self, _headers: MetadataMap) {}

    /// A response message arrived.
    fn on_message(&self, message: Bytes);

    /// The call finished with `status`.
    fn on_close(&self, status: Status, trailers: MetadataMap);

    /// The call can accept more outbound messages.
    fn on_ready(&self) {}
}

/// One outbound call.
pub trait ClientCall: Send + Sync {
    /// Starts the call; `listener` receives every subsequent event.
    fn start(&self, listener: Arc<dyn CallListener>, headers: MetadataMap);

    /// Asks for `count` more response messages.
    fn request(&self, count: usize);

    /// Sends one request message.
    fn send_message(&self, message: Bytes);

    /// Signals that no more request messages follow.
    fn half_close(&self);

    /// Cancels the call. The listener is closed with `CANCELLED`.
    fn cancel(&self, reason: &str);

    /// Returns whether the call can accept an outbound message without
    /// buffering.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Creates calls to one logical target.
pub trait Channel: Send + Sync {
    /// Creates a call of `method`. The call does nothing until started.
    fn new_call(&self, method: &MethodDescriptor, options: &CallOptions) -> Arc<dyn ClientCall>;

    /// Returns the authority calls are addressed to.
    fn authority(&self) -> String;
}

/// Wraps outbound calls.
pub trait ClientInterceptor: Send + Sync {
    /// Returns the call for `method`, typically by decorating one created from
    /// `next`.
    fn intercept_call(
        &self,
        method: &MethodDescriptor,
        options: &CallOptions,
        next: Arc<dyn Channel>,
    ) -> Arc<dyn ClientCall>;
}

/// A [`Channel`] whose calls pass through an interceptor.
#[derive(Clone)]
pub struct InterceptedChannel {
    next: Arc<dyn Channel>,
    interceptor: Arc<dyn ClientInterceptor>,
}

impl InterceptedChannel {
    /// Routes calls on `channel` through `interceptor`.
    #[must_use]
    pub fn new(channel: Arc<dyn Channel>, interceptor: Arc<dyn ClientInterceptor>) -> Self {
        Self { next: channel, interceptor }
    }

    /// Routes calls on `channel` through `interceptors`; the first one sees
    /// each call first.
    #[must_use]
    pub fn intercept(
        channel: Arc<dyn Channel>,
        interceptors: impl IntoIterator<Item = Arc<dyn ClientInterceptor>>,
    ) -> Arc<dyn Channel> {
        let interceptors: Vec<_> = interceptors.into_iter().collect();
        interceptors.into_iter().rev().fold(channel, |next, interceptor| {
            Arc::new(Self::new(next, interceptor)) as Arc<dyn Channel>
        })
    }
}

impl fmt::Debug for InterceptedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedChannel").field("authority", &self.next.authority()).finish()
    }
}

impl Channel for InterceptedChannel {
    fn new_call(&self, method: &MethodDescriptor, options: &CallOptions) -> Arc<dyn ClientCall> {
        self.interceptor.intercept_call(method, options, Arc::clone(&self.next))
    }

    fn authority(&self) -> String {
        self.next.authority()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::mock::{CallScript, ScriptedChannel};

    #[test]
    fn test_method_type_cardinality() {
        assert!(MethodType::Unary.client_sends_one_message());
        assert!(MethodType::ServerStreaming.client_sends_one_message());
        assert!(!MethodType::ClientStreaming.client_sends_one_message());
        assert!(!MethodType::BidiStreaming.client_sends_one_message());
        assert!(!MethodType::Unknown.client_sends_one_message());

        assert!(MethodType::Unary.server_sends_one_message());
        assert!(MethodType::ClientStreaming.server_sends_one_message());
        assert!(!MethodType::ServerStreaming.server_sends_one_message());
    }

    #[test]
    fn test_method_descriptor_names() {
        let method = MethodDescriptor::new("billing.v1.Billing/Charge", MethodType::Unary);
        assert_eq!(method.service_name(), Some("billing.v1.Billing"));
        assert_eq!(method.to_string(), "billing.v1.Billing/Charge");
        assert_eq!(MethodDescriptor::new("bare", MethodType::Unary).service_name(), None);
    }

    /// Records the order in which interceptors see a call.
    struct Tagging {
        tag: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ClientInterceptor for Tagging {
        fn intercept_call(
            &self,
            method: &MethodDescriptor,
            options: &CallOptions,
            next: Arc<dyn Channel>,
        ) -> Arc<dyn ClientCall> {
            self.seen.lock().push(self.tag);
            next.new_call(method, options)
        }
    }

    #[test]
    fn test_interceptors_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base = Arc::new(ScriptedChannel::new("billing").with_default(CallScript::hang()));
        let channel = InterceptedChannel::intercept(
            base.clone(),
            [
                Arc::new(Tagging { tag: "outer", seen: seen.clone() }) as Arc<dyn ClientInterceptor>,
                Arc::new(Tagging { tag: "inner", seen: seen.clone() }),
            ],
        );

        let _call = channel.new_call(&MethodDescriptor::new("a/b", MethodType::Unary), &CallOptions::default());

        assert_eq!(*seen.lock(), vec!["outer", "inner"]);
        assert_eq!(base.call_count(), 1);
        assert_eq!(channel.authority(), "billing");
    }
}
