//! Client-side service discovery for RPC clients.
//!
//! Services announce their instances in a coordination service as ephemeral
//! nodes; clients discover them, resolve them to socket addresses ordered by
//! zone preference, pick a server, and retry calls that fail because a server
//! went away.
//!
//! # Features
//!
//! - **Ephemeral registration**: Instances disappear with the session that
//!   registered them
//! - **Ordered watches**: Every membership change arrives as a full snapshot,
//!   in order, one at a time
//! - **Zone-aware resolution**: Own-zone instances first, ties kept in
//!   registration order
//! - **Immutable retry state**: Pluggable backoff, limits and scheduling
//! - **Transparent call retry**: `UNAVAILABLE` failures replayed before any
//!   response arrives
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lodestar_sdk::{
//!     AddressListBalancer, DnsLookup, MemoryEnsemble, RegistryConfig, ServiceRegistry,
//!     ZoneAffinity, ZoneAwareResolver, mock::RecordingTransportManager,
//! };
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ensemble = MemoryEnsemble::new();
//! let config = RegistryConfig::builder().with_connect_string("localhost:2181").build()?;
//!
//! // Server side: announce an instance.
//! let server = ServiceRegistry::connect(&ensemble, config.clone()).await?;
//! server.register_in_zone("billing", &Url::parse("http://10.0.0.7:7000")?, "us-east-1a").await?;
//!
//! // Client side: resolve and pick.
//! let balancer = Arc::new(AddressListBalancer::new(Arc::new(RecordingTransportManager::new())));
//! let mut resolver = ZoneAwareResolver::new(
//!     "billing",
//!     ServiceRegistry::connect(&ensemble, config).await?,
//!     Arc::new(DnsLookup::new()),
//!     Some(ZoneAffinity::prefer("us-east-1a")),
//! );
//! resolver.start(balancer.clone()).await?;
//! let transport = balancer.pick();
//! # let _ = transport;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Call layer (InterceptedChannel)                │
//! │   RetryInterceptor │ RetryState │ RetryScheduler │ Backoff  │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Selection (AddressListBalancer)                │
//! │   AddressList │ TransportManager │ BalanceChannelListener   │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Resolution (ZoneAwareResolver)                 │
//! │   ZoneComparator │ HostLookup (hickory) │ ResolverRegistry  │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Registry (ServiceRegistry)                     │
//! │   register │ deregister │ discover │ watch_for_updates      │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Coordination seam                              │
//! │   Coordinator │ CoordinationSession │ MemoryEnsemble        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod address_list;
mod balance_channel;
mod balancer;
pub mod call;
mod config;
pub mod coordination;
mod error;
mod instance;
mod interceptor;
mod lookup;
pub mod mock;
mod provider;
mod registry;
mod resolver;
pub mod retry;

// Public API exports
pub use address_list::{
    AddressEntry, AddressList, AddressListBuilder, THROTTLED_DESCRIPTION, TransportManager,
};
pub use balance_channel::{BalanceChannelListener, EndpointChange, balance_channel};
pub use balancer::AddressListBalancer;
pub use config::{
    ConnectString, DEFAULT_ROOT_PATH, EnsembleMember, RegistryConfig, RegistryConfigBuilder,
};
pub use coordination::{
    CoordinationError, CoordinationSession, Coordinator, MemoryEnsemble, SessionId, SessionState,
};
pub use error::{DiscoveryError, Result};
pub use instance::{DEFAULT_ZONE, HostAndZone, ServiceInstance, ServiceSnapshot};
pub use interceptor::RetryInterceptor;
pub use lookup::{DnsLookup, HostLookup};
pub use provider::{
    DEFAULT_SCHEME, NameResolver, NameResolverProvider, ResolverRegistry,
    ZoneAwareResolverProvider,
};
pub use registry::{ServiceRegistry, SnapshotWatcher};
pub use resolver::{
    ResolvedAddressGroup, ResolverListener, ZoneAffinity, ZoneAwareResolver, ZoneComparator,
};
pub use retry::{
    Backoff, ExponentialBackoff, FixedBackoff, Immediate, RetryLimit, RetryScheduler, RetryState,
    TaskHandle,
};
