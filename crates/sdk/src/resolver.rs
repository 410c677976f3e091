//! Zone-aware name resolution.
//!
//! A [`ZoneAwareResolver`] turns registry snapshots of one service into
//! ordered [`ResolvedAddressGroup`]s and pushes them to a
//! [`ResolverListener`]:
//!
//! ```text
//! registry snapshot ──► zone ordering ──► host lookup ──► listener.on_addresses
//!   [uri@zone, ...]     (stable sort)     (one group per     (full replacement)
//!                                          uri, tagged zone)
//! ```
//!
//! Any lookup failure aborts the whole push and reaches `listener.on_error`;
//! listeners never see a partial list.

use std::{
    cmp::Ordering,
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use snafu::{OptionExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    error::{ConfigSnafu, DiscoveryError, ResolutionSnafu, Result},
    instance::{HostAndZone, ServiceSnapshot},
    lookup::HostLookup,
    registry::{ServiceRegistry, SnapshotWatcher},
};

/// Receives resolution results.
///
/// Every `on_addresses` call replaces the previous list completely.
pub trait ResolverListener: Send + Sync + 'static {
    /// Called with the complete, ordered address groups of the service.
    fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>);

    /// Called when discovery or resolution fails. The last good list stays in
    /// effect.
    fn on_error(&self, error: DiscoveryError);
}

/// Addresses of one discovered instance, tagged with its zone.
///
/// Never empty: resolution fails instead of producing an empty group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedAddressGroup {
    zone: String,
    addresses: Vec<SocketAddr>,
}

impl ResolvedAddressGroup {
    /// Creates a group.
    #[must_use]
    pub fn new(zone: impl Into<String>, addresses: Vec<SocketAddr>) -> Self {
        Self { zone: zone.into(), addresses }
    }

    /// Returns the zone label.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Returns the socket addresses.
    #[must_use]
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }
}

/// Orders discovered instances before resolution.
///
/// Applied with a stable sort, so instances that compare equal keep snapshot
/// order (most recently registered first).
pub type ZoneComparator = Arc<dyn Fn(&HostAndZone, &HostAndZone) -> Ordering + Send + Sync>;

/// Ready-made [`ZoneComparator`]s.
#[derive(Debug, Clone, Copy)]
pub struct ZoneAffinity;

impl ZoneAffinity {
    /// Puts instances in `zone` ahead of every other instance.
    #[must_use]
    pub fn prefer(zone: impl Into<String>) -> ZoneComparator {
        let zone = zone.into();
        Arc::new(move |a: &HostAndZone, b: &HostAndZone| {
            (b.zone == zone).cmp(&(a.zone == zone))
        })
    }
}

/// Snapshot-to-address-groups transformation shared by the initial push and
/// the watch.
#[derive(Clone)]
struct Pipeline {
    service_id: Arc<str>,
    lookup: Arc<dyn HostLookup>,
    comparator: Option<ZoneComparator>,
    /// Serializes read-then-push rounds.
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Pipeline {
    async fn resolve(&self, snapshot: ServiceSnapshot) -> Result<Vec<ResolvedAddressGroup>> {
        let mut entries = snapshot.into_entries();
        if let Some(comparator) = &self.comparator {
            entries.sort_by(|a, b| comparator(a, b));
        }

        let mut groups = Vec::with_capacity(entries.len());
        for entry in &entries {
            groups.push(self.resolve_entry(entry).await?);
        }
        Ok(groups)
    }

    async fn resolve_entry(&self, entry: &HostAndZone) -> Result<ResolvedAddressGroup> {
        let uri = entry.uri.as_str();
        let host = entry
            .uri
            .host_str()
            .filter(|h| !h.is_empty())
            .context(ResolutionSnafu { host: uri, message: "URI has no host" })?;
        let port = entry
            .uri
            .port_or_known_default()
            .context(ResolutionSnafu { host: uri, message: "URI has no port" })?;

        let ips = self.lookup.lookup(host).await?;
        ensure!(!ips.is_empty(), ResolutionSnafu { host, message: "lookup returned no addresses" });

        Ok(ResolvedAddressGroup::new(
            entry.zone.clone(),
            ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
        ))
    }

    /// Reads the current membership and pushes it, one round at a time.
    async fn discover_and_push(&self, registry: &ServiceRegistry, listener: &dyn ResolverListener) -> Result<()> {
        let _round = self.gate.lock().await;
        let snapshot = registry.discover(&self.service_id).await?;
        self.push(snapshot, listener).await;
        Ok(())
    }

    async fn push(&self, snapshot: ServiceSnapshot, listener: &dyn ResolverListener) {
        match self.resolve(snapshot).await {
            Ok(groups) => {
                debug!(service_id = %self.service_id, groups = groups.len(), "Pushing resolved addresses");
                listener.on_addresses(groups);
            },
            Err(e) => {
                warn!(service_id = %self.service_id, error = %e, "Address resolution failed");
                listener.on_error(e);
            },
        }
    }
}

/// Pushes the current membership after every change.
///
/// Each delivery re-reads the registry under the push gate, so a push never
/// carries membership older than the one before it.
struct ResolverWatcher {
    pipeline: Pipeline,
    registry: Weak<ServiceRegistry>,
    listener: Arc<dyn ResolverListener>,
}

#[async_trait]
impl SnapshotWatcher for ResolverWatcher {
    async fn on_snapshot(&self, snapshot: ServiceSnapshot) {
        debug!(service_id = %self.pipeline.service_id, nodes = %snapshot, "Service membership changed");
        let Some(registry) = self.registry.upgrade() else { return };
        if let Err(e) = self.pipeline.discover_and_push(&registry, self.listener.as_ref()).await {
            warn!(service_id = %self.pipeline.service_id, error = %e, "Re-reading service membership failed");
            self.listener.on_error(e);
        }
    }

    fn on_error(&self, error: DiscoveryError) {
        warn!(service_id = %self.pipeline.service_id, error = %error, "Service watch failed");
        self.listener.on_error(error);
    }
}

/// Resolves one service through a registry it owns.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use lodestar_sdk::{
/// #     DnsLookup, MemoryEnsemble, RegistryConfig, ResolvedAddressGroup, ResolverListener,
/// #     ServiceRegistry, ZoneAffinity, ZoneAwareResolver, DiscoveryError,
/// # };
/// # struct Print;
/// # impl ResolverListener for Print {
/// #     fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>) { println!("{groups:?}"); }
/// #     fn on_error(&self, error: DiscoveryError) { eprintln!("{error}"); }
/// # }
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// # let ensemble = MemoryEnsemble::new();
/// let config = RegistryConfig::builder().with_connect_string("localhost:2181").build()?;
/// let registry = ServiceRegistry::connect(&ensemble, config).await?;
/// let mut resolver = ZoneAwareResolver::new(
///     "billing",
///     registry,
///     Arc::new(DnsLookup::new()),
///     Some(ZoneAffinity::prefer("us-east-1a")),
/// );
/// resolver.start(Arc::new(Print)).await?;
/// // ...
/// resolver.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ZoneAwareResolver {
    pipeline: Pipeline,
    registry: Option<Arc<ServiceRegistry>>,
    listener: Option<Arc<dyn ResolverListener>>,
}

impl fmt::Debug for ZoneAwareResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneAwareResolver")
            .field("service_id", &self.pipeline.service_id)
            .field("lookup", &self.pipeline.lookup)
            .field("zone_ordering", &self.pipeline.comparator.is_some())
            .field("started", &self.listener.is_some())
            .field("shut_down", &self.registry.is_none())
            .finish()
    }
}

impl ZoneAwareResolver {
    /// Creates a resolver for `service_id` that owns `registry`.
    ///
    /// Without a comparator, groups are pushed in snapshot order.
    #[must_use]
    pub fn new(
        service_id: impl Into<String>,
        registry: ServiceRegistry,
        lookup: Arc<dyn HostLookup>,
        comparator: Option<ZoneComparator>,
    ) -> Self {
        let service_id: String = service_id.into();
        Self {
            pipeline: Pipeline {
                service_id: service_id.into(),
                lookup,
                comparator,
                gate: Arc::new(tokio::sync::Mutex::new(())),
            },
            registry: Some(Arc::new(registry)),
            listener: None,
        }
    }

    /// Returns the authority of the resolved target: the service id.
    #[must_use]
    pub fn service_authority(&self) -> &str {
        &self.pipeline.service_id
    }

    /// Watches the service, then discovers it and pushes the initial
    /// addresses.
    ///
    /// The watch is in place before the initial read, so no change after
    /// `start` begins is missed. The initial push happens before this
    /// returns. A resolution failure on the initial push goes to
    /// `listener.on_error`; a discovery failure is returned.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the resolver was already started or
    /// shut down, or the registry cannot be read or watched.
    pub async fn start(&mut self, listener: Arc<dyn ResolverListener>) -> Result<()> {
        ensure!(self.listener.is_none(), ConfigSnafu { message: "resolver already started" });
        let registry = self
            .registry
            .as_ref()
            .context(ConfigSnafu { message: "resolver is shut down" })?;
        let service_id = &self.pipeline.service_id;

        registry
            .watch_for_updates(
                service_id,
                ResolverWatcher {
                    pipeline: self.pipeline.clone(),
                    registry: Arc::downgrade(registry),
                    listener: Arc::clone(&listener),
                },
            )
            .await?;

        let round = self.pipeline.gate.lock().await;
        let snapshot = match registry.discover(service_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                registry.unwatch(service_id);
                return Err(e);
            },
        };
        info!(service_id = %service_id, nodes = %snapshot, "Discovered nodes");
        self.pipeline.push(snapshot, listener.as_ref()).await;
        drop(round);

        self.listener = Some(listener);
        Ok(())
    }

    /// Re-reads the registry and pushes the result, outside of the watch.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the resolver is not running or the
    /// registry cannot be read.
    pub async fn refresh(&self) -> Result<()> {
        let (Some(registry), Some(listener)) = (&self.registry, &self.listener) else {
            return ConfigSnafu { message: "resolver is not running" }.fail();
        };
        self.pipeline.discover_and_push(registry, listener.as_ref()).await
    }

    /// Closes the owned registry: its registrations disappear and the watch
    /// stops. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`] if the registry fails to close.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.listener = None;
        let Some(registry) = self.registry.take() else {
            return Ok(());
        };
        registry.close().await?;
        info!(service_id = %self.pipeline.service_id, "Resolver shut down");
        Ok(())
    }
}
