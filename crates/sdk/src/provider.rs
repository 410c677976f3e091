//! Name resolver plug-in points.
//!
//! Channels address services by target URI, e.g. `registry://billing`. A
//! [`ResolverRegistry`] maps the target's scheme to a
//! [`NameResolverProvider`], which creates a [`NameResolver`] for the target.
//! [`ZoneAwareResolverProvider`] is the registry-backed provider.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use snafu::{OptionExt, ensure};
use tracing::{debug, info};
use url::Url;

use crate::{
    config::RegistryConfig,
    coordination::Coordinator,
    error::{ConfigSnafu, InvalidTargetSnafu, Result},
    lookup::{DnsLookup, HostLookup},
    registry::ServiceRegistry,
    resolver::{ResolverListener, ZoneAwareResolver, ZoneComparator},
};

/// Default target scheme of [`ZoneAwareResolverProvider`].
pub const DEFAULT_SCHEME: &str = "registry";

/// Resolves one target into address groups for a listener.
#[async_trait]
pub trait NameResolver: Send + Sync + fmt::Debug {
    /// Returns the authority used for the target's calls.
    fn service_authority(&self) -> &str;

    /// Starts resolution, delivering results to `listener`.
    async fn start(&mut self, listener: Arc<dyn ResolverListener>) -> Result<()>;

    /// Requests an out-of-band re-resolution.
    async fn refresh(&self) -> Result<()>;

    /// Stops resolution and releases resources. Idempotent.
    async fn shutdown(&mut self) -> Result<()>;
}

#[async_trait]
impl NameResolver for ZoneAwareResolver {
    fn service_authority(&self) -> &str {
        ZoneAwareResolver::service_authority(self)
    }

    async fn start(&mut self, listener: Arc<dyn ResolverListener>) -> Result<()> {
        ZoneAwareResolver::start(self, listener).await
    }

    async fn refresh(&self) -> Result<()> {
        ZoneAwareResolver::refresh(self).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        ZoneAwareResolver::shutdown(self).await
    }
}

/// Creates [`NameResolver`]s for targets of one scheme.
#[async_trait]
pub trait NameResolverProvider: Send + Sync + fmt::Debug {
    /// Returns the target scheme this provider handles.
    fn scheme(&self) -> &str;

    /// Creates a resolver for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidTarget`](crate::DiscoveryError::InvalidTarget)
    /// if the target is malformed, or any error raised while setting up the
    /// resolver.
    async fn new_resolver(&self, target: &Url) -> Result<Box<dyn NameResolver>>;
}

/// Scheme-to-provider table.
#[derive(Debug, Default)]
pub struct ResolverRegistry {
    providers: RwLock<HashMap<String, Arc<dyn NameResolverProvider>>>,
}

impl ResolverRegistry {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` for its scheme, returning the provider it replaced.
    pub fn register(
        &self,
        provider: Arc<dyn NameResolverProvider>,
    ) -> Option<Arc<dyn NameResolverProvider>> {
        let scheme = provider.scheme().to_ascii_lowercase();
        debug!(scheme, "Registered name resolver provider");
        self.providers.write().insert(scheme, provider)
    }

    /// Removes the provider of `scheme`.
    pub fn deregister(&self, scheme: &str) -> bool {
        self.providers.write().remove(&scheme.to_ascii_lowercase()).is_some()
    }

    /// Returns the provider of `scheme`.
    #[must_use]
    pub fn provider(&self, scheme: &str) -> Option<Arc<dyn NameResolverProvider>> {
        self.providers.read().get(&scheme.to_ascii_lowercase()).cloned()
    }

    /// Returns the registered schemes, sorted.
    #[must_use]
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.providers.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Parses `target` and creates a resolver through the provider of its
    /// scheme.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidTarget`](crate::DiscoveryError::InvalidTarget)
    /// if the target does not parse or no provider handles its scheme.
    pub async fn new_resolver(&self, target: &str) -> Result<Box<dyn NameResolver>> {
        let url = Url::parse(target)
            .map_err(|e| InvalidTargetSnafu { target, message: e.to_string() }.build())?;
        let provider = self.provider(url.scheme()).context(InvalidTargetSnafu {
            target,
            message: format!("no resolver registered for scheme '{}'", url.scheme()),
        })?;
        provider.new_resolver(&url).await
    }
}

/// Provider of [`ZoneAwareResolver`]s backed by the service registry.
///
/// Each resolver gets its own registry session, closed when the resolver shuts
/// down.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use lodestar_sdk::{
/// #     MemoryEnsemble, RegistryConfig, ResolverRegistry, ZoneAffinity, ZoneAwareResolverProvider,
/// # };
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = ZoneAwareResolverProvider::builder()
///     .coordinator(Arc::new(MemoryEnsemble::new()))
///     .config(RegistryConfig::builder().with_connect_string("zk1:2181,zk2:2181").build()?)
///     .comparator(ZoneAffinity::prefer("us-east-1a"))
///     .build()?;
///
/// let resolvers = ResolverRegistry::new();
/// resolvers.register(Arc::new(provider));
/// # Ok(())
/// # }
/// ```
pub struct ZoneAwareResolverProvider {
    coordinator: Arc<dyn Coordinator>,
    config: RegistryConfig,
    lookup: Arc<dyn HostLookup>,
    comparator: Option<ZoneComparator>,
    scheme: String,
}

impl fmt::Debug for ZoneAwareResolverProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneAwareResolverProvider")
            .field("coordinator", &self.coordinator)
            .field("config", &self.config)
            .field("lookup", &self.lookup)
            .field("zone_ordering", &self.comparator.is_some())
            .field("scheme", &self.scheme)
            .finish()
    }
}

fn default_lookup() -> Arc<dyn HostLookup> {
    Arc::new(DnsLookup::new())
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_owned()
}

#[bon::bon]
impl ZoneAwareResolverProvider {
    /// Creates a provider with validation.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Config`](crate::DiscoveryError::Config) if the
    /// scheme is empty or not a valid URI scheme.
    #[builder]
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        config: RegistryConfig,
        #[builder(default = default_lookup())] lookup: Arc<dyn HostLookup>,
        comparator: Option<ZoneComparator>,
        #[builder(into, default = default_scheme())] scheme: String,
    ) -> Result<Self> {
        ensure!(
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
            ConfigSnafu { message: format!("invalid target scheme '{scheme}'") }
        );
        Ok(Self { coordinator, config, lookup, comparator, scheme: scheme.to_ascii_lowercase() })
    }

    /// Returns the registry configuration each resolver connects with.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

#[async_trait]
impl NameResolverProvider for ZoneAwareResolverProvider {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn new_resolver(&self, target: &Url) -> Result<Box<dyn NameResolver>> {
        ensure!(
            target.scheme().eq_ignore_ascii_case(&self.scheme),
            InvalidTargetSnafu {
                target: target.as_str(),
                message: format!("expected scheme '{}'", self.scheme),
            }
        );
        let service_id = service_id_of(target)?;

        let registry = ServiceRegistry::connect(self.coordinator.as_ref(), self.config.clone()).await?;
        info!(target = %target, service_id, "Created zone-aware resolver");
        Ok(Box::new(ZoneAwareResolver::new(
            service_id,
            registry,
            Arc::clone(&self.lookup),
            self.comparator.clone(),
        )))
    }
}

/// Extracts the service id: the authority (`registry://svc`) or, when the
/// authority is empty, the path (`registry:///svc`).
fn service_id_of(target: &Url) -> Result<String> {
    let from_authority = target.host_str().filter(|h| !h.is_empty());
    let service_id = match from_authority {
        Some(host) => host.to_owned(),
        None => target.path().trim_matches('/').to_owned(),
    };
    ensure!(
        !service_id.is_empty() && !service_id.contains('/'),
        InvalidTargetSnafu { target: target.as_str(), message: "target does not name a service" }
    );
    Ok(service_id)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use super::*;
    use crate::{
        coordination::MemoryEnsemble,
        error::DiscoveryError,
        mock::{RecordingListener, StaticLookup},
        resolver::{ResolvedAddressGroup, ZoneAffinity},
    };

    fn config() -> RegistryConfig {
        RegistryConfig::builder().with_connect_string("localhost:2181").build().unwrap()
    }

    fn provider(ensemble: &MemoryEnsemble) -> ZoneAwareResolverProvider {
        ZoneAwareResolverProvider::builder()
            .coordinator(Arc::new(ensemble.clone()))
            .config(config())
            .lookup(Arc::new(
                StaticLookup::new()
                    .with_host("near", [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))])
                    .with_host("far", [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))]),
            ))
            .comparator(ZoneAffinity::prefer("Z1"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_service_id_from_authority_or_path() {
        assert_eq!(service_id_of(&Url::parse("registry://billing").unwrap()).unwrap(), "billing");
        assert_eq!(service_id_of(&Url::parse("registry:///billing").unwrap()).unwrap(), "billing");
        assert!(service_id_of(&Url::parse("registry:///").unwrap()).is_err());
        assert!(service_id_of(&Url::parse("registry:///a/b").unwrap()).is_err());
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let ensemble = MemoryEnsemble::new();
        for bad in ["", "1abc", "with space"] {
            let result = ZoneAwareResolverProvider::builder()
                .coordinator(Arc::new(ensemble.clone()))
                .config(config())
                .scheme(bad)
                .build();
            assert!(result.is_err(), "'{bad}' should be rejected");
        }
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let ensemble = MemoryEnsemble::new();
        let resolvers = ResolverRegistry::new();
        assert!(resolvers.register(Arc::new(provider(&ensemble))).is_none());
        assert!(resolvers.register(Arc::new(provider(&ensemble))).is_some());

        assert_eq!(resolvers.schemes(), vec![DEFAULT_SCHEME.to_owned()]);
        assert!(resolvers.provider("REGISTRY").is_some());
        assert!(resolvers.deregister("registry"));
        assert!(resolvers.provider("registry").is_none());
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_invalid_target() {
        let resolvers = ResolverRegistry::new();
        let err = resolvers.new_resolver("dns://billing").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidTarget { .. }));

        let err = resolvers.new_resolver("not a uri").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidTarget { .. }));
    }

    #[tokio::test]
    async fn test_end_to_end_resolution_through_registry() {
        let ensemble = MemoryEnsemble::new();
        let server = ServiceRegistry::connect(&ensemble, config()).await.unwrap();
        server
            .register_in_zone("billing", &Url::parse("dns://near:7000").unwrap(), "Z1")
            .await
            .unwrap();
        server
            .register_in_zone("billing", &Url::parse("dns://far:7000").unwrap(), "Z2")
            .await
            .unwrap();

        let resolvers = ResolverRegistry::new();
        resolvers.register(Arc::new(provider(&ensemble)));

        let mut resolver = resolvers.new_resolver("registry://billing").await.unwrap();
        assert_eq!(resolver.service_authority(), "billing");

        let listener = Arc::new(RecordingListener::new());
        resolver.start(listener.clone()).await.unwrap();

        assert_eq!(
            listener.last_push(),
            Some(vec![
                ResolvedAddressGroup::new(
                    "Z1",
                    vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7000)]
                ),
                ResolvedAddressGroup::new(
                    "Z2",
                    vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 7000)]
                ),
            ])
        );

        // Closing removes the two instances one at a time.
        server.close().await.unwrap();
        assert!(listener.wait_for_pushes(3, Duration::from_secs(5)).await);
        assert_eq!(listener.last_push(), Some(vec![]));

        resolver.shutdown().await.unwrap();
        assert_eq!(ensemble.connected_sessions(), 0);
    }

    #[tokio::test]
    async fn test_provider_rejects_foreign_scheme() {
        let ensemble = MemoryEnsemble::new();
        let provider = provider(&ensemble);
        let err = provider.new_resolver(&Url::parse("dns://billing").unwrap()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidTarget { .. }));
    }
}
