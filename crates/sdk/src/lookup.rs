//! Hostname lookup.
//!
//! The resolver turns each discovered URI's host into IP addresses through a
//! [`HostLookup`]. [`DnsLookup`] queries the system DNS configuration with
//! hickory; IP literals never touch DNS.

use std::{fmt, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use hickory_resolver::{Resolver, config::ResolverConfig, name_server::TokioConnectionProvider};
use parking_lot::RwLock;

use crate::error::{ResolutionSnafu, Result};

/// Resolves a hostname to IP addresses.
#[async_trait]
pub trait HostLookup: Send + Sync + fmt::Debug {
    /// Returns every address of `host`.
    ///
    /// An empty result is allowed; the resolver treats it as a failure.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Resolution`](crate::DiscoveryError::Resolution)
    /// if the lookup fails.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// DNS-backed [`HostLookup`] using the system resolver configuration.
///
/// The underlying resolver is created on first use and shared by clones.
#[derive(Clone, Default)]
pub struct DnsLookup {
    resolver: Arc<RwLock<Option<Resolver<TokioConnectionProvider>>>>,
}

impl fmt::Debug for DnsLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsLookup")
            .field("initialized", &self.resolver.read().is_some())
            .finish()
    }
}

impl DnsLookup {
    /// Creates a lookup; no resolver is built until the first query.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create_resolver(&self) -> Resolver<TokioConnectionProvider> {
        {
            let guard = self.resolver.read();
            if let Some(ref resolver) = *guard {
                return resolver.clone();
            }
        }

        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();

        let mut guard = self.resolver.write();
        guard.get_or_insert(resolver).clone()
    }
}

#[async_trait]
impl HostLookup for DnsLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![ip]);
        }

        let resolver = self.get_or_create_resolver();
        let lookup = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ResolutionSnafu { host, message: e.to_string() }.build())?;

        Ok(lookup.iter().collect())
    }
}

/// Parses an IP literal, accepting the bracketed IPv6 form URLs use.
pub(crate) fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}
