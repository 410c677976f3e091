//! Service instance value types.

use std::{fmt, slice};

use serde::{Deserialize, Serialize};
use url::Url;

/// Zone assigned to instances registered without one.
pub const DEFAULT_ZONE: &str = "default";

fn default_zone() -> String {
    DEFAULT_ZONE.to_owned()
}

/// A discovered server: its URI and the zone it runs in.
///
/// This is also the payload stored in each instance node:
/// `{"uri": "dns://host:port", "zone": "us-east-1a"}`. A payload without a
/// zone decodes to [`DEFAULT_ZONE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndZone {
    /// Instance URI; host and port are used for address resolution.
    pub uri: Url,
    /// Zone label; metadata only, never used to filter.
    #[serde(default = "default_zone")]
    pub zone: String,
}

impl HostAndZone {
    /// Creates a host/zone pair.
    #[must_use]
    pub fn new(uri: Url, zone: impl Into<String>) -> Self {
        Self { uri, zone: zone.into() }
    }

    /// Creates a pair in [`DEFAULT_ZONE`].
    #[must_use]
    pub fn unzoned(uri: Url) -> Self {
        Self::new(uri, DEFAULT_ZONE)
    }
}

impl fmt::Display for HostAndZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.uri, self.zone)
    }
}

/// An instance registered by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    service_id: String,
    uri: Url,
    zone: String,
    sequence: u64,
    path: String,
}

impl ServiceInstance {
    pub(crate) fn new(
        service_id: impl Into<String>,
        uri: Url,
        zone: impl Into<String>,
        sequence: u64,
        path: impl Into<String>,
    ) -> Self {
        Self { service_id: service_id.into(), uri, zone: zone.into(), sequence, path: path.into() }
    }

    /// Returns the service the instance belongs to.
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Returns the instance URI.
    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Returns the instance zone.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Returns the registration sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the node path of the registration.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the instance as a host/zone pair.
    #[must_use]
    pub fn host_and_zone(&self) -> HostAndZone {
        HostAndZone::new(self.uri.clone(), self.zone.clone())
    }
}

/// Live membership of one service, most recently registered first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSnapshot {
    entries: Vec<HostAndZone>,
}

impl ServiceSnapshot {
    /// Creates a snapshot from entries already in delivery order.
    #[must_use]
    pub fn new(entries: Vec<HostAndZone>) -> Self {
        Self { entries }
    }

    /// Returns the entries.
    #[must_use]
    pub fn entries(&self) -> &[HostAndZone] {
        &self.entries
    }

    /// Returns the number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the entries.
    pub fn iter(&self) -> slice::Iter<'_, HostAndZone> {
        self.entries.iter()
    }

    /// Projects out the URIs, keeping order.
    #[must_use]
    pub fn uris(&self) -> Vec<Url> {
        self.entries.iter().map(|e| e.uri.clone()).collect()
    }

    /// Consumes the snapshot, returning its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<HostAndZone> {
        self.entries
    }
}

impl From<Vec<HostAndZone>> for ServiceSnapshot {
    fn from(entries: Vec<HostAndZone>) -> Self {
        Self::new(entries)
    }
}

impl IntoIterator for ServiceSnapshot {
    type Item = HostAndZone;
    type IntoIter = std::vec::IntoIter<HostAndZone>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ServiceSnapshot {
    type Item = &'a HostAndZone;
    type IntoIter = slice::Iter<'a, HostAndZone>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl fmt::Display for ServiceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{entry}")?;
        }
        f.write_str("]")
    }
}
