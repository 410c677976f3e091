//! Immutable server lists and transport selection.
//!
//! An [`AddressList`] is built once from resolver output and never changes;
//! new resolution results produce a new list. Selection always picks the head
//! entry, so the resolver's ordering (most recent registration first, or own
//! zone first) decides where calls go.

use std::{fmt, net::SocketAddr, sync::Arc};

use tonic::Status;

use crate::{instance::DEFAULT_ZONE, resolver::ResolvedAddressGroup};

/// Description of the transport handed out for drop entries and empty lists.
pub const THROTTLED_DESCRIPTION: &str = "Throttled by LB";

/// Creates transports for address groups.
pub trait TransportManager: Send + Sync {
    /// Handle to a transport; cheap to clone.
    type Transport: Clone + Send + Sync;

    /// Returns a transport to `group`, creating it if needed.
    fn get_transport(&self, group: &ResolvedAddressGroup) -> Self::Transport;

    /// Returns a transport that fails every call with `status`.
    fn create_failing_transport(&self, status: Status) -> Self::Transport;
}

/// One position in an [`AddressList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEntry {
    /// A server reachable at any of the group's addresses.
    Group(ResolvedAddressGroup),
    /// Calls routed here are dropped.
    Drop,
}

/// Accumulates entries for an [`AddressList`].
pub struct AddressListBuilder<M: TransportManager> {
    manager: Arc<M>,
    entries: Vec<AddressEntry>,
}

impl<M: TransportManager> AddressListBuilder<M> {
    /// Creates an empty builder whose list will use `manager`.
    #[must_use]
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager, entries: Vec::new() }
    }

    /// Adds a single-address server in the default zone.
    #[must_use]
    pub fn add_address(self, address: SocketAddr) -> Self {
        self.add_group(vec![address])
    }

    /// Adds one server reachable at any of `addresses`, in the default zone.
    #[must_use]
    pub fn add_group(self, addresses: Vec<SocketAddr>) -> Self {
        self.add_resolved(ResolvedAddressGroup::new(DEFAULT_ZONE, addresses))
    }

    /// Adds a resolved group.
    #[must_use]
    pub fn add_resolved(mut self, group: ResolvedAddressGroup) -> Self {
        self.entries.push(AddressEntry::Group(group));
        self
    }

    /// Adds a drop entry.
    #[must_use]
    pub fn add_drop(mut self) -> Self {
        self.entries.push(AddressEntry::Drop);
        self
    }

    /// Builds the list. The throttled transport is created here, once.
    #[must_use]
    pub fn build(self) -> AddressList<M> {
        let throttled = self.manager.create_failing_transport(Status::unavailable(THROTTLED_DESCRIPTION));
        AddressList { manager: self.manager, entries: self.entries, throttled }
    }
}

/// Ordered, immutable list of servers.
pub struct AddressList<M: TransportManager> {
    manager: Arc<M>,
    entries: Vec<AddressEntry>,
    throttled: M::Transport,
}

impl<M: TransportManager> AddressList<M> {
    /// Starts a list using `manager`.
    #[must_use]
    pub fn builder(manager: Arc<M>) -> AddressListBuilder<M> {
        AddressListBuilder::new(manager)
    }

    /// Builds a list holding `groups` in order.
    #[must_use]
    pub fn from_groups(manager: Arc<M>, groups: impl IntoIterator<Item = ResolvedAddressGroup>) -> Self {
        groups.into_iter().fold(Self::builder(manager), AddressListBuilder::add_resolved).build()
    }

    /// Returns the transport for the head entry.
    ///
    /// A drop entry at the head, or an empty list, yields the throttled
    /// transport that fails calls with `UNAVAILABLE`.
    #[must_use]
    pub fn transport_for_next_server(&self) -> M::Transport {
        match self.entries.first() {
            Some(AddressEntry::Group(group)) => self.manager.get_transport(group),
            Some(AddressEntry::Drop) | None => self.throttled.clone(),
        }
    }

    /// Returns the entries in selection order.
    #[must_use]
    pub fn entries(&self) -> &[AddressEntry] {
        &self.entries
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the list has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M: TransportManager> fmt::Debug for AddressList<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressList").field("entries", &self.entries).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tonic::Code;

    use super::*;
    use crate::mock::{MockTransport, RecordingTransportManager};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 9000)
    }

    #[test]
    fn test_empty_list_returns_throttled_transport() {
        let manager = Arc::new(RecordingTransportManager::new());
        let list = AddressList::builder(manager.clone()).build();

        assert!(list.is_empty());
        assert_eq!(
            list.transport_for_next_server(),
            MockTransport::Failing { code: Code::Unavailable, message: THROTTLED_DESCRIPTION.to_owned() }
        );
        assert!(manager.requested().is_empty());
    }

    #[test]
    fn test_head_of_list_is_selected() {
        let manager = Arc::new(RecordingTransportManager::new());
        let list = AddressList::builder(manager.clone())
            .add_address(addr(1))
            .add_group(vec![addr(2), addr(3)])
            .build();

        let head = ResolvedAddressGroup::new(DEFAULT_ZONE, vec![addr(1)]);
        assert_eq!(list.transport_for_next_server(), MockTransport::Connected(head.clone()));
        assert_eq!(list.transport_for_next_server(), MockTransport::Connected(head.clone()));
        assert_eq!(manager.requested(), vec![head.clone(), head]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_drop_entry_at_head_is_throttled() {
        let manager = Arc::new(RecordingTransportManager::new());
        let list = AddressList::builder(manager.clone()).add_drop().add_address(addr(1)).build();

        assert!(matches!(
            list.transport_for_next_server(),
            MockTransport::Failing { code: Code::Unavailable, .. }
        ));
        assert_eq!(list.entries()[0], AddressEntry::Drop);
    }

    #[test]
    fn test_from_groups_keeps_order_and_zones() {
        let manager = Arc::new(RecordingTransportManager::new());
        let groups = vec![
            ResolvedAddressGroup::new("Z2", vec![addr(2)]),
            ResolvedAddressGroup::new("Z1", vec![addr(1)]),
        ];
        let list = AddressList::from_groups(manager, groups.clone());

        assert_eq!(list.transport_for_next_server(), MockTransport::Connected(groups[0].clone()));
        assert_eq!(
            list.entries(),
            &[AddressEntry::Group(groups[0].clone()), AddressEntry::Group(groups[1].clone())]
        );
    }
}
