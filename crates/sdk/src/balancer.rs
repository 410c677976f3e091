//! Resolver listener that keeps the current [`AddressList`].

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    address_list::{AddressList, TransportManager},
    error::DiscoveryError,
    resolver::{ResolvedAddressGroup, ResolverListener},
};

/// Swaps in a new [`AddressList`] on every resolver push.
///
/// Readers load the current list without locking; each push replaces it
/// wholesale. A resolution error keeps the last good list.
pub struct AddressListBalancer<M: TransportManager> {
    manager: Arc<M>,
    current: ArcSwap<AddressList<M>>,
    last_error: Mutex<Option<String>>,
}

impl<M: TransportManager> AddressListBalancer<M> {
    /// Creates a balancer holding an empty list.
    #[must_use]
    pub fn new(manager: Arc<M>) -> Self {
        let empty = AddressList::builder(Arc::clone(&manager)).build();
        Self { manager, current: ArcSwap::from_pointee(empty), last_error: Mutex::new(None) }
    }

    /// Returns the transport for the head of the current list.
    #[must_use]
    pub fn pick(&self) -> M::Transport {
        self.current.load().transport_for_next_server()
    }

    /// Returns the current list.
    #[must_use]
    pub fn snapshot(&self) -> Arc<AddressList<M>> {
        self.current.load_full()
    }

    /// Returns the message of the most recent resolution error, cleared by
    /// the next successful push.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl<M: TransportManager> fmt::Debug for AddressListBalancer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressListBalancer")
            .field("servers", &self.current.load().len())
            .field("last_error", &self.last_error())
            .finish()
    }
}

impl<M: TransportManager + 'static> ResolverListener for AddressListBalancer<M> {
    fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>) {
        let list = AddressList::from_groups(Arc::clone(&self.manager), groups);
        info!(servers = list.len(), "Address list updated");
        self.current.store(Arc::new(list));
        *self.last_error.lock() = None;
    }

    fn on_error(&self, error: DiscoveryError) {
        warn!(error = %error, "Resolution failed; keeping previous address list");
        *self.last_error.lock() = Some(error.to_string());
    }
}
