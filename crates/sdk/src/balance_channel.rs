//! Feeds resolver output into a tonic balanced channel.

use std::{collections::HashSet, net::SocketAddr};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint, channel::Change};
use tracing::{debug, warn};

use crate::{
    error::DiscoveryError,
    resolver::{ResolvedAddressGroup, ResolverListener},
};

/// Change stream consumed by [`Channel::balance_channel`].
pub type EndpointChange = Change<SocketAddr, Endpoint>;

/// Translates every push into insert and remove changes for a tonic
/// balanced channel.
///
/// Every address of every group becomes one endpoint; the channel balances
/// across all of them. Changes are queued in order and forwarded by a
/// background task that waits for room in the channel's bounded queue, so a
/// full queue delays changes but never drops them.
#[derive(Debug)]
pub struct BalanceChannelListener {
    queue: mpsc::UnboundedSender<EndpointChange>,
    scheme: &'static str,
    current: Mutex<HashSet<SocketAddr>>,
}

impl BalanceChannelListener {
    /// Creates a listener sending plaintext `http` endpoints to `changes`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, as the forwarding task is
    /// spawned on the current one.
    #[must_use]
    pub fn new(changes: mpsc::Sender<EndpointChange>) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        tokio::spawn(forward(pending, changes));
        Self { queue, scheme: "http", current: Mutex::new(HashSet::new()) }
    }

    /// Returns a copy that builds `https` endpoints.
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.scheme = "https";
        self
    }

    /// Returns the addresses the channel balances across once every queued
    /// change is delivered.
    #[must_use]
    pub fn endpoints(&self) -> HashSet<SocketAddr> {
        self.current.lock().clone()
    }

    fn endpoint(&self, address: SocketAddr) -> Option<Endpoint> {
        match Endpoint::from_shared(format!("{}://{address}", self.scheme)) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(%address, error = %e, "Skipping invalid endpoint");
                None
            },
        }
    }

    fn enqueue(&self, change: EndpointChange) -> bool {
        if self.queue.send(change).is_err() {
            warn!("Balance channel is gone; dropping endpoint change");
            return false;
        }
        true
    }
}

/// Moves queued changes into the channel, waiting whenever it is full.
async fn forward(mut pending: mpsc::UnboundedReceiver<EndpointChange>, changes: mpsc::Sender<EndpointChange>) {
    while let Some(change) = pending.recv().await {
        if changes.send(change).await.is_err() {
            debug!("Balance channel closed; stopping endpoint updates");
            return;
        }
    }
}

impl ResolverListener for BalanceChannelListener {
    fn on_addresses(&self, groups: Vec<ResolvedAddressGroup>) {
        let next: HashSet<SocketAddr> =
            groups.iter().flat_map(|group| group.addresses().iter().copied()).collect();
        let mut current = self.current.lock();

        let removed: Vec<SocketAddr> = current.difference(&next).copied().collect();
        for address in removed {
            if self.enqueue(Change::Remove(address)) {
                current.remove(&address);
            }
        }

        let added: Vec<SocketAddr> = next.difference(&current).copied().collect();
        for address in added {
            let Some(endpoint) = self.endpoint(address) else { continue };
            if self.enqueue(Change::Insert(address, endpoint)) {
                current.insert(address);
            }
        }
        debug!(endpoints = current.len(), "Balance channel endpoints updated");
    }

    fn on_error(&self, error: DiscoveryError) {
        warn!(error = %error, "Resolution failed; balance channel keeps its endpoints");
    }
}

/// Creates a balanced channel and the listener that drives it.
///
/// Must be called inside a tokio runtime.
#[must_use]
pub fn balance_channel(capacity: usize) -> (Channel, BalanceChannelListener) {
    let (channel, changes) = Channel::balance_channel::<SocketAddr>(capacity);
    (channel, BalanceChannelListener::new(changes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    };

    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 443)
    }

    fn describe(change: EndpointChange) -> (char, SocketAddr) {
        match change {
            Change::Insert(address, _) => ('+', address),
            Change::Remove(address) => ('-', address),
        }
    }

    /// Receives exactly `count` changes, sorted.
    async fn receive(rx: &mut mpsc::Receiver<EndpointChange>, count: usize) -> Vec<(char, SocketAddr)> {
        let mut changes = Vec::new();
        for _ in 0..count {
            let change = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            changes.push(describe(change));
        }
        changes.sort();
        changes
    }

    async fn assert_idle(rx: &mut mpsc::Receiver<EndpointChange>) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pushes_become_insert_and_remove_diffs() {
        let (tx, mut rx) = mpsc::channel(16);
        let listener = BalanceChannelListener::new(tx);

        listener.on_addresses(vec![
            ResolvedAddressGroup::new("Z1", vec![addr(1), addr(2)]),
            ResolvedAddressGroup::new("Z2", vec![addr(3)]),
        ]);
        assert_eq!(receive(&mut rx, 3).await, vec![('+', addr(1)), ('+', addr(2)), ('+', addr(3))]);

        listener.on_addresses(vec![ResolvedAddressGroup::new("Z1", vec![addr(2), addr(4)])]);
        assert_eq!(receive(&mut rx, 3).await, vec![('+', addr(4)), ('-', addr(1)), ('-', addr(3))]);

        assert_eq!(listener.endpoints(), HashSet::from([addr(2), addr(4)]));
        assert_idle(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unchanged_push_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(16);
        let listener = BalanceChannelListener::new(tx);
        let groups = vec![ResolvedAddressGroup::new("Z1", vec![addr(1)])];

        listener.on_addresses(groups.clone());
        receive(&mut rx, 1).await;
        listener.on_addresses(groups);

        assert_idle(&mut rx).await;
    }

    #[tokio::test]
    async fn test_full_queue_delivers_without_another_push() {
        let (tx, mut rx) = mpsc::channel(1);
        let listener = BalanceChannelListener::new(tx);

        listener.on_addresses(vec![ResolvedAddressGroup::new("Z1", vec![addr(1), addr(2), addr(3)])]);
        listener.on_addresses(vec![ResolvedAddressGroup::new("Z1", vec![addr(3)])]);
        assert_eq!(listener.endpoints(), HashSet::from([addr(3)]));

        let mut changes = Vec::new();
        for _ in 0..5 {
            let change = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            changes.push(describe(change));
        }
        let removes: Vec<_> = changes.iter().filter(|(kind, _)| *kind == '-').collect();
        assert_eq!(removes.len(), 2);
        assert!(changes.contains(&('+', addr(3))));
        assert_idle(&mut rx).await;
    }

    #[tokio::test]
    async fn test_removal_follows_its_insert() {
        let (tx, mut rx) = mpsc::channel(1);
        let listener = BalanceChannelListener::new(tx);

        listener.on_addresses(vec![ResolvedAddressGroup::new("Z1", vec![addr(1)])]);
        listener.on_addresses(vec![]);

        let first = describe(rx.recv().await.unwrap());
        let second = describe(rx.recv().await.unwrap());
        assert_eq!((first, second), (('+', addr(1)), ('-', addr(1))));
    }

    #[tokio::test]
    async fn test_balance_channel_helper() {
        let (_channel, listener) = balance_channel(8);
        listener.on_addresses(vec![ResolvedAddressGroup::new("Z1", vec![addr(1)])]);
        assert_eq!(listener.endpoints(), HashSet::from([addr(1)]));
    }
}
