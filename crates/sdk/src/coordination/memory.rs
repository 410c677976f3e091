//! In-process coordination ensemble.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChildNode, ChildWatch, ChildrenChanged, CoordinationError, CoordinationResult,
    CoordinationSession, Coordinator, SessionId, SessionState, parent_of, validate_path,
};
use crate::config::ConnectString;

/// An in-process coordination ensemble.
///
/// Implements the full session contract: persistent and ephemeral nodes,
/// per-parent sequence numbers, ephemeral cleanup when a session ends and
/// ordered child watches. Every mutation and the notifications it produces
/// happen under one lock, so each watch event carries the exact child list
/// that resulted from its change.
///
/// Clones share the same ensemble.
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use lodestar_sdk::{ConnectString, Coordinator, MemoryEnsemble};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ensemble = MemoryEnsemble::new();
/// let connect: ConnectString = "localhost:2181".parse()?;
/// let session = ensemble.connect(&connect, Duration::from_secs(10)).await?;
/// session.ensure_path("/lodestar/services/demo").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryEnsemble {
    inner: Arc<Ensemble>,
}

#[derive(Debug, Default)]
struct Ensemble {
    state: Mutex<EnsembleState>,
    next_session: AtomicU64,
    unreachable: AtomicBool,
}

#[derive(Debug, Default)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    sessions: HashMap<SessionId, SessionState>,
    watchers: Vec<Watcher>,
}

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
    sequence: u64,
}

#[derive(Debug)]
struct Watcher {
    session: SessionId,
    parent: String,
    events: mpsc::UnboundedSender<ChildrenChanged>,
}

impl MemoryEnsemble {
    /// Creates an empty ensemble.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expires a session as if its heartbeats had stopped.
    ///
    /// Removes the session's ephemeral nodes and ends its watches. Returns
    /// `false` if the session was not connected.
    pub fn expire_session(&self, session_id: SessionId) -> bool {
        let mut state = self.inner.state.lock();
        if state.session_state(session_id) != SessionState::Connected {
            return false;
        }
        let removed = state.end_session(session_id, SessionState::Expired);
        tracing::warn!(session = %session_id, removed, "Session expired");
        true
    }

    /// Makes the ensemble reachable or unreachable.
    ///
    /// While unreachable, `connect` and every session operation fail with
    /// [`CoordinationError::ConnectionLoss`]; sessions are kept.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Returns the number of connected sessions.
    #[must_use]
    pub fn connected_sessions(&self) -> usize {
        self.inner.state.lock().sessions.values().filter(|s| s.is_connected()).count()
    }

    /// Lists the children of `parent` without going through a session.
    #[must_use]
    pub fn children_of(&self, parent: &str) -> Vec<ChildNode> {
        self.inner.state.lock().children_of(parent)
    }
}

#[async_trait]
impl Coordinator for MemoryEnsemble {
    async fn connect(
        &self,
        connect_string: &ConnectString,
        session_timeout: Duration,
    ) -> CoordinationResult<Arc<dyn CoordinationSession>> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss {
                message: format!("no ensemble member reachable at {connect_string}"),
            });
        }

        let id = SessionId::new(self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.state.lock().sessions.insert(id, SessionState::Connected);
        tracing::debug!(
            session = %id,
            servers = %connect_string,
            timeout_ms = session_timeout.as_millis() as u64,
            "Session established"
        );

        Ok(Arc::new(MemorySession { id, ensemble: Arc::clone(&self.inner) }))
    }
}

/// A session on a [`MemoryEnsemble`].
#[derive(Debug)]
struct MemorySession {
    id: SessionId,
    ensemble: Arc<Ensemble>,
}

impl MemorySession {
    fn with_state<T>(
        &self,
        op: impl FnOnce(&mut EnsembleState) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        if self.ensemble.unreachable.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss {
                message: "ensemble unreachable".to_owned(),
            });
        }
        let mut state = self.ensemble.state.lock();
        state.check(self.id)?;
        op(&mut state)
    }
}

#[async_trait]
impl CoordinationSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        self.ensemble.state.lock().session_state(self.id)
    }

    async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        validate_path(path)?;
        self.with_state(|state| {
            let mut current = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                current.push('/');
                current.push_str(segment);
                if !state.nodes.contains_key(&current) {
                    state.insert(&current, Vec::new(), None)?;
                }
            }
            Ok(())
        })
    }

    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
        data: Vec<u8>,
    ) -> CoordinationResult<ChildNode> {
        validate_path(parent)?;
        if prefix.contains('/') {
            return Err(CoordinationError::InvalidPath {
                path: format!("{parent}/{prefix}"),
                reason: "node name must not contain '/'",
            });
        }
        let owner = self.id;
        self.with_state(|state| {
            let sequence = state.peek_sequence(parent);
            let path = join(parent, &format!("{prefix}{sequence:010}"));
            state.insert(&path, data, Some(owner))
        })
    }

    async fn delete(&self, path: &str) -> CoordinationResult<bool> {
        validate_path(path)?;
        self.with_state(|state| {
            if !state.children_of(path).is_empty() {
                return Err(CoordinationError::NotEmpty { path: path.to_owned() });
            }
            Ok(state.remove(path))
        })
    }

    async fn delete_recursive(&self, path: &str) -> CoordinationResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::InvalidPath {
                path: path.to_owned(),
                reason: "the root cannot be deleted",
            });
        }
        self.with_state(|state| {
            let prefix = format!("{path}/");
            let mut doomed: Vec<String> = state
                .nodes
                .keys()
                .filter(|p| p.as_str() == path || p.starts_with(&prefix))
                .cloned()
                .collect();
            // Deepest first so every removal is a leaf removal.
            doomed.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
            for node in &doomed {
                state.remove(node);
            }
            Ok(())
        })
    }

    async fn children(&self, parent: &str) -> CoordinationResult<Vec<ChildNode>> {
        validate_path(parent)?;
        self.with_state(|state| Ok(state.children_of(parent)))
    }

    async fn watch_children(&self, parent: &str) -> CoordinationResult<ChildWatch> {
        validate_path(parent)?;
        let session = self.id;
        self.with_state(|state| {
            let (tx, rx) = mpsc::unbounded_channel();
            state.watchers.push(Watcher { session, parent: parent.to_owned(), events: tx });
            Ok(ChildWatch::new(parent, rx))
        })
    }

    async fn close(&self) -> CoordinationResult<()> {
        let mut state = self.ensemble.state.lock();
        if state.session_state(self.id) != SessionState::Connected {
            return Ok(());
        }
        let removed = state.end_session(self.id, SessionState::Closed);
        tracing::debug!(session = %self.id, removed, "Session closed");
        Ok(())
    }
}

impl EnsembleState {
    fn session_state(&self, id: SessionId) -> SessionState {
        self.sessions.get(&id).copied().unwrap_or(SessionState::Closed)
    }

    fn check(&self, id: SessionId) -> CoordinationResult<()> {
        match self.session_state(id) {
            SessionState::Connected => Ok(()),
            SessionState::Expired => Err(CoordinationError::SessionExpired { session_id: id }),
            SessionState::Closed => Err(CoordinationError::SessionClosed { session_id: id }),
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn peek_sequence(&self, parent: &str) -> u64 {
        self.sequences.get(parent).copied().unwrap_or(0)
    }

    fn children_of(&self, parent: &str) -> Vec<ChildNode> {
        let prefix = if parent == "/" { "/".to_owned() } else { format!("{parent}/") };
        let mut children: Vec<ChildNode> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .map(|(path, node)| ChildNode {
                name: path[prefix.len()..].to_owned(),
                path: path.clone(),
                sequence: node.sequence,
                data: node.data.clone(),
                owner: node.owner,
            })
            .collect();
        children.sort_by_key(|c| c.sequence);
        children
    }

    fn insert(
        &mut self,
        path: &str,
        data: Vec<u8>,
        owner: Option<SessionId>,
    ) -> CoordinationResult<ChildNode> {
        let parent = parent_of(path).ok_or_else(|| CoordinationError::InvalidPath {
            path: path.to_owned(),
            reason: "the root already exists",
        })?;
        if !self.exists(parent) {
            return Err(CoordinationError::NoNode { path: parent.to_owned() });
        }

        let counter = self.sequences.entry(parent.to_owned()).or_insert(0);
        let sequence = *counter;
        *counter += 1;

        let name = path[parent.len()..].trim_start_matches('/').to_owned();
        self.nodes.insert(path.to_owned(), Node { data: data.clone(), owner, sequence });
        let parent = parent.to_owned();
        self.notify(&parent);

        Ok(ChildNode { name, path: path.to_owned(), sequence, data, owner })
    }

    fn remove(&mut self, path: &str) -> bool {
        if self.nodes.remove(path).is_none() {
            return false;
        }
        self.sequences.remove(path);
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_owned();
            self.notify(&parent);
        }
        true
    }

    /// Marks a session finished, drops its watches and removes its ephemerals.
    fn end_session(&mut self, id: SessionId, final_state: SessionState) -> usize {
        self.sessions.insert(id, final_state);
        self.watchers.retain(|w| w.session != id);

        let mut owned: Vec<(u64, String)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(id))
            .map(|(path, node)| (node.sequence, path.clone()))
            .collect();
        owned.sort();
        for (_, path) in &owned {
            self.remove(path);
        }
        owned.len()
    }

    fn notify(&mut self, parent: &str) {
        self.watchers.retain(|w| !w.events.is_closed());
        if !self.watchers.iter().any(|w| w.parent == parent) {
            return;
        }
        let children = self.children_of(parent);
        for watcher in self.watchers.iter().filter(|w| w.parent == parent) {
            let _ = watcher
                .events
                .send(ChildrenChanged { parent: parent.to_owned(), children: children.clone() });
        }
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" { format!("/{name}") } else { format!("{parent}/{name}") }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    const PARENT: &str = "/lodestar/services/demo";

    async fn session(ensemble: &MemoryEnsemble) -> Arc<dyn CoordinationSession> {
        let connect: ConnectString = "localhost:2181".parse().unwrap();
        ensemble.connect(&connect, Duration::from_secs(10)).await.unwrap()
    }

    fn names(children: &[ChildNode]) -> Vec<&str> {
        children.iter().map(|c| c.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_sequential_names_are_zero_padded() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        s.ensure_path(PARENT).await.unwrap();

        let first = s.create_ephemeral_sequential(PARENT, "instance-", b"a".to_vec()).await.unwrap();
        let second = s.create_ephemeral_sequential(PARENT, "instance-", b"b".to_vec()).await.unwrap();

        assert_eq!(first.name, "instance-0000000000");
        assert_eq!(second.name, "instance-0000000001");
        assert_eq!(second.path, format!("{PARENT}/instance-0000000001"));
        assert!(second.sequence > first.sequence);
        assert_eq!(first.owner, Some(s.id()));
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;

        let err = s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap_err();
        assert_eq!(err, CoordinationError::NoNode { path: PARENT.to_owned() });
    }

    #[tokio::test]
    async fn test_children_listed_in_creation_order() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        s.ensure_path(PARENT).await.unwrap();
        for _ in 0..3 {
            s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();
        }

        let children = s.children(PARENT).await.unwrap();
        assert_eq!(
            names(&children),
            vec!["instance-0000000000", "instance-0000000001", "instance-0000000002"]
        );
        assert!(s.children("/lodestar/services/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals_and_notifies_other_sessions() {
        let ensemble = MemoryEnsemble::new();
        let owner = session(&ensemble).await;
        let observer = session(&ensemble).await;
        owner.ensure_path(PARENT).await.unwrap();

        let mut watch = observer.watch_children(PARENT).await.unwrap();
        owner.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();
        owner.close().await.unwrap();

        let added = watch.next().await.unwrap();
        assert_eq!(added.children.len(), 1);
        let removed = watch.next().await.unwrap();
        assert!(removed.children.is_empty());

        assert_eq!(owner.state(), SessionState::Closed);
        assert!(ensemble.children_of(PARENT).is_empty());
        // Closing twice is fine.
        owner.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations_and_ends_its_watches() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        s.ensure_path(PARENT).await.unwrap();
        let mut watch = s.watch_children(PARENT).await.unwrap();

        s.close().await.unwrap();

        assert!(watch.next().await.is_none());
        let err = s.children(PARENT).await.unwrap_err();
        assert!(matches!(err, CoordinationError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_expire_session() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        s.ensure_path(PARENT).await.unwrap();
        s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();
        assert_eq!(ensemble.connected_sessions(), 1);

        assert!(ensemble.expire_session(s.id()));
        assert!(!ensemble.expire_session(s.id()));

        assert_eq!(s.state(), SessionState::Expired);
        assert_eq!(ensemble.connected_sessions(), 0);
        assert!(ensemble.children_of(PARENT).is_empty());
        let err = s.ensure_path(PARENT).await.unwrap_err();
        assert!(matches!(err, CoordinationError::SessionExpired { .. }));
    }

    #[tokio::test]
    async fn test_watch_receives_one_event_per_change_with_full_list() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        s.ensure_path(PARENT).await.unwrap();
        let mut watch = s.watch_children(PARENT).await.unwrap();

        let a = s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();
        s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();
        assert!(s.delete(&a.path).await.unwrap());

        assert_eq!(names(&watch.next().await.unwrap().children), vec!["instance-0000000000"]);
        assert_eq!(
            names(&watch.next().await.unwrap().children),
            vec!["instance-0000000000", "instance-0000000001"]
        );
        assert_eq!(names(&watch.next().await.unwrap().children), vec!["instance-0000000001"]);
    }

    #[tokio::test]
    async fn test_delete_missing_node_returns_false() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        assert!(!s.delete("/nothing/here").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_rejects_non_empty_node() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        s.ensure_path(PARENT).await.unwrap();
        s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();

        let err = s.delete(PARENT).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotEmpty { .. }));
    }

    #[tokio::test]
    async fn test_delete_recursive_removes_children_one_at_a_time() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        s.ensure_path(PARENT).await.unwrap();
        s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();
        s.create_ephemeral_sequential(PARENT, "instance-", Vec::new()).await.unwrap();
        let mut watch = s.watch_children(PARENT).await.unwrap();

        s.delete_recursive(PARENT).await.unwrap();

        assert_eq!(watch.next().await.unwrap().children.len(), 1);
        assert!(watch.next().await.unwrap().children.is_empty());
        assert!(ensemble.children_of("/lodestar/services").is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_ensemble_reports_connection_loss() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        ensemble.set_reachable(false);

        let err = s.children(PARENT).await.unwrap_err();
        assert!(err.is_transient());
        let connect: ConnectString = "localhost:2181".parse().unwrap();
        assert!(ensemble.connect(&connect, Duration::from_secs(1)).await.is_err());

        ensemble.set_reachable(true);
        assert!(s.children(PARENT).await.is_ok());
    }
}
