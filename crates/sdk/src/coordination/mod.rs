//! Coordination service seam.
//!
//! The registry never talks to a coordination backend directly. It goes through
//! two traits:
//!
//! - [`Coordinator`] opens sessions against an ensemble described by a
//!   [`ConnectString`](crate::ConnectString).
//! - [`CoordinationSession`] is one live session: it owns the ephemeral nodes it
//!   creates, lists children and installs child watches.
//!
//! Ephemeral nodes live exactly as long as the session that created them. When a
//! session is closed or expires, the backend removes its nodes and every child
//! watch on the affected parents observes the removal.
//!
//! [`MemoryEnsemble`] is a complete in-process implementation used by the tests
//! and the demo binary.

mod memory;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryEnsemble;

use crate::config::ConnectString;

/// Result type for coordination backend operations.
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// Errors reported by a coordination backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    /// The ensemble could not be reached.
    #[error("connection to the coordination ensemble lost: {message}")]
    ConnectionLoss { message: String },

    /// The session expired; its ephemeral nodes are gone.
    #[error("session {session_id} expired")]
    SessionExpired { session_id: SessionId },

    /// The session was closed by its owner.
    #[error("session {session_id} is closed")]
    SessionClosed { session_id: SessionId },

    /// The addressed node does not exist.
    #[error("no node at {path}")]
    NoNode { path: String },

    /// The node still has children and cannot be deleted.
    #[error("node {path} has children")]
    NotEmpty { path: String },

    /// The path is malformed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

impl CoordinationError {
    /// Returns true for failures that may clear up on their own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss { .. })
    }

    /// Returns true if the failure means the session can no longer be used.
    #[must_use]
    pub fn is_session_error(&self) -> bool {
        matches!(self, Self::SessionExpired { .. } | Self::SessionClosed { .. })
    }
}

/// Identifier of a coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a session identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session is live; ephemeral nodes it owns are visible.
    Connected,
    /// The ensemble expired the session.
    Expired,
    /// The owner closed the session.
    Closed,
}

impl SessionState {
    /// Returns whether operations can be issued on the session.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Expired => write!(f, "expired"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A child node as listed by [`CoordinationSession::children`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNode {
    /// Last path segment, e.g. `instance-0000000003`.
    pub name: String,
    /// Full path of the node.
    pub path: String,
    /// Sequence number assigned by the parent; strictly increasing per parent.
    pub sequence: u64,
    /// Node payload.
    pub data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    pub owner: Option<SessionId>,
}

/// One child-membership change under a watched parent.
///
/// `children` is the complete child list captured atomically with the change
/// that produced the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildrenChanged {
    /// The watched parent path.
    pub parent: String,
    /// Children after the change, in creation order.
    pub children: Vec<ChildNode>,
}

/// Ordered stream of [`ChildrenChanged`] events for one parent.
///
/// The stream ends when the owning session closes or expires.
#[derive(Debug)]
pub struct ChildWatch {
    parent: String,
    events: mpsc::UnboundedReceiver<ChildrenChanged>,
}

impl ChildWatch {
    /// Creates a watch from its event receiver.
    #[must_use]
    pub fn new(parent: impl Into<String>, events: mpsc::UnboundedReceiver<ChildrenChanged>) -> Self {
        Self { parent: parent.into(), events }
    }

    /// Returns the watched parent path.
    #[must_use]
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Waits for the next change. Returns `None` once the session is gone.
    pub async fn next(&mut self) -> Option<ChildrenChanged> {
        self.events.recv().await
    }
}

/// Opens sessions against a coordination ensemble.
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Establishes a new session.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::ConnectionLoss`] if no ensemble member can
    /// be reached.
    async fn connect(
        &self,
        connect_string: &ConnectString,
        session_timeout: Duration,
    ) -> CoordinationResult<Arc<dyn CoordinationSession>>;
}

/// A live session with a coordination ensemble.
///
/// All operations fail with [`CoordinationError::SessionExpired`] or
/// [`CoordinationError::SessionClosed`] once the session is no longer
/// connected.
#[async_trait]
pub trait CoordinationSession: Send + Sync + fmt::Debug {
    /// Returns the session identifier.
    fn id(&self) -> SessionId;

    /// Returns the current session state.
    fn state(&self) -> SessionState;

    /// Creates every missing persistent node along `path`.
    async fn ensure_path(&self, path: &str) -> CoordinationResult<()>;

    /// Creates an ephemeral child of `parent` named `prefix` followed by a
    /// zero-padded sequence number.
    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
        data: Vec<u8>,
    ) -> CoordinationResult<ChildNode>;

    /// Deletes a leaf node. Returns `false` if it did not exist.
    async fn delete(&self, path: &str) -> CoordinationResult<bool>;

    /// Deletes a node and all of its descendants, one node at a time.
    async fn delete_recursive(&self, path: &str) -> CoordinationResult<()>;

    /// Lists the children of `parent` in creation order.
    ///
    /// A missing parent has no children.
    async fn children(&self, parent: &str) -> CoordinationResult<Vec<ChildNode>>;

    /// Installs a persistent child watch on `parent`.
    ///
    /// The parent does not need to exist yet. No event is emitted for the
    /// current membership; one event is emitted for every later change.
    async fn watch_children(&self, parent: &str) -> CoordinationResult<ChildWatch>;

    /// Closes the session, removing its ephemeral nodes. Idempotent.
    async fn close(&self) -> CoordinationResult<()>;
}

/// Validates an absolute node path (`/a/b`, no trailing slash).
pub(crate) fn validate_path(path: &str) -> CoordinationResult<()> {
    if !path.starts_with('/') {
        return Err(CoordinationError::InvalidPath {
            path: path.to_owned(),
            reason: "path must be absolute",
        });
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(CoordinationError::InvalidPath {
            path: path.to_owned(),
            reason: "path must not end with '/'",
        });
    }
    if path.len() > 1 && path[1..].split('/').any(str::is_empty) {
        return Err(CoordinationError::InvalidPath {
            path: path.to_owned(),
            reason: "path contains an empty segment",
        });
    }
    Ok(())
}

/// Returns the parent of an absolute path, or `None` for the root.
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_accepts_absolute_paths() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/lodestar").is_ok());
        assert!(validate_path("/lodestar/services/demo").is_ok());
    }

    #[test]
    fn test_validate_path_rejects_malformed_paths() {
        assert!(validate_path("relative/path").is_err());
        assert!(validate_path("/trailing/").is_err());
        assert!(validate_path("/double//slash").is_err());
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/"), None);
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId::new(255).to_string(), "0x00000000000000ff");
    }

    #[test]
    fn test_session_errors_are_not_transient() {
        let expired = CoordinationError::SessionExpired { session_id: SessionId::new(1) };
        assert!(expired.is_session_error());
        assert!(!expired.is_transient());

        let loss = CoordinationError::ConnectionLoss { message: "timeout".to_owned() };
        assert!(loss.is_transient());
        assert!(!loss.is_session_error());
    }
}
