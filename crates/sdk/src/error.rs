//! Discovery error types.
//!
//! Provides a two-tier error model:
//! - **Coordination errors**: failures reported by the coordination backend ([`CoordinationError`])
//! - **Discovery errors**: what callers of the registry, resolver and providers see
//!   ([`DiscoveryError`])
//!
//! Call failures are not represented here. A transient call failure is a tonic
//! [`Status`](tonic::Status) with [`Code::Unavailable`](tonic::Code::Unavailable) and is
//! handled by the retry interceptor.

use snafu::{Location, Snafu};

use crate::coordination::{CoordinationError, SessionId};

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Discovery error types with context-rich error messages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DiscoveryError {
    /// The coordination session could not accept a registration change.
    #[snafu(display("Registration of '{service_id}' failed at {location}: {message}"))]
    Registration {
        /// Service being registered or deregistered.
        service_id: String,
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A discovered host could not be turned into network addresses.
    #[snafu(display("Failed to resolve '{host}': {message}"))]
    Resolution {
        /// Host (or URI) that failed to resolve.
        host: String,
        /// Error description.
        message: String,
    },

    /// The coordination session expired or was closed.
    #[snafu(display("Coordination session {session_id} lost"))]
    SessionLost {
        /// The lost session.
        session_id: SessionId,
    },

    /// Any other coordination backend failure.
    #[snafu(display("Coordination error: {source}"))]
    Coordination {
        /// Underlying backend error.
        source: CoordinationError,
    },

    /// An instance payload could not be encoded or decoded.
    #[snafu(display("Invalid instance payload at {path}: {source}"))]
    Codec {
        /// Node path holding the payload.
        path: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// A channel target could not be mapped to a resolver.
    #[snafu(display("Invalid target '{target}': {message}"))]
    InvalidTarget {
        /// The offending target.
        target: String,
        /// Error description.
        message: String,
    },

    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },
}

impl DiscoveryError {
    /// Returns true if the error is transient and the operation may succeed if repeated.
    ///
    /// Name lookups and connection-loss style backend failures are transient.
    /// Registration against a lost session, payload corruption and
    /// configuration problems are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Resolution { .. } => true,
            Self::Coordination { source } => source.is_transient(),
            Self::Registration { .. } => false,
            Self::SessionLost { .. } => false,
            Self::Codec { .. } => false,
            Self::InvalidTarget { .. } => false,
            Self::Config { .. } => false,
        }
    }

    /// Returns true if the owning coordination session is gone.
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            Self::SessionLost { .. }
                | Self::Coordination {
                    source: CoordinationError::SessionExpired { .. }
                        | CoordinationError::SessionClosed { .. }
                }
        )
    }
}

impl From<CoordinationError> for DiscoveryError {
    fn from(source: CoordinationError) -> Self {
        match source {
            CoordinationError::SessionExpired { session_id }
            | CoordinationError::SessionClosed { session_id } => Self::SessionLost { session_id },
            source => Self::Coordination { source },
        }
    }
}
