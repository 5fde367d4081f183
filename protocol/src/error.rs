//! # Error Taxonomy
//!
//! Every public operation in the client core returns [`MeshError`]. The
//! variants follow the failure classes callers actually branch on:
//!
//! | Class                 | Variant(s)                               | Fatal? |
//! |-----------------------|------------------------------------------|--------|
//! | Configuration         | `Configuration`, `IdentityNotFound`, `IdentityExists` | yes |
//! | Connection            | `Connection`, `NotConnected`             | for the session |
//! | Authentication        | `Authentication`                         | no, re-certify |
//! | Peer unreachable      | `PeerUnreachable`                        | no, retry |
//! | Protocol              | `InvalidResponse`, `Protocol`            | never session-fatal |
//!
//! Module-local error enums (`KeyError`, `TransportError`, ...) convert into
//! this type so `?` works across module boundaries.

use std::path::PathBuf;

use thiserror::Error;

use crate::certify::CertificateError;
use crate::identity::{KeyError, PeerIdError};
use crate::network::TransportError;
use crate::rpc::EnvelopeError;

/// Result alias used throughout the crate.
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors surfaced by the AgentMesh client core.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Missing or invalid configuration (broker URL, timeouts, identity files).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `generate` was called without `force` while an identity is on disk.
    #[error("identity already exists at {}", path.display())]
    IdentityExists {
        /// Directory holding the existing identity.
        path: PathBuf,
    },

    /// No persisted identity could be found.
    #[error("no identity found at {}", path.display())]
    IdentityNotFound {
        /// Directory that was searched.
        path: PathBuf,
    },

    /// The broker could not be reached after all retries. The session is closed.
    #[error("connection to {endpoint} failed after {attempts} attempts: {reason}")]
    Connection {
        /// The broker endpoint that was attempted.
        endpoint: String,
        /// Number of connection attempts made (direct + relay rounds).
        attempts: u32,
        /// Last underlying failure.
        reason: String,
    },

    /// The operation requires a connected session.
    #[error("not connected")]
    NotConnected,

    /// A handshake or certificate failed validation.
    #[error("authentication failure: {0}")]
    Authentication(String),

    /// A call did not receive a response before its deadline.
    #[error("peer {peer} unreachable: no response within {timeout_ms}ms")]
    PeerUnreachable {
        /// Target peer ID.
        peer: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A response arrived but could not be interpreted.
    #[error("invalid response from {peer}: {reason}")]
    InvalidResponse {
        /// The responding peer.
        peer: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A malformed or unverifiable protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote handler answered with an error.
    #[error("peer {peer} returned error {code}: {message}")]
    Remote {
        /// The responding peer.
        peer: String,
        /// JSON-RPC style error code.
        code: i32,
        /// Error message from the remote handler.
        message: String,
    },

    /// Transport-level failure that was not retried.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Filesystem failure (identity storage, exports, config files).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Whether the caller can reasonably retry the operation on the same session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MeshError::Authentication(_)
                | MeshError::PeerUnreachable { .. }
                | MeshError::InvalidResponse { .. }
                | MeshError::Protocol(_)
                | MeshError::Remote { .. }
        )
    }
}

impl From<KeyError> for MeshError {
    fn from(e: KeyError) -> Self {
        MeshError::Configuration(e.to_string())
    }
}

impl From<PeerIdError> for MeshError {
    fn from(e: PeerIdError) -> Self {
        MeshError::Configuration(e.to_string())
    }
}

impl From<EnvelopeError> for MeshError {
    fn from(e: EnvelopeError) -> Self {
        MeshError::Protocol(e.to_string())
    }
}

impl From<CertificateError> for MeshError {
    fn from(e: CertificateError) -> Self {
        MeshError::Authentication(e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Protocol(format!("json: {e}"))
    }
}
