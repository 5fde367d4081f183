//! # A2A Envelope
//!
//! Every agent-to-agent message travels in a signed envelope:
//!
//! ```text
//! {
//!   request_id, sender_id, target_id, action, payload, certificate?,
//!   timestamp, ttl, kind: "request" | "response" | "stream" | "end",
//!   error?: { code, message }, sender_key, signature
//! }
//! ```
//!
//! - `request_id` is a random UUIDv4 chosen by the caller; every reply to a
//!   request carries the same id.
//! - `timestamp` is unix milliseconds, `ttl` is seconds (0 disables expiry).
//! - `signature` is Ed25519 by `sender_key` over the canonical encoding of
//!   the envelope without the signature field. `sender_id` must be the peer
//!   ID derived from `sender_key`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::certify::Certificate;
use crate::config::MAX_PAYLOAD_BYTES;
use crate::identity::{Identity, PeerId, PublicKey, Signature};

/// Unknown action.
pub const ERR_UNKNOWN_ACTION: i32 = -32601;
/// Request parameters rejected by the handler.
pub const ERR_INVALID_PARAMS: i32 = -32602;
/// Handler failed.
pub const ERR_HANDLER: i32 = -32000;
/// Certificate missing or invalid.
pub const ERR_AUTH: i32 = -32001;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("sender id does not match sender key")]
    SenderMismatch,

    #[error("envelope signature does not verify")]
    BadSignature,

    #[error("request id {0} is already pending")]
    DuplicateRequestId(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Stream,
    End,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Stream => "stream",
            EnvelopeKind::End => "end",
        };
        f.write_str(s)
    }
}

/// Error attached to a `response` or `end` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: i32,
    pub message: String,
}

impl RemoteFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_action(action: &str) -> Self {
        Self::new(ERR_UNKNOWN_ACTION, format!("unknown action {action:?}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ERR_HANDLER, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ERR_AUTH, message)
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: Uuid,
    pub sender_id: PeerId,
    pub target_id: PeerId,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    pub timestamp: i64,
    pub ttl: u64,
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
    pub sender_key: PublicKey,
    pub signature: Signature,
}

impl Envelope {
    /// A signed request with a fresh request id.
    pub fn request(
        identity: &Identity,
        target: &PeerId,
        action: &str,
        payload: Value,
        ttl_secs: u64,
        certificate: Option<Certificate>,
    ) -> Result<Self, EnvelopeError> {
        Self::seal(
            identity,
            Uuid::new_v4(),
            target.clone(),
            action.to_string(),
            payload,
            certificate,
            ttl_secs,
            EnvelopeKind::Request,
            None,
        )
    }

    /// A signed reply to `self`, addressed back to its sender.
    pub fn reply(
        &self,
        identity: &Identity,
        kind: EnvelopeKind,
        payload: Value,
        error: Option<RemoteFault>,
    ) -> Result<Self, EnvelopeError> {
        Self::seal(
            identity,
            self.request_id,
            self.sender_id.clone(),
            self.action.clone(),
            payload,
            None,
            self.ttl,
            kind,
            error,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn seal(
        identity: &Identity,
        request_id: Uuid,
        target_id: PeerId,
        action: String,
        payload: Value,
        certificate: Option<Certificate>,
        ttl: u64,
        kind: EnvelopeKind,
        error: Option<RemoteFault>,
    ) -> Result<Self, EnvelopeError> {
        let mut envelope = Self {
            request_id,
            sender_id: identity.peer_id().clone(),
            target_id,
            action,
            payload,
            certificate,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ttl,
            kind,
            error,
            sender_key: identity.public_key(),
            signature: Signature::from_bytes([0u8; 64]),
        };
        envelope.signature = identity.sign(&envelope.signing_bytes()?);
        Ok(envelope)
    }

    /// Canonical encoding of every field except `signature`.
    fn signing_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if let Some(map) = value.as_object_mut() {
            map.remove("signature");
        }
        serde_json::to_vec(&value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Checks that the sender key derives to `sender_id` and signed the
    /// envelope.
    pub fn verify(&self) -> Result<(), EnvelopeError> {
        if !self.sender_id.matches_key(&self.sender_key) {
            return Err(EnvelopeError::SenderMismatch);
        }
        if !self.sender_key.verify(&self.signing_bytes()?, &self.signature) {
            return Err(EnvelopeError::BadSignature);
        }
        Ok(())
    }

    /// Whether the envelope outlived its ttl at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        if self.ttl == 0 {
            return false;
        }
        let ttl_ms = i64::try_from(self.ttl.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_ms > self.timestamp.saturating_add(ttl_ms)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = serde_json::to_vec(self).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(EnvelopeError::TooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(EnvelopeError::TooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}
