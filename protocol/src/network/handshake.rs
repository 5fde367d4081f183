//! # Session Handshake
//!
//! The first thing a client presents to a broker. It proves possession of
//! the identity key and carries the broker credential:
//!
//! ```text
//! Handshake {
//!     peer_id, public_key, display_name, protocol_version,
//!     timestamp_ms, nonce, token?, signature
//! }
//! ```
//!
//! The signature covers the canonical encoding of every field except the
//! signature itself and the token. Keeping the token out of the signed body
//! means the signed portion can be logged or forwarded to a directory
//! without leaking the credential.
//!
//! A fresh handshake (new nonce and timestamp) is built for every connect
//! attempt, so a captured handshake cannot be replayed outside the skew
//! window.

use std::fmt;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PROTOCOL_VERSION;
use crate::error::MeshResult;
use crate::identity::{canonical_bytes, Identity, PeerId, PublicKey, Signature};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("peer id does not match public key")]
    PeerIdMismatch,

    #[error("bad handshake signature")]
    BadSignature,

    #[error("handshake timestamp outside allowed skew")]
    StaleTimestamp,

    #[error("invalid or missing token")]
    BadToken,
}

/// The signed part of a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBody {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub protocol_version: String,
    pub timestamp_ms: i64,
    /// 16 random bytes, hex.
    pub nonce: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(flatten)]
    pub body: HandshakeBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub signature: Signature,
}

impl Handshake {
    /// Builds and signs a fresh handshake for `identity`.
    pub fn new(
        identity: &Identity,
        token: Option<String>,
        display_name: Option<String>,
    ) -> MeshResult<Self> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let body = HandshakeBody {
            peer_id: identity.peer_id().clone(),
            public_key: identity.public_key(),
            display_name,
            protocol_version: PROTOCOL_VERSION.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            nonce: hex::encode(nonce),
        };
        let signature = identity.sign_canonical(&body)?;
        Ok(Self {
            body,
            token,
            signature,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.body.peer_id
    }

    /// Checks key binding, signature, and freshness.
    pub fn verify(&self, max_skew: Duration) -> Result<(), HandshakeError> {
        if !self.body.peer_id.matches_key(&self.body.public_key) {
            return Err(HandshakeError::PeerIdMismatch);
        }
        let bytes = canonical_bytes(&self.body).map_err(|_| HandshakeError::BadSignature)?;
        if !self.body.public_key.verify(&bytes, &self.signature) {
            return Err(HandshakeError::BadSignature);
        }
        let now = chrono::Utc::now().timestamp_millis();
        let skew = (now - self.body.timestamp_ms).unsigned_abs();
        if skew > max_skew.as_millis() as u64 {
            return Err(HandshakeError::StaleTimestamp);
        }
        Ok(())
    }

    /// `verify` plus a token check against what the broker expects.
    pub fn verify_with_token(
        &self,
        expected: Option<&str>,
        max_skew: Duration,
    ) -> Result<(), HandshakeError> {
        self.verify(max_skew)?;
        match expected {
            Some(expected) if self.token.as_deref() != Some(expected) => {
                Err(HandshakeError::BadToken)
            }
            _ => Ok(()),
        }
    }

    /// The handshake without its credential, safe to publish.
    pub fn public_copy(&self) -> Self {
        Self {
            body: self.body.clone(),
            token: None,
            signature: self.signature,
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("peer_id", &self.body.peer_id)
            .field("display_name", &self.body.display_name)
            .field("timestamp_ms", &self.body.timestamp_ms)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_CLOCK_SKEW;

    #[test]
    fn fresh_handshake_verifies() {
        let identity = Identity::ephemeral();
        let hs = Handshake::new(&identity, Some("tok".into()), Some("alpha".into())).unwrap();
        assert_eq!(hs.peer_id(), identity.peer_id());
        hs.verify(MAX_CLOCK_SKEW).unwrap();
        hs.verify_with_token(Some("tok"), MAX_CLOCK_SKEW).unwrap();
    }

    #[test]
    fn wrong_token_rejected() {
        let identity = Identity::ephemeral();
        let hs = Handshake::new(&identity, Some("tok".into()), None).unwrap();
        assert_eq!(
            hs.verify_with_token(Some("other"), MAX_CLOCK_SKEW),
            Err(HandshakeError::BadToken)
        );
        let no_token = Handshake::new(&identity, None, None).unwrap();
        assert_eq!(
            no_token.verify_with_token(Some("tok"), MAX_CLOCK_SKEW),
            Err(HandshakeError::BadToken)
        );
    }

    #[test]
    fn tampered_body_rejected() {
        let identity = Identity::ephemeral();
        let mut hs = Handshake::new(&identity, None, Some("alpha".into())).unwrap();
        hs.body.display_name = Some("mallory".into());
        assert_eq!(hs.verify(MAX_CLOCK_SKEW), Err(HandshakeError::BadSignature));
    }

    #[test]
    fn foreign_key_rejected() {
        let identity = Identity::ephemeral();
        let mut hs = Handshake::new(&identity, None, None).unwrap();
        hs.body.public_key = Identity::ephemeral().public_key();
        assert_eq!(hs.verify(MAX_CLOCK_SKEW), Err(HandshakeError::PeerIdMismatch));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let identity = Identity::ephemeral();
        let mut hs = Handshake::new(&identity, None, None).unwrap();
        hs.body.timestamp_ms -= 3_600_000;
        hs.signature = identity.sign_canonical(&hs.body).unwrap();
        assert_eq!(hs.verify(MAX_CLOCK_SKEW), Err(HandshakeError::StaleTimestamp));
    }

    #[test]
    fn public_copy_strips_token_and_still_verifies() {
        let identity = Identity::ephemeral();
        let hs = Handshake::new(&identity, Some("secret".into()), None).unwrap();
        let public = hs.public_copy();
        assert!(public.token.is_none());
        public.verify(MAX_CLOCK_SKEW).unwrap();
        let json = serde_json::to_string(&public).unwrap();
        assert!(!json.contains("secret"));
        assert!(!format!("{:?}", hs).contains("secret"));
    }
}
