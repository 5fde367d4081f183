//! # Peer IDs
//!
//! A peer ID is the network-facing name of an identity. It is derived from
//! the Ed25519 public key by hashing and Bech32 encoding:
//!
//! ```text
//! public_key (32 bytes)
//!     -> BLAKE3(public_key) -> 32 bytes
//!     -> Bech32("agent", hash) -> agent1qw508d6qe...
//! ```
//!
//! The derivation is one-way and deterministic, so any peer holding a public
//! key can check that it belongs to a claimed peer ID without a directory.
//! Bech32 output is lowercase alphanumeric, which keeps peer IDs safe to
//! embed as a single broker subject token.

use bech32::{Bech32, Hrp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::keys::PublicKey;

/// Human-readable prefix of every peer ID.
pub const PEER_ID_HRP: &str = "agent";

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("bech32 decode error: {0}")]
    Bech32Decode(String),

    #[error("invalid peer id prefix: expected '{expected}', got '{got}'")]
    InvalidHrp { expected: String, got: String },

    #[error("invalid peer id length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A validated peer identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Derives the peer ID of a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = blake3::hash(key.as_bytes());
        Self(encode_hash(digest.as_bytes()))
    }

    /// Parses and validates a peer ID string (prefix, checksum, length).
    pub fn parse(s: &str) -> Result<Self, PeerIdError> {
        let (hrp, data) =
            bech32::decode(s.trim()).map_err(|e| PeerIdError::Bech32Decode(e.to_string()))?;
        if hrp != Hrp::parse_unchecked(PEER_ID_HRP) {
            return Err(PeerIdError::InvalidHrp {
                expected: PEER_ID_HRP.to_string(),
                got: hrp.to_string(),
            });
        }
        if data.len() != 32 {
            return Err(PeerIdError::InvalidLength(data.len()));
        }
        // Re-encode so the stored form is always canonical lowercase.
        Ok(Self(encode_hash(&data)))
    }

    /// Returns `true` if this peer ID was derived from `key`.
    pub fn matches_key(&self, key: &PublicKey) -> bool {
        *self == Self::from_public_key(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First characters of the ID for compact log lines and tables.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(16);
        &self.0[..end]
    }
}

fn encode_hash(hash: &[u8]) -> String {
    let hrp = Hrp::parse_unchecked(PEER_ID_HRP);
    // A 32-byte payload is far below the Bech32 length limit.
    bech32::encode::<Bech32>(hrp, hash).unwrap_or_default()
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AgentKeypair;

    #[test]
    fn derivation_is_pure_function_of_key() {
        let kp = AgentKeypair::from_seed(&[3u8; 32]);
        let a = PeerId::from_public_key(&kp.public_key());
        let b = PeerId::from_public_key(&AgentKeypair::from_seed(&[3u8; 32]).public_key());
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("agent1"));
    }

    #[test]
    fn distinct_keys_distinct_ids() {
        let a = PeerId::from_public_key(&AgentKeypair::generate().public_key());
        let b = PeerId::from_public_key(&AgentKeypair::generate().public_key());
        assert_ne!(a, b);
    }

    #[test]
    fn parse_roundtrip_and_key_match() {
        let kp = AgentKeypair::generate();
        let id = PeerId::from_public_key(&kp.public_key());
        let parsed = PeerId::parse(id.as_str()).unwrap();
        assert_eq!(parsed, id);
        assert!(parsed.matches_key(&kp.public_key()));
        assert!(!parsed.matches_key(&AgentKeypair::generate().public_key()));
    }

    #[test]
    fn rejects_wrong_prefix_and_garbage() {
        let hrp = Hrp::parse("nope").unwrap();
        let foreign = bech32::encode::<Bech32>(hrp, &[0u8; 32]).unwrap();
        assert!(matches!(
            PeerId::parse(&foreign),
            Err(PeerIdError::InvalidHrp { .. })
        ));
        assert!(PeerId::parse("agent1notvalid").is_err());
        assert!(PeerId::parse("").is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        let hrp = Hrp::parse(PEER_ID_HRP).unwrap();
        let short = bech32::encode::<Bech32>(hrp, &[1u8; 16]).unwrap();
        assert!(matches!(
            PeerId::parse(&short),
            Err(PeerIdError::InvalidLength(16))
        ));
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let id = PeerId::from_public_key(&AgentKeypair::generate().public_key());
        let json = serde_json::to_string(&id).unwrap();
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<PeerId>("\"garbage\"").is_err());
    }

    #[test]
    fn peer_id_is_subject_safe() {
        let id = PeerId::from_public_key(&AgentKeypair::generate().public_key());
        assert!(crate::network::subjects::is_valid_token(id.as_str()));
    }
}
