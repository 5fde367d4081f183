//! Attribute certificates and the trust store that decides which issuers
//! count.
//!
//! A certificate binds a subject peer ID to a set of attributes and is
//! signed by an issuer (authority) peer:
//!
//! ```text
//! Certificate {
//!     issuer, subject, attributes, issued_at, expires_at,
//!     issuer_key, signature
//! }
//! ```
//!
//! The signature covers the canonical encoding of every other field.
//! Verification needs more than a good signature: the issuer key must be the
//! one the local [`TrustStore`] holds for that issuer, otherwise anyone could
//! mint certificates with a fresh key and a claimed issuer ID.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{TrustedAuthority, MAX_CLOCK_SKEW};
use crate::error::MeshResult;
use crate::identity::{canonical_bytes, Identity, PeerId, PublicKey, Signature};

/// Attribute map carried by a certificate. Ordered so the canonical
/// encoding does not depend on insertion order.
pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("issuer {0} is not a trusted authority")]
    UntrustedIssuer(String),

    #[error("issuer key does not belong to issuer {0}")]
    IssuerKeyMismatch(String),

    #[error("certificate signature does not verify")]
    BadSignature,

    #[error("certificate expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("certificate not valid before {0}")]
    NotYetValid(DateTime<Utc>),

    #[error("certificate issued by {got}, expected {expected}")]
    IssuerMismatch { expected: String, got: String },

    #[error("certificate subject is {got}, expected {expected}")]
    SubjectMismatch { expected: String, got: String },

    #[error("granted attributes differ from the ones requested")]
    AttributeMismatch,

    #[error("certificate encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub issuer: PeerId,
    pub subject: PeerId,
    pub attributes: Attributes,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer_key: PublicKey,
    pub signature: Signature,
}

/// Borrowed view of the signed fields.
#[derive(Serialize)]
struct SignedFields<'a> {
    issuer: &'a PeerId,
    subject: &'a PeerId,
    attributes: &'a Attributes,
    issued_at: &'a DateTime<Utc>,
    expires_at: &'a DateTime<Utc>,
    issuer_key: &'a PublicKey,
}

impl Certificate {
    /// Issues a certificate for `subject`, valid for `validity` from now.
    pub fn issue(
        issuer: &Identity,
        subject: PeerId,
        attributes: Attributes,
        validity: Duration,
    ) -> MeshResult<Self> {
        let issued_at = Utc::now();
        let validity = chrono::Duration::from_std(validity).unwrap_or(chrono::Duration::MAX);
        let expires_at = issued_at.checked_add_signed(validity).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let issuer_key = issuer.public_key();
        let signature = issuer.sign_canonical(&SignedFields {
            issuer: issuer.peer_id(),
            subject: &subject,
            attributes: &attributes,
            issued_at: &issued_at,
            expires_at: &expires_at,
            issuer_key: &issuer_key,
        })?;
        Ok(Self {
            issuer: issuer.peer_id().clone(),
            subject,
            attributes,
            issued_at,
            expires_at,
            issuer_key,
            signature,
        })
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, CertificateError> {
        canonical_bytes(&SignedFields {
            issuer: &self.issuer,
            subject: &self.subject,
            attributes: &self.attributes,
            issued_at: &self.issued_at,
            expires_at: &self.expires_at,
            issuer_key: &self.issuer_key,
        })
        .map_err(|e| CertificateError::Encoding(e.to_string()))
    }

    /// Checks the signature against the issuer's trusted key and the
    /// validity window at `now`.
    pub fn validate(&self, trust: &TrustStore, now: DateTime<Utc>) -> Result<(), CertificateError> {
        if !self.issuer.matches_key(&self.issuer_key) {
            return Err(CertificateError::IssuerKeyMismatch(self.issuer.to_string()));
        }
        match trust.key_for(&self.issuer) {
            Some(key) if key == self.issuer_key => {}
            _ => return Err(CertificateError::UntrustedIssuer(self.issuer.to_string())),
        }
        if !self.issuer_key.verify(&self.signed_bytes()?, &self.signature) {
            return Err(CertificateError::BadSignature);
        }
        if now >= self.expires_at {
            return Err(CertificateError::Expired(self.expires_at));
        }
        let skew = chrono::Duration::from_std(MAX_CLOCK_SKEW).unwrap_or(chrono::Duration::zero());
        if self.issued_at > now + skew {
            return Err(CertificateError::NotYetValid(self.issued_at));
        }
        Ok(())
    }

    /// `validate` plus the expectation that it was issued to `subject`.
    pub fn validate_for(
        &self,
        subject: &PeerId,
        trust: &TrustStore,
        now: DateTime<Utc>,
    ) -> Result<(), CertificateError> {
        if &self.subject != subject {
            return Err(CertificateError::SubjectMismatch {
                expected: subject.to_string(),
                got: self.subject.to_string(),
            });
        }
        self.validate(trust, now)
    }

    /// True once `now` is within `margin` of expiry.
    pub fn is_near_expiry(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(t) => t >= self.expires_at,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// TrustStore
// ---------------------------------------------------------------------------

/// Issuers whose certificates are accepted, keyed by peer ID.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    authorities: HashMap<PeerId, PublicKey>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[TrustedAuthority]) -> MeshResult<Self> {
        let mut store = Self::new();
        for entry in entries {
            let (peer_id, key) = entry.parse()?;
            store.trust(peer_id, key)?;
        }
        Ok(store)
    }

    /// Adds an authority. The key must derive to the claimed peer ID.
    pub fn trust(&mut self, peer_id: PeerId, key: PublicKey) -> Result<(), CertificateError> {
        if !peer_id.matches_key(&key) {
            return Err(CertificateError::IssuerKeyMismatch(peer_id.to_string()));
        }
        self.authorities.insert(peer_id, key);
        Ok(())
    }

    pub fn key_for(&self, peer_id: &PeerId) -> Option<PublicKey> {
        self.authorities.get(peer_id).copied()
    }

    pub fn is_trusted(&self, peer_id: &PeerId) -> bool {
        self.authorities.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }
}
