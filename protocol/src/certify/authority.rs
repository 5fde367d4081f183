//! Minimal in-process certificate authority.
//!
//! Serves `mesh.certify` from a node's [`RpcEngine`]: the caller asks for a
//! set of attributes and, if every attribute name is allowed, receives a
//! certificate binding them to its own peer ID. There is no policy engine
//! and no revocation. This exists so the certification flow can be run end
//! to end in tests and demos, not as a production authority.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::certificate::{Attributes, Certificate};
use crate::config::TrustedAuthority;
use crate::error::{MeshError, MeshResult};
use crate::identity::{Identity, PeerId};
use crate::rpc::{RemoteFault, RpcEngine};

/// Action served by authorities.
pub const CERTIFY_ACTION: &str = "mesh.certify";

/// Default lifetime of issued certificates.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct CertifyParams {
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Clone)]
pub struct Authority {
    identity: Arc<Identity>,
    validity: Duration,
    /// Attribute names this authority will vouch for. `None` allows any.
    allowed: Option<BTreeSet<String>>,
}

impl Authority {
    pub fn new(identity: Arc<Identity>, validity: Duration) -> Self {
        Self {
            identity,
            validity,
            allowed: None,
        }
    }

    /// Restricts issuance to the given attribute names.
    pub fn allow_only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// The config entry clients need to trust this authority.
    pub fn trusted_authority(&self) -> TrustedAuthority {
        TrustedAuthority {
            peer_id: self.identity.peer_id().to_string(),
            public_key: self.identity.public_key().to_hex(),
        }
    }

    /// Issues a certificate for `subject` with exactly `attributes`.
    pub fn issue(&self, subject: &PeerId, attributes: Attributes) -> Result<Certificate, RemoteFault> {
        if let Some(allowed) = &self.allowed {
            if let Some(name) = attributes.keys().find(|k| !allowed.contains(*k)) {
                return Err(RemoteFault::auth(format!("attribute {name:?} not certifiable here")));
            }
        }
        Certificate::issue(&self.identity, subject.clone(), attributes, self.validity)
            .map_err(|e| RemoteFault::handler(e.to_string()))
    }

    /// Serves `mesh.certify` on `engine`. The engine must belong to this
    /// authority's identity, otherwise callers would reject every
    /// certificate for its issuer.
    pub fn install(&self, engine: &RpcEngine) -> MeshResult<()> {
        if engine.connection().peer_id() != self.peer_id() {
            return Err(MeshError::Configuration(
                "authority identity differs from the engine's node".into(),
            ));
        }
        let authority = self.clone();
        engine.handle(CERTIFY_ACTION, move |req| {
            let authority = authority.clone();
            async move {
                let params: CertifyParams = serde_json::from_value(req.payload)
                    .map_err(|e| RemoteFault::invalid_params(e.to_string()))?;
                let cert = authority.issue(&req.sender, params.attributes)?;
                info!(
                    subject = %cert.subject.short(),
                    attributes = cert.attributes.len(),
                    expires_at = %cert.expires_at,
                    "certificate issued"
                );
                serde_json::to_value(&cert).map_err(|e| RemoteFault::handler(e.to_string()))
            }
        });
        // Uncertified agents must be able to obtain their first certificate.
        engine.allow_uncertified(CERTIFY_ACTION);
        Ok(())
    }
}

/// Payload of a `mesh.certify` request.
pub fn certify_params(attributes: &Attributes) -> Value {
    serde_json::json!({ "attributes": attributes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn restricted_authority_refuses_other_attributes() {
        let authority = Authority::new(Arc::new(Identity::ephemeral()), DEFAULT_VALIDITY)
            .allow_only(["role"]);
        let subject = Identity::ephemeral();

        let mut ok = Attributes::new();
        ok.insert("role".into(), json!("worker"));
        let cert = authority.issue(subject.peer_id(), ok.clone()).unwrap();
        assert_eq!(cert.attributes, ok);
        assert_eq!(&cert.issuer, authority.peer_id());

        let mut bad = ok;
        bad.insert("admin".into(), json!(true));
        let fault = authority.issue(subject.peer_id(), bad).unwrap_err();
        assert_eq!(fault.code, crate::rpc::ERR_AUTH);
    }

    #[test]
    fn trusted_authority_entry_parses_back() {
        let authority = Authority::new(Arc::new(Identity::ephemeral()), DEFAULT_VALIDITY);
        let (peer, key) = authority.trusted_authority().parse().unwrap();
        assert_eq!(&peer, authority.peer_id());
        assert!(peer.matches_key(&key));
    }

    #[test]
    fn params_shape() {
        let mut attrs = Attributes::new();
        attrs.insert("tier".into(), json!(2));
        assert_eq!(certify_params(&attrs), json!({"attributes": {"tier": 2}}));
    }
}
