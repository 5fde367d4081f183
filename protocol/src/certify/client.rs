//! Certification client.
//!
//! Obtains attribute certificates from authority peers over RPC and keeps
//! the latest one per authority. A cached certificate is reused until it
//! comes within the renewal margin of expiry.
//!
//! Nothing an authority returns is taken on faith. A certificate is accepted
//! only if all of these hold:
//!
//! - issuer is the authority that was asked, and is in the trust store
//! - issuer key is the trusted key for that issuer and the signature verifies
//! - subject is this node
//! - not expired
//! - granted attributes equal the requested ones
//!
//! Anything else is an [`MeshError::Authentication`].
//!
//! The last grant obtained (authority plus attributes) is remembered, so
//! [`presentable`](CertificationClient::presentable) can renew it before
//! each outgoing call instead of presenting a certificate about to lapse.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::authority::{certify_params, CERTIFY_ACTION};
use super::certificate::{Attributes, Certificate, CertificateError};
use crate::error::{MeshError, MeshResult};
use crate::identity::{IdentityManager, PeerId};
use crate::rpc::RpcEngine;

pub struct CertificationClient {
    rpc: RpcEngine,
    renewal_margin: Duration,
    store: Option<IdentityManager>,
    cache: Mutex<HashMap<PeerId, Certificate>>,
    /// Most recent (authority, attributes) this node was certified for.
    grant: Mutex<Option<(PeerId, Attributes)>>,
}

impl CertificationClient {
    pub fn new(rpc: RpcEngine, renewal_margin: Duration) -> Self {
        Self {
            rpc,
            renewal_margin,
            store: None,
            cache: Mutex::new(HashMap::new()),
            grant: Mutex::new(None),
        }
    }

    /// Persists accepted certificates through `store` and seeds the cache
    /// with the certificate already on disk, if it is still usable.
    pub fn with_store(mut self, store: IdentityManager) -> Self {
        match store.certificate() {
            Ok(Some(cert)) => self.seed(cert),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "no stored certificate"),
        }
        self.store = Some(store);
        self
    }

    fn seed(&self, cert: Certificate) {
        let me = self.rpc.connection().peer_id();
        let now = Utc::now();
        match cert.validate_for(me, self.rpc.trust(), now) {
            Ok(()) if !cert.is_near_expiry(now, self.renewal_margin) => {
                debug!(issuer = %cert.issuer.short(), "loaded stored certificate");
                self.remember(&cert.issuer, &cert.attributes);
                self.cache.lock().insert(cert.issuer.clone(), cert);
            }
            Ok(()) => {
                debug!(issuer = %cert.issuer.short(), "stored certificate due for renewal");
                self.remember(&cert.issuer, &cert.attributes);
            }
            Err(e) => debug!(error = %e, "stored certificate not usable"),
        }
    }

    /// Returns a certificate from `authority` for `attributes`, asking the
    /// authority only when no usable cached one exists.
    pub async fn certify(
        &self,
        authority: &PeerId,
        attributes: Attributes,
        timeout: Duration,
    ) -> MeshResult<Certificate> {
        if let Some(cert) = self.cached_for(authority, &attributes) {
            debug!(authority = %authority.short(), "using cached certificate");
            self.remember(authority, &attributes);
            return Ok(cert);
        }
        if !self.rpc.trust().is_trusted(authority) {
            return Err(CertificateError::UntrustedIssuer(authority.to_string()).into());
        }

        let response = self
            .rpc
            .call(authority, CERTIFY_ACTION, certify_params(&attributes), timeout, None)
            .await?;
        let cert: Certificate =
            serde_json::from_value(response).map_err(|e| MeshError::InvalidResponse {
                peer: authority.to_string(),
                reason: format!("not a certificate: {e}"),
            })?;

        if let Err(e) = self.check(authority, &attributes, &cert) {
            warn!(authority = %authority.short(), error = %e, "certificate rejected");
            return Err(e.into());
        }
        info!(
            authority = %authority.short(),
            expires_at = %cert.expires_at,
            "certificate accepted"
        );

        self.cache.lock().insert(authority.clone(), cert.clone());
        self.remember(authority, &attributes);
        if let Some(store) = &self.store {
            if let Err(e) = store.save_certificate(&cert) {
                warn!(error = %e, "failed to persist certificate");
            }
        }
        Ok(cert)
    }

    fn remember(&self, authority: &PeerId, attributes: &Attributes) {
        *self.grant.lock() = Some((authority.clone(), attributes.clone()));
    }

    /// The certificate to attach to an outgoing call. Renews the remembered
    /// grant when it is within the renewal margin; if renewal fails, falls
    /// back to whatever unexpired certificate is cached.
    pub async fn presentable(&self, timeout: Duration) -> Option<Certificate> {
        let grant = self.grant.lock().clone();
        let Some((authority, attributes)) = grant else {
            return self.current();
        };
        match self.certify(&authority, attributes, timeout).await {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(authority = %authority.short(), error = %e, "certificate renewal failed");
                self.current()
            }
        }
    }

    fn check(
        &self,
        authority: &PeerId,
        requested: &Attributes,
        cert: &Certificate,
    ) -> Result<(), CertificateError> {
        if &cert.issuer != authority {
            return Err(CertificateError::IssuerMismatch {
                expected: authority.to_string(),
                got: cert.issuer.to_string(),
            });
        }
        cert.validate_for(self.rpc.connection().peer_id(), self.rpc.trust(), Utc::now())?;
        if &cert.attributes != requested {
            return Err(CertificateError::AttributeMismatch);
        }
        Ok(())
    }

    fn cached_for(&self, authority: &PeerId, attributes: &Attributes) -> Option<Certificate> {
        let cache = self.cache.lock();
        let cert = cache.get(authority)?;
        let fresh = !cert.is_near_expiry(Utc::now(), self.renewal_margin);
        (fresh && &cert.attributes == attributes).then(|| cert.clone())
    }

    /// The cached certificate from `authority`, whatever its attributes,
    /// if it is not yet due for renewal.
    pub fn cached(&self, authority: &PeerId) -> Option<Certificate> {
        let cache = self.cache.lock();
        cache
            .get(authority)
            .filter(|c| !c.is_near_expiry(Utc::now(), self.renewal_margin))
            .cloned()
    }

    /// The unexpired cached certificate with the latest expiry.
    pub fn current(&self) -> Option<Certificate> {
        let now = Utc::now();
        self.cache
            .lock()
            .values()
            .filter(|c| c.expires_at > now)
            .max_by_key(|c| c.expires_at)
            .cloned()
    }

    /// Forgets the cached certificate from `authority`.
    pub fn invalidate(&self, authority: &PeerId) -> bool {
        self.cache.lock().remove(authority).is_some()
    }

    /// Obtains (or reuses) a certificate from `authority` and attaches it to
    /// a call to `target`.
    pub async fn call_certified(
        &self,
        authority: &PeerId,
        attributes: Attributes,
        target: &PeerId,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> MeshResult<Value> {
        let cert = self.certify(authority, attributes, timeout).await?;
        self.rpc
            .call(target, action, payload, timeout, Some(cert))
            .await
    }
}

impl std::fmt::Debug for CertificationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificationClient")
            .field("renewal_margin", &self.renewal_margin)
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}
