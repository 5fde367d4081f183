//! # Identity Store
//!
//! Persists one agent identity per directory:
//!
//! ```text
//! <identity_dir>/
//!   identity.json   {peer_id, public_key, certificate?, created_at}   0644
//!   identity.key    hex secret key                                  0600
//! ```
//!
//! The public bundle and the secret live in separate files so the bundle can
//! be shared or inspected freely. An identity is created once by
//! [`IdentityManager::generate`] and only replaced by regenerating with
//! `force`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::keys::{canonical_bytes, AgentKeypair, PublicKey, Signature};
use super::peer_id::PeerId;
use crate::certify::Certificate;
use crate::error::{MeshError, MeshResult};

pub const BUNDLE_FILE: &str = "identity.json";
pub const KEY_FILE: &str = "identity.key";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A loaded identity: keypair plus the peer ID derived from it.
///
/// Immutable once built. Shared across components as `Arc<Identity>`.
#[derive(Debug, Clone)]
pub struct Identity {
    keypair: AgentKeypair,
    peer_id: PeerId,
    created_at: DateTime<Utc>,
}

impl Identity {
    /// Wraps a keypair, deriving its peer ID.
    pub fn from_keypair(keypair: AgentKeypair, created_at: DateTime<Utc>) -> Self {
        let peer_id = PeerId::from_public_key(&keypair.public_key());
        Self {
            keypair,
            peer_id,
            created_at,
        }
    }

    /// An in-memory identity that is never persisted. Used for tests and
    /// throwaway sessions.
    pub fn ephemeral() -> Self {
        Self::from_keypair(AgentKeypair::generate(), Utc::now())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Signs raw bytes.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.keypair.sign(bytes)
    }

    /// Signs the canonical encoding of `value`.
    pub fn sign_canonical<T: Serialize + ?Sized>(&self, value: &T) -> MeshResult<Signature> {
        Ok(self.keypair.sign(&canonical_bytes(value)?))
    }

    fn bundle(&self, certificate: Option<Certificate>) -> IdentityBundle {
        IdentityBundle {
            peer_id: self.peer_id.clone(),
            public_key: self.public_key(),
            certificate,
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle formats
// ---------------------------------------------------------------------------

/// The public identity file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityBundle {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    pub created_at: DateTime<Utc>,
}

/// What `export` writes: the bundle plus, only on request, the secret key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedIdentity {
    #[serde(flatten)]
    pub bundle: IdentityBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

// ---------------------------------------------------------------------------
// IdentityManager
// ---------------------------------------------------------------------------

/// Owns the on-disk identity for one directory.
#[derive(Debug, Clone)]
pub struct IdentityManager {
    dir: PathBuf,
}

impl IdentityManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.dir.join(BUNDLE_FILE)
    }

    /// Whether a secret key is present on disk.
    pub fn exists(&self) -> bool {
        self.key_path().exists()
    }

    /// Creates and persists a new identity.
    ///
    /// Fails with [`MeshError::IdentityExists`] when one is already present
    /// and `force` is false. With `force`, the old identity (and any
    /// certificate issued to it) is replaced.
    pub fn generate(&self, force: bool) -> MeshResult<Identity> {
        if self.exists() && !force {
            return Err(MeshError::IdentityExists {
                path: self.dir.clone(),
            });
        }
        fs::create_dir_all(&self.dir)?;

        let identity = Identity::from_keypair(AgentKeypair::generate(), Utc::now());
        write_restricted(&self.key_path(), identity.keypair.secret_key_hex().as_bytes())?;
        self.write_bundle(&identity.bundle(None))?;

        if force {
            warn!(peer_id = %identity.peer_id, "identity regenerated; previous identity discarded");
        } else {
            info!(peer_id = %identity.peer_id, dir = %self.dir.display(), "identity generated");
        }
        Ok(identity)
    }

    /// Loads the persisted identity.
    pub fn load(&self) -> MeshResult<Identity> {
        let key_path = self.key_path();
        if !key_path.exists() {
            return Err(MeshError::IdentityNotFound {
                path: self.dir.clone(),
            });
        }
        let secret = fs::read_to_string(&key_path)?;
        let keypair = AgentKeypair::from_hex(&secret).map_err(|e| {
            MeshError::Configuration(format!("{}: {}", key_path.display(), e))
        })?;

        let created_at = match self.read_bundle() {
            Ok(bundle) => {
                let derived = PeerId::from_public_key(&keypair.public_key());
                if bundle.peer_id != derived || bundle.public_key != keypair.public_key() {
                    return Err(MeshError::Configuration(format!(
                        "{} does not match {}",
                        self.bundle_path().display(),
                        key_path.display()
                    )));
                }
                bundle.created_at
            }
            // The bundle is derivable; a missing one is rebuilt.
            Err(MeshError::IdentityNotFound { .. }) => {
                let identity = Identity::from_keypair(keypair, Utc::now());
                self.write_bundle(&identity.bundle(None))?;
                return Ok(identity);
            }
            Err(e) => return Err(e),
        };

        Ok(Identity::from_keypair(keypair, created_at))
    }

    /// Reads the public bundle.
    pub fn read_bundle(&self) -> MeshResult<IdentityBundle> {
        let path = self.bundle_path();
        if !path.exists() {
            return Err(MeshError::IdentityNotFound {
                path: self.dir.clone(),
            });
        }
        let text = fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map_err(|e| MeshError::Configuration(format!("{}: {}", path.display(), e)))
    }

    /// The certificate stored alongside the identity, if any.
    pub fn certificate(&self) -> MeshResult<Option<Certificate>> {
        Ok(self.read_bundle()?.certificate)
    }

    /// Persists `certificate` into the bundle, replacing any previous one.
    pub fn save_certificate(&self, certificate: &Certificate) -> MeshResult<()> {
        let mut bundle = self.read_bundle()?;
        if certificate.subject != bundle.peer_id {
            return Err(MeshError::Authentication(format!(
                "certificate subject {} is not this identity",
                certificate.subject
            )));
        }
        bundle.certificate = Some(certificate.clone());
        self.write_bundle(&bundle)
    }

    /// Writes the public identity to `path`. The secret key is included only
    /// when `include_secret` is set, in which case the file is restricted.
    pub fn export(&self, path: &Path, include_secret: bool) -> MeshResult<()> {
        let identity = self.load()?;
        let bundle = self.read_bundle()?;
        let exported = ExportedIdentity {
            bundle,
            secret_key: include_secret.then(|| identity.keypair.secret_key_hex()),
        };
        let json = serde_json::to_vec_pretty(&exported)?;
        if include_secret {
            write_restricted(path, &json)?;
            warn!(path = %path.display(), "identity exported including secret key");
        } else {
            fs::write(path, json)?;
            info!(path = %path.display(), "public identity exported");
        }
        Ok(())
    }

    fn write_bundle(&self, bundle: &IdentityBundle) -> MeshResult<()> {
        let json = serde_json::to_vec_pretty(bundle)?;
        fs::write(self.bundle_path(), json)?;
        Ok(())
    }
}

/// Writes `contents` to a file readable only by the owner on Unix.
fn write_restricted(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;

    // `mode` only applies on creation; tighten pre-existing files too.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
