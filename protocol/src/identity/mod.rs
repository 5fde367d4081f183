//! # Identity Module
//!
//! Every participant on the mesh is an Ed25519 keypair. The identity stack:
//!
//! 1. **Keys**: raw key material, signatures, canonical signing encoding.
//! 2. **Peer ID**: Bech32 of the BLAKE3 hash of the public key. What peers
//!    address each other by, and the token in each peer's inbound subject.
//! 3. **Manager**: on-disk lifecycle. Generate once, load thereafter,
//!    export the public half, keep the latest certificate.

pub mod keys;
pub mod manager;
pub mod peer_id;

pub use keys::{canonical_bytes, AgentKeypair, KeyError, PublicKey, Signature};
pub use manager::{ExportedIdentity, Identity, IdentityBundle, IdentityManager};
pub use peer_id::{PeerId, PeerIdError};
