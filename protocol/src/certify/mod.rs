//! # Certification
//!
//! Signed attribute certificates: what they are, who is trusted to issue
//! them, how a client obtains one, and a minimal authority to issue them in
//! tests and demos.

pub mod authority;
pub mod certificate;
pub mod client;

pub use authority::{Authority, CERTIFY_ACTION, DEFAULT_VALIDITY};
pub use certificate::{Attributes, Certificate, CertificateError, TrustStore};
pub use client::CertificationClient;
