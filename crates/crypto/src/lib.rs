//! Chorus Crypto - credential digests and certificate handling
//!
//! This crate provides:
//! - Salted HMAC-SHA256 digests for cached passwords
//! - Keyed credential hashing for session tracking
//! - X.509 inspection and SHA-256 certificate fingerprints
//! - Self-signed and CA-issued certificate generation

mod certificate;
mod digest;

pub use certificate::*;
pub use digest::*;
