//! Chorus Protocol - wire types shared by hub, edge and clients
//!
//! - `LinkMessage`: rkyv frames exchanged between the hub and its edges
//! - `AclSnapshot` / `EncodedSnapshot`: replicated access-control state
//! - `AuthRequest` / `AuthResult`: identity resolution inputs and outputs
//! - `ClientRequest` / `ClientResponse`: JSON command frames from clients
//!
//! Link structures use rkyv with bytecheck validation on decode.

mod acl;
mod auth;
mod client;
mod compression;
mod link;

pub use acl::*;
pub use auth::*;
pub use client::*;
pub use compression::*;
pub use link::*;

use thiserror::Error;

/// Errors produced while encoding or decoding wire structures
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization failed: {0}")]
    Encode(String),

    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Snapshot version mismatch: envelope {envelope}, body {body}")]
    VersionMismatch { envelope: u64, body: u64 },

    #[error("Snapshot epoch mismatch: envelope {envelope:#018x}, body {body:#018x}")]
    EpochMismatch { envelope: u64, body: u64 },

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),
}

/// Copy bytes into an aligned buffer so archived access never sees a misaligned slice
pub(crate) fn aligned(bytes: &[u8]) -> rkyv::util::AlignedVec {
    let mut buf: rkyv::util::AlignedVec = rkyv::util::AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
