//! Hub <-> Edge link messages
//!
//! Every transport frame on a hub link carries exactly one `LinkMessage`.

use crate::{AuthRequest, AuthResult, AuthStatus, CodecError, EncodedSnapshot, aligned};
use bytes::Bytes;
use rkyv::{Archive, Deserialize, Serialize};

/// Stable error codes carried by `LinkMessage::Error`
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum LinkErrorCode {
    RegistryFull,
    UnknownNode,
    NotRegistered,
    /// Another link registered the same node id
    Superseded,
    Malformed,
    Internal,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LinkMessage {
    /// First message of every link; also sent again after an eviction
    Register {
        node_id: String,
        address: String,
        snapshot_epoch: u64,
        snapshot_version: u64,
    },

    RegisterAck {
        heartbeat_timeout_ms: u64,
    },

    Heartbeat {
        node_id: String,
        seq: u64,
    },

    HeartbeatAck {
        seq: u64,
    },

    Deregister {
        node_id: String,
    },

    SnapshotPush {
        snapshot: EncodedSnapshot,
    },

    SnapshotPullRequest {
        node_id: String,
        have_epoch: u64,
        have_version: u64,
    },

    /// Edge asks the hub to resolve credentials on its behalf
    AuthForward {
        request_id: u64,
        request: AuthRequest,
    },

    AuthVerdict {
        request_id: u64,
        status: AuthStatus,
        result: Option<AuthResult>,
        message: String,
    },

    Error {
        code: LinkErrorCode,
        message: String,
    },
}

impl LinkMessage {
    pub fn error(code: LinkErrorCode, message: impl Into<String>) -> Self {
        LinkMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            LinkMessage::Register { .. } => "register",
            LinkMessage::RegisterAck { .. } => "register_ack",
            LinkMessage::Heartbeat { .. } => "heartbeat",
            LinkMessage::HeartbeatAck { .. } => "heartbeat_ack",
            LinkMessage::Deregister { .. } => "deregister",
            LinkMessage::SnapshotPush { .. } => "snapshot_push",
            LinkMessage::SnapshotPullRequest { .. } => "snapshot_pull",
            LinkMessage::AuthForward { .. } => "auth_forward",
            LinkMessage::AuthVerdict { .. } => "auth_verdict",
            LinkMessage::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::copy_from_slice(&bytes))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        rkyv::from_bytes::<LinkMessage, rkyv::rancor::Error>(&aligned(frame))
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}
