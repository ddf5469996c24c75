//! Access-control snapshots replicated from the hub to edge nodes

use crate::{CodecError, aligned, compress_if_needed, decompress_with_limit};
use rkyv::{Archive, Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Upper bound on a decompressed snapshot body (16 MiB)
pub const MAX_SNAPSHOT_SIZE: usize = 16 * 1024 * 1024;

/// Channel permission bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const WRITE: Self = Self(0x1);
    pub const TRAVERSE: Self = Self(0x2);
    pub const ENTER: Self = Self(0x4);
    pub const SPEAK: Self = Self(0x8);
    pub const MUTE_DEAFEN: Self = Self(0x10);
    pub const MOVE: Self = Self(0x20);
    pub const MAKE_CHANNEL: Self = Self(0x40);
    pub const LINK_CHANNEL: Self = Self(0x80);
    pub const WHISPER: Self = Self(0x100);
    pub const TEXT_MESSAGE: Self = Self(0x200);
    pub const MAKE_TEMP_CHANNEL: Self = Self(0x400);
    pub const KICK: Self = Self(0x10000);
    pub const BAN: Self = Self(0x20000);
    pub const REGISTER: Self = Self(0x40000);
    pub const ALL: Self = Self(u32::MAX);

    /// What an unconfigured channel grants everyone
    pub const DEFAULT: Self =
        Self(Self::TRAVERSE.0 | Self::ENTER.0 | Self::SPEAK.0 | Self::WHISPER.0 | Self::TEXT_MESSAGE.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Apply one ACL entry: denied bits are cleared, then allowed bits set
    pub fn apply(self, allow: Self, deny: Self) -> Self {
        Self((self.0 & !deny.0) | allow.0)
    }

    /// Look up a single permission by its configuration name
    pub fn parse(name: &str) -> Option<Self> {
        let permission = match name {
            "write" => Self::WRITE,
            "traverse" => Self::TRAVERSE,
            "enter" => Self::ENTER,
            "speak" => Self::SPEAK,
            "mute_deafen" => Self::MUTE_DEAFEN,
            "move" => Self::MOVE,
            "make_channel" => Self::MAKE_CHANNEL,
            "link_channel" => Self::LINK_CHANNEL,
            "whisper" => Self::WHISPER,
            "text_message" => Self::TEXT_MESSAGE,
            "make_temp_channel" => Self::MAKE_TEMP_CHANNEL,
            "kick" => Self::KICK,
            "ban" => Self::BAN,
            "register" => Self::REGISTER,
            "all" => Self::ALL,
            _ => return None,
        };
        Some(permission)
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Who an ACL entry applies to
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
pub enum AclSubject {
    Everyone,
    Group(String),
    User(u32),
}

impl AclSubject {
    /// Evaluation rank inside one level: broader subjects first
    pub fn rank(&self) -> u8 {
        match self {
            AclSubject::Everyone => 0,
            AclSubject::Group(_) => 1,
            AclSubject::User(_) => 2,
        }
    }
}

/// One allow/deny rule; `channel == None` applies server-wide
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct AclEntry {
    pub channel: Option<u32>,
    pub subject: AclSubject,
    pub allow: u32,
    pub deny: u32,
}

impl AclEntry {
    pub fn allow(&self) -> Permissions {
        Permissions(self.allow)
    }

    pub fn deny(&self) -> Permissions {
        Permissions(self.deny)
    }
}

/// Complete ACL state at one version.
///
/// `epoch` identifies the hub run that produced the snapshot. Versions only
/// order snapshots within one epoch; a restarted hub counts from 1 again.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct AclSnapshot {
    pub epoch: u64,
    pub version: u64,
    pub default_permissions: u32,
    pub entries: Vec<AclEntry>,
}

impl AclSnapshot {
    /// The state every edge starts from before its first pull
    pub fn empty() -> Self {
        Self {
            epoch: 0,
            version: 0,
            default_permissions: Permissions::DEFAULT.0,
            entries: Vec::new(),
        }
    }

    /// Serialize, compress when large and checksum the result
    pub fn encode(&self) -> Result<EncodedSnapshot, CodecError> {
        let body = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        let (body, compressed) = compress_if_needed(&body)?;

        Ok(EncodedSnapshot {
            epoch: self.epoch,
            version: self.version,
            compressed,
            checksum: crc32fast::hash(&body),
            body,
        })
    }
}

/// Wire envelope carrying a snapshot with its integrity checksum
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct EncodedSnapshot {
    pub epoch: u64,
    pub version: u64,
    pub compressed: bool,
    pub checksum: u32,
    pub body: Vec<u8>,
}

impl EncodedSnapshot {
    /// Verify the checksum, decompress and decode the body.
    ///
    /// Nothing is returned unless every step succeeds, so callers can keep
    /// their current snapshot on any error.
    pub fn decode(&self) -> Result<AclSnapshot, CodecError> {
        let actual = crc32fast::hash(&self.body);
        if actual != self.checksum {
            return Err(CodecError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }

        let body = if self.compressed {
            aligned(&decompress_with_limit(&self.body, MAX_SNAPSHOT_SIZE)?)
        } else {
            aligned(&self.body)
        };

        let snapshot = rkyv::from_bytes::<AclSnapshot, rkyv::rancor::Error>(&body)
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        if snapshot.version != self.version {
            return Err(CodecError::VersionMismatch {
                envelope: self.version,
                body: snapshot.version,
            });
        }
        if snapshot.epoch != self.epoch {
            return Err(CodecError::EpochMismatch {
                envelope: self.epoch,
                body: snapshot.epoch,
            });
        }

        Ok(snapshot)
    }
}
