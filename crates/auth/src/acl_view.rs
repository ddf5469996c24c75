//! Edge-local ACL snapshot, replaced by pointer swap
//!
//! Readers clone the current `Arc` and evaluate against it; a new snapshot
//! is fully decoded and indexed before it becomes visible.

use chorus_protocol::{AclEntry, AclSnapshot, AuthResult, CodecError, EncodedSnapshot, Permissions};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AclError {
    #[error("snapshot rejected: {0}")]
    Codec(#[from] CodecError),
}

/// A snapshot indexed for evaluation
#[derive(Debug)]
pub struct ResolvedAcl {
    epoch: u64,
    version: u64,
    default: Permissions,
    server: Vec<AclEntry>,
    channels: HashMap<u32, Vec<AclEntry>>,
}

impl ResolvedAcl {
    pub fn build(snapshot: AclSnapshot) -> Self {
        let mut server = Vec::new();
        let mut channels: HashMap<u32, Vec<AclEntry>> = HashMap::new();
        for entry in snapshot.entries {
            match entry.channel {
                None => server.push(entry),
                Some(channel) => channels.entry(channel).or_default().push(entry),
            }
        }

        // stable: snapshot order is kept within a rank
        server.sort_by_key(|e| e.subject.rank());
        for entries in channels.values_mut() {
            entries.sort_by_key(|e| e.subject.rank());
        }

        Self {
            epoch: snapshot.epoch,
            version: snapshot.version,
            default: Permissions(snapshot.default_permissions),
            server,
            channels,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether a snapshot at `epoch`/`version` should replace this one: any
    /// snapshot from another hub run does, otherwise only a newer version.
    pub fn superseded_by(&self, epoch: u64, version: u64) -> bool {
        epoch != self.epoch || version > self.version
    }

    pub fn entry_count(&self) -> usize {
        self.server.len() + self.channels.values().map(Vec::len).sum::<usize>()
    }

    /// Effective permissions in `channel`
    pub fn permissions(&self, user: &AuthResult, channel: u32) -> Permissions {
        self.permissions_along(user, &[channel])
    }

    /// Effective permissions at the end of `path` (root first). Server-wide
    /// entries apply first, then each channel's entries in path order.
    pub fn permissions_along(&self, user: &AuthResult, path: &[u32]) -> Permissions {
        if user.is_superuser() {
            return Permissions::ALL;
        }

        let mut granted = apply_level(self.default, &self.server, user);
        for channel in path {
            if let Some(entries) = self.channels.get(channel) {
                granted = apply_level(granted, entries, user);
            }
        }
        granted
    }
}

fn apply_level(mut granted: Permissions, entries: &[AclEntry], user: &AuthResult) -> Permissions {
    for entry in entries.iter().filter(|e| applies_to(e, user)) {
        granted = granted.apply(entry.allow(), entry.deny());
    }
    granted
}

fn applies_to(entry: &AclEntry, user: &AuthResult) -> bool {
    use chorus_protocol::AclSubject;
    match &entry.subject {
        AclSubject::Everyone => true,
        AclSubject::Group(group) => user.in_group(group),
        AclSubject::User(id) => *id == user.user_id,
    }
}

pub struct AclView {
    current: RwLock<Arc<ResolvedAcl>>,
}

impl Default for AclView {
    fn default() -> Self {
        Self::new()
    }
}

impl AclView {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ResolvedAcl::build(AclSnapshot::empty()))),
        }
    }

    pub fn current(&self) -> Arc<ResolvedAcl> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    pub fn epoch(&self) -> u64 {
        self.current.read().epoch
    }

    /// Swap in `snapshot` if it supersedes the current one. Returns whether
    /// it was applied.
    pub fn apply(&self, snapshot: AclSnapshot) -> bool {
        if !self.current().superseded_by(snapshot.epoch, snapshot.version) {
            debug!("Ignoring ACL snapshot v{} (have v{})", snapshot.version, self.version());
            return false;
        }

        let resolved = Arc::new(ResolvedAcl::build(snapshot));
        let mut current = self.current.write();
        if !current.superseded_by(resolved.epoch, resolved.version) {
            return false;
        }
        if current.epoch != resolved.epoch {
            info!(
                "ACL epoch changed {:#x} -> {:#x}; v{} replaces v{}",
                current.epoch, resolved.epoch, resolved.version, current.version
            );
        }
        info!(
            "ACL snapshot v{} applied ({} entries)",
            resolved.version,
            resolved.entry_count()
        );
        *current = resolved;
        true
    }

    /// Verify, decompress and decode a wire snapshot, then swap it in.
    /// On error the current snapshot stays authoritative.
    pub fn apply_encoded(&self, encoded: &EncodedSnapshot) -> Result<bool, AclError> {
        if !self.current().superseded_by(encoded.epoch, encoded.version) {
            debug!("Ignoring ACL snapshot v{} (have v{})", encoded.version, self.version());
            return Ok(false);
        }
        let snapshot = encoded.decode()?;
        Ok(self.apply(snapshot))
    }

    pub fn permissions(&self, user: &AuthResult, channel: u32) -> Permissions {
        self.current().permissions(user, channel)
    }
}
