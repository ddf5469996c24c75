//! Authoritative ACL state on the hub
//!
//! Every change produces a new snapshot version. The encoded form is built
//! once per version and shared by every push. Each store draws a random
//! epoch, so edges can tell a restarted hub from a stale one.

use chorus_protocol::{AclEntry, AclSnapshot, CodecError, EncodedSnapshot, Permissions};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

struct Versioned {
    snapshot: AclSnapshot,
    encoded: EncodedSnapshot,
}

pub struct AclStore {
    current: RwLock<Arc<Versioned>>,
    /// Serialises writers so versions stay strictly increasing
    write: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl AclStore {
    /// Start at version 1 of a fresh epoch with the configured entries
    pub fn new(default_permissions: Permissions, entries: Vec<AclEntry>) -> Result<Self, CodecError> {
        // epoch 0 is what an edge holds before its first snapshot
        let epoch = rand::random::<u64>().max(1);
        Self::with_epoch(epoch, default_permissions, entries)
    }

    pub fn with_epoch(
        epoch: u64,
        default_permissions: Permissions,
        entries: Vec<AclEntry>,
    ) -> Result<Self, CodecError> {
        let snapshot = AclSnapshot {
            epoch,
            version: 1,
            default_permissions: default_permissions.0,
            entries,
        };
        let encoded = snapshot.encode()?;
        let (changes, _) = watch::channel(snapshot.version);

        Ok(Self {
            current: RwLock::new(Arc::new(Versioned { snapshot, encoded })),
            write: Mutex::new(()),
            changes,
        })
    }

    pub fn version(&self) -> u64 {
        self.current.read().snapshot.version
    }

    pub fn epoch(&self) -> u64 {
        self.current.read().snapshot.epoch
    }

    /// Whether an edge holding `epoch`/`version` needs the current snapshot
    pub fn is_behind(&self, epoch: u64, version: u64) -> bool {
        let current = self.current.read();
        epoch != current.snapshot.epoch || version < current.snapshot.version
    }

    pub fn snapshot(&self) -> AclSnapshot {
        self.current.read().snapshot.clone()
    }

    pub fn encoded(&self) -> EncodedSnapshot {
        self.current.read().encoded.clone()
    }

    /// Notified with the new version after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Edit the entry list and publish the result as the next version
    pub fn update(&self, edit: impl FnOnce(&mut Vec<AclEntry>)) -> Result<u64, CodecError> {
        let _writer = self.write.lock();
        let mut next = self.snapshot();
        edit(&mut next.entries);
        self.publish(next)
    }

    pub fn replace(&self, entries: Vec<AclEntry>) -> Result<u64, CodecError> {
        self.update(|current| *current = entries)
    }

    pub fn set_default_permissions(&self, permissions: Permissions) -> Result<u64, CodecError> {
        let _writer = self.write.lock();
        let mut next = self.snapshot();
        next.default_permissions = permissions.0;
        self.publish(next)
    }

    fn publish(&self, mut next: AclSnapshot) -> Result<u64, CodecError> {
        next.version += 1;
        let encoded = next.encode()?;
        let version = next.version;
        let entries = next.entries.len();

        *self.current.write() = Arc::new(Versioned {
            snapshot: next,
            encoded,
        });
        self.changes.send_replace(version);
        info!("ACL snapshot v{} published ({} entries)", version, entries);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::AclSubject;

    fn deny_enter(channel: u32) -> AclEntry {
        AclEntry {
            channel: Some(channel),
            subject: AclSubject::Everyone,
            allow: 0,
            deny: Permissions::ENTER.0,
        }
    }

    #[test]
    fn test_every_change_bumps_version() {
        let store = AclStore::new(Permissions::DEFAULT, vec![]).unwrap();
        assert_eq!(store.version(), 1);

        assert_eq!(store.update(|entries| entries.push(deny_enter(3))).unwrap(), 2);
        assert_eq!(store.replace(vec![]).unwrap(), 3);
        assert_eq!(store.set_default_permissions(Permissions::NONE).unwrap(), 4);
        assert_eq!(store.snapshot().default_permissions, 0);
    }

    #[test]
    fn test_encoded_matches_snapshot() {
        let store = AclStore::new(Permissions::DEFAULT, vec![deny_enter(5)]).unwrap();
        store.update(|entries| entries.push(deny_enter(6))).unwrap();

        let encoded = store.encoded();
        assert_eq!(encoded.version, 2);
        assert_eq!(encoded.decode().unwrap(), store.snapshot());
    }

    #[test]
    fn test_edges_from_another_epoch_are_behind() {
        let store = AclStore::with_epoch(7, Permissions::DEFAULT, vec![]).unwrap();
        store.update(|entries| entries.push(deny_enter(3))).unwrap();

        assert!(store.is_behind(0, 0));
        assert!(store.is_behind(7, 1));
        assert!(!store.is_behind(7, 2));
        // a higher version from a previous hub run does not count
        assert!(store.is_behind(3, 9));
        assert_eq!(store.encoded().epoch, 7);
    }

    #[test]
    fn test_each_store_draws_its_own_epoch() {
        let a = AclStore::new(Permissions::DEFAULT, vec![]).unwrap();
        let b = AclStore::new(Permissions::DEFAULT, vec![]).unwrap();
        assert_ne!(a.epoch(), 0);
        assert_ne!(a.epoch(), b.epoch());
    }

    #[tokio::test]
    async fn test_subscribers_see_new_versions() {
        let store = AclStore::new(Permissions::DEFAULT, vec![]).unwrap();
        let mut changes = store.subscribe();

        store.replace(vec![deny_enter(1)]).unwrap();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 2);
    }
}
