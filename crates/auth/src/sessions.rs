//! Live-session tracking: identical credentials on a second connection
//! reuse the first connection's result without a backend round trip.

use chorus_crypto::CredentialHasher;
use chorus_protocol::AuthResult;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

type Key = [u8; 32];

struct Tracked {
    result: AuthResult,
    degraded: bool,
    refs: usize,
}

pub struct SessionTracker {
    hasher: CredentialHasher,
    sessions: DashMap<Key, Tracked>,
}

/// Keeps a tracked result alive; dropping the last lease forgets it
pub struct SessionLease {
    tracker: Arc<SessionTracker>,
    key: Key,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionLease")
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.tracker.release(&self.key);
    }
}

impl SessionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hasher: CredentialHasher::random(),
            sessions: DashMap::new(),
        })
    }

    /// Result and degraded flag of a live session with these credentials
    pub fn lookup(
        self: &Arc<Self>,
        username: &str,
        secret: &str,
    ) -> Option<(AuthResult, bool, SessionLease)> {
        let key = self.hasher.digest(username, secret);
        let mut tracked = self.sessions.get_mut(&key)?;
        tracked.refs += 1;
        let found = (tracked.result.clone(), tracked.degraded);
        drop(tracked);

        Some((found.0, found.1, self.lease(key)))
    }

    /// Record a fresh result for a new session
    pub fn track(
        self: &Arc<Self>,
        username: &str,
        secret: &str,
        result: AuthResult,
        degraded: bool,
    ) -> SessionLease {
        let key = self.hasher.digest(username, secret);
        match self.sessions.entry(key) {
            Entry::Occupied(mut entry) => {
                let tracked = entry.get_mut();
                tracked.refs += 1;
                tracked.result = result;
                tracked.degraded = degraded;
            }
            Entry::Vacant(entry) => {
                entry.insert(Tracked {
                    result,
                    degraded,
                    refs: 1,
                });
            }
        }
        self.lease(key)
    }

    /// Distinct credential sets with at least one live session
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    fn lease(self: &Arc<Self>, key: Key) -> SessionLease {
        SessionLease {
            tracker: Arc::clone(self),
            key,
        }
    }

    fn release(&self, key: &Key) {
        if let Entry::Occupied(mut entry) = self.sessions.entry(*key) {
            let tracked = entry.get_mut();
            tracked.refs = tracked.refs.saturating_sub(1);
            if tracked.refs == 0 {
                entry.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_requires_identical_secret() {
        let tracker = SessionTracker::new();
        let _lease = tracker.track("bob", "pw", AuthResult::success(2, "bob"), false);

        assert!(tracker.lookup("bob", "other").is_none());
        let (result, degraded, _second) = tracker.lookup("bob", "pw").unwrap();
        assert_eq!(result.user_id, 2);
        assert!(!degraded);
    }

    #[test]
    fn test_forgotten_after_last_lease() {
        let tracker = SessionTracker::new();
        let first = tracker.track("bob", "pw", AuthResult::success(2, "bob"), true);
        let (_, degraded, second) = tracker.lookup("bob", "pw").unwrap();
        assert!(degraded);

        drop(first);
        assert_eq!(tracker.active(), 1);
        drop(second);
        assert_eq!(tracker.active(), 0);
        assert!(tracker.lookup("bob", "pw").is_none());
    }
}
