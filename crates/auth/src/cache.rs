//! Local user cache, persisted as JSON
//!
//! Only successful backend authentications write here. Entries past their
//! TTL are kept: they serve as fallback material when the backend is down.

use chorus_crypto::SecretDigest;
use chorus_protocol::{AuthResult, AuthStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache file format: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedUser {
    pub user_id: u32,
    pub username: String,
    pub display_name: String,
    pub secret: SecretDigest,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Unix seconds
    pub cached_at: u64,
}

impl CachedUser {
    pub fn from_result(result: &AuthResult, secret: &str, cached_at: u64) -> Self {
        Self {
            user_id: result.user_id,
            username: result.username.clone(),
            display_name: result.display_name.clone(),
            secret: SecretDigest::new(secret),
            groups: result.groups.clone(),
            permissions: result.permissions.clone(),
            metadata: result.metadata.clone(),
            cached_at,
        }
    }

    pub fn to_result(&self) -> AuthResult {
        AuthResult {
            status: AuthStatus::Success,
            user_id: self.user_id,
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            groups: self.groups.clone(),
            permissions: self.permissions.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn is_fresh(&self, now: u64, ttl_secs: u64) -> bool {
        now < self.cached_at.saturating_add(ttl_secs)
    }
}

pub struct UserCache {
    entries: DashMap<String, CachedUser>,
    /// Current username of each cached user id
    names: DashMap<u32, String>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl UserCache {
    /// In-memory cache; `persist` writes to `path` when one is given
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            entries: DashMap::new(),
            names: DashMap::new(),
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Reload a persisted cache. A missing file is an empty cache.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let cache = Self::new(Some(path.clone()));

        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let stored: BTreeMap<u32, CachedUser> = serde_json::from_slice(&raw)?;
                for user in stored.into_values() {
                    cache.insert(user);
                }
                info!("Loaded {} cached users from {}", cache.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No user cache at {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(cache)
    }

    pub fn get(&self, username: &str) -> Option<CachedUser> {
        self.entries.get(username).map(|entry| entry.clone())
    }

    pub fn insert(&self, user: CachedUser) {
        let user_id = user.user_id;
        let username = user.username.clone();

        // a renamed user must not stay reachable under the old name
        if let Some(previous) = self.names.insert(user_id, username.clone()) {
            if previous != username {
                self.entries.remove_if(&previous, |_, old| old.user_id == user_id);
            }
        }
        if let Some(displaced) = self.entries.insert(username.clone(), user) {
            if displaced.user_id != user_id {
                self.names
                    .remove_if(&displaced.user_id, |_, name| *name == username);
            }
        }
    }

    pub fn remove(&self, username: &str) -> Option<CachedUser> {
        let (_, user) = self.entries.remove(username)?;
        self.names.remove_if(&user.user_id, |_, name| name == username);
        Some(user)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the whole cache as `{ userId: CachedUser }`
    pub async fn persist(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;

        let stored: BTreeMap<u32, CachedUser> = self
            .entries
            .iter()
            .map(|entry| (entry.user_id, entry.value().clone()))
            .collect();
        let raw = serde_json::to_vec_pretty(&stored)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Persisted {} cached users to {}", stored.len(), path.display());
        Ok(())
    }
}
