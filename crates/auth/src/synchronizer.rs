//! Credential resolution: live session, then cache, then backend, then
//! stale-cache fallback

use crate::backend::{BackendError, SharedAuthBackend};
use crate::cache::{CacheError, CachedUser, UserCache, unix_now};
use crate::config::AuthConfig;
use crate::sessions::{SessionLease, SessionTracker};
use chorus_protocol::{AuthRequest, AuthResult, AuthStatus};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Which stage of the pipeline produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSource {
    Session,
    Cache,
    Backend,
    Fallback,
}

impl AuthSource {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthSource::Session => "session",
            AuthSource::Cache => "cache",
            AuthSource::Backend => "backend",
            AuthSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug)]
pub struct Authenticated {
    pub result: AuthResult,
    pub source: AuthSource,
    /// Accepted against stale cached material while the backend was down
    pub degraded: bool,
    /// Held by the session for as long as it lives
    pub lease: Option<SessionLease>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {reason}", status.as_str())]
pub struct AuthRejection {
    pub status: AuthStatus,
    pub reason: String,
}

impl AuthRejection {
    fn new(status: AuthStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

pub struct AuthSynchronizer {
    config: AuthConfig,
    backend: SharedAuthBackend,
    cache: Arc<UserCache>,
    sessions: Option<Arc<SessionTracker>>,
}

impl AuthSynchronizer {
    pub fn new(config: AuthConfig, backend: SharedAuthBackend, cache: Arc<UserCache>) -> Self {
        let sessions = config.track_sessions.then(SessionTracker::new);
        Self {
            config,
            backend,
            cache,
            sessions,
        }
    }

    /// Build with the cache reloaded from `user_cache_path`, if configured
    pub async fn from_config(config: AuthConfig, backend: SharedAuthBackend) -> Result<Self, CacheError> {
        let cache = match &config.user_cache_path {
            Some(path) => UserCache::load(path).await?,
            None => UserCache::new(None),
        };
        Ok(Self::new(config, backend, Arc::new(cache)))
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<UserCache> {
        &self.cache
    }

    /// Sessions currently sharing a tracked result
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.as_ref().map(|s| s.active()).unwrap_or(0)
    }

    pub async fn authenticate(&self, request: &AuthRequest) -> Result<Authenticated, AuthRejection> {
        let secret = request.secret();
        if request.username.is_empty() {
            return Err(AuthRejection::new(AuthStatus::InvalidCredentials, "username is required"));
        }
        if secret.is_empty() {
            return Err(AuthRejection::new(
                AuthStatus::InvalidCredentials,
                "neither password nor certificate presented",
            ));
        }

        if let Some(tracker) = &self.sessions {
            if let Some((result, degraded, lease)) = tracker.lookup(&request.username, secret) {
                debug!("Reusing live session result for {}", request.username);
                return Ok(Authenticated {
                    result,
                    source: AuthSource::Session,
                    degraded,
                    lease: Some(lease),
                });
            }
        }

        let cached = self.cache.get(&request.username);
        if let Some(entry) = cached
            .as_ref()
            .filter(|entry| entry.is_fresh(unix_now(), self.config.cache_ttl_secs))
        {
            if !entry.secret.verify(secret) {
                return Err(AuthRejection::new(
                    AuthStatus::InvalidCredentials,
                    "secret does not match cached credentials",
                ));
            }
            debug!("Cache hit for {}", request.username);
            return Ok(self.accept(request, entry.to_result(), AuthSource::Cache, false));
        }

        match self.call_backend(request).await {
            Ok(result) => {
                self.cache
                    .insert(CachedUser::from_result(&result, secret, unix_now()));
                if let Err(e) = self.cache.persist().await {
                    warn!("Failed to persist user cache: {}", e);
                }
                info!("Authenticated {} via {} backend", request.username, self.backend.name());
                Ok(self.accept(request, result, AuthSource::Backend, false))
            }
            Err(BackendError::Rejected(status)) => Err(AuthRejection::new(
                status,
                format!("rejected by {} backend", self.backend.name()),
            )),
            Err(BackendError::Unreachable(reason)) => self.fallback(request, cached, reason),
        }
    }

    /// Bounded attempts against the backend; only outages are retried
    async fn call_backend(&self, request: &AuthRequest) -> Result<AuthResult, BackendError> {
        let attempts = self.config.retry + 1;
        let timeout = self.config.timeout();
        let mut backoff = self.config.retry_backoff();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.backend.authenticate(request)).await {
                Ok(Ok(result)) if result.status == AuthStatus::Success => return Ok(result),
                Ok(Ok(result)) if result.status.is_rejection() => {
                    return Err(BackendError::Rejected(result.status));
                }
                Ok(Ok(_)) => last_error = "backend reported a server error".into(),
                Ok(Err(BackendError::Rejected(status))) if status.is_rejection() => {
                    return Err(BackendError::Rejected(status));
                }
                Ok(Err(BackendError::Rejected(status))) => {
                    last_error = format!("backend answered {}", status.as_str());
                }
                Ok(Err(BackendError::Unreachable(reason))) => last_error = reason,
                Err(_) => last_error = format!("timed out after {:?}", timeout),
            }

            if attempt < attempts {
                warn!(
                    "Auth backend attempt {}/{} for {} failed: {}",
                    attempt, attempts, request.username, last_error
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(BackendError::Unreachable(last_error))
    }

    fn fallback(
        &self,
        request: &AuthRequest,
        cached: Option<CachedUser>,
        reason: String,
    ) -> Result<Authenticated, AuthRejection> {
        if !self.config.allow_cache_fallback {
            return Err(AuthRejection::new(
                AuthStatus::ServerError,
                format!("auth backend unreachable: {}", reason),
            ));
        }

        match cached {
            Some(entry) if entry.secret.verify(request.secret()) => {
                warn!(
                    "Auth backend unreachable ({}); admitting {} from stale cache",
                    reason, request.username
                );
                Ok(self.accept(request, entry.to_result(), AuthSource::Fallback, true))
            }
            Some(_) => Err(AuthRejection::new(
                AuthStatus::InvalidCredentials,
                "secret does not match cached credentials",
            )),
            None => Err(AuthRejection::new(
                AuthStatus::ServerError,
                format!("auth backend unreachable and no cached entry: {}", reason),
            )),
        }
    }

    fn accept(
        &self,
        request: &AuthRequest,
        result: AuthResult,
        source: AuthSource,
        degraded: bool,
    ) -> Authenticated {
        let lease = self
            .sessions
            .as_ref()
            .map(|tracker| tracker.track(&request.username, request.secret(), result.clone(), degraded));

        Authenticated {
            result,
            source,
            degraded,
            lease,
        }
    }
}
