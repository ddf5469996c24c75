//! Authentication backends
//!
//! A backend either produces a successful [`AuthResult`], rejects the
//! credentials explicitly, or cannot be reached. Only the last outcome is
//! retried and may fall back to the cache.

use async_trait::async_trait;
use chorus_crypto::SecretDigest;
use chorus_protocol::{AuthRequest, AuthResult, AuthStatus};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("credentials rejected: {}", .0.as_str())]
    Rejected(AuthStatus),

    #[error("backend unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResult, BackendError>;
}

pub type SharedAuthBackend = Arc<dyn AuthBackend>;

/// JSON body returned by an HTTP auth service
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpAuthResponse {
    status: String,
    #[serde(default)]
    user_id: Option<u32>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpAuthResponse {
    fn into_result(self, request: &AuthRequest) -> Result<AuthResult, BackendError> {
        match self.status.as_str() {
            "success" => {
                let user_id = self
                    .user_id
                    .ok_or_else(|| BackendError::Unreachable("success response without userId".into()))?;
                let username = self.username.unwrap_or_else(|| request.username.clone());
                Ok(AuthResult {
                    status: AuthStatus::Success,
                    user_id,
                    display_name: self.display_name.unwrap_or_else(|| username.clone()),
                    username,
                    groups: self.groups,
                    permissions: self.permissions,
                    metadata: self
                        .metadata
                        .into_iter()
                        .map(|(k, v)| match v {
                            serde_json::Value::String(s) => (k, s),
                            other => (k, other.to_string()),
                        })
                        .collect(),
                })
            }
            "error" => {
                let code = self.code.unwrap_or_default();
                match AuthStatus::from_code(&code) {
                    AuthStatus::ServerError => Err(BackendError::Unreachable(format!(
                        "backend error {:?}: {}",
                        code,
                        self.message.unwrap_or_default()
                    ))),
                    status => Err(BackendError::Rejected(status)),
                }
            }
            other => Err(BackendError::Unreachable(format!("unknown response status {:?}", other))),
        }
    }
}

/// External auth service reached over HTTP(S) with a JSON POST
pub struct HttpAuthBackend {
    client: reqwest::Client,
    url: String,
    credential: Option<String>,
}

impl HttpAuthBackend {
    pub fn new(
        url: impl Into<String>,
        credential: Option<String>,
        timeout: Duration,
        tls_insecure: bool,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(tls_insecure)
            .build()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            credential,
        })
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResult, BackendError> {
        let mut call = self.client.post(&self.url).json(request);
        if let Some(credential) = self.credential.as_deref().filter(|c| !c.is_empty()) {
            call = call.bearer_auth(credential);
        }

        let response = call
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        let status = response.status();
        debug!("Auth backend answered {} for {}", status, request.username);

        if status.is_server_error() {
            return Err(BackendError::Unreachable(format!("backend returned {}", status)));
        }
        match status.as_u16() {
            401 | 403 => return Err(BackendError::Rejected(AuthStatus::InvalidCredentials)),
            404 => return Err(BackendError::Rejected(AuthStatus::UserNotFound)),
            _ => {}
        }

        let body: HttpAuthResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Unreachable(format!("malformed backend response: {}", e)))?;
        body.into_result(request)
    }
}

/// One user of the hub's local directory
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryUser {
    pub id: u32,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Certificate fingerprint accepted instead of a password
    #[serde(default)]
    pub cert_hash: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

struct DirectoryEntry {
    user: DirectoryUser,
    password: Option<SecretDigest>,
}

/// Users declared in the hub configuration
pub struct DirectoryAuthBackend {
    users: HashMap<String, DirectoryEntry>,
}

impl DirectoryAuthBackend {
    pub fn new(users: Vec<DirectoryUser>) -> Self {
        let users = users
            .into_iter()
            .map(|mut user| {
                let password = user.password.take().map(|p| SecretDigest::new(&p));
                (user.username.clone(), DirectoryEntry { user, password })
            })
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl AuthBackend for DirectoryAuthBackend {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResult, BackendError> {
        let entry = self
            .users
            .get(&request.username)
            .ok_or(BackendError::Rejected(AuthStatus::UserNotFound))?;
        let user = &entry.user;

        if user.banned {
            return Err(BackendError::Rejected(AuthStatus::Banned));
        }

        let accepted = if !request.password.is_empty() {
            entry
                .password
                .as_ref()
                .is_some_and(|digest| digest.verify(&request.password))
        } else {
            match (&request.cert_hash, &user.cert_hash) {
                (Some(presented), Some(expected)) => presented.eq_ignore_ascii_case(expected),
                _ => false,
            }
        };
        if !accepted {
            return Err(BackendError::Rejected(AuthStatus::InvalidCredentials));
        }

        Ok(AuthResult {
            status: AuthStatus::Success,
            user_id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone().unwrap_or_else(|| user.username.clone()),
            groups: user.groups.clone(),
            permissions: user.permissions.clone(),
            metadata: user.metadata.clone(),
        })
    }
}
