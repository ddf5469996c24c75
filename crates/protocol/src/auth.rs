//! Authentication structures

use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Credentials presented by a client, forwarded to whichever backend decides
#[derive(Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub username: String,

    /// Empty when the client authenticates by certificate only
    #[serde(default)]
    pub password: String,

    /// SHA-256 fingerprint of the client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_hash: Option<String>,

    pub ip_address: String,
    pub server_id: String,
}

impl AuthRequest {
    /// The secret checked against stored material: the password, or the
    /// certificate fingerprint when no password was supplied
    pub fn secret(&self) -> &str {
        if !self.password.is_empty() {
            &self.password
        } else {
            self.cert_hash.as_deref().unwrap_or("")
        }
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("cert_hash", &self.cert_hash)
            .field("ip_address", &self.ip_address)
            .field("server_id", &self.server_id)
            .finish()
    }
}

/// Outcome classification of one authentication attempt
#[derive(
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(rename_all = "snake_case")]
#[rkyv(derive(Debug))]
pub enum AuthStatus {
    Success,
    InvalidCredentials,
    UserNotFound,
    Banned,
    ServerError,
}

impl AuthStatus {
    /// Explicit rejections are final: never retried, never overridden by fallback
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            AuthStatus::InvalidCredentials | AuthStatus::UserNotFound | AuthStatus::Banned
        )
    }

    /// Map a backend error code onto a status; unknown codes are server errors
    pub fn from_code(code: &str) -> Self {
        match code {
            "invalid_credentials" | "invalid_password" => AuthStatus::InvalidCredentials,
            "user_not_found" => AuthStatus::UserNotFound,
            "banned" => AuthStatus::Banned,
            _ => AuthStatus::ServerError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthStatus::Success => "success",
            AuthStatus::InvalidCredentials => "invalid_credentials",
            AuthStatus::UserNotFound => "user_not_found",
            AuthStatus::Banned => "banned",
            AuthStatus::ServerError => "server_error",
        }
    }
}

/// Identity and permission data for an authenticated user
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthResult {
    pub status: AuthStatus,
    pub user_id: u32,
    pub username: String,
    pub display_name: String,
    pub groups: Vec<String>,

    /// Server-level grants such as "superuser"
    pub permissions: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl AuthResult {
    pub fn success(user_id: u32, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            status: AuthStatus::Success,
            user_id,
            display_name: username.clone(),
            username,
            groups: Vec::new(),
            permissions: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.permissions.iter().any(|p| p == "superuser")
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_prefers_password() {
        let mut request = AuthRequest {
            username: "alice".into(),
            password: "hunter2".into(),
            cert_hash: Some("AB:CD".into()),
            ip_address: "10.0.0.1".into(),
            server_id: "edge-1".into(),
        };
        assert_eq!(request.secret(), "hunter2");

        request.password.clear();
        assert_eq!(request.secret(), "AB:CD");
    }

    #[test]
    fn test_request_json_shape() {
        let request = AuthRequest {
            username: "bob".into(),
            password: "pw".into(),
            cert_hash: None,
            ip_address: "127.0.0.1".into(),
            server_id: "1".into(),
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["ipAddress"], "127.0.0.1");
        assert_eq!(json["serverId"], "1");
        assert!(json.get("certHash").is_none());
        assert!(!format!("{:?}", request).contains("pw\""));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthStatus::from_code("banned"), AuthStatus::Banned);
        assert_eq!(AuthStatus::from_code("teapot"), AuthStatus::ServerError);
        assert!(AuthStatus::UserNotFound.is_rejection());
        assert!(!AuthStatus::ServerError.is_rejection());
    }
}
