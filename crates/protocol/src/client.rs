//! JSON command frames exchanged with voice clients

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One command from a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRequest {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

/// Stable, client-visible error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedFrame,
    ValidationError,
    NotAuthenticated,
    AlreadyAuthenticated,
    PermissionDenied,
    UnknownCommand,
    InvalidCredentials,
    UserNotFound,
    Banned,
    ServerError,
    NotFound,
    HandlerError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MalformedFrame => "malformed_frame",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotAuthenticated => "not_authenticated",
            ErrorCode::AlreadyAuthenticated => "already_authenticated",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::UserNotFound => "user_not_found",
            ErrorCode::Banned => "banned",
            ErrorCode::ServerError => "server_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::HandlerError => "handler_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Reply to exactly one `ClientRequest`, matched by `id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ClientResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Unsolicited notification pushed to a client (messages, plugin data, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    pub event: String,
    pub payload: Value,
}

impl ServerEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_without_params() {
        let request: ClientRequest = serde_json::from_str(r#"{"id":1,"command":"ping"}"#).unwrap();

        assert_eq!(request.command, "ping");
        assert!(request.params.is_null());
    }

    #[test]
    fn test_error_response_shape() {
        let response = ClientResponse::error(4, ErrorCode::PermissionDenied, "no enter");
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(
            json,
            json!({"id": 4, "ok": false, "error": {"code": "permission_denied", "message": "no enter"}})
        );
    }

    #[test]
    fn test_code_strings_match_serde() {
        for code in [ErrorCode::ValidationError, ErrorCode::NotAuthenticated, ErrorCode::Banned] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, Value::String(code.as_str().to_string()));
        }
    }
}
