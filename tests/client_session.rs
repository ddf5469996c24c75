//! A voice client talking to an edge whose credentials live on the hub


use async_trait::async_trait;
use bytes::Bytes;
use chorus_auth::{AuthBackend, BackendError, DirectoryAuthBackend};
use chorus_daemon::config::{ChannelConfig, HubConfig};
use chorus_protocol::{AuthRequest, AuthResult, ClientRequest, ClientResponse, ErrorCode};
use chorus_transport::{Connection, Protocol};
use integration_harness::{Pki, directory_user, edge_config, start_edge, start_hub};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

/// Directory lookups that count how often the hub had to ask
struct CountingBackend {
    inner: DirectoryAuthBackend,
    calls: AtomicUsize,
}

#[async_trait]
impl AuthBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.authenticate(request).await
    }
}

struct Client {
    conn: Connection,
    next_id: u64,
}

impl Client {
    async fn connect(pki: &Pki, edge: std::net::SocketAddr) -> Self {
        let conn = chorus_transport::open(&pki.client_config(Protocol::Multiplex, edge))
            .await
            .unwrap();
        Self { conn, next_id: 1 }
    }

    async fn call(&mut self, command: &str, params: Value) -> ClientResponse {
        let id = self.next_id;
        self.next_id += 1;
        let request = ClientRequest {
            id,
            command: command.to_string(),
            params,
        };
        self.conn
            .send(Bytes::from(serde_json::to_vec(&request).unwrap()))
            .await
            .unwrap();

        loop {
            let frame = timeout(Duration::from_secs(10), self.conn.receive())
                .await
                .expect("edge went silent")
                .unwrap();
            let value: Value = serde_json::from_slice(&frame).unwrap();
            // events are interleaved with responses
            if value.get("event").is_some() {
                continue;
            }
            let response: ClientResponse = serde_json::from_value(value).unwrap();
            assert_eq!(response.id, id);
            return response;
        }
    }
}

fn lobby() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig {
            id: 5,
            parent: None,
            name: "Lobby".to_string(),
        },
        ChannelConfig {
            id: 6,
            parent: Some(5),
            name: "Quiet Room".to_string(),
        },
    ]
}

#[tokio::test]
async fn test_client_session_through_edge_and_hub() {
    let pki = Pki::new();
    let backend = Arc::new(CountingBackend {
        inner: DirectoryAuthBackend::new(vec![directory_user(7, "alice", "hunter2")]),
        calls: AtomicUsize::new(0),
    });
    let hub = start_hub(&pki, HubConfig::default(), backend.clone()).await;
    let edge = start_edge(&edge_config(&pki, "edge-1", hub.addr, lobby())).await;

    let mut client = Client::connect(&pki, edge.addr).await;

    let early = client.call("join_channel", json!({"channel_id": 5})).await;
    assert_eq!(early.error_code(), Some(ErrorCode::NotAuthenticated));

    let login = client
        .call("authenticate", json!({"username": "alice", "password": "hunter2"}))
        .await;
    assert!(login.ok, "{:?}", login);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    let join = client.call("join_channel", json!({"channel_id": 5})).await;
    assert!(join.ok, "{:?}", join);

    let sent = client
        .call(
            "send_message",
            json!({"target": {"channel_id": 5}, "message": "hello lobby"}),
        )
        .await;
    assert!(sent.ok, "{:?}", sent);

    let no_target = client
        .call("send_message", json!({"target": {}, "message": "hello?"}))
        .await;
    assert_eq!(no_target.error_code(), Some(ErrorCode::ValidationError));

    let empty = client
        .call("send_message", json!({"target": {"channel_id": 5}, "message": ""}))
        .await;
    assert_eq!(empty.error_code(), Some(ErrorCode::ValidationError));

    let missing = client.call("join_channel", json!({"channel_id": 99})).await;
    assert_eq!(missing.error_code(), Some(ErrorCode::NotFound));

    // Commands after login never reach the auth backend again
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_credentials_come_back_from_the_hub() {
    let pki = Pki::new();
    let backend = Arc::new(CountingBackend {
        inner: DirectoryAuthBackend::new(vec![directory_user(7, "alice", "hunter2")]),
        calls: AtomicUsize::new(0),
    });
    let hub = start_hub(&pki, HubConfig::default(), backend.clone()).await;
    let edge = start_edge(&edge_config(&pki, "edge-1", hub.addr, lobby())).await;

    let mut client = Client::connect(&pki, edge.addr).await;

    let wrong = client
        .call("authenticate", json!({"username": "alice", "password": "letmein"}))
        .await;
    assert_eq!(wrong.error_code(), Some(ErrorCode::InvalidCredentials));

    let ghost = client
        .call("authenticate", json!({"username": "mallory", "password": "x"}))
        .await;
    assert_eq!(ghost.error_code(), Some(ErrorCode::UserNotFound));

    // A rejection leaves the session unauthenticated
    let join = client.call("join_channel", json!({"channel_id": 5})).await;
    assert_eq!(join.error_code(), Some(ErrorCode::NotAuthenticated));

    let login = client
        .call("authenticate", json!({"username": "alice", "password": "hunter2"}))
        .await;
    assert!(login.ok, "{:?}", login);
}
