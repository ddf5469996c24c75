//! Edges registering with a live hub


use chorus_auth::DirectoryAuthBackend;
use chorus_daemon::config::{AclRule, HubConfig};
use chorus_protocol::{AclEntry, AclSubject, AuthResult, LinkErrorCode, LinkMessage, Permissions};
use chorus_transport::{Connection, Protocol, TransportError};
use integration_harness::{Pki, edge_config, eventually, start_directory_hub, start_edge, start_hub_on};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(10);

async fn dial(pki: &Pki, hub: std::net::SocketAddr) -> Connection {
    let config = pki.with_client_identity(pki.client_config(Protocol::Multiplex, hub));
    chorus_transport::open(&config).await.unwrap()
}

async fn send(conn: &Connection, message: LinkMessage) {
    conn.send(message.encode().unwrap()).await.unwrap();
}

async fn next(conn: &Connection) -> Result<LinkMessage, TransportError> {
    let frame = timeout(STEP, conn.receive()).await.expect("hub went silent")?;
    Ok(LinkMessage::decode(&frame).unwrap())
}

/// Next message that is not an ACL push
async fn next_control(conn: &Connection) -> Result<LinkMessage, TransportError> {
    loop {
        match next(conn).await? {
            LinkMessage::SnapshotPush { .. } => continue,
            other => return Ok(other),
        }
    }
}

fn register(node_id: &str) -> LinkMessage {
    LinkMessage::Register {
        node_id: node_id.to_string(),
        address: format!("{}.example:64738", node_id),
        snapshot_epoch: 0,
        snapshot_version: 0,
    }
}

#[tokio::test]
async fn test_registry_capacity_is_enforced_over_the_wire() {
    let pki = Pki::new();
    let config = HubConfig {
        max_edges: 1,
        ..HubConfig::default()
    };
    let running = start_directory_hub(&pki, config, vec![]).await;

    let a = dial(&pki, running.addr).await;
    send(&a, register("edge-a")).await;
    assert!(matches!(next_control(&a).await.unwrap(), LinkMessage::RegisterAck { .. }));

    let b = dial(&pki, running.addr).await;
    send(&b, register("edge-b")).await;
    match next_control(&b).await.unwrap() {
        LinkMessage::Error { code, .. } => assert_eq!(code, LinkErrorCode::RegistryFull),
        other => panic!("expected RegistryFull, got {:?}", other),
    }
    assert!(running.hub.registry().contains("edge-a"));
    assert!(!running.hub.registry().contains("edge-b"));

    send(&a, LinkMessage::Deregister { node_id: "edge-a".to_string() }).await;
    let registry = running.hub.registry().clone();
    assert!(eventually(STEP, || async { registry.is_empty() }).await);

    let b = dial(&pki, running.addr).await;
    send(&b, register("edge-b")).await;
    assert!(matches!(next_control(&b).await.unwrap(), LinkMessage::RegisterAck { .. }));
    assert!(running.hub.registry().contains("edge-b"));
}

#[tokio::test]
async fn test_link_must_open_with_register() {
    let pki = Pki::new();
    let running = start_directory_hub(&pki, HubConfig::default(), vec![]).await;

    let conn = dial(&pki, running.addr).await;
    send(
        &conn,
        LinkMessage::Heartbeat {
            node_id: "edge-x".to_string(),
            seq: 1,
        },
    )
    .await;

    match next(&conn).await.unwrap() {
        LinkMessage::Error { code, .. } => assert_eq!(code, LinkErrorCode::NotRegistered),
        other => panic!("expected NotRegistered, got {:?}", other),
    }
    assert!(running.hub.registry().is_empty());
}

#[tokio::test]
async fn test_heartbeats_are_acknowledged() {
    let pki = Pki::new();
    let running = start_directory_hub(&pki, HubConfig::default(), vec![]).await;

    let conn = dial(&pki, running.addr).await;
    send(&conn, register("edge-a")).await;
    assert!(matches!(next_control(&conn).await.unwrap(), LinkMessage::RegisterAck { .. }));

    send(
        &conn,
        LinkMessage::Heartbeat {
            node_id: "edge-a".to_string(),
            seq: 42,
        },
    )
    .await;
    match next_control(&conn).await.unwrap() {
        LinkMessage::HeartbeatAck { seq } => assert_eq!(seq, 42),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_edges_follow_acl_changes_and_leave_cleanly() {
    let pki = Pki::new();
    let running = start_directory_hub(&pki, HubConfig::default(), vec![]).await;

    let config = edge_config(&pki, "edge-eu-1", running.addr, vec![]);
    let edge = start_edge(&config).await;
    assert!(running.hub.registry().contains("edge-eu-1"));

    let hub_acl = running.hub.acl().clone();
    let edge_acl = edge.edge.acl().clone();
    assert!(eventually(STEP, || async { edge_acl.version() == hub_acl.version() }).await);

    let version = hub_acl
        .update(|entries| {
            entries.push(AclEntry {
                channel: Some(3),
                subject: AclSubject::Everyone,
                allow: 0,
                deny: Permissions::SPEAK.0,
            })
        })
        .unwrap();
    assert!(eventually(STEP, || async { edge_acl.version() == version }).await);

    edge.edge.shutdown().await;
    let registry = running.hub.registry().clone();
    assert!(eventually(STEP, || async { registry.is_empty() }).await);
}

#[tokio::test]
async fn test_edge_catches_up_with_restarted_hub() {
    let pki = Pki::new();
    let first = start_directory_hub(&pki, HubConfig::default(), vec![]).await;
    let hub_addr = first.addr;

    let config = edge_config(&pki, "edge-eu-1", hub_addr, vec![]);
    let edge = start_edge(&config).await;
    let edge_acl = edge.edge.acl().clone();

    // the first hub run gets to v3 without any rules
    first.hub.acl().replace(vec![]).unwrap();
    let reached = first.hub.acl().replace(vec![]).unwrap();
    assert_eq!(reached, 3);
    assert!(eventually(STEP, || async { edge_acl.version() == reached }).await);

    first.stop().await;
    let link = edge.edge.link().unwrap().clone();
    assert!(eventually(STEP, || async { !link.is_registered() }).await);

    // its replacement denies ENTER on channel 5 and changes again while the edge is away
    let config = HubConfig {
        acl: vec![AclRule {
            channel: Some(5),
            subject: "everyone".to_string(),
            allow: vec![],
            deny: vec!["enter".to_string()],
        }],
        ..HubConfig::default()
    };
    let backend = Arc::new(DirectoryAuthBackend::new(vec![]));
    let second = start_hub_on(&pki, config, backend, hub_addr.port()).await;
    let hub_acl = second.hub.acl().clone();
    assert_eq!(hub_acl.set_default_permissions(Permissions::DEFAULT).unwrap(), 2);

    assert!(
        eventually(STEP * 3, || async {
            edge_acl.epoch() == hub_acl.epoch() && edge_acl.version() == hub_acl.version()
        })
        .await
    );
    assert!(link.is_registered());
    assert!(second.hub.registry().contains("edge-eu-1"));

    let guest = AuthResult::success(9, "guest");
    assert!(!edge_acl.permissions(&guest, 5).contains(Permissions::ENTER));
    assert!(edge_acl.permissions(&guest, 4).contains(Permissions::ENTER));
}

#[tokio::test]
async fn test_hub_shutdown_closes_edge_links() {
    let pki = Pki::new();
    let running = start_directory_hub(&pki, HubConfig::default(), vec![]).await;

    let conn = dial(&pki, running.addr).await;
    send(&conn, register("edge-a")).await;
    assert!(matches!(next_control(&conn).await.unwrap(), LinkMessage::RegisterAck { .. }));

    running.hub.shutdown();
    let registry = running.hub.registry().clone();
    assert!(eventually(STEP, || async { registry.is_empty() }).await);
    assert!(matches!(next_control(&conn).await, Err(TransportError::StreamClosed)));
}
