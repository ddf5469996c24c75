//! Hub role
//!
//! Accepts edge links, keeps them in the [`NodeRegistry`], resolves
//! credentials forwarded by edges and pushes ACL snapshots to every
//! registered edge whenever the [`AclStore`] changes.

use crate::acl_store::AclStore;
use crate::config::{DaemonConfig, HubConfig};
use crate::metrics::METRICS;
use crate::node_registry::{EdgeHandle, NodeRegistry, RegistryError};
use crate::wire;
use anyhow::{Result, bail};
use chorus_auth::{
    AuthSynchronizer, BackendKind, DirectoryAuthBackend, HttpAuthBackend, SharedAuthBackend,
};
use chorus_protocol::{AuthRequest, AuthStatus, LinkErrorCode, LinkMessage};
use chorus_transport::{Connection, Listener};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Hub {
    config: HubConfig,
    registry: Arc<NodeRegistry>,
    acl: Arc<AclStore>,
    auth: Arc<AuthSynchronizer>,
    stopping: CancellationToken,
}

/// Per-link state of one connected edge
struct EdgeLink {
    node_id: String,
    session: u64,
    handle: EdgeHandle,
    registered: bool,
}

impl Hub {
    pub fn new(config: HubConfig, auth: AuthSynchronizer) -> Result<Arc<Self>> {
        let entries = config
            .acl
            .iter()
            .map(|rule| rule.to_entry())
            .collect::<Result<Vec<_>>>()?;
        let acl = AclStore::new(config.default_permissions()?, entries)?;
        let registry = NodeRegistry::new(config.max_edges, config.heartbeat_timeout());

        Ok(Arc::new(Self {
            config,
            registry,
            acl: Arc::new(acl),
            auth: Arc::new(auth),
            stopping: CancellationToken::new(),
        }))
    }

    pub async fn from_config(config: &DaemonConfig) -> Result<Arc<Self>> {
        let backend: SharedAuthBackend = match config.auth.backend_kind()? {
            BackendKind::Directory => {
                info!("Hub directory holds {} users", config.hub.users.len());
                Arc::new(DirectoryAuthBackend::new(config.hub.users.clone()))
            }
            BackendKind::Http(url) => Arc::new(HttpAuthBackend::new(
                url,
                config.auth.credential.clone(),
                config.auth.timeout(),
                config.auth.tls_insecure,
            )?),
            BackendKind::Hub => bail!("the hub cannot forward authentication to itself"),
        };

        let auth = AuthSynchronizer::from_config(config.auth.clone(), backend).await?;
        Self::new(config.hub.clone(), auth)
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn acl(&self) -> &Arc<AclStore> {
        &self.acl
    }

    /// Stop accepting and close every edge link. Edges keep their snapshot
    /// and reconnect to whichever hub answers next.
    pub fn shutdown(&self) {
        self.stopping.cancel();
    }

    /// Accept edge links until the listener stops or [`Hub::shutdown`]
    pub async fn serve(self: Arc<Self>, listener: Listener) -> Result<()> {
        info!(
            "Hub listening on {} (max {} edges)",
            listener.local_addr(),
            self.config.max_edges
        );
        METRICS.snapshot_version.set(self.acl.version() as i64);

        let sweeper = self.registry.start_sweeper();
        let pusher = self.spawn_snapshot_pusher();

        let mut incoming = std::pin::pin!(listener.incoming());
        loop {
            let accepted = tokio::select! {
                accepted = incoming.next() => accepted,
                _ = self.stopping.cancelled() => break,
            };
            let Some(accepted) = accepted else {
                break;
            };
            match accepted {
                Ok(conn) => {
                    debug!("Edge link from {} ({})", conn.peer_addr(), conn.protocol().as_str());
                    tokio::spawn(Arc::clone(&self).handle_link(conn));
                }
                Err(e) => warn!("Edge link handshake failed: {}", e),
            }
        }

        sweeper.abort();
        pusher.abort();
        info!("Hub stopped accepting edge links");
        Ok(())
    }

    /// Push the current snapshot on every change and every push interval
    fn spawn_snapshot_pusher(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut changes = self.acl.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.snapshot_push_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                }

                let version = hub.acl.version();
                METRICS.snapshot_version.set(version as i64);
                let push = LinkMessage::SnapshotPush {
                    snapshot: hub.acl.encoded(),
                };
                let delivered = hub.registry.broadcast(&push);
                debug!("Pushed ACL snapshot v{} to {} edges", version, delivered);
            }
        })
    }

    async fn handle_link(self: Arc<Self>, conn: Connection) {
        let conn = Arc::new(conn);
        let peer = conn.peer_addr();
        let (mut frames, reader) = wire::spawn_reader(Arc::clone(&conn));

        let first = tokio::time::timeout(self.registry.timeout(), frames.recv()).await;
        let (node_id, address, have) = match first.map(|f| f.map(|f| LinkMessage::decode(&f))) {
            Ok(Some(Ok(LinkMessage::Register {
                node_id,
                address,
                snapshot_epoch,
                snapshot_version,
            }))) => (node_id, address, (snapshot_epoch, snapshot_version)),
            Ok(Some(Ok(other))) => {
                warn!("Edge {} sent {} before registering", peer, other.kind());
                let reply = LinkMessage::error(LinkErrorCode::NotRegistered, "register first");
                return refuse(&conn, reader, &reply).await;
            }
            Ok(Some(Err(e))) => {
                warn!("Malformed frame from edge {}: {}", peer, e);
                let reply = LinkMessage::error(LinkErrorCode::Malformed, e.to_string());
                return refuse(&conn, reader, &reply).await;
            }
            Ok(None) | Err(_) => {
                debug!("Edge {} left before registering", peer);
                return close(&conn, reader).await;
            }
        };

        let (handle, queue) = mpsc::unbounded_channel();
        let session = match self.registry.register(&node_id, &address, handle.clone()) {
            Ok(session) => session,
            Err(e) => {
                warn!("Refusing edge {} from {}: {}", node_id, peer, e);
                let reply = LinkMessage::error(link_error_code(&e), e.to_string());
                return refuse(&conn, reader, &reply).await;
            }
        };

        let writer = wire::spawn_link_writer(Arc::clone(&conn), queue);
        let mut link = EdgeLink {
            node_id,
            session,
            handle,
            registered: true,
        };
        self.welcome(&link.handle, have);

        loop {
            let frame = tokio::select! {
                frame = frames.recv() => frame,
                _ = self.stopping.cancelled() => {
                    debug!("Closing link to {} for shutdown", link.node_id);
                    break;
                }
            };
            let Some(frame) = frame else {
                break;
            };
            let message = match LinkMessage::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Malformed frame from edge {}: {}", link.node_id, e);
                    let _ = link.handle.send(LinkMessage::error(LinkErrorCode::Malformed, e.to_string()));
                    continue;
                }
            };
            if !self.handle_message(&mut link, message) {
                break;
            }
        }

        if link.registered {
            self.registry.release(&link.node_id, link.session);
        }
        info!("Edge link {} ({}) closed", link.node_id, peer);

        drop(link);
        let _ = writer.await;
        wire::linger(&conn).await;
        close(&conn, reader).await;
    }

    /// Acknowledge a registration and push the snapshot if the edge's
    /// `(epoch, version)` is behind ours
    fn welcome(&self, handle: &EdgeHandle, (epoch, version): (u64, u64)) {
        let _ = handle.send(LinkMessage::RegisterAck {
            heartbeat_timeout_ms: self.registry.timeout().as_millis() as u64,
        });
        self.push_if_behind(handle, epoch, version);
    }

    fn push_if_behind(&self, handle: &EdgeHandle, epoch: u64, version: u64) {
        if self.acl.is_behind(epoch, version) {
            let _ = handle.send(LinkMessage::SnapshotPush {
                snapshot: self.acl.encoded(),
            });
        }
    }

    /// Returns false once the link should end
    fn handle_message(self: &Arc<Self>, link: &mut EdgeLink, message: LinkMessage) -> bool {
        match message {
            LinkMessage::Register {
                node_id,
                address,
                snapshot_epoch,
                snapshot_version,
            } => {
                if node_id != link.node_id {
                    let _ = link.handle.send(LinkMessage::error(
                        LinkErrorCode::NotRegistered,
                        format!("link belongs to {}", link.node_id),
                    ));
                    return true;
                }
                match self.registry.register(&node_id, &address, link.handle.clone()) {
                    Ok(session) => {
                        link.session = session;
                        link.registered = true;
                        self.welcome(&link.handle, (snapshot_epoch, snapshot_version));
                        true
                    }
                    Err(e) => {
                        warn!("Refusing re-registration of {}: {}", node_id, e);
                        link.registered = false;
                        let _ = link
                            .handle
                            .send(LinkMessage::error(link_error_code(&e), e.to_string()));
                        false
                    }
                }
            }

            LinkMessage::Heartbeat { node_id, seq } => {
                let reply = if node_id != link.node_id {
                    LinkMessage::error(
                        LinkErrorCode::NotRegistered,
                        format!("link belongs to {}", link.node_id),
                    )
                } else {
                    match self.registry.heartbeat(&node_id, link.session) {
                        Ok(()) => LinkMessage::HeartbeatAck { seq },
                        Err(RegistryError::Superseded(_)) => {
                            // the Superseded notice was queued at takeover
                            info!("Dropping superseded link of {}", node_id);
                            link.registered = false;
                            return false;
                        }
                        Err(e) => {
                            link.registered = false;
                            LinkMessage::error(link_error_code(&e), e.to_string())
                        }
                    }
                };
                let _ = link.handle.send(reply);
                true
            }

            LinkMessage::Deregister { node_id } => {
                if node_id == link.node_id && link.registered {
                    if self.registry.owns(&node_id, link.session) {
                        let _ = self.registry.deregister(&node_id);
                    }
                    link.registered = false;
                }
                false
            }

            LinkMessage::SnapshotPullRequest {
                have_epoch,
                have_version,
                ..
            } => {
                self.push_if_behind(&link.handle, have_epoch, have_version);
                true
            }

            LinkMessage::AuthForward { request_id, request } => {
                if !self.registry.owns(&link.node_id, link.session) {
                    let _ = link.handle.send(LinkMessage::AuthVerdict {
                        request_id,
                        status: AuthStatus::ServerError,
                        result: None,
                        message: "edge is not registered".to_string(),
                    });
                    return true;
                }
                self.spawn_auth(request_id, request, link.handle.clone());
                true
            }

            LinkMessage::Error { code, message } => {
                warn!("Edge {} reported {:?}: {}", link.node_id, code, message);
                true
            }

            other => {
                let _ = link.handle.send(LinkMessage::error(
                    LinkErrorCode::Malformed,
                    format!("unexpected {} from an edge", other.kind()),
                ));
                true
            }
        }
    }

    fn spawn_auth(self: &Arc<Self>, request_id: u64, request: AuthRequest, handle: EdgeHandle) {
        let auth = Arc::clone(&self.auth);
        tokio::spawn(async move {
            let verdict = match auth.authenticate(&request).await {
                Ok(authenticated) => {
                    METRICS
                        .auth_outcomes
                        .with_label_values(&[authenticated.source.as_str()])
                        .inc();
                    LinkMessage::AuthVerdict {
                        request_id,
                        status: AuthStatus::Success,
                        result: Some(authenticated.result),
                        message: String::new(),
                    }
                }
                Err(rejection) => {
                    METRICS.auth_outcomes.with_label_values(&["rejected"]).inc();
                    LinkMessage::AuthVerdict {
                        request_id,
                        status: rejection.status,
                        result: None,
                        message: rejection.reason,
                    }
                }
            };
            let _ = handle.send(verdict);
        });
    }
}

fn link_error_code(error: &RegistryError) -> LinkErrorCode {
    match error {
        RegistryError::RegistryFull { .. } => LinkErrorCode::RegistryFull,
        RegistryError::UnknownNode(_) => LinkErrorCode::UnknownNode,
        RegistryError::Superseded(_) => LinkErrorCode::Superseded,
    }
}

async fn refuse(conn: &Connection, reader: JoinHandle<()>, reply: &LinkMessage) {
    if wire::send_link(conn, reply).await.is_ok() {
        wire::linger(conn).await;
    }
    close(conn, reader).await;
}

async fn close(conn: &Connection, reader: JoinHandle<()>) {
    conn.close().await;
    reader.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AclRule;
    use chorus_auth::{AuthConfig, DirectoryUser};
    use chorus_protocol::Permissions;
    use std::collections::BTreeMap;

    fn hub(max_edges: usize) -> Arc<Hub> {
        let config = HubConfig {
            max_edges,
            acl: vec![AclRule {
                channel: Some(5),
                subject: "everyone".to_string(),
                allow: vec![],
                deny: vec!["enter".to_string()],
            }],
            ..HubConfig::default()
        };
        let backend = Arc::new(DirectoryAuthBackend::new(vec![DirectoryUser {
            id: 7,
            username: "alice".to_string(),
            display_name: None,
            password: Some("hunter2".to_string()),
            cert_hash: None,
            groups: vec![],
            permissions: vec![],
            banned: false,
            metadata: BTreeMap::new(),
        }]));
        let auth_config = AuthConfig {
            backend: "directory".to_string(),
            ..AuthConfig::default()
        };
        let auth = AuthSynchronizer::new(auth_config, backend, Arc::new(chorus_auth::UserCache::new(None)));
        Hub::new(config, auth).unwrap()
    }

    fn link(hub: &Hub, node_id: &str) -> (EdgeLink, mpsc::UnboundedReceiver<LinkMessage>) {
        let (handle, queue) = mpsc::unbounded_channel();
        let session = hub.registry.register(node_id, "10.0.0.1:64738", handle.clone()).unwrap();
        (
            EdgeLink {
                node_id: node_id.to_string(),
                session,
                handle,
                registered: true,
            },
            queue,
        )
    }

    #[test]
    fn test_initial_acl_comes_from_config() {
        let hub = hub(1);
        let snapshot = hub.acl().snapshot();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_welcome_pushes_newer_snapshot_only() {
        let hub = hub(2);
        let (handle, mut queue) = mpsc::unbounded_channel();

        hub.welcome(&handle, (0, 0));
        assert!(matches!(queue.recv().await, Some(LinkMessage::RegisterAck { .. })));
        assert!(matches!(queue.recv().await, Some(LinkMessage::SnapshotPush { .. })));

        hub.welcome(&handle, (hub.acl().epoch(), 1));
        assert!(matches!(queue.recv().await, Some(LinkMessage::RegisterAck { .. })));
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_restarted_hub_overrides_edge_with_higher_version() {
        // the previous hub run got to v3 with no entries
        let edge_acl = chorus_auth::AclView::new();
        let previous = AclStore::new(Permissions::DEFAULT, vec![]).unwrap();
        previous.replace(vec![]).unwrap();
        previous.replace(vec![]).unwrap();
        assert!(edge_acl.apply_encoded(&previous.encoded()).unwrap());
        assert_eq!(edge_acl.version(), 3);

        // the restarted hub denies ENTER on channel 5 and is only at v2
        let hub = hub(2);
        hub.acl().update(|_| {}).unwrap();
        assert_eq!(hub.acl().version(), 2);

        let (handle, mut queue) = mpsc::unbounded_channel();
        hub.welcome(&handle, (edge_acl.epoch(), edge_acl.version()));
        assert!(matches!(queue.recv().await, Some(LinkMessage::RegisterAck { .. })));
        let pushed = match queue.recv().await {
            Some(LinkMessage::SnapshotPush { snapshot }) => snapshot,
            other => panic!("expected a snapshot push, got {:?}", other),
        };
        assert!(edge_acl.apply_encoded(&pushed).unwrap());
        assert_eq!(edge_acl.version(), 2);
        assert_eq!(edge_acl.current().entry_count(), 1);
        let guest = chorus_protocol::AuthResult::success(9, "guest");
        assert!(!edge_acl.permissions(&guest, 5).contains(Permissions::ENTER));
    }

    #[tokio::test]
    async fn test_pull_from_previous_epoch_gets_snapshot() {
        let hub = hub(1);
        let (mut link, mut queue) = link(&hub, "edge-a");

        let pull = |have_epoch, have_version| LinkMessage::SnapshotPullRequest {
            node_id: "edge-a".into(),
            have_epoch,
            have_version,
        };
        assert!(hub.handle_message(&mut link, pull(hub.acl().epoch(), 1)));
        assert!(queue.try_recv().is_err());

        assert!(hub.handle_message(&mut link, pull(hub.acl().epoch() ^ 1, 40)));
        assert!(matches!(queue.recv().await, Some(LinkMessage::SnapshotPush { .. })));
    }

    #[tokio::test]
    async fn test_heartbeat_after_eviction_reports_unknown_node() {
        let hub = hub(1);
        let (mut link, mut queue) = link(&hub, "edge-a");

        assert!(hub.handle_message(&mut link, LinkMessage::Heartbeat { node_id: "edge-a".into(), seq: 1 }));
        assert_eq!(queue.recv().await, Some(LinkMessage::HeartbeatAck { seq: 1 }));

        hub.registry.deregister("edge-a").unwrap();
        assert!(hub.handle_message(&mut link, LinkMessage::Heartbeat { node_id: "edge-a".into(), seq: 2 }));
        match queue.recv().await {
            Some(LinkMessage::Error { code, .. }) => assert_eq!(code, LinkErrorCode::UnknownNode),
            other => panic!("unexpected reply: {:?}", other),
        }

        // the edge re-registers on the same link
        let register = LinkMessage::Register {
            node_id: "edge-a".into(),
            address: "10.0.0.1:64738".into(),
            snapshot_epoch: hub.acl().epoch(),
            snapshot_version: 1,
        };
        assert!(hub.handle_message(&mut link, register));
        assert!(link.registered);
        assert!(hub.registry.contains("edge-a"));
    }

    #[tokio::test]
    async fn test_second_link_for_same_node_drops_the_first() {
        let hub = hub(1);
        let (mut old, mut old_queue) = link(&hub, "edge-a");
        let (mut new, _new_queue) = link(&hub, "edge-a");

        match old_queue.recv().await {
            Some(LinkMessage::Error { code, .. }) => assert_eq!(code, LinkErrorCode::Superseded),
            other => panic!("unexpected reply: {:?}", other),
        }
        let heartbeat = || LinkMessage::Heartbeat {
            node_id: "edge-a".into(),
            seq: 1,
        };
        assert!(!hub.handle_message(&mut old, heartbeat()));
        assert!(!old.registered);

        // the old link ending does not take the new registration with it
        assert!(!hub.registry.release("edge-a", old.session));
        assert!(hub.handle_message(&mut new, heartbeat()));
        assert!(hub.registry.contains("edge-a"));
    }

    #[tokio::test]
    async fn test_forwarded_auth_gets_verdict() {
        let hub = hub(1);
        let (mut link, mut queue) = link(&hub, "edge-a");

        let request = AuthRequest {
            username: "alice".into(),
            password: "hunter2".into(),
            cert_hash: None,
            ip_address: "192.0.2.1".into(),
            server_id: "chorus".into(),
        };
        hub.handle_message(&mut link, LinkMessage::AuthForward { request_id: 11, request: request.clone() });
        match queue.recv().await {
            Some(LinkMessage::AuthVerdict { request_id, status, result, .. }) => {
                assert_eq!(request_id, 11);
                assert_eq!(status, AuthStatus::Success);
                assert_eq!(result.unwrap().user_id, 7);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let wrong = AuthRequest {
            password: "nope".into(),
            ..request
        };
        hub.handle_message(&mut link, LinkMessage::AuthForward { request_id: 12, request: wrong });
        match queue.recv().await {
            Some(LinkMessage::AuthVerdict { request_id, status, result, .. }) => {
                assert_eq!(request_id, 12);
                assert_eq!(status, AuthStatus::InvalidCredentials);
                assert!(result.is_none());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deregister_ends_link() {
        let hub = hub(1);
        let (mut link, _queue) = link(&hub, "edge-a");

        assert!(!hub.handle_message(&mut link, LinkMessage::Deregister { node_id: "edge-a".into() }));
        assert!(!link.registered);
        assert!(hub.registry.is_empty());
    }
}
