//! Edge side of the hub link
//!
//! Keeps one registered link to the hub alive: dials with exponential
//! backoff, registers, heartbeats, pulls ACL snapshots and correlates
//! forwarded authentication requests with the hub's verdicts.

use crate::config::DaemonConfig;
use crate::metrics::METRICS;
use crate::wire;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use chorus_auth::{AclView, AuthBackend, BackendError};
use chorus_protocol::{AuthRequest, AuthResult, AuthStatus, LinkErrorCode, LinkMessage};
use chorus_transport::{Connection, TransportConfig};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub transport: TransportConfig,
    pub node_id: String,
    pub advertise: String,
    pub heartbeat_interval: Duration,
    pub pull_interval: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
}

impl LinkSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            transport: config.transport.clone(),
            node_id: config.node.id.clone(),
            advertise: config.edge.advertise.clone(),
            heartbeat_interval: config.edge.heartbeat_interval(),
            pull_interval: config.auth.pull_interval(),
            reconnect_backoff: config.edge.reconnect_backoff(),
            max_reconnect_backoff: config.edge.max_reconnect_backoff(),
        }
    }
}

/// The hub's answer to one forwarded authentication
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: AuthStatus,
    pub result: Option<AuthResult>,
    pub message: String,
}

impl Verdict {
    fn into_result(self) -> Result<AuthResult, BackendError> {
        match (self.status, self.result) {
            (AuthStatus::Success, Some(result)) => Ok(result),
            (AuthStatus::Success, None) => Err(BackendError::Unreachable(
                "hub verdict carried no result".to_string(),
            )),
            (status, _) if status.is_rejection() => Err(BackendError::Rejected(status)),
            (_, _) => Err(BackendError::Unreachable(if self.message.is_empty() {
                "hub reported a server error".to_string()
            } else {
                self.message
            })),
        }
    }
}

pub struct HubLink {
    settings: LinkSettings,
    acl: Arc<AclView>,
    outbound: RwLock<Option<mpsc::UnboundedSender<LinkMessage>>>,
    pending: DashMap<u64, oneshot::Sender<Verdict>>,
    next_request: AtomicU64,
    registered: watch::Sender<bool>,
    leaving: CancellationToken,
}

/// State of one connected, registered session with the hub
struct Session {
    queue: mpsc::UnboundedSender<LinkMessage>,
    hub_timeout: Duration,
    last_ack: Instant,
}

/// Forgets a forwarded request if its caller gives up
struct PendingRequest<'a> {
    link: &'a HubLink,
    request_id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.link.pending.remove(&self.request_id);
    }
}

impl HubLink {
    pub fn new(settings: LinkSettings, acl: Arc<AclView>) -> Arc<Self> {
        let (registered, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            acl,
            outbound: RwLock::new(None),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            registered,
            leaving: CancellationToken::new(),
        })
    }

    pub fn acl(&self) -> &Arc<AclView> {
        &self.acl
    }

    pub fn is_registered(&self) -> bool {
        *self.registered.borrow()
    }

    /// Flips to true while the edge is registered with the hub
    pub fn registered(&self) -> watch::Receiver<bool> {
        self.registered.subscribe()
    }

    /// Keep the link up until the task is aborted or the edge deregisters
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move { link.run().await })
    }

    async fn run(&self) {
        let endpoint = self.settings.transport.endpoint();
        let mut backoff = self.settings.reconnect_backoff;

        while !self.leaving.is_cancelled() {
            match chorus_transport::open(&self.settings.transport).await {
                Ok(conn) => {
                    info!("Connected to hub at {}", endpoint);
                    let mut was_registered = false;
                    match self.session(conn, &mut was_registered).await {
                        Ok(()) => info!("Hub link to {} closed", endpoint),
                        Err(e) => warn!("Hub link to {} lost: {:#}", endpoint, e),
                    }
                    if was_registered {
                        backoff = self.settings.reconnect_backoff;
                    }
                }
                Err(e) => warn!("Cannot reach hub at {}: {}", endpoint, e),
            }

            if self.leaving.is_cancelled() {
                break;
            }
            debug!("Reconnecting to hub in {:?}", backoff);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.leaving.cancelled() => break,
            }
            backoff = (backoff * 2).min(self.settings.max_reconnect_backoff);
        }
    }

    async fn session(&self, conn: Connection, was_registered: &mut bool) -> Result<()> {
        let conn = Arc::new(conn);
        let (mut frames, reader) = wire::spawn_reader(Arc::clone(&conn));
        let (queue, outgoing) = mpsc::unbounded_channel();

        let outcome: Result<()> = async {
            wire::send_link(&conn, &self.register_message()).await?;
            let hub_timeout = self.await_ack(&mut frames).await?;
            info!(
                "Registered with hub as {} (heartbeat timeout {:?})",
                self.settings.node_id, hub_timeout
            );

            let writer = wire::spawn_link_writer(Arc::clone(&conn), outgoing);
            *self.outbound.write() = Some(queue.clone());
            self.registered.send_replace(true);
            *was_registered = true;

            let mut session = Session {
                queue: queue.clone(),
                hub_timeout,
                last_ack: Instant::now(),
            };
            let _ = session.queue.send(self.pull_request());
            let result = self.drive(&mut session, &mut frames).await;
            writer.abort();
            result
        }
        .await;

        *self.outbound.write() = None;
        self.registered.send_replace(false);
        // Dropping the waiters fails their forwards as unreachable
        self.pending.clear();
        reader.abort();
        conn.close().await;
        outcome
    }

    async fn await_ack(&self, frames: &mut mpsc::Receiver<Bytes>) -> Result<Duration> {
        let frame = tokio::time::timeout(self.settings.transport.connect_timeout(), frames.recv())
            .await
            .context("hub did not acknowledge registration")?
            .context("hub closed the link during registration")?;

        match LinkMessage::decode(&frame)? {
            LinkMessage::RegisterAck { heartbeat_timeout_ms } => Ok(Duration::from_millis(heartbeat_timeout_ms)),
            LinkMessage::Error { code, message } => bail!("hub refused registration: {:?}: {}", code, message),
            other => bail!("expected register_ack, got {}", other.kind()),
        }
    }

    async fn drive(&self, session: &mut Session, frames: &mut mpsc::Receiver<Bytes>) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut pull = tokio::time::interval(self.settings.pull_interval);
        pull.set_missed_tick_behavior(MissedTickBehavior::Delay);
        pull.tick().await;
        let mut seq = 0u64;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    match LinkMessage::decode(&frame) {
                        Ok(message) => self.on_message(session, message)?,
                        Err(e) => warn!("Malformed frame from hub: {}", e),
                    }
                }
                _ = heartbeat.tick() => {
                    if session.last_ack.elapsed() > session.hub_timeout {
                        bail!("no heartbeat ack for {:?}", session.hub_timeout);
                    }
                    seq += 1;
                    let _ = session.queue.send(LinkMessage::Heartbeat {
                        node_id: self.settings.node_id.clone(),
                        seq,
                    });
                }
                _ = pull.tick() => {
                    let _ = session.queue.send(self.pull_request());
                }
            }
        }
    }

    fn on_message(&self, session: &mut Session, message: LinkMessage) -> Result<()> {
        match message {
            LinkMessage::SnapshotPush { snapshot } => match self.acl.apply_encoded(&snapshot) {
                Ok(true) => METRICS.snapshot_version.set(self.acl.version() as i64),
                Ok(false) => {}
                Err(e) => warn!("Keeping ACL v{}: {}", self.acl.version(), e),
            },
            LinkMessage::HeartbeatAck { .. } | LinkMessage::RegisterAck { .. } => {
                session.last_ack = Instant::now();
            }
            LinkMessage::AuthVerdict {
                request_id,
                status,
                result,
                message,
            } => self.resolve(request_id, Verdict { status, result, message }),
            LinkMessage::Error {
                code: LinkErrorCode::UnknownNode,
                ..
            } => {
                info!("Hub forgot {}; registering again", self.settings.node_id);
                let _ = session.queue.send(self.register_message());
                let _ = session.queue.send(self.pull_request());
            }
            LinkMessage::Error {
                code: LinkErrorCode::RegistryFull,
                message,
            } => bail!("hub registry is full: {}", message),
            LinkMessage::Error {
                code: LinkErrorCode::Superseded,
                ..
            } => {
                // reconnecting would only take the id back from the other edge
                error!(
                    "Node id {} is in use by another edge; leaving the hub",
                    self.settings.node_id
                );
                self.leaving.cancel();
                bail!("superseded by another link");
            }
            LinkMessage::Error { code, message } => warn!("Hub reported {:?}: {}", code, message),
            other => debug!("Ignoring {} from hub", other.kind()),
        }
        Ok(())
    }

    fn resolve(&self, request_id: u64, verdict: Verdict) {
        match self.pending.remove(&request_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(verdict);
            }
            None => debug!("Verdict for abandoned request {}", request_id),
        }
    }

    fn register_message(&self) -> LinkMessage {
        LinkMessage::Register {
            node_id: self.settings.node_id.clone(),
            address: self.settings.advertise.clone(),
            snapshot_epoch: self.acl.epoch(),
            snapshot_version: self.acl.version(),
        }
    }

    fn pull_request(&self) -> LinkMessage {
        LinkMessage::SnapshotPullRequest {
            node_id: self.settings.node_id.clone(),
            have_epoch: self.acl.epoch(),
            have_version: self.acl.version(),
        }
    }

    /// Ask the hub to resolve `request`. Dropping the future abandons it.
    pub async fn forward(&self, request: &AuthRequest) -> Result<Verdict, BackendError> {
        let queue = self
            .outbound
            .read()
            .clone()
            .ok_or_else(|| BackendError::Unreachable("hub link is down".to_string()))?;

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (waiter, verdict) = oneshot::channel();
        self.pending.insert(request_id, waiter);
        let _pending = PendingRequest { link: self, request_id };

        queue
            .send(LinkMessage::AuthForward {
                request_id,
                request: request.clone(),
            })
            .map_err(|_| BackendError::Unreachable("hub link is down".to_string()))?;

        verdict
            .await
            .map_err(|_| BackendError::Unreachable("hub link lost before the verdict".to_string()))
    }

    /// Leave the hub's registry before shutting down
    pub async fn deregister(&self, wait: Duration) {
        self.leaving.cancel();
        let queue = self.outbound.read().clone();
        let Some(queue) = queue else {
            return;
        };
        let _ = queue.send(LinkMessage::Deregister {
            node_id: self.settings.node_id.clone(),
        });

        let mut registered = self.registered.subscribe();
        let _ = tokio::time::timeout(wait, registered.wait_for(|r| !*r)).await;
    }
}

/// Credentials resolved by the hub over the link
pub struct HubAuthBackend {
    link: Arc<HubLink>,
}

impl HubAuthBackend {
    pub fn new(link: Arc<HubLink>) -> Self {
        Self { link }
    }
}

#[async_trait]
impl AuthBackend for HubAuthBackend {
    fn name(&self) -> &'static str {
        "hub"
    }

    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResult, BackendError> {
        self.link.forward(request).await?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> Arc<HubLink> {
        let settings = LinkSettings {
            transport: TransportConfig::default(),
            node_id: "edge-test".to_string(),
            advertise: "127.0.0.1:64738".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            pull_interval: Duration::from_secs(60),
            reconnect_backoff: Duration::from_millis(100),
            max_reconnect_backoff: Duration::from_secs(1),
        };
        HubLink::new(settings, Arc::new(AclView::new()))
    }

    fn request() -> AuthRequest {
        AuthRequest {
            username: "alice".into(),
            password: "hunter2".into(),
            cert_hash: None,
            ip_address: "192.0.2.1".into(),
            server_id: "chorus".into(),
        }
    }

    #[tokio::test]
    async fn test_forward_without_link_is_unreachable() {
        let backend = HubAuthBackend::new(link());
        assert!(matches!(
            backend.authenticate(&request()).await,
            Err(BackendError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_verdict_reaches_waiter() {
        let link = link();
        let (queue, mut outgoing) = mpsc::unbounded_channel();
        *link.outbound.write() = Some(queue);

        let forwarding = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { HubAuthBackend::new(link).authenticate(&request()).await })
        };

        let request_id = match outgoing.recv().await {
            Some(LinkMessage::AuthForward { request_id, request }) => {
                assert_eq!(request.username, "alice");
                request_id
            }
            other => panic!("unexpected message: {:?}", other),
        };
        link.resolve(
            request_id,
            Verdict {
                status: AuthStatus::Success,
                result: Some(AuthResult::success(3, "alice")),
                message: String::new(),
            },
        );

        let result = forwarding.await.unwrap().unwrap();
        assert_eq!(result.user_id, 3);
        assert!(link.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_is_forgotten() {
        let link = link();
        let (queue, _outgoing) = mpsc::unbounded_channel();
        *link.outbound.write() = Some(queue);

        let attempt = tokio::time::timeout(Duration::from_secs(5), link.forward(&request())).await;
        assert!(attempt.is_err());
        assert!(link.pending.is_empty());
    }

    #[test]
    fn test_verdict_mapping() {
        let rejected = Verdict {
            status: AuthStatus::Banned,
            result: None,
            message: "banned".into(),
        };
        assert_eq!(
            rejected.into_result(),
            Err(BackendError::Rejected(AuthStatus::Banned))
        );

        let failed = Verdict {
            status: AuthStatus::ServerError,
            result: None,
            message: "directory offline".into(),
        };
        assert_eq!(
            failed.into_result(),
            Err(BackendError::Unreachable("directory offline".into()))
        );
    }

    #[test]
    fn test_snapshot_push_is_applied() {
        let link = link();
        let (queue, _outgoing) = mpsc::unbounded_channel();
        let mut session = Session {
            queue,
            hub_timeout: Duration::from_secs(30),
            last_ack: Instant::now(),
        };

        let snapshot = chorus_protocol::AclSnapshot {
            version: 4,
            ..chorus_protocol::AclSnapshot::empty()
        };
        let push = LinkMessage::SnapshotPush {
            snapshot: snapshot.encode().unwrap(),
        };
        link.on_message(&mut session, push).unwrap();
        assert_eq!(link.acl().version(), 4);
    }

    #[test]
    fn test_unknown_node_triggers_registration() {
        let link = link();
        let (queue, mut outgoing) = mpsc::unbounded_channel();
        let mut session = Session {
            queue,
            hub_timeout: Duration::from_secs(30),
            last_ack: Instant::now(),
        };

        link.on_message(&mut session, LinkMessage::error(LinkErrorCode::UnknownNode, "evicted"))
            .unwrap();
        assert!(matches!(outgoing.try_recv(), Ok(LinkMessage::Register { .. })));
        assert!(matches!(outgoing.try_recv(), Ok(LinkMessage::SnapshotPullRequest { .. })));

        assert!(
            link.on_message(&mut session, LinkMessage::error(LinkErrorCode::RegistryFull, "full"))
                .is_err()
        );
    }

    #[test]
    fn test_superseded_link_stops_reconnecting() {
        let link = link();
        let (queue, mut outgoing) = mpsc::unbounded_channel();
        let mut session = Session {
            queue,
            hub_timeout: Duration::from_secs(30),
            last_ack: Instant::now(),
        };

        let notice = LinkMessage::error(LinkErrorCode::Superseded, "edge-a registered again");
        assert!(link.on_message(&mut session, notice).is_err());
        assert!(link.leaving.is_cancelled());
        assert!(outgoing.try_recv().is_err());
    }
}
