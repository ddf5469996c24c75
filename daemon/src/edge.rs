//! Edge role
//!
//! Terminates client connections, authenticates them through the
//! [`AuthSynchronizer`] and runs their commands through the [`Dispatcher`]
//! against the ACL snapshot replicated from the hub.

use crate::client_state::{ChannelTree, ClientState};
use crate::config::{DaemonConfig, EdgeConfig};
use crate::dispatcher::Dispatcher;
use crate::edge_link::{HubAuthBackend, HubLink, LinkSettings};
use crate::metrics::METRICS;
use crate::session::Session;
use crate::wire;
use anyhow::{Result, bail};
use bytes::Bytes;
use chorus_auth::{AclView, AuthSynchronizer, BackendKind, HttpAuthBackend, SharedAuthBackend};
use chorus_protocol::{ClientRequest, ClientResponse, ErrorCode, ServerEvent};
use chorus_transport::{Connection, Listener, TransportError};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Edge {
    config: EdgeConfig,
    state: Arc<ClientState>,
    acl: Arc<AclView>,
    dispatcher: Dispatcher,
    link: Option<Arc<HubLink>>,
}

impl Edge {
    pub fn new(
        config: EdgeConfig,
        acl: Arc<AclView>,
        auth: AuthSynchronizer,
        link: Option<Arc<HubLink>>,
    ) -> Arc<Self> {
        let state = ClientState::new(ChannelTree::new(&config.channels), config.max_clients);
        let dispatcher = Dispatcher::new(Arc::new(auth), Arc::clone(&acl), state.clone());

        Arc::new(Self {
            config,
            state,
            acl,
            dispatcher,
            link,
        })
    }

    pub async fn from_config(config: &DaemonConfig) -> Result<Arc<Self>> {
        let acl = Arc::new(AclView::new());
        let link = HubLink::new(LinkSettings::from_config(config), Arc::clone(&acl));

        let backend: SharedAuthBackend = match config.auth.backend_kind()? {
            BackendKind::Hub => Arc::new(HubAuthBackend::new(Arc::clone(&link))),
            BackendKind::Http(url) => Arc::new(HttpAuthBackend::new(
                url,
                config.auth.credential.clone(),
                config.auth.timeout(),
                config.auth.tls_insecure,
            )?),
            BackendKind::Directory => bail!("the directory backend only exists on the hub"),
        };

        let auth = AuthSynchronizer::from_config(config.auth.clone(), backend).await?;
        info!("Edge user cache holds {} entries", auth.cache().len());
        Ok(Self::new(config.edge.clone(), acl, auth, Some(link)))
    }

    pub fn state(&self) -> &Arc<ClientState> {
        &self.state
    }

    pub fn acl(&self) -> &Arc<AclView> {
        &self.acl
    }

    pub fn link(&self) -> Option<&Arc<HubLink>> {
        self.link.as_ref()
    }

    /// Serve clients until the listener stops. Also keeps the hub link up.
    pub async fn serve(self: Arc<Self>, listener: Listener) -> Result<()> {
        info!(
            "Edge accepting clients on {} (advertised as {})",
            listener.local_addr(),
            self.config.advertise
        );
        let link_task = self.link.as_ref().map(|link| link.start());

        let mut incoming = std::pin::pin!(listener.incoming());
        while let Some(accepted) = incoming.next().await {
            match accepted {
                Ok(conn) => {
                    tokio::spawn(Arc::clone(&self).handle_client(conn));
                }
                Err(e) => warn!("Client handshake failed: {}", e),
            }
        }

        if let Some(task) = link_task {
            task.abort();
        }
        Ok(())
    }

    /// Leave the hub and drop every client
    pub async fn shutdown(&self) {
        if let Some(link) = &self.link {
            link.deregister(Duration::from_secs(2)).await;
        }
        self.state.kick_all();
    }

    async fn handle_client(self: Arc<Self>, conn: Connection) {
        let conn = Arc::new(conn);
        let peer = conn.peer_addr();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let id = match self.state.connect(events_tx, cancel.clone()) {
            Ok(id) => id,
            Err(e) => {
                warn!("Refusing client {}: {}", peer, e);
                let notice = ServerEvent::new("rejected", serde_json::json!({"reason": e.to_string()}));
                if send_json(&conn, &notice).await.is_ok() {
                    wire::linger(&conn).await;
                }
                conn.close().await;
                return;
            }
        };
        METRICS.active_sessions.inc();
        debug!("Client {} connected as session {}", peer, id);

        let mut session = Session::new(id, peer, conn.peer_fingerprint().map(str::to_string));
        let (mut frames, reader) = wire::spawn_reader(Arc::clone(&conn));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Session {} terminated", id);
                    break;
                }
                Some(event) = events.recv() => {
                    if send_json(&conn, &event).await.is_err() {
                        break;
                    }
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let response = match serde_json::from_slice::<ClientRequest>(&frame) {
                        // an abandoned auth attempt stops retrying once the client is gone
                        Ok(request) => tokio::select! {
                            response = self.dispatcher.handle(&mut session, &request) => response,
                            _ = conn.closed() => break,
                        },
                        Err(e) => ClientResponse::error(0, ErrorCode::MalformedFrame, e.to_string()),
                    };
                    if send_json(&conn, &response).await.is_err() || session.closing {
                        break;
                    }
                }
            }
        }

        self.state.remove(id);
        METRICS.active_sessions.dec();
        info!(
            "Session {} ({}) closed{}",
            id,
            peer,
            session
                .username()
                .map(|name| format!(" for {}", name))
                .unwrap_or_default()
        );
        if session.closing {
            wire::linger(&conn).await;
        }
        drop(session);
        conn.close().await;
        reader.abort();
    }
}

async fn send_json(conn: &Connection, value: &impl Serialize) -> Result<(), TransportError> {
    let body = serde_json::to_vec(value).map_err(|e| TransportError::Io(e.into()))?;
    wire::send_frame(conn, Bytes::from(body)).await
}
