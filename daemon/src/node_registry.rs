//! Edge node registry (hub side)
//!
//! Tracks which edges are connected, when they last sent a heartbeat and the
//! channel used to push link messages to them. The number of registered
//! nodes never exceeds `max_edges`; a registration past the limit fails
//! immediately instead of waiting for a slot.

use crate::metrics::METRICS;
use chorus_protocol::{LinkErrorCode, LinkMessage};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outbound queue of one edge's link task
pub type EdgeHandle = mpsc::UnboundedSender<LinkMessage>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry full ({max} edges)")]
    RegistryFull { max: usize },

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} registered again on another link")]
    Superseded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered { node_id: String },
    Evicted { node_id: String },
    Deregistered { node_id: String },
}

/// Read-only view of one registered edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: String,
    pub address: String,
    pub age: Duration,
    pub since_heartbeat: Duration,
}

struct EdgeNode {
    address: String,
    registered_at: Instant,
    last_heartbeat: Instant,
    handle: EdgeHandle,
    /// Identifies the link that currently owns this entry
    session: u64,
}

pub struct NodeRegistry {
    nodes: DashMap<String, EdgeNode>,
    count: AtomicUsize,
    next_session: AtomicU64,
    max_edges: usize,
    timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl NodeRegistry {
    pub fn new(max_edges: usize, timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            nodes: DashMap::new(),
            count: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
            max_edges,
            timeout,
            events,
        })
    }

    pub fn max_edges(&self) -> usize {
        self.max_edges
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Register `node_id`, or refresh it in place if it is already live.
    /// Returns a session token that `heartbeat` and `release` must present.
    /// A different link holding the entry is told it was superseded.
    pub fn register(&self, node_id: &str, address: &str, handle: EdgeHandle) -> Result<u64, RegistryError> {
        let now = Instant::now();
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);

        match self.nodes.entry(node_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let node = entry.get_mut();
                if !node.handle.same_channel(&handle) {
                    warn!("Edge {} registered again from {}; dropping its previous link", node_id, address);
                    let _ = node.handle.send(LinkMessage::error(
                        LinkErrorCode::Superseded,
                        format!("{} registered again on another link", node_id),
                    ));
                }
                node.address = address.to_string();
                node.last_heartbeat = now;
                node.handle = handle;
                node.session = session;
                debug!("Edge {} re-registered from {}", node_id, address);
            }
            Entry::Vacant(entry) => {
                let max = self.max_edges;
                self.count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
                    .map_err(|_| RegistryError::RegistryFull { max })?;
                entry.insert(EdgeNode {
                    address: address.to_string(),
                    registered_at: now,
                    last_heartbeat: now,
                    handle,
                    session,
                });
                info!("Edge {} registered from {} ({}/{})", node_id, address, self.len(), max);
            }
        }

        METRICS.registered_edges.set(self.len() as i64);
        let _ = self.events.send(RegistryEvent::Registered {
            node_id: node_id.to_string(),
        });
        Ok(session)
    }

    pub fn heartbeat(&self, node_id: &str, session: u64) -> Result<(), RegistryError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        if node.session != session {
            return Err(RegistryError::Superseded(node_id.to_string()));
        }
        node.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Whether the link holding `session` still owns `node_id`
    pub fn owns(&self, node_id: &str, session: u64) -> bool {
        self.nodes.get(node_id).is_some_and(|node| node.session == session)
    }

    pub fn deregister(&self, node_id: &str) -> Result<(), RegistryError> {
        self.nodes
            .remove(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        METRICS.registered_edges.set(self.len() as i64);
        info!("Edge {} deregistered", node_id);
        let _ = self.events.send(RegistryEvent::Deregistered {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    /// Drop the entry if it still belongs to the link holding `session`.
    /// Called when a link ends without an explicit deregistration.
    pub fn release(&self, node_id: &str, session: u64) -> bool {
        if self.nodes.remove_if(node_id, |_, node| node.session == session).is_none() {
            return false;
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        METRICS.registered_edges.set(self.len() as i64);
        info!("Edge {} released after link loss", node_id);
        let _ = self.events.send(RegistryEvent::Deregistered {
            node_id: node_id.to_string(),
        });
        true
    }

    /// Evict every node whose last heartbeat is older than the timeout
    pub fn sweep(&self) -> Vec<String> {
        let timeout = self.timeout;
        let candidates: Vec<String> = self
            .nodes
            .iter()
            .filter(|entry| entry.last_heartbeat.elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for node_id in candidates {
            // Re-checked under the shard lock; a heartbeat may have landed meanwhile
            let removed = self
                .nodes
                .remove_if(&node_id, |_, node| node.last_heartbeat.elapsed() > timeout);
            if removed.is_some() {
                self.count.fetch_sub(1, Ordering::AcqRel);
                METRICS.edge_evictions.inc();
                warn!("Edge {} evicted: no heartbeat for {:?}", node_id, timeout);
                let _ = self.events.send(RegistryEvent::Evicted {
                    node_id: node_id.clone(),
                });
                evicted.push(node_id);
            }
        }

        if !evicted.is_empty() {
            METRICS.registered_edges.set(self.len() as i64);
        }
        evicted
    }

    /// Run `sweep` every `max(timeout / 2, 1s)`
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = (self.timeout / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Queue `message` for every registered edge; returns how many took it
    pub fn broadcast(&self, message: &LinkMessage) -> usize {
        self.nodes
            .iter()
            .filter(|entry| entry.handle.send(message.clone()).is_ok())
            .count()
    }

    pub fn send_to(&self, node_id: &str, message: LinkMessage) -> Result<(), RegistryError> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
        node.handle
            .send(message)
            .map_err(|_| RegistryError::UnknownNode(node_id.to_string()))
    }

    pub fn snapshot(&self) -> Vec<NodeSummary> {
        let mut nodes: Vec<NodeSummary> = self
            .nodes
            .iter()
            .map(|entry| NodeSummary {
                id: entry.key().clone(),
                address: entry.address.clone(),
                age: entry.registered_at.elapsed(),
                since_heartbeat: entry.last_heartbeat.elapsed(),
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}
