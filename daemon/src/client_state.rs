//! Edge-wide view of connected clients and the channel tree

use crate::config::ChannelConfig;
use chorus_protocol::ServerEvent;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const ROOT_CHANNEL: u32 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("server full ({max} clients)")]
    Full { max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<u32>,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ChannelTree {
    channels: BTreeMap<u32, Channel>,
}

impl ChannelTree {
    /// Root channel 0 plus the configured channels; missing parents mean root
    pub fn new(configs: &[ChannelConfig]) -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(
            ROOT_CHANNEL,
            Channel {
                id: ROOT_CHANNEL,
                parent: None,
                name: "Root".to_string(),
            },
        );
        for config in configs.iter().filter(|c| c.id != ROOT_CHANNEL) {
            channels.insert(
                config.id,
                Channel {
                    id: config.id,
                    parent: Some(config.parent.unwrap_or(ROOT_CHANNEL)),
                    name: config.name.clone(),
                },
            );
        }
        Self { channels }
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel ids from the root down to `id`
    pub fn path(&self, id: u32) -> Option<Vec<u32>> {
        let mut path = vec![id];
        let mut current = self.channels.get(&id)?;
        while let Some(parent) = current.parent {
            if path.len() > self.channels.len() {
                // cycle in configuration; treat as unreachable
                return None;
            }
            path.push(parent);
            current = self.channels.get(&parent)?;
        }
        path.reverse();
        Some(path)
    }

    /// `id` and every channel below it
    pub fn subtree(&self, id: u32) -> Vec<u32> {
        if !self.contains(id) {
            return Vec::new();
        }
        let mut found = vec![id];
        let mut queue = VecDeque::from([id]);
        while let Some(parent) = queue.pop_front() {
            for child in self.channels.values().filter(|c| c.parent == Some(parent)) {
                if !found.contains(&child.id) {
                    found.push(child.id);
                    queue.push_back(child.id);
                }
            }
        }
        found
    }

    pub fn list(&self) -> Vec<Channel> {
        self.channels.values().cloned().collect()
    }
}

struct Client {
    user_id: Option<u32>,
    username: Option<String>,
    channel: u32,
    actions: HashSet<String>,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
}

/// Who is connected, who they are and where they sit
pub struct ClientState {
    channels: ChannelTree,
    clients: DashMap<u32, Client>,
    count: AtomicUsize,
    next_id: AtomicU32,
    max_clients: usize,
}

impl ClientState {
    pub fn new(channels: ChannelTree, max_clients: usize) -> Arc<Self> {
        Arc::new(Self {
            channels,
            clients: DashMap::new(),
            count: AtomicUsize::new(0),
            next_id: AtomicU32::new(1),
            max_clients,
        })
    }

    pub fn channels(&self) -> &ChannelTree {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a new connection; returns its session id
    pub fn connect(
        &self,
        events: mpsc::UnboundedSender<ServerEvent>,
        cancel: CancellationToken,
    ) -> Result<u32, StateError> {
        let max = self.max_clients;
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| StateError::Full { max })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(
            id,
            Client {
                user_id: None,
                username: None,
                channel: ROOT_CHANNEL,
                actions: HashSet::new(),
                events,
                cancel,
            },
        );
        Ok(id)
    }

    pub fn remove(&self, id: u32) -> bool {
        if self.clients.remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn set_user(&self, id: u32, user_id: u32, username: &str) {
        if let Some(mut client) = self.clients.get_mut(&id) {
            client.user_id = Some(user_id);
            client.username = Some(username.to_string());
        }
    }

    pub fn set_channel(&self, id: u32, channel: u32) {
        if let Some(mut client) = self.clients.get_mut(&id) {
            client.channel = channel;
        }
    }

    pub fn set_action(&self, id: u32, action: &str, registered: bool) {
        if let Some(mut client) = self.clients.get_mut(&id) {
            if registered {
                client.actions.insert(action.to_string());
            } else {
                client.actions.remove(action);
            }
        }
    }

    /// Authenticated sessions sitting in any of `channels`
    pub fn members(&self, channels: &[u32]) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .clients
            .iter()
            .filter(|c| c.user_id.is_some() && channels.contains(&c.channel))
            .map(|c| *c.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn sessions_of_user(&self, user_id: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .clients
            .iter()
            .filter(|c| c.user_id == Some(user_id))
            .map(|c| *c.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn action_owners(&self, action: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .clients
            .iter()
            .filter(|c| c.actions.contains(action))
            .map(|c| *c.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn username(&self, id: u32) -> Option<String> {
        self.clients.get(&id).and_then(|c| c.username.clone())
    }

    /// Queue `event` for one session; false if it is gone
    pub fn deliver(&self, id: u32, event: ServerEvent) -> bool {
        self.clients
            .get(&id)
            .is_some_and(|c| c.events.send(event).is_ok())
    }

    /// Force a session off the server
    pub fn kick(&self, id: u32) -> bool {
        match self.clients.get(&id) {
            Some(client) => {
                client.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn kick_all(&self) {
        for client in self.clients.iter() {
            client.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> ChannelTree {
        ChannelTree::new(&[
            ChannelConfig {
                id: 5,
                parent: None,
                name: "Lobby".into(),
            },
            ChannelConfig {
                id: 6,
                parent: Some(5),
                name: "Raid".into(),
            },
            ChannelConfig {
                id: 7,
                parent: Some(6),
                name: "Officers".into(),
            },
        ])
    }

    #[test]
    fn test_paths_start_at_root() {
        let tree = tree();
        assert_eq!(tree.path(7), Some(vec![0, 5, 6, 7]));
        assert_eq!(tree.path(0), Some(vec![0]));
        assert_eq!(tree.path(42), None);
    }

    #[test]
    fn test_subtree() {
        let tree = tree();
        assert_eq!(tree.subtree(5), vec![5, 6, 7]);
        assert_eq!(tree.subtree(7), vec![7]);
        assert!(tree.subtree(99).is_empty());
    }

    #[test]
    fn test_capacity_and_delivery() {
        let state = ClientState::new(tree(), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = state.connect(tx, CancellationToken::new()).unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert_eq!(
            state.connect(tx2, CancellationToken::new()),
            Err(StateError::Full { max: 1 })
        );

        assert!(state.deliver(id, ServerEvent::new("ping", json!({}))));
        assert_eq!(rx.try_recv().unwrap().event, "ping");

        assert!(state.remove(id));
        assert!(!state.deliver(id, ServerEvent::new("ping", json!({}))));
        assert!(state.is_empty());
    }

    #[test]
    fn test_members_only_count_authenticated_clients() {
        let state = ClientState::new(tree(), 10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = state.connect(tx.clone(), CancellationToken::new()).unwrap();
        let b = state.connect(tx, CancellationToken::new()).unwrap();

        state.set_channel(a, 5);
        state.set_channel(b, 5);
        state.set_user(a, 100, "alice");

        assert_eq!(state.members(&[5]), vec![a]);
        assert_eq!(state.sessions_of_user(100), vec![a]);
    }

    #[test]
    fn test_kick_cancels_session() {
        let state = ClientState::new(tree(), 10);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let id = state.connect(tx, cancel.clone()).unwrap();

        assert!(state.kick(id));
        assert!(cancel.is_cancelled());
    }
}
