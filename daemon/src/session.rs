//! State of one connected client

use chorus_auth::{AuthSource, Authenticated, SessionLease};
use chorus_protocol::AuthResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Voice target slots a client may configure (1..=30)
pub const MAX_VOICE_TARGET: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceTarget {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<u32>,
    /// Include subchannels of `channel`
    pub tree: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionContext {
    Server,
    Channel,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextAction {
    pub action: String,
    pub text: String,
    pub contexts: Vec<ActionContext>,
}

/// Registered notification endpoint. Delivery happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Webhook {
    pub id: u32,
    pub url: String,
    pub events: Vec<String>,
}

#[derive(Debug)]
pub struct Session {
    pub id: u32,
    pub peer: SocketAddr,
    /// Fingerprint of the client certificate, when one was presented
    pub cert_hash: Option<String>,
    pub user: Option<AuthResult>,
    pub degraded: bool,
    pub auth_source: Option<AuthSource>,
    pub channel: u32,
    pub voice_targets: BTreeMap<u32, VoiceTarget>,
    pub context_actions: BTreeMap<String, ContextAction>,
    pub webhooks: Vec<Webhook>,
    next_webhook: u32,
    /// Keeps the tracked auth result shared while this session lives
    pub lease: Option<SessionLease>,
    /// Set once the client asked to leave; the connection ends after the reply
    pub closing: bool,
}

impl Session {
    pub fn new(id: u32, peer: SocketAddr, cert_hash: Option<String>) -> Self {
        Self {
            id,
            peer,
            cert_hash,
            user: None,
            degraded: false,
            auth_source: None,
            channel: 0,
            voice_targets: BTreeMap::new(),
            context_actions: BTreeMap::new(),
            webhooks: Vec::new(),
            next_webhook: 1,
            lease: None,
            closing: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn user_id(&self) -> Option<u32> {
        self.user.as_ref().map(|u| u.user_id)
    }

    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username.as_str())
    }

    pub fn attach(&mut self, authenticated: Authenticated) {
        self.user = Some(authenticated.result);
        self.degraded = authenticated.degraded;
        self.auth_source = Some(authenticated.source);
        self.lease = authenticated.lease;
    }

    pub fn add_webhook(&mut self, url: String, events: Vec<String>) -> u32 {
        let id = self.next_webhook;
        self.next_webhook += 1;
        self.webhooks.push(Webhook { id, url, events });
        id
    }

    pub fn remove_webhook(&mut self, id: u32) -> bool {
        let before = self.webhooks.len();
        self.webhooks.retain(|w| w.id != id);
        self.webhooks.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_ids_are_not_reused() {
        let mut session = Session::new(1, "127.0.0.1:5000".parse().unwrap(), None);
        let first = session.add_webhook("https://a.example/hook".into(), vec![]);
        assert!(session.remove_webhook(first));
        let second = session.add_webhook("https://b.example/hook".into(), vec![]);

        assert_ne!(first, second);
        assert!(!session.remove_webhook(first));
        assert_eq!(session.webhooks.len(), 1);
    }

    #[test]
    fn test_attach_records_identity() {
        let mut session = Session::new(1, "127.0.0.1:5000".parse().unwrap(), None);
        assert!(!session.is_authenticated());

        session.attach(Authenticated {
            result: AuthResult::success(9, "bob"),
            source: AuthSource::Fallback,
            degraded: true,
            lease: None,
        });
        assert_eq!(session.user_id(), Some(9));
        assert_eq!(session.username(), Some("bob"));
        assert!(session.degraded);
    }
}
