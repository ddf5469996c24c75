//! Business handlers behind the dispatcher
//!
//! Handlers run only after the dispatcher has authenticated the session,
//! validated the parameters and checked permissions.

use crate::client_state::ClientState;
use crate::session::{ContextAction, Session, VoiceTarget};
use chorus_protocol::ServerEvent;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Rejected(String),
}

/// Where a text message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    Channel { id: u32, tree: bool },
    User(u32),
}

pub trait HandlerContext: Send + Sync {
    /// Channel ids from the root down to `channel`
    fn channel_path(&self, channel: u32) -> Option<Vec<u32>>;

    /// Make a freshly authenticated session visible to others
    fn attach_user(&self, session: &Session);

    fn list_channels(&self, session: &Session) -> Result<Value, HandlerError>;

    fn join_channel(&self, session: &mut Session, channel: u32) -> Result<Value, HandlerError>;

    fn send_message(&self, session: &Session, target: &MessageTarget, message: &str) -> Result<Value, HandlerError>;

    fn register_context_action(&self, session: &mut Session, action: ContextAction) -> Result<Value, HandlerError>;

    fn unregister_context_action(&self, session: &mut Session, action: &str) -> Result<Value, HandlerError>;

    fn execute_context_action(
        &self,
        session: &Session,
        action: &str,
        channel: Option<u32>,
        user: Option<u32>,
    ) -> Result<Value, HandlerError>;

    fn set_voice_target(&self, session: &mut Session, target: VoiceTarget) -> Result<Value, HandlerError>;

    fn remove_voice_target(&self, session: &mut Session, id: u32) -> Result<Value, HandlerError>;

    fn send_plugin_data(
        &self,
        session: &Session,
        receivers: &[u32],
        data_id: &str,
        data: &str,
    ) -> Result<Value, HandlerError>;

    fn add_webhook(&self, session: &mut Session, url: String, events: Vec<String>) -> Result<Value, HandlerError>;

    fn remove_webhook(&self, session: &mut Session, id: u32) -> Result<Value, HandlerError>;

    fn list_webhooks(&self, session: &Session) -> Result<Value, HandlerError>;

    fn disconnect(&self, session: &mut Session) -> Result<Value, HandlerError>;
}

impl ClientState {
    fn sender(&self, session: &Session) -> Value {
        json!({
            "session": session.id,
            "user_id": session.user_id(),
            "name": session.username(),
        })
    }

    /// Deliver to every session of each listed user; returns how many got it
    fn deliver_to_users(&self, users: &[u32], event: &ServerEvent) -> usize {
        users
            .iter()
            .flat_map(|user| self.sessions_of_user(*user))
            .filter(|id| self.deliver(*id, event.clone()))
            .count()
    }
}

impl HandlerContext for ClientState {
    fn channel_path(&self, channel: u32) -> Option<Vec<u32>> {
        self.channels().path(channel)
    }

    fn attach_user(&self, session: &Session) {
        if let Some(user) = &session.user {
            self.set_user(session.id, user.user_id, &user.username);
        }
    }

    fn list_channels(&self, session: &Session) -> Result<Value, HandlerError> {
        Ok(json!({
            "current": session.channel,
            "channels": self.channels().list(),
        }))
    }

    fn join_channel(&self, session: &mut Session, channel: u32) -> Result<Value, HandlerError> {
        if !self.channels().contains(channel) {
            return Err(HandlerError::NotFound(format!("channel {}", channel)));
        }

        let previous = session.channel;
        session.channel = channel;
        self.set_channel(session.id, channel);

        if previous != channel {
            let event = ServerEvent::new(
                "user_joined",
                json!({"channel_id": channel, "user": self.sender(session)}),
            );
            for member in self.members(&[channel]) {
                if member != session.id {
                    self.deliver(member, event.clone());
                }
            }
        }
        debug!("Session {} moved {} -> {}", session.id, previous, channel);

        Ok(json!({"channel_id": channel, "previous": previous}))
    }

    fn send_message(&self, session: &Session, target: &MessageTarget, message: &str) -> Result<Value, HandlerError> {
        match target {
            MessageTarget::Channel { id, tree } => {
                if !self.channels().contains(*id) {
                    return Err(HandlerError::NotFound(format!("channel {}", id)));
                }
                let channels = if *tree {
                    self.channels().subtree(*id)
                } else {
                    vec![*id]
                };
                let event = ServerEvent::new(
                    "text_message",
                    json!({
                        "from": self.sender(session),
                        "channel_id": id,
                        "tree": tree,
                        "message": message,
                    }),
                );
                let delivered = self
                    .members(&channels)
                    .into_iter()
                    .filter(|member| *member != session.id)
                    .filter(|member| self.deliver(*member, event.clone()))
                    .count();
                Ok(json!({"delivered": delivered}))
            }
            MessageTarget::User(user) => {
                let event = ServerEvent::new(
                    "text_message",
                    json!({"from": self.sender(session), "user_id": user, "message": message}),
                );
                let delivered = self.deliver_to_users(&[*user], &event);
                if delivered == 0 {
                    return Err(HandlerError::NotFound(format!("user {}", user)));
                }
                Ok(json!({"delivered": delivered}))
            }
        }
    }

    fn register_context_action(&self, session: &mut Session, action: ContextAction) -> Result<Value, HandlerError> {
        self.set_action(session.id, &action.action, true);
        let name = action.action.clone();
        session.context_actions.insert(name.clone(), action);
        Ok(json!({"action": name}))
    }

    fn unregister_context_action(&self, session: &mut Session, action: &str) -> Result<Value, HandlerError> {
        if session.context_actions.remove(action).is_none() {
            return Err(HandlerError::NotFound(format!("context action {:?}", action)));
        }
        self.set_action(session.id, action, false);
        Ok(json!({"action": action}))
    }

    fn execute_context_action(
        &self,
        session: &Session,
        action: &str,
        channel: Option<u32>,
        user: Option<u32>,
    ) -> Result<Value, HandlerError> {
        if let Some(channel) = channel.filter(|c| !self.channels().contains(*c)) {
            return Err(HandlerError::NotFound(format!("channel {}", channel)));
        }
        let owners = self.action_owners(action);
        if owners.is_empty() {
            return Err(HandlerError::NotFound(format!("context action {:?}", action)));
        }

        let event = ServerEvent::new(
            "context_action",
            json!({
                "action": action,
                "from": self.sender(session),
                "channel_id": channel,
                "user_id": user,
            }),
        );
        let delivered = owners
            .into_iter()
            .filter(|owner| self.deliver(*owner, event.clone()))
            .count();
        Ok(json!({"delivered": delivered}))
    }

    fn set_voice_target(&self, session: &mut Session, target: VoiceTarget) -> Result<Value, HandlerError> {
        if let Some(channel) = target.channel.filter(|c| !self.channels().contains(*c)) {
            return Err(HandlerError::NotFound(format!("channel {}", channel)));
        }
        let id = target.id;
        session.voice_targets.insert(id, target);
        Ok(json!({"id": id}))
    }

    fn remove_voice_target(&self, session: &mut Session, id: u32) -> Result<Value, HandlerError> {
        session
            .voice_targets
            .remove(&id)
            .ok_or_else(|| HandlerError::NotFound(format!("voice target {}", id)))?;
        Ok(json!({"id": id}))
    }

    fn send_plugin_data(
        &self,
        session: &Session,
        receivers: &[u32],
        data_id: &str,
        data: &str,
    ) -> Result<Value, HandlerError> {
        let event = ServerEvent::new(
            "plugin_data",
            json!({"from": self.sender(session), "data_id": data_id, "data": data}),
        );
        let delivered = self.deliver_to_users(receivers, &event);
        if delivered == 0 {
            return Err(HandlerError::NotFound("receivers".to_string()));
        }
        Ok(json!({"delivered": delivered}))
    }

    fn add_webhook(&self, session: &mut Session, url: String, events: Vec<String>) -> Result<Value, HandlerError> {
        if session.webhooks.iter().any(|w| w.url == url) {
            return Err(HandlerError::Rejected(format!("webhook {} already registered", url)));
        }
        let id = session.add_webhook(url, events);
        Ok(json!({"id": id}))
    }

    fn remove_webhook(&self, session: &mut Session, id: u32) -> Result<Value, HandlerError> {
        if !session.remove_webhook(id) {
            return Err(HandlerError::NotFound(format!("webhook {}", id)));
        }
        Ok(json!({"id": id}))
    }

    fn list_webhooks(&self, session: &Session) -> Result<Value, HandlerError> {
        Ok(json!({"webhooks": session.webhooks}))
    }

    fn disconnect(&self, session: &mut Session) -> Result<Value, HandlerError> {
        session.closing = true;
        Ok(json!({"bye": true}))
    }
}
