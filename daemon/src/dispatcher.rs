//! Client command dispatch
//!
//! Every command passes the same gates in order: the command must exist,
//! the session must be authenticated (except `authenticate` and `ping`),
//! the parameters must validate and the ACL must grant the permission the
//! command needs. Only then does the handler run. A failure rejects that
//! one command; the connection stays open.

use crate::handlers::{HandlerContext, HandlerError, MessageTarget};
use crate::metrics::METRICS;
use crate::session::{ActionContext, ContextAction, MAX_VOICE_TARGET, Session, VoiceTarget};
use chorus_auth::{AclView, AuthRejection, AuthSynchronizer};
use chorus_protocol::{AuthRequest, AuthStatus, ClientRequest, ClientResponse, ErrorCode, Permissions};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Longest accepted text message, in characters
pub const MAX_MESSAGE_LENGTH: usize = 5000;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication required")]
    NotAuthenticated,

    #[error("session is already authenticated")]
    AlreadyAuthenticated,

    #[error("missing {0} permission")]
    PermissionDenied(&'static str),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error(transparent)]
    Auth(#[from] AuthRejection),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Validation(_) => ErrorCode::ValidationError,
            DispatchError::NotAuthenticated => ErrorCode::NotAuthenticated,
            DispatchError::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            DispatchError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            DispatchError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            DispatchError::Auth(rejection) => match rejection.status {
                AuthStatus::InvalidCredentials => ErrorCode::InvalidCredentials,
                AuthStatus::UserNotFound => ErrorCode::UserNotFound,
                AuthStatus::Banned => ErrorCode::Banned,
                AuthStatus::Success | AuthStatus::ServerError => ErrorCode::ServerError,
            },
            DispatchError::Handler(HandlerError::NotFound(_)) => ErrorCode::NotFound,
            DispatchError::Handler(HandlerError::Rejected(_)) => ErrorCode::HandlerError,
        }
    }
}

fn invalid(message: impl Into<String>) -> DispatchError {
    DispatchError::Validation(message.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Authenticate,
    Ping,
    ListChannels,
    JoinChannel,
    SendMessage,
    RegisterContextAction,
    UnregisterContextAction,
    ExecuteContextAction,
    SetVoiceTarget,
    RemoveVoiceTarget,
    SendPluginData,
    AddWebhook,
    RemoveWebhook,
    ListWebhooks,
    Disconnect,
}

impl CommandKind {
    fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "authenticate" => CommandKind::Authenticate,
            "ping" => CommandKind::Ping,
            "list_channels" => CommandKind::ListChannels,
            "join_channel" => CommandKind::JoinChannel,
            "send_message" => CommandKind::SendMessage,
            "register_context_action" => CommandKind::RegisterContextAction,
            "unregister_context_action" => CommandKind::UnregisterContextAction,
            "execute_context_action" => CommandKind::ExecuteContextAction,
            "set_voice_target" => CommandKind::SetVoiceTarget,
            "remove_voice_target" => CommandKind::RemoveVoiceTarget,
            "send_plugin_data" => CommandKind::SendPluginData,
            "add_webhook" => CommandKind::AddWebhook,
            "remove_webhook" => CommandKind::RemoveWebhook,
            "list_webhooks" => CommandKind::ListWebhooks,
            "disconnect" => CommandKind::Disconnect,
            _ => return None,
        };
        Some(kind)
    }

    fn requires_auth(self) -> bool {
        !matches!(self, CommandKind::Authenticate | CommandKind::Ping)
    }
}

/// A command with validated parameters
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Authenticate { username: String, password: String },
    Ping,
    ListChannels,
    JoinChannel { channel: u32 },
    SendMessage { target: MessageTarget, message: String },
    RegisterContextAction(ContextAction),
    UnregisterContextAction { action: String },
    ExecuteContextAction { action: String, channel: Option<u32>, user: Option<u32> },
    SetVoiceTarget(VoiceTarget),
    RemoveVoiceTarget { id: u32 },
    SendPluginData { receivers: Vec<u32>, data_id: String, data: String },
    AddWebhook { url: String, events: Vec<String> },
    RemoveWebhook { id: u32 },
    ListWebhooks,
    Disconnect,
}

#[derive(Deserialize)]
struct AuthenticateParams {
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct ChannelParams {
    channel_id: u32,
}

#[derive(Deserialize)]
struct TargetParams {
    #[serde(default)]
    channel_id: Option<u32>,
    #[serde(default)]
    user_id: Option<u32>,
    #[serde(default)]
    tree: Option<bool>,
}

#[derive(Deserialize)]
struct MessageParams {
    target: TargetParams,
    message: String,
}

#[derive(Deserialize)]
struct ContextActionParams {
    action: String,
    text: String,
    #[serde(default)]
    contexts: Vec<ActionContext>,
}

#[derive(Deserialize)]
struct ActionNameParams {
    action: String,
}

#[derive(Deserialize)]
struct ExecuteActionParams {
    action: String,
    #[serde(default)]
    channel_id: Option<u32>,
    #[serde(default)]
    user_id: Option<u32>,
}

#[derive(Deserialize)]
struct VoiceTargetParams {
    id: u32,
    #[serde(default)]
    channel_id: Option<u32>,
    #[serde(default)]
    user_ids: Vec<u32>,
    #[serde(default)]
    tree: bool,
}

#[derive(Deserialize)]
struct IdParams {
    id: u32,
}

#[derive(Deserialize)]
struct PluginDataParams {
    receivers: Vec<u32>,
    data_id: String,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct WebhookParams {
    url: String,
    #[serde(default)]
    events: Vec<String>,
}

fn params<T: DeserializeOwned>(value: &Value) -> Result<T, DispatchError> {
    let value = if value.is_null() { json!({}) } else { value.clone() };
    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
}

fn non_empty(field: &str, value: &str) -> Result<(), DispatchError> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn validate_webhook_url(url: &str) -> Result<(), DispatchError> {
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e| invalid(format!("invalid webhook url: {}", e)))?;
    let scheme_ok = matches!(uri.scheme_str(), Some("http") | Some("https"));
    let host_ok = uri.host().is_some_and(|h| !h.is_empty());
    if !scheme_ok || !host_ok {
        return Err(invalid("webhook url must be an absolute http(s) url"));
    }
    Ok(())
}

impl Command {
    fn parse(kind: CommandKind, value: &Value) -> Result<Self, DispatchError> {
        let command = match kind {
            CommandKind::Authenticate => {
                let p: AuthenticateParams = params(value)?;
                non_empty("username", &p.username)?;
                Command::Authenticate {
                    username: p.username,
                    password: p.password,
                }
            }
            CommandKind::Ping => Command::Ping,
            CommandKind::ListChannels => Command::ListChannels,
            CommandKind::JoinChannel => {
                let p: ChannelParams = params(value)?;
                Command::JoinChannel { channel: p.channel_id }
            }
            CommandKind::SendMessage => {
                let p: MessageParams = params(value)?;
                let target = match (p.target.channel_id, p.target.user_id) {
                    (Some(id), None) => MessageTarget::Channel {
                        id,
                        tree: p.target.tree.unwrap_or(false),
                    },
                    (None, Some(user)) => {
                        if p.target.tree.is_some() {
                            return Err(invalid("tree only applies to channel targets"));
                        }
                        MessageTarget::User(user)
                    }
                    _ => return Err(invalid("target needs exactly one of channel_id or user_id")),
                };
                non_empty("message", &p.message)?;
                if p.message.chars().count() > MAX_MESSAGE_LENGTH {
                    return Err(invalid(format!(
                        "message exceeds {} characters",
                        MAX_MESSAGE_LENGTH
                    )));
                }
                Command::SendMessage {
                    target,
                    message: p.message,
                }
            }
            CommandKind::RegisterContextAction => {
                let p: ContextActionParams = params(value)?;
                non_empty("action", &p.action)?;
                non_empty("text", &p.text)?;
                if p.contexts.is_empty() {
                    return Err(invalid("contexts must not be empty"));
                }
                Command::RegisterContextAction(ContextAction {
                    action: p.action,
                    text: p.text,
                    contexts: p.contexts,
                })
            }
            CommandKind::UnregisterContextAction => {
                let p: ActionNameParams = params(value)?;
                non_empty("action", &p.action)?;
                Command::UnregisterContextAction { action: p.action }
            }
            CommandKind::ExecuteContextAction => {
                let p: ExecuteActionParams = params(value)?;
                non_empty("action", &p.action)?;
                Command::ExecuteContextAction {
                    action: p.action,
                    channel: p.channel_id,
                    user: p.user_id,
                }
            }
            CommandKind::SetVoiceTarget => {
                let p: VoiceTargetParams = params(value)?;
                if !(1..=MAX_VOICE_TARGET).contains(&p.id) {
                    return Err(invalid(format!("voice target id must be within 1..={}", MAX_VOICE_TARGET)));
                }
                match (p.channel_id, p.user_ids.is_empty()) {
                    (Some(_), true) => {}
                    (None, false) if !p.tree => {}
                    (None, false) => return Err(invalid("tree only applies to channel targets")),
                    _ => return Err(invalid("voice target needs exactly one of channel_id or user_ids")),
                }
                Command::SetVoiceTarget(VoiceTarget {
                    id: p.id,
                    channel: p.channel_id,
                    users: p.user_ids,
                    tree: p.tree,
                })
            }
            CommandKind::RemoveVoiceTarget => {
                let p: IdParams = params(value)?;
                Command::RemoveVoiceTarget { id: p.id }
            }
            CommandKind::SendPluginData => {
                let p: PluginDataParams = params(value)?;
                if p.receivers.is_empty() {
                    return Err(invalid("receivers must not be empty"));
                }
                non_empty("data_id", &p.data_id)?;
                Command::SendPluginData {
                    receivers: p.receivers,
                    data_id: p.data_id,
                    data: p.data,
                }
            }
            CommandKind::AddWebhook => {
                let p: WebhookParams = params(value)?;
                validate_webhook_url(&p.url)?;
                for event in &p.events {
                    non_empty("event", event)?;
                }
                Command::AddWebhook {
                    url: p.url,
                    events: p.events,
                }
            }
            CommandKind::RemoveWebhook => {
                let p: IdParams = params(value)?;
                Command::RemoveWebhook { id: p.id }
            }
            CommandKind::ListWebhooks => Command::ListWebhooks,
            CommandKind::Disconnect => Command::Disconnect,
        };
        Ok(command)
    }
}

pub struct Dispatcher {
    auth: Arc<AuthSynchronizer>,
    acl: Arc<AclView>,
    context: Arc<dyn HandlerContext>,
}

impl Dispatcher {
    pub fn new(auth: Arc<AuthSynchronizer>, acl: Arc<AclView>, context: Arc<dyn HandlerContext>) -> Self {
        Self { auth, acl, context }
    }

    /// Dispatch one request and turn the outcome into its response
    pub async fn handle(&self, session: &mut Session, request: &ClientRequest) -> ClientResponse {
        let started = Instant::now();
        let outcome = self.dispatch(session, request).await;
        METRICS
            .dispatch_duration
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => ClientResponse::ok(request.id, result),
            Err(e) => {
                let code = e.code();
                METRICS.dispatch_errors.with_label_values(&[code.as_str()]).inc();
                debug!("Session {} {} failed: {}", session.id, request.command, e);
                ClientResponse::error(request.id, code, e.to_string())
            }
        }
    }

    pub async fn dispatch(&self, session: &mut Session, request: &ClientRequest) -> Result<Value, DispatchError> {
        let kind = CommandKind::from_name(&request.command)
            .ok_or_else(|| DispatchError::UnknownCommand(request.command.clone()))?;
        if kind.requires_auth() && !session.is_authenticated() {
            return Err(DispatchError::NotAuthenticated);
        }

        let command = Command::parse(kind, &request.params)?;
        self.authorize(session, &command)?;
        self.execute(session, command).await
    }

    fn authorize(&self, session: &Session, command: &Command) -> Result<(), DispatchError> {
        let (channel, permission, name) = match command {
            Command::JoinChannel { channel } => (*channel, Permissions::ENTER, "enter"),
            Command::SendMessage {
                target: MessageTarget::Channel { id, .. },
                ..
            } => (*id, Permissions::TEXT_MESSAGE, "text_message"),
            Command::SendMessage {
                target: MessageTarget::User(_),
                ..
            } => (session.channel, Permissions::TEXT_MESSAGE, "text_message"),
            Command::SetVoiceTarget(target) => (
                target.channel.unwrap_or(session.channel),
                Permissions::WHISPER,
                "whisper",
            ),
            _ => return Ok(()),
        };

        let Some(user) = session.user.as_ref() else {
            return Err(DispatchError::NotAuthenticated);
        };
        let path = self
            .context
            .channel_path(channel)
            .ok_or_else(|| HandlerError::NotFound(format!("channel {}", channel)))?;
        let granted = self.acl.current().permissions_along(user, &path);
        if !granted.contains(permission) {
            return Err(DispatchError::PermissionDenied(name));
        }
        Ok(())
    }

    async fn execute(&self, session: &mut Session, command: Command) -> Result<Value, DispatchError> {
        let context = self.context.as_ref();
        let result = match command {
            Command::Authenticate { username, password } => return self.authenticate(session, username, password).await,
            Command::Ping => Ok(json!({"pong": true})),
            Command::ListChannels => context.list_channels(session),
            Command::JoinChannel { channel } => context.join_channel(session, channel),
            Command::SendMessage { target, message } => context.send_message(session, &target, &message),
            Command::RegisterContextAction(action) => context.register_context_action(session, action),
            Command::UnregisterContextAction { action } => context.unregister_context_action(session, &action),
            Command::ExecuteContextAction { action, channel, user } => {
                context.execute_context_action(session, &action, channel, user)
            }
            Command::SetVoiceTarget(target) => context.set_voice_target(session, target),
            Command::RemoveVoiceTarget { id } => context.remove_voice_target(session, id),
            Command::SendPluginData {
                receivers,
                data_id,
                data,
            } => context.send_plugin_data(session, &receivers, &data_id, &data),
            Command::AddWebhook { url, events } => context.add_webhook(session, url, events),
            Command::RemoveWebhook { id } => context.remove_webhook(session, id),
            Command::ListWebhooks => context.list_webhooks(session),
            Command::Disconnect => context.disconnect(session),
        };
        Ok(result?)
    }

    async fn authenticate(
        &self,
        session: &mut Session,
        username: String,
        password: String,
    ) -> Result<Value, DispatchError> {
        if session.is_authenticated() {
            return Err(DispatchError::AlreadyAuthenticated);
        }

        let request = AuthRequest {
            username,
            password,
            cert_hash: session.cert_hash.clone(),
            ip_address: session.peer.ip().to_string(),
            server_id: self.auth.config().server_id.clone(),
        };
        let authenticated = match self.auth.authenticate(&request).await {
            Ok(authenticated) => authenticated,
            Err(rejection) => {
                METRICS.auth_outcomes.with_label_values(&["rejected"]).inc();
                info!(
                    "Session {} from {} rejected as {}: {}",
                    session.id, session.peer, request.username, rejection
                );
                return Err(rejection.into());
            }
        };

        METRICS
            .auth_outcomes
            .with_label_values(&[authenticated.source.as_str()])
            .inc();
        let reply = json!({
            "session": session.id,
            "user_id": authenticated.result.user_id,
            "username": authenticated.result.username,
            "display_name": authenticated.result.display_name,
            "groups": authenticated.result.groups,
            "degraded": authenticated.degraded,
            "source": authenticated.source.as_str(),
        });
        info!(
            "Session {} authenticated as {} via {}{}",
            session.id,
            authenticated.result.username,
            authenticated.source.as_str(),
            if authenticated.degraded { " (degraded)" } else { "" }
        );

        session.attach(authenticated);
        self.context.attach_user(session);
        Ok(reply)
    }
}
