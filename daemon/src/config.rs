//! Daemon configuration

use anyhow::{Context, Result, bail};
use chorus_auth::{AuthConfig, DirectoryUser};
use chorus_protocol::{AclEntry, AclSubject, Permissions};
use chorus_transport::TransportConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    /// Node identity and role
    #[serde(default)]
    pub node: NodeConfig,

    /// Hub link: the hub listens on it, edges dial it
    #[serde(default)]
    pub transport: TransportConfig,

    /// Hub role settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Edge role settings
    #[serde(default)]
    pub edge: EdgeConfig,

    /// Authentication pipeline
    #[serde(default)]
    pub auth: AuthConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load and merge configuration from file (incremental update)
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let other: DaemonConfig = toml::from_str(&content)?;
        self.merge(other);
        Ok(())
    }

    /// Merge another config into this one (incremental)
    ///
    /// Rules:
    /// - Scalar values: overwrite if the new value differs from default
    /// - Option values: overwrite if Some
    /// - Users and channels: merge by key; ACL rules are appended
    pub fn merge(&mut self, other: DaemonConfig) {
        // Node
        if other.node.role != NodeRole::default() {
            self.node.role = other.node.role;
        }
        if other.node.id != default_node_id() {
            self.node.id = other.node.id;
        }

        // Hub
        if other.hub.bind.is_some() {
            self.hub.bind = other.hub.bind;
        }
        if other.hub.max_edges != default_max_edges() {
            self.hub.max_edges = other.hub.max_edges;
        }
        if other.hub.heartbeat_timeout_secs != default_heartbeat_timeout() {
            self.hub.heartbeat_timeout_secs = other.hub.heartbeat_timeout_secs;
        }
        if other.hub.snapshot_push_interval_secs != default_snapshot_push_interval() {
            self.hub.snapshot_push_interval_secs = other.hub.snapshot_push_interval_secs;
        }
        for user in other.hub.users {
            if let Some(existing) = self.hub.users.iter_mut().find(|u| u.username == user.username) {
                *existing = user;
            } else {
                self.hub.users.push(user);
            }
        }
        self.hub.acl.extend(other.hub.acl);

        // Edge
        if other.edge.advertise != default_advertise() {
            self.edge.advertise = other.edge.advertise;
        }
        if other.edge.heartbeat_interval_secs != default_heartbeat_interval() {
            self.edge.heartbeat_interval_secs = other.edge.heartbeat_interval_secs;
        }
        if other.edge.max_clients != default_max_clients() {
            self.edge.max_clients = other.edge.max_clients;
        }
        for channel in other.edge.channels {
            if let Some(existing) = self.edge.channels.iter_mut().find(|c| c.id == channel.id) {
                *existing = channel;
            } else {
                self.edge.channels.push(channel);
            }
        }

        // Auth
        if other.auth.backend != AuthConfig::default().backend {
            self.auth.backend = other.auth.backend;
        }
        if other.auth.credential.is_some() {
            self.auth.credential = other.auth.credential;
        }
        if other.auth.user_cache_path.is_some() {
            self.auth.user_cache_path = other.auth.user_cache_path;
        }

        // Monitoring
        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            bail!("node.id must not be empty");
        }
        self.transport.validate().context("[transport]")?;
        self.auth.validate()?;

        match self.node.role {
            NodeRole::Hub => {
                if self.hub.max_edges == 0 {
                    bail!("hub.max_edges must be positive");
                }
                if self.hub.heartbeat_timeout_secs == 0 {
                    bail!("hub.heartbeat_timeout_secs must be positive");
                }
                if self.hub.snapshot_push_interval_secs == 0 {
                    bail!("hub.snapshot_push_interval_secs must be positive");
                }
                if self.auth.backend == "hub" {
                    bail!("the hub cannot use itself as auth backend");
                }
                self.hub.listen_config(&self.transport)?;
                self.hub.default_permissions()?;
                for rule in &self.hub.acl {
                    rule.to_entry()?;
                }
            }
            NodeRole::Edge => {
                if self.auth.backend == "directory" {
                    bail!("the directory backend only exists on the hub");
                }
                if self.edge.heartbeat_interval_secs == 0 {
                    bail!("edge.heartbeat_interval_secs must be positive");
                }
                self.edge.listen.validate().context("[edge.listen]")?;
                self.edge.validate_channels()?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Hub,
    Edge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub role: NodeRole,

    #[serde(default = "default_node_id")]
    pub id: String,
}

fn default_node_id() -> String {
    "chorus-1".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::default(),
            id: default_node_id(),
        }
    }
}

/// Hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// `host:port` overriding the `[transport]` endpoint for listening
    #[serde(default)]
    pub bind: Option<String>,

    #[serde(default = "default_max_edges")]
    pub max_edges: usize,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Periodic re-push of the current ACL snapshot
    #[serde(default = "default_snapshot_push_interval")]
    pub snapshot_push_interval_secs: u64,

    /// Permission names granted where no ACL entry applies
    #[serde(default)]
    pub default_permissions: Vec<String>,

    /// User directory for the `directory` auth backend
    #[serde(default)]
    pub users: Vec<DirectoryUser>,

    /// Initial ACL entries
    #[serde(default)]
    pub acl: Vec<AclRule>,
}

fn default_max_edges() -> usize {
    16
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_snapshot_push_interval() -> u64 {
    60
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: None,
            max_edges: default_max_edges(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            snapshot_push_interval_secs: default_snapshot_push_interval(),
            default_permissions: Vec::new(),
            users: Vec::new(),
            acl: Vec::new(),
        }
    }
}

impl HubConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn snapshot_push_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_push_interval_secs)
    }

    /// The hub link settings with `bind` applied
    pub fn listen_config(&self, transport: &TransportConfig) -> Result<TransportConfig> {
        let mut config = transport.clone();
        if let Some(bind) = &self.bind {
            let (host, port) = bind
                .rsplit_once(':')
                .with_context(|| format!("hub.bind {:?} is not host:port", bind))?;
            config.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            config.port = port
                .parse()
                .with_context(|| format!("hub.bind {:?} has an invalid port", bind))?;
        }
        Ok(config)
    }

    pub fn default_permissions(&self) -> Result<Permissions> {
        if self.default_permissions.is_empty() {
            return Ok(Permissions::DEFAULT);
        }
        parse_permissions(&self.default_permissions)
    }
}

fn parse_permissions(names: &[String]) -> Result<Permissions> {
    let mut permissions = Permissions::NONE;
    for name in names {
        permissions |= Permissions::parse(name).with_context(|| format!("unknown permission {:?}", name))?;
    }
    Ok(permissions)
}

/// One ACL rule as written in configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AclRule {
    /// Omitted for server-wide rules
    #[serde(default)]
    pub channel: Option<u32>,

    /// `everyone`, `group:<name>` or `user:<id>`
    pub subject: String,

    #[serde(default)]
    pub allow: Vec<String>,

    #[serde(default)]
    pub deny: Vec<String>,
}

impl AclRule {
    pub fn to_entry(&self) -> Result<AclEntry> {
        let subject = match self.subject.split_once(':') {
            None if self.subject == "everyone" => AclSubject::Everyone,
            Some(("group", name)) if !name.is_empty() => AclSubject::Group(name.to_string()),
            Some(("user", id)) => AclSubject::User(
                id.parse()
                    .with_context(|| format!("invalid user id in ACL subject {:?}", self.subject))?,
            ),
            _ => bail!("invalid ACL subject {:?}", self.subject),
        };

        Ok(AclEntry {
            channel: self.channel,
            subject,
            allow: parse_permissions(&self.allow)?.0,
            deny: parse_permissions(&self.deny)?.0,
        })
    }
}

/// Edge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    /// Client-facing address reported to the hub
    #[serde(default = "default_advertise")]
    pub advertise: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// First reconnect delay after the hub link drops; doubles up to the max
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_max_reconnect_backoff")]
    pub max_reconnect_backoff_ms: u64,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Client listener
    #[serde(default = "default_client_listen")]
    pub listen: TransportConfig,

    /// Channel tree below the implicit root channel 0
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_advertise() -> String {
    "127.0.0.1:64738".to_string()
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_reconnect_backoff() -> u64 {
    1000
}

fn default_max_reconnect_backoff() -> u64 {
    30_000
}

fn default_max_clients() -> usize {
    1000
}

fn default_client_listen() -> TransportConfig {
    TransportConfig {
        port: 64738,
        ..TransportConfig::default()
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            advertise: default_advertise(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            max_reconnect_backoff_ms: default_max_reconnect_backoff(),
            max_clients: default_max_clients(),
            listen: default_client_listen(),
            channels: Vec::new(),
        }
    }
}

impl EdgeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_backoff_ms.max(self.reconnect_backoff_ms))
    }

    fn validate_channels(&self) -> Result<()> {
        let mut ids = HashSet::from([0u32]);
        for channel in &self.channels {
            if !ids.insert(channel.id) {
                bail!("duplicate channel id {}", channel.id);
            }
            if channel.name.is_empty() {
                bail!("channel {} has an empty name", channel.id);
            }
        }
        for channel in &self.channels {
            let parent = channel.parent.unwrap_or(0);
            if !ids.contains(&parent) {
                bail!("channel {} has unknown parent {}", channel.id, parent);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub id: u32,

    /// Defaults to the root channel
    #[serde(default)]
    pub parent: Option<u32>,

    pub name: String,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
