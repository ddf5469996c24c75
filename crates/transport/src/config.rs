//! Transport configuration
//!
//! One `TransportConfig` describes both ends of a link. The protocol is an
//! out-of-band agreement between the two nodes; it is never negotiated.

use crate::TransportError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Which wire protocol carries the TLS session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// QUIC with independent logical streams
    #[default]
    Multiplex,
    /// HTTP/2 calls with a streaming response for the reverse direction
    Rpc,
    /// ARQ over UDP with optional Reed-Solomon FEC
    ReliableUdp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Multiplex => "multiplex",
            Protocol::Rpc => "rpc",
            Protocol::ReliableUdp => "reliable_udp",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on a single frame in multiplex and reliable-UDP modes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Dial plus TLS handshake budget (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub tls: TlsMaterial,

    #[serde(default)]
    pub multiplex: MultiplexConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub reliable_udp: ReliableUdpConfig,
}

/// Certificates and keys. Each value is either a file path or inline PEM.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsMaterial {
    #[serde(default)]
    pub cert: Option<String>,

    #[serde(default)]
    pub key: Option<String>,

    /// Trust roots for the peer (server roots on clients, client CA on servers)
    #[serde(default)]
    pub ca: Option<String>,

    #[serde(default)]
    pub require_client_cert: bool,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// SNI / verification name; defaults to `host`
    #[serde(default)]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiplexConfig {
    /// Unacknowledged bytes allowed per stream
    #[serde(default = "default_stream_window")]
    pub stream_window: u32,

    /// Unacknowledged bytes allowed across the whole connection
    #[serde(default = "default_session_window")]
    pub session_window: u64,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_ms: u64,

    #[serde(default = "default_max_streams")]
    pub max_streams: u32,
}

impl Default for MultiplexConfig {
    fn default() -> Self {
        Self {
            stream_window: default_stream_window(),
            session_window: default_session_window(),
            keepalive_interval_ms: default_keepalive_interval(),
            keepalive_timeout_ms: default_keepalive_timeout(),
            max_streams: default_max_streams(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,

    #[serde(default = "default_message_size")]
    pub max_send_message_size: usize,

    #[serde(default = "default_message_size")]
    pub max_recv_message_size: usize,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            max_send_message_size: default_message_size(),
            max_recv_message_size: default_message_size(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReliableUdpConfig {
    /// Largest datagram put on the wire, FEC header included
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    #[serde(default = "default_snd_wnd")]
    pub snd_wnd: u16,

    #[serde(default = "default_rcv_wnd")]
    pub rcv_wnd: u16,

    /// Flush / retransmit timer period (ms)
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Duplicate acks before fast retransmit; 0 disables
    #[serde(default = "default_resend")]
    pub resend: u32,

    #[serde(default = "default_true")]
    pub no_congestion: bool,

    /// 0 parity shards disables FEC
    #[serde(default = "default_data_shards")]
    pub data_shards: usize,

    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,

    /// Transmissions of one segment before the link is declared dead
    #[serde(default = "default_dead_link")]
    pub dead_link: u32,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

impl Default for ReliableUdpConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            snd_wnd: default_snd_wnd(),
            rcv_wnd: default_rcv_wnd(),
            interval_ms: default_interval(),
            resend: default_resend(),
            no_congestion: default_true(),
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
            dead_link: default_dead_link(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            host: default_host(),
            port: default_port(),
            max_frame_size: default_max_frame_size(),
            connect_timeout_ms: default_connect_timeout(),
            tls: TlsMaterial::default(),
            multiplex: MultiplexConfig::default(),
            rpc: RpcConfig::default(),
            reliable_udp: ReliableUdpConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve `host:port` to the first socket address
    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        tokio::net::lookup_host(self.endpoint())
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.endpoint(), e)))?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("{}: no address", self.endpoint())))
    }

    pub fn server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.host)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reject settings no protocol can honour
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_frame_size == 0 {
            return Err(TransportError::Config("max_frame_size must be positive".into()));
        }

        match self.protocol {
            Protocol::Multiplex => {
                let mux = &self.multiplex;
                if mux.max_streams == 0 {
                    return Err(TransportError::Config("multiplex.max_streams must be positive".into()));
                }
                if u64::from(mux.stream_window) > mux.session_window {
                    return Err(TransportError::Config(
                        "multiplex.stream_window exceeds session_window".into(),
                    ));
                }
                if mux.keepalive_interval_ms >= mux.keepalive_timeout_ms {
                    return Err(TransportError::Config(
                        "multiplex.keepalive_interval_ms must be below keepalive_timeout_ms".into(),
                    ));
                }
            }
            Protocol::Rpc => {
                let rpc = &self.rpc;
                if rpc.max_concurrent_streams == 0 {
                    return Err(TransportError::Config(
                        "rpc.max_concurrent_streams must be positive".into(),
                    ));
                }
                if rpc.max_send_message_size == 0 || rpc.max_recv_message_size == 0 {
                    return Err(TransportError::Config("rpc message size limits must be positive".into()));
                }
            }
            Protocol::ReliableUdp => {
                let udp = &self.reliable_udp;
                if !(crate::rudp::MIN_MTU..=crate::rudp::MAX_MTU).contains(&udp.mtu) {
                    return Err(TransportError::Config(format!(
                        "reliable_udp.mtu must be within {}..={}",
                        crate::rudp::MIN_MTU,
                        crate::rudp::MAX_MTU
                    )));
                }
                if udp.snd_wnd == 0 || udp.rcv_wnd == 0 {
                    return Err(TransportError::Config("reliable_udp windows must be positive".into()));
                }
                if udp.parity_shards > 0 && udp.data_shards == 0 {
                    return Err(TransportError::Config(
                        "reliable_udp.parity_shards requires data_shards".into(),
                    ));
                }
                if udp.data_shards + udp.parity_shards > 255 {
                    return Err(TransportError::Config(
                        "reliable_udp shard count exceeds 255".into(),
                    ));
                }
                if udp.dead_link == 0 || udp.interval_ms == 0 {
                    return Err(TransportError::Config(
                        "reliable_udp.dead_link and interval_ms must be positive".into(),
                    ));
                }
            }
        }

        if self.tls.cert.is_some() != self.tls.key.is_some() {
            return Err(TransportError::Config("tls.cert and tls.key must be set together".into()));
        }

        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    64739
}

fn default_max_frame_size() -> usize {
    1024 * 1024
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_stream_window() -> u32 {
    256 * 1024
}

fn default_session_window() -> u64 {
    4 * 1024 * 1024
}

fn default_keepalive_interval() -> u64 {
    10_000
}

fn default_keepalive_timeout() -> u64 {
    30_000
}

fn default_max_streams() -> u32 {
    256
}

fn default_max_concurrent_streams() -> u32 {
    100
}

fn default_message_size() -> usize {
    4 * 1024 * 1024
}

fn default_call_timeout() -> u64 {
    10_000
}

fn default_mtu() -> usize {
    1350
}

fn default_snd_wnd() -> u16 {
    128
}

fn default_rcv_wnd() -> u16 {
    512
}

fn default_interval() -> u64 {
    20
}

fn default_resend() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_data_shards() -> usize {
    4
}

fn default_parity_shards() -> usize {
    2
}

fn default_dead_link() -> u32 {
    20
}

fn default_idle_timeout() -> u64 {
    30_000
}
