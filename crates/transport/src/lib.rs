//! Chorus Transport - pluggable TLS links between nodes
//!
//! This crate provides:
//! - Multiplex: QUIC with a control stream plus independent logical streams
//! - RPC: HTTP/2 calls, with a streaming response carrying the reverse direction
//! - Reliable UDP: TLS over a selective-repeat ARQ with Reed-Solomon FEC
//!
//! Every protocol yields a [`Connection`] that moves length-delimited frames
//! in both directions, and every listener verifies client certificates the
//! same way.

mod config;
mod frame_codec;
mod multiplex;
mod rpc;
pub mod rudp;
mod tls;

pub use config::*;
pub use multiplex::{MuxConnection, MuxStream};
pub use rpc::RpcConnection;
pub use rudp::{FecCodec, FecError, RudpConnection};

use bytes::Bytes;
use futures::Stream;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const ACCEPT_BACKLOG: usize = 64;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid transport configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An established, authenticated link
#[derive(Debug)]
pub enum Connection {
    Multiplex(MuxConnection),
    Rpc(RpcConnection),
    ReliableUdp(RudpConnection),
}

impl Connection {
    pub fn protocol(&self) -> Protocol {
        match self {
            Connection::Multiplex(_) => Protocol::Multiplex,
            Connection::Rpc(_) => Protocol::Rpc,
            Connection::ReliableUdp(_) => Protocol::ReliableUdp,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Connection::Multiplex(c) => c.peer_addr(),
            Connection::Rpc(c) => c.peer_addr(),
            Connection::ReliableUdp(c) => c.peer_addr(),
        }
    }

    /// SHA-256 fingerprint of the peer's leaf certificate, if it sent one
    pub fn peer_fingerprint(&self) -> Option<&str> {
        match self {
            Connection::Multiplex(c) => c.peer_fingerprint(),
            Connection::Rpc(c) => c.peer_fingerprint(),
            Connection::ReliableUdp(c) => c.peer_fingerprint(),
        }
    }

    /// Send one frame. Frames larger than `max_frame_size` are rejected
    /// before anything touches the wire.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        match self {
            Connection::Multiplex(c) => c.send(frame).await,
            Connection::Rpc(c) => c.send(frame).await,
            Connection::ReliableUdp(c) => c.send(frame).await,
        }
    }

    /// Wait for the next frame; `StreamClosed` once the link is gone
    pub async fn receive(&self) -> Result<Bytes, TransportError> {
        match self {
            Connection::Multiplex(c) => c.receive().await,
            Connection::Rpc(c) => c.receive().await,
            Connection::ReliableUdp(c) => c.receive().await,
        }
    }

    /// Close the link. Pending and later operations fail with `StreamClosed`.
    pub async fn close(&self) {
        match self {
            Connection::Multiplex(c) => c.close().await,
            Connection::Rpc(c) => c.close().await,
            Connection::ReliableUdp(c) => c.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Connection::Multiplex(c) => c.is_closed(),
            Connection::Rpc(c) => c.is_closed(),
            Connection::ReliableUdp(c) => c.is_closed(),
        }
    }

    /// Resolves once the link is closed from either side
    pub async fn closed(&self) {
        match self {
            Connection::Multiplex(c) => c.closed().await,
            Connection::Rpc(c) => c.closed().await,
            Connection::ReliableUdp(c) => c.closed().await,
        }
    }
}

/// Accepted connections, in handshake completion order
pub struct Listener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Result<Connection, TransportError>>,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next handshake outcome. A failed handshake yields its error without
    /// stopping the listener.
    pub async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.incoming.recv().await.unwrap_or(Err(TransportError::StreamClosed))
    }

    pub fn incoming(self) -> impl Stream<Item = Result<Connection, TransportError>> {
        futures::stream::unfold(self, |mut listener| async move {
            let next = listener.incoming.recv().await?;
            Some((next, listener))
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Dial the endpoint in `config` with its configured protocol
pub async fn open(config: &TransportConfig) -> Result<Connection, TransportError> {
    config.validate()?;
    debug!("Opening {} link to {}", config.protocol.as_str(), config.endpoint());

    let connect = async {
        match config.protocol {
            Protocol::Multiplex => MuxConnection::connect(config).await.map(Connection::Multiplex),
            Protocol::Rpc => RpcConnection::connect(config).await.map(Connection::Rpc),
            Protocol::ReliableUdp => RudpConnection::connect(config).await.map(Connection::ReliableUdp),
        }
    };

    tokio::time::timeout(config.connect_timeout(), connect)
        .await
        .map_err(|_| TransportError::Connect(format!("{} timed out", config.endpoint())))?
}

/// Bind the endpoint in `config` and start accepting
pub async fn listen(config: &TransportConfig) -> Result<Listener, TransportError> {
    config.validate()?;

    let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
    let (local_addr, task) = match config.protocol {
        Protocol::Multiplex => multiplex::listen(config, tx).await?,
        Protocol::Rpc => rpc::listen(config, tx).await?,
        Protocol::ReliableUdp => rudp::listen(config, tx).await?,
    };

    Ok(Listener {
        local_addr,
        incoming,
        task,
    })
}
