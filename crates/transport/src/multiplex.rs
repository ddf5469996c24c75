//! Multiplex mode: QUIC with many independent logical streams
//!
//! The dialing side opens the first bidirectional stream and writes a
//! one-byte preamble; the listener acknowledges it. That stream is the
//! control stream behind `Connection::send` / `receive`. Further streams
//! come from `open_stream` / `accept_stream`.

use crate::frame_codec::FramedStream;
use crate::{Connection, MultiplexConfig, TransportConfig, TransportError, tls};
use bytes::Bytes;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, IdleTimeout, VarInt};
use rustls::pki_types::CertificateDer;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ALPN: &[u8] = b"chorus-mux/1";
const CONTROL_PREAMBLE: u8 = 0xC0;
const CONTROL_ACK: u8 = 0xC1;

/// One QUIC connection and its control stream
pub struct MuxConnection {
    connection: quinn::Connection,
    control: FramedStream,
    max_frame_size: usize,
    peer_fingerprint: Option<String>,
    _endpoint: Endpoint,
}

/// An additional logical stream; flow-controlled independently of the others
pub struct MuxStream {
    id: u64,
    inner: FramedStream,
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("peer_addr", &self.connection.remote_address())
            .field("closed", &self.control.is_closed())
            .finish()
    }
}

impl MuxStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.inner.send(frame).await
    }

    pub async fn receive(&self) -> Result<Bytes, TransportError> {
        self.inner.receive().await
    }

    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl MuxConnection {
    pub(crate) async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = config.resolve().await?;

        let crypto = QuicClientConfig::try_from(tls::client_config(&config.tls, &[ALPN])?)
            .map_err(|e| TransportError::Config(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(Arc::new(transport_config(&config.multiplex)?));

        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, config.server_name())
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .await
            .map_err(handshake_error)?;

        let (mut send, mut recv) = connection.open_bi().await.map_err(handshake_error)?;
        send.write_all(&[CONTROL_PREAMBLE]).await.map_err(|e| match e {
            quinn::WriteError::ConnectionLost(lost) => handshake_error(lost),
            other => TransportError::Connect(other.to_string()),
        })?;

        // The listener acks only after it accepted our certificate
        let mut ack = [0u8; 1];
        recv.read_exact(&mut ack).await.map_err(|e| match e {
            quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(lost)) => {
                handshake_error(lost)
            }
            other => TransportError::Connect(other.to_string()),
        })?;
        if ack[0] != CONTROL_ACK {
            return Err(TransportError::Connect("unexpected control stream ack".into()));
        }

        info!("Multiplex link established to {}", addr);
        Ok(Self::new(connection, endpoint, send, recv, config.max_frame_size))
    }

    async fn accept(
        incoming: quinn::Incoming,
        endpoint: Endpoint,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let connection = incoming.await.map_err(handshake_error)?;
        let (mut send, mut recv) = connection.accept_bi().await.map_err(handshake_error)?;

        let mut preamble = [0u8; 1];
        recv.read_exact(&mut preamble)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if preamble[0] != CONTROL_PREAMBLE {
            connection.close(VarInt::from_u32(1), b"bad preamble");
            return Err(TransportError::Connect("unexpected control stream preamble".into()));
        }
        send.write_all(&[CONTROL_ACK])
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!("Multiplex connection accepted from {}", connection.remote_address());
        Ok(Self::new(connection, endpoint, send, recv, max_frame_size))
    }

    fn new(
        connection: quinn::Connection,
        endpoint: Endpoint,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        max_frame_size: usize,
    ) -> Self {
        let peer_fingerprint = connection
            .peer_identity()
            .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
            .and_then(|chain| tls::peer_fingerprint(Some(chain.as_slice())));

        Self {
            control: FramedStream::new(recv, send, max_frame_size),
            connection,
            max_frame_size,
            peer_fingerprint,
            _endpoint: endpoint,
        }
    }

    /// Open a new logical stream. The peer's `accept_stream` resolves once
    /// the first frame is sent on it.
    pub async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|_| TransportError::StreamClosed)?;
        Ok(self.wrap(send, recv))
    }

    pub async fn accept_stream(&self) -> Result<MuxStream, TransportError> {
        let (send, recv) = tokio::select! {
            biased;
            _ = self.control.close_token().cancelled() => return Err(TransportError::StreamClosed),
            streams = self.connection.accept_bi() => streams.map_err(|_| TransportError::StreamClosed)?,
        };
        Ok(self.wrap(send, recv))
    }

    fn wrap(&self, send: quinn::SendStream, recv: quinn::RecvStream) -> MuxStream {
        MuxStream {
            id: send.id().index(),
            inner: FramedStream::new(recv, send, self.max_frame_size),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_fingerprint.as_deref()
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.control.send(frame).await
    }

    pub async fn receive(&self) -> Result<Bytes, TransportError> {
        self.control.receive().await
    }

    pub async fn close(&self) {
        self.control.close().await;
        self.connection.close(VarInt::from_u32(0), b"closed");
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed() || self.connection.close_reason().is_some()
    }

    pub async fn closed(&self) {
        tokio::select! {
            _ = self.control.close_token().cancelled() => {}
            _ = self.connection.closed() => {}
        }
    }
}

pub(crate) async fn listen(
    config: &TransportConfig,
    incoming: mpsc::Sender<Result<Connection, TransportError>>,
) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
    let crypto = QuicServerConfig::try_from(tls::server_config(&config.tls, &[ALPN])?)
        .map_err(|e| TransportError::Config(e.to_string()))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport_config(&config.multiplex)?));

    let endpoint = Endpoint::server(server_config, config.resolve().await?)?;
    let local_addr = endpoint.local_addr()?;
    let max_frame_size = config.max_frame_size;
    let handshake_timeout = config.connect_timeout();
    info!("Multiplex listener on {}", local_addr);

    let task = tokio::spawn(async move {
        while let Some(connecting) = endpoint.accept().await {
            let endpoint = endpoint.clone();
            let tx = incoming.clone();

            tokio::spawn(async move {
                let accepted = tokio::time::timeout(
                    handshake_timeout,
                    MuxConnection::accept(connecting, endpoint, max_frame_size),
                )
                .await
                .unwrap_or_else(|_| Err(TransportError::TlsHandshake("handshake timed out".into())));

                if let Err(e) = &accepted {
                    warn!("Multiplex accept failed: {}", e);
                }
                let _ = tx.send(accepted.map(Connection::Multiplex)).await;
            });

            if incoming.is_closed() {
                break;
            }
        }
    });

    Ok((local_addr, task))
}

fn transport_config(mux: &MultiplexConfig) -> Result<quinn::TransportConfig, TransportError> {
    let session_window = VarInt::from_u64(mux.session_window)
        .map_err(|_| TransportError::Config("multiplex.session_window too large".into()))?;
    let idle_timeout = IdleTimeout::try_from(Duration::from_millis(mux.keepalive_timeout_ms))
        .map_err(|_| TransportError::Config("multiplex.keepalive_timeout_ms too large".into()))?;

    let mut transport = quinn::TransportConfig::default();
    transport
        .stream_receive_window(VarInt::from_u32(mux.stream_window))
        .receive_window(session_window)
        .send_window(mux.session_window)
        .max_concurrent_bidi_streams(VarInt::from_u32(mux.max_streams))
        .keep_alive_interval(Some(Duration::from_millis(mux.keepalive_interval_ms)))
        .max_idle_timeout(Some(idle_timeout));

    Ok(transport)
}

fn handshake_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::TimedOut => TransportError::Connect("timed out".into()),
        ConnectionError::TransportError(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::VersionMismatch => TransportError::TlsHandshake(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}
