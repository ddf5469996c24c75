//! Reliable UDP: TLS over a selective-repeat ARQ with Reed-Solomon FEC
//!
//! Each datagram carries one FEC shard of an ARQ unit. A listener demuxes
//! datagrams by source address into per-peer driver tasks; the TLS session
//! runs on the application end of each driver's duplex pipe. Only the first
//! data segment of a conversation starts a new driver, and conversations
//! that just ended are remembered so their late datagrams are dropped.

mod arq;
mod fec;
mod session;

pub use fec::{FEC_HEADER, FecCodec, FecError};

use crate::frame_codec::FramedStream;
use crate::{Connection, TransportConfig, TransportError, tls};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, trace, warn};

pub const MIN_MTU: usize = 256;
pub const MAX_MTU: usize = 9000;

const ALPN: &[u8] = b"chorus-rudp/1";
const READY: u8 = 0xC1;
const DATAGRAM_QUEUE: usize = 1024;
const MAX_DATAGRAM: usize = 65_536;

/// A TLS session carried over the reliable-UDP engine
pub struct RudpConnection {
    framed: FramedStream,
    peer_addr: SocketAddr,
    peer_fingerprint: Option<String>,
}

impl std::fmt::Debug for RudpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RudpConnection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.framed.is_closed())
            .finish()
    }
}

impl RudpConnection {
    pub(crate) async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = config.resolve().await?;
        let connector = TlsConnector::from(Arc::new(tls::client_config(&config.tls, &[ALPN])?));
        let server_name = tls::server_name(config.server_name())?;

        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);

        let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
        let reader = tokio::spawn(read_from_peer(socket.clone(), addr, tx));
        let pipe = session::spawn(
            Some(fastrand::u32(..)),
            config.reliable_udp.clone(),
            socket,
            addr,
            rx,
            Box::new(move || reader.abort()),
        )
        .map_err(|e| TransportError::Config(e.to_string()))?;

        let mut stream = connector
            .connect(server_name, pipe)
            .await
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;

        // The listener sends READY only after it accepted our certificate
        let mut ready = [0u8; 1];
        stream
            .read_exact(&mut ready)
            .await
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
        if ready[0] != READY {
            return Err(TransportError::Connect("unexpected handshake confirmation".into()));
        }

        let peer_fingerprint = tls::peer_fingerprint(stream.get_ref().1.peer_certificates());
        let (reader, writer) = tokio::io::split(stream);

        info!("Reliable-UDP link established to {}", addr);
        Ok(Self {
            framed: FramedStream::new(reader, writer, config.max_frame_size),
            peer_addr: addr,
            peer_fingerprint,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_fingerprint.as_deref()
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.framed.send(frame).await
    }

    pub async fn receive(&self) -> Result<Bytes, TransportError> {
        self.framed.receive().await
    }

    pub async fn close(&self) {
        self.framed.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.framed.is_closed()
    }

    pub async fn closed(&self) {
        self.framed.close_token().cancelled().await;
    }
}

async fn read_from_peer(socket: Arc<UdpSocket>, peer: SocketAddr, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) if from == peer => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Ok((_, from)) => debug!("Ignoring datagram from {}", from),
            Err(e) => {
                debug!("UDP receive failed: {}", e);
                break;
            }
        }
    }
}

/// Conversation a datagram from an unknown peer would open, if it opens one.
/// The handshake unit is large enough that its first shard holds the
/// segment header for any shard layout that fits an MTU.
fn opening_conversation(datagram: &[u8]) -> Option<u32> {
    fec::unit_head(datagram).and_then(arq::opening_conv)
}

/// Recently ended `(peer, conversation)` pairs, forgotten after `linger`
struct FinishedConversations {
    linger: Duration,
    order: VecDeque<(Instant, SocketAddr, u32)>,
    known: HashSet<(SocketAddr, u32)>,
}

impl FinishedConversations {
    fn new(linger: Duration) -> Self {
        Self {
            linger,
            order: VecDeque::new(),
            known: HashSet::new(),
        }
    }

    fn insert(&mut self, peer: SocketAddr, conv: u32) {
        self.expire();
        if self.known.insert((peer, conv)) {
            self.order.push_back((Instant::now(), peer, conv));
        }
    }

    fn contains(&mut self, peer: SocketAddr, conv: u32) -> bool {
        self.expire();
        self.known.contains(&(peer, conv))
    }

    fn expire(&mut self) {
        while let Some(&(ended, peer, conv)) = self.order.front() {
            if ended.elapsed() < self.linger {
                break;
            }
            self.order.pop_front();
            self.known.remove(&(peer, conv));
        }
    }
}

pub(crate) async fn listen(
    config: &TransportConfig,
    incoming: mpsc::Sender<Result<Connection, TransportError>>,
) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
    let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&config.tls, &[ALPN])?));
    FecCodec::new(config.reliable_udp.data_shards, config.reliable_udp.parity_shards)
        .map_err(|e| TransportError::Config(e.to_string()))?;

    let socket = Arc::new(UdpSocket::bind(config.resolve().await?).await?);
    let local_addr = socket.local_addr()?;
    let udp = config.reliable_udp.clone();
    let max_frame_size = config.max_frame_size;
    let handshake_timeout = config.connect_timeout();
    info!("Reliable-UDP listener on {}", local_addr);

    let task = tokio::spawn(async move {
        let sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
        let mut finished = FinishedConversations::new(Duration::from_millis(udp.idle_timeout_ms));
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Reliable-UDP receive failed: {}", e);
                    continue;
                }
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            if let Some(session) = sessions.get(&peer) {
                // a full queue behaves like loss; the ARQ retransmits
                let _ = session.try_send(datagram);
                continue;
            }
            if incoming.is_closed() {
                break;
            }

            // a driver reports its end before leaving `sessions`
            while let Ok((peer, conv)) = ended_rx.try_recv() {
                finished.insert(peer, conv);
            }
            let Some(conv) = opening_conversation(&datagram) else {
                trace!("Dropping stray datagram from {}", peer);
                continue;
            };
            if finished.contains(peer, conv) {
                trace!("Dropping late datagram of finished conversation {:#x} from {}", conv, peer);
                continue;
            }

            let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
            let _ = tx.try_send(datagram);
            sessions.insert(peer, tx);

            let on_exit = {
                let sessions = sessions.clone();
                let ended = ended_tx.clone();
                Box::new(move || {
                    let _ = ended.send((peer, conv));
                    sessions.remove(&peer);
                })
            };
            let pipe = match session::spawn(Some(conv), udp.clone(), socket.clone(), peer, rx, on_exit) {
                Ok(pipe) => pipe,
                Err(e) => {
                    warn!("Reliable-UDP session for {} failed: {}", peer, e);
                    sessions.remove(&peer);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let incoming = incoming.clone();
            tokio::spawn(async move {
                let handshake = async {
                    let mut stream = acceptor
                        .accept(pipe)
                        .await
                        .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
                    stream.write_all(&[READY]).await?;
                    stream.flush().await?;
                    Ok::<_, TransportError>(stream)
                };

                let accepted = match tokio::time::timeout(handshake_timeout, handshake).await {
                    Ok(Ok(stream)) => {
                        let peer_fingerprint =
                            tls::peer_fingerprint(stream.get_ref().1.peer_certificates());
                        let (reader, writer) = tokio::io::split(stream);
                        debug!("Reliable-UDP connection accepted from {}", peer);
                        Ok(RudpConnection {
                            framed: FramedStream::new(reader, writer, max_frame_size),
                            peer_addr: peer,
                            peer_fingerprint,
                        })
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(TransportError::TlsHandshake("handshake timed out".into())),
                };

                if let Err(e) = &accepted {
                    warn!("Reliable-UDP handshake with {} failed: {}", peer, e);
                }
                let _ = incoming.send(accepted.map(Connection::ReliableUdp)).await;
            });
        }
    });

    Ok((local_addr, task))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_only_first_segment_opens_a_conversation() {
        let config = crate::ReliableUdpConfig::default();
        let codec = FecCodec::new(config.data_shards, config.parity_shards).unwrap();
        let mut arq = arq::Arq::new(Some(0xfeed), session::unit_limit(config.mtu), &config);

        arq.send(&[7u8; 300]);
        let units = arq.flush(0);
        let datagrams = codec.datagrams(1, &units[0]).unwrap();
        assert_eq!(opening_conversation(&datagrams[0]), Some(0xfeed));
        // parity and later data shards cannot open one
        assert!(datagrams[1..].iter().all(|d| opening_conversation(d).is_none()));

        arq.send(&[8u8; 300]);
        let later = arq.flush(1);
        let datagrams = codec.datagrams(2, later.last().unwrap()).unwrap();
        assert_eq!(opening_conversation(&datagrams[0]), None);
        assert_eq!(opening_conversation(&[0u8; 3]), None);
    }

    #[test]
    fn test_finished_conversations_expire() {
        let mut finished = FinishedConversations::new(Duration::from_millis(50));
        finished.insert(peer(1000), 9);

        assert!(finished.contains(peer(1000), 9));
        assert!(!finished.contains(peer(1000), 10));
        assert!(!finished.contains(peer(1001), 9));

        std::thread::sleep(Duration::from_millis(60));
        assert!(!finished.contains(peer(1000), 9));
        assert!(finished.order.is_empty());
    }
}
