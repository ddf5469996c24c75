//! RPC mode: HTTP/2 over TLS
//!
//! Client -> server frames are individual `POST /chorus.Link/Call` requests,
//! each bounded by `call_timeout`. Server -> client frames travel on the
//! response body of one long-lived `POST /chorus.Link/Subscribe`, each
//! prefixed with its u32 big-endian length.

use crate::{Connection, RpcConfig, TransportConfig, TransportError, tls};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http2::SendRequest;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ALPN_H2: &[u8] = b"h2";
const CALL_PATH: &str = "/chorus.Link/Call";
const SUBSCRIBE_PATH: &str = "/chorus.Link/Subscribe";
const MAX_MESSAGE_HEADER: &str = "x-chorus-max-message-size";

type RpcBody = UnsyncBoxBody<Bytes, Infallible>;

/// One HTTP/2 connection, seen from either side
pub struct RpcConnection {
    role: Role,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
    peer_addr: SocketAddr,
    peer_fingerprint: Option<String>,
    max_send: usize,
}

enum Role {
    Caller {
        sender: SendRequest<Full<Bytes>>,
        calls: Arc<Semaphore>,
        call_uri: String,
        call_timeout: Duration,
    },
    Responder {
        outbound: mpsc::Sender<Bytes>,
    },
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self.role {
            Role::Caller { .. } => "caller",
            Role::Responder { .. } => "responder",
        };
        f.debug_struct("RpcConnection")
            .field("peer_addr", &self.peer_addr)
            .field("role", &role)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl RpcConnection {
    pub(crate) async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = config.resolve().await?;
        let rpc = &config.rpc;

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        let connector = TlsConnector::from(Arc::new(tls::client_config(&config.tls, &[ALPN_H2])?));
        let stream = connector
            .connect(tls::server_name(config.server_name())?, tcp)
            .await
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
        let peer_fingerprint = tls::peer_fingerprint(stream.get_ref().1.peer_certificates());

        let (sender, connection) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
            .handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;

        let closed = CancellationToken::new();
        tokio::spawn({
            let closed = closed.clone();
            async move {
                tokio::select! {
                    result = connection => {
                        if let Err(e) = result {
                            debug!("RPC connection ended: {}", e);
                        }
                    }
                    _ = closed.cancelled() => {}
                }
                closed.cancel();
            }
        });

        let authority = format!("{}:{}", config.server_name(), addr.port());
        let subscribe = Request::builder()
            .method(Method::POST)
            .uri(format!("https://{}{}", authority, SUBSCRIBE_PATH))
            .body(Full::new(Bytes::new()))
            .map_err(|e| TransportError::Config(e.to_string()))?;

        // A rejected client certificate only surfaces once the first
        // request hits the wire.
        let mut subscriber = sender.clone();
        let response = match subscriber.send_request(subscribe).await {
            Ok(response) => response,
            Err(e) => {
                closed.cancel();
                return Err(TransportError::TlsHandshake(e.to_string()));
            }
        };
        if response.status() != StatusCode::OK {
            closed.cancel();
            return Err(TransportError::Connect(format!(
                "subscribe rejected with {}",
                response.status()
            )));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(rpc.max_concurrent_streams as usize);
        tokio::spawn(pump_stream(
            response.into_body(),
            inbound_tx,
            rpc.max_recv_message_size,
            closed.clone(),
        ));

        info!("RPC link established to {}", addr);
        Ok(Self {
            role: Role::Caller {
                sender,
                calls: Arc::new(Semaphore::new(rpc.max_concurrent_streams as usize)),
                call_uri: format!("https://{}{}", authority, CALL_PATH),
                call_timeout: Duration::from_millis(rpc.call_timeout_ms),
            },
            inbound: Mutex::new(inbound_rx),
            closed,
            peer_addr: addr,
            peer_fingerprint,
            max_send: rpc.max_send_message_size,
        })
    }

    fn serve(
        stream: tokio_rustls::server::TlsStream<TcpStream>,
        peer_addr: SocketAddr,
        rpc: &RpcConfig,
    ) -> Self {
        let peer_fingerprint = tls::peer_fingerprint(stream.get_ref().1.peer_certificates());
        let closed = CancellationToken::new();
        let queue = rpc.max_concurrent_streams as usize;
        let (inbound_tx, inbound_rx) = mpsc::channel(queue);
        let (outbound_tx, outbound_rx) = mpsc::channel(queue);

        let responder = Arc::new(Responder {
            inbound: inbound_tx,
            outbound: parking_lot::Mutex::new(Some(outbound_rx)),
            max_recv: rpc.max_recv_message_size,
            closed: closed.clone(),
        });
        let service = hyper::service::service_fn(move |request| {
            let responder = responder.clone();
            async move { Ok::<_, Infallible>(responder.handle(request).await) }
        });

        // One extra stream for the subscription
        let connection = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .max_concurrent_streams(rpc.max_concurrent_streams + 1)
            .serve_connection(TokioIo::new(stream), service);

        tokio::spawn({
            let closed = closed.clone();
            async move {
                tokio::select! {
                    result = connection => {
                        if let Err(e) = result {
                            debug!("RPC connection from {} ended: {}", peer_addr, e);
                        }
                    }
                    _ = closed.cancelled() => {}
                }
                closed.cancel();
            }
        });

        Self {
            role: Role::Responder {
                outbound: outbound_tx,
            },
            inbound: Mutex::new(inbound_rx),
            closed,
            peer_addr,
            peer_fingerprint,
            max_send: rpc.max_send_message_size,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_fingerprint.as_deref()
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_send {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max: self.max_send,
            });
        }

        match &self.role {
            Role::Caller {
                sender,
                calls,
                call_uri,
                call_timeout,
            } => {
                self.call(sender, calls, call_uri, *call_timeout, frame)
                    .await
            }
            Role::Responder { outbound } => tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(TransportError::StreamClosed),
                sent = outbound.send(frame) => sent.map_err(|_| TransportError::StreamClosed),
            },
        }
    }

    async fn call(
        &self,
        sender: &SendRequest<Full<Bytes>>,
        calls: &Semaphore,
        call_uri: &str,
        call_timeout: Duration,
        frame: Bytes,
    ) -> Result<(), TransportError> {
        let size = frame.len();
        let _permit = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::StreamClosed),
            permit = calls.acquire() => permit.map_err(|_| TransportError::StreamClosed)?,
        };

        let request = Request::builder()
            .method(Method::POST)
            .uri(call_uri)
            .body(Full::new(frame))
            .map_err(|e| TransportError::Config(e.to_string()))?;

        let mut sender = sender.clone();
        let exchange = async {
            sender.ready().await?;
            sender.send_request(request).await
        };

        let response = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::StreamClosed),
            response = tokio::time::timeout(call_timeout, exchange) => response,
        };

        match response {
            Err(_) => {
                warn!("RPC call to {} timed out after {:?}", self.peer_addr, call_timeout);
                self.closed.cancel();
                Err(TransportError::StreamClosed)
            }
            Ok(Err(e)) => {
                debug!("RPC call to {} failed: {}", self.peer_addr, e);
                self.closed.cancel();
                Err(TransportError::StreamClosed)
            }
            Ok(Ok(response)) => match response.status() {
                StatusCode::OK => Ok(()),
                StatusCode::PAYLOAD_TOO_LARGE => {
                    let max = response
                        .headers()
                        .get(MAX_MESSAGE_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    Err(TransportError::MessageTooLarge { size, max })
                }
                status => {
                    self.closed.cancel();
                    Err(TransportError::Connect(format!("call rejected with {}", status)))
                }
            },
        }
    }

    pub async fn receive(&self) -> Result<Bytes, TransportError> {
        let mut inbound = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::StreamClosed),
            inbound = self.inbound.lock() => inbound,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::StreamClosed),
            frame = inbound.recv() => frame.ok_or_else(|| {
                self.closed.cancel();
                TransportError::StreamClosed
            }),
        }
    }

    pub async fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Server-side request handling for one connection
struct Responder {
    inbound: mpsc::Sender<Bytes>,
    outbound: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    max_recv: usize,
    closed: CancellationToken,
}

impl Responder {
    async fn handle(&self, request: Request<Incoming>) -> Response<RpcBody> {
        match (request.method(), request.uri().path()) {
            (&Method::POST, CALL_PATH) => self.call(request.into_body()).await,
            (&Method::POST, SUBSCRIBE_PATH) => self.subscribe(),
            _ => status(StatusCode::NOT_FOUND),
        }
    }

    async fn call(&self, body: Incoming) -> Response<RpcBody> {
        let frame = match Limited::new(body, self.max_recv).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                warn!("Rejected RPC call above {} bytes", self.max_recv);
                let mut response = status(StatusCode::PAYLOAD_TOO_LARGE);
                response
                    .headers_mut()
                    .insert(MAX_MESSAGE_HEADER, self.max_recv.into());
                return response;
            }
            Err(e) => {
                debug!("RPC call body failed: {}", e);
                return status(StatusCode::BAD_REQUEST);
            }
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => status(StatusCode::SERVICE_UNAVAILABLE),
            sent = self.inbound.send(frame) => match sent {
                Ok(()) => status(StatusCode::OK),
                Err(_) => status(StatusCode::SERVICE_UNAVAILABLE),
            },
        }
    }

    fn subscribe(&self) -> Response<RpcBody> {
        let Some(outbound) = self.outbound.lock().take() else {
            return status(StatusCode::CONFLICT);
        };

        let frames = futures::stream::unfold(
            (outbound, self.closed.clone()),
            |(mut outbound, closed)| async move {
                let next = tokio::select! {
                    biased;
                    _ = closed.cancelled() => None,
                    frame = outbound.recv() => frame,
                };
                next.map(|frame| {
                    let mut buf = BytesMut::with_capacity(4 + frame.len());
                    buf.put_u32(frame.len() as u32);
                    buf.put_slice(&frame);
                    (Ok::<_, Infallible>(Frame::data(buf.freeze())), (outbound, closed))
                })
            },
        );

        Response::new(StreamBody::new(frames).boxed_unsync())
    }
}

fn status(code: StatusCode) -> Response<RpcBody> {
    let mut response = Response::new(Full::new(Bytes::new()).boxed_unsync());
    *response.status_mut() = code;
    response
}

/// Split the subscription body back into frames
async fn pump_stream(
    mut body: Incoming,
    inbound: mpsc::Sender<Bytes>,
    max_recv: usize,
    closed: CancellationToken,
) {
    let mut buf = BytesMut::new();

    'outer: loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = body.frame() => next,
        };

        let data = match next {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => data,
                Err(_) => continue,
            },
            Some(Err(e)) => {
                debug!("RPC stream failed: {}", e);
                break;
            }
            None => break,
        };
        buf.extend_from_slice(&data);

        while buf.len() >= 4 {
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if len > max_recv {
                warn!("RPC stream frame of {} bytes exceeds {}; closing", len, max_recv);
                break 'outer;
            }
            if buf.len() < 4 + len {
                break;
            }
            buf.advance(4);
            let frame = buf.split_to(len).freeze();
            if inbound.send(frame).await.is_err() {
                break 'outer;
            }
        }
    }

    closed.cancel();
}

pub(crate) async fn listen(
    config: &TransportConfig,
    incoming: mpsc::Sender<Result<Connection, TransportError>>,
) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
    let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&config.tls, &[ALPN_H2])?));
    let listener = TcpListener::bind(config.resolve().await?).await?;
    let local_addr = listener.local_addr()?;
    let rpc = config.rpc.clone();
    let handshake_timeout = config.connect_timeout();
    info!("RPC listener on {}", local_addr);

    let task = tokio::spawn(async move {
        loop {
            let (tcp, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("RPC accept failed: {}", e);
                    continue;
                }
            };
            let _ = tcp.set_nodelay(true);

            let acceptor = acceptor.clone();
            let tx = incoming.clone();
            let rpc = rpc.clone();
            tokio::spawn(async move {
                let accepted = match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => Ok(RpcConnection::serve(stream, peer_addr, &rpc)),
                    Ok(Err(e)) => Err(TransportError::TlsHandshake(e.to_string())),
                    Err(_) => Err(TransportError::TlsHandshake("handshake timed out".into())),
                };

                if let Err(e) = &accepted {
                    warn!("RPC handshake with {} failed: {}", peer_addr, e);
                }
                let _ = tx.send(accepted.map(Connection::Rpc)).await;
            });

            if incoming.is_closed() {
                break;
            }
        }
    });

    Ok((local_addr, task))
}
