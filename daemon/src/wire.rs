//! Frame pumps shared by hub links, edge links and client connections

use crate::metrics::METRICS;
use bytes::Bytes;
use chorus_protocol::LinkMessage;
use chorus_transport::{Connection, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_QUEUE: usize = 64;

/// How long a parting frame gets to reach the peer before the link is cut
const LINGER: Duration = Duration::from_secs(1);

/// Move inbound frames onto a channel so loops can `select!` on them.
/// The channel closes when the connection does.
pub(crate) fn spawn_reader(conn: Arc<Connection>) -> (mpsc::Receiver<Bytes>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(READ_QUEUE);
    let task = tokio::spawn(async move {
        loop {
            match conn.receive().await {
                Ok(frame) => {
                    METRICS.frames_received.inc();
                    trace!("{} bytes from {}", frame.len(), conn.peer_addr());
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(TransportError::StreamClosed) => {
                    debug!("{} closed the link", conn.peer_addr());
                    break;
                }
                Err(e) => {
                    warn!("Receive from {} failed: {}", conn.peer_addr(), e);
                    break;
                }
            }
        }
    });
    (rx, task)
}

pub(crate) async fn send_frame(conn: &Connection, frame: Bytes) -> Result<(), TransportError> {
    conn.send(frame).await?;
    METRICS.frames_sent.inc();
    Ok(())
}

pub(crate) async fn send_link(conn: &Connection, message: &LinkMessage) -> Result<(), TransportError> {
    let frame = message
        .encode()
        .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
    trace!("-> {} {}", conn.peer_addr(), message.kind());
    send_frame(conn, frame).await
}

/// Drain queued link messages onto the connection until either side goes away
pub(crate) fn spawn_link_writer(
    conn: Arc<Connection>,
    mut queue: mpsc::UnboundedReceiver<LinkMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(e) = send_link(&conn, &message).await {
                debug!("Link writer to {} stopped: {}", conn.peer_addr(), e);
                break;
            }
        }
    })
}

/// Give the peer a moment to read what was just sent and hang up first
pub(crate) async fn linger(conn: &Connection) {
    let _ = tokio::time::timeout(LINGER, conn.closed()).await;
}
