//! Per-peer driver task bridging a duplex pipe to the UDP socket

use super::arq::Arq;
use super::fec::{FEC_HEADER, FecCodec, ShardAssembler};
use crate::ReliableUdpConfig;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

const DUPLEX_CAPACITY: usize = 256 * 1024;
const READ_CHUNK: usize = 16 * 1024;
const MAX_PENDING_OUT: usize = 256 * 1024;

/// Length prefix the FEC codec adds in front of every unit
const UNIT_PREFIX: usize = 4;

pub(crate) type OnExit = Box<dyn FnOnce() + Send>;

/// Largest ARQ unit that still fits one datagram after FEC framing
pub(crate) fn unit_limit(mtu: usize) -> usize {
    mtu - FEC_HEADER - UNIT_PREFIX
}

/// Start a driver for `peer`; the returned stream is the application side
pub(crate) fn spawn(
    conv: Option<u32>,
    config: ReliableUdpConfig,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    datagrams: mpsc::Receiver<Bytes>,
    on_exit: OnExit,
) -> Result<DuplexStream, super::FecError> {
    let codec = FecCodec::new(config.data_shards, config.parity_shards)?;
    let arq = Arq::new(conv, unit_limit(config.mtu), &config);
    let (app, wire) = tokio::io::duplex(DUPLEX_CAPACITY);

    tokio::spawn(async move {
        drive(arq, codec, config, socket, peer, datagrams, wire).await;
        on_exit();
    });

    Ok(app)
}

async fn drive(
    mut arq: Arq,
    codec: FecCodec,
    config: ReliableUdpConfig,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    mut datagrams: mpsc::Receiver<Bytes>,
    wire: DuplexStream,
) {
    let (mut wire_read, mut wire_write) = tokio::io::split(wire);
    let started = Instant::now();
    let now_ms = || started.elapsed().as_millis() as u32;

    let mut assembler = ShardAssembler::new(codec.clone());
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let idle_timeout = Duration::from_millis(config.idle_timeout_ms);
    let send_limit = config.snd_wnd as usize * 2;

    let mut last_heard = Instant::now();
    let mut read_buf = vec![0u8; READ_CHUNK];
    let mut pending_out = BytesMut::new();
    let mut app_eof = false;
    let mut eof_delivered = false;
    let mut unit_id = fastrand::u32(..);

    loop {
        let can_read = !app_eof && arq.pending() < send_limit;
        let can_write = !pending_out.is_empty();

        tokio::select! {
            read = wire_read.read(&mut read_buf), if can_read => match read {
                Ok(0) | Err(_) => {
                    app_eof = true;
                    arq.close();
                }
                Ok(n) => arq.send(&read_buf[..n]),
            },
            written = wire_write.write(&pending_out), if can_write => match written {
                Ok(n) => pending_out.advance(n),
                Err(_) => {
                    // application dropped its end
                    pending_out.clear();
                    app_eof = true;
                    arq.close();
                }
            },
            datagram = datagrams.recv() => match datagram {
                Some(datagram) => {
                    last_heard = Instant::now();
                    match assembler.push(&datagram) {
                        Ok(Some(unit)) => {
                            if let Err(e) = arq.input(now_ms(), &unit) {
                                debug!("Dropping unit from {}: {}", peer, e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => trace!("Dropping shard from {}: {}", peer, e),
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {}
        }

        while pending_out.len() < MAX_PENDING_OUT {
            match arq.recv() {
                Some(data) => pending_out.extend_from_slice(&data),
                None => break,
            }
        }

        for unit in arq.flush(now_ms()) {
            match codec.datagrams(unit_id, &unit) {
                Ok(shards) => {
                    for shard in shards {
                        if let Err(e) = socket.send_to(&shard, peer).await {
                            debug!("Send to {} failed: {}", peer, e);
                        }
                    }
                }
                Err(e) => warn!("FEC encode failed: {}", e),
            }
            unit_id = unit_id.wrapping_add(1);
        }

        if arq.is_dead() {
            warn!("Reliable-UDP link to {} dead after {} transmissions", peer, config.dead_link);
            break;
        }
        if last_heard.elapsed() > idle_timeout {
            warn!("Reliable-UDP link to {} idle for {:?}", peer, idle_timeout);
            break;
        }
        if arq.fin_sent() {
            debug!("Reliable-UDP link to {} finished", peer);
            break;
        }
        if arq.peer_finished() && pending_out.is_empty() && !eof_delivered {
            let _ = wire_write.shutdown().await;
            eof_delivered = true;
        }
    }
}
