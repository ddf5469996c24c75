//! Selective-repeat ARQ over unreliable units, without I/O
//!
//! The driver feeds received units through [`Arq::input`], calls
//! [`Arq::flush`] on every tick and puts the returned units on the wire.
//! Time is a wrapping millisecond counter chosen by the driver.

use crate::ReliableUdpConfig;
use bytes::{Buf, BufMut, Bytes};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// `conv u32 | cmd u8 | wnd u16 | ts u32 | sn u32 | una u32 | len u16`
pub(crate) const SEGMENT_HEADER: usize = 21;

const CMD_PUSH: u8 = 81;
const CMD_ACK: u8 = 82;
const CMD_PROBE: u8 = 83;
const CMD_WINDOW: u8 = 84;
const CMD_FIN: u8 = 85;

const RTO_MIN: u32 = 30;
const RTO_DEFAULT: u32 = 200;
const RTO_MAX: u32 = 60_000;
const PROBE_INTERVAL: u32 = 500;
const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum ArqError {
    #[error("truncated segment")]
    Truncated,

    #[error("conversation mismatch: expected {expected}, got {got}")]
    ConvMismatch { expected: u32, got: u32 },

    #[error("unknown segment command {0}")]
    UnknownCommand(u8),
}

#[derive(Debug, Clone, Copy)]
struct Header {
    conv: u32,
    cmd: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    len: u16,
}

fn encode_segment(out: &mut Vec<u8>, header: &Header, data: &[u8]) {
    out.put_u32(header.conv);
    out.put_u8(header.cmd);
    out.put_u16(header.wnd);
    out.put_u32(header.ts);
    out.put_u32(header.sn);
    out.put_u32(header.una);
    out.put_u16(header.len);
    out.extend_from_slice(data);
}

fn decode_segment(mut buf: &[u8]) -> Result<(Header, &[u8], &[u8]), ArqError> {
    if buf.len() < SEGMENT_HEADER {
        return Err(ArqError::Truncated);
    }
    let header = Header {
        conv: buf.get_u32(),
        cmd: buf.get_u8(),
        wnd: buf.get_u16(),
        ts: buf.get_u32(),
        sn: buf.get_u32(),
        una: buf.get_u32(),
        len: buf.get_u16(),
    };
    let len = header.len as usize;
    if buf.len() < len {
        return Err(ArqError::Truncated);
    }
    Ok((header, &buf[..len], &buf[len..]))
}

/// Conversation id if `unit` starts with the first data segment of a
/// conversation. Only the header has to be present.
pub(crate) fn opening_conv(mut unit: &[u8]) -> Option<u32> {
    if unit.len() < SEGMENT_HEADER {
        return None;
    }
    let conv = unit.get_u32();
    let cmd = unit.get_u8();
    unit.advance(2 + 4); // wnd, ts
    let sn = unit.get_u32();
    (cmd == CMD_PUSH && sn == 0).then_some(conv)
}

/// Signed distance between two wrapping counters
fn diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

struct Segment {
    sn: u32,
    resend_at: u32,
    rto: u32,
    xmit: u32,
    fastack: u32,
    data: Bytes,
}

/// Packs segments into units no larger than the unit limit
struct UnitWriter {
    limit: usize,
    current: Vec<u8>,
    units: Vec<Vec<u8>>,
}

impl UnitWriter {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            current: Vec::new(),
            units: Vec::new(),
        }
    }

    fn push(&mut self, header: &Header, data: &[u8]) {
        if !self.current.is_empty() && self.current.len() + SEGMENT_HEADER + data.len() > self.limit {
            self.units.push(std::mem::take(&mut self.current));
        }
        encode_segment(&mut self.current, header, data);
    }

    fn finish(mut self) -> Vec<Vec<u8>> {
        if !self.current.is_empty() {
            self.units.push(self.current);
        }
        self.units
    }
}

pub(crate) struct Arq {
    conv: Option<u32>,
    unit_limit: usize,
    mss: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    ssthresh: u32,
    incr: u32,
    no_congestion: bool,

    rx_srtt: i64,
    rx_rttvar: i64,
    rx_rto: u32,
    interval: u32,
    fastresend: u32,
    dead_link: u32,
    keepalive: u32,

    snd_queue: VecDeque<Bytes>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: BTreeMap<u32, Bytes>,
    rcv_queue: VecDeque<Bytes>,
    acklist: Vec<(u32, u32)>,

    probe_at: Option<u32>,
    window_ask: bool,
    window_tell: bool,
    last_output: u32,

    closing: bool,
    fin_sent: bool,
    fin_received: bool,
    dead: bool,
}

impl Arq {
    /// `conv == None` adopts the conversation id of the first valid unit
    pub(crate) fn new(conv: Option<u32>, unit_limit: usize, config: &ReliableUdpConfig) -> Self {
        let interval = config.interval_ms.clamp(1, 5_000) as u32;
        Self {
            conv,
            unit_limit,
            mss: unit_limit.saturating_sub(SEGMENT_HEADER).max(1),
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            snd_wnd: config.snd_wnd as u32,
            rcv_wnd: config.rcv_wnd as u32,
            rmt_wnd: config.rcv_wnd as u32,
            cwnd: 1,
            ssthresh: THRESH_INIT,
            incr: 0,
            no_congestion: config.no_congestion,
            rx_srtt: 0,
            rx_rttvar: 0,
            rx_rto: RTO_DEFAULT,
            interval,
            fastresend: config.resend,
            dead_link: config.dead_link.max(1),
            keepalive: ((config.idle_timeout_ms / 3) as u32).max(interval),
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: BTreeMap::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            probe_at: None,
            window_ask: false,
            window_tell: false,
            last_output: 0,
            closing: false,
            fin_sent: false,
            fin_received: false,
            dead: false,
        }
    }

    pub(crate) fn conv(&self) -> Option<u32> {
        self.conv
    }

    /// Queue application bytes, cut into segments of at most `mss`
    pub(crate) fn send(&mut self, data: &[u8]) {
        for chunk in data.chunks(self.mss) {
            self.snd_queue.push_back(Bytes::copy_from_slice(chunk));
        }
    }

    /// Next in-order segment payload
    pub(crate) fn recv(&mut self) -> Option<Bytes> {
        let was_full = self.rcv_queue.len() >= self.rcv_wnd as usize;
        let data = self.rcv_queue.pop_front()?;
        self.move_to_queue();
        if was_full && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.window_tell = true;
        }
        Some(data)
    }

    /// Segments queued or in flight
    pub(crate) fn pending(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }

    /// Send FIN once everything queued so far is acknowledged
    pub(crate) fn close(&mut self) {
        self.closing = true;
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead
    }

    pub(crate) fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    /// Peer sent FIN and all of its data has been read out
    pub(crate) fn peer_finished(&self) -> bool {
        self.fin_received && self.rcv_buf.is_empty() && self.rcv_queue.is_empty()
    }

    pub(crate) fn input(&mut self, now: u32, mut unit: &[u8]) -> Result<(), ArqError> {
        let prev_una = self.snd_una;
        let mut max_ack: Option<u32> = None;

        while !unit.is_empty() {
            let (header, payload, rest) = decode_segment(unit)?;
            unit = rest;

            match self.conv {
                Some(expected) if expected != header.conv => {
                    return Err(ArqError::ConvMismatch {
                        expected,
                        got: header.conv,
                    });
                }
                None => self.conv = Some(header.conv),
                _ => {}
            }

            self.rmt_wnd = header.wnd as u32;
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                CMD_ACK => {
                    let rtt = diff(now, header.ts);
                    if rtt >= 0 {
                        self.update_rtt(rtt as u32);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();
                    max_ack = Some(match max_ack {
                        Some(current) if diff(current, header.sn) > 0 => current,
                        _ => header.sn,
                    });
                }
                CMD_PUSH => {
                    if diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.acklist.push((header.sn, header.ts));
                        if diff(header.sn, self.rcv_nxt) >= 0 {
                            self.rcv_buf
                                .entry(header.sn)
                                .or_insert_with(|| Bytes::copy_from_slice(payload));
                            self.move_to_queue();
                        }
                    }
                }
                CMD_PROBE => self.window_tell = true,
                CMD_WINDOW => {}
                CMD_FIN => self.fin_received = true,
                other => return Err(ArqError::UnknownCommand(other)),
            }
        }

        if let Some(max_ack) = max_ack {
            for seg in self.snd_buf.iter_mut() {
                if diff(max_ack, seg.sn) <= 0 {
                    break;
                }
                seg.fastack += 1;
            }
        }

        if !self.no_congestion && diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr = 0;
            } else {
                self.incr += 1;
                if self.incr >= self.cwnd {
                    self.cwnd += 1;
                    self.incr = 0;
                }
            }
        }

        Ok(())
    }

    /// Produce every unit due at `now`: acks, window updates, new data,
    /// retransmissions and finally FIN
    pub(crate) fn flush(&mut self, now: u32) -> Vec<Vec<u8>> {
        let Some(conv) = self.conv else {
            return Vec::new();
        };
        let wnd = self.unused_wnd();
        let una = self.rcv_nxt;
        let header = |cmd: u8, ts: u32, sn: u32, len: u16| Header {
            conv,
            cmd,
            wnd,
            ts,
            sn,
            una,
            len,
        };
        let mut out = UnitWriter::new(self.unit_limit);

        for (sn, ts) in self.acklist.drain(..) {
            out.push(&header(CMD_ACK, ts, sn, 0), &[]);
        }

        if self.rmt_wnd == 0 {
            match self.probe_at {
                None => self.probe_at = Some(now.wrapping_add(PROBE_INTERVAL)),
                Some(at) if diff(now, at) >= 0 => {
                    self.window_ask = true;
                    self.probe_at = Some(now.wrapping_add(PROBE_INTERVAL));
                }
                Some(_) => {}
            }
        } else {
            self.probe_at = None;
        }

        if diff(now, self.last_output) >= self.keepalive as i32 {
            self.window_tell = true;
        }
        if std::mem::take(&mut self.window_ask) {
            out.push(&header(CMD_PROBE, now, 0, 0), &[]);
        }
        if std::mem::take(&mut self.window_tell) {
            out.push(&header(CMD_WINDOW, now, 0, 0), &[]);
        }

        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if !self.no_congestion {
            cwnd = cwnd.min(self.cwnd);
        }
        while diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(data) = self.snd_queue.pop_front() else {
                break;
            };
            self.snd_buf.push_back(Segment {
                sn: self.snd_nxt,
                resend_at: now,
                rto: self.rx_rto,
                xmit: 0,
                fastack: 0,
                data,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let mut lost = false;
        let mut fast = false;

        for seg in self.snd_buf.iter_mut() {
            let due = if seg.xmit == 0 {
                seg.rto = self.rx_rto;
                true
            } else if diff(now, seg.resend_at) >= 0 {
                seg.rto = (seg.rto + seg.rto / 2).min(RTO_MAX);
                lost = true;
                true
            } else if seg.fastack >= resent {
                seg.fastack = 0;
                fast = true;
                true
            } else {
                false
            };

            if due {
                seg.xmit += 1;
                seg.resend_at = now.wrapping_add(seg.rto);
                out.push(&header(CMD_PUSH, now, seg.sn, seg.data.len() as u16), &seg.data);
                if seg.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        if !self.no_congestion {
            if fast {
                let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
                self.ssthresh = (inflight / 2).max(THRESH_MIN);
                self.cwnd = self.ssthresh + resent;
                self.incr = 0;
            }
            if lost {
                self.ssthresh = (cwnd / 2).max(THRESH_MIN);
                self.cwnd = 1;
                self.incr = 0;
            }
        }

        let mut units = out.finish();

        if self.closing && !self.fin_sent && self.snd_queue.is_empty() && self.snd_buf.is_empty() {
            let mut fin = Vec::with_capacity(SEGMENT_HEADER);
            encode_segment(&mut fin, &header(CMD_FIN, now, self.snd_nxt, 0), &[]);
            // FIN is not retransmitted; a second copy covers a single loss
            units.push(fin.clone());
            units.push(fin);
            self.fin_sent = true;
        }

        if !units.is_empty() {
            self.last_output = now;
        }
        units
    }

    fn unused_wnd(&self) -> u16 {
        self.rcv_wnd.saturating_sub(self.rcv_queue.len() as u32).min(u16::MAX as u32) as u16
    }

    fn update_rtt(&mut self, rtt: u32) {
        let rtt = rtt as i64;
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttvar = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttvar = (3 * self.rx_rttvar + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt + (self.interval as i64).max(4 * self.rx_rttvar);
        self.rx_rto = (rto.max(0) as u32).clamp(RTO_MIN, RTO_MAX);
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if diff(una, front.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_ack(&mut self, sn: u32) {
        if diff(sn, self.snd_una) < 0 || diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        if let Some(index) = self.snd_buf.iter().position(|seg| seg.sn == sn) {
            self.snd_buf.remove(index);
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self.snd_buf.front().map(|seg| seg.sn).unwrap_or(self.snd_nxt);
    }

    fn move_to_queue(&mut self) {
        while self.rcv_queue.len() < self.rcv_wnd as usize {
            match self.rcv_buf.remove(&self.rcv_nxt) {
                Some(data) => {
                    self.rcv_queue.push_back(data);
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: usize = 1200;

    fn pair(config: &ReliableUdpConfig) -> (Arq, Arq) {
        (Arq::new(Some(7), UNIT, config), Arq::new(None, UNIT, config))
    }

    /// One tick in both directions; `keep` decides the fate of each unit
    fn tick(a: &mut Arq, b: &mut Arq, now: u32, keep: &mut impl FnMut() -> bool) {
        for unit in a.flush(now) {
            if keep() {
                b.input(now, &unit).unwrap();
            }
        }
        for unit in b.flush(now) {
            if keep() {
                a.input(now, &unit).unwrap();
            }
        }
    }

    fn drain(arq: &mut Arq, into: &mut Vec<u8>) {
        while let Some(data) = arq.recv() {
            into.extend_from_slice(&data);
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_lossless_delivery_in_order() {
        let config = ReliableUdpConfig::default();
        let (mut client, mut server) = pair(&config);
        let data = payload(50_000);
        client.send(&data);

        let mut received = Vec::new();
        let mut now = 0;
        while received.len() < data.len() && now < 10_000 {
            tick(&mut client, &mut server, now, &mut || true);
            drain(&mut server, &mut received);
            now += 20;
        }

        assert_eq!(received, data);
        assert_eq!(server.conv(), Some(7));
    }

    #[test]
    fn test_recovers_from_heavy_loss() {
        let config = ReliableUdpConfig {
            no_congestion: false,
            ..ReliableUdpConfig::default()
        };
        let (mut client, mut server) = pair(&config);
        let data = payload(20_000);
        client.send(&data);

        // a fifth of all units vanish, in both directions
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let mut lossy = || rng.u8(..) >= 51;

        let mut received = Vec::new();
        let mut now = 0;
        while received.len() < data.len() && now < 120_000 {
            tick(&mut client, &mut server, now, &mut lossy);
            drain(&mut server, &mut received);
            now += 20;
        }

        assert_eq!(received, data);
        assert!(!client.is_dead());
    }

    #[test]
    fn test_silent_peer_kills_link() {
        let config = ReliableUdpConfig {
            dead_link: 5,
            ..ReliableUdpConfig::default()
        };
        let mut client = Arq::new(Some(1), UNIT, &config);
        client.send(b"anyone there?");

        let mut now = 0;
        while !client.is_dead() && now < 600_000 {
            client.flush(now);
            now += 20;
        }

        assert!(client.is_dead());
    }

    #[test]
    fn test_full_receiver_stalls_then_resumes() {
        let config = ReliableUdpConfig {
            snd_wnd: 32,
            rcv_wnd: 4,
            ..ReliableUdpConfig::default()
        };
        let (mut client, mut server) = pair(&config);
        let data = payload(UNIT * 20);
        client.send(&data);

        // receiver never reads: only its window's worth gets through
        for now in (0..2_000).step_by(20) {
            tick(&mut client, &mut server, now, &mut || true);
        }
        assert!(client.pending() > 0);

        let mut received = Vec::new();
        let mut now = 2_000;
        while received.len() < data.len() && now < 60_000 {
            drain(&mut server, &mut received);
            tick(&mut client, &mut server, now, &mut || true);
            now += 20;
        }
        drain(&mut server, &mut received);

        assert_eq!(received, data);
    }

    #[test]
    fn test_foreign_conversation_rejected() {
        let config = ReliableUdpConfig::default();
        let mut a = Arq::new(Some(1), UNIT, &config);
        let mut b = Arq::new(Some(2), UNIT, &config);
        a.send(b"hi");

        let unit = a.flush(0).remove(0);
        assert_eq!(
            b.input(0, &unit),
            Err(ArqError::ConvMismatch { expected: 2, got: 1 })
        );
        assert_eq!(b.input(0, &unit[..5]), Err(ArqError::Truncated));
    }

    #[test]
    fn test_fin_after_data_acknowledged() {
        let config = ReliableUdpConfig::default();
        let (mut client, mut server) = pair(&config);
        client.send(b"last words");
        client.close();

        let mut received = Vec::new();
        let mut now = 0;
        while !server.peer_finished() && now < 5_000 {
            tick(&mut client, &mut server, now, &mut || true);
            drain(&mut server, &mut received);
            now += 20;
        }

        assert!(client.fin_sent());
        assert!(server.peer_finished());
        assert_eq!(received, b"last words");
    }
}
