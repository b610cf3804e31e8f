//! # Reliable ordered streams
//!
//! [`ReliableStream`] turns one unordered, lossy [`Channel`] into a
//! reliable, ordered byte stream: writes are split into sequenced
//! fragments, the receiver reports gaps immediately via negative
//! acknowledgement, a periodic heartbeat acknowledges progress, and the
//! sender keeps a congestion window over its in-flight fragments.
//!
//! Each stream is driven by its own task. Handle methods marshal
//! commands to the driver and await a reply, so `read`/`write` block
//! cooperatively on window state without any shared locks.
//!
//! ## Window rules
//!
//! - Window starts at one fragment. While in startup, every clean ack
//!   grows it by ×1.5, capped by the peer's advertised receive window;
//!   after startup, growth is +1 per clean ack.
//! - Any negative acknowledgement shrinks it once per heartbeat period
//!   (25% during startup, 10% after) and ends startup for good. The
//!   floor is one fragment.
//! - Nacked fragments are retransmitted selectively, at most once per
//!   ack round-trip each.
//!
//! A stream with no inbound traffic at all for the dead-peer window is
//! torn down and every blocked caller observes a closed error.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::seq::{GapSet, Seq};
use crate::wire::{StreamFrame, MAX_FRAGMENT_LEN};

/// Heartbeat period: acks are emitted this often while unacknowledged
/// received data exists.
pub const HEARTBEAT: Duration = Duration::from_millis(100);

/// Dead-peer window: the stream is torn down when nothing at all has
/// arrived for this long.
pub const DEAD_PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive window capacity, in fragments.
const RX_WINDOW_FRAGMENTS: u16 = 256;

/// Multiplicative growth factor during startup.
const STARTUP_GROWTH: f64 = 1.5;

/// Window shrink on loss during startup.
const STARTUP_SHRINK: f64 = 0.25;

/// Window shrink on loss after startup.
const STEADY_SHRINK: f64 = 0.10;

/// Floor for the retransmission throttle and the stall probe when no
/// RTT sample exists yet.
const MIN_RTO_MS: u64 = 300;

/// Commands a handle marshals onto the stream driver.
enum StreamCmd {
    Write {
        data: Bytes,
        reply: oneshot::Sender<Result<usize>>,
    },
    Read {
        max: usize,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Close,
}

/// Inbound traffic, forwarded off the channel by a helper task.
/// `None` marks the channel as gone.
type Inbound = Option<Bytes>;

/// Reliable, ordered byte stream over one channel.
///
/// Cloning shares the stream; closing through any handle (or losing the
/// underlying channel) unblocks all pending reads and writes with a
/// closed error.
#[derive(Clone)]
pub struct ReliableStream {
    cmd_tx: mpsc::Sender<StreamCmd>,
}

impl ReliableStream {
    pub fn new(channel: Channel) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (net_tx, net_rx) = mpsc::channel::<Inbound>(256);

        let receiver = channel.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(bytes) => {
                        if net_tx.send(Some(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = net_tx.send(None).await;
                        return;
                    }
                }
            }
        });

        let driver = Driver::new(channel);
        tokio::spawn(driver.run(cmd_rx, net_rx));
        Self { cmd_tx }
    }

    /// Queue `data` for delivery and wait until every fragment of it has
    /// entered the send window. Returns the number of bytes written.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCmd::Write {
                data: Bytes::copy_from_slice(data),
                reply,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Wait for in-order data and copy up to `buf.len()` bytes of it.
    /// Returns the number of bytes read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCmd::Read {
                max: buf.len(),
                reply,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;
        let bytes = rx.await.map_err(|_| Error::ChannelClosed)??;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Send a close frame, tear the stream down and release the channel.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(StreamCmd::Close).await;
    }
}

struct PendingWrite {
    fragments: VecDeque<Bytes>,
    total: usize,
    reply: oneshot::Sender<Result<usize>>,
}

struct InFlight {
    seq: Seq,
    payload: Bytes,
    sent_at_ms: u64,
    last_send_ms: u64,
    resent: bool,
}

struct Driver {
    channel: Channel,
    epoch: Instant,

    // Transmit side.
    next_seq: Seq,
    flight: VecDeque<InFlight>,
    writes: VecDeque<PendingWrite>,
    cwnd: f64,
    startup: bool,
    peer_rx_win: u16,
    last_shrink_ms: Option<u64>,
    last_tx_progress_ms: u64,
    srtt_ms: Option<f64>,

    // Receive side. `rx_win_start` is the first sequence the reader has
    // not consumed yet; `rx_win_end` the next expected sequence.
    rx_win_start: Seq,
    rx_win_end: Seq,
    buffered: HashMap<u16, Bytes>,
    /// Remainder of a partially consumed fragment; its sequence has
    /// already been released from the window.
    partial: Option<Bytes>,
    gaps: GapSet,
    reads: VecDeque<(usize, oneshot::Sender<Result<Bytes>>)>,
    pending_ack: bool,

    last_packet: Instant,
}

impl Driver {
    fn new(channel: Channel) -> Self {
        let now = Instant::now();
        Self {
            channel,
            epoch: now,
            next_seq: Seq::ZERO,
            flight: VecDeque::new(),
            writes: VecDeque::new(),
            cwnd: 1.0,
            startup: true,
            peer_rx_win: RX_WINDOW_FRAGMENTS,
            last_shrink_ms: None,
            last_tx_progress_ms: 0,
            srtt_ms: None,
            rx_win_start: Seq::ZERO,
            rx_win_end: Seq::ZERO,
            buffered: HashMap::new(),
            partial: None,
            gaps: GapSet::new(),
            reads: VecDeque::new(),
            pending_ack: false,
            last_packet: now,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<StreamCmd>,
        mut net_rx: mpsc::Receiver<Inbound>,
    ) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let step: Result<()> = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(StreamCmd::Write { data, reply }) => self.handle_write(data, reply).await,
                    Some(StreamCmd::Read { max, reply }) => {
                        self.handle_read(max, reply);
                        Ok(())
                    }
                    Some(StreamCmd::Close) | None => {
                        let _ = self.channel.send(StreamFrame::Close.encode()).await;
                        Err(Error::ChannelClosed)
                    }
                },
                delivery = net_rx.recv() => match delivery {
                    Some(Some(bytes)) => self.handle_frame(&bytes).await,
                    Some(None) | None => Err(Error::ChannelClosed),
                },
                _ = heartbeat.tick() => {
                    if self.last_packet.elapsed() >= DEAD_PEER_TIMEOUT {
                        debug!(
                            endpoint = %self.channel.peer_endpoint(),
                            "dead peer: no packet within timeout, tearing stream down"
                        );
                        Err(Error::ChannelClosed)
                    } else {
                        self.heartbeat_tick().await
                    }
                }
            };
            if step.is_err() {
                self.teardown().await;
                return;
            }
        }
    }

    async fn teardown(&mut self) {
        for (_, reply) in self.reads.drain(..) {
            let _ = reply.send(Err(Error::ChannelClosed));
        }
        for write in self.writes.drain(..) {
            let _ = write.reply.send(Err(Error::ChannelClosed));
        }
        self.channel.close().await;
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_write(&mut self, data: Bytes, reply: oneshot::Sender<Result<usize>>) -> Result<()> {
        if data.is_empty() {
            let _ = reply.send(Ok(0));
            return Ok(());
        }
        let total = data.len();
        let mut fragments = VecDeque::new();
        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(MAX_FRAGMENT_LEN);
            fragments.push_back(rest.split_to(take));
        }
        self.writes.push_back(PendingWrite {
            fragments,
            total,
            reply,
        });
        self.pump_writes().await
    }

    fn handle_read(&mut self, max: usize, reply: oneshot::Sender<Result<Bytes>>) {
        self.reads.push_back((max, reply));
        self.serve_reads();
    }

    fn readable(&self) -> bool {
        self.partial.is_some() || self.buffered.contains_key(&self.rx_win_start.raw())
    }

    /// Consume up to `max` in-order bytes, advancing the window start
    /// fragment by fragment.
    fn take_readable(&mut self, max: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(max.min(4 * MAX_FRAGMENT_LEN));
        while out.len() < max {
            let mut chunk = match self.partial.take() {
                Some(chunk) => chunk,
                None => match self.buffered.remove(&self.rx_win_start.raw()) {
                    Some(fragment) => {
                        self.rx_win_start = self.rx_win_start.next();
                        fragment
                    }
                    None => break,
                },
            };
            let take = chunk.len().min(max - out.len());
            out.extend_from_slice(&chunk.split_to(take));
            if !chunk.is_empty() {
                self.partial = Some(chunk);
            }
        }
        self.gaps.remove_before(self.rx_win_start);
        out.freeze()
    }

    fn serve_reads(&mut self) {
        while self.readable() {
            let Some((max, reply)) = self.reads.pop_front() else {
                return;
            };
            let chunk = self.take_readable(max);
            let _ = reply.send(Ok(chunk));
        }
    }

    // ------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------

    fn window_limit(&self) -> usize {
        let cwnd = self.cwnd.max(1.0) as usize;
        cwnd.min(self.peer_rx_win.max(1) as usize)
    }

    /// Move fragments from queued writes into the flight window while
    /// space remains; complete writes whose fragments are all in flight.
    async fn pump_writes(&mut self) -> Result<()> {
        loop {
            let Some(write) = self.writes.front_mut() else {
                return Ok(());
            };
            if write.fragments.is_empty() {
                let write = self.writes.pop_front().expect("front exists");
                let _ = write.reply.send(Ok(write.total));
                continue;
            }
            if self.flight.len() >= self.window_limit() {
                return Ok(());
            }
            let payload = self
                .writes
                .front_mut()
                .and_then(|w| w.fragments.pop_front())
                .expect("fragment exists");
            let seq = self.next_seq;
            self.next_seq = self.next_seq.next();
            let now = self.now_ms();
            let frame = StreamFrame::Data {
                rx_win_start: self.rx_win_start,
                seq,
                payload: payload.clone(),
            };
            self.channel
                .send(frame.encode())
                .await
                .map_err(|_| Error::ChannelClosed)?;
            self.flight.push_back(InFlight {
                seq,
                payload,
                sent_at_ms: now,
                last_send_ms: now,
                resent: false,
            });
        }
    }

    fn rto_ms(&self) -> u64 {
        match self.srtt_ms {
            Some(srtt) => (srtt * 2.0) as u64,
            None => MIN_RTO_MS,
        }
        .max(MIN_RTO_MS)
    }

    fn throttle_ms(&self) -> u64 {
        self.srtt_ms.map(|s| s as u64).unwrap_or(MIN_RTO_MS).max(1)
    }

    fn record_rtt(&mut self, sample_ms: u64) {
        const ALPHA: f64 = 0.3;
        let sample = sample_ms as f64;
        self.srtt_ms = Some(match self.srtt_ms {
            Some(srtt) => ALPHA * sample + (1.0 - ALPHA) * srtt,
            None => sample,
        });
    }

    /// Drop every in-flight fragment the peer has confirmed: everything
    /// its window start has consumed, plus (for full acks) everything
    /// before its window end that is not inside a reported gap.
    fn prune_flight(&mut self, peer_win_start: Seq, peer_win_end: Option<Seq>, gaps: &[(Seq, Seq)]) {
        let now = self.now_ms();
        let mut progressed = false;
        let mut rtt_sample = None;
        self.flight.retain(|f| {
            let consumed = f.seq.precedes(peer_win_start);
            let acked = match peer_win_end {
                Some(end) => {
                    f.seq.precedes(end)
                        && !gaps
                            .iter()
                            .any(|&(s, e)| !f.seq.precedes(s) && !e.precedes(f.seq))
                }
                None => false,
            };
            if consumed || acked {
                progressed = true;
                if !f.resent {
                    rtt_sample = Some(now.saturating_sub(f.sent_at_ms));
                }
                false
            } else {
                true
            }
        });
        if progressed {
            self.last_tx_progress_ms = now;
        }
        if let Some(sample) = rtt_sample {
            self.record_rtt(sample);
        }
    }

    fn grow_window(&mut self) {
        let cap = self.peer_rx_win.max(1) as f64;
        if self.startup {
            self.cwnd = (self.cwnd * STARTUP_GROWTH).min(cap);
        } else {
            self.cwnd = (self.cwnd + 1.0).min(cap);
        }
    }

    /// Loss signal: shrink at most once per heartbeat period and leave
    /// startup permanently.
    fn shrink_window(&mut self) {
        let now = self.now_ms();
        let due = match self.last_shrink_ms {
            Some(last) => now.saturating_sub(last) >= HEARTBEAT.as_millis() as u64,
            None => true,
        };
        if due {
            let rate = if self.startup {
                STARTUP_SHRINK
            } else {
                STEADY_SHRINK
            };
            self.cwnd = (self.cwnd * (1.0 - rate)).max(1.0);
            self.last_shrink_ms = Some(now);
        }
        self.startup = false;
    }

    /// Re-send the in-flight fragments inside `range`, honoring the
    /// one-resend-per-round-trip throttle.
    async fn retransmit_range(&mut self, range: (Seq, Seq)) -> Result<()> {
        let now = self.now_ms();
        let throttle = self.throttle_ms();
        let rx_win_start = self.rx_win_start;
        let mut frames = Vec::new();
        for f in self.flight.iter_mut() {
            let in_range = !f.seq.precedes(range.0) && !range.1.precedes(f.seq);
            if in_range && now.saturating_sub(f.last_send_ms) >= throttle {
                f.last_send_ms = now;
                f.resent = true;
                frames.push(StreamFrame::Data {
                    rx_win_start,
                    seq: f.seq,
                    payload: f.payload.clone(),
                });
            }
        }
        for frame in frames {
            self.channel
                .send(frame.encode())
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }
        Ok(())
    }

    /// Stall probe: when nothing has been confirmed for a full
    /// retransmission timeout, re-send the oldest unacked fragment so a
    /// fully lost window still recovers (the receiver cannot nack what
    /// it never saw).
    async fn probe_stalled_flight(&mut self) -> Result<()> {
        let rto = self.rto_ms();
        let now = self.now_ms();
        let rx_win_start = self.rx_win_start;
        let frame = match self.flight.front_mut() {
            Some(oldest)
                if now.saturating_sub(self.last_tx_progress_ms) >= rto
                    && now.saturating_sub(oldest.last_send_ms) >= rto =>
            {
                oldest.last_send_ms = now;
                oldest.resent = true;
                trace!(seq = oldest.seq.raw(), "probing stalled flight");
                StreamFrame::Data {
                    rx_win_start,
                    seq: oldest.seq,
                    payload: oldest.payload.clone(),
                }
            }
            _ => return Ok(()),
        };
        self.channel
            .send(frame.encode())
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    async fn handle_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.last_packet = Instant::now();
        let frame = match StreamFrame::decode(payload) {
            Ok(frame) => frame,
            Err(_) => {
                trace!("dropping undecodable stream frame");
                return Ok(());
            }
        };
        match frame {
            StreamFrame::Data {
                rx_win_start: peer_win_start,
                seq,
                payload,
            } => {
                self.prune_flight(peer_win_start, None, &[]);
                self.accept_fragment(seq, payload).await?;
                self.pump_writes().await?;
            }
            StreamFrame::Ack {
                rx_win_start,
                rx_win_size,
                rx_win_end,
                ack_seq: _,
                timestamp_ms,
                gaps,
            } => {
                self.peer_rx_win = rx_win_size.max(1);
                self.prune_flight(rx_win_start, Some(rx_win_end), &gaps);
                if gaps.is_empty() {
                    self.grow_window();
                } else {
                    self.shrink_window();
                    for range in gaps {
                        self.retransmit_range(range).await?;
                    }
                }
                // Confirm so the peer's heartbeat can stop.
                self.channel
                    .send(StreamFrame::AckAck { timestamp_ms }.encode())
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
                self.pump_writes().await?;
            }
            StreamFrame::AckAck { timestamp_ms } => {
                self.pending_ack = false;
                let rtt = self.now_ms().saturating_sub(timestamp_ms);
                self.record_rtt(rtt);
            }
            StreamFrame::Nack {
                rx_win_start,
                range,
            } => {
                self.prune_flight(rx_win_start, None, &[]);
                self.shrink_window();
                self.retransmit_range(range).await?;
                self.pump_writes().await?;
            }
            StreamFrame::Close => {
                return Err(Error::ChannelClosed);
            }
        }
        Ok(())
    }

    async fn accept_fragment(&mut self, seq: Seq, payload: Bytes) -> Result<()> {
        // Behind the window: already consumed, silent drop (but the lost
        // ack that caused the re-send wants refreshing).
        if seq.precedes(self.rx_win_start) {
            self.pending_ack = true;
            return Ok(());
        }
        // Too far ahead for our advertised window: flow violation, drop.
        if i32::from(self.rx_win_start.delta(seq)) >= i32::from(RX_WINDOW_FRAGMENTS) {
            return Ok(());
        }
        if self.buffered.contains_key(&seq.raw()) {
            // Duplicate of a buffered fragment.
            self.pending_ack = true;
            return Ok(());
        }

        if seq == self.rx_win_end {
            // Exactly extends the contiguous window.
            self.buffered.insert(seq.raw(), payload);
            self.rx_win_end = self.rx_win_end.next();
        } else if self.rx_win_end.precedes(seq) {
            // Creates a gap: record it and report it immediately rather
            // than waiting for the next heartbeat.
            let gap = (self.rx_win_end, Seq(seq.raw().wrapping_sub(1)));
            self.gaps.add(gap.0, gap.1);
            self.buffered.insert(seq.raw(), payload);
            self.rx_win_end = seq.next();
            let nack = StreamFrame::Nack {
                rx_win_start: self.rx_win_start,
                range: gap,
            };
            self.channel
                .send(nack.encode())
                .await
                .map_err(|_| Error::ChannelClosed)?;
        } else {
            // Fills (part of) a known gap.
            self.gaps.remove(seq);
            self.buffered.insert(seq.raw(), payload);
        }

        self.pending_ack = true;
        self.serve_reads();
        Ok(())
    }

    async fn heartbeat_tick(&mut self) -> Result<()> {
        if self.pending_ack {
            let in_window = self.rx_win_start.delta(self.rx_win_end).max(0) as u16;
            let ack = StreamFrame::Ack {
                rx_win_start: self.rx_win_start,
                rx_win_size: RX_WINDOW_FRAGMENTS.saturating_sub(in_window).max(1),
                rx_win_end: self.rx_win_end,
                ack_seq: Seq(self.rx_win_end.raw().wrapping_sub(1)),
                timestamp_ms: self.now_ms(),
                gaps: self.gaps.ranges().to_vec(),
            };
            self.channel
                .send(ack.encode())
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }
        self.probe_stalled_flight().await?;
        self.pump_writes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelEvent, ChannelOp};
    use crate::identity::{NodeId, ID_LEN};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tokio::time::timeout;

    /// Wire two channel handles together through an in-process link with
    /// an injected loss rate. Close ops propagate as closed events on
    /// the peer side.
    fn linked_pair(loss_rate: f64, seed: u64) -> (Channel, Channel) {
        let (ops_a_tx, ops_a_rx) = mpsc::channel(1024);
        let (ops_b_tx, ops_b_rx) = mpsc::channel(1024);
        let id_a = NodeId::from_bytes([1u8; ID_LEN]);
        let id_b = NodeId::from_bytes([2u8; ID_LEN]);
        let (chan_a, events_a_tx) =
            Channel::new("127.0.0.1:9001".parse().unwrap(), id_b, (10, 20), ops_a_tx);
        let (chan_b, events_b_tx) =
            Channel::new("127.0.0.1:9002".parse().unwrap(), id_a, (20, 10), ops_b_tx);

        tokio::spawn(pump(ops_a_rx, events_b_tx, loss_rate, seed));
        tokio::spawn(pump(ops_b_rx, events_a_tx, loss_rate, seed.wrapping_add(1)));
        (chan_a, chan_b)
    }

    async fn pump(
        mut ops: mpsc::Receiver<ChannelOp>,
        peer_events: mpsc::Sender<ChannelEvent>,
        loss_rate: f64,
        seed: u64,
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        while let Some(op) = ops.recv().await {
            match op {
                ChannelOp::Send { payload, .. } => {
                    if rng.gen::<f64>() < loss_rate {
                        continue;
                    }
                    if peer_events.send(ChannelEvent::Data(payload)).await.is_err() {
                        return;
                    }
                }
                ChannelOp::Close { .. } => {
                    let _ = peer_events.send(ChannelEvent::Closed).await;
                    return;
                }
            }
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn read_exact(stream: &ReliableStream, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut buf = vec![0u8; 4096];
        while out.len() < len {
            let n = stream.read(&mut buf).await.expect("read");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lossless_transfer_preserves_bytes_and_order() {
        let (chan_a, chan_b) = linked_pair(0.0, 7);
        let writer = ReliableStream::new(chan_a);
        let reader = ReliableStream::new(chan_b);

        let data = pattern(10_000);
        let expected = data.clone();
        let write = tokio::spawn(async move { writer.write(&data).await });

        let got = timeout(Duration::from_secs(10), read_exact(&reader, expected.len()))
            .await
            .expect("transfer finishes");
        assert_eq!(got, expected);
        assert_eq!(write.await.unwrap().unwrap(), expected.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transfer_survives_heavy_loss_without_duplication() {
        let (chan_a, chan_b) = linked_pair(0.3, 42);
        let writer = ReliableStream::new(chan_a);
        let reader = ReliableStream::new(chan_b);

        let data = pattern(20_000);
        let expected = data.clone();
        let writer_clone = writer.clone();
        let write = tokio::spawn(async move { writer_clone.write(&data).await });

        let got = timeout(Duration::from_secs(60), read_exact(&reader, expected.len()))
            .await
            .expect("retransmission converges");
        // Exact bytes, in order, nothing delivered twice.
        assert_eq!(got, expected);

        write.await.unwrap().unwrap();

        // No stray extra bytes follow the transfer.
        let reader_clone = reader.clone();
        let extra = timeout(Duration::from_millis(300), async move {
            let mut buf = [0u8; 64];
            reader_clone.read(&mut buf).await
        })
        .await;
        assert!(extra.is_err(), "no bytes should remain after the transfer");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_unblocks_pending_read() {
        let (chan_a, chan_b) = linked_pair(0.0, 3);
        let writer = ReliableStream::new(chan_a);
        let reader = ReliableStream::new(chan_b);

        let reader_clone = reader.clone();
        let blocked = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader_clone.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.close().await;

        let result = timeout(Duration::from_secs(2), blocked)
            .await
            .expect("close propagates")
            .unwrap();
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_peer_tears_stream_down() {
        // A channel wired to nothing: no traffic ever arrives.
        let (ops_tx, _ops_rx) = mpsc::channel(8);
        let (chan, _events_tx) = Channel::new(
            "127.0.0.1:9009".parse().unwrap(),
            NodeId::from_bytes([9u8; ID_LEN]),
            (1, 2),
            ops_tx,
        );
        let stream = ReliableStream::new(chan);

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let result = timeout(
            DEAD_PEER_TIMEOUT + Duration::from_secs(2),
            stream.read(&mut buf),
        )
        .await
        .expect("dead-peer detection fires");
        assert!(matches!(result, Err(Error::ChannelClosed)));
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
