//! # Reliable Streams (RLDP)
//!
//! Ordered, reliable, multiplexed byte streams carried in the node's
//! unreliable datagrams.
//!
//! ## Frame Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | magic `0x524C` |
//! | 2 | 1 | version |
//! | 3 | 1 | kind |
//! | 4 | 8 | stream id |
//! | 12 | 8 | sequence number |
//! | 20 | 8 | cumulative ack |
//! | 28 | 2 | payload length |
//! | 30 | n | payload |
//! | 30+n | 4 | BLAKE3 prefix over everything before it |
//!
//! A frame whose checksum fails is counted and discarded, exactly as if it
//! had been lost.
//!
//! ## Frame Kinds
//!
//! | Kind | Sequence field | Payload |
//! |------|----------------|---------|
//! | `Open` / `OpenAck` | 0 | empty |
//! | `Data` | frame sequence, from 1 | stream bytes |
//! | `Ack` | 0 | selectively received sequences above the cumulative ack |
//! | `Nack` | 0 | missing sequences the receiver wants resent |
//! | `Close` | final sequence sent | empty |
//! | `CloseAck` | final sequence received | empty |
//! | `Reset` | 0 | empty |
//!
//! ## Stream States
//!
//! ```text
//! Opening ──open-ack──▶ Established ──close──▶ Closing ──close-ack / grace──▶ Closed
//!    │                       │                    │
//!    └───────── reset / retries exhausted ────────┴──────────▶ Aborted
//! ```
//!
//! Close is a full close: the closing side stops reading and writing, the
//! peer receives every byte up to the announced final sequence, acknowledges,
//! then sees end-of-stream on read and `StreamClosed` on write. If the close
//! is not acknowledged within the grace period the stream is closed locally
//! anyway.
//!
//! ## Tasks
//!
//! One dispatcher per manager routes inbound frames. Each established stream
//! has one timer task driving retransmission with exponential backoff,
//! gap-fill requests, close resends and the idle timeout. All of them are
//! spawned through the node and end when it closes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::RldpConfig;
use crate::context::OpContext;
use crate::error::{NetError, Result};
use crate::identity::{Identity, PeerAddress};
use crate::node::{Datagram, Lifecycle, NetworkNode, shutdown_requested};

pub const FRAME_MAGIC: u16 = 0x524C;
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 30;
pub const FRAME_CHECKSUM_LEN: usize = 4;

/// Upper bound on sequence numbers carried in one ACK or NACK payload.
const MAX_SEQ_LIST: usize = 64;

/// Applied to `open` when the caller's context has no deadline.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Frames
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 1,
    OpenAck = 2,
    Data = 3,
    Ack = 4,
    Nack = 5,
    Close = 6,
    CloseAck = 7,
    Reset = 8,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, FrameError> {
        Ok(match value {
            1 => FrameKind::Open,
            2 => FrameKind::OpenAck,
            3 => FrameKind::Data,
            4 => FrameKind::Ack,
            5 => FrameKind::Nack,
            6 => FrameKind::Close,
            7 => FrameKind::CloseAck,
            8 => FrameKind::Reset,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("checksum mismatch")]
    Checksum,
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("payload length does not match frame size")]
    LengthMismatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u64,
    pub seq: u64,
    pub ack: u64,
    pub payload: Vec<u8>,
}

fn checksum(data: &[u8]) -> [u8; FRAME_CHECKSUM_LEN] {
    let hash = blake3::hash(data);
    let mut out = [0u8; FRAME_CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_bytes()[..FRAME_CHECKSUM_LEN]);
    out
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn encode_seq_list(seqs: impl IntoIterator<Item = u64>) -> Vec<u8> {
    seqs.into_iter()
        .take(MAX_SEQ_LIST)
        .flat_map(u64::to_be_bytes)
        .collect()
}

fn decode_seq_list(payload: &[u8]) -> Vec<u64> {
    payload
        .chunks_exact(8)
        .take(MAX_SEQ_LIST)
        .map(|c| read_u64(c, 0))
        .collect()
}

impl Frame {
    fn control(kind: FrameKind, stream_id: u64) -> Self {
        Self {
            kind,
            stream_id,
            seq: 0,
            ack: 0,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len() + FRAME_CHECKSUM_LEN);
        out.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        out.push(FRAME_VERSION);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        let sum = checksum(&out);
        out.extend_from_slice(&sum);
        out
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_LEN + FRAME_CHECKSUM_LEN {
            return Err(FrameError::Truncated);
        }
        let (body, sum) = bytes.split_at(bytes.len() - FRAME_CHECKSUM_LEN);
        if checksum(body) != sum {
            return Err(FrameError::Checksum);
        }
        let magic = read_u16(body, 0);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        if body[2] != FRAME_VERSION {
            return Err(FrameError::BadVersion(body[2]));
        }
        let kind = FrameKind::try_from(body[3])?;
        let len = read_u16(body, 28) as usize;
        if body.len() != FRAME_HEADER_LEN + len {
            return Err(FrameError::LengthMismatch);
        }
        Ok(Self {
            kind,
            stream_id: read_u64(body, 4),
            seq: read_u64(body, 12),
            ack: read_u64(body, 20),
            payload: body[FRAME_HEADER_LEN..].to_vec(),
        })
    }

    /// Stream id of a frame that failed validation, if the header is present.
    fn peek_stream_id(bytes: &[u8]) -> Option<u64> {
        (bytes.len() >= FRAME_HEADER_LEN).then(|| read_u64(bytes, 4))
    }
}

// ============================================================================
// Stream State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Opening,
    Established,
    Closing,
    Closed,
    Aborted,
}

impl StreamPhase {
    fn is_terminal(self) -> bool {
        matches!(self, StreamPhase::Closed | StreamPhase::Aborted)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// DATA frames put on the wire, retransmissions included.
    pub frames_sent: u64,
    pub retransmissions: u64,
    /// DATA frames received more than once.
    pub duplicates: u64,
    pub corrupt_frames: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug)]
struct InFlight {
    payload: Vec<u8>,
    sent_at: Instant,
    rto: Duration,
    retries: u32,
}

#[derive(Debug)]
struct StreamState {
    phase: StreamPhase,
    /// `close` was called or the node shut down.
    local_closed: bool,
    /// The peer closed and every byte up to its final sequence arrived.
    remote_finished: bool,
    last_activity: Instant,

    next_seq: u64,
    unacked: BTreeMap<u64, InFlight>,
    in_flight_bytes: usize,
    close_seq: u64,
    close_started: Instant,
    close_sent_at: Instant,

    next_expected: u64,
    reorder: BTreeMap<u64, Vec<u8>>,
    reorder_bytes: usize,
    readable: VecDeque<u8>,
    /// Highest sequence refused because the receive buffer was full.
    refused_up_to: Option<u64>,
    peer_final: Option<u64>,
    gap_since: Option<Instant>,
    last_nack: Option<Instant>,

    stats: StreamStats,
}

impl StreamState {
    fn new(phase: StreamPhase) -> Self {
        let now = Instant::now();
        Self {
            phase,
            local_closed: false,
            remote_finished: false,
            last_activity: now,
            next_seq: 1,
            unacked: BTreeMap::new(),
            in_flight_bytes: 0,
            close_seq: 0,
            close_started: now,
            close_sent_at: now,
            next_expected: 1,
            reorder: BTreeMap::new(),
            reorder_bytes: 0,
            readable: VecDeque::new(),
            refused_up_to: None,
            peer_final: None,
            gap_since: None,
            last_nack: None,
            stats: StreamStats::default(),
        }
    }

    fn cumulative_ack(&self) -> u64 {
        self.next_expected - 1
    }

    fn ack_frame(&self, stream_id: u64) -> Frame {
        Frame {
            kind: FrameKind::Ack,
            stream_id,
            seq: 0,
            ack: self.cumulative_ack(),
            payload: encode_seq_list(self.reorder.keys().copied()),
        }
    }

    fn data_frame(&self, stream_id: u64, seq: u64, payload: Vec<u8>) -> Frame {
        Frame {
            kind: FrameKind::Data,
            stream_id,
            seq,
            ack: self.cumulative_ack(),
            payload,
        }
    }

    fn abort(&mut self) {
        self.phase = StreamPhase::Aborted;
        self.unacked.clear();
        self.in_flight_bytes = 0;
    }

    fn release(&mut self, seq: u64) {
        if let Some(f) = self.unacked.remove(&seq) {
            self.in_flight_bytes -= f.payload.len();
        }
    }

    fn on_ack(&mut self, cumulative: u64, selective: &[u64]) -> bool {
        let acked: Vec<u64> = self.unacked.range(..=cumulative).map(|(s, _)| *s).collect();
        let before = self.unacked.len();
        for seq in acked {
            self.release(seq);
        }
        for seq in selective {
            self.release(*seq);
        }
        self.unacked.len() != before
    }

    fn buffered(&self) -> usize {
        self.readable.len() + self.reorder_bytes
    }

    /// Peer acknowledged something, so it is alive: outstanding frames get a
    /// fresh retry budget while keeping their backed-off timeout.
    fn peer_responded(&mut self) {
        for f in self.unacked.values_mut() {
            f.retries = 0;
        }
    }

    /// Accept an inbound DATA frame. Returns true if it advanced the stream.
    ///
    /// Frames that would push unread data past the receive buffer limit are
    /// refused without acknowledgement; the next frame in sequence is always
    /// taken once the reader has drained everything.
    fn on_data(&mut self, seq: u64, payload: Vec<u8>, cfg: &RldpConfig, now: Instant) -> bool {
        if seq < self.next_expected || self.reorder.contains_key(&seq) {
            self.stats.duplicates += 1;
            return false;
        }
        if seq >= self.next_expected + cfg.recv_window {
            trace!(seq, next = self.next_expected, "data beyond receive window");
            return false;
        }
        let fits = self.buffered() + payload.len() <= cfg.recv_buffer_limit()
            || (seq == self.next_expected && self.readable.is_empty());
        if !fits {
            trace!(seq, buffered = self.buffered(), "receive buffer full, refusing data");
            self.refused_up_to = Some(self.refused_up_to.map_or(seq, |r| r.max(seq)));
            return false;
        }
        self.stats.bytes_received += payload.len() as u64;
        if seq == self.next_expected {
            self.readable.extend(payload);
            self.next_expected += 1;
            while let Some(next) = self.reorder.remove(&self.next_expected) {
                self.reorder_bytes -= next.len();
                self.readable.extend(next);
                self.next_expected += 1;
            }
        } else {
            self.reorder_bytes += payload.len();
            self.reorder.insert(seq, payload);
        }
        if self.reorder.is_empty() {
            self.gap_since = None;
            self.last_nack = None;
        } else if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
        true
    }

    /// Completes the peer's close once every announced byte has arrived.
    fn finish_remote(&mut self, stream_id: u64) -> Option<Frame> {
        let final_seq = self.peer_final?;
        if self.cumulative_ack() < final_seq {
            return None;
        }
        self.remote_finished = true;
        self.unacked.clear();
        self.in_flight_bytes = 0;
        if self.phase == StreamPhase::Established {
            self.phase = StreamPhase::Closed;
        }
        Some(Frame {
            kind: FrameKind::CloseAck,
            stream_id,
            seq: final_seq,
            ack: self.cumulative_ack(),
            payload: Vec::new(),
        })
    }

    /// After a read, ask for refused frames again once half the buffer is free.
    fn resume_refused(&mut self, stream_id: u64, cfg: &RldpConfig) -> Option<Frame> {
        let refused = self.refused_up_to?;
        if self.buffered() > cfg.recv_buffer_limit() / 2 && !self.readable.is_empty() {
            return None;
        }
        self.refused_up_to = None;
        let wanted: Vec<u64> = (self.next_expected..=refused)
            .filter(|s| !self.reorder.contains_key(s))
            .take(MAX_SEQ_LIST)
            .collect();
        if wanted.is_empty() {
            return None;
        }
        trace!(stream_id, frames = wanted.len(), "receive buffer drained, requesting refused data");
        Some(Frame {
            kind: FrameKind::Nack,
            stream_id,
            seq: 0,
            ack: self.cumulative_ack(),
            payload: encode_seq_list(wanted),
        })
    }

    fn missing(&self) -> Vec<u64> {
        let Some(&highest) = self.reorder.keys().next_back() else {
            return Vec::new();
        };
        (self.next_expected..highest)
            .filter(|s| !self.reorder.contains_key(s))
            .take(MAX_SEQ_LIST)
            .collect()
    }

    /// Timer work due at `now`.
    fn on_tick(&mut self, now: Instant, cfg: &RldpConfig, stream_id: u64) -> Vec<Frame> {
        let mut out = Vec::new();
        if self.phase.is_terminal() || self.phase == StreamPhase::Opening {
            return out;
        }

        let ack = self.cumulative_ack();
        let mut exhausted = false;
        for (seq, f) in self.unacked.iter_mut() {
            if now < f.sent_at + f.rto {
                continue;
            }
            if f.retries >= cfg.max_retries {
                exhausted = true;
                break;
            }
            f.retries += 1;
            f.rto = (f.rto * 2).min(cfg.max_rto);
            f.sent_at = now;
            self.stats.retransmissions += 1;
            self.stats.frames_sent += 1;
            out.push(Frame {
                kind: FrameKind::Data,
                stream_id,
                seq: *seq,
                ack,
                payload: f.payload.clone(),
            });
        }
        if exhausted {
            warn!(stream_id, retries = cfg.max_retries, "retransmission budget exhausted, aborting stream");
            self.abort();
            return vec![Frame::control(FrameKind::Reset, stream_id)];
        }

        if let Some(since) = self.gap_since {
            let due = now >= since + cfg.gap_fill_timeout
                && self.last_nack.is_none_or(|t| now >= t + cfg.gap_fill_timeout);
            if due {
                let missing = self.missing();
                if !missing.is_empty() {
                    trace!(stream_id, missing = missing.len(), "requesting gap fill");
                    out.push(Frame {
                        kind: FrameKind::Nack,
                        stream_id,
                        seq: 0,
                        ack,
                        payload: encode_seq_list(missing),
                    });
                }
                self.last_nack = Some(now);
            }
        }

        if self.phase == StreamPhase::Closing {
            if now >= self.close_started + cfg.close_grace {
                debug!(stream_id, "close not acknowledged within grace period, closing locally");
                self.phase = StreamPhase::Closed;
                self.unacked.clear();
                self.in_flight_bytes = 0;
                return out;
            }
            if now >= self.close_sent_at + cfg.initial_rto {
                self.close_sent_at = now;
                out.push(Frame {
                    kind: FrameKind::Close,
                    stream_id,
                    seq: self.close_seq,
                    ack,
                    payload: Vec::new(),
                });
            }
        }

        if now >= self.last_activity + cfg.idle_timeout {
            debug!(stream_id, "stream idle, closing");
            self.phase = StreamPhase::Closed;
            self.local_closed = true;
            self.unacked.clear();
            self.in_flight_bytes = 0;
            out.push(Frame::control(FrameKind::Reset, stream_id));
        }
        out
    }

    fn next_deadline(&self, cfg: &RldpConfig) -> Instant {
        let mut next = self.last_activity + cfg.idle_timeout;
        for f in self.unacked.values() {
            next = next.min(f.sent_at + f.rto);
        }
        if let Some(since) = self.gap_since {
            let base = self.last_nack.map_or(since, |t| t.max(since));
            next = next.min(base + cfg.gap_fill_timeout);
        }
        if self.phase == StreamPhase::Closing {
            next = next
                .min(self.close_sent_at + cfg.initial_rto)
                .min(self.close_started + cfg.close_grace);
        }
        next
    }
}

type StreamKey = (Identity, u64);

struct StreamShared {
    id: u64,
    peer: PeerAddress,
    initiator: bool,
    state: StdMutex<StreamState>,
    /// Bumped on every state change readers or writers may wait for.
    changes: watch::Sender<u64>,
    timer: Notify,
}

impl StreamShared {
    fn new(id: u64, peer: PeerAddress, initiator: bool) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            id,
            peer,
            initiator,
            state: StdMutex::new(StreamState::new(StreamPhase::Opening)),
            changes,
            timer: Notify::new(),
        }
    }

    fn key(&self) -> StreamKey {
        (self.peer.peer_id, self.id)
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn changed(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
        self.timer.notify_one();
    }

    /// Stop the stream because the node or manager is going away.
    fn terminate(&self) {
        {
            let mut st = self.lock();
            st.local_closed = true;
            if !st.phase.is_terminal() {
                st.phase = StreamPhase::Closed;
            }
        }
        self.changed();
    }
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub streams: usize,
    /// Frames discarded because their checksum failed.
    pub corrupt_frames: u64,
}

struct ManagerShared {
    node: Arc<dyn NetworkNode>,
    config: RldpConfig,
    lifecycle: Lifecycle,
    streams: RwLock<HashMap<StreamKey, Arc<StreamShared>>>,
    accept_tx: mpsc::Sender<Arc<StreamShared>>,
    accept_rx: Mutex<mpsc::Receiver<Arc<StreamShared>>>,
    corrupt_frames: AtomicU64,
}

/// Opens, accepts and demultiplexes streams over one node.
#[derive(Clone)]
pub struct RldpManager {
    inner: Arc<ManagerShared>,
}

impl RldpManager {
    pub fn new(node: Arc<dyn NetworkNode>, config: RldpConfig) -> Result<Self> {
        config.validate()?;
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        Ok(Self {
            inner: Arc::new(ManagerShared {
                node,
                config,
                lifecycle: Lifecycle::new(),
                streams: RwLock::new(HashMap::new()),
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
                corrupt_frames: AtomicU64::new(0),
            }),
        })
    }

    /// Claim the node's datagram queue and start routing frames. Idempotent.
    pub async fn start(&self, ctx: &OpContext) -> Result<()> {
        ctx.check()?;
        if !self.inner.lifecycle.begin_start()? {
            return Ok(());
        }
        let Some(datagrams) = self.inner.node.take_datagrams().await else {
            self.inner.lifecycle.abort_start();
            return Err(NetError::AlreadyExists(
                "datagram queue claimed by another consumer".into(),
            ));
        };
        let dispatcher = self.inner.clone().run_dispatcher(datagrams);
        if let Err(e) = self.inner.node.spawn(Box::pin(dispatcher)) {
            self.inner.lifecycle.abort_start();
            return Err(e);
        }
        info!(peer = %self.inner.node.peer_id().fingerprint(), "rldp started");
        Ok(())
    }

    /// Reset every open stream and stop routing. Idempotent.
    pub async fn close(&self, ctx: &OpContext) -> Result<()> {
        if !self.inner.lifecycle.begin_close() {
            return Ok(());
        }
        self.inner.lifecycle.shutdown(ctx).await;
        let streams: Vec<Arc<StreamShared>> =
            self.inner.streams.write().await.drain().map(|(_, s)| s).collect();
        for stream in &streams {
            let live = !stream.lock().phase.is_terminal();
            if live {
                self.inner
                    .send(&stream.peer, &Frame::control(FrameKind::Reset, stream.id))
                    .await;
            }
            stream.terminate();
        }
        info!(streams = streams.len(), "rldp closed");
        Ok(())
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            streams: self.inner.streams.read().await.len(),
            corrupt_frames: self.inner.corrupt_frames.load(Ordering::Relaxed),
        }
    }

    /// Resolve `peer_id` and open a stream to it.
    pub async fn open(&self, ctx: &OpContext, peer_id: &Identity) -> Result<RldpStream> {
        self.inner.lifecycle.ensure_running()?;
        let ctx = open_context(ctx);
        let peer = self.inner.node.find_peer(&ctx, peer_id).await?;
        self.open_addr(&ctx, peer).await
    }

    /// Open a stream to a known address. Fails with `OpenTimeout` if the
    /// peer does not acknowledge before the deadline.
    pub async fn open_addr(&self, ctx: &OpContext, peer: PeerAddress) -> Result<RldpStream> {
        self.inner.lifecycle.ensure_running()?;
        ctx.check()?;
        let ctx = open_context(ctx);

        let stream = Arc::new(StreamShared::new(rand::random(), peer, true));
        self.inner
            .streams
            .write()
            .await
            .insert(stream.key(), stream.clone());
        let open = Frame::control(FrameKind::Open, stream.id);
        let mut shutdown = self.inner.node.shutdown_signal();

        loop {
            let changes = stream.changes.subscribe();
            let phase = stream.lock().phase;
            match phase {
                StreamPhase::Opening => {}
                StreamPhase::Aborted => {
                    self.inner.forget(&stream).await;
                    debug!(peer = %stream.peer, "open refused");
                    return Err(NetError::StreamBroken);
                }
                _ => break,
            }
            if *shutdown.borrow() {
                self.inner.forget(&stream).await;
                return Err(NetError::Closed);
            }

            self.inner.send(&stream.peer, &open).await;
            let attempt = ctx.child_timeout(self.inner.config.open_retry_interval);
            match wait_for_change(&attempt, changes, &mut shutdown).await {
                Ok(()) => {}
                Err(NetError::Timeout) if ctx.check().is_ok() => {}
                Err(e) => {
                    self.inner.forget(&stream).await;
                    self.inner
                        .send(&stream.peer, &Frame::control(FrameKind::Reset, stream.id))
                        .await;
                    return Err(match e {
                        NetError::Timeout => NetError::OpenTimeout,
                        other => other,
                    });
                }
            }
        }

        self.inner.spawn_timer(&stream).await?;
        debug!(peer = %stream.peer, stream_id = stream.id, "stream opened");
        Ok(RldpStream {
            shared: stream,
            manager: self.inner.clone(),
        })
    }

    /// Wait for an inbound stream and complete its handshake.
    pub async fn accept(&self, ctx: &OpContext) -> Result<RldpStream> {
        self.inner.lifecycle.ensure_running()?;
        let mut queue = ctx.run(async { Ok(self.inner.accept_rx.lock().await) }).await?;
        let mut node_shutdown = self.inner.node.shutdown_signal();
        let mut own_shutdown = self.inner.lifecycle.shutdown_signal();

        loop {
            let next = ctx
                .run(async {
                    tokio::select! {
                        stream = queue.recv() => stream.ok_or(NetError::Closed),
                        _ = shutdown_requested(&mut node_shutdown) => Err(NetError::Closed),
                        _ = shutdown_requested(&mut own_shutdown) => Err(NetError::Closed),
                    }
                })
                .await?;

            let ready = {
                let mut st = next.lock();
                if st.phase == StreamPhase::Opening {
                    st.phase = StreamPhase::Established;
                    st.last_activity = Instant::now();
                    true
                } else {
                    false
                }
            };
            if !ready {
                self.inner.forget(&next).await;
                continue;
            }

            self.inner
                .send(&next.peer, &Frame::control(FrameKind::OpenAck, next.id))
                .await;
            next.changed();
            self.inner.spawn_timer(&next).await?;
            debug!(peer = %next.peer, stream_id = next.id, "stream accepted");
            return Ok(RldpStream {
                shared: next,
                manager: self.inner.clone(),
            });
        }
    }
}

impl fmt::Debug for RldpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RldpManager")
            .field("phase", &self.inner.lifecycle.phase())
            .finish_non_exhaustive()
    }
}

fn open_context(ctx: &OpContext) -> OpContext {
    match ctx.deadline() {
        Some(_) => ctx.clone(),
        None => ctx.child_timeout(DEFAULT_OPEN_TIMEOUT),
    }
}

/// Wait until `changes` moves, the node shuts down or `ctx` ends.
async fn wait_for_change(
    ctx: &OpContext,
    mut changes: watch::Receiver<u64>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    ctx.run(async {
        tokio::select! {
            _ = changes.changed() => {}
            _ = shutdown_requested(shutdown) => {}
        }
        Ok(())
    })
    .await
}

impl ManagerShared {
    async fn send(&self, peer: &PeerAddress, frame: &Frame) {
        if let Err(e) = self.node.send_datagram(peer, frame.encode()).await {
            trace!(peer = %peer, kind = ?frame.kind, error = %e, "frame not sent");
        }
    }

    async fn send_all(&self, peer: &PeerAddress, frames: &[Frame]) {
        for frame in frames {
            self.send(peer, frame).await;
        }
    }

    async fn forget(&self, stream: &Arc<StreamShared>) {
        let mut streams = self.streams.write().await;
        if streams
            .get(&stream.key())
            .is_some_and(|s| Arc::ptr_eq(s, stream))
        {
            streams.remove(&stream.key());
        }
    }

    async fn spawn_timer(self: &Arc<Self>, stream: &Arc<StreamShared>) -> Result<()> {
        let task = self.clone().run_timer(stream.clone());
        if let Err(e) = self.node.spawn(Box::pin(task)) {
            stream.terminate();
            self.forget(stream).await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_timer(self: Arc<Self>, stream: Arc<StreamShared>) {
        let mut node_shutdown = self.node.shutdown_signal();
        let mut own_shutdown = self.lifecycle.shutdown_signal();
        loop {
            let (outbox, next, done) = {
                let mut st = stream.lock();
                let before = (st.phase, st.unacked.len());
                let outbox = st.on_tick(Instant::now(), &self.config, stream.id);
                let moved = before != (st.phase, st.unacked.len());
                (
                    outbox,
                    st.next_deadline(&self.config),
                    (st.phase.is_terminal(), moved),
                )
            };
            self.send_all(&stream.peer, &outbox).await;
            let (terminal, moved) = done;
            if moved {
                stream.changes.send_modify(|v| *v = v.wrapping_add(1));
            }
            if terminal {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = stream.timer.notified() => {}
                _ = shutdown_requested(&mut node_shutdown) => {
                    stream.terminate();
                    break;
                }
                _ = shutdown_requested(&mut own_shutdown) => {
                    stream.terminate();
                    break;
                }
            }
        }
        self.forget(&stream).await;
        trace!(stream_id = stream.id, "stream timer stopped");
    }

    async fn run_dispatcher(self: Arc<Self>, mut datagrams: mpsc::Receiver<Datagram>) {
        let mut node_shutdown = self.node.shutdown_signal();
        let mut own_shutdown = self.lifecycle.shutdown_signal();
        loop {
            let datagram = tokio::select! {
                _ = shutdown_requested(&mut node_shutdown) => break,
                _ = shutdown_requested(&mut own_shutdown) => break,
                datagram = datagrams.recv() => match datagram {
                    Some(d) => d,
                    None => break,
                },
            };
            self.handle_datagram(datagram).await;
        }

        let streams: Vec<Arc<StreamShared>> =
            self.streams.write().await.drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.terminate();
        }
        trace!("rldp dispatcher stopped");
    }

    async fn handle_datagram(&self, datagram: Datagram) {
        let Datagram { from, payload } = datagram;
        let frame = match Frame::decode(&payload) {
            Ok(frame) => frame,
            Err(FrameError::Checksum) => {
                self.corrupt_frames.fetch_add(1, Ordering::Relaxed);
                if let Some(id) = Frame::peek_stream_id(&payload) {
                    let stream = self.streams.read().await.get(&(from.peer_id, id)).cloned();
                    if let Some(stream) = stream {
                        stream.lock().stats.corrupt_frames += 1;
                    }
                }
                trace!(peer = %from, "discarding corrupt frame");
                return;
            }
            Err(e) => {
                debug!(peer = %from, error = %e, "discarding undecodable frame");
                return;
            }
        };

        let stream = self
            .streams
            .read()
            .await
            .get(&(from.peer_id, frame.stream_id))
            .cloned();
        match stream {
            Some(stream) => self.on_stream_frame(&stream, frame).await,
            None => self.on_unknown_stream(&from, frame).await,
        }
    }

    async fn on_unknown_stream(&self, from: &PeerAddress, frame: Frame) {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Open => {
                let stream = Arc::new(StreamShared::new(id, from.clone(), false));
                self.streams
                    .write()
                    .await
                    .insert(stream.key(), stream.clone());
                if self.accept_tx.try_send(stream.clone()).is_err() {
                    debug!(peer = %from, stream_id = id, "accept backlog full, refusing stream");
                    self.forget(&stream).await;
                    self.send(from, &Frame::control(FrameKind::Reset, id)).await;
                    return;
                }
                trace!(peer = %from, stream_id = id, "inbound stream queued");
            }
            FrameKind::Data | FrameKind::OpenAck => {
                self.send(from, &Frame::control(FrameKind::Reset, id)).await;
            }
            FrameKind::Close => {
                // Everything was already acknowledged before this side let go.
                let ack = Frame {
                    kind: FrameKind::CloseAck,
                    stream_id: id,
                    seq: frame.seq,
                    ack: frame.seq,
                    payload: Vec::new(),
                };
                self.send(from, &ack).await;
            }
            FrameKind::Ack | FrameKind::Nack | FrameKind::CloseAck | FrameKind::Reset => {
                trace!(peer = %from, stream_id = id, kind = ?frame.kind, "frame for unknown stream");
            }
        }
    }

    async fn on_stream_frame(&self, stream: &Arc<StreamShared>, frame: Frame) {
        let now = Instant::now();
        let mut replies = Vec::new();
        let mut changed = false;
        let mut forget = false;
        {
            let mut st = stream.lock();
            st.last_activity = now;
            match frame.kind {
                FrameKind::Open => {
                    if !stream.initiator && st.phase != StreamPhase::Opening {
                        replies.push(Frame::control(FrameKind::OpenAck, stream.id));
                    }
                }
                FrameKind::OpenAck => {
                    if stream.initiator && st.phase == StreamPhase::Opening {
                        st.phase = StreamPhase::Established;
                        changed = true;
                    }
                }
                FrameKind::Data => {
                    if stream.initiator && st.phase == StreamPhase::Opening {
                        // The open-ack was lost; data proves the peer accepted.
                        st.phase = StreamPhase::Established;
                        changed = true;
                    }
                    if st.phase == StreamPhase::Opening || st.phase == StreamPhase::Aborted {
                        trace!(stream_id = stream.id, "data before stream is ready");
                    } else {
                        changed |= st.on_ack(frame.ack, &[]);
                        let was_finished = st.remote_finished;
                        changed |= st.on_data(frame.seq, frame.payload, &self.config, now);
                        replies.push(st.ack_frame(stream.id));
                        if !was_finished {
                            if let Some(close_ack) = st.finish_remote(stream.id) {
                                replies.push(close_ack);
                                changed = true;
                            }
                        }
                    }
                }
                FrameKind::Ack => {
                    changed |= st.on_ack(frame.ack, &decode_seq_list(&frame.payload));
                    st.peer_responded();
                }
                FrameKind::Nack => {
                    changed |= st.on_ack(frame.ack, &[]);
                    let ack = st.cumulative_ack();
                    let mut resend = Vec::new();
                    for seq in decode_seq_list(&frame.payload) {
                        if let Some(f) = st.unacked.get_mut(&seq) {
                            f.sent_at = now;
                            resend.push((seq, f.payload.clone()));
                        }
                    }
                    for (seq, payload) in resend {
                        st.stats.retransmissions += 1;
                        st.stats.frames_sent += 1;
                        replies.push(Frame {
                            kind: FrameKind::Data,
                            stream_id: stream.id,
                            seq,
                            ack,
                            payload,
                        });
                    }
                }
                FrameKind::Close => {
                    if !st.phase.is_terminal() || st.remote_finished {
                        st.peer_final = Some(frame.seq);
                        if let Some(close_ack) = st.finish_remote(stream.id) {
                            replies.push(close_ack);
                            changed = true;
                        }
                    }
                }
                FrameKind::CloseAck => {
                    if st.phase == StreamPhase::Closing {
                        st.phase = StreamPhase::Closed;
                        st.unacked.clear();
                        st.in_flight_bytes = 0;
                        changed = true;
                    }
                }
                FrameKind::Reset => {
                    if !st.phase.is_terminal() {
                        debug!(peer = %stream.peer, stream_id = stream.id, "stream reset by peer");
                        forget = st.phase == StreamPhase::Opening && !stream.initiator;
                        st.abort();
                        changed = true;
                    }
                }
            }
        }

        self.send_all(&stream.peer, &replies).await;
        if changed {
            stream.changed();
        }
        if forget {
            self.forget(stream).await;
        }
    }
}

// ============================================================================
// Stream Handle
// ============================================================================

pub struct RldpStream {
    shared: Arc<StreamShared>,
    manager: Arc<ManagerShared>,
}

impl RldpStream {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.shared.peer
    }

    pub fn is_initiator(&self) -> bool {
        self.shared.initiator
    }

    pub fn phase(&self) -> StreamPhase {
        self.shared.lock().phase
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.lock().stats
    }

    fn shutting_down(&self) -> bool {
        *self.manager.node.shutdown_signal().borrow()
    }

    async fn wait(&self, ctx: &OpContext, changes: watch::Receiver<u64>) -> Result<()> {
        let mut shutdown = self.manager.node.shutdown_signal();
        wait_for_change(ctx, changes, &mut shutdown).await
    }

    /// Queue all of `data` for delivery, waiting for window space as needed.
    /// Returns once every byte is in flight, not once it is acknowledged.
    pub async fn write(&self, ctx: &OpContext, data: &[u8]) -> Result<()> {
        let cfg = &self.manager.config;
        for chunk in data.chunks(cfg.max_frame_payload) {
            let frame = loop {
                let changes = self.shared.changes.subscribe();
                {
                    let mut st = self.shared.lock();
                    if st.phase == StreamPhase::Aborted {
                        return Err(NetError::StreamBroken);
                    }
                    if st.local_closed || st.remote_finished || st.phase.is_terminal() {
                        return Err(NetError::StreamClosed);
                    }
                    let fits = st.in_flight_bytes == 0
                        || st.in_flight_bytes + chunk.len() <= cfg.send_window;
                    if fits {
                        let seq = st.next_seq;
                        st.next_seq += 1;
                        st.unacked.insert(
                            seq,
                            InFlight {
                                payload: chunk.to_vec(),
                                sent_at: Instant::now(),
                                rto: cfg.initial_rto,
                                retries: 0,
                            },
                        );
                        st.in_flight_bytes += chunk.len();
                        st.stats.frames_sent += 1;
                        st.stats.bytes_sent += chunk.len() as u64;
                        st.last_activity = Instant::now();
                        break st.data_frame(self.shared.id, seq, chunk.to_vec());
                    }
                }
                if self.shutting_down() {
                    return Err(NetError::StreamClosed);
                }
                self.wait(ctx, changes).await?;
            };
            self.manager.send(&self.shared.peer, &frame).await;
            self.shared.timer.notify_one();
        }
        Ok(())
    }

    /// Wait until everything written so far has been acknowledged.
    pub async fn flush(&self, ctx: &OpContext) -> Result<()> {
        loop {
            let changes = self.shared.changes.subscribe();
            {
                let st = self.shared.lock();
                if st.phase == StreamPhase::Aborted {
                    return Err(NetError::StreamBroken);
                }
                if st.unacked.is_empty() {
                    return Ok(());
                }
                if st.local_closed && st.phase.is_terminal() {
                    return Err(NetError::StreamClosed);
                }
            }
            if self.shutting_down() {
                return Err(NetError::StreamClosed);
            }
            self.wait(ctx, changes).await?;
        }
    }

    /// Read available bytes into `buf`. Returns `Ok(0)` at end of stream.
    pub async fn read(&self, ctx: &OpContext, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let changes = self.shared.changes.subscribe();
            let taken = {
                let mut st = self.shared.lock();
                if st.phase == StreamPhase::Aborted {
                    return Err(NetError::StreamBroken);
                }
                if st.local_closed {
                    return Err(NetError::StreamClosed);
                }
                if !st.readable.is_empty() {
                    let n = buf.len().min(st.readable.len());
                    for (slot, byte) in buf.iter_mut().zip(st.readable.drain(..n)) {
                        *slot = byte;
                    }
                    Some((n, st.resume_refused(self.shared.id, &self.manager.config)))
                } else if st.remote_finished {
                    return Ok(0);
                } else {
                    None
                }
            };
            if let Some((n, resume)) = taken {
                if let Some(nack) = resume {
                    self.manager.send(&self.shared.peer, &nack).await;
                }
                return Ok(n);
            }
            if self.shutting_down() {
                return Err(NetError::StreamClosed);
            }
            self.wait(ctx, changes).await?;
        }
    }

    /// Read until the peer closes the stream.
    pub async fn read_to_end(&self, ctx: &OpContext) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; self.manager.config.max_frame_payload.max(1024)];
        loop {
            let n = self.read(ctx, &mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Close the stream. Succeeds whether or not the peer acknowledges
    /// within the grace period. Idempotent.
    pub async fn close(&self, ctx: &OpContext) -> Result<()> {
        let frame = {
            let mut st = self.shared.lock();
            st.local_closed = true;
            match st.phase {
                StreamPhase::Closed | StreamPhase::Aborted => None,
                StreamPhase::Closing => None,
                StreamPhase::Opening | StreamPhase::Established => {
                    let now = Instant::now();
                    st.phase = StreamPhase::Closing;
                    st.close_seq = st.next_seq - 1;
                    st.close_started = now;
                    st.close_sent_at = now;
                    Some(Frame {
                        kind: FrameKind::Close,
                        stream_id: self.shared.id,
                        seq: st.close_seq,
                        ack: st.cumulative_ack(),
                        payload: Vec::new(),
                    })
                }
            }
        };
        if let Some(frame) = frame {
            debug!(stream_id = self.shared.id, final_seq = frame.seq, "closing stream");
            self.manager.send(&self.shared.peer, &frame).await;
            self.shared.changed();
        }

        loop {
            let changes = self.shared.changes.subscribe();
            if self.phase().is_terminal() || self.shutting_down() {
                return Ok(());
            }
            self.wait(ctx, changes).await?;
        }
    }
}

impl fmt::Debug for RldpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RldpStream")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer.peer_id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u64, payload: &[u8]) -> Frame {
        Frame {
            kind: FrameKind::Data,
            stream_id: 7,
            seq,
            ack: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn frame_encoding_matches_layout() {
        let frame = data(3, b"abc");
        let bytes = frame.encode();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + 3 + FRAME_CHECKSUM_LEN);
        assert_eq!(&bytes[..2], &FRAME_MAGIC.to_be_bytes());
        assert_eq!(bytes[3], FrameKind::Data as u8);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
        assert_eq!(Frame::peek_stream_id(&bytes), Some(7));
    }

    #[test]
    fn corrupted_frames_fail_checksum() {
        let bytes = data(1, b"payload").encode();
        for idx in [0, 5, FRAME_HEADER_LEN + 2, bytes.len() - 1] {
            let mut corrupt = bytes.clone();
            corrupt[idx] ^= 0x01;
            assert_eq!(Frame::decode(&corrupt), Err(FrameError::Checksum));
        }
        assert_eq!(Frame::decode(&bytes[..10]), Err(FrameError::Truncated));
    }

    #[test]
    fn reorder_buffer_delivers_in_sequence() {
        let cfg = RldpConfig { recv_window: 16, ..RldpConfig::default() };
        let mut st = StreamState::new(StreamPhase::Established);
        let now = Instant::now();
        assert!(st.on_data(1, b"a".to_vec(), &cfg, now));
        assert!(st.on_data(3, b"c".to_vec(), &cfg, now));
        assert_eq!(st.readable.iter().copied().collect::<Vec<_>>(), b"a");
        assert_eq!(st.missing(), vec![2]);
        assert!(st.gap_since.is_some());

        assert!(st.on_data(2, b"b".to_vec(), &cfg, now));
        assert_eq!(st.readable.iter().copied().collect::<Vec<_>>(), b"abc");
        assert!(st.gap_since.is_none());
        assert_eq!(st.cumulative_ack(), 3);

        assert!(!st.on_data(2, b"b".to_vec(), &cfg, now));
        assert_eq!(st.stats.duplicates, 1);
        assert!(!st.on_data(100, b"z".to_vec(), &cfg, now));
    }

    #[test]
    fn selective_and_cumulative_acks_release_window() {
        let mut st = StreamState::new(StreamPhase::Established);
        for seq in 1..=4 {
            st.unacked.insert(
                seq,
                InFlight {
                    payload: vec![0; 10],
                    sent_at: Instant::now(),
                    rto: Duration::from_millis(10),
                    retries: 0,
                },
            );
        }
        st.in_flight_bytes = 40;
        assert!(st.on_ack(1, &[3]));
        assert_eq!(st.unacked.keys().copied().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(st.in_flight_bytes, 20);
        assert!(!st.on_ack(1, &[]));
    }

    #[tokio::test]
    async fn retransmits_with_backoff_then_aborts() {
        let cfg = RldpConfig {
            initial_rto: Duration::from_millis(10),
            max_rto: Duration::from_millis(25),
            max_retries: 2,
            ..RldpConfig::default()
        };
        let mut st = StreamState::new(StreamPhase::Established);
        let start = Instant::now();
        st.unacked.insert(
            1,
            InFlight {
                payload: b"x".to_vec(),
                sent_at: start,
                rto: cfg.initial_rto,
                retries: 0,
            },
        );
        st.in_flight_bytes = 1;

        assert!(st.on_tick(start, &cfg, 1).is_empty());
        let first = st.on_tick(start + Duration::from_millis(10), &cfg, 1);
        assert_eq!(first.len(), 1);
        assert_eq!(st.unacked[&1].rto, Duration::from_millis(20));

        let second = st.on_tick(start + Duration::from_millis(30), &cfg, 1);
        assert_eq!(second.len(), 1);
        assert_eq!(st.unacked[&1].rto, Duration::from_millis(25));
        assert_eq!(st.stats.retransmissions, 2);

        let last = st.on_tick(start + Duration::from_millis(60), &cfg, 1);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].kind, FrameKind::Reset);
        assert_eq!(st.phase, StreamPhase::Aborted);
    }

    #[test]
    fn full_receive_buffer_refuses_then_resumes() {
        let cfg = RldpConfig {
            max_frame_payload: 4,
            recv_window: 4,
            ..RldpConfig::default()
        };
        let mut st = StreamState::new(StreamPhase::Established);
        let now = Instant::now();
        for seq in 1..=4 {
            assert!(st.on_data(seq, b"abcd".to_vec(), &cfg, now));
        }
        assert_eq!(st.buffered(), 16);
        assert!(!st.on_data(5, b"efgh".to_vec(), &cfg, now));
        assert!(!st.on_data(6, b"ijkl".to_vec(), &cfg, now));
        assert_eq!(st.cumulative_ack(), 4);
        assert_eq!(st.stats.bytes_received, 16);
        assert_eq!(st.stats.duplicates, 0);

        // Still mostly full: no resend request yet.
        st.readable.drain(..4);
        assert!(st.resume_refused(1, &cfg).is_none());

        st.readable.drain(..8);
        let nack = st.resume_refused(1, &cfg).unwrap();
        assert_eq!(nack.kind, FrameKind::Nack);
        assert_eq!(decode_seq_list(&nack.payload), vec![5, 6]);
        assert!(st.resume_refused(1, &cfg).is_none());
        assert!(st.on_data(5, b"efgh".to_vec(), &cfg, now));
    }

    #[test]
    fn acks_renew_the_retry_budget() {
        let mut st = StreamState::new(StreamPhase::Established);
        st.unacked.insert(
            1,
            InFlight {
                payload: b"x".to_vec(),
                sent_at: Instant::now(),
                rto: Duration::from_millis(80),
                retries: 5,
            },
        );
        st.in_flight_bytes = 1;
        assert!(!st.on_ack(0, &[]));
        st.peer_responded();
        assert_eq!(st.unacked[&1].retries, 0);
        assert_eq!(st.unacked[&1].rto, Duration::from_millis(80));
    }

    #[test]
    fn idle_stream_resets_its_peer() {
        let cfg = RldpConfig {
            idle_timeout: Duration::from_millis(50),
            ..RldpConfig::default()
        };
        let mut st = StreamState::new(StreamPhase::Established);
        let start = st.last_activity;
        assert!(st.on_tick(start + Duration::from_millis(10), &cfg, 3).is_empty());

        let out = st.on_tick(start + Duration::from_millis(60), &cfg, 3);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FrameKind::Reset);
        assert_eq!(st.phase, StreamPhase::Closed);
        assert!(st.local_closed);
    }

    #[test]
    fn peer_close_waits_for_missing_data() {
        let cfg = RldpConfig::default();
        let mut st = StreamState::new(StreamPhase::Established);
        let now = Instant::now();
        st.on_data(1, b"a".to_vec(), &cfg, now);
        st.peer_final = Some(2);
        assert!(st.finish_remote(9).is_none());
        assert!(!st.remote_finished);

        st.on_data(2, b"b".to_vec(), &cfg, now);
        let ack = st.finish_remote(9).unwrap();
        assert_eq!(ack.kind, FrameKind::CloseAck);
        assert_eq!(ack.seq, 2);
        assert!(st.remote_finished);
        assert_eq!(st.phase, StreamPhase::Closed);
    }
}
