//! # Peer Session
//!
//! One persistent TCP conversation with a remote peer. A session passes
//! through NEW → HANDSHAKING → OPEN → CLOSING → CLOSED; CLOSED is
//! absorbing and reconnection always builds a fresh session.
//!
//! An open session runs three tasks:
//! - a **reader** that decodes one frame per line and either answers it
//!   (PING/PONG, BYE, malformed input) or hands it to the router;
//! - a **writer** that drains a bounded outbound queue, so a slow peer
//!   never blocks the reader; queue overflow surfaces `busy` to the
//!   caller without touching the session;
//! - a **keep-alive timer** that sends a PING every interval and closes
//!   the session after three intervals with no matching PONG.
//!
//! RTT samples come from the PING→PONG round-trip, measured against a
//! local nonce → send-instant map so remote clocks never enter the math,
//! and are folded into the peer table's moving average.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::identity::PeerId;
use crate::peer_table::PeerTable;
use crate::wire::{decode_frame, write_frame, ErrorCode, Frame, LineError, LineReader};

/// Both HELLO legs must complete within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded capacity of the per-session outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Keep-alive intervals without a PONG before the session dies.
pub const MAX_MISSED_PINGS: u32 = 3;

/// Best-effort budget for draining the closing BYE.
const BYE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Malformed frames tolerated within [`BAD_FORMAT_WINDOW`] before closing.
const BAD_FORMAT_LIMIT: usize = 3;
const BAD_FORMAT_WINDOW: Duration = Duration::from_secs(10);

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("IN"),
            Direction::Outbound => f.write_str("OUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local decision (shutdown or explicit close).
    Local(String),
    /// Lost the duplicate-session tie-break.
    Duplicate,
    /// Remote sent BYE.
    RemoteBye(String),
    /// Remote closed the socket or I/O failed.
    Io(String),
    KeepaliveTimeout,
    /// Remote violated the protocol (overlong line, repeated bad frames).
    Protocol(ErrorCode),
}

impl CloseReason {
    /// True when the reconnect scheduler should back off and retry.
    pub fn is_graceful(&self) -> bool {
        matches!(self, CloseReason::Local(_) | CloseReason::Duplicate | CloseReason::RemoteBye(_))
    }

    /// Reason string for the closing BYE, when one is owed.
    fn bye_reason(&self) -> Option<&str> {
        match self {
            CloseReason::Local(reason) => Some(reason),
            CloseReason::Duplicate => Some("duplicate"),
            CloseReason::KeepaliveTimeout => Some("keepalive"),
            CloseReason::Protocol(_) => Some("protocol_error"),
            // The remote already left; nobody is reading.
            CloseReason::RemoteBye(_) | CloseReason::Io(_) => None,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local(reason) => write!(f, "local close ({})", reason),
            CloseReason::Duplicate => write!(f, "duplicate session"),
            CloseReason::RemoteBye(reason) => write!(f, "remote bye ({})", reason),
            CloseReason::Io(detail) => write!(f, "connection lost ({})", detail),
            CloseReason::KeepaliveTimeout => write!(f, "keepalive timeout"),
            CloseReason::Protocol(code) => write!(f, "protocol error ({})", code),
        }
    }
}

/// Writer-queue submission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Outbound queue full; the session stays open.
    Busy,
    Closed,
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Busy => f.write_str("outbound queue full"),
            WriteError::Closed => f.write_str("session closed"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Notification to the orchestrator when a session reaches CLOSED.
#[derive(Debug, Clone)]
pub struct SessionClosed {
    pub peer: PeerId,
    pub direction: Direction,
    pub reason: CloseReason,
}

/// Inbound frame handed to the router, tagged with the session it
/// arrived on.
#[derive(Debug)]
pub struct InboundFrame {
    pub from: PeerId,
    pub frame: Frame,
}

struct Shared {
    state: Mutex<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    close_tx: watch::Sender<bool>,
    outstanding_pings: AtomicU32,
    pending_pings: Mutex<HashMap<u64, Instant>>,
}

impl Shared {
    /// First close wins; later reasons are ignored.
    fn initiate_close(&self, reason: CloseReason) {
        let mut guard = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Closing;
            let _ = self.close_tx.send(true);
        }
    }

    fn reason(&self) -> CloseReason {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or(CloseReason::Io("unknown".into()))
    }
}

/// Open sessions keyed by remote identity. Owned by the orchestrator;
/// the router reads it through this narrow shared accessor.
pub type SessionMap = Arc<Mutex<HashMap<PeerId, SessionHandle>>>;

/// Cheap-to-clone handle over one OPEN session.
#[derive(Clone)]
pub struct SessionHandle {
    peer: PeerId,
    direction: Direction,
    features: Arc<Vec<String>>,
    outbound: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Features both endpoints advertised.
    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Queue a frame for transmission. Frames submitted in order are
    /// transmitted in order; a full queue returns [`WriteError::Busy`]
    /// without affecting the session.
    pub fn try_send(&self, frame: Frame) -> Result<(), WriteError> {
        if !self.is_open() {
            return Err(WriteError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WriteError::Busy,
            mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
        })
    }

    /// Begin CLOSING: the writer drains a best-effort BYE, both halves
    /// shut down, and the orchestrator is notified once CLOSED.
    pub fn close(&self, reason: CloseReason) {
        self.shared.initiate_close(reason);
    }
}

#[cfg(test)]
impl SessionHandle {
    /// Channel-backed handle with no socket behind it, for router tests.
    /// The returned receiver is the "wire": frames the router writes to
    /// this session show up there.
    pub(crate) fn stub(
        peer: PeerId,
        direction: Direction,
        capacity: usize,
    ) -> (SessionHandle, mpsc::Receiver<Frame>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (close_tx, _close_rx) = watch::channel(false);
        let handle = SessionHandle {
            peer,
            direction,
            features: Arc::new(Vec::new()),
            outbound: outbound_tx,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Open),
                close_reason: Mutex::new(None),
                close_tx,
                outstanding_pings: AtomicU32::new(0),
                pending_pings: Mutex::new(HashMap::new()),
            }),
        };
        (handle, outbound_rx)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionHandle({} {})", self.peer, self.direction)
    }
}

/// A connection that completed the HELLO exchange but is not yet running
/// its reader/writer tasks.
pub struct Established {
    pub peer: PeerId,
    pub features: Vec<String>,
    pub direction: Direction,
    reader: LineReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Established {
    /// Dial `addr` and run the initiator side of the handshake.
    pub async fn connect(
        addr: &str,
        local: &PeerId,
        local_features: &[String],
    ) -> Result<Established> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("connect timed out")?
            .with_context(|| format!("cannot connect to {}", addr))?;
        stream.set_nodelay(true).ok();
        let (read, mut write) = stream.into_split();
        let mut reader = LineReader::new(read);

        write_frame(
            &mut write,
            &Frame::Hello {
                identity: local.clone(),
                features: local_features.to_vec(),
            },
        )
        .await
        .context("cannot send HELLO")?;

        let line = timeout(HANDSHAKE_TIMEOUT, reader.next_line())
            .await
            .context("handshake timed out")?
            .context("connection closed during handshake")?;
        match decode_frame(&line).context("malformed handshake reply")? {
            Frame::HelloOk { identity, features } => {
                if &identity == local {
                    bail!("peer claims our own identity");
                }
                Ok(Established {
                    peer: identity,
                    features: intersect(local_features, &features),
                    direction: Direction::Outbound,
                    reader,
                    writer: write,
                })
            }
            Frame::Error { code, detail, .. } => {
                bail!("peer refused handshake: {} {}", code, detail.unwrap_or_default())
            }
            other => bail!("expected HELLO_OK, got {}", other.kind()),
        }
    }

    /// Run the responder side of the handshake on an accepted socket.
    pub async fn accept(
        stream: TcpStream,
        local: &PeerId,
        local_features: &[String],
    ) -> Result<Established> {
        stream.set_nodelay(true).ok();
        let (read, mut write) = stream.into_split();
        let mut reader = LineReader::new(read);

        let line = timeout(HANDSHAKE_TIMEOUT, reader.next_line())
            .await
            .context("handshake timed out")?
            .context("connection closed during handshake")?;
        let (identity, features) = match decode_frame(&line) {
            Ok(Frame::Hello { identity, features }) => (identity, features),
            Ok(other) => {
                let _ = write_frame(&mut write, &Frame::error(ErrorCode::BadFormat)).await;
                bail!("expected HELLO, got {}", other.kind());
            }
            Err(_) => {
                let _ = write_frame(&mut write, &Frame::error(ErrorCode::BadFormat)).await;
                bail!("malformed HELLO");
            }
        };
        if &identity == local {
            let _ = write_frame(&mut write, &Frame::error(ErrorCode::BadFormat)).await;
            bail!("peer claims our own identity");
        }

        write_frame(
            &mut write,
            &Frame::HelloOk {
                identity: local.clone(),
                features: local_features.to_vec(),
            },
        )
        .await
        .context("cannot send HELLO_OK")?;

        Ok(Established {
            peer: identity,
            features: intersect(local_features, &features),
            direction: Direction::Inbound,
            reader,
            writer: write,
        })
    }

    /// Decline an established connection before starting it: drain a BYE
    /// and drop the socket. Used for surplus inbound sessions (duplicate
    /// tie-break losers, session cap).
    pub async fn refuse(mut self, reason: &str) {
        let bye = Frame::Bye { reason: reason.to_string() };
        let _ = timeout(BYE_DRAIN_TIMEOUT, write_frame(&mut self.writer, &bye)).await;
        let _ = self.writer.shutdown().await;
    }

    /// Spawn the reader, writer, and keep-alive tasks and hand back the
    /// session handle. `closed_tx` fires exactly once, when the session
    /// reaches CLOSED.
    pub fn start(
        self,
        ping_interval: Duration,
        peer_table: Arc<PeerTable>,
        inbound_tx: mpsc::Sender<InboundFrame>,
        closed_tx: mpsc::Sender<SessionClosed>,
    ) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Open),
            close_reason: Mutex::new(None),
            close_tx,
            outstanding_pings: AtomicU32::new(0),
            pending_pings: Mutex::new(HashMap::new()),
        });

        let handle = SessionHandle {
            peer: self.peer.clone(),
            direction: self.direction,
            features: Arc::new(self.features),
            outbound: outbound_tx,
            shared: shared.clone(),
        };

        let reader_task = tokio::spawn(run_reader(
            self.reader,
            handle.clone(),
            peer_table,
            inbound_tx,
            close_rx.clone(),
        ));
        let writer_task = tokio::spawn(run_writer(self.writer, outbound_rx, shared.clone(), close_rx.clone()));
        let keepalive_task = tokio::spawn(run_keepalive(handle.clone(), ping_interval, close_rx));

        // Supervisor: wait for all activities, then report CLOSED.
        let peer = self.peer;
        let direction = self.direction;
        tokio::spawn(async move {
            let _ = reader_task.await;
            let _ = writer_task.await;
            let _ = keepalive_task.await;
            *shared.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Closed;
            let reason = shared.reason();
            debug!(peer = %peer, %direction, %reason, "session closed");
            let _ = closed_tx
                .send(SessionClosed { peer, direction, reason })
                .await;
        });

        handle
    }
}

fn intersect(ours: &[String], theirs: &[String]) -> Vec<String> {
    ours.iter().filter(|f| theirs.contains(f)).cloned().collect()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn run_reader(
    mut reader: LineReader<OwnedReadHalf>,
    handle: SessionHandle,
    peer_table: Arc<PeerTable>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut offenses: VecDeque<Instant> = VecDeque::new();
    loop {
        let line = tokio::select! {
            line = reader.next_line() => line,
            _ = close_rx.changed() => return,
        };
        let line = match line {
            Ok(line) => line,
            Err(LineError::TooLong) => {
                warn!(peer = %handle.peer, "frame exceeds line cap, closing");
                let _ = handle.try_send(Frame::line_too_long());
                handle.shared.initiate_close(CloseReason::Protocol(ErrorCode::LineTooLong));
                return;
            }
            Err(LineError::Eof) => {
                handle.shared.initiate_close(CloseReason::Io("peer closed connection".into()));
                return;
            }
            Err(LineError::Io(e)) => {
                handle.shared.initiate_close(CloseReason::Io(e.to_string()));
                return;
            }
        };

        let frame = match decode_frame(&line) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(peer = %handle.peer, error = %e, "undecodable frame");
                let now = Instant::now();
                offenses.push_back(now);
                while let Some(front) = offenses.front() {
                    if now.duration_since(*front) > BAD_FORMAT_WINDOW {
                        offenses.pop_front();
                    } else {
                        break;
                    }
                }
                let _ = handle.try_send(Frame::error(ErrorCode::BadFormat));
                if offenses.len() >= BAD_FORMAT_LIMIT {
                    warn!(peer = %handle.peer, "repeated malformed frames, closing");
                    handle.shared.initiate_close(CloseReason::Protocol(ErrorCode::BadFormat));
                    return;
                }
                continue;
            }
        };

        match frame {
            Frame::Ping { nonce, .. } => {
                if handle.try_send(Frame::Pong { nonce }).is_err() {
                    debug!(peer = %handle.peer, "PONG dropped, outbound queue full");
                }
            }
            Frame::Pong { nonce } => {
                let sent_at = handle
                    .shared
                    .pending_pings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&nonce);
                match sent_at {
                    Some(sent_at) => {
                        handle.shared.outstanding_pings.store(0, Ordering::Relaxed);
                        let sample = sent_at.elapsed();
                        trace!(peer = %handle.peer, rtt_ms = sample.as_millis() as u64, "keep-alive sample");
                        peer_table.record_rtt(&handle.peer, sample);
                    }
                    None => {
                        trace!(peer = %handle.peer, nonce, "PONG with unknown nonce");
                    }
                }
            }
            Frame::Bye { reason } => {
                handle.shared.initiate_close(CloseReason::RemoteBye(reason));
                return;
            }
            Frame::Hello { .. } | Frame::HelloOk { .. } => {
                // Handshake already done on this connection.
                warn!(peer = %handle.peer, kind = frame.kind(), "unexpected handshake frame, ignoring");
            }
            other => {
                if inbound_tx
                    .send(InboundFrame { from: handle.peer.clone(), frame: other })
                    .await
                    .is_err()
                {
                    // Router is gone; the client is shutting down.
                    handle.shared.initiate_close(CloseReason::Local("shutdown".into()));
                    return;
                }
            }
        }
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    shared.initiate_close(CloseReason::Io(e.to_string()));
                    return;
                }
            }
            _ = close_rx.changed() => break,
        }
    }

    // CLOSING: drain the parting BYE, then shut the socket.
    if let Some(reason) = shared.reason().bye_reason() {
        let bye = Frame::Bye { reason: reason.to_string() };
        let _ = timeout(BYE_DRAIN_TIMEOUT, write_frame(&mut writer, &bye)).await;
    }
    let _ = writer.shutdown().await;
}

async fn run_keepalive(
    handle: SessionHandle,
    ping_interval: Duration,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of tokio's interval fires immediately; skip it so
    // the first PING goes out one full interval after the handshake.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = close_rx.changed() => return,
        }

        let outstanding = handle.shared.outstanding_pings.load(Ordering::Relaxed);
        if outstanding >= MAX_MISSED_PINGS {
            warn!(peer = %handle.peer, outstanding, "keep-alive timed out");
            handle.shared.initiate_close(CloseReason::KeepaliveTimeout);
            return;
        }

        let nonce: u64 = rand::thread_rng().gen();
        handle
            .shared
            .pending_pings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(nonce, Instant::now());
        handle.shared.outstanding_pings.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = handle.try_send(Frame::Ping { nonce, t_send: unix_millis() }) {
            debug!(peer = %handle.peer, error = %e, "PING not queued");
        }
    }
}
