//! # Message Router
//!
//! Classifies, deduplicates, forwards, acknowledges, and times out
//! messages. The router is the only component that touches the seen-set,
//! the route cache, and the pending-ACK map; everything reaches it through
//! the [`Router`] handle (commands) or the inbound-frame channel sessions
//! write to.
//!
//! ## Relay discipline
//!
//! A frame whose destination is not this peer is forwarded under three
//! rules: the `(src, msg_id)` seen-set suppresses replays, the TTL strictly
//! decreases on every hop, and nothing is ever forwarded back out the
//! session it arrived on (split horizon). Unicasts follow a resolved next
//! hop — direct session, fresh route-cache entry, or a `WHO_HAS` flood
//! whose `WHO_HAS_HIT` travels the reverse path recorded hop-by-hop.
//! Acknowledgements are end to end: intermediaries relay `ACK` frames along
//! the recorded reverse path but never emit one on a destination's behalf.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::identity::{Destination, PeerId};
use crate::session::{InboundFrame, SessionHandle, SessionMap, WriteError};
use crate::wire::{ErrorCode, Frame};

/// Seen-set capacity (flood suppression).
pub const SEEN_CAPACITY: usize = 4096;

/// Age after which a seen-set entry no longer suppresses.
pub const SEEN_RETENTION: Duration = Duration::from_secs(30);

/// Route-cache capacity and freshness window.
pub const ROUTE_CACHE_CAPACITY: usize = 1024;
pub const ROUTE_FRESHNESS: Duration = Duration::from_secs(60);

/// Deadline for an end-to-end ACK on an originated unicast.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Window a send stays parked awaiting a `WHO_HAS_HIT`.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// Deadline sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Command queue depth for the router actor.
const COMMAND_QUEUE: usize = 256;

/// Inbound frame queue depth (shared by all sessions).
const INBOUND_QUEUE: usize = 1024;

/// Fresh opaque message identifier (16 random bytes, hex).
pub fn new_msg_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Immediate rejection of a locally originated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRejected {
    /// The next hop's writer queue is full.
    Busy,
    /// No session exists to even start route discovery.
    NoRoute,
    /// The router is shutting down.
    Closed,
}

impl std::fmt::Display for SendRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendRejected::Busy => f.write_str("busy"),
            SendRejected::NoRoute => f.write_str("no_route"),
            SendRejected::Closed => f.write_str("router closed"),
        }
    }
}

impl std::error::Error for SendRejected {}

/// Asynchronous outcomes surfaced to the shell adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// A payload addressed to this peer (directly or via PUB) arrived.
    Message { src: PeerId, scope: Destination, text: String },
    /// End-to-end ACK received for an originated unicast.
    Delivered { msg_id: String, dst: PeerId },
    /// No ACK within the deadline; the message is not retried.
    AckTimeout { msg_id: String, dst: PeerId },
    /// Route discovery expired with no hit.
    NoRoute { msg_id: String, dst: PeerId },
    /// A previously accepted send failed after the fact.
    SendFailed { msg_id: String, dst: PeerId, error: String },
}

enum Command {
    SendText {
        dst: PeerId,
        text: String,
        reply: oneshot::Sender<Result<String, SendRejected>>,
    },
    Publish {
        scope: Destination,
        text: String,
        reply: oneshot::Sender<usize>,
    },
    SessionClosed { peer: PeerId },
    Quit,
}

/// Cheap-to-clone handle over the router actor.
#[derive(Clone)]
pub struct Router {
    cmd_tx: mpsc::Sender<Command>,
}

impl Router {
    /// Spawn the router actor. Returns the handle, the sender sessions
    /// deliver inbound frames to, and the event stream for the shell.
    pub fn spawn(
        local: PeerId,
        relay_ttl: u32,
        sessions: SessionMap,
    ) -> (Router, mpsc::Sender<InboundFrame>, mpsc::Receiver<RouterEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(COMMAND_QUEUE);
        let actor = RouterActor::new(local, relay_ttl, sessions, event_tx);
        tokio::spawn(actor.run(cmd_rx, inbound_rx));
        (Router { cmd_tx }, inbound_tx, event_rx)
    }

    /// Originate a unicast. Returns the message id; delivery and timeout
    /// outcomes arrive as [`RouterEvent`]s.
    pub async fn send_text(&self, dst: PeerId, text: String) -> Result<String, SendRejected> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendText { dst, text, reply })
            .await
            .map_err(|_| SendRejected::Closed)?;
        rx.await.map_err(|_| SendRejected::Closed)?
    }

    /// Originate a namespace-cast or broadcast. Returns how many sessions
    /// accepted a copy.
    pub async fn publish(&self, scope: Destination, text: String) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Publish { scope, text, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Tell the router a session is gone so routes through it die with it.
    pub async fn session_closed(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(Command::SessionClosed { peer }).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

struct SeenEntry {
    /// Session the frame arrived on; `None` for locally originated ids.
    inbound: Option<PeerId>,
    at: Instant,
}

struct RouteEntry {
    via: PeerId,
    learned_at: Instant,
}

struct PendingAck {
    dst: PeerId,
    deadline: Instant,
}

struct ParkedSend {
    src: PeerId,
    dst: PeerId,
    payload: String,
    ttl: u32,
    deadline: Instant,
    /// Locally originated sends surface `no_route`; transiting ones drop.
    local_origin: bool,
}

/// Reverse-path record for relayed unicasts: where the SEND came from, so
/// its ACK (or a ttl_expired) can be steered back.
struct ReversePath {
    inbound: PeerId,
    dst: PeerId,
    at: Instant,
}

struct RouterActor {
    local: PeerId,
    relay_ttl: u32,
    sessions: SessionMap,
    event_tx: mpsc::Sender<RouterEvent>,
    seen: LruCache<(PeerId, String), SeenEntry>,
    route_cache: LruCache<PeerId, RouteEntry>,
    reverse_paths: LruCache<String, ReversePath>,
    pending_acks: HashMap<String, PendingAck>,
    parked: HashMap<String, ParkedSend>,
}

impl RouterActor {
    fn new(
        local: PeerId,
        relay_ttl: u32,
        sessions: SessionMap,
        event_tx: mpsc::Sender<RouterEvent>,
    ) -> Self {
        let seen_cap = NonZeroUsize::new(SEEN_CAPACITY).expect("SEEN_CAPACITY must be non-zero");
        let route_cap =
            NonZeroUsize::new(ROUTE_CACHE_CAPACITY).expect("ROUTE_CACHE_CAPACITY must be non-zero");
        Self {
            local,
            relay_ttl,
            sessions,
            event_tx,
            seen: LruCache::new(seen_cap),
            route_cache: LruCache::new(route_cap),
            reverse_paths: LruCache::new(seen_cap),
            pending_acks: HashMap::new(),
            parked: HashMap::new(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound_rx: mpsc::Receiver<InboundFrame>,
    ) {
        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::SendText { dst, text, reply }) => {
                            let _ = reply.send(self.originate_send(dst, text));
                        }
                        Some(Command::Publish { scope, text, reply }) => {
                            let _ = reply.send(self.originate_publish(scope, text));
                        }
                        Some(Command::SessionClosed { peer }) => {
                            self.forget_session(&peer);
                        }
                        Some(Command::Quit) | None => return,
                    }
                }
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(InboundFrame { from, frame }) => self.handle_inbound(from, frame).await,
                        None => return,
                    }
                }
                _ = sweep.tick() => self.sweep_deadlines().await,
            }
        }
    }

    // ========================================================================
    // Session lookup helpers
    // ========================================================================

    fn open_session(&self, peer: &PeerId) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .filter(|s| s.is_open())
            .cloned()
    }

    /// Every open session except `skip` (the split-horizon exclusion).
    fn fanout_sessions(&self, skip: Option<&PeerId>) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.is_open() && Some(s.peer()) != skip)
            .cloned()
            .collect()
    }

    // ========================================================================
    // Seen-set / route cache
    // ========================================================================

    fn already_seen(&mut self, src: &PeerId, msg_id: &str) -> bool {
        match self.seen.get(&(src.clone(), msg_id.to_string())) {
            Some(entry) => entry.at.elapsed() < SEEN_RETENTION,
            None => false,
        }
    }

    fn mark_seen(&mut self, src: &PeerId, msg_id: &str, inbound: Option<PeerId>) {
        self.seen.put(
            (src.clone(), msg_id.to_string()),
            SeenEntry { inbound, at: Instant::now() },
        );
    }

    fn fresh_route(&mut self, dst: &PeerId) -> Option<PeerId> {
        match self.route_cache.get(dst) {
            Some(entry) if entry.learned_at.elapsed() < ROUTE_FRESHNESS => {
                Some(entry.via.clone())
            }
            Some(_) => {
                self.route_cache.pop(dst);
                None
            }
            None => None,
        }
    }

    fn learn_route(&mut self, dst: &PeerId, via: &PeerId) {
        trace!(dst = %dst, via = %via, "route learned");
        self.route_cache.put(
            dst.clone(),
            RouteEntry { via: via.clone(), learned_at: Instant::now() },
        );
    }

    fn invalidate_route(&mut self, dst: &PeerId, via: Option<&PeerId>) {
        let stale = match (self.route_cache.peek(dst), via) {
            (Some(entry), Some(via)) => &entry.via == via,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            self.route_cache.pop(dst);
        }
    }

    fn forget_session(&mut self, peer: &PeerId) {
        // Routes through a dead session are dead themselves.
        let stale: Vec<PeerId> = self
            .route_cache
            .iter()
            .filter(|(_, entry)| &entry.via == peer)
            .map(|(dst, _)| dst.clone())
            .collect();
        for dst in stale {
            self.route_cache.pop(&dst);
        }
    }

    // ========================================================================
    // Origination
    // ========================================================================

    fn originate_send(&mut self, dst: PeerId, text: String) -> Result<String, SendRejected> {
        let msg_id = new_msg_id();
        let frame = Frame::Send {
            msg_id: msg_id.clone(),
            src: self.local.clone(),
            dst: dst.to_string(),
            payload: text.clone(),
            ttl: self.relay_ttl,
        };

        // Direct session first.
        if let Some(session) = self.open_session(&dst) {
            return match session.try_send(frame) {
                Ok(()) => {
                    self.arm_ack(&msg_id, &dst);
                    Ok(msg_id)
                }
                Err(WriteError::Busy) => Err(SendRejected::Busy),
                Err(WriteError::Closed) => Err(SendRejected::NoRoute),
            };
        }

        // Cached next hop, if still fresh and alive.
        if let Some(via) = self.fresh_route(&dst) {
            if let Some(session) = self.open_session(&via) {
                return match session.try_send(frame) {
                    Ok(()) => {
                        self.arm_ack(&msg_id, &dst);
                        Ok(msg_id)
                    }
                    Err(WriteError::Busy) => Err(SendRejected::Busy),
                    Err(WriteError::Closed) => {
                        self.invalidate_route(&dst, Some(&via));
                        self.flood_who_has_and_park(msg_id, self.local.clone(), dst, text, self.relay_ttl, true)
                    }
                };
            }
            self.invalidate_route(&dst, Some(&via));
        }

        self.flood_who_has_and_park(msg_id, self.local.clone(), dst, text, self.relay_ttl, true)
    }

    fn originate_publish(&mut self, scope: Destination, text: String) -> usize {
        let msg_id = new_msg_id();
        self.mark_seen(&self.local.clone(), &msg_id, None);
        let frame = Frame::Pub {
            msg_id,
            src: self.local.clone(),
            dst: scope.to_wire(),
            payload: text,
            ttl: self.relay_ttl,
        };
        let mut accepted = 0;
        for session in self.fanout_sessions(None) {
            match session.try_send(frame.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    // A full writer drops its copy of a PUB.
                    debug!(peer = %session.peer(), error = %e, "PUB copy dropped");
                }
            }
        }
        accepted
    }

    fn arm_ack(&mut self, msg_id: &str, dst: &PeerId) {
        self.pending_acks.insert(
            msg_id.to_string(),
            PendingAck { dst: dst.clone(), deadline: Instant::now() + ACK_TIMEOUT },
        );
    }

    /// Flood `WHO_HAS` everywhere except `exclude` and park the send for
    /// the discovery window. The probe reuses the message id, so hits
    /// correlate without a second identifier.
    fn flood_who_has_and_park(
        &mut self,
        msg_id: String,
        src: PeerId,
        dst: PeerId,
        payload: String,
        ttl: u32,
        local_origin: bool,
    ) -> Result<String, SendRejected> {
        let targets = self.fanout_sessions(None);
        if targets.is_empty() {
            return Err(SendRejected::NoRoute);
        }
        // Our own probe must not bounce back through us.
        self.mark_seen(&dst.clone(), &msg_id, None);
        let probe = Frame::WhoHas { msg_id: msg_id.clone(), dst: dst.clone(), ttl };
        for session in targets {
            if let Err(e) = session.try_send(probe.clone()) {
                debug!(peer = %session.peer(), error = %e, "WHO_HAS copy dropped");
            }
        }
        self.parked.insert(
            msg_id.clone(),
            ParkedSend {
                src,
                dst,
                payload,
                ttl,
                deadline: Instant::now() + DISCOVERY_WINDOW,
                local_origin,
            },
        );
        Ok(msg_id)
    }

    // ========================================================================
    // Inbound classification
    // ========================================================================

    async fn handle_inbound(&mut self, from: PeerId, frame: Frame) {
        trace!(peer = %from, kind = frame.kind(), "inbound frame");
        match frame {
            Frame::Send { msg_id, src, dst, payload, ttl } => {
                self.handle_send(from, msg_id, src, dst, payload, ttl).await;
            }
            Frame::Pub { msg_id, src, dst, payload, ttl } => {
                self.handle_pub(from, msg_id, src, dst, payload, ttl).await;
            }
            Frame::Ack { reference } => self.handle_ack(from, reference).await,
            Frame::WhoHas { msg_id, dst, ttl } => self.handle_who_has(from, msg_id, dst, ttl),
            Frame::WhoHasHit { msg_id, dst, via, ttl } => {
                self.handle_who_has_hit(from, msg_id, dst, via, ttl).await;
            }
            Frame::Error { code, reference, .. } => self.handle_wire_error(from, code, reference).await,
            other => {
                trace!(peer = %from, kind = other.kind(), "frame handled at session layer");
            }
        }
    }

    async fn handle_send(
        &mut self,
        from: PeerId,
        msg_id: String,
        src: PeerId,
        dst: String,
        payload: String,
        ttl: u32,
    ) {
        let dst = match Destination::parse(&dst) {
            Ok(Destination::Peer(id)) => id,
            Ok(_) | Err(_) => {
                warn!(peer = %from, dst = %dst, "SEND with non-unicast destination dropped");
                return;
            }
        };

        if dst == self.local {
            let duplicate = self.already_seen(&src, &msg_id);
            self.mark_seen(&src, &msg_id, Some(from.clone()));
            if !duplicate {
                let _ = self
                    .event_tx
                    .send(RouterEvent::Message {
                        src: src.clone(),
                        scope: Destination::Peer(self.local.clone()),
                        text: payload,
                    })
                    .await;
            }
            // ACK even a replay; the first one may have been lost.
            if let Some(session) = self.open_session(&from) {
                if let Err(e) = session.try_send(Frame::Ack { reference: msg_id }) {
                    debug!(peer = %from, error = %e, "ACK not queued");
                }
            }
            return;
        }

        // Relay path.
        if self.already_seen(&src, &msg_id) {
            trace!(%msg_id, "replayed SEND dropped");
            return;
        }
        self.mark_seen(&src, &msg_id, Some(from.clone()));
        self.reverse_paths.put(
            msg_id.clone(),
            ReversePath { inbound: from.clone(), dst: dst.clone(), at: Instant::now() },
        );

        let ttl = ttl.saturating_sub(1);
        if ttl == 0 {
            debug!(%msg_id, dst = %dst, "TTL exhausted, bouncing ttl_expired");
            if let Some(session) = self.open_session(&from) {
                let _ = session.try_send(Frame::error_ref(ErrorCode::TtlExpired, msg_id));
            }
            return;
        }

        // Resolve the next hop, never back toward the inbound session.
        if let Some(session) = self.open_session(&dst) {
            if session.peer() != &from {
                if let Err(e) = session.try_send(Frame::Send {
                    msg_id,
                    src,
                    dst: dst.to_string(),
                    payload,
                    ttl,
                }) {
                    debug!(peer = %dst, error = %e, "relayed SEND dropped");
                }
                return;
            }
        }
        if let Some(via) = self.fresh_route(&dst) {
            if via != from {
                if let Some(session) = self.open_session(&via) {
                    if let Err(e) = session.try_send(Frame::Send {
                        msg_id,
                        src,
                        dst: dst.to_string(),
                        payload,
                        ttl,
                    }) {
                        debug!(via = %via, error = %e, "relayed SEND dropped");
                        self.invalidate_route(&dst, Some(&via));
                    }
                    return;
                }
                self.invalidate_route(&dst, Some(&via));
            }
        }

        // No hop known: probe for one with the decremented TTL.
        let _ = self.flood_who_has_and_park(msg_id, src, dst, payload, ttl, false);
    }

    async fn handle_pub(
        &mut self,
        from: PeerId,
        msg_id: String,
        src: PeerId,
        dst: String,
        payload: String,
        ttl: u32,
    ) {
        let scope = match Destination::parse(&dst) {
            Ok(scope @ (Destination::Namespace(_) | Destination::All)) => scope,
            Ok(Destination::Peer(_)) | Err(_) => {
                warn!(peer = %from, dst = %dst, "PUB with bad destination dropped");
                return;
            }
        };

        if self.already_seen(&src, &msg_id) {
            trace!(%msg_id, "replayed PUB dropped");
            return;
        }
        self.mark_seen(&src, &msg_id, Some(from.clone()));

        if scope.matches(&self.local) {
            let _ = self
                .event_tx
                .send(RouterEvent::Message { src: src.clone(), scope: scope.clone(), text: payload.clone() })
                .await;
        }

        let ttl = ttl.saturating_sub(1);
        if ttl == 0 {
            return;
        }
        let frame = Frame::Pub { msg_id, src, dst, payload, ttl };
        for session in self.fanout_sessions(Some(&from)) {
            if let Err(e) = session.try_send(frame.clone()) {
                debug!(peer = %session.peer(), error = %e, "forwarded PUB copy dropped");
            }
        }
    }

    async fn handle_ack(&mut self, from: PeerId, reference: String) {
        if let Some(pending) = self.pending_acks.remove(&reference) {
            let _ = self
                .event_tx
                .send(RouterEvent::Delivered { msg_id: reference, dst: pending.dst })
                .await;
            return;
        }
        // Not ours: steer it back along the recorded reverse path.
        if let Some(path) = self.reverse_paths.get(&reference) {
            if path.inbound != from {
                let inbound = path.inbound.clone();
                if let Some(session) = self.open_session(&inbound) {
                    if let Err(e) = session.try_send(Frame::Ack { reference }) {
                        debug!(peer = %inbound, error = %e, "relayed ACK dropped");
                    }
                    return;
                }
            }
        }
        trace!(reference = %reference, "ACK with no pending entry or path");
    }

    fn handle_who_has(&mut self, from: PeerId, msg_id: String, dst: PeerId, ttl: u32) {
        if dst == self.local {
            if let Some(session) = self.open_session(&from) {
                let hit = Frame::WhoHasHit {
                    msg_id,
                    dst: self.local.clone(),
                    via: self.local.clone(),
                    ttl,
                };
                if let Err(e) = session.try_send(hit) {
                    debug!(peer = %from, error = %e, "WHO_HAS_HIT not queued");
                }
            }
            return;
        }

        // Probes are deduplicated on (dst, msg_id); the stored inbound
        // session is the reverse path the hit will ride back.
        if self.already_seen(&dst, &msg_id) {
            return;
        }
        self.mark_seen(&dst, &msg_id, Some(from.clone()));

        let ttl = ttl.saturating_sub(1);
        if ttl == 0 {
            return;
        }
        let probe = Frame::WhoHas { msg_id, dst, ttl };
        for session in self.fanout_sessions(Some(&from)) {
            if let Err(e) = session.try_send(probe.clone()) {
                debug!(peer = %session.peer(), error = %e, "WHO_HAS copy dropped");
            }
        }
    }

    async fn handle_who_has_hit(
        &mut self,
        from: PeerId,
        msg_id: String,
        dst: PeerId,
        via: PeerId,
        ttl: u32,
    ) {
        // Whatever else happens, the hit teaches us a next hop.
        self.learn_route(&dst, &from);

        if let Some(parked) = self.parked.remove(&msg_id) {
            let frame = Frame::Send {
                msg_id: msg_id.clone(),
                src: parked.src,
                dst: parked.dst.to_string(),
                payload: parked.payload,
                ttl: parked.ttl,
            };
            match self.open_session(&from).map(|s| s.try_send(frame)) {
                Some(Ok(())) => {
                    if parked.local_origin {
                        self.arm_ack(&msg_id, &parked.dst);
                    }
                }
                Some(Err(e)) => {
                    if parked.local_origin {
                        let _ = self
                            .event_tx
                            .send(RouterEvent::SendFailed {
                                msg_id,
                                dst: parked.dst,
                                error: e.to_string(),
                            })
                            .await;
                    }
                }
                None => {
                    if parked.local_origin {
                        let _ = self
                            .event_tx
                            .send(RouterEvent::NoRoute { msg_id, dst: parked.dst })
                            .await;
                    }
                }
            }
            return;
        }

        // Not our probe: relay the hit one hop along the reverse path.
        let reverse = self
            .seen
            .get(&(dst.clone(), msg_id.clone()))
            .and_then(|entry| entry.inbound.clone());
        let Some(previous_hop) = reverse else {
            trace!(%msg_id, "WHO_HAS_HIT with no recorded reverse path");
            return;
        };
        if previous_hop == from {
            return;
        }
        let ttl = ttl.saturating_sub(1);
        if ttl == 0 {
            return;
        }
        if let Some(session) = self.open_session(&previous_hop) {
            let hit = Frame::WhoHasHit { msg_id, dst, via, ttl };
            if let Err(e) = session.try_send(hit) {
                debug!(peer = %previous_hop, error = %e, "relayed WHO_HAS_HIT dropped");
            }
        }
    }

    async fn handle_wire_error(&mut self, from: PeerId, code: ErrorCode, reference: Option<String>) {
        match (code, reference) {
            (ErrorCode::TtlExpired, Some(reference)) => {
                // The hop we handed this message to could not get it
                // further; any route we learned through it is suspect.
                if let Some(pending) = self.pending_acks.remove(&reference) {
                    self.invalidate_route(&pending.dst, Some(&from));
                    let _ = self
                        .event_tx
                        .send(RouterEvent::SendFailed {
                            msg_id: reference,
                            dst: pending.dst,
                            error: "ttl_expired".into(),
                        })
                        .await;
                } else if let Some(path) = self.reverse_paths.get(&reference) {
                    let dst = path.dst.clone();
                    self.invalidate_route(&dst, Some(&from));
                }
            }
            (code, reference) => {
                debug!(peer = %from, %code, reference = ?reference, "ERROR frame received");
            }
        }
    }

    // ========================================================================
    // Deadlines
    // ========================================================================

    async fn sweep_deadlines(&mut self) {
        let now = Instant::now();

        let expired_acks: Vec<String> = self
            .pending_acks
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for msg_id in expired_acks {
            if let Some(pending) = self.pending_acks.remove(&msg_id) {
                debug!(%msg_id, dst = %pending.dst, "ack timeout");
                let _ = self
                    .event_tx
                    .send(RouterEvent::AckTimeout { msg_id, dst: pending.dst })
                    .await;
            }
        }

        let expired_parked: Vec<String> = self
            .parked
            .iter()
            .filter(|(_, parked)| parked.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for msg_id in expired_parked {
            if let Some(parked) = self.parked.remove(&msg_id) {
                if parked.local_origin {
                    debug!(%msg_id, dst = %parked.dst, "discovery window expired");
                    let _ = self
                        .event_tx
                        .send(RouterEvent::NoRoute { msg_id, dst: parked.dst })
                        .await;
                } else {
                    trace!(%msg_id, "transiting send dropped, no route found");
                }
            }
        }

        // Age out reverse paths alongside the seen-set retention.
        let stale_paths: Vec<String> = self
            .reverse_paths
            .iter()
            .filter(|(_, path)| path.at.elapsed() >= SEEN_RETENTION)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_paths {
            self.reverse_paths.pop(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;

    use crate::session::Direction;

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    struct Net {
        router: Router,
        inbound_tx: mpsc::Sender<InboundFrame>,
        events: mpsc::Receiver<RouterEvent>,
        sessions: SessionMap,
        wires: StdHashMap<PeerId, mpsc::Receiver<Frame>>,
    }

    /// Router for `local` with one stub session per peer in `peers`.
    fn net(local: &str, peers: &[&str]) -> Net {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let mut wires = StdHashMap::new();
        for peer in peers {
            let peer = id(peer);
            let (handle, wire) = SessionHandle::stub(peer.clone(), Direction::Outbound, 64);
            sessions.lock().unwrap().insert(peer.clone(), handle);
            wires.insert(peer, wire);
        }
        let (router, inbound_tx, events) = Router::spawn(id(local), 8, sessions.clone());
        Net { router, inbound_tx, events, sessions, wires }
    }

    impl Net {
        async fn frame_from(&mut self, peer: &str) -> Frame {
            timeout(Duration::from_secs(1), self.wires.get_mut(&id(peer)).unwrap().recv())
                .await
                .expect("expected a frame")
                .expect("wire closed")
        }

        async fn no_frame_from(&mut self, peer: &str) {
            let got = timeout(Duration::from_millis(100), self.wires.get_mut(&id(peer)).unwrap().recv()).await;
            assert!(got.is_err(), "unexpected frame: {:?}", got);
        }

        async fn inject(&self, from: &str, frame: Frame) {
            self.inbound_tx
                .send(InboundFrame { from: id(from), frame })
                .await
                .unwrap();
        }

        async fn event(&mut self) -> RouterEvent {
            timeout(Duration::from_secs(8), self.events.recv())
                .await
                .expect("expected an event")
                .expect("event channel closed")
        }
    }

    #[tokio::test]
    async fn direct_send_registers_pending_ack() {
        let mut net = net("alice@CIC", &["bob@CIC"]);
        let msg_id = net
            .router
            .send_text(id("bob@CIC"), "hi".into())
            .await
            .unwrap();

        match net.frame_from("bob@CIC").await {
            Frame::Send { msg_id: sent, src, dst, payload, ttl } => {
                assert_eq!(sent, msg_id);
                assert_eq!(src, id("alice@CIC"));
                assert_eq!(dst, "bob@CIC");
                assert_eq!(payload, "hi");
                assert_eq!(ttl, 8);
            }
            other => panic!("expected SEND, got {:?}", other),
        }

        net.inject("bob@CIC", Frame::Ack { reference: msg_id.clone() }).await;
        assert_eq!(
            net.event().await,
            RouterEvent::Delivered { msg_id, dst: id("bob@CIC") }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let mut net = net("alice@CIC", &["bob@CIC"]);
        let msg_id = net
            .router
            .send_text(id("bob@CIC"), "hi".into())
            .await
            .unwrap();
        net.frame_from("bob@CIC").await;
        assert_eq!(
            net.event().await,
            RouterEvent::AckTimeout { msg_id, dst: id("bob@CIC") }
        );
    }

    #[tokio::test]
    async fn inbound_unicast_delivers_once_and_acks() {
        let mut net = net("bob@CIC", &["alice@CIC"]);
        let send = Frame::Send {
            msg_id: "m1".into(),
            src: id("alice@CIC"),
            dst: "bob@CIC".into(),
            payload: "hello".into(),
            ttl: 8,
        };
        net.inject("alice@CIC", send.clone()).await;

        assert_eq!(
            net.event().await,
            RouterEvent::Message {
                src: id("alice@CIC"),
                scope: Destination::Peer(id("bob@CIC")),
                text: "hello".into(),
            }
        );
        assert_eq!(net.frame_from("alice@CIC").await, Frame::Ack { reference: "m1".into() });

        // Replay: re-ACK, no second delivery.
        net.inject("alice@CIC", send).await;
        assert_eq!(net.frame_from("alice@CIC").await, Frame::Ack { reference: "m1".into() });
        let extra = timeout(Duration::from_millis(100), net.events.recv()).await;
        assert!(extra.is_err(), "duplicate delivery: {:?}", extra);
    }

    #[tokio::test]
    async fn unicast_relays_toward_direct_session_with_decremented_ttl() {
        let mut net = net("bob@CIC", &["alice@CIC", "carol@UnB"]);
        net.inject(
            "alice@CIC",
            Frame::Send {
                msg_id: "m2".into(),
                src: id("alice@CIC"),
                dst: "carol@UnB".into(),
                payload: "relayed".into(),
                ttl: 8,
            },
        )
        .await;

        match net.frame_from("carol@UnB").await {
            Frame::Send { msg_id, ttl, .. } => {
                assert_eq!(msg_id, "m2");
                assert_eq!(ttl, 7);
            }
            other => panic!("expected SEND, got {:?}", other),
        }
        net.no_frame_from("alice@CIC").await;
    }

    #[tokio::test]
    async fn relay_bounces_ttl_expired_to_previous_hop() {
        let mut net = net("carol@UnB", &["bob@CIC", "dave@UnB"]);
        net.inject(
            "bob@CIC",
            Frame::Send {
                msg_id: "m3".into(),
                src: id("alice@CIC"),
                dst: "dave@UnB".into(),
                payload: "x".into(),
                ttl: 1,
            },
        )
        .await;

        match net.frame_from("bob@CIC").await {
            Frame::Error { code, reference, .. } => {
                assert_eq!(code, ErrorCode::TtlExpired);
                assert_eq!(reference.as_deref(), Some("m3"));
            }
            other => panic!("expected ERROR, got {:?}", other),
        }
        net.no_frame_from("dave@UnB").await;
    }

    #[tokio::test]
    async fn replayed_relay_is_dropped_silently() {
        let mut net = net("bob@CIC", &["alice@CIC", "carol@UnB"]);
        let send = Frame::Send {
            msg_id: "m4".into(),
            src: id("alice@CIC"),
            dst: "carol@UnB".into(),
            payload: "x".into(),
            ttl: 8,
        };
        net.inject("alice@CIC", send.clone()).await;
        net.frame_from("carol@UnB").await;
        net.inject("alice@CIC", send).await;
        net.no_frame_from("carol@UnB").await;
    }

    #[tokio::test]
    async fn pub_fans_out_except_inbound_and_delivers_locally() {
        let mut net = net("bob@CIC", &["alice@CIC", "carol@UnB", "dave@CIC"]);
        net.inject(
            "alice@CIC",
            Frame::Pub {
                msg_id: "p1".into(),
                src: id("alice@CIC"),
                dst: "#CIC".into(),
                payload: "hello".into(),
                ttl: 8,
            },
        )
        .await;

        assert_eq!(
            net.event().await,
            RouterEvent::Message {
                src: id("alice@CIC"),
                scope: Destination::Namespace("CIC".into()),
                text: "hello".into(),
            }
        );
        // Forwarded to everyone but the inbound session, namespace or not.
        assert!(matches!(net.frame_from("carol@UnB").await, Frame::Pub { ttl: 7, .. }));
        assert!(matches!(net.frame_from("dave@CIC").await, Frame::Pub { ttl: 7, .. }));
        net.no_frame_from("alice@CIC").await;
    }

    #[tokio::test]
    async fn pub_outside_namespace_is_forwarded_but_not_delivered() {
        let mut net = net("carol@UnB", &["alice@CIC", "erin@UnB"]);
        net.inject(
            "alice@CIC",
            Frame::Pub {
                msg_id: "p2".into(),
                src: id("alice@CIC"),
                dst: "#CIC".into(),
                payload: "team only".into(),
                ttl: 8,
            },
        )
        .await;

        assert!(matches!(net.frame_from("erin@UnB").await, Frame::Pub { .. }));
        let extra = timeout(Duration::from_millis(100), net.events.recv()).await;
        assert!(extra.is_err(), "delivered outside namespace: {:?}", extra);
    }

    #[tokio::test]
    async fn duplicate_pub_not_redelivered() {
        let mut net = net("bob@CIC", &["alice@CIC", "carol@UnB"]);
        let publish = Frame::Pub {
            msg_id: "p3".into(),
            src: id("alice@CIC"),
            dst: "*".into(),
            payload: "once".into(),
            ttl: 8,
        };
        net.inject("alice@CIC", publish.clone()).await;
        assert!(matches!(net.event().await, RouterEvent::Message { .. }));
        net.frame_from("carol@UnB").await;

        // Same message arriving over another path: fully suppressed.
        net.inject("carol@UnB", publish).await;
        let extra = timeout(Duration::from_millis(100), net.events.recv()).await;
        assert!(extra.is_err());
        net.no_frame_from("carol@UnB").await;
    }

    #[tokio::test]
    async fn publish_reports_fanout_count() {
        let net = net("alice@CIC", &["bob@CIC", "carol@UnB"]);
        let accepted = net.router.publish(Destination::All, "hi all".into()).await;
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn send_without_route_floods_who_has_then_completes_on_hit() {
        let mut net = net("alice@CIC", &["bob@CIC"]);
        let msg_id = net
            .router
            .send_text(id("carol@UnB"), "relayed".into())
            .await
            .unwrap();

        match net.frame_from("bob@CIC").await {
            Frame::WhoHas { msg_id: probe, dst, ttl } => {
                assert_eq!(probe, msg_id);
                assert_eq!(dst, id("carol@UnB"));
                assert_eq!(ttl, 8);
            }
            other => panic!("expected WHO_HAS, got {:?}", other),
        }

        net.inject(
            "bob@CIC",
            Frame::WhoHasHit {
                msg_id: msg_id.clone(),
                dst: id("carol@UnB"),
                via: id("carol@UnB"),
                ttl: 8,
            },
        )
        .await;

        match net.frame_from("bob@CIC").await {
            Frame::Send { msg_id: sent, dst, .. } => {
                assert_eq!(sent, msg_id);
                assert_eq!(dst, "carol@UnB");
            }
            other => panic!("expected parked SEND, got {:?}", other),
        }

        // The hit populated the route cache: the next send skips discovery.
        let second = net
            .router
            .send_text(id("carol@UnB"), "again".into())
            .await
            .unwrap();
        match net.frame_from("bob@CIC").await {
            Frame::Send { msg_id: sent, .. } => assert_eq!(sent, second),
            other => panic!("expected routed SEND, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_window_expiry_reports_no_route() {
        let mut net = net("alice@CIC", &["bob@CIC"]);
        let msg_id = net
            .router
            .send_text(id("carol@UnB"), "lost".into())
            .await
            .unwrap();
        net.frame_from("bob@CIC").await; // the probe
        assert_eq!(
            net.event().await,
            RouterEvent::NoRoute { msg_id, dst: id("carol@UnB") }
        );
    }

    #[tokio::test]
    async fn send_with_no_sessions_is_rejected() {
        let net = net("alice@CIC", &[]);
        assert_eq!(
            net.router.send_text(id("carol@UnB"), "x".into()).await,
            Err(SendRejected::NoRoute)
        );
    }

    #[tokio::test]
    async fn who_has_for_local_identity_answers_hit() {
        let mut net = net("carol@UnB", &["bob@CIC"]);
        net.inject(
            "bob@CIC",
            Frame::WhoHas { msg_id: "q1".into(), dst: id("carol@UnB"), ttl: 7 },
        )
        .await;
        match net.frame_from("bob@CIC").await {
            Frame::WhoHasHit { msg_id, dst, via, .. } => {
                assert_eq!(msg_id, "q1");
                assert_eq!(dst, id("carol@UnB"));
                assert_eq!(via, id("carol@UnB"));
            }
            other => panic!("expected WHO_HAS_HIT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn who_has_refloods_once_and_hit_rides_reverse_path() {
        let mut net = net("bob@CIC", &["alice@CIC", "carol@UnB"]);

        // Probe from alice for carol's neighborhood: reflooded to carol only.
        let probe = Frame::WhoHas { msg_id: "q2".into(), dst: id("dave@UnB"), ttl: 8 };
        net.inject("alice@CIC", probe.clone()).await;
        match net.frame_from("carol@UnB").await {
            Frame::WhoHas { ttl, .. } => assert_eq!(ttl, 7),
            other => panic!("expected WHO_HAS, got {:?}", other),
        }
        net.no_frame_from("alice@CIC").await;

        // Replayed probe is suppressed.
        net.inject("carol@UnB", probe).await;
        net.no_frame_from("carol@UnB").await;

        // Hit comes back from carol: forwarded to alice, route learned.
        net.inject(
            "carol@UnB",
            Frame::WhoHasHit { msg_id: "q2".into(), dst: id("dave@UnB"), via: id("dave@UnB"), ttl: 7 },
        )
        .await;
        match net.frame_from("alice@CIC").await {
            Frame::WhoHasHit { msg_id, via, ttl, .. } => {
                assert_eq!(msg_id, "q2");
                assert_eq!(via, id("dave@UnB"));
                assert_eq!(ttl, 6);
            }
            other => panic!("expected WHO_HAS_HIT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn relayed_ack_follows_reverse_path() {
        let mut net = net("bob@CIC", &["alice@CIC", "carol@UnB"]);
        net.inject(
            "alice@CIC",
            Frame::Send {
                msg_id: "m5".into(),
                src: id("alice@CIC"),
                dst: "carol@UnB".into(),
                payload: "via bob".into(),
                ttl: 8,
            },
        )
        .await;
        net.frame_from("carol@UnB").await;

        net.inject("carol@UnB", Frame::Ack { reference: "m5".into() }).await;
        assert_eq!(net.frame_from("alice@CIC").await, Frame::Ack { reference: "m5".into() });
    }

    #[tokio::test]
    async fn busy_direct_send_surfaces_busy() {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        // Capacity 1, pre-filled, so the next try_send is Busy.
        let (handle, _wire) = SessionHandle::stub(id("bob@CIC"), Direction::Outbound, 1);
        handle.try_send(Frame::Pong { nonce: 0 }).unwrap();
        sessions.lock().unwrap().insert(id("bob@CIC"), handle);
        let (router, _inbound_tx, _events) = Router::spawn(id("alice@CIC"), 8, sessions);

        assert_eq!(
            router.send_text(id("bob@CIC"), "x".into()).await,
            Err(SendRejected::Busy)
        );
    }

    #[tokio::test]
    async fn session_close_invalidates_routes_through_it() {
        let mut net = net("alice@CIC", &["bob@CIC", "erin@CIC"]);
        let msg_id = net.router.send_text(id("carol@UnB"), "one".into()).await.unwrap();
        net.frame_from("bob@CIC").await; // probe
        net.frame_from("erin@CIC").await; // probe
        net.inject(
            "bob@CIC",
            Frame::WhoHasHit { msg_id: msg_id.clone(), dst: id("carol@UnB"), via: id("carol@UnB"), ttl: 8 },
        )
        .await;
        net.frame_from("bob@CIC").await; // parked send released

        // bob goes away; the cached route must die with the session.
        net.sessions.lock().unwrap().remove(&id("bob@CIC"));
        net.router.session_closed(id("bob@CIC")).await;

        net.router.send_text(id("carol@UnB"), "two".into()).await.unwrap();
        match net.frame_from("erin@CIC").await {
            Frame::WhoHas { .. } => {}
            other => panic!("expected fresh WHO_HAS after route invalidation, got {:?}", other),
        }
    }
}
