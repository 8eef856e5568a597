//! # Node Orchestrator
//!
//! The [`Node`] owns the peer table and the session set and runs the
//! client's background activities:
//!
//! - **discovery worker** — periodic DISCOVER sweeps feeding the peer
//!   table, with a wildcard sweep every 4th tick to observe
//!   cross-namespace peers;
//! - **connection reconciler** — dials peers that should be connected,
//!   with a concurrency gate and a total-session cap;
//! - **reconnect scheduling** — exponential backoff on non-graceful
//!   session loss, up to the attempt cap;
//! - **registrar** — one successful REGISTER before the first DISCOVER,
//!   retried on transient failures, and exactly one UNREGISTER at
//!   shutdown.
//!
//! Sessions are registered here, which is also where the dual-connect
//! race resolves: when both sides dial simultaneously, the session whose
//! outbound direction originated from the lexicographically smaller
//! identity wins, and the loser leaves with `BYE duplicate`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{DirectoryClient, DirectoryError};
use crate::identity::PeerId;
use crate::listener;
use crate::peer_table::{PeerEntry, PeerStatus, PeerTable};
use crate::router::{Router, RouterEvent};
use crate::session::{
    CloseReason, Direction, Established, InboundFrame, SessionClosed, SessionHandle, SessionMap,
    SessionState,
};

/// Cadence of the connection reconciler.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Concurrent outbound connection attempts.
const MAX_CONCURRENT_DIALS: usize = 8;

/// Every Nth discovery tick widens to a wildcard DISCOVER.
const WILDCARD_EVERY: u64 = 4;

/// Pause between REGISTER retries on transient network failures.
const REGISTER_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Budget for the whole goodbye: BYE on all sessions plus UNREGISTER.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// One session as reported by `/conn` and `/rtt`.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    pub direction: Direction,
    pub state: SessionState,
    pub rtt: Option<Duration>,
}

pub struct Node {
    config: Config,
    local: PeerId,
    peer_table: Arc<PeerTable>,
    sessions: SessionMap,
    router: Router,
    directory: Arc<DirectoryClient>,
    features: Arc<Vec<String>>,
    established_tx: mpsc::Sender<Established>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    closed_tx: mpsc::Sender<SessionClosed>,
    discovery_kick: Arc<Notify>,
    reconcile_kick: Arc<Notify>,
    dial_gate: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Bring the client up: bind the listener, complete one REGISTER, and
    /// start every worker. Returns the node and the router's event stream
    /// for the shell adapter.
    pub async fn start(config: Config) -> Result<(Arc<Node>, mpsc::Receiver<RouterEvent>)> {
        config.validate()?;
        let local = config.peer_id()?;

        // Listener first, so peers that discover us can connect as soon
        // as the registration lands.
        let tcp_listener = listener::bind(config.listen_port).await?;

        let directory = Arc::new(DirectoryClient::new(&config));
        register_with_retry(&directory).await?;

        let peer_table = Arc::new(PeerTable::new());
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let (router, inbound_tx, event_rx) =
            Router::spawn(local.clone(), config.relay_ttl, sessions.clone());

        let (established_tx, established_rx) = mpsc::channel(32);
        let (closed_tx, closed_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let features: Arc<Vec<String>> = Arc::new(Vec::new());

        let node = Arc::new(Node {
            config,
            local: local.clone(),
            peer_table,
            sessions,
            router,
            directory,
            features: features.clone(),
            established_tx,
            inbound_tx,
            closed_tx,
            discovery_kick: Arc::new(Notify::new()),
            reconcile_kick: Arc::new(Notify::new()),
            dial_gate: Arc::new(Semaphore::new(MAX_CONCURRENT_DIALS)),
            shutdown_tx,
        });

        tokio::spawn(listener::run(
            tcp_listener,
            local,
            features,
            node.established_tx.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(node.clone().run_session_registrar(established_rx));
        tokio::spawn(node.clone().run_close_watcher(closed_rx));
        tokio::spawn(node.clone().run_discovery_worker(shutdown_rx.clone()));
        tokio::spawn(node.clone().run_reconciler(shutdown_rx));

        info!(peer = %node.local, port = node.config.listen_port, "node started");
        Ok((node, event_rx))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn peers(&self) -> Vec<PeerEntry> {
        self.peer_table.snapshot()
    }

    /// Open (or closing) sessions with their smoothed RTT.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut infos: Vec<ConnectionInfo> = handles
            .into_iter()
            .map(|handle| ConnectionInfo {
                rtt: self.peer_table.lookup(handle.peer()).and_then(|e| e.rtt),
                peer: handle.peer().clone(),
                direction: handle.direction(),
                state: handle.state(),
            })
            .collect();
        infos.sort_by(|a, b| a.peer.cmp(&b.peer));
        infos
    }

    /// `/reconnect`: force a discovery sweep plus a reconcile pass now.
    pub fn reconnect_now(&self) {
        self.discovery_kick.notify_one();
        self.reconcile_kick.notify_one();
    }

    /// Graceful shutdown: stop workers, BYE every session, UNREGISTER
    /// once. Bounded by a 5 s budget, then everything is dropped anyway.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        self.router.quit().await;

        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.close(CloseReason::Local("shutdown".into()));
        }

        match timeout(SHUTDOWN_BUDGET, self.directory.unregister()).await {
            Ok(Ok(())) => debug!("unregistered from directory"),
            Ok(Err(e)) => warn!(error = %e, "UNREGISTER failed"),
            Err(_) => warn!("UNREGISTER timed out"),
        }
    }

    // ========================================================================
    // Session registration (inbound and outbound converge here)
    // ========================================================================

    async fn run_session_registrar(self: Arc<Self>, mut established_rx: mpsc::Receiver<Established>) {
        while let Some(established) = established_rx.recv().await {
            self.register_session(established).await;
        }
    }

    async fn register_session(&self, established: Established) {
        let peer = established.peer.clone();

        let (existing, at_capacity) = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            (
                sessions.get(&peer).cloned(),
                sessions.len() >= self.config.max_sessions && !sessions.contains_key(&peer),
            )
        };

        if at_capacity {
            warn!(peer = %peer, cap = self.config.max_sessions, "session cap reached, refusing");
            established.refuse("capacity").await;
            return;
        }

        if let Some(existing) = existing {
            if existing.is_open() {
                // Dual-connect race: the outbound dialed by the smaller
                // identity wins; both sides compute the same answer.
                let smaller_is_local = self.local < peer;
                let keep_new = match established.direction {
                    Direction::Outbound => smaller_is_local,
                    Direction::Inbound => !smaller_is_local,
                };
                if keep_new && existing.direction() != established.direction {
                    debug!(peer = %peer, "duplicate session, replacing the old side");
                    existing.close(CloseReason::Duplicate);
                } else {
                    debug!(peer = %peer, "duplicate session, keeping the existing side");
                    established.refuse("duplicate").await;
                    return;
                }
            }
        }

        let handle = established.start(
            self.config.ping_interval(),
            self.peer_table.clone(),
            self.inbound_tx.clone(),
            self.closed_tx.clone(),
        );
        info!(peer = %peer, direction = %handle.direction(), "session open");
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone(), handle);
        self.peer_table.observe_session(&peer);
    }

    async fn run_close_watcher(self: Arc<Self>, mut closed_rx: mpsc::Receiver<SessionClosed>) {
        while let Some(closed) = closed_rx.recv().await {
            self.on_session_closed(closed).await;
        }
    }

    async fn on_session_closed(&self, closed: SessionClosed) {
        let peer = closed.peer;
        // A tie-break loser closes after its replacement is already in the
        // map; only a CLOSED map entry belongs to this event.
        let survivor_open = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            match sessions.get(&peer) {
                Some(handle) if !handle.is_open() => {
                    sessions.remove(&peer);
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if survivor_open {
            return;
        }

        self.router.session_closed(peer.clone()).await;
        if closed.reason.is_graceful() {
            self.peer_table.set_status(&peer, PeerStatus::Stale);
        } else {
            info!(peer = %peer, reason = %closed.reason, "session lost, scheduling reconnect");
            self.peer_table.record_connect_failure(
                &peer,
                Duration::from_secs(self.config.reconnect_backoff_base),
                self.config.max_reconnect_attempts,
            );
        }
    }

    // ========================================================================
    // Discovery worker
    // ========================================================================

    async fn run_discovery_worker(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.discovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.discovery_kick.notified() => {}
                _ = shutdown_rx.changed() => return,
            }
            tick += 1;
            let wildcard = tick % WILDCARD_EVERY == 0;
            self.discover_once(wildcard).await;
        }
    }

    async fn discover_once(&self, wildcard: bool) {
        let scope = if wildcard { None } else { Some(self.config.namespace.as_str()) };
        let records = match self.directory.discover(scope).await {
            Ok(records) => records,
            Err(DirectoryError::RateLimited) => {
                warn!("discovery paused by directory rate limit");
                return;
            }
            Err(e) => {
                warn!(error = %e, "DISCOVER failed");
                return;
            }
        };

        let mut present = Vec::with_capacity(records.len());
        let mut new_peers = 0usize;
        for record in &records {
            let id = match PeerId::new(&record.name, &record.namespace) {
                Ok(id) => id,
                Err(e) => {
                    debug!(error = %e, "skipping invalid directory record");
                    continue;
                }
            };
            if id == self.local {
                continue;
            }
            if self.peer_table.upsert_from_directory(id.clone(), record) {
                info!(peer = %id, ip = %record.ip, port = record.port, "peer discovered");
                new_peers += 1;
            }
            present.push(id);
        }

        let demoted = self.peer_table.mark_missing_as_stale(&present, scope);
        for peer in demoted {
            info!(peer = %peer, "peer gone from directory, closing session");
            let handle = self
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&peer)
                .cloned();
            if let Some(handle) = handle {
                handle.close(CloseReason::Local("stale".into()));
            }
        }

        if new_peers > 0 {
            debug!(new_peers, total = self.peer_table.len(), "directory sweep complete");
            // Dial fresh peers right away instead of waiting a cycle.
            self.reconcile_kick.notify_one();
        }
    }

    // ========================================================================
    // Connection reconciler
    // ========================================================================

    async fn run_reconciler(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.reconcile_kick.notified() => {}
                _ = shutdown_rx.changed() => return,
            }
            self.reconcile_once().await;
        }
    }

    async fn reconcile_once(self: &Arc<Self>) {
        for entry in self.peer_table.due_for_connect() {
            if entry.ip.is_empty() || entry.port == 0 {
                continue;
            }
            {
                let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
                if sessions.len() >= self.config.max_sessions {
                    debug!(cap = self.config.max_sessions, "session cap reached, reconcile stops");
                    return;
                }
                if sessions.get(&entry.id).map(|s| s.is_open()).unwrap_or(false) {
                    continue;
                }
            }

            let Ok(permit) = self.dial_gate.clone().acquire_owned().await else {
                return;
            };
            self.peer_table.set_status(&entry.id, PeerStatus::Connecting);
            let node = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                node.dial(entry).await;
            });
        }
    }

    async fn dial(&self, entry: PeerEntry) {
        let addr = format!("{}:{}", entry.ip, entry.port);
        debug!(peer = %entry.id, %addr, attempt = entry.reconnect_attempts + 1, "dialing");
        match Established::connect(&addr, &self.local, &self.features).await {
            Ok(established) => {
                if established.peer != entry.id {
                    warn!(
                        expected = %entry.id,
                        got = %established.peer,
                        "peer at {} identified as someone else", addr
                    );
                    established.refuse("identity_mismatch").await;
                    self.peer_table.record_connect_failure(
                        &entry.id,
                        Duration::from_secs(self.config.reconnect_backoff_base),
                        self.config.max_reconnect_attempts,
                    );
                    return;
                }
                let _ = self.established_tx.send(established).await;
            }
            Err(e) => {
                debug!(peer = %entry.id, error = %e, "dial failed");
                self.peer_table.record_connect_failure(
                    &entry.id,
                    Duration::from_secs(self.config.reconnect_backoff_base),
                    self.config.max_reconnect_attempts,
                );
            }
        }
    }
}

/// One REGISTER, retried on transient failures, fatal on validation
/// errors. Rate limiting waits out the directory's minute.
async fn register_with_retry(directory: &DirectoryClient) -> Result<()> {
    loop {
        match directory.register().await {
            Ok(grant) => {
                info!(ttl = grant.ttl_granted, observed_ip = ?grant.observed_ip, "registered");
                return Ok(());
            }
            Err(e) if e.is_validation() => {
                return Err(e).context("directory rejected our registration");
            }
            Err(DirectoryError::RateLimited) => {
                let pause = directory
                    .backoff_remaining()
                    .unwrap_or(crate::directory::RATE_LIMIT_BACKOFF);
                warn!(pause_secs = pause.as_secs(), "rate limited during registration");
                sleep(pause).await;
            }
            Err(e) => {
                warn!(error = %e, retry_secs = REGISTER_RETRY_BACKOFF.as_secs(), "REGISTER failed, retrying");
                sleep(REGISTER_RETRY_BACKOFF).await;
            }
        }
    }
}
