//! # Peer Table
//!
//! Thread-safe registry of every peer this client knows about, keyed by
//! identity. The orchestrator owns the table; sessions and the shell reach
//! it only through the narrow accessors here. All operations take one
//! mutex with short critical sections.
//!
//! Status discipline:
//! - a fresh directory record refreshes coordinates and TTL but never
//!   downgrades a CONNECTED peer;
//! - a CONNECTED peer missing from the directory snapshot goes STALE only
//!   after two consecutive misses (hysteresis against flapping);
//! - RTT is kept only while CONNECTED and is an exponential moving average
//!   of keep-alive samples;
//! - reconnect attempts reset on successful handshake, and a FAILED peer
//!   is revived only when the directory reports changed coordinates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::directory::DirectoryRecord;
use crate::identity::PeerId;

/// Weight of a new sample in the RTT moving average (classic 1/8).
const RTT_SAMPLE_WEIGHT: f64 = 0.125;

/// Ceiling for the exponential reconnect backoff.
pub const RECONNECT_BACKOFF_CEILING: Duration = Duration::from_secs(300);

/// Consecutive directory misses before a CONNECTED peer is stale.
const STALE_AFTER_MISSED_CYCLES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Connecting,
    Connected,
    Stale,
    Failed,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerStatus::Unknown => "UNKNOWN",
            PeerStatus::Connecting => "CONNECTING",
            PeerStatus::Connected => "CONNECTED",
            PeerStatus::Stale => "STALE",
            PeerStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Everything known about one peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub id: PeerId,
    /// Coordinates advertised through the directory.
    pub ip: String,
    pub port: u16,
    /// Coordinates the directory observed for the peer, when reported.
    pub observed_ip: Option<String>,
    pub observed_port: Option<u16>,
    pub status: PeerStatus,
    pub last_seen: Instant,
    /// Smoothed keep-alive round-trip; `None` unless CONNECTED.
    pub rtt: Option<Duration>,
    pub reconnect_attempts: u32,
    /// Outbound dials are withheld until this instant.
    pub retry_not_before: Instant,
    pub ttl: u64,
    pub expires_in: Option<u64>,
    missed_cycles: u32,
}

impl PeerEntry {
    fn from_record(id: PeerId, record: &DirectoryRecord) -> Self {
        Self {
            id,
            ip: record.ip.clone(),
            port: record.port,
            observed_ip: record.observed_ip.clone(),
            observed_port: record.observed_port,
            status: PeerStatus::Unknown,
            last_seen: Instant::now(),
            rtt: None,
            reconnect_attempts: 0,
            retry_not_before: Instant::now(),
            ttl: record.ttl,
            expires_in: record.expires_in,
            missed_cycles: 0,
        }
    }

    /// True when the reconciler should dial this peer.
    pub fn wants_connection(&self, now: Instant) -> bool {
        matches!(self.status, PeerStatus::Unknown | PeerStatus::Stale)
            && self.retry_not_before <= now
    }
}

/// Mutex-guarded identity → entry map.
pub struct PeerTable {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self { peers: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, PeerEntry>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold a fresh directory record in. Returns true when the peer was
    /// previously unknown.
    pub fn upsert_from_directory(&self, id: PeerId, record: &DirectoryRecord) -> bool {
        let mut peers = self.lock();
        match peers.get_mut(&id) {
            None => {
                peers.insert(id.clone(), PeerEntry::from_record(id, record));
                true
            }
            Some(entry) => {
                let moved = entry.ip != record.ip || entry.port != record.port;
                entry.ip = record.ip.clone();
                entry.port = record.port;
                entry.observed_ip = record.observed_ip.clone();
                entry.observed_port = record.observed_port;
                entry.ttl = record.ttl;
                entry.expires_in = record.expires_in;
                entry.last_seen = Instant::now();
                entry.missed_cycles = 0;
                if moved && entry.status == PeerStatus::Failed {
                    // New coordinates mean the exhausted backoff no longer
                    // applies; let the reconciler try again.
                    debug!(peer = %entry.id, "failed peer moved, scheduling retry");
                    entry.status = PeerStatus::Unknown;
                    entry.reconnect_attempts = 0;
                    entry.retry_not_before = Instant::now();
                }
                false
            }
        }
    }

    /// Make sure a peer we hold a session with has an entry, and mark it
    /// CONNECTED. Inbound sessions can arrive from peers the directory has
    /// not shown us yet; their coordinates stay empty until it does.
    pub fn observe_session(&self, id: &PeerId) {
        let mut peers = self.lock();
        let entry = peers.entry(id.clone()).or_insert_with(|| PeerEntry {
            id: id.clone(),
            ip: String::new(),
            port: 0,
            observed_ip: None,
            observed_port: None,
            status: PeerStatus::Unknown,
            last_seen: Instant::now(),
            rtt: None,
            reconnect_attempts: 0,
            retry_not_before: Instant::now(),
            ttl: 0,
            expires_in: None,
            missed_cycles: 0,
        });
        entry.status = PeerStatus::Connected;
        entry.reconnect_attempts = 0;
        entry.missed_cycles = 0;
        entry.last_seen = Instant::now();
    }

    /// Register a directory cycle: peers absent from `present` accrue a
    /// missed cycle; CONNECTED peers hit by the hysteresis threshold go
    /// STALE. Returns the identities so demoted so the orchestrator can
    /// close their sessions. A namespace-scoped DISCOVER only judges peers
    /// of that namespace; `scope = None` judges everyone.
    pub fn mark_missing_as_stale(&self, present: &[PeerId], scope: Option<&str>) -> Vec<PeerId> {
        let mut demoted = Vec::new();
        let mut peers = self.lock();
        for (id, entry) in peers.iter_mut() {
            if let Some(ns) = scope {
                if id.namespace() != ns {
                    continue;
                }
            }
            if present.contains(id) {
                continue;
            }
            entry.missed_cycles += 1;
            if entry.status == PeerStatus::Connected
                && entry.missed_cycles >= STALE_AFTER_MISSED_CYCLES
            {
                entry.status = PeerStatus::Stale;
                entry.rtt = None;
                demoted.push(id.clone());
            }
        }
        demoted
    }

    pub fn set_status(&self, id: &PeerId, status: PeerStatus) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(id) {
            if status != PeerStatus::Connected {
                entry.rtt = None;
            }
            if status == PeerStatus::Connected {
                entry.reconnect_attempts = 0;
                entry.missed_cycles = 0;
                entry.last_seen = Instant::now();
            }
            entry.status = status;
        }
    }

    /// Fold one keep-alive round-trip sample into the moving average.
    pub fn record_rtt(&self, id: &PeerId, sample: Duration) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(id) {
            if entry.status != PeerStatus::Connected {
                return;
            }
            entry.rtt = Some(match entry.rtt {
                None => sample,
                Some(rtt) => rtt.mul_f64(1.0 - RTT_SAMPLE_WEIGHT) + sample.mul_f64(RTT_SAMPLE_WEIGHT),
            });
            entry.last_seen = Instant::now();
        }
    }

    /// Record a failed outbound attempt and schedule the next one with
    /// exponential backoff. Attempts past `max_attempts` mark the peer
    /// FAILED until the directory reports a changed coordinate.
    pub fn record_connect_failure(&self, id: &PeerId, backoff_base: Duration, max_attempts: u32) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(id) {
            entry.reconnect_attempts += 1;
            if entry.reconnect_attempts > max_attempts {
                debug!(peer = %entry.id, attempts = entry.reconnect_attempts, "reconnect attempts exhausted");
                entry.status = PeerStatus::Failed;
                entry.rtt = None;
                return;
            }
            let exp = entry.reconnect_attempts.min(16);
            let delay = backoff_base
                .saturating_mul(1u32 << exp)
                .min(RECONNECT_BACKOFF_CEILING);
            entry.retry_not_before = Instant::now() + delay;
            entry.status = PeerStatus::Stale;
            entry.rtt = None;
        }
    }

    pub fn lookup(&self, id: &PeerId) -> Option<PeerEntry> {
        self.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerEntry> {
        let mut entries: Vec<PeerEntry> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Peers the reconciler should currently dial.
    pub fn due_for_connect(&self) -> Vec<PeerEntry> {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|e| e.wants_connection(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn record(ip: &str, port: u16) -> DirectoryRecord {
        DirectoryRecord {
            ip: ip.into(),
            port,
            name: "bob".into(),
            namespace: "CIC".into(),
            ttl: 7200,
            expires_in: Some(7000),
            observed_ip: None,
            observed_port: None,
        }
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        assert!(table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002)));
        assert!(!table.upsert_from_directory(bob.clone(), &record("10.0.0.3", 6002)));
        let entry = table.lookup(&bob).unwrap();
        assert_eq!(entry.ip, "10.0.0.3");
        assert_eq!(entry.status, PeerStatus::Unknown);
    }

    #[test]
    fn upsert_never_downgrades_connected() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        table.set_status(&bob, PeerStatus::Connected);
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        assert_eq!(table.lookup(&bob).unwrap().status, PeerStatus::Connected);
    }

    #[test]
    fn stale_needs_two_consecutive_misses() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        table.set_status(&bob, PeerStatus::Connected);

        // First miss: still connected.
        assert!(table.mark_missing_as_stale(&[], None).is_empty());
        assert_eq!(table.lookup(&bob).unwrap().status, PeerStatus::Connected);

        // Reappearing resets the counter.
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        assert!(table.mark_missing_as_stale(&[], None).is_empty());

        // Two consecutive misses demote.
        let demoted = table.mark_missing_as_stale(&[], None);
        assert_eq!(demoted, vec![bob.clone()]);
        assert_eq!(table.lookup(&bob).unwrap().status, PeerStatus::Stale);
    }

    #[test]
    fn peers_in_snapshot_are_not_missed() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        table.set_status(&bob, PeerStatus::Connected);
        for _ in 0..4 {
            assert!(table.mark_missing_as_stale(std::slice::from_ref(&bob), None).is_empty());
        }
        assert_eq!(table.lookup(&bob).unwrap().status, PeerStatus::Connected);
    }

    #[test]
    fn rtt_first_sample_then_ema() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        table.set_status(&bob, PeerStatus::Connected);

        table.record_rtt(&bob, Duration::from_millis(80));
        assert_eq!(table.lookup(&bob).unwrap().rtt, Some(Duration::from_millis(80)));

        table.record_rtt(&bob, Duration::from_millis(160));
        // 0.875 * 80 + 0.125 * 160 = 90
        let rtt = table.lookup(&bob).unwrap().rtt.unwrap();
        assert!((rtt.as_millis() as i64 - 90).abs() <= 1, "rtt = {:?}", rtt);
    }

    #[test]
    fn rtt_defined_only_while_connected() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));

        // Not connected yet: sample ignored.
        table.record_rtt(&bob, Duration::from_millis(50));
        assert_eq!(table.lookup(&bob).unwrap().rtt, None);

        table.set_status(&bob, PeerStatus::Connected);
        table.record_rtt(&bob, Duration::from_millis(50));
        assert!(table.lookup(&bob).unwrap().rtt.is_some());

        // Leaving CONNECTED clears it.
        table.set_status(&bob, PeerStatus::Stale);
        assert_eq!(table.lookup(&bob).unwrap().rtt, None);
    }

    #[test]
    fn connect_success_resets_attempts() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        table.record_connect_failure(&bob, Duration::from_secs(1), 5);
        table.record_connect_failure(&bob, Duration::from_secs(1), 5);
        assert_eq!(table.lookup(&bob).unwrap().reconnect_attempts, 2);

        table.set_status(&bob, PeerStatus::Connected);
        assert_eq!(table.lookup(&bob).unwrap().reconnect_attempts, 0);
    }

    #[test]
    fn backoff_grows_and_failure_caps_out() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));

        for _ in 0..5 {
            table.record_connect_failure(&bob, Duration::from_secs(1), 5);
        }
        let entry = table.lookup(&bob).unwrap();
        assert_eq!(entry.reconnect_attempts, 5);
        assert_ne!(entry.status, PeerStatus::Failed);
        assert!(entry.retry_not_before > Instant::now());

        table.record_connect_failure(&bob, Duration::from_secs(1), 5);
        assert_eq!(table.lookup(&bob).unwrap().status, PeerStatus::Failed);
    }

    #[test]
    fn failed_peer_revives_on_changed_coordinates() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        for _ in 0..6 {
            table.record_connect_failure(&bob, Duration::from_secs(1), 5);
        }
        assert_eq!(table.lookup(&bob).unwrap().status, PeerStatus::Failed);

        // Same coordinates: still failed.
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        assert_eq!(table.lookup(&bob).unwrap().status, PeerStatus::Failed);

        // Moved: eligible again with a clean slate.
        table.upsert_from_directory(bob.clone(), &record("10.0.0.9", 6002));
        let entry = table.lookup(&bob).unwrap();
        assert_eq!(entry.status, PeerStatus::Unknown);
        assert_eq!(entry.reconnect_attempts, 0);
        assert!(entry.wants_connection(Instant::now()));
    }

    #[test]
    fn due_for_connect_respects_backoff_and_status() {
        let table = PeerTable::new();
        let bob = id("bob@CIC");
        let carol = id("carol@UnB");
        table.upsert_from_directory(bob.clone(), &record("10.0.0.2", 6002));
        table.upsert_from_directory(carol.clone(), &record("10.0.0.3", 6003));
        table.set_status(&carol, PeerStatus::Connected);

        let due: Vec<PeerId> = table.due_for_connect().into_iter().map(|e| e.id).collect();
        assert_eq!(due, vec![bob.clone()]);

        table.record_connect_failure(&bob, Duration::from_secs(30), 5);
        assert!(table.due_for_connect().is_empty());
    }
}
