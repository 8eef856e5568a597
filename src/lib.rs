//! # Parley - Peer-to-Peer Overlay Chat
//!
//! Parley is a chat client for an application-layer overlay network. Each
//! instance registers with an external rendezvous directory, discovers the
//! other participants, and keeps persistent TCP sessions with the peers it
//! can reach. Messages are unicast, namespace-scoped, or broadcast; when a
//! destination is not directly connected, intermediaries relay under a
//! hop limit with flood deduplication.
//!
//! ## Architecture
//!
//! Components communicate by message passing over channels, with a small
//! set of mutex-guarded maps behind narrow accessors:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | `name@namespace` identities and destination specifiers |
//! | `wire` | Line-delimited JSON peer frames and the line codec |
//! | `config` | Defaults, JSON config file, validation |
//! | `directory` | One-shot REGISTER/DISCOVER/UNREGISTER exchanges |
//! | `peer_table` | Peer registry: status, RTT average, reconnect state |
//! | `session` | One peer session: handshake, reader/writer, keep-alive |
//! | `listener` | Inbound accept loop |
//! | `router` | Dedup, relay, ACK, and route discovery engine |
//! | `node` | Orchestrator: workers, session set, shutdown |
//! | `shell` | Interactive command surface |
//!
//! The `Node` owns the peer table and session set; each `Session` owns its
//! socket and queues; the `Router` owns the seen-set, route cache, and
//! pending-ACK map.

pub mod config;
pub mod directory;
pub mod identity;
pub mod listener;
pub mod node;
pub mod peer_table;
pub mod router;
pub mod session;
pub mod shell;
pub mod wire;

pub use config::Config;
pub use identity::{Destination, PeerId};
pub use node::Node;
pub use router::{Router, RouterEvent};
pub use shell::Shell;
