//! # Interactive Shell
//!
//! Translates slash commands from stdin into router/orchestrator calls
//! and renders the router's asynchronous events. The shell owns stdout;
//! logging goes to stderr so the two streams never interleave mid-line.
//! Inbound messages render as `[<src>] <text>`.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::identity::{Destination, PeerId};
use crate::node::Node;
use crate::peer_table::PeerStatus;
use crate::router::RouterEvent;
use crate::session::SessionState;

/// Callback that swaps the active log filter, injected by `main` so the
/// shell stays ignorant of the subscriber stack.
pub type LogLevelSetter = Box<dyn Fn(&str) -> Result<(), String> + Send>;

pub struct Shell {
    node: Arc<Node>,
    events: mpsc::Receiver<RouterEvent>,
    set_log_level: LogLevelSetter,
}

impl Shell {
    pub fn new(
        node: Arc<Node>,
        events: mpsc::Receiver<RouterEvent>,
        set_log_level: LogLevelSetter,
    ) -> Self {
        Self { node, events, set_log_level }
    }

    /// Read commands until `/quit` or EOF, rendering events as they
    /// arrive. Returns after a clean shutdown.
    pub async fn run(mut self) -> Result<()> {
        println!("parley - {} on port {}", self.node.local_id(), self.node.config().listen_port);
        println!("type /help for commands");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if !self.handle_command(line.trim()).await {
                                break;
                            }
                        }
                        // stdin closed: leave as if /quit was typed.
                        None => break,
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => render_event(event),
                        None => break,
                    }
                }
            }
        }

        self.node.shutdown().await;
        Ok(())
    }

    /// Returns false when the shell should exit.
    async fn handle_command(&self, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        if !line.starts_with('/') {
            println!("not a command; use /msg or /pub to talk (see /help)");
            return true;
        }
        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or("").trim();

        match command {
            "/peers" => self.cmd_peers(rest),
            "/msg" => self.cmd_msg(rest).await,
            "/pub" => self.cmd_pub(rest).await,
            "/conn" => self.cmd_conn(),
            "/rtt" => self.cmd_rtt(),
            "/reconnect" => {
                self.node.reconnect_now();
                println!("forcing discovery and reconciliation");
            }
            "/status" => self.cmd_status(),
            "/log" => self.cmd_log(rest),
            "/help" => cmd_help(),
            "/quit" => return false,
            other => println!("unknown command {} (try /help)", other),
        }
        true
    }

    fn cmd_peers(&self, filter: &str) {
        let peers = self.node.peers();
        let filtered: Vec<_> = match filter {
            "" | "*" => peers,
            ns if ns.starts_with('#') => {
                let ns = &ns[1..];
                peers.into_iter().filter(|p| p.id.namespace() == ns).collect()
            }
            _ => {
                println!("usage: /peers [*|#<namespace>]");
                return;
            }
        };
        if filtered.is_empty() {
            println!("no peers known");
            return;
        }
        let mut connected = 0;
        for peer in &filtered {
            if peer.status == PeerStatus::Connected {
                connected += 1;
            }
            let coords = if peer.ip.is_empty() {
                "-".to_string()
            } else {
                format!("{}:{}", peer.ip, peer.port)
            };
            println!("  {:<24} {:<22} {}", peer.id.to_string(), coords, peer.status);
        }
        println!("{} peers, {} connected", filtered.len(), connected);
    }

    async fn cmd_msg(&self, rest: &str) {
        let Some((dst, text)) = rest.split_once(' ') else {
            println!("usage: /msg <name@namespace> <text>");
            return;
        };
        let dst: PeerId = match dst.parse() {
            Ok(dst) => dst,
            Err(e) => {
                println!("bad destination: {}", e);
                return;
            }
        };
        match self.node.router().send_text(dst.clone(), text.to_string()).await {
            Ok(_) => println!("-> [{}] {}", dst, text),
            Err(e) => println!("cannot send to {}: {}", dst, e),
        }
    }

    async fn cmd_pub(&self, rest: &str) {
        let Some((scope, text)) = rest.split_once(' ') else {
            println!("usage: /pub * <text>  or  /pub #<namespace> <text>");
            return;
        };
        let scope = match Destination::parse(scope) {
            Ok(scope @ (Destination::All | Destination::Namespace(_))) => scope,
            _ => {
                println!("destination must be '*' or '#<namespace>'");
                return;
            }
        };
        let accepted = self.node.router().publish(scope.clone(), text.to_string()).await;
        if accepted == 0 {
            println!("no connected peers for {}", scope);
        } else {
            println!("-> [{}] {} ({} sessions)", scope, text, accepted);
        }
    }

    fn cmd_conn(&self) {
        let connections = self.node.connections();
        if connections.is_empty() {
            println!("no active sessions");
            return;
        }
        println!("{:<24} {:<4} {:<9} rtt", "peer", "dir", "state");
        for conn in &connections {
            println!(
                "{:<24} {:<4} {:<9} {}",
                conn.peer.to_string(),
                conn.direction.to_string(),
                format!("{:?}", conn.state).to_uppercase(),
                format_rtt(conn.rtt),
            );
        }
        println!("{} sessions", connections.len());
    }

    fn cmd_rtt(&self) {
        let connections: Vec<_> = self
            .node
            .connections()
            .into_iter()
            .filter(|c| c.state == SessionState::Open)
            .collect();
        if connections.is_empty() {
            println!("no open sessions to measure");
            return;
        }
        println!("{:<24} {:<10} quality", "peer", "rtt");
        for conn in &connections {
            let quality = match conn.rtt {
                None => "waiting for first PONG",
                Some(rtt) if rtt.as_millis() < 100 => "excellent",
                Some(rtt) if rtt.as_millis() < 300 => "good",
                Some(rtt) if rtt.as_millis() < 1000 => "fair",
                Some(_) => "slow",
            };
            println!("{:<24} {:<10} {}", conn.peer.to_string(), format_rtt(conn.rtt), quality);
        }
    }

    fn cmd_status(&self) {
        let config = self.node.config();
        println!("identity            {}", self.node.local_id());
        println!("rendezvous          {}:{}", config.rendezvous_host, config.rendezvous_port);
        println!("listen port         {}", config.listen_port);
        println!("registration ttl    {}s", config.ttl_seconds);
        println!("discovery interval  {}s", config.discovery_interval);
        println!("ping interval       {}s", config.ping_interval);
        println!("relay ttl           {}", config.relay_ttl);
        println!("max sessions        {}", config.max_sessions);
    }

    fn cmd_log(&self, level: &str) {
        if level.is_empty() {
            println!("usage: /log <error|warn|info|debug|trace>");
            return;
        }
        match (self.set_log_level)(level) {
            Ok(()) => println!("log level set to {}", level),
            Err(e) => println!("cannot set log level: {}", e),
        }
    }
}

fn render_event(event: RouterEvent) {
    match event {
        RouterEvent::Message { src, scope: _, text } => {
            println!("[{}] {}", src, text);
        }
        RouterEvent::Delivered { dst, .. } => {
            println!("(delivered to {})", dst);
        }
        RouterEvent::AckTimeout { dst, .. } => {
            println!("(no acknowledgement from {} within 5s)", dst);
        }
        RouterEvent::NoRoute { dst, .. } => {
            println!("(no route to {})", dst);
        }
        RouterEvent::SendFailed { dst, error, .. } => {
            println!("(send to {} failed: {})", dst, error);
        }
    }
}

fn format_rtt(rtt: Option<std::time::Duration>) -> String {
    match rtt {
        Some(rtt) => format!("{}ms", rtt.as_millis()),
        None => "-".to_string(),
    }
}

fn cmd_help() {
    println!("peers & sessions:");
    println!("  /peers [*|#ns]     list known peers (all or one namespace)");
    println!("  /conn              show active sessions");
    println!("  /rtt               show keep-alive latency per peer");
    println!("  /reconnect         force discovery + reconciliation now");
    println!("messages:");
    println!("  /msg <peer> <text> direct message (name@namespace)");
    println!("  /pub * <text>      broadcast to every reachable peer");
    println!("  /pub #<ns> <text>  message every peer in a namespace");
    println!("system:");
    println!("  /status            show effective configuration");
    println!("  /log <level>       change log verbosity");
    println!("  /quit              unregister and exit");
}
