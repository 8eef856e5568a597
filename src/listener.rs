//! # Inbound Listener
//!
//! Accepts inbound TCP connections, runs the responder side of the HELLO
//! handshake with the usual 5 s budget, and hands each established
//! connection to the orchestrator, which decides whether to keep it
//! (duplicate-session tie-break, session cap) and starts its tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::session::{Established, HANDSHAKE_TIMEOUT};

/// Bind the listen port. Returns the bound listener so the caller can
/// report the actual port before the accept loop starts.
pub async fn bind(listen_port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", listen_port))
        .await
        .with_context(|| format!("cannot bind listen port {}", listen_port))
}

/// Accept loop. Each connection handshakes on its own task and, on
/// success, is sent to the orchestrator through `established_tx`.
pub async fn run(
    listener: TcpListener,
    local: PeerId,
    features: Arc<Vec<String>>,
    established_tx: mpsc::Sender<Established>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(port = listener.local_addr().map(|a| a.port()).unwrap_or(0), "listening for peer sessions");
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = shutdown_rx.changed() => return,
        };

        debug!(%addr, "inbound connection");
        let local = local.clone();
        let features = features.clone();
        let established_tx = established_tx.clone();
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, Established::accept(stream, &local, &features)).await {
                Ok(Ok(established)) => {
                    debug!(peer = %established.peer, %addr, "inbound handshake complete");
                    let _ = established_tx.send(established).await;
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "inbound handshake refused");
                }
                Err(_) => {
                    debug!(%addr, "inbound handshake timed out");
                }
            }
        });
    }
}
