//! # Directory Client
//!
//! Single-shot request/response exchanges with the rendezvous directory.
//! Every operation opens a fresh TCP connection, writes one LF-terminated
//! JSON line, reads one line back, and closes. Responses are
//! `{"status":"OK", ...}` or `{"status":"ERROR", "error"|"message": <code>}`.
//!
//! The directory rate-limits per source IP; a `rate_limited` answer arms a
//! shared not-before instant and every subsequent call short-circuits until
//! it passes. Clients must REGISTER before DISCOVER/UNREGISTER or the
//! directory answers `peer_not_registered`.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::wire::{LineError, LineReader};

/// Timeout for one complete directory exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum pause after the directory reports `rate_limited`.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Directory failure taxonomy.
///
/// Validation codes come back verbatim from the service; `Network` covers
/// connect/read/write/timeout failures and is the only transient variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    BadName,
    BadNamespace,
    BadPort,
    BadTtl,
    InvalidJson,
    LineTooLong,
    RateLimited,
    PeerNotRegistered,
    /// Socket-level failure or timeout; retryable.
    Network(String),
    /// Unrecognized error code from the service.
    Unexpected(String),
}

impl DirectoryError {
    fn from_code(code: &str) -> Self {
        match code {
            "bad_name" => DirectoryError::BadName,
            "bad_namespace" => DirectoryError::BadNamespace,
            "bad_port" => DirectoryError::BadPort,
            "bad_ttl" => DirectoryError::BadTtl,
            "invalid_json" => DirectoryError::InvalidJson,
            "line_too_long" => DirectoryError::LineTooLong,
            "rate_limited" => DirectoryError::RateLimited,
            "peer_not_registered" => DirectoryError::PeerNotRegistered,
            other => DirectoryError::Unexpected(other.to_string()),
        }
    }

    /// Validation failures are not retryable; they abort startup when no
    /// prior registration succeeded.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DirectoryError::BadName
                | DirectoryError::BadNamespace
                | DirectoryError::BadPort
                | DirectoryError::BadTtl
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DirectoryError::Network(_) | DirectoryError::RateLimited)
    }
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::BadName => write!(f, "directory rejected name (bad_name)"),
            DirectoryError::BadNamespace => write!(f, "directory rejected namespace (bad_namespace)"),
            DirectoryError::BadPort => write!(f, "directory rejected port (bad_port)"),
            DirectoryError::BadTtl => write!(f, "directory rejected ttl (bad_ttl)"),
            DirectoryError::InvalidJson => write!(f, "directory could not parse request (invalid_json)"),
            DirectoryError::LineTooLong => write!(f, "directory request exceeded line cap (line_too_long)"),
            DirectoryError::RateLimited => write!(f, "directory rate limit hit (rate_limited)"),
            DirectoryError::PeerNotRegistered => {
                write!(f, "directory requires REGISTER first (peer_not_registered)")
            }
            DirectoryError::Network(detail) => write!(f, "directory unreachable: {}", detail),
            DirectoryError::Unexpected(code) => write!(f, "directory error: {}", code),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// One peer record from a DISCOVER answer.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryRecord {
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub observed_ip: Option<String>,
    #[serde(default)]
    pub observed_port: Option<u16>,
}

/// Successful REGISTER acknowledgement.
#[derive(Debug, Clone)]
pub struct Registration {
    pub ttl_granted: u64,
    pub observed_ip: Option<String>,
    pub observed_port: Option<u16>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum Request<'a> {
    #[serde(rename = "REGISTER")]
    Register {
        namespace: &'a str,
        name: &'a str,
        port: u16,
        ttl: u64,
    },
    #[serde(rename = "DISCOVER")]
    Discover {
        #[serde(skip_serializing_if = "Option::is_none")]
        namespace: Option<&'a str>,
    },
    #[serde(rename = "UNREGISTER")]
    Unregister {
        namespace: &'a str,
        name: &'a str,
        port: u16,
    },
}

#[derive(Deserialize)]
struct Response {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    ttl: Option<u64>,
    #[serde(default)]
    observed_ip: Option<String>,
    #[serde(default)]
    observed_port: Option<u16>,
    #[serde(default)]
    peers: Option<Vec<DirectoryRecord>>,
}

/// Client for the rendezvous directory. Cheap to share; the only state is
/// the rate-limit gate.
pub struct DirectoryClient {
    host: String,
    port: u16,
    local_name: String,
    local_namespace: String,
    listen_port: u16,
    ttl_seconds: u64,
    /// Calls are refused locally until this instant passes.
    not_before: Mutex<Option<Instant>>,
}

impl DirectoryClient {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.rendezvous_host.clone(),
            port: config.rendezvous_port,
            local_name: config.name.clone(),
            local_namespace: config.namespace.clone(),
            listen_port: config.listen_port,
            ttl_seconds: config.ttl_seconds,
            not_before: Mutex::new(None),
        }
    }

    /// REGISTER the local identity and listen port.
    pub async fn register(&self) -> Result<Registration, DirectoryError> {
        let response = self
            .exchange(&Request::Register {
                namespace: &self.local_namespace,
                name: &self.local_name,
                port: self.listen_port,
                ttl: self.ttl_seconds,
            })
            .await?;
        debug!(
            ttl = response.ttl,
            observed_ip = ?response.observed_ip,
            observed_port = ?response.observed_port,
            "registered with directory"
        );
        Ok(Registration {
            ttl_granted: response.ttl.unwrap_or(self.ttl_seconds),
            observed_ip: response.observed_ip,
            observed_port: response.observed_port,
        })
    }

    /// DISCOVER peers; `None` asks for every namespace.
    pub async fn discover(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<DirectoryRecord>, DirectoryError> {
        let response = self.exchange(&Request::Discover { namespace }).await?;
        Ok(response.peers.unwrap_or_default())
    }

    /// UNREGISTER the local entry; part of every graceful shutdown.
    pub async fn unregister(&self) -> Result<(), DirectoryError> {
        self.exchange(&Request::Unregister {
            namespace: &self.local_namespace,
            name: &self.local_name,
            port: self.listen_port,
        })
        .await?;
        Ok(())
    }

    /// Remaining rate-limit pause, if one is armed.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let guard = self.not_before.lock().unwrap_or_else(|e| e.into_inner());
        guard.and_then(|t| t.checked_duration_since(Instant::now()))
    }

    async fn exchange(&self, request: &Request<'_>) -> Result<Response, DirectoryError> {
        if let Some(remaining) = self.backoff_remaining() {
            debug!(remaining_secs = remaining.as_secs(), "directory call skipped during backoff");
            return Err(DirectoryError::RateLimited);
        }

        let response = timeout(REQUEST_TIMEOUT, self.round_trip(request))
            .await
            .map_err(|_| DirectoryError::Network("request timed out".into()))??;

        if response.status == "OK" {
            return Ok(response);
        }
        let code = response
            .error
            .as_deref()
            .or(response.message.as_deref())
            .unwrap_or("unknown");
        let err = DirectoryError::from_code(code);
        if err == DirectoryError::RateLimited {
            warn!("directory rate limit hit, pausing calls for 60s");
            let mut guard = self.not_before.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(Instant::now() + RATE_LIMIT_BACKOFF);
        }
        Err(err)
    }

    async fn round_trip(&self, request: &Request<'_>) -> Result<Response, DirectoryError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_vec(request)
            .map_err(|e| DirectoryError::Network(e.to_string()))?;
        line.push(b'\n');
        write
            .write_all(&line)
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        let mut reader = LineReader::new(read);
        let answer = match reader.next_line().await {
            Ok(line) => line,
            Err(LineError::TooLong) => return Err(DirectoryError::LineTooLong),
            Err(e) => return Err(DirectoryError::Network(e.to_string())),
        };
        serde_json::from_str(&answer).map_err(|_| {
            DirectoryError::Network(format!("unparseable directory response: {:.120}", answer))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn config_for(port: u16) -> Config {
        Config {
            name: "alice".into(),
            namespace: "CIC".into(),
            rendezvous_host: "127.0.0.1".into(),
            rendezvous_port: port,
            listen_port: 6001,
            ..Config::default()
        }
    }

    /// Serve `responses` one connection at a time, asserting each request
    /// parses as JSON with the expected type tag.
    async fn stub_directory(expected_types: Vec<&'static str>, responses: Vec<String>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for (expected, response) in expected_types.into_iter().zip(responses) {
                let (stream, _) = listener.accept().await.unwrap();
                let (read, mut write) = stream.into_split();
                let mut line = String::new();
                BufReader::new(read).read_line(&mut line).await.unwrap();
                let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                assert_eq!(request["type"], expected);
                write
                    .write_all(format!("{}\n", response).as_bytes())
                    .await
                    .unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn register_parses_grant() {
        let port = stub_directory(
            vec!["REGISTER"],
            vec![r#"{"status":"OK","ttl":7200,"observed_ip":"203.0.113.9","observed_port":6001}"#.into()],
        )
        .await;
        let client = DirectoryClient::new(&config_for(port));
        let grant = client.register().await.unwrap();
        assert_eq!(grant.ttl_granted, 7200);
        assert_eq!(grant.observed_ip.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn discover_returns_records() {
        let port = stub_directory(
            vec!["DISCOVER"],
            vec![concat!(
                r#"{"status":"OK","peers":[{"ip":"10.0.0.2","port":6002,"name":"bob","#,
                r#""namespace":"CIC","ttl":7200,"expires_in":7100}]}"#
            )
            .into()],
        )
        .await;
        let client = DirectoryClient::new(&config_for(port));
        let peers = client.discover(Some("CIC")).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "bob");
        assert_eq!(peers[0].port, 6002);
        assert_eq!(peers[0].expires_in, Some(7100));
    }

    #[tokio::test]
    async fn error_codes_map_to_variants() {
        let port = stub_directory(
            vec!["REGISTER"],
            vec![r#"{"status":"ERROR","error":"bad_namespace"}"#.into()],
        )
        .await;
        let client = DirectoryClient::new(&config_for(port));
        let err = client.register().await.unwrap_err();
        assert_eq!(err, DirectoryError::BadNamespace);
        assert!(err.is_validation());
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn legacy_message_field_also_maps() {
        let port = stub_directory(
            vec!["DISCOVER"],
            vec![r#"{"status":"ERROR","message":"peer_not_registered"}"#.into()],
        )
        .await;
        let client = DirectoryClient::new(&config_for(port));
        assert_eq!(
            client.discover(None).await.unwrap_err(),
            DirectoryError::PeerNotRegistered
        );
    }

    #[tokio::test]
    async fn rate_limit_arms_backoff_gate() {
        let port = stub_directory(
            vec!["DISCOVER"],
            vec![r#"{"status":"ERROR","error":"rate_limited"}"#.into()],
        )
        .await;
        let client = DirectoryClient::new(&config_for(port));
        assert_eq!(
            client.discover(None).await.unwrap_err(),
            DirectoryError::RateLimited
        );
        let remaining = client.backoff_remaining().expect("backoff should be armed");
        assert!(remaining > Duration::from_secs(55));

        // Gate short-circuits without touching the network (the stub only
        // serves one connection).
        assert_eq!(
            client.discover(None).await.unwrap_err(),
            DirectoryError::RateLimited
        );
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let client = DirectoryClient::new(&config_for(1));
        match client.register().await.unwrap_err() {
            DirectoryError::Network(_) => {}
            other => panic!("expected network error, got {:?}", other),
        }
    }
}
