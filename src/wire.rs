//! # Peer Wire Protocol
//!
//! Persistent peer sessions exchange line-delimited UTF-8 JSON frames, one
//! frame per LF-terminated line, at most [`MAX_LINE_BYTES`] per line. Every
//! frame carries a `type` field naming its kind:
//!
//! | Kind | Required fields |
//! |------|-----------------|
//! | HELLO / HELLO_OK | identity, features |
//! | PING / PONG | nonce (+ t_send for PING) |
//! | SEND | msg_id, src, dst, payload, ttl |
//! | ACK | ref |
//! | PUB | msg_id, src, dst, payload, ttl |
//! | WHO_HAS / WHO_HAS_HIT | msg_id, dst, ttl (+ via for hit) |
//! | BYE | reason |
//! | ERROR | code (+ ref, detail, limit) |
//!
//! The line cap is a protocol constant shared with the directory protocol;
//! a peer that receives an overlong line answers `ERROR line_too_long` and
//! closes the session.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Take};

use crate::identity::PeerId;

/// Maximum bytes in one wire line, terminator included.
pub const MAX_LINE_BYTES: usize = 32 * 1024;

/// Hop limit applied to originated SEND/PUB/WHO_HAS unless configured otherwise.
pub const DEFAULT_RELAY_TTL: u32 = 8;

/// Error codes that travel in `ERROR` frames or surface locally.
///
/// The taxonomy is closed; codes serialize as their snake_case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    LineTooLong,
    InvalidJson,
    BadFormat,
    NoRoute,
    TtlExpired,
    AckTimeout,
    KeepaliveTimeout,
    Busy,
    Unauthorized,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::LineTooLong => "line_too_long",
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::BadFormat => "bad_format",
            ErrorCode::NoRoute => "no_route",
            ErrorCode::TtlExpired => "ttl_expired",
            ErrorCode::AckTimeout => "ack_timeout",
            ErrorCode::KeepaliveTimeout => "keepalive_timeout",
            ErrorCode::Busy => "busy",
            ErrorCode::Unauthorized => "unauthorized",
        };
        f.write_str(s)
    }
}

/// One peer-protocol frame.
///
/// `dst` stays a plain string on SEND/PUB/WHO_HAS frames (peer identity,
/// `#namespace`, or `*`); the router parses it into a
/// [`Destination`](crate::identity::Destination) when classifying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "HELLO")]
    Hello { identity: PeerId, features: Vec<String> },
    #[serde(rename = "HELLO_OK")]
    HelloOk { identity: PeerId, features: Vec<String> },
    #[serde(rename = "PING")]
    Ping { nonce: u64, t_send: u64 },
    #[serde(rename = "PONG")]
    Pong { nonce: u64 },
    #[serde(rename = "SEND")]
    Send {
        msg_id: String,
        src: PeerId,
        dst: String,
        payload: String,
        ttl: u32,
    },
    #[serde(rename = "ACK")]
    Ack {
        #[serde(rename = "ref")]
        reference: String,
    },
    #[serde(rename = "PUB")]
    Pub {
        msg_id: String,
        src: PeerId,
        dst: String,
        payload: String,
        ttl: u32,
    },
    #[serde(rename = "WHO_HAS")]
    WhoHas { msg_id: String, dst: PeerId, ttl: u32 },
    #[serde(rename = "WHO_HAS_HIT")]
    WhoHasHit {
        msg_id: String,
        dst: PeerId,
        via: PeerId,
        ttl: u32,
    },
    #[serde(rename = "BYE")]
    Bye { reason: String },
    #[serde(rename = "ERROR")]
    Error {
        code: ErrorCode,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
}

impl Frame {
    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "HELLO",
            Frame::HelloOk { .. } => "HELLO_OK",
            Frame::Ping { .. } => "PING",
            Frame::Pong { .. } => "PONG",
            Frame::Send { .. } => "SEND",
            Frame::Ack { .. } => "ACK",
            Frame::Pub { .. } => "PUB",
            Frame::WhoHas { .. } => "WHO_HAS",
            Frame::WhoHasHit { .. } => "WHO_HAS_HIT",
            Frame::Bye { .. } => "BYE",
            Frame::Error { .. } => "ERROR",
        }
    }

    pub fn error(code: ErrorCode) -> Frame {
        Frame::Error { code, reference: None, detail: None, limit: None }
    }

    pub fn error_ref(code: ErrorCode, reference: impl Into<String>) -> Frame {
        Frame::Error {
            code,
            reference: Some(reference.into()),
            detail: None,
            limit: None,
        }
    }

    /// The canonical `line_too_long` reply, limit included.
    pub fn line_too_long() -> Frame {
        Frame::Error {
            code: ErrorCode::LineTooLong,
            reference: None,
            detail: None,
            limit: Some(MAX_LINE_BYTES),
        }
    }
}

/// Failure modes while reading one line off a session or directory socket.
#[derive(Debug)]
pub enum LineError {
    /// Clean EOF before any byte of the next line.
    Eof,
    /// Line exceeded [`MAX_LINE_BYTES`] without a terminator.
    TooLong,
    Io(std::io::Error),
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineError::Eof => write!(f, "connection closed"),
            LineError::TooLong => write!(f, "line exceeds {} bytes", MAX_LINE_BYTES),
            LineError::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for LineError {}

impl From<std::io::Error> for LineError {
    fn from(e: std::io::Error) -> Self {
        LineError::Io(e)
    }
}

/// Line reader enforcing the per-line byte cap.
///
/// Wraps the stream in a `Take` so an overlong line is detected after at
/// most `MAX_LINE_BYTES + 1` buffered bytes rather than growing without
/// bound.
pub struct LineReader<R> {
    inner: BufReader<Take<R>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(read: R) -> Self {
        Self {
            inner: BufReader::new(read.take(MAX_LINE_BYTES as u64 + 1)),
            buf: Vec::with_capacity(256),
        }
    }

    /// Read the next LF-terminated line, without the terminator.
    pub async fn next_line(&mut self) -> Result<String, LineError> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Err(LineError::Eof);
        }
        if self.buf.last() != Some(&b'\n') {
            // Either the Take limit fired or the peer closed mid-line.
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(LineError::TooLong);
            }
            return Err(LineError::Eof);
        }
        self.buf.pop();
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        // Re-arm the cap for the next line. Bytes the BufReader has already
        // pulled past this line only ever add slack, never starve a read.
        self.inner.get_mut().set_limit(MAX_LINE_BYTES as u64 + 1);
        String::from_utf8(std::mem::take(&mut self.buf))
            .map_err(|_| LineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line is not valid UTF-8",
            )))
    }
}

/// Serialize a frame and write it as one LF-terminated line.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await
}

/// Decode one already-read line into a frame.
pub fn decode_frame(line: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(line)
}
