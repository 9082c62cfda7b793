//! Upstream provider transport.
//!
//! The session engine talks to providers only through [`UpstreamTransport`],
//! which keeps it independent of reqwest and lets tests script upstream
//! behaviour chunk by chunk.

pub mod http;
pub mod sse;

pub use http::{PoolConfig, ReqwestTransport};
pub use sse::{SseEvent, SseScanner};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::models::{ApiMode, ProviderEntry};

/// Error class reported by a transport, before cause classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// DNS, TCP or TLS failure establishing the connection.
    Connect,
    TimedOut,
    /// The read was cancelled underneath us.
    Cancelled,
    /// Malformed framing, bad status line, decode failure.
    Protocol,
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    pub kind: ReadErrorKind,
    pub message: String,
}

impl ReadError {
    pub fn new(kind: ReadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::Connect, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::Cancelled, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::TimedOut, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::Protocol, message)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ReadError {}

pub type BodyStream = BoxStream<'static, Result<Bytes, ReadError>>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub provider: Arc<ProviderEntry>,
    pub mode: ApiMode,
    /// Request body, already rewritten for the upstream model.
    pub body: Bytes,
    pub stream: bool,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BodyStream,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Sends the request and returns once response headers arrived.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ReadError>;
}
