//! Pluggable wake word detector backends
//!
//! A detector backend knows how to turn the loose arguments of a `start`
//! command into a typed [`DetectorConfig`], and how to bind a
//! [`DetectorTransport`] that forwards audio frames to the recognizer.
//!
//! # Architecture
//!
//! ```text
//! start { detectorKind, ...args }
//!          │
//!          ▼
//!   DetectorRegistry ──name──▶ DetectorBackend::parse() ──▶ DetectorConfig
//!                                                               │
//!                              DetectorBackend::bind()  ◀───────┘
//!                                       │
//!                                       ▼
//!                              Box<dyn DetectorTransport>
//! ```

mod registry;
pub mod udp;

pub use registry::{parse_endpoint, DetectorRegistry};
pub use udp::{encode_wav_chunk, UdpBackend, UdpTransport, MAX_FRAME_SAMPLES};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audio::AudioFrame;

/// Typed, validated detector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DetectorConfig {
    /// Stream audio as datagrams to a remote recognizer
    #[serde(rename = "UDP")]
    Udp { address: String, port: u16 },
}

impl DetectorConfig {
    /// Canonical kind name of this configuration
    pub fn kind(&self) -> &'static str {
        match self {
            DetectorConfig::Udp { .. } => udp::UDP_KIND,
        }
    }
}

impl std::fmt::Display for DetectorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorConfig::Udp { address, port } => write!(f, "UDP {}:{}", address, port),
        }
    }
}

/// Errors raised by a detector transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint could not be resolved to a socket address
    ResolveFailed(String),
    /// Local socket could not be bound
    BindFailed(String),
    /// Frame could not be encoded for the wire
    EncodeFailed(String),
    /// Datagram send failed
    SendFailed(String),
    /// Transport was already closed
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ResolveFailed(e) => write!(f, "Failed to resolve endpoint: {}", e),
            TransportError::BindFailed(e) => write!(f, "Failed to bind socket: {}", e),
            TransportError::EncodeFailed(e) => write!(f, "Failed to encode audio frame: {}", e),
            TransportError::SendFailed(e) => write!(f, "Failed to send audio frame: {}", e),
            TransportError::Closed => write!(f, "Transport is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Forwards audio frames to a wake word recognizer.
///
/// `send` is best-effort: the frame loop counts failures and keeps going.
/// `close` must be idempotent.
#[async_trait]
pub trait DetectorTransport: Send {
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), TransportError>;

    async fn close(&mut self);
}

/// A detector kind that can be selected by name at start time
#[async_trait]
pub trait DetectorBackend: Send + Sync + 'static {
    /// Canonical kind name, reported by `getSupportedDetectors`
    fn kind(&self) -> &'static str;

    /// Other names this backend answers to
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether `name` selects this backend (case-insensitive)
    fn matches(&self, name: &str) -> bool {
        self.kind().eq_ignore_ascii_case(name)
            || self.aliases().iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Validate command arguments into a typed configuration.
    /// Errors are human-readable descriptions of the offending argument.
    fn parse(&self, args: &Map<String, Value>) -> Result<DetectorConfig, String>;

    /// Bind a transport for a configuration produced by `parse`
    async fn bind(
        &self,
        config: &DetectorConfig,
    ) -> Result<Box<dyn DetectorTransport>, TransportError>;
}
