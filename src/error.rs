//! Errors reported back to callers of the wake word service
//!
//! Every command completes with either a value or one of these errors.
//! Each variant has a stable wire code (`code()`) so a remote caller can match
//! on it without parsing the human-readable message.

use serde::{Deserialize, Serialize};

use crate::audio::AudioError;
use crate::detector::TransportError;

/// Errors that can complete a service command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Requested detector kind is not registered
    UnsupportedDetector(String),
    /// Detector kind is known but its arguments are missing or malformed
    InvalidConfiguration(String),
    /// Start requested while a session is active (or being set up/torn down)
    AlreadyRunning,
    /// Pause/resume requested without an active session
    NoActiveSession,
    /// Transport could not resolve or bind the configured endpoint
    UnreachableConfiguration(String),
    /// Audio source failed to start
    AudioUnavailable(String),
    /// Command name not recognized by the dispatcher
    UnknownCommand(String),
    /// The service loop is gone (shut down or crashed)
    ServiceUnavailable,
    /// Remote caller sent a command before the attach handshake
    NotAttached,
    /// Remote caller sent a frame that is not a valid control message
    MalformedMessage(String),
    /// The service failed to produce a reply it should always be able to build
    Internal(String),
}

impl ServiceError {
    /// Stable error code used on the control channel
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::UnsupportedDetector(_) => "UnsupportedDetector",
            ServiceError::InvalidConfiguration(_) => "InvalidConfiguration",
            ServiceError::AlreadyRunning => "AlreadyRunning",
            ServiceError::NoActiveSession => "NoActiveSession",
            ServiceError::UnreachableConfiguration(_) => "UnreachableConfiguration",
            ServiceError::AudioUnavailable(_) => "AudioUnavailable",
            ServiceError::UnknownCommand(_) => "UnknownCommand",
            ServiceError::ServiceUnavailable => "ServiceUnavailable",
            ServiceError::NotAttached => "NotAttached",
            ServiceError::MalformedMessage(_) => "MalformedMessage",
            ServiceError::Internal(_) => "Internal",
        }
    }

    /// Rebuild an error from its wire form.
    ///
    /// Returns `None` for codes this build does not know about.
    pub fn from_wire(payload: &ErrorPayload) -> Option<Self> {
        let detail = payload.message.clone();
        let err = match payload.code.as_str() {
            "UnsupportedDetector" => ServiceError::UnsupportedDetector(detail),
            "InvalidConfiguration" => ServiceError::InvalidConfiguration(detail),
            "AlreadyRunning" => ServiceError::AlreadyRunning,
            "NoActiveSession" => ServiceError::NoActiveSession,
            "UnreachableConfiguration" => ServiceError::UnreachableConfiguration(detail),
            "AudioUnavailable" => ServiceError::AudioUnavailable(detail),
            "UnknownCommand" => ServiceError::UnknownCommand(detail),
            "ServiceUnavailable" => ServiceError::ServiceUnavailable,
            "NotAttached" => ServiceError::NotAttached,
            "MalformedMessage" => ServiceError::MalformedMessage(detail),
            "Internal" => ServiceError::Internal(detail),
            _ => return None,
        };
        Some(err)
    }

    /// Detail carried by the variant, used as the wire message for variants with a payload
    fn detail(&self) -> Option<&str> {
        match self {
            ServiceError::UnsupportedDetector(s)
            | ServiceError::InvalidConfiguration(s)
            | ServiceError::UnreachableConfiguration(s)
            | ServiceError::AudioUnavailable(s)
            | ServiceError::UnknownCommand(s)
            | ServiceError::MalformedMessage(s)
            | ServiceError::Internal(s) => Some(s),
            ServiceError::AlreadyRunning
            | ServiceError::NoActiveSession
            | ServiceError::ServiceUnavailable
            | ServiceError::NotAttached => None,
        }
    }

    /// Convert into the wire payload
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self
                .detail()
                .map(str::to_string)
                .unwrap_or_else(|| self.to_string()),
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::UnsupportedDetector(kind) => {
                write!(f, "Unsupported wake word detector: {}", kind)
            }
            ServiceError::InvalidConfiguration(e) => {
                write!(f, "Invalid detector configuration: {}", e)
            }
            ServiceError::AlreadyRunning => write!(f, "Wake word service is already running"),
            ServiceError::NoActiveSession => write!(f, "No wake word session is running"),
            ServiceError::UnreachableConfiguration(e) => {
                write!(f, "Detector endpoint unreachable: {}", e)
            }
            ServiceError::AudioUnavailable(e) => write!(f, "Audio input unavailable: {}", e),
            ServiceError::UnknownCommand(name) => write!(f, "Unknown command: {}", name),
            ServiceError::ServiceUnavailable => write!(f, "Wake word service is not available"),
            ServiceError::NotAttached => {
                write!(f, "Caller must attach before sending commands")
            }
            ServiceError::MalformedMessage(e) => write!(f, "Malformed control message: {}", e),
            ServiceError::Internal(e) => write!(f, "Internal service error: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<AudioError> for ServiceError {
    fn from(err: AudioError) -> Self {
        ServiceError::AudioUnavailable(err.to_string())
    }
}

impl From<TransportError> for ServiceError {
    fn from(err: TransportError) -> Self {
        ServiceError::UnreachableConfiguration(err.to_string())
    }
}

/// Error as it travels over the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}
