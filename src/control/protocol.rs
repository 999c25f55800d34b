//! Control channel wire messages
//!
//! JSON text frames tagged by `type`.
//!
//! # Protocol Overview
//!
//! 1. Caller sends `attach`, service answers `attached` with the current status
//! 2. Caller sends `call` messages; each gets exactly one `success` or `error`
//!    carrying the same `id`
//! 3. Caller sends `detach` (or just disconnects); the service keeps running

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorPayload;
use crate::service::ServiceStatus;

/// Default WebSocket endpoint of the control channel
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:12183";

/// Messages sent by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallerMessage {
    Attach {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client: Option<String>,
    },
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    Detach,
}

/// Messages sent by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    Attached {
        status: ServiceStatus,
    },
    Success {
        id: u64,
        value: Value,
    },
    /// `id` is absent when the offending frame could not be parsed
    Error {
        #[serde(default)]
        id: Option<u64>,
        error: ErrorPayload,
    },
    Detached,
}

impl ServiceMessage {
    pub fn error(id: Option<u64>, err: &crate::error::ServiceError) -> Self {
        ServiceMessage::Error {
            id,
            error: err.to_payload(),
        }
    }
}
