//! Control channel: command decoding and dispatch
//!
//! A [`PendingCommand`] (name + JSON arguments) is decoded into a closed
//! [`Command`], queued on the service loop, and answered exactly once with a
//! JSON value or a [`ServiceError`].
//!
//! # Architecture
//!
//! ```text
//! ControlClient ──ws──▶ ControlServer ──▶ Dispatcher ──queue──▶ service loop
//!                                              │
//!                                   Command::decode (registry)
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientError, ControlClient};
pub use protocol::{CallerMessage, ServiceMessage};
pub use server::ControlServer;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::detector::{DetectorConfig, DetectorRegistry};
use crate::error::ServiceError;
use crate::service::{ServiceHandle, ServiceStatus};

/// Argument naming the detector kind in a `start` command
const KIND_ARG: &str = "detectorKind";
const KIND_ARG_ALIAS: &str = "wakeWordDetector";

/// A command as it arrives from a caller, not yet validated
#[derive(Debug, Clone, Default)]
pub struct PendingCommand {
    pub method: String,
    pub args: Map<String, Value>,
}

impl PendingCommand {
    pub fn new(method: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Every command the service understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { detector: DetectorConfig },
    Stop,
    Pause,
    Resume,
    IsRunning,
    IsListening,
    GetSupportedDetectors,
    Status,
}

impl Command {
    /// Decode a command name and its arguments.
    ///
    /// `start` arguments are validated against `registry` here, before the
    /// command reaches the state machine.
    pub fn decode(
        method: &str,
        args: &Map<String, Value>,
        registry: &DetectorRegistry,
    ) -> Result<Self, ServiceError> {
        let command = match method {
            "start" => {
                let kind = args
                    .get(KIND_ARG)
                    .or_else(|| args.get(KIND_ARG_ALIAS))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ServiceError::InvalidConfiguration(format!(
                            "missing required argument '{}'",
                            KIND_ARG
                        ))
                    })?;
                Command::Start {
                    detector: registry.parse(kind, args)?,
                }
            }
            "stop" => Command::Stop,
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "isRunning" => Command::IsRunning,
            "isListening" => Command::IsListening,
            "getSupportedDetectors" | "getWakeWordDetector" => Command::GetSupportedDetectors,
            "status" => Command::Status,
            other => return Err(ServiceError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

/// Successful completion of a command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Mutating command succeeded (`true` on the wire)
    Ack,
    Flag(bool),
    Detectors(Vec<String>),
    Status(ServiceStatus),
}

impl Reply {
    pub fn into_value(self) -> Result<Value, ServiceError> {
        let value = match self {
            Reply::Ack => Value::Bool(true),
            Reply::Flag(b) => Value::Bool(b),
            Reply::Detectors(kinds) => Value::from(kinds),
            Reply::Status(status) => serde_json::to_value(status).map_err(|e| {
                log::error!("Failed to serialize status: {}", e);
                ServiceError::Internal(format!("status: {}", e))
            })?,
        };
        Ok(value)
    }
}

/// Decodes pending commands and runs them on the service loop
#[derive(Clone)]
pub struct Dispatcher {
    handle: ServiceHandle,
    registry: Arc<DetectorRegistry>,
}

impl Dispatcher {
    pub fn new(handle: ServiceHandle, registry: Arc<DetectorRegistry>) -> Self {
        Self { handle, registry }
    }

    /// Run one command and return its wire value
    pub async fn dispatch(&self, pending: PendingCommand) -> Result<Value, ServiceError> {
        let command = Command::decode(&pending.method, &pending.args, &self.registry)?;
        let reply = self.handle.call(command).await?;
        reply.into_value()
    }

    /// Current status, used to answer the attach handshake
    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        match self.handle.call(Command::Status).await? {
            Reply::Status(status) => Ok(status),
            other => {
                log::error!("Unexpected reply to status: {:?}", other);
                Err(ServiceError::ServiceUnavailable)
            }
        }
    }
}
