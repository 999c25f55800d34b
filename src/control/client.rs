//! Control channel WebSocket client
//!
//! Connects to a running service, performs the attach handshake and exposes a
//! typed method per command.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket, send `attach`, wait for `attached`
//! 2. `start()`, `pause()`, ... - One `call` per method, answered by id
//! 3. `detach()` - Clean shutdown; the service keeps running
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (250ms, 500ms).
//! A dropped connection is not re-established.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::protocol::{CallerMessage, ServiceMessage};
use crate::error::ServiceError;
use crate::service::ServiceStatus;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for waiting for the `attached` reply
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single call (start may spend a few seconds resolving)
const CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum connection attempts
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Errors from the control client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Failed to establish the connection or complete the handshake
    ConnectionFailed(String),
    /// Connection closed unexpectedly
    Disconnected(String),
    /// Peer sent something this client does not understand
    ProtocolError(String),
    /// No reply within the deadline
    Timeout,
    /// The service answered with an error
    Service(ServiceError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            ClientError::Disconnected(e) => write!(f, "Disconnected: {}", e),
            ClientError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
            ClientError::Timeout => write!(f, "Timed out waiting for the service"),
            ClientError::Service(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ServiceError> for ClientError {
    fn from(err: ServiceError) -> Self {
        ClientError::Service(err)
    }
}

/// Attached connection to a wake word service
pub struct ControlClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    attached: ServiceStatus,
}

impl ControlClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:12183`) and attach as `client`
    pub async fn connect(url: &str, client: &str) -> Result<Self, ClientError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying control connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_connect(url, client).await {
                Ok(conn) => return Ok(conn),
                // The service answered: retrying will not change its mind
                Err(e @ ClientError::Service(_)) => return Err(e),
                Err(e) => {
                    log::warn!("Control connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ClientError::ConnectionFailed("Max retries exceeded".to_string())))
    }

    async fn try_connect(url: &str, client: &str) -> Result<Self, ClientError> {
        let (ws, _response) = timeout(CONNECTION_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| ClientError::ConnectionFailed("Connection timeout".to_string()))?
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let mut conn = Self {
            ws,
            next_id: 1,
            attached: ServiceStatus::default(),
        };

        conn.send(&CallerMessage::Attach {
            client: Some(client.to_string()),
        })
        .await?;

        let status = timeout(ATTACH_TIMEOUT, async {
            loop {
                match conn.recv().await? {
                    ServiceMessage::Attached { status } => return Ok(status),
                    ServiceMessage::Error { error, .. } => return Err(remote_error(error)),
                    other => log::debug!("Ignoring message while attaching: {:?}", other),
                }
            }
        })
        .await
        .map_err(|_| ClientError::ConnectionFailed("Attach timeout".to_string()))??;

        log::info!("Attached to wake word service ({})", status.state);
        conn.attached = status;
        Ok(conn)
    }

    /// Service status reported by the attach handshake
    pub fn attached_status(&self) -> &ServiceStatus {
        &self.attached
    }

    /// Invoke a command by name and return its raw value
    pub async fn call(
        &mut self,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        self.send(&CallerMessage::Call {
            id,
            method: method.to_string(),
            args,
        })
        .await?;

        timeout(CALL_TIMEOUT, async {
            loop {
                match self.recv().await? {
                    ServiceMessage::Success { id: reply_id, value } if reply_id == id => {
                        return Ok(value)
                    }
                    ServiceMessage::Error {
                        id: Some(reply_id),
                        error,
                    } if reply_id == id => return Err(remote_error(error)),
                    ServiceMessage::Error { id: None, error } => {
                        return Err(remote_error(error))
                    }
                    other => log::debug!("Ignoring unrelated message: {:?}", other),
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Start a session with detector `kind` and its arguments
    pub async fn start(
        &mut self,
        kind: &str,
        mut args: Map<String, Value>,
    ) -> Result<(), ClientError> {
        args.insert("detectorKind".to_string(), Value::from(kind));
        self.call_ack("start", args).await
    }

    pub async fn stop(&mut self) -> Result<(), ClientError> {
        self.call_ack("stop", Map::new()).await
    }

    pub async fn pause(&mut self) -> Result<(), ClientError> {
        self.call_ack("pause", Map::new()).await
    }

    pub async fn resume(&mut self) -> Result<(), ClientError> {
        self.call_ack("resume", Map::new()).await
    }

    pub async fn is_running(&mut self) -> Result<bool, ClientError> {
        self.call_typed("isRunning").await
    }

    pub async fn is_listening(&mut self) -> Result<bool, ClientError> {
        self.call_typed("isListening").await
    }

    pub async fn supported_detectors(&mut self) -> Result<Vec<String>, ClientError> {
        self.call_typed("getSupportedDetectors").await
    }

    pub async fn status(&mut self) -> Result<ServiceStatus, ClientError> {
        self.call_typed("status").await
    }

    /// Detach and close the connection. The service keeps its state.
    pub async fn detach(mut self) -> Result<(), ClientError> {
        self.send(&CallerMessage::Detach).await?;

        let result = timeout(ATTACH_TIMEOUT, async {
            loop {
                match self.recv().await {
                    Ok(ServiceMessage::Detached) => return Ok(()),
                    // Server closes right after detaching
                    Err(ClientError::Disconnected(_)) => return Ok(()),
                    Err(e) => return Err(e),
                    Ok(_) => {}
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout)?;

        if let Err(e) = self.ws.close(None).await {
            log::debug!("Error closing control connection: {}", e);
        }
        result
    }

    async fn call_ack(
        &mut self,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<(), ClientError> {
        match self.call(method, args).await? {
            Value::Bool(true) => Ok(()),
            other => Err(ClientError::ProtocolError(format!(
                "unexpected reply to {}: {}",
                method, other
            ))),
        }
    }

    async fn call_typed<T: DeserializeOwned>(&mut self, method: &str) -> Result<T, ClientError> {
        let value = self.call(method, Map::new()).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::ProtocolError(format!("bad reply to {}: {}", method, e)))
    }

    async fn send(&mut self, msg: &CallerMessage) -> Result<(), ClientError> {
        let json =
            serde_json::to_string(msg).map_err(|e| ClientError::ProtocolError(e.to_string()))?;

        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|e| ClientError::Disconnected(e.to_string()))
    }

    async fn recv(&mut self) -> Result<ServiceMessage, ClientError> {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| ClientError::ProtocolError(e.to_string()))
                }
                Ok(Message::Close(_)) => {
                    return Err(ClientError::Disconnected("closed by service".to_string()))
                }
                Ok(_) => {} // Ignore ping/pong/binary
                Err(e) => return Err(ClientError::Disconnected(e.to_string())),
            }
        }
        Err(ClientError::Disconnected("stream ended".to_string()))
    }
}

fn remote_error(payload: crate::error::ErrorPayload) -> ClientError {
    match ServiceError::from_wire(&payload) {
        Some(err) => ClientError::Service(err),
        None => ClientError::ProtocolError(format!(
            "unknown error {}: {}",
            payload.code, payload.message
        )),
    }
}
