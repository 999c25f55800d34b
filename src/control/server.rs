//! WebSocket endpoint for out-of-process callers
//!
//! Each connection must `attach` before issuing calls. Connections are
//! independent of the service: a caller detaching or vanishing never touches
//! the controller or its session.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::protocol::{CallerMessage, ServiceMessage};
use super::{Dispatcher, PendingCommand};
use crate::error::ServiceError;

/// Listening control endpoint
pub struct ControlServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
}

impl ControlServer {
    pub async fn bind(addr: &str, dispatcher: Dispatcher) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Control endpoint listening on ws://{}", listener.local_addr()?);
        Ok(Self {
            listener,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            self.dispatcher.clone(),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => log::warn!("Failed to accept control connection: {}", e),
                },
            }
        }

        log::info!("Control endpoint stopped");
    }
}

/// What to do with the connection after answering a frame
enum Next {
    Continue,
    Close,
}

struct Connection {
    peer: SocketAddr,
    client: Option<String>,
    dispatcher: Dispatcher,
}

impl Connection {
    async fn handle_text(&mut self, text: &str) -> (ServiceMessage, Next) {
        let message = match serde_json::from_str::<CallerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Malformed control frame from {}: {}", self.peer, e);
                let err = ServiceError::MalformedMessage(e.to_string());
                return (ServiceMessage::error(None, &err), Next::Continue);
            }
        };

        match message {
            CallerMessage::Attach { client } => match self.dispatcher.status().await {
                Ok(status) => {
                    let name = client.unwrap_or_else(|| self.peer.to_string());
                    log::info!("Caller attached: {} (service {})", name, status.state);
                    self.client = Some(name);
                    (ServiceMessage::Attached { status }, Next::Continue)
                }
                Err(e) => (ServiceMessage::error(None, &e), Next::Close),
            },
            CallerMessage::Call { id, method, args } => {
                if self.client.is_none() {
                    return (
                        ServiceMessage::error(Some(id), &ServiceError::NotAttached),
                        Next::Continue,
                    );
                }

                log::debug!("Call {} from {:?}: {}", id, self.client, method);
                match self.dispatcher.dispatch(PendingCommand::new(method, args)).await {
                    Ok(value) => (ServiceMessage::Success { id, value }, Next::Continue),
                    Err(e) => (ServiceMessage::error(Some(id), &e), Next::Continue),
                }
            }
            CallerMessage::Detach => {
                if let Some(name) = self.client.take() {
                    log::info!("Caller detached: {}", name);
                }
                (ServiceMessage::Detached, Next::Close)
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    log::debug!("Control connection from {}", peer);

    let mut conn = Connection {
        peer,
        client: None,
        dispatcher,
    };

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = ws.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                let err =
                    ServiceError::MalformedMessage("binary frames are not supported".to_string());
                if !send(&mut ws, &ServiceMessage::error(None, &err)).await {
                    break;
                }
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue, // ping/pong
            Some(Err(e)) => {
                log::debug!("Control connection {} error: {}", peer, e);
                break;
            }
        };

        let (reply, next) = conn.handle_text(&text).await;
        if !send(&mut ws, &reply).await {
            break;
        }
        if matches!(next, Next::Close) {
            break;
        }
    }

    if let Some(name) = conn.client {
        log::info!("Caller disconnected: {}", name);
    }
    let _ = ws.close(None).await;
}

/// Returns false when the connection is no longer usable
async fn send(ws: &mut WebSocketStream<TcpStream>, message: &ServiceMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to serialize control message: {}", e);
            return false;
        }
    };

    match ws.send(Message::Text(json)).await {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Failed to send control message: {}", e);
            false
        }
    }
}
