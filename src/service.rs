//! Service controller
//!
//! Owns the authoritative [`State`] and the (at most one) [`DetectionSession`].
//! Commands arrive through a single-consumer queue drained by
//! [`run_service_loop`], so state-mutating commands never interleave. The
//! state and session slot sit behind a mutex that is never held across an
//! await; [`ServiceBinder`] goes through the same reducer under the same lock.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::AudioSourceFactory;
use crate::control::{Command, Reply};
use crate::detector::{DetectorConfig, DetectorRegistry};
use crate::error::ServiceError;
use crate::metrics::MetricsSnapshot;
use crate::session::{DetectionSession, SessionOptions};
use crate::state_machine::{reduce, Effect, Event, ServiceState, State};

/// Capacity of the command queue
const COMMAND_QUEUE: usize = 32;

/// Snapshot of the service returned by `status` and the attach handshake
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub detector: Option<DetectorConfig>,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics: Option<MetricsSnapshot>,
}

struct Core {
    state: State,
    session: Option<DetectionSession>,
}

/// The wake word service: state machine plus the live session
pub struct ServiceController {
    core: Mutex<Core>,
    registry: Arc<DetectorRegistry>,
    audio: Arc<dyn AudioSourceFactory>,
    options: SessionOptions,
    /// Sessions whose frame loop ended on its own report here
    ended_tx: mpsc::UnboundedSender<Uuid>,
    /// Taken by the service loop
    ended_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
}

impl ServiceController {
    pub fn new(
        registry: Arc<DetectorRegistry>,
        audio: Arc<dyn AudioSourceFactory>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            core: Mutex::new(Core {
                state: State::default(),
                session: None,
            }),
            registry,
            audio,
            options,
            ended_tx,
            ended_rx: Mutex::new(Some(ended_rx)),
        })
    }

    /// Synchronous in-process handle to this controller
    pub fn binder(self: &Arc<Self>) -> ServiceBinder {
        ServiceBinder {
            controller: self.clone(),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.core.lock().state.phase()
    }

    pub fn is_running(&self) -> bool {
        self.core.lock().state.is_running()
    }

    pub fn is_listening(&self) -> bool {
        self.core.lock().state.is_listening()
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.core.lock().state, State::Paused { .. })
    }

    pub fn status(&self) -> ServiceStatus {
        let core = self.core.lock();
        let session = core
            .session
            .as_ref()
            .filter(|s| Some(s.id()) == core.state.session_id());

        ServiceStatus {
            state: core.state.phase(),
            detector: core.state.detector().cloned(),
            session_id: core.state.session_id(),
            started_at: session.map(|s| s.started_at()),
            metrics: session.map(|s| s.metrics()),
        }
    }

    /// Execute one command to completion
    pub async fn execute(&self, command: Command) -> Result<Reply, ServiceError> {
        log::debug!("Executing command: {:?}", command);

        match command {
            Command::Start { detector } => {
                self.drive(Event::Start { detector }).await?;
                Ok(Reply::Ack)
            }
            Command::Stop => {
                self.drive(Event::Stop).await?;
                Ok(Reply::Ack)
            }
            Command::Pause => {
                self.drive(Event::Pause).await?;
                Ok(Reply::Ack)
            }
            Command::Resume => {
                self.drive(Event::Resume).await?;
                Ok(Reply::Ack)
            }
            Command::IsRunning => Ok(Reply::Flag(self.is_running())),
            Command::IsListening => Ok(Reply::Flag(self.is_listening())),
            Command::GetSupportedDetectors => Ok(Reply::Detectors(self.registry.supported())),
            Command::Status => Ok(Reply::Status(self.status())),
        }
    }

    /// Stop any active session. Used when the service loop exits.
    pub async fn shutdown(&self) {
        if let Err(e) = self.drive(Event::Stop).await {
            log::error!("Failed to stop session on shutdown: {}", e);
        }
    }

    /// Tear down a session whose audio source went away
    async fn session_ended(&self, id: Uuid) {
        log::warn!("Session {} ended without a stop request", id);
        if let Err(e) = self.drive(Event::SessionEnded { id }).await {
            log::error!("Failed to stop ended session {}: {}", id, e);
        }
    }

    /// Reduce one event under the lock.
    ///
    /// `SetPaused` only flips an atomic, so it is applied here while the lock
    /// is held; the remaining effects are returned for the caller to run.
    fn apply(&self, event: Event) -> Result<Vec<Effect>, ServiceError> {
        let mut core = self.core.lock();
        Self::apply_locked(&mut core, event)
    }

    fn apply_locked(core: &mut Core, event: Event) -> Result<Vec<Effect>, ServiceError> {
        let (next, effects) = reduce(&core.state, event)?;

        if core.state.phase() != next.phase() {
            log::info!("State transition: {} -> {}", core.state.phase(), next.phase());
        }
        core.state = next;

        let mut pending = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                Effect::SetPaused { id, paused } => match &core.session {
                    Some(session) if session.id() == id => session.set_paused(paused),
                    _ => log::warn!(
                        "No session {} to {}",
                        id,
                        if paused { "pause" } else { "resume" }
                    ),
                },
                other => pending.push(other),
            }
        }
        Ok(pending)
    }

    /// Apply an event and run its effects, feeding completions back in until
    /// the state machine settles. Returns the first session setup error.
    async fn drive(&self, event: Event) -> Result<(), ServiceError> {
        let mut pending: VecDeque<Effect> = self.apply(event)?.into();
        let mut outcome = Ok(());

        while let Some(effect) = pending.pop_front() {
            let completion = match effect {
                Effect::OpenSession { id, detector } => {
                    log::info!("Opening session {} ({})", id, detector);
                    match self.open_session(id, &detector).await {
                        Ok(session) => self.install_session(session).await,
                        Err(e) => {
                            log::error!("Session {} failed to start: {}", id, e);
                            outcome = Err(e);
                            Event::SessionFailed { id }
                        }
                    }
                }
                Effect::CloseSession { id } => {
                    let session = {
                        let mut core = self.core.lock();
                        if core.session.as_ref().map(|s| s.id()) == Some(id) {
                            core.session.take()
                        } else {
                            None
                        }
                    };
                    if let Some(mut session) = session {
                        session.close().await;
                    }
                    Event::SessionClosed { id }
                }
                // Already applied by apply()
                Effect::SetPaused { .. } => continue,
            };

            pending.extend(self.apply(completion)?);
        }

        outcome
    }

    /// Put a freshly opened session into the slot and report it opened.
    /// A session nobody is waiting for any more is closed right away.
    async fn install_session(&self, session: DetectionSession) -> Event {
        let id = session.id();
        let orphan = {
            let mut core = self.core.lock();
            if core.state.session_id() == Some(id) {
                core.session = Some(session);
                None
            } else {
                Some(session)
            }
        };

        if let Some(mut session) = orphan {
            log::warn!("Session {} opened after it was abandoned, closing", id);
            session.close().await;
        }
        Event::SessionOpened { id }
    }

    async fn open_session(
        &self,
        id: Uuid,
        detector: &DetectorConfig,
    ) -> Result<DetectionSession, ServiceError> {
        let mut transport = self.registry.bind(detector).await?;

        let source = match self.audio.create() {
            Ok(source) => source,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let ended = self.ended_tx.clone();
        Ok(DetectionSession::create(id, source, transport, &self.options, ended).await?)
    }
}

/// Synchronous, clonable handle to a live controller.
///
/// Goes around the command queue but through the same reducer and lock, so it
/// never races a queued command.
#[derive(Clone)]
pub struct ServiceBinder {
    controller: Arc<ServiceController>,
}

impl ServiceBinder {
    pub fn is_paused(&self) -> bool {
        self.controller.is_paused()
    }

    pub fn pause(&self) -> Result<(), ServiceError> {
        self.controller.apply(Event::Pause).map(|_| ())
    }

    pub fn resume(&self) -> Result<(), ServiceError> {
        self.controller.apply(Event::Resume).map(|_| ())
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    pub fn is_listening(&self) -> bool {
        self.controller.is_listening()
    }

    pub fn status(&self) -> ServiceStatus {
        self.controller.status()
    }
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<Reply, ServiceError>>,
}

/// Sender side of the command queue
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Request>,
}

impl ServiceHandle {
    /// Queue a command and wait for its completion
    pub async fn call(&self, command: Command) -> Result<Reply, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { command, reply })
            .await
            .map_err(|_| ServiceError::ServiceUnavailable)?;
        rx.await.map_err(|_| ServiceError::ServiceUnavailable)?
    }
}

/// Spawn the service loop for `controller`.
///
/// The loop exits when `shutdown` is cancelled or every handle is dropped,
/// stopping any active session on the way out.
pub fn spawn(
    controller: Arc<ServiceController>,
    shutdown: CancellationToken,
) -> (ServiceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let ended = controller.ended_rx.lock().take();
    if ended.is_none() {
        log::warn!("Service loop already spawned, ended sessions go unwatched");
    }
    let task = tokio::spawn(run_service_loop(controller, rx, ended, shutdown));
    (ServiceHandle { tx }, task)
}

async fn next_ended(ended: &mut Option<mpsc::UnboundedReceiver<Uuid>>) -> Option<Uuid> {
    match ended {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_service_loop(
    controller: Arc<ServiceController>,
    mut rx: mpsc::Receiver<Request>,
    mut ended: Option<mpsc::UnboundedReceiver<Uuid>>,
    shutdown: CancellationToken,
) {
    log::info!("Service loop started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                log::info!("Shutdown requested, stopping service loop");
                break;
            }

            Some(id) = next_ended(&mut ended) => {
                controller.session_ended(id).await;
            }

            request = rx.recv() => {
                let Some(Request { command, reply }) = request else {
                    log::info!("All service handles dropped");
                    break;
                };

                let result = controller.execute(command).await;
                if let Err(e) = &result {
                    log::debug!("Command failed: {}", e);
                }
                // Caller may have gone away; the command still ran
                let _ = reply.send(result);
            }
        }
    }

    controller.shutdown().await;
    log::info!("Service loop ended");
}
