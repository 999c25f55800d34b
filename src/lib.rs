//! Wake word background service
//!
//! Streams microphone audio to a wake word detector while a session is
//! running, and exposes start/stop/pause/resume over a local WebSocket
//! control channel.

pub mod audio;
pub mod control;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod service;
pub mod session;
pub mod settings;
pub mod state_machine;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audio::MicrophoneFactory;
use crate::control::{ControlServer, Dispatcher, PendingCommand};
use crate::detector::DetectorRegistry;
use crate::service::ServiceController;
use crate::settings::ServiceSettings;

pub use crate::error::ServiceError;

/// Install the log subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. `log` records from this
/// crate and its dependencies are bridged into the subscriber.
pub fn init_logging() {
    use tracing_subscriber::prelude::*;

    /// Format timestamps using the system's local time via chrono
    struct LocalTimer;
    impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
        fn format_time(
            &self,
            w: &mut tracing_subscriber::fmt::format::Writer<'_>,
        ) -> std::fmt::Result {
            write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        }
    }

    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .try_init();

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Run the service until Ctrl-C.
///
/// Spawns the service loop, the control endpoint (unless disabled) and the
/// autostart session (if configured). On shutdown any active session is
/// stopped before returning.
pub async fn run(settings: ServiceSettings) -> std::io::Result<()> {
    let registry = Arc::new(DetectorRegistry::with_defaults());
    let audio = Arc::new(MicrophoneFactory::new(settings.capture_options()));
    let controller = ServiceController::new(registry.clone(), audio, settings.session_options());

    let shutdown = CancellationToken::new();
    let (handle, service_task) = service::spawn(controller, shutdown.clone());
    let dispatcher = Dispatcher::new(handle, registry.clone());

    log::info!(
        "Wake word service started (detectors: {})",
        registry.supported().join(", ")
    );

    let server_task = match settings.control_addr() {
        Some(addr) => {
            let server = ControlServer::bind(addr, dispatcher.clone()).await?;
            Some(tokio::spawn(server.run(shutdown.clone())))
        }
        None => {
            log::info!("Control endpoint disabled");
            None
        }
    };

    if let Some(autostart) = &settings.autostart {
        let mut args = autostart.args.clone();
        args.insert(
            "detectorKind".to_string(),
            serde_json::Value::from(autostart.kind.as_str()),
        );
        match dispatcher.dispatch(PendingCommand::new("start", args)).await {
            Ok(_) => log::info!("Autostarted {} detector", autostart.kind),
            Err(e) => log::error!("Autostart of {} detector failed: {}", autostart.kind, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Ctrl-C received, shutting down");
    shutdown.cancel();

    if let Err(e) = service_task.await {
        log::error!("Service loop failed: {}", e);
    }
    if let Some(task) = server_task {
        if let Err(e) = task.await {
            log::error!("Control endpoint failed: {}", e);
        }
    }

    log::info!("Wake word service stopped");
    Ok(())
}
