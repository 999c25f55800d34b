//! Detection session: one audio source bound to one detector transport
//!
//! The session owns the pause gate and the frame loop task.
//!
//! # Architecture
//!
//! ```text
//! Capture Thread (sync)            Tokio Runtime (async)
//! ┌──────────────────┐              ┌─────────────────────────┐
//! │ AudioSource      │──channel──▶  │ frame loop              │
//! │ try_send(frame)  │              │   ├─ paused? → drop     │
//! └──────────────────┘              │   └─ transport.send()   │
//!                                   └─────────────────────────┘
//! ```
//!
//! Pausing only flips the gate: the audio source and the transport stay
//! open, so resuming needs no renegotiation. Closing cancels the loop, waits
//! for it a bounded amount of time, and releases both handles exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioError, AudioFrame, AudioSource};
use crate::detector::DetectorTransport;
use crate::metrics::{MetricsSnapshot, SessionMetrics};

/// Tunables for a detection session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Capacity of the channel between the audio source and the frame loop
    pub frame_queue: usize,
    /// How long `close()` waits for the frame loop before aborting it
    pub stop_timeout: Duration,
    /// Consecutive send failures after which the session reports degraded
    pub failure_streak_warn: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            frame_queue: 64,
            stop_timeout: Duration::from_millis(500),
            failure_streak_warn: 50,
        }
    }
}

/// A running wake word session
pub struct DetectionSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    source: Option<Box<dyn AudioSource>>,
    task: Option<JoinHandle<()>>,
    metrics: Arc<SessionMetrics>,
    stop_timeout: Duration,
}

impl DetectionSession {
    /// Start `source` and spawn the frame loop forwarding into `transport`.
    ///
    /// Must be called from within a Tokio runtime. On failure the transport
    /// is closed before returning. If the audio source stops delivering
    /// frames on its own, the session id is sent on `ended`.
    pub async fn create(
        id: Uuid,
        source: Box<dyn AudioSource>,
        mut transport: Box<dyn DetectorTransport>,
        options: &SessionOptions,
        ended: mpsc::UnboundedSender<Uuid>,
    ) -> Result<Self, AudioError> {
        let (frame_tx, frame_rx) = mpsc::channel(options.frame_queue.max(1));

        let source = match start_source(source, frame_tx).await {
            Ok(source) => source,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let paused = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let metrics = Arc::new(SessionMetrics::new(options.failure_streak_warn));

        let task = tokio::spawn(forward_frames(
            id,
            frame_rx,
            transport,
            FrameLoop {
                paused: paused.clone(),
                cancel: cancel.clone(),
                metrics: metrics.clone(),
                ended,
            },
        ));

        log::info!("Session {}: started", id);

        Ok(Self {
            id,
            started_at: Utc::now(),
            paused,
            cancel,
            source: Some(source),
            task: Some(task),
            metrics,
            stop_timeout: options.stop_timeout,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Open or close the gate. Takes effect at the next frame boundary.
    pub fn set_paused(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::AcqRel);
        if was != paused {
            log::info!(
                "Session {}: {}",
                self.id,
                if paused { "paused" } else { "resumed" }
            );
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the frame loop and release the audio source and transport.
    ///
    /// Idempotent. Waits at most the configured stop timeout for the loop to
    /// finish; a loop stuck in a send is aborted.
    pub async fn close(&mut self) {
        self.cancel.cancel();

        // Stop capture first so no new frames are produced
        if let Some(source) = self.source.take() {
            stop_source(self.id, source).await;
        }

        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Session {}: frame loop failed: {}", self.id, e),
            Err(_) => {
                log::warn!(
                    "Session {}: frame loop did not stop within {:?}, aborting",
                    self.id,
                    self.stop_timeout
                );
                task.abort();
            }
        }

        let snapshot = self.metrics.snapshot();
        log::info!(
            "Session {}: closed ({} forwarded, {} dropped while paused, {} send failures)",
            self.id,
            snapshot.frames_forwarded,
            snapshot.frames_dropped_paused,
            snapshot.send_failures
        );
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        // Dropped without close(): still make sure nothing keeps running
        self.cancel.cancel();
        if let Some(mut source) = self.source.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || source.stop());
                }
                Err(_) => source.stop(),
            }
        }
    }
}

/// Audio sources may block while opening or releasing a device, so both run
/// on the blocking pool instead of a runtime worker.
async fn start_source(
    mut source: Box<dyn AudioSource>,
    frames: mpsc::Sender<AudioFrame>,
) -> Result<Box<dyn AudioSource>, AudioError> {
    tokio::task::spawn_blocking(move || source.start(frames).map(|()| source))
        .await
        .map_err(|e| AudioError::CaptureThreadFailed(format!("start task failed: {}", e)))?
}

async fn stop_source(id: Uuid, mut source: Box<dyn AudioSource>) {
    if let Err(e) = tokio::task::spawn_blocking(move || source.stop()).await {
        log::error!("Session {}: audio source stop failed: {}", id, e);
    }
}

/// Shared handles the frame loop runs with
struct FrameLoop {
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    metrics: Arc<SessionMetrics>,
    ended: mpsc::UnboundedSender<Uuid>,
}

/// Frame loop: forward every frame while the gate is open, drop it otherwise
async fn forward_frames(
    id: Uuid,
    mut frames: mpsc::Receiver<AudioFrame>,
    mut transport: Box<dyn DetectorTransport>,
    shared: FrameLoop,
) {
    let FrameLoop {
        paused,
        cancel,
        metrics,
        ended,
    } = shared;
    log::debug!("Session {}: frame loop running", id);

    let source_gone = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::debug!("Session {}: frame loop cancelled", id);
                break false;
            }

            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break true;
                };

                if paused.load(Ordering::Acquire) {
                    metrics.frame_dropped_paused();
                    continue;
                }

                match transport.send(&frame).await {
                    Ok(()) => metrics.frame_forwarded(),
                    Err(e) => {
                        let message = e.to_string();
                        log::debug!("Session {}: send failed: {}", id, message);
                        let streak = metrics.send_failed(message);
                        if metrics.crosses_threshold(streak) {
                            log::warn!(
                                "Session {}: {} consecutive send failures, \
                                 detector endpoint may be down",
                                id,
                                streak
                            );
                        }
                    }
                }
            }
        }
    };

    transport.close().await;

    if source_gone {
        log::warn!("Session {}: audio source stopped delivering frames", id);
        // Receiver is gone only when the controller itself is shutting down
        let _ = ended.send(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSourceFactory;
    use crate::test_support::{wait_until, FakeAudio, RecordingLog, RecordingTransport};
    use std::sync::atomic::AtomicUsize;

    fn frame(tag: i16) -> AudioFrame {
        AudioFrame {
            samples: vec![tag; 4],
            sample_rate: 16000,
        }
    }

    async fn start_session(audio: &FakeAudio, log: &RecordingLog) -> DetectionSession {
        start_with(audio, log, &SessionOptions::default()).await.0
    }

    async fn start_with(
        audio: &FakeAudio,
        log: &RecordingLog,
        options: &SessionOptions,
    ) -> (DetectionSession, mpsc::UnboundedReceiver<Uuid>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let session = DetectionSession::create(
            Uuid::new_v4(),
            audio.create().unwrap(),
            Box::new(RecordingTransport::new(log.clone())),
            options,
            ended_tx,
        )
        .await
        .unwrap();
        (session, ended_rx)
    }

    #[tokio::test]
    async fn test_frames_reach_transport() {
        let audio = FakeAudio::new();
        let log = RecordingLog::default();
        let mut session = start_session(&audio, &log).await;

        assert!(!session.is_paused());
        audio.push(frame(1)).await;
        audio.push(frame(2)).await;
        wait_until(|| log.sent().len() == 2).await;
        assert_eq!(log.sent(), vec![frame(1), frame(2)]);

        session.close().await;
    }

    #[tokio::test]
    async fn test_paused_frames_never_reach_transport() {
        let audio = FakeAudio::new();
        let log = RecordingLog::default();
        let mut session = start_session(&audio, &log).await;

        audio.push(frame(1)).await;
        wait_until(|| log.sent().len() == 1).await;

        session.set_paused(true);
        assert!(session.is_paused());
        audio.push(frame(2)).await;
        audio.push(frame(3)).await;
        wait_until(|| session.metrics().frames_dropped_paused == 2).await;
        assert_eq!(log.sent().len(), 1);

        session.set_paused(false);
        audio.push(frame(4)).await;
        wait_until(|| log.sent().len() == 2).await;

        // Pause is lossy: the frames captured while paused are gone
        assert_eq!(log.sent(), vec![frame(1), frame(4)]);
        // Pausing did not touch the transport or the source
        assert_eq!(log.close_count(), 0);
        assert_eq!(audio.stop_count(), 0);

        session.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_once() {
        let audio = FakeAudio::new();
        let log = RecordingLog::default();
        let mut session = start_session(&audio, &log).await;

        session.close().await;
        session.close().await;
        assert_eq!(log.close_count(), 1);
        assert_eq!(audio.stop_count(), 1);
        drop(session);
        assert_eq!(audio.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_send_failures_are_not_fatal() {
        let audio = FakeAudio::new();
        let log = RecordingLog::default();
        log.fail_sends(true);
        let options = SessionOptions {
            failure_streak_warn: 2,
            ..Default::default()
        };
        let (mut session, _ended) = start_with(&audio, &log, &options).await;

        audio.push(frame(1)).await;
        audio.push(frame(2)).await;
        wait_until(|| session.metrics().send_failures == 2).await;
        assert!(session.metrics().degraded);

        log.fail_sends(false);
        audio.push(frame(3)).await;
        wait_until(|| log.sent().len() == 1).await;
        let metrics = session.metrics();
        assert!(!metrics.degraded);
        assert_eq!(metrics.frames_forwarded, 1);

        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_send_hangs() {
        let audio = FakeAudio::new();
        let log = RecordingLog::default();
        log.hang_sends(true);
        let options = SessionOptions {
            stop_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (mut session, _ended) = start_with(&audio, &log, &options).await;

        audio.push(frame(1)).await;
        wait_until(|| log.send_attempts() == 1).await;

        let started = std::time::Instant::now();
        session.close().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(audio.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_source_failure_closes_transport() {
        let audio = FakeAudio::new();
        audio.fail_start(true);
        let log = RecordingLog::default();
        let (ended_tx, _ended_rx) = mpsc::unbounded_channel();
        let result = DetectionSession::create(
            Uuid::new_v4(),
            audio.create().unwrap(),
            Box::new(RecordingTransport::new(log.clone())),
            &SessionOptions::default(),
            ended_tx,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(log.close_count(), 1);
    }

    #[tokio::test]
    async fn test_source_going_away_ends_session() {
        let audio = FakeAudio::new();
        let log = RecordingLog::default();
        let (mut session, mut ended) = start_with(&audio, &log, &SessionOptions::default()).await;

        audio.push(frame(1)).await;
        wait_until(|| log.sent().len() == 1).await;

        audio.disconnect();
        let id = tokio::time::timeout(Duration::from_secs(2), ended.recv())
            .await
            .unwrap();
        assert_eq!(id, Some(session.id()));
        assert_eq!(log.close_count(), 1);

        // Closing afterwards still releases the source, and only once
        session.close().await;
        session.close().await;
        assert_eq!(log.close_count(), 1);
        assert_eq!(audio.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_close_does_not_report_ended() {
        let audio = FakeAudio::new();
        let log = RecordingLog::default();
        let (mut session, mut ended) = start_with(&audio, &log, &SessionOptions::default()).await;

        session.close().await;
        drop(session);
        assert_eq!(ended.recv().await, None);
    }

    /// Source whose device takes a while to open
    struct SlowSource {
        delay: Duration,
    }

    impl AudioSource for SlowSource {
        fn start(&mut self, _frames: mpsc::Sender<AudioFrame>) -> Result<(), AudioError> {
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn stop(&mut self) {
            std::thread::sleep(self.delay);
        }
    }

    #[tokio::test]
    async fn test_slow_source_does_not_stall_runtime() {
        // Single-threaded runtime: a blocking start would freeze the ticker
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };
        tokio::task::yield_now().await;
        let before = ticks.load(Ordering::SeqCst);

        let log = RecordingLog::default();
        let (ended_tx, _ended_rx) = mpsc::unbounded_channel();
        let mut session = DetectionSession::create(
            Uuid::new_v4(),
            Box::new(SlowSource {
                delay: Duration::from_millis(150),
            }),
            Box::new(RecordingTransport::new(log.clone())),
            &SessionOptions::default(),
            ended_tx,
        )
        .await
        .unwrap();
        assert!(ticks.load(Ordering::SeqCst) > before + 3);

        let before = ticks.load(Ordering::SeqCst);
        session.close().await;
        assert!(ticks.load(Ordering::SeqCst) > before + 3);

        ticker.abort();
    }
}
