//! Fakes shared by unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::audio::{AudioError, AudioFrame, AudioSource, AudioSourceFactory};
use crate::detector::{
    parse_endpoint, DetectorBackend, DetectorConfig, DetectorRegistry, DetectorTransport,
    TransportError,
};

/// Poll `condition` until it holds, panicking after two seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct FakeAudioShared {
    sender: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
}

/// Audio source factory whose frames are pushed by the test
#[derive(Clone, Default)]
pub struct FakeAudio {
    shared: Arc<FakeAudioShared>,
}

impl FakeAudio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a frame to the running source, if any
    pub async fn push(&self, frame: AudioFrame) {
        let sender = self.shared.sender.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(frame).await;
        }
    }

    /// Drop the frame sender as a device unplug would, without stopping the source
    pub fn disconnect(&self) {
        self.shared.sender.lock().take();
    }

    pub fn fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.shared.stops.load(Ordering::SeqCst)
    }
}

impl AudioSourceFactory for FakeAudio {
    fn create(&self) -> Result<Box<dyn AudioSource>, AudioError> {
        Ok(Box::new(FakeSource {
            shared: self.shared.clone(),
            started: false,
        }))
    }
}

struct FakeSource {
    shared: Arc<FakeAudioShared>,
    started: bool,
}

impl AudioSource for FakeSource {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<(), AudioError> {
        if self.shared.fail_start.load(Ordering::SeqCst) {
            return Err(AudioError::NoInputDevice);
        }
        *self.shared.sender.lock() = Some(frames);
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.shared.sender.lock().take();
        self.shared.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct LogInner {
    sent: Vec<AudioFrame>,
    binds: Vec<DetectorConfig>,
    send_attempts: usize,
    closes: usize,
    fail_sends: bool,
    hang_sends: bool,
    fail_binds: bool,
}

/// Records everything the fake detector backend and its transports see
#[derive(Clone, Default)]
pub struct RecordingLog {
    inner: Arc<Mutex<LogInner>>,
}

impl RecordingLog {
    pub fn sent(&self) -> Vec<AudioFrame> {
        self.inner.lock().sent.clone()
    }

    pub fn binds(&self) -> Vec<DetectorConfig> {
        self.inner.lock().binds.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.inner.lock().send_attempts
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().closes
    }

    pub fn fail_sends(&self, fail: bool) {
        self.inner.lock().fail_sends = fail;
    }

    pub fn hang_sends(&self, hang: bool) {
        self.inner.lock().hang_sends = hang;
    }

    pub fn fail_binds(&self, fail: bool) {
        self.inner.lock().fail_binds = fail;
    }
}

pub struct RecordingTransport {
    log: RecordingLog,
    closed: bool,
}

impl RecordingTransport {
    pub fn new(log: RecordingLog) -> Self {
        Self { log, closed: false }
    }
}

#[async_trait]
impl DetectorTransport for RecordingTransport {
    async fn send(&mut self, frame: &AudioFrame) -> Result<(), TransportError> {
        let (hang, fail) = {
            let mut inner = self.log.inner.lock();
            inner.send_attempts += 1;
            (inner.hang_sends, inner.fail_sends)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(TransportError::SendFailed("connection refused".to_string()));
        }

        self.log.inner.lock().sent.push(frame.clone());
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.inner.lock().closes += 1;
        }
    }
}

/// Stands in for the UDP backend without touching the network
pub struct RecordingBackend {
    log: RecordingLog,
}

#[async_trait]
impl DetectorBackend for RecordingBackend {
    fn kind(&self) -> &'static str {
        "UDP"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["network"]
    }

    fn parse(&self, args: &Map<String, Value>) -> Result<DetectorConfig, String> {
        let (address, port) = parse_endpoint(args)?;
        Ok(DetectorConfig::Udp { address, port })
    }

    async fn bind(
        &self,
        config: &DetectorConfig,
    ) -> Result<Box<dyn DetectorTransport>, TransportError> {
        {
            let mut inner = self.log.inner.lock();
            if inner.fail_binds {
                return Err(TransportError::ResolveFailed("no such host".to_string()));
            }
            inner.binds.push(config.clone());
        }
        Ok(Box::new(RecordingTransport::new(self.log.clone())))
    }
}

pub fn recording_registry(log: &RecordingLog) -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    registry.register(RecordingBackend { log: log.clone() });
    registry
}
