//! Audio capture for the wake word session
//!
//! An [`AudioSource`] pushes fixed-size PCM16 mono frames into a channel
//! owned by the detection session. The microphone implementation uses CPAL;
//! tests plug in their own sources.

mod framing;
pub mod microphone;

pub use framing::{downsample, interleaved_to_mono, resample_linear, FrameAssembler};
pub use microphone::{CaptureOptions, MicrophoneFactory, MicrophoneSource};

use std::time::Duration;

use tokio::sync::mpsc;

/// One frame of PCM16 mono audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Errors that can occur while starting audio capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    /// Capture thread exited before reporting readiness
    CaptureThreadFailed(String),
    /// Source was started twice without a stop in between
    AlreadyStarted,
    /// Input device did not finish opening in time
    DeviceOpenTimeout(Duration),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::CaptureThreadFailed(e) => write!(f, "Audio capture thread failed: {}", e),
            AudioError::AlreadyStarted => write!(f, "Audio source already started"),
            AudioError::DeviceOpenTimeout(limit) => {
                write!(f, "Audio device did not open within {:?}", limit)
            }
        }
    }
}

impl std::error::Error for AudioError {}

/// Produces audio frames for one detection session.
///
/// `start` begins delivering frames into `frames`; `stop` ends delivery and
/// releases the device. `stop` must be idempotent.
pub trait AudioSource: Send {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<(), AudioError>;

    fn stop(&mut self);
}

/// Creates a fresh audio source for each session
pub trait AudioSourceFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Box<dyn AudioSource>, AudioError>;
}
