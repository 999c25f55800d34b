use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::CaptureOptions;
use crate::control::protocol::DEFAULT_CONTROL_ADDR;
use crate::detector::MAX_FRAME_SAMPLES;
use crate::session::SessionOptions;

/// Sample rates a capture device and recognizer can reasonably agree on
const MIN_SAMPLE_RATE: u32 = 8000;
const MAX_SAMPLE_RATE: u32 = 48000;

const SETTINGS_FILE_NAME: &str = "settings.json";
const SETTINGS_DIR_NAME: &str = "wakeword-service";

/// Environment variable overriding the settings file location
pub const SETTINGS_PATH_ENV: &str = "WAKEWORD_SETTINGS";

/// Detector to start as soon as the service is up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutostartSettings {
    /// Detector kind, e.g. "UDP"
    pub kind: String,
    /// Detector arguments, e.g. `{"address": "10.0.0.5", "port": 12202}`
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// WebSocket control endpoint. Empty disables it.
    pub control_addr: String,

    /// Sample rate delivered to the detector.
    pub sample_rate: u32,

    /// Samples per audio frame (one datagram per frame for UDP).
    pub frame_samples: usize,

    /// Frames buffered between the capture thread and the frame loop.
    /// Further frames are dropped while the buffer is full.
    pub frame_queue: usize,

    /// How long stop waits for the frame loop before aborting it.
    pub stop_timeout_ms: u64,

    /// Consecutive send failures after which a session is reported degraded.
    /// 0 disables the warning.
    pub failure_streak_warn: u32,

    /// Preferred input device name; the default device is used when unset or missing.
    pub input_device: Option<String>,

    /// Detector started on boot.
    pub autostart: Option<AutostartSettings>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            sample_rate: 16000,
            frame_samples: 1024,
            frame_queue: 64,
            stop_timeout_ms: 500,
            failure_streak_warn: 50,
            input_device: None,
            autostart: None,
        }
    }
}

impl ServiceSettings {
    /// Clamp values that would leave a session running but unable to deliver audio
    pub fn validated(mut self) -> Self {
        let sample_rate = self.sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE);
        if sample_rate != self.sample_rate {
            log::warn!(
                "Settings: sample_rate {} out of range, using {}",
                self.sample_rate,
                sample_rate
            );
            self.sample_rate = sample_rate;
        }

        // Every frame must fit in a single datagram
        let frame_samples = self.frame_samples.clamp(1, MAX_FRAME_SAMPLES);
        if frame_samples != self.frame_samples {
            log::warn!(
                "Settings: frame_samples {} out of range, using {}",
                self.frame_samples,
                frame_samples
            );
            self.frame_samples = frame_samples;
        }

        if self.frame_queue == 0 {
            log::warn!("Settings: frame_queue 0 is not allowed, using 1");
            self.frame_queue = 1;
        }

        self
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            frame_queue: self.frame_queue,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            failure_streak_warn: self.failure_streak_warn,
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            sample_rate: self.sample_rate,
            frame_samples: self.frame_samples,
            device_name: self.input_device.clone(),
        }
    }

    /// Control endpoint address, `None` when disabled
    pub fn control_addr(&self) -> Option<&str> {
        Some(self.control_addr.trim()).filter(|a| !a.is_empty())
    }
}

/// Errors locating the settings file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    NoConfigDir,
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::NoConfigDir => write!(f, "Could not determine config directory"),
        }
    }
}

impl std::error::Error for SettingsError {}

/// `$WAKEWORD_SETTINGS`, else `<config dir>/wakeword-service/settings.json`
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    if let Some(path) = std::env::var_os(SETTINGS_PATH_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location, falling back to defaults
pub fn load_settings() -> ServiceSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ServiceSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> ServiceSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ServiceSettings>(&contents) {
            Ok(settings) => {
                log::info!("Settings: loaded {:?}", path);
                settings.validated()
            }
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ServiceSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ServiceSettings::default()
        }
    }
}
