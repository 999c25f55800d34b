//! Microphone audio source using CPAL
//!
//! CPAL streams are not `Send`, so each source owns a dedicated capture
//! thread that builds the stream, plays it, and parks until told to stop.
//! The data callback converts to mono PCM16, resamples to the target rate,
//! assembles fixed-size frames and `try_send`s them to the session. Frames are
//! dropped when the session falls behind; stale audio is useless to a wake
//! word recognizer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::framing::{downsample, interleaved_to_mono, resample_linear, FrameAssembler};
use super::{AudioError, AudioFrame, AudioSource, AudioSourceFactory};

/// How long a device may take to open before start gives up on it
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capture parameters
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Sample rate delivered to the session (16kHz for wake word recognizers)
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_samples: usize,
    /// Preferred input device name; default device when `None` or not found
    pub device_name: Option<String>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_samples: 1024,
            device_name: None,
        }
    }
}

/// Creates a [`MicrophoneSource`] per session
pub struct MicrophoneFactory {
    options: CaptureOptions,
}

impl MicrophoneFactory {
    pub fn new(options: CaptureOptions) -> Self {
        Self { options }
    }
}

impl AudioSourceFactory for MicrophoneFactory {
    fn create(&self) -> Result<Box<dyn AudioSource>, AudioError> {
        Ok(Box::new(MicrophoneSource::new(self.options.clone())))
    }
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
    dropped_frames: Arc<AtomicU64>,
}

/// Audio source capturing from an input device
pub struct MicrophoneSource {
    options: CaptureOptions,
    worker: Option<CaptureWorker>,
}

impl MicrophoneSource {
    pub fn new(options: CaptureOptions) -> Self {
        Self {
            options,
            worker: None,
        }
    }
}

impl AudioSource for MicrophoneSource {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<(), AudioError> {
        if self.worker.is_some() {
            return Err(AudioError::AlreadyStarted);
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let dropped_frames = Arc::new(AtomicU64::new(0));

        let options = self.options.clone();
        let dropped = dropped_frames.clone();
        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(&options, frames, dropped) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Park until stop() (or the source is dropped, closing the channel)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Audio capture thread exiting");
            })
            .map_err(|e| AudioError::CaptureThreadFailed(e.to_string()))?;

        match wait_ready(&ready_rx, DEVICE_OPEN_TIMEOUT) {
            Ok(()) => {
                log::info!("Microphone capture started");
                self.worker = Some(CaptureWorker {
                    stop_tx,
                    thread,
                    dropped_frames,
                });
                Ok(())
            }
            Err(AudioError::DeviceOpenTimeout(limit)) => {
                // The thread may still be stuck in the driver. Dropping stop_tx
                // makes it exit as soon as the open returns; it is not joined.
                drop(stop_tx);
                log::error!("Audio device did not open within {:?}", limit);
                Err(AudioError::DeviceOpenTimeout(limit))
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.stop_tx.send(());
        if worker.thread.join().is_err() {
            log::error!("Audio capture thread panicked");
        }

        let dropped = worker.dropped_frames.load(Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("Microphone capture stopped, {} frames dropped (session busy)", dropped);
        } else {
            log::info!("Microphone capture stopped");
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for the capture thread to report whether the stream is playing
fn wait_ready(
    ready_rx: &std_mpsc::Receiver<Result<(), AudioError>>,
    limit: Duration,
) -> Result<(), AudioError> {
    match ready_rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(std_mpsc::RecvTimeoutError::Timeout) => Err(AudioError::DeviceOpenTimeout(limit)),
        Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(AudioError::CaptureThreadFailed(
            "exited before the stream was ready".to_string(),
        )),
    }
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, AudioError> {
    if let Some(wanted) = name {
        let found = host.input_devices().ok().and_then(|mut devices| {
            devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
        });
        match found {
            Some(device) => return Ok(device),
            None => log::warn!("Input device {:?} not found, using default", wanted),
        }
    }

    host.default_input_device().ok_or(AudioError::NoInputDevice)
}

/// Prefer a config that runs natively at the target rate; fall back to the default
fn select_config(
    device: &Device,
    target_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let native = device.supported_input_configs().ok().and_then(|configs| {
        configs
            .filter(|c| {
                matches!(
                    c.sample_format(),
                    SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                )
            })
            .find(|c| {
                c.min_sample_rate().0 <= target_rate && c.max_sample_rate().0 >= target_rate
            })
            .map(|c| c.with_sample_rate(SampleRate(target_rate)))
    });

    let supported = match native {
        Some(config) => config,
        None => device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?,
    };

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    Ok((supported.into(), sample_format))
}

fn open_stream(
    options: &CaptureOptions,
    frames: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = select_device(&host, options.device_name.as_deref())?;
    log::info!("Using audio input device: {:?}", device.name());

    let (config, sample_format) = select_config(&device, options.sample_rate)?;

    let pipeline = CapturePipeline {
        channels: config.channels,
        source_rate: config.sample_rate.0,
        target_rate: options.sample_rate,
        assembler: FrameAssembler::new(options.frame_samples, options.sample_rate),
        frames,
        dropped,
    };

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, pipeline),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, pipeline),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, pipeline),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

/// State owned by the data callback
struct CapturePipeline {
    channels: u16,
    source_rate: u32,
    target_rate: u32,
    assembler: FrameAssembler,
    frames: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl CapturePipeline {
    fn process(&mut self, interleaved: &[i16]) {
        let mono = interleaved_to_mono(interleaved, self.channels);
        let resampled = downsample(&mono, self.source_rate, self.target_rate)
            .unwrap_or_else(|| resample_linear(&mono, self.source_rate, self.target_rate));

        for frame in self.assembler.push(&resampled) {
            if self.frames.try_send(frame).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut pipeline: CapturePipeline,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_fn = |err| log::error!("Audio stream error: {}", err);
    let mut scratch: Vec<i16> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| sample_to_i16(s)));
                pipeline.process(&scratch);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Convert any sample type to i16
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = sample.to_sample::<f32>();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
