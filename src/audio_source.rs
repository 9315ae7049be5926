/// Audio capture
///
/// `AudioSource` is the event source at the head of the frame pipeline. It
/// pushes raw capture blocks into a bounded channel through a `FrameSender`;
/// the frame pipeline thread is the only consumer. The capture callback runs
/// on the audio subsystem's real-time thread, so the handoff is a
/// `try_send` that never blocks: when the pipeline falls behind, blocks are
/// dropped and counted as overruns.

use crate::devices;
use crate::frame::{frame_period, AudioSample};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, SupportedBufferSize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Input device {0} not found (check with --show-audio-devices)")]
    DeviceNotFound(usize),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Device config error: {0}")]
    Config(String),

    #[error("Stream build error: {0}")]
    StreamBuild(String),

    #[error("Stream play error: {0}")]
    StreamPlay(String),
}

/// Requested capture parameters; capture is always mono
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Device buffer size in samples, at least one spotter frame
    pub frame_length: usize,
    pub device_index: Option<usize>,
}

/// Counters shared with the capture callback
#[derive(Debug, Default)]
pub struct CaptureCounters {
    blocks_delivered: AtomicU64,
    blocks_truncated: AtomicU64,
    overruns: AtomicU64,
}

/// Snapshot of `CaptureCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub blocks_delivered: u64,
    pub blocks_truncated: u64,
    pub overruns: u64,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            blocks_delivered: self.blocks_delivered.load(Ordering::Relaxed),
            blocks_truncated: self.blocks_truncated.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking handoff from the capture context to the frame pipeline
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Vec<AudioSample>>,
    frame_length: usize,
    counters: Arc<CaptureCounters>,
}

impl FrameSender {
    pub fn new(tx: mpsc::Sender<Vec<AudioSample>>, frame_length: usize) -> Self {
        Self {
            tx,
            frame_length,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    /// Forward one capture block
    ///
    /// Samples beyond `frame_length` are dropped here; short blocks are
    /// forwarded unchanged and rejected by the pipeline. Returns false when
    /// the block could not be queued.
    pub fn deliver(&self, block: &[AudioSample]) -> bool {
        let block = if block.len() > self.frame_length {
            self.counters.blocks_truncated.fetch_add(1, Ordering::Relaxed);
            &block[..self.frame_length]
        } else {
            block
        };

        match self.tx.try_send(block.to_vec()) {
            Ok(()) => {
                self.counters.blocks_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Source of raw capture blocks
///
/// `stop` must be idempotent, safe after a failed `start`, and must drop the
/// `FrameSender` it was given so the pipeline sees the end of the stream.
pub trait AudioSource {
    /// Begin delivering blocks to `sink`
    fn start(&mut self, sink: FrameSender) -> Result<(), DeviceError>;

    /// Stop delivery and release the device
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Human-readable device description for the startup banner
    fn description(&self) -> String;
}

/// Microphone capture through cpal
pub struct CpalSource {
    device: cpal::Device,
    device_name: String,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
    capture: CaptureConfig,
    stream: Option<cpal::Stream>,
    counters: Option<Arc<CaptureCounters>>,
}

impl CpalSource {
    /// Open the capture device at the requested parameters
    pub fn open(capture: CaptureConfig) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = match capture.device_index {
            Some(index) => devices::find_input_device(&host, index)?,
            None => host.default_input_device().ok_or(DeviceError::NoInputDevice)?,
        };

        let device_name = device.name().unwrap_or_else(|_| "Unknown Device".to_string());
        let (channels, sample_format) = Self::select_format(&device, &capture)?;

        let stream_config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(capture.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(capture.frame_length as u32),
        };

        info!(
            "Opened input device '{}' ({} Hz, {} ch, {:?}, {} frames per buffer)",
            device_name, capture.sample_rate, channels, sample_format, capture.frame_length
        );

        Ok(Self {
            device,
            device_name,
            stream_config,
            sample_format,
            capture,
            stream: None,
            counters: None,
        })
    }

    /// Pick a supported configuration covering the sample rate
    ///
    /// Mono and 16-bit are preferred; multi-channel devices are captured on
    /// their first channel and f32 devices are converted.
    fn select_format(
        device: &cpal::Device,
        capture: &CaptureConfig,
    ) -> Result<(u16, SampleFormat), DeviceError> {
        let ranges = device
            .supported_input_configs()
            .map_err(|e| DeviceError::Config(e.to_string()))?;

        let rate = cpal::SampleRate(capture.sample_rate);
        let frames = capture.frame_length as u32;

        ranges
            .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
            .filter(|range| matches!(range.sample_format(), SampleFormat::I16 | SampleFormat::F32))
            .filter(|range| match range.buffer_size() {
                SupportedBufferSize::Range { min, max } => *min <= frames && frames <= *max,
                SupportedBufferSize::Unknown => true,
            })
            .min_by_key(|range| {
                (
                    range.channels() != 1,
                    range.sample_format() != SampleFormat::I16,
                    range.channels(),
                )
            })
            .map(|range| (range.channels(), range.sample_format()))
            .ok_or_else(|| {
                DeviceError::Config(format!(
                    "no 16-bit or float input configuration at {} Hz with {} frames per buffer",
                    capture.sample_rate, capture.frame_length
                ))
            })
    }

    fn build_stream(&self, sink: FrameSender) -> Result<cpal::Stream, DeviceError> {
        match self.sample_format {
            SampleFormat::I16 => self.build_typed_stream::<i16>(sink, |s| s),
            SampleFormat::F32 => self.build_typed_stream::<f32>(sink, |s| {
                (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
            }),
            other => Err(DeviceError::Config(format!("Unsupported sample format: {:?}", other))),
        }
    }

    fn build_typed_stream<T: cpal::SizedSample + Send + 'static>(
        &self,
        sink: FrameSender,
        to_i16: fn(T) -> AudioSample,
    ) -> Result<cpal::Stream, DeviceError> {
        let channels = self.stream_config.channels as usize;

        // Reused across callbacks so the real-time thread only allocates the queued block
        let mut mono: Vec<AudioSample> = Vec::with_capacity(self.capture.frame_length);

        self.device
            .build_input_stream(
                &self.stream_config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    if channels == 1 {
                        mono.extend(data.iter().map(|&s| to_i16(s)));
                    } else {
                        mono.extend(data.chunks(channels).map(|chunk| to_i16(chunk[0])));
                    }
                    sink.deliver(&mono);
                },
                |err| error!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| DeviceError::StreamBuild(e.to_string()))
    }

    pub fn capture_stats(&self) -> Option<CaptureStats> {
        self.counters.as_ref().map(|counters| counters.snapshot())
    }
}

impl AudioSource for CpalSource {
    fn start(&mut self, sink: FrameSender) -> Result<(), DeviceError> {
        if self.stream.is_some() {
            warn!("Audio stream already running");
            return Ok(());
        }

        self.counters = Some(sink.counters());
        let stream = self.build_stream(sink)?;
        stream
            .play()
            .map_err(|e| DeviceError::StreamPlay(e.to_string()))?;

        debug!(
            "Audio stream started, frame period {:?}",
            frame_period(self.capture.frame_length, self.capture.sample_rate)
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause audio stream: {}", e);
            }
            drop(stream);

            if let Some(stats) = self.capture_stats() {
                if stats.overruns > 0 {
                    warn!("Capture dropped {} block(s) on overrun", stats.overruns);
                }
                debug!(
                    "Capture delivered {} block(s), {} cut down to one frame",
                    stats.blocks_delivered, stats.blocks_truncated
                );
            }
            info!("Audio stream closed");
        }
    }

    fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    fn description(&self) -> String {
        match self.capture.device_index {
            Some(index) => format!("{} (index {})", self.device_name, index),
            None => format!("{} (default)", self.device_name),
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}
