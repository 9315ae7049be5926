/// Monitoring session
///
/// Owns every resource of one run and their lifecycle:
///
/// - the keyword spotter (inside the frame pipeline)
/// - the audio source
/// - the frame pipeline thread
/// - the dispatch worker task
/// - the recording buffer
///
/// Startup acquires the spotter before the stream. Shutdown releases in
/// reverse order: the stream is stopped first, which closes the frame
/// channel and lets the pipeline thread exit and drop the spotter.

use crate::audio_source::{AudioSource, CaptureConfig, DeviceError, FrameSender};
use crate::config::{ConfigError, SessionConfig};
use crate::detector::{DetectorAdapter, DetectorError, DetectorStats};
use crate::dispatch::{DispatchHints, DispatchStats, DispatchWorker, RemoteNotifier};
use crate::pipeline::{FramePipeline, PipelineReport, PipelineStats};
use crate::recording::{FlushError, RecordingBuffer};
use crate::trigger::{TriggerEvent, TriggerState, TriggerStateHandle, TriggerStateMachine, TriggerStats};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for an in-flight remote action
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Recording error: {0}")]
    Recording(#[from] FlushError),

    #[error("Failed to spawn frame pipeline: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Session already started")]
    AlreadyStarted,
}

/// Resolve capture parameters against the spotter's requirements
///
/// The configured frame length is the capture buffer size. 0 means "one
/// spotter frame"; a larger buffer is allowed and each block is cut down to
/// the spotter's frame before scoring.
pub fn capture_config(
    config: &SessionConfig,
    detector: &DetectorAdapter,
) -> Result<CaptureConfig, DetectorError> {
    let frame_length = if config.frame_length == 0 {
        detector.required_frame_length()
    } else {
        config.frame_length
    };

    detector.check_compatible(config.sample_rate, frame_length)?;

    Ok(CaptureConfig {
        sample_rate: config.sample_rate,
        frame_length,
        device_index: config.input_device,
    })
}

/// Final statistics of a session
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub pipeline: PipelineStats,
    pub detector: DetectorStats,
    pub trigger: TriggerStats,
    pub dispatch: Option<DispatchStats>,
    pub recording_path: Option<PathBuf>,
    pub recording_samples: usize,
    /// Oldest samples lost because the recording hit its cap
    pub recording_overwritten: u64,
}

pub struct Session {
    config: SessionConfig,
    state: TriggerStateHandle,
    detector: Option<DetectorAdapter>,
    source: Option<Box<dyn AudioSource>>,
    notifier: Arc<dyn RemoteNotifier>,
    pipeline: Option<thread::JoinHandle<PipelineReport>>,
    dispatcher: Option<JoinHandle<DispatchStats>>,
    stopped: bool,
}

impl Session {
    /// Create a session from an acquired spotter and an opened source
    pub fn new(
        config: SessionConfig,
        detector: DetectorAdapter,
        source: Box<dyn AudioSource>,
        notifier: Arc<dyn RemoteNotifier>,
    ) -> Self {
        Self {
            config,
            state: TriggerStateHandle::new(),
            detector: Some(detector),
            source: Some(source),
            notifier,
            pipeline: None,
            dispatcher: None,
            stopped: false,
        }
    }

    /// Shared view of the trigger state
    pub fn state(&self) -> TriggerStateHandle {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.source.as_ref().map_or(false, |source| source.is_running())
    }

    /// Start the dispatch worker, the frame pipeline and the audio stream
    ///
    /// Must be called from within a Tokio runtime. On error the caller is
    /// still expected to call `shutdown` to release whatever was acquired.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let detector = self.detector.take().ok_or(SessionError::AlreadyStarted)?;

        let capture = match capture_config(&self.config, &detector) {
            Ok(capture) => capture,
            Err(e) => {
                self.detector = Some(detector);
                return Err(e.into());
            }
        };

        let recording = if self.config.recording.enabled {
            let capacity = self.config.recording.capacity_samples(capture.sample_rate);
            match RecordingBuffer::with_capacity(capacity, capture.sample_rate) {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    self.detector = Some(detector);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let keyword_count = detector.keyword_count();
        let spotter_frame_length = detector.required_frame_length();

        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.config.dispatch_queue_capacity);
        self.dispatcher = Some(DispatchWorker::spawn(self.notifier.clone(), dispatch_rx));

        let trigger = TriggerStateMachine::new(
            self.state.clone(),
            self.config.cooldown(),
            DispatchHints::from(&self.config.remote),
            dispatch_tx,
        );

        let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_queue_capacity);
        let pipeline = FramePipeline::new(detector, trigger, recording);
        self.pipeline = Some(pipeline.spawn(frame_rx).map_err(SessionError::Spawn)?);

        let source = self.source.as_mut().ok_or(SessionError::AlreadyStarted)?;
        source.start(FrameSender::new(frame_tx, spotter_frame_length))?;

        if let Err(e) = self.state.apply(TriggerEvent::StreamStarted) {
            warn!("Unexpected trigger state at startup: {}", e);
        }

        let description = source.description();
        self.log_banner(&description, &capture, spotter_frame_length, keyword_count);

        Ok(())
    }

    fn log_banner(
        &self,
        device: &str,
        capture: &CaptureConfig,
        spotter_frame_length: usize,
        keyword_count: usize,
    ) {
        info!("Using input device: {}", device);
        info!(
            "Audio: {} Hz, 1 channel, 16-bit, {} samples per frame",
            capture.sample_rate, spotter_frame_length
        );
        if capture.frame_length > spotter_frame_length {
            info!(
                "Capture buffer: {} samples, excess beyond one frame is dropped",
                capture.frame_length
            );
        }
        for path in &self.config.keyword_paths {
            info!("Keyword file: {}", path.display());
        }
        if keyword_count > 1 {
            info!("Listening for {} keywords (cooldown {:?})", keyword_count, self.config.cooldown());
        } else {
            info!("Listening for wake-word (cooldown {:?})", self.config.cooldown());
        }
        if self.config.recording.enabled {
            if let Some(path) = &self.config.recording.output_path {
                info!("Recording to {} on shutdown", path.display());
            }
        }
    }

    /// Wait for `signal`, then shut down
    pub async fn run_until<F>(&mut self, signal: F) -> ShutdownReport
    where
        F: std::future::Future<Output = ()>,
    {
        signal.await;
        info!("Stopping ...");
        self.shutdown().await
    }

    /// Stop everything and release resources in reverse acquisition order
    ///
    /// Safe to call more than once and after a failed `start`; later calls
    /// return an empty report.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        if self.stopped {
            debug!("Session already shut down");
            return report;
        }
        self.stopped = true;

        if let Some(mut source) = self.source.take() {
            source.stop();
            drop(source);
        }

        if self.state.get() != TriggerState::Inactive {
            if let Err(e) = self.state.apply(TriggerEvent::Shutdown) {
                debug!("Trigger state at shutdown: {}", e);
            }
        }

        // Never started: release the spotter directly
        if let Some(detector) = self.detector.take() {
            report.detector = detector.stats();
            drop(detector);
        }

        let mut recording = None;
        if let Some(pipeline) = self.pipeline.take() {
            match tokio::task::spawn_blocking(move || pipeline.join()).await {
                Ok(Ok(pipeline_report)) => {
                    report.pipeline = pipeline_report.stats;
                    report.detector = pipeline_report.detector;
                    report.trigger = pipeline_report.trigger;
                    recording = pipeline_report.recording;
                }
                Ok(Err(_)) => error!("Frame pipeline thread panicked"),
                Err(e) => error!("Failed to join frame pipeline: {}", e),
            }
        }

        if let (Some(buffer), Some(path)) = (recording, self.config.recording.output_path.clone()) {
            report.recording_overwritten = buffer.samples_overwritten();
            if report.recording_overwritten > 0 {
                warn!(
                    "Recording is truncated: oldest {:.1}s were overwritten",
                    report.recording_overwritten as f64 / buffer.sample_rate() as f64
                );
            }

            let target = path.clone();
            match tokio::task::spawn_blocking(move || buffer.flush(&target)).await {
                Ok(Ok(samples)) => {
                    report.recording_samples = samples;
                    if samples > 0 {
                        report.recording_path = Some(path);
                    }
                }
                Ok(Err(e)) => error!("{}", e),
                Err(e) => error!("Recording flush task failed: {}", e),
            }
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            match tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, dispatcher).await {
                Ok(Ok(stats)) => report.dispatch = Some(stats),
                Ok(Err(e)) => error!("Dispatch worker failed: {}", e),
                Err(_) => warn!("Dispatch worker did not finish within {:?}", DISPATCH_DRAIN_TIMEOUT),
            }
        }

        info!(
            "Session stopped: {} frames, {} trigger(s), {} suppressed",
            report.pipeline.frames_processed, report.trigger.triggers, report.trigger.suppressed
        );

        report
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut source) = self.source.take() {
            warn!("Session dropped without shutdown, stopping audio stream");
            source.stop();
        }
    }
}
