/// Wake-word remote trigger library
///
/// Listens to a microphone, scores every audio frame with a keyword
/// spotter, and fires one debounced remote action per wake event. Capture,
/// scoring and network dispatch run in separate contexts joined by bounded
/// queues, so a slow server never stalls the audio path.

pub mod audio_source;
pub mod config;
pub mod detector;
pub mod devices;
pub mod dispatch;
pub mod frame;
pub mod pipeline;
pub mod recording;
pub mod session;
pub mod trigger;

// Re-export main types
pub use audio_source::{AudioSource, CaptureConfig, CpalSource, DeviceError, FrameSender};
pub use config::{ConfigError, RecordingConfig, RemoteConfig, SessionConfig};
pub use detector::{DetectorAdapter, DetectorError, EnergySpotter, KeywordSpotter};
pub use devices::{list_input_devices, InputDeviceInfo};
pub use dispatch::{
    DispatchError, DispatchHints, DispatchRequest, DispatchWorker, HttpRemoteNotifier, LogNotifier,
    RemoteNotifier,
};
pub use frame::{AudioSample, Detection, Frame, FrameError, DEFAULT_SAMPLE_RATE};
pub use pipeline::{FrameOutcome, FramePipeline, PipelineReport, PipelineStats};
pub use recording::{FlushError, RecordingBuffer};
pub use session::{capture_config, Session, SessionError, ShutdownReport};
pub use trigger::{TriggerEvent, TriggerState, TriggerStateHandle, TriggerStateMachine};

#[cfg(feature = "porcupine")]
pub use detector::PorcupineSpotter;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wakeword_remote=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
