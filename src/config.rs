/// Session configuration
///
/// Loaded from an optional JSON file, then overridden from the environment,
/// then (in the binary) from command-line flags.

use crate::frame::DEFAULT_SAMPLE_RATE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default cooldown after a trigger
pub const DEFAULT_COOLDOWN_SECS: f64 = 2.0;

/// Longest accepted cooldown
pub const MAX_COOLDOWN_SECS: f64 = 3600.0;

/// Default cap on in-memory recording (10 minutes)
pub const DEFAULT_MAX_RECORDING_SECS: u64 = 600;

/// Longest accepted recording cap; the whole ring is allocated up front
pub const MAX_RECORDING_SECS: u64 = 3600;

/// Default limit on one remote action request
pub const DEFAULT_REMOTE_TIMEOUT_SECS: f64 = 5.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// In-memory recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Keep every captured frame and write it out on shutdown
    pub enabled: bool,

    /// WAV destination written at shutdown
    pub output_path: Option<PathBuf>,

    /// Upper bound on buffered audio; oldest audio is overwritten beyond it
    pub max_duration_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_path: None,
            max_duration_secs: DEFAULT_MAX_RECORDING_SECS,
        }
    }
}

impl RecordingConfig {
    /// Ring capacity in samples for the given sample rate
    pub fn capacity_samples(&self, sample_rate: u32) -> usize {
        (self.max_duration_secs as usize).saturating_mul(sample_rate as usize)
    }
}

/// Remote action server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Server base address, e.g. `https://my.example.com:20726/sepia`
    pub host: Option<String>,

    /// User the remote action is issued for
    pub user_id: Option<String>,

    /// Authentication token for `user_id`
    pub token: Option<String>,

    /// Language hint sent with the trigger
    pub language: String,

    /// Target device hint
    pub device_id: Option<String>,

    /// Target channel hint
    pub channel_id: Option<String>,

    /// Client name reported to the server
    pub client_info: String,

    /// Limit on one remote action request, connect to last byte
    pub timeout_secs: f64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            user_id: None,
            token: None,
            language: "en".to_string(),
            device_id: None,
            channel_id: None,
            client_info: "wakeword_tool".to_string(),
            timeout_secs: DEFAULT_REMOTE_TIMEOUT_SECS,
        }
    }
}

impl RemoteConfig {
    /// Whether enough is configured to talk to a real server
    pub fn is_configured(&self) -> bool {
        self.host.is_some() && self.user_id.is_some() && self.token.is_some()
    }

    /// Request timeout as a duration
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs)
    }
}

/// Configuration for one monitoring session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Spotter model parameter file
    pub model_path: Option<PathBuf>,

    /// One keyword file per wake phrase
    pub keyword_paths: Vec<PathBuf>,

    /// Access key for the Porcupine SDK
    pub access_key: Option<String>,

    /// Sensitivity (0.0 - 1.0), applied to every keyword
    pub sensitivity: f32,

    /// Capture sample rate; must match what the spotter requires
    pub sample_rate: u32,

    /// Capture buffer size in samples (0 = one spotter frame); larger
    /// buffers are cut down to one frame before scoring
    pub frame_length: usize,

    /// Input device index from the device catalog (None = default device)
    pub input_device: Option<usize>,

    /// Suppression window after a trigger, in seconds
    pub cooldown_secs: f64,

    /// Capacity of the capture -> pipeline frame queue
    pub frame_queue_capacity: usize,

    /// Capacity of the pipeline -> dispatch worker queue
    pub dispatch_queue_capacity: usize,

    pub recording: RecordingConfig,

    pub remote: RemoteConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            keyword_paths: Vec::new(),
            access_key: None,
            sensitivity: 0.5,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_length: 0,
            input_device: None,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            frame_queue_capacity: 64,
            dispatch_queue_capacity: 4,
            recording: RecordingConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let json = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Apply overrides from process environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides using an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("WAKEWORD_MODEL_PATH") {
            self.model_path = Some(path.into());
        }

        if let Some(paths) = lookup("WAKEWORD_KEYWORD_PATHS") {
            self.keyword_paths = split_paths(&paths);
        }

        if let Some(value) = lookup("WAKEWORD_SENSITIVITY") {
            self.sensitivity = parse_env("WAKEWORD_SENSITIVITY", &value)?;
        }

        if let Some(value) = lookup("WAKEWORD_INPUT_DEVICE") {
            self.input_device = Some(parse_env("WAKEWORD_INPUT_DEVICE", &value)?);
        }

        if let Some(value) = lookup("WAKEWORD_FRAME_LENGTH") {
            self.frame_length = parse_env("WAKEWORD_FRAME_LENGTH", &value)?;
        }

        if let Some(value) = lookup("WAKEWORD_COOLDOWN_SECS") {
            self.cooldown_secs = parse_env("WAKEWORD_COOLDOWN_SECS", &value)?;
        }

        if let Some(path) = lookup("WAKEWORD_OUTPUT_PATH") {
            self.recording.output_path = Some(path.into());
            self.recording.enabled = true;
        }

        if let Some(key) = lookup("PORCUPINE_ACCESS_KEY") {
            self.access_key = Some(key);
        }

        if let Some(host) = lookup("REMOTE_HOST") {
            self.remote.host = Some(host);
        }

        if let Some(user_id) = lookup("REMOTE_USER_ID") {
            self.remote.user_id = Some(user_id);
        }

        if let Some(token) = lookup("REMOTE_TOKEN") {
            self.remote.token = Some(token);
        }

        if let Some(language) = lookup("REMOTE_LANGUAGE") {
            self.remote.language = language;
        }

        if let Some(value) = lookup("REMOTE_TIMEOUT_SECS") {
            self.remote.timeout_secs = parse_env("REMOTE_TIMEOUT_SECS", &value)?;
        }

        Ok(())
    }

    /// Cooldown as a duration
    pub fn cooldown(&self) -> Duration {
        seconds(self.cooldown_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keyword_paths.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one keyword file is required".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(ConfigError::Invalid(
                "Sensitivity must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "Sample rate must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=MAX_COOLDOWN_SECS).contains(&self.cooldown_secs) {
            return Err(ConfigError::Invalid(format!(
                "Cooldown must be between 0 and {} seconds, got {}",
                MAX_COOLDOWN_SECS, self.cooldown_secs
            )));
        }

        if !(self.remote.timeout_secs > 0.0 && self.remote.timeout_secs <= MAX_COOLDOWN_SECS) {
            return Err(ConfigError::Invalid(format!(
                "Remote timeout must be between 0 and {} seconds, got {}",
                MAX_COOLDOWN_SECS, self.remote.timeout_secs
            )));
        }

        if self.frame_queue_capacity == 0 || self.dispatch_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "Queue capacities must be greater than 0".to_string(),
            ));
        }

        if self.recording.enabled {
            if self.recording.output_path.is_none() {
                return Err(ConfigError::Invalid(
                    "Recording is enabled but no output path is set".to_string(),
                ));
            }
            if !(1..=MAX_RECORDING_SECS).contains(&self.recording.max_duration_secs) {
                return Err(ConfigError::Invalid(format!(
                    "Recording max duration must be between 1 and {} seconds, got {}",
                    MAX_RECORDING_SECS, self.recording.max_duration_secs
                )));
            }
        }

        for path in &self.keyword_paths {
            if !path.exists() {
                warn!("Keyword file not found: {}", path.display());
                // Left to the spotter to reject; the energy spotter ignores them
            }
        }

        Ok(())
    }
}

/// Split a comma-separated path list, trimming whitespace around entries
pub fn split_paths(list: &str) -> Vec<PathBuf> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Seconds to a duration; negative and NaN clamp to zero, overflow saturates
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
