/// Keyword-spotting adapter
///
/// Wraps the opaque keyword-spotting capability behind a small trait and
/// turns each frame into a `Detection`. The adapter is owned by the frame
/// pipeline and is only ever driven from that one thread, since spotter
/// instances are not reentrant.

use crate::frame::{AudioSample, Detection, Frame};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Keyword spotter initialization failed: {0}")]
    Init(String),

    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Keyword file not found: {0}")]
    KeywordNotFound(PathBuf),

    #[error("Capture buffer of {configured} samples is shorter than the {required} samples the spotter requires")]
    FrameLengthTooShort { required: usize, configured: usize },

    #[error("Sample rate {configured} Hz does not match the {required} Hz the spotter requires")]
    SampleRateMismatch { required: u32, configured: u32 },

    #[error("Detection error: {0}")]
    Process(String),
}

/// Opaque keyword-spotting capability
///
/// Implementations release their native resources on drop.
#[cfg_attr(test, mockall::automock)]
pub trait KeywordSpotter: Send {
    /// Sample rate the spotter was trained for
    fn sample_rate(&self) -> u32;

    /// Number of samples the spotter consumes per call
    fn frame_length(&self) -> usize;

    /// Score one frame of exactly `frame_length()` samples
    fn process(&mut self, pcm: &[AudioSample]) -> Result<Detection, DetectorError>;
}

/// Detector statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub score_calls: u64,
    pub detections: u64,
    pub score_errors: u64,
}

/// Owns one spotter instance and exposes `score`
pub struct DetectorAdapter {
    spotter: Box<dyn KeywordSpotter>,
    keyword_count: usize,
    stats: DetectorStats,
}

impl DetectorAdapter {
    pub fn new(spotter: Box<dyn KeywordSpotter>, keyword_count: usize) -> Self {
        info!(
            "Keyword spotter ready: {} Hz, {} samples per frame, {} keyword(s)",
            spotter.sample_rate(),
            spotter.frame_length(),
            keyword_count
        );

        Self {
            spotter,
            keyword_count: keyword_count.max(1),
            stats: DetectorStats::default(),
        }
    }

    pub fn required_sample_rate(&self) -> u32 {
        self.spotter.sample_rate()
    }

    pub fn required_frame_length(&self) -> usize {
        self.spotter.frame_length()
    }

    pub fn keyword_count(&self) -> usize {
        self.keyword_count
    }

    /// Check the capture parameters against what the spotter can score
    ///
    /// The capture buffer may be longer than a spotter frame; the excess is
    /// dropped before scoring.
    pub fn check_compatible(&self, sample_rate: u32, frame_length: usize) -> Result<(), DetectorError> {
        let required_rate = self.required_sample_rate();
        if sample_rate != required_rate {
            return Err(DetectorError::SampleRateMismatch {
                required: required_rate,
                configured: sample_rate,
            });
        }

        let required_length = self.required_frame_length();
        if frame_length < required_length {
            return Err(DetectorError::FrameLengthTooShort {
                required: required_length,
                configured: frame_length,
            });
        }

        Ok(())
    }

    /// Score one frame
    ///
    /// Spotter failures are contained here: they are logged and reported as
    /// `NoMatch` so the real-time path keeps running.
    pub fn score(&mut self, frame: &Frame) -> Detection {
        self.stats.score_calls += 1;

        match self.spotter.process(frame.samples()) {
            Ok(Detection::Keyword(index)) if index >= self.keyword_count => {
                warn!("Spotter reported unknown keyword index {}, ignoring", index);
                Detection::NoMatch
            }
            Ok(detection) => {
                if detection.is_match() {
                    self.stats.detections += 1;
                }
                detection
            }
            Err(e) => {
                self.stats.score_errors += 1;
                warn!("Keyword spotter error: {}", e);
                Detection::NoMatch
            }
        }
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats
    }
}

impl Drop for DetectorAdapter {
    fn drop(&mut self) {
        debug!(
            "Releasing keyword spotter after {} score calls",
            self.stats.score_calls
        );
    }
}

/// Energy-threshold spotter
///
/// Stand-in for a trained model when the SDK is not compiled in: any frame
/// whose RMS level exceeds a sensitivity-derived threshold counts as keyword 0.
/// Useful for bench testing the trigger path with a clap or a loud word.
pub struct EnergySpotter {
    sample_rate: u32,
    frame_length: usize,
    threshold: f64,
}

impl EnergySpotter {
    pub fn new(sensitivity: f32, sample_rate: u32, frame_length: usize) -> Self {
        let sensitivity = sensitivity.clamp(0.0, 1.0) as f64;

        Self {
            sample_rate,
            frame_length,
            threshold: (1.0 - sensitivity) * 0.8,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn rms(frame: &[AudioSample]) -> f64 {
        if frame.is_empty() {
            return 0.0;
        }

        let energy: f64 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f64 / i16::MAX as f64;
                normalized * normalized
            })
            .sum();

        (energy / frame.len() as f64).sqrt()
    }
}

impl KeywordSpotter for EnergySpotter {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn process(&mut self, pcm: &[AudioSample]) -> Result<Detection, DetectorError> {
        if pcm.len() != self.frame_length {
            return Err(DetectorError::Process(format!(
                "expected {} samples, got {}",
                self.frame_length,
                pcm.len()
            )));
        }

        Ok(Detection::from_flag(Self::rms(pcm) > self.threshold))
    }
}

#[cfg(feature = "porcupine")]
pub use porcupine_spotter::PorcupineSpotter;

#[cfg(feature = "porcupine")]
mod porcupine_spotter {
    use super::{DetectorError, KeywordSpotter};
    use crate::frame::{AudioSample, Detection};
    use porcupine::{Porcupine, PorcupineBuilder};
    use std::path::{Path, PathBuf};
    use tracing::info;

    /// Porcupine SDK spotter
    pub struct PorcupineSpotter {
        porcupine: Porcupine,
    }

    impl PorcupineSpotter {
        pub fn new(
            access_key: &str,
            model_path: Option<&Path>,
            keyword_paths: &[PathBuf],
            sensitivity: f32,
        ) -> Result<Self, DetectorError> {
            if let Some(model) = model_path {
                if !model.exists() {
                    return Err(DetectorError::ModelNotFound(model.to_path_buf()));
                }
            }

            if let Some(missing) = keyword_paths.iter().find(|path| !path.exists()) {
                return Err(DetectorError::KeywordNotFound(missing.clone()));
            }

            let sensitivities = vec![sensitivity; keyword_paths.len()];
            let mut builder = PorcupineBuilder::new_with_keyword_paths(access_key, keyword_paths);
            builder.sensitivities(&sensitivities);
            if let Some(model) = model_path {
                builder.model_path(model);
            }

            let porcupine = builder
                .init()
                .map_err(|e| DetectorError::Init(e.to_string()))?;

            info!("Porcupine initialized with {} keyword(s)", keyword_paths.len());

            Ok(Self { porcupine })
        }
    }

    impl KeywordSpotter for PorcupineSpotter {
        fn sample_rate(&self) -> u32 {
            self.porcupine.sample_rate()
        }

        fn frame_length(&self) -> usize {
            self.porcupine.frame_length() as usize
        }

        fn process(&mut self, pcm: &[AudioSample]) -> Result<Detection, DetectorError> {
            self.porcupine
                .process(pcm)
                .map(Detection::from_index)
                .map_err(|e| DetectorError::Process(e.to_string()))
        }
    }
}
