/// Frame and detection types
///
/// A frame is the atomic unit of capture and detection: a fixed-length block
/// of mono 16-bit PCM samples. Raw blocks coming from the capture device are
/// only promoted to a `Frame` once their length has been checked.

use std::time::Duration;
use thiserror::Error;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Sample rate expected by the keyword spotters we ship with
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Frame length used when neither the spotter nor the operator specifies one
pub const DEFAULT_FRAME_LENGTH: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame size mismatch: expected {expected} samples, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Fixed-length block of mono PCM samples, immutable once captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: Box<[AudioSample]>,
}

impl Frame {
    /// Promote a raw capture block to a frame of exactly `frame_length` samples
    pub fn new(samples: Vec<AudioSample>, frame_length: usize) -> Result<Self, FrameError> {
        if samples.len() != frame_length {
            return Err(FrameError::SizeMismatch {
                expected: frame_length,
                actual: samples.len(),
            });
        }

        Ok(Self {
            samples: samples.into_boxed_slice(),
        })
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of scoring one frame
///
/// Produced exactly once per frame and never revised afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// No keyword matched in this frame
    NoMatch,

    /// Keyword with the given index (into the configured keyword list) matched
    Keyword(usize),
}

impl Detection {
    /// Interpret a spotter's raw result, where any negative value means "no match"
    pub fn from_index(raw: i32) -> Self {
        usize::try_from(raw)
            .map(Detection::Keyword)
            .unwrap_or(Detection::NoMatch)
    }

    /// Interpret a single-keyword boolean result
    pub fn from_flag(detected: bool) -> Self {
        if detected {
            Detection::Keyword(0)
        } else {
            Detection::NoMatch
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Detection::Keyword(_))
    }

    pub fn keyword_index(&self) -> Option<usize> {
        match self {
            Detection::Keyword(index) => Some(*index),
            Detection::NoMatch => None,
        }
    }
}

/// Wall-clock duration covered by one frame
///
/// This is the budget the frame handler has before the capture subsystem
/// starts overrunning its buffers.
pub fn frame_period(frame_length: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frame_length as f64 / sample_rate as f64)
}
