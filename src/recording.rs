/// Session recording buffer
///
/// Keeps every well-formed frame of the run in capture order in a bounded
/// ring, and writes it out once as a 16-bit mono WAV file at shutdown.
/// Appending never touches the disk; once the ring is full the oldest audio
/// is overwritten.

use crate::frame::{AudioSample, Frame};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum FlushError {
    #[error("Failed to write recording: {0}")]
    Wav(#[from] hound::Error),

    #[error("Invalid recording capacity: {0}")]
    InvalidCapacity(usize),
}

/// Bounded, append-only frame recorder
pub struct RecordingBuffer {
    producer: HeapProd<AudioSample>,
    consumer: HeapCons<AudioSample>,
    sample_rate: u32,
    frames_appended: u64,
    samples_overwritten: u64,
}

impl RecordingBuffer {
    /// Create a recorder holding at most `capacity` samples
    pub fn with_capacity(capacity: usize, sample_rate: u32) -> Result<Self, FlushError> {
        if capacity == 0 {
            return Err(FlushError::InvalidCapacity(capacity));
        }

        debug!("Creating recording buffer with capacity: {} samples", capacity);

        let (producer, consumer) = HeapRb::<AudioSample>::new(capacity).split();

        Ok(Self {
            producer,
            consumer,
            sample_rate,
            frames_appended: 0,
            samples_overwritten: 0,
        })
    }

    /// Append one frame
    pub fn append(&mut self, frame: &Frame) {
        let samples = frame.samples();
        let capacity = self.capacity();

        // A frame larger than the whole ring keeps only its tail
        let samples = &samples[samples.len().saturating_sub(capacity)..];

        let vacant = self.producer.vacant_len();
        if samples.len() > vacant {
            let to_drop = samples.len() - vacant;
            self.consumer.skip(to_drop);

            if self.samples_overwritten == 0 {
                warn!(
                    "Recording buffer full ({:.0}s), overwriting oldest audio",
                    capacity as f32 / self.sample_rate as f32
                );
            }
            self.samples_overwritten += to_drop as u64;
        }

        self.producer.push_slice(samples);
        self.frames_appended += 1;
    }

    /// Copy of the buffered samples in capture order
    pub fn samples(&self) -> Vec<AudioSample> {
        self.consumer.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_appended(&self) -> u64 {
        self.frames_appended
    }

    pub fn samples_overwritten(&self) -> u64 {
        self.samples_overwritten
    }

    /// Duration of buffered audio in seconds
    pub fn duration_secs(&self) -> f32 {
        self.len() as f32 / self.sample_rate as f32
    }

    /// Write the recording to `path` and consume the buffer
    ///
    /// Returns the number of samples written. Nothing is written for an
    /// empty recording.
    pub fn flush(mut self, path: &Path) -> Result<usize, FlushError> {
        if self.is_empty() {
            info!("Recording is empty, nothing written to {}", path.display());
            return Ok(0);
        }

        let mut samples = vec![0; self.len()];
        let read = self.consumer.pop_slice(&mut samples);
        samples.truncate(read);

        write_wav(path, &samples, self.sample_rate)?;

        info!(
            "Recording saved to {} ({} frames, {:.1}s)",
            path.display(),
            self.frames_appended,
            samples.len() as f32 / self.sample_rate as f32
        );

        Ok(samples.len())
    }
}

/// Write mono 16-bit PCM samples to a WAV file
pub fn write_wav(path: &Path, samples: &[AudioSample], sample_rate: u32) -> Result<(), FlushError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    Ok(())
}
