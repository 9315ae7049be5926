/// Frame pipeline
///
/// The single consumer of capture blocks and the only context that touches
/// the keyword spotter. For every block, in arrival order:
///
/// 1. reject blocks that are not exactly one frame long
/// 2. append the frame to the recording, whatever the trigger state
/// 3. expire the cooldown if its deadline has passed
/// 4. score the frame, but only while listening
/// 5. feed the detection to the trigger state machine
///
/// None of these steps performs I/O.

use crate::detector::{DetectorAdapter, DetectorStats};
use crate::frame::{AudioSample, Frame};
use crate::recording::RecordingBuffer;
use crate::trigger::{TriggerOutcome, TriggerState, TriggerStateMachine, TriggerStats};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the pipeline did with one capture block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Wrong length, discarded before scoring
    Dropped,

    /// Not scored because the trigger is not listening
    NotScored(TriggerState),

    /// Scored, nothing matched
    NoMatch,

    /// Scored and triggered a dispatch
    Triggered { keyword_index: usize },

    /// Scored and matched, but discarded
    Suppressed { keyword_index: usize },
}

/// Pipeline statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
}

/// Everything the pipeline hands back once its input closes
pub struct PipelineReport {
    pub stats: PipelineStats,
    pub detector: DetectorStats,
    pub trigger: TriggerStats,
    pub recording: Option<RecordingBuffer>,
}

pub struct FramePipeline {
    frame_length: usize,
    detector: DetectorAdapter,
    trigger: TriggerStateMachine,
    recording: Option<RecordingBuffer>,
    stats: PipelineStats,
}

impl FramePipeline {
    pub fn new(
        detector: DetectorAdapter,
        trigger: TriggerStateMachine,
        recording: Option<RecordingBuffer>,
    ) -> Self {
        Self {
            frame_length: detector.required_frame_length(),
            detector,
            trigger,
            recording,
            stats: PipelineStats::default(),
        }
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn trigger(&self) -> &TriggerStateMachine {
        &self.trigger
    }

    pub fn recording(&self) -> Option<&RecordingBuffer> {
        self.recording.as_ref()
    }

    /// Handle one capture block received at `now`
    pub fn handle_block(&mut self, block: Vec<AudioSample>, now: Instant) -> FrameOutcome {
        self.stats.frames_received += 1;

        let frame = match Frame::new(block, self.frame_length) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.frames_dropped += 1;
                warn!("Dropping frame: {}", e);
                return FrameOutcome::Dropped;
            }
        };

        if let Some(recording) = self.recording.as_mut() {
            recording.append(&frame);
        }

        self.stats.frames_processed += 1;
        if self.stats.frames_processed % 1000 == 0 {
            let trigger = self.trigger.stats();
            debug!(
                "Processed {} frames, {} triggers, {} suppressed",
                self.stats.frames_processed, trigger.triggers, trigger.suppressed
            );
        }

        let state = self.trigger.tick(now);
        if state != TriggerState::Listening {
            return FrameOutcome::NotScored(state);
        }

        let detection = self.detector.score(&frame);

        match self.trigger.on_detection(detection, now) {
            TriggerOutcome::Idle => FrameOutcome::NoMatch,
            TriggerOutcome::Triggered { keyword_index } => {
                if self.detector.keyword_count() > 1 {
                    info!("Detected keyword #{}", keyword_index);
                } else {
                    info!("Detected keyword");
                }
                FrameOutcome::Triggered { keyword_index }
            }
            TriggerOutcome::Suppressed { keyword_index } => {
                FrameOutcome::Suppressed { keyword_index }
            }
            TriggerOutcome::Inactive => FrameOutcome::NotScored(TriggerState::Inactive),
        }
    }

    /// Consume blocks until every sender is gone
    pub fn run(mut self, mut blocks: mpsc::Receiver<Vec<AudioSample>>) -> PipelineReport {
        debug!("Frame pipeline running ({} samples per frame)", self.frame_length);

        while let Some(block) = blocks.blocking_recv() {
            self.handle_block(block, Instant::now());
        }

        self.finish()
    }

    /// Run on a dedicated thread
    pub fn spawn(
        self,
        blocks: mpsc::Receiver<Vec<AudioSample>>,
    ) -> std::io::Result<JoinHandle<PipelineReport>> {
        thread::Builder::new()
            .name("wake-pipeline".to_string())
            .spawn(move || self.run(blocks))
    }

    /// Release the spotter and hand back statistics and the recording
    pub fn finish(self) -> PipelineReport {
        let FramePipeline {
            detector,
            trigger,
            recording,
            stats,
            ..
        } = self;

        let report = PipelineReport {
            stats,
            detector: detector.stats(),
            trigger: trigger.stats(),
            recording,
        };

        drop(detector);
        drop(trigger);

        info!(
            "Frame pipeline stopped: {} frames processed, {} dropped, {} trigger(s)",
            report.stats.frames_processed, report.stats.frames_dropped, report.trigger.triggers
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectorError, KeywordSpotter};
    use crate::dispatch::{DispatchHints, DispatchRequest};
    use crate::frame::Detection;
    use crate::trigger::{TriggerEvent, TriggerStateHandle};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const FRAME_LENGTH: usize = 512;
    const WAKE_MARKER: i16 = 1000;

    /// Matches keyword 0 on frames starting with `WAKE_MARKER`
    struct MarkerSpotter {
        calls: Arc<AtomicU64>,
    }

    impl KeywordSpotter for MarkerSpotter {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn frame_length(&self) -> usize {
            FRAME_LENGTH
        }

        fn process(&mut self, pcm: &[AudioSample]) -> Result<Detection, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Detection::from_flag(pcm[0] == WAKE_MARKER))
        }
    }

    struct Fixture {
        pipeline: FramePipeline,
        handle: TriggerStateHandle,
        calls: Arc<AtomicU64>,
        dispatches: mpsc::Receiver<DispatchRequest>,
    }

    fn fixture(cooldown: Duration, recording: bool) -> Fixture {
        let calls = Arc::new(AtomicU64::new(0));
        let spotter = MarkerSpotter { calls: calls.clone() };
        let detector = DetectorAdapter::new(Box::new(spotter), 1);

        let (tx, dispatches) = mpsc::channel(8);
        let handle = TriggerStateHandle::new();
        let trigger = TriggerStateMachine::new(handle.clone(), cooldown, DispatchHints::default(), tx);
        let recording = recording.then(|| RecordingBuffer::with_capacity(16000 * 10, 16000).unwrap());

        Fixture {
            pipeline: FramePipeline::new(detector, trigger, recording),
            handle,
            calls,
            dispatches,
        }
    }

    fn quiet() -> Vec<i16> {
        vec![0; FRAME_LENGTH]
    }

    fn wake() -> Vec<i16> {
        let mut block = vec![0; FRAME_LENGTH];
        block[0] = WAKE_MARKER;
        block
    }

    #[test]
    fn test_mismatched_frame_is_dropped_unscored() {
        let mut f = fixture(Duration::from_secs(2), false);
        f.handle.apply(TriggerEvent::StreamStarted).unwrap();
        let t0 = Instant::now();

        for i in 0..10u32 {
            f.pipeline.handle_block(quiet(), t0 + Duration::from_millis(32 * i as u64));
            if i == 4 {
                let mut short = wake();
                short.truncate(300);
                assert_eq!(f.pipeline.handle_block(short, t0), FrameOutcome::Dropped);
                assert_eq!(f.handle.get(), TriggerState::Listening);
            }
        }

        assert_eq!(f.calls.load(Ordering::SeqCst), 10);
        assert_eq!(f.pipeline.stats().frames_dropped, 1);
        assert_eq!(f.pipeline.stats().frames_received, 11);
        assert!(f.dispatches.try_recv().is_err());
    }

    #[test]
    fn test_frames_not_scored_before_start() {
        let mut f = fixture(Duration::from_secs(2), false);

        assert_eq!(
            f.pipeline.handle_block(wake(), Instant::now()),
            FrameOutcome::NotScored(TriggerState::Inactive)
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cooldown_scenario_through_pipeline() {
        let mut f = fixture(Duration::from_secs(2), false);
        f.handle.apply(TriggerEvent::StreamStarted).unwrap();
        let t0 = Instant::now();

        assert_eq!(
            f.pipeline.handle_block(wake(), t0),
            FrameOutcome::Triggered { keyword_index: 0 }
        );
        assert_eq!(
            f.pipeline.handle_block(wake(), t0 + Duration::from_millis(500)),
            FrameOutcome::NotScored(TriggerState::Cooldown)
        );
        assert_eq!(
            f.pipeline.handle_block(quiet(), t0 + Duration::from_secs(2)),
            FrameOutcome::NoMatch
        );
        assert_eq!(
            f.pipeline.handle_block(wake(), t0 + Duration::from_millis(2100)),
            FrameOutcome::Triggered { keyword_index: 0 }
        );

        let mut dispatched = 0;
        while f.dispatches.try_recv().is_ok() {
            dispatched += 1;
        }
        assert_eq!(dispatched, 2);
        // The frame at 0.5s was never scored
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_recording_ignores_trigger_state() {
        let mut f = fixture(Duration::from_secs(2), true);
        let t0 = Instant::now();

        f.pipeline.handle_block(quiet(), t0);
        f.handle.apply(TriggerEvent::StreamStarted).unwrap();
        f.pipeline.handle_block(wake(), t0);
        f.pipeline.handle_block(wake(), t0);
        f.pipeline.handle_block(vec![7; 10], t0);
        f.pipeline.handle_block(quiet(), t0);

        let recording = f.pipeline.recording().unwrap();
        assert_eq!(recording.frames_appended(), 4);
        assert_eq!(recording.len(), 4 * FRAME_LENGTH);
        assert_eq!(recording.samples()[FRAME_LENGTH], WAKE_MARKER);
    }

    #[test]
    fn test_run_drains_channel_and_releases() {
        let f = fixture(Duration::from_secs(2), true);
        f.handle.apply(TriggerEvent::StreamStarted).unwrap();

        let (tx, rx) = mpsc::channel(16);
        for _ in 0..5 {
            tx.try_send(quiet()).unwrap();
        }
        tx.try_send(wake()).unwrap();
        drop(tx);

        let report = f.pipeline.spawn(rx).unwrap().join().unwrap();
        assert_eq!(report.stats.frames_processed, 6);
        assert_eq!(report.detector.score_calls, 6);
        assert_eq!(report.trigger.triggers, 1);
        assert_eq!(report.recording.unwrap().frames_appended(), 6);
    }
}
