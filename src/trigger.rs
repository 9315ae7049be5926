/// Trigger state machine
///
/// Converts detections into debounced dispatches. One trigger moves the
/// machine from `Listening` to `Cooldown` and enqueues exactly one
/// `DispatchRequest`; every detection that arrives before the cooldown
/// deadline is discarded. The deadline is checked against a monotonic clock
/// on each frame tick, so nothing on the frame path ever sleeps.
///
/// The current state lives in a shared atomic (`TriggerStateHandle`) so the
/// control context can observe it and force `Inactive` on shutdown while the
/// frame pipeline keeps driving the other transitions. Every change goes
/// through a compare-and-swap against the transition table.

use crate::dispatch::{DispatchHints, DispatchRequest};
use crate::frame::Detection;
use cache_padded::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Trigger state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerState {
    /// Stream not started yet, or shut down
    Inactive = 0,

    /// Armed, detections trigger a dispatch
    Listening = 1,

    /// Recently triggered, detections are ignored
    Cooldown = 2,
}

impl TriggerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TriggerState::Listening,
            2 => TriggerState::Cooldown,
            _ => TriggerState::Inactive,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TriggerState::Inactive => "inactive",
            TriggerState::Listening => "listening",
            TriggerState::Cooldown => "cooldown",
        };
        f.write_str(label)
    }
}

/// Inputs to the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    StreamStarted,
    Detected,
    CooldownElapsed,
    Shutdown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Transition not allowed: {event:?} while {from}")]
    NotAllowed {
        from: TriggerState,
        event: TriggerEvent,
    },
}

/// The transition table; `None` means the event is rejected in that state
pub fn next_state(from: TriggerState, event: TriggerEvent) -> Option<TriggerState> {
    use TriggerEvent::*;
    use TriggerState::*;

    match (from, event) {
        (Inactive, StreamStarted) => Some(Listening),
        (Listening, Detected) => Some(Cooldown),
        (Cooldown, CooldownElapsed) => Some(Listening),
        (Listening | Cooldown, Shutdown) => Some(Inactive),
        _ => None,
    }
}

/// Shared, lock-free view of the session's trigger state
#[derive(Debug, Clone)]
pub struct TriggerStateHandle {
    state: Arc<CachePadded<AtomicU8>>,
}

impl TriggerStateHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CachePadded::new(AtomicU8::new(TriggerState::Inactive as u8))),
        }
    }

    pub fn get(&self) -> TriggerState {
        TriggerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply `event` atomically, returning the new state
    ///
    /// If another context changes the state concurrently the event is
    /// re-evaluated against the state it actually finds.
    pub fn apply(&self, event: TriggerEvent) -> Result<TriggerState, TransitionError> {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let from = TriggerState::from_u8(current);
            let to = next_state(from, event).ok_or(TransitionError::NotAllowed { from, event })?;

            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!("Trigger state: {} -> {} ({:?})", from, to, event);
                    return Ok(to);
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for TriggerStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to one detection result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Nothing matched
    Idle,

    /// Listening -> Cooldown, one dispatch handed off
    Triggered { keyword_index: usize },

    /// Matched during cooldown and discarded
    Suppressed { keyword_index: usize },

    /// Matched while the session is not running
    Inactive,
}

/// Trigger statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStats {
    pub triggers: u64,
    pub suppressed: u64,
    pub dispatches_enqueued: u64,
    pub dispatches_dropped: u64,
}

/// Debounce state machine driven by the frame pipeline
pub struct TriggerStateMachine {
    state: TriggerStateHandle,
    cooldown: Duration,
    /// Deadline of the current cooldown; `None` while cooling down means
    /// the deadline lies beyond what `Instant` can represent
    cooldown_until: Option<Instant>,
    hints: DispatchHints,
    dispatch_tx: mpsc::Sender<DispatchRequest>,
    stats: TriggerStats,
}

impl TriggerStateMachine {
    pub fn new(
        state: TriggerStateHandle,
        cooldown: Duration,
        hints: DispatchHints,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> Self {
        debug!("Trigger cooldown: {:?}", cooldown);

        Self {
            state,
            cooldown,
            cooldown_until: None,
            hints,
            dispatch_tx,
            stats: TriggerStats::default(),
        }
    }

    pub fn state(&self) -> TriggerState {
        self.state.get()
    }

    pub fn handle(&self) -> TriggerStateHandle {
        self.state.clone()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn stats(&self) -> TriggerStats {
        self.stats
    }

    /// Expire the cooldown once its deadline has passed
    ///
    /// Called at the start of every frame; returns the state the frame is
    /// handled in.
    pub fn tick(&mut self, now: Instant) -> TriggerState {
        let state = self.state.get();

        if state == TriggerState::Cooldown {
            let expired = self.cooldown_until.map_or(false, |deadline| now >= deadline);
            if expired {
                self.cooldown_until = None;
                if let Ok(next) = self.state.apply(TriggerEvent::CooldownElapsed) {
                    debug!("Cooldown elapsed, listening again");
                    return next;
                }
                return self.state.get();
            }
        }

        state
    }

    /// Feed one detection result
    pub fn on_detection(&mut self, detection: Detection, now: Instant) -> TriggerOutcome {
        let keyword_index = match detection {
            Detection::NoMatch => return TriggerOutcome::Idle,
            Detection::Keyword(index) => index,
        };

        match self.state.get() {
            TriggerState::Listening => self.trigger(keyword_index, now),
            TriggerState::Cooldown => {
                self.stats.suppressed += 1;
                trace!("Detection of keyword #{} ignored during cooldown", keyword_index);
                TriggerOutcome::Suppressed { keyword_index }
            }
            TriggerState::Inactive => TriggerOutcome::Inactive,
        }
    }

    fn trigger(&mut self, keyword_index: usize, now: Instant) -> TriggerOutcome {
        match self.state.apply(TriggerEvent::Detected) {
            Ok(_) => {}
            Err(TransitionError::NotAllowed { from, .. }) => {
                // Lost a race against shutdown
                debug!("Detection dropped, state changed to {}", from);
                return TriggerOutcome::Inactive;
            }
        }

        self.cooldown_until = now.checked_add(self.cooldown);
        if self.cooldown_until.is_none() {
            warn!("Cooldown of {:?} never elapses", self.cooldown);
        }
        self.stats.triggers += 1;

        let request = DispatchRequest {
            keyword_index,
            hints: self.hints.clone(),
            detected_at: SystemTime::now(),
        };

        match self.dispatch_tx.try_send(request) {
            Ok(()) => {
                self.stats.dispatches_enqueued += 1;
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dispatches_dropped += 1;
                warn!("Dispatch queue full, wake event for keyword #{} not reported", keyword_index);
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dispatches_dropped += 1;
                warn!("Dispatch worker gone, wake event for keyword #{} not reported", keyword_index);
            }
        }

        info!("Trigger: entering cooldown for {:?}", self.cooldown);
        TriggerOutcome::Triggered { keyword_index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(cooldown_secs: f64) -> (TriggerStateMachine, mpsc::Receiver<DispatchRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = TriggerStateHandle::new();
        let machine = TriggerStateMachine::new(
            handle,
            Duration::from_secs_f64(cooldown_secs),
            DispatchHints::default(),
            tx,
        );
        (machine, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<DispatchRequest>) -> Vec<DispatchRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    #[test]
    fn test_transition_table() {
        use TriggerEvent::*;
        use TriggerState::*;

        assert_eq!(next_state(Inactive, StreamStarted), Some(Listening));
        assert_eq!(next_state(Listening, Detected), Some(Cooldown));
        assert_eq!(next_state(Cooldown, CooldownElapsed), Some(Listening));
        assert_eq!(next_state(Listening, Shutdown), Some(Inactive));
        assert_eq!(next_state(Cooldown, Shutdown), Some(Inactive));

        assert_eq!(next_state(Inactive, Detected), None);
        assert_eq!(next_state(Cooldown, Detected), None);
        assert_eq!(next_state(Listening, StreamStarted), None);
        assert_eq!(next_state(Listening, CooldownElapsed), None);
        assert_eq!(next_state(Inactive, Shutdown), None);
    }

    #[test]
    fn test_handle_rejects_unknown_transition() {
        let handle = TriggerStateHandle::new();
        assert_eq!(handle.get(), TriggerState::Inactive);

        assert_eq!(
            handle.apply(TriggerEvent::Detected),
            Err(TransitionError::NotAllowed {
                from: TriggerState::Inactive,
                event: TriggerEvent::Detected
            })
        );

        assert_eq!(handle.apply(TriggerEvent::StreamStarted), Ok(TriggerState::Listening));
        assert_eq!(handle.apply(TriggerEvent::Shutdown), Ok(TriggerState::Inactive));
        assert!(handle.apply(TriggerEvent::Shutdown).is_err());
    }

    #[test]
    fn test_single_dispatch_per_trigger() {
        let (mut machine, mut rx) = machine(2.0);
        machine.handle().apply(TriggerEvent::StreamStarted).unwrap();
        let t0 = Instant::now();

        assert_eq!(
            machine.on_detection(Detection::Keyword(0), t0),
            TriggerOutcome::Triggered { keyword_index: 0 }
        );
        assert_eq!(machine.state(), TriggerState::Cooldown);

        // Sustained utterance keeps matching
        for i in 1..20 {
            let now = t0 + Duration::from_millis(32 * i);
            assert_eq!(machine.tick(now), TriggerState::Cooldown);
            assert_eq!(
                machine.on_detection(Detection::Keyword(0), now),
                TriggerOutcome::Suppressed { keyword_index: 0 }
            );
        }

        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(machine.stats().triggers, 1);
        assert_eq!(machine.stats().suppressed, 19);
    }

    #[test]
    fn test_cooldown_scenario() {
        let (mut machine, mut rx) = machine(2.0);
        machine.handle().apply(TriggerEvent::StreamStarted).unwrap();
        let t0 = Instant::now();

        // t = 0.0s: dispatch #1
        machine.tick(t0);
        assert!(matches!(
            machine.on_detection(Detection::Keyword(0), t0),
            TriggerOutcome::Triggered { .. }
        ));

        // t = 0.5s: ignored
        let t = t0 + Duration::from_millis(500);
        assert_eq!(machine.tick(t), TriggerState::Cooldown);
        assert!(matches!(
            machine.on_detection(Detection::Keyword(0), t),
            TriggerOutcome::Suppressed { .. }
        ));

        // t = 2.0s: back to listening
        assert_eq!(machine.tick(t0 + Duration::from_secs(2)), TriggerState::Listening);

        // t = 2.1s: dispatch #2
        let t = t0 + Duration::from_millis(2100);
        assert_eq!(machine.tick(t), TriggerState::Listening);
        assert!(matches!(
            machine.on_detection(Detection::Keyword(0), t),
            TriggerOutcome::Triggered { .. }
        ));

        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_no_match_leaves_state_alone() {
        let (mut machine, mut rx) = machine(2.0);
        machine.handle().apply(TriggerEvent::StreamStarted).unwrap();

        assert_eq!(
            machine.on_detection(Detection::NoMatch, Instant::now()),
            TriggerOutcome::Idle
        );
        assert_eq!(machine.state(), TriggerState::Listening);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_inactive_ignores_detections() {
        let (mut machine, mut rx) = machine(2.0);

        assert_eq!(
            machine.on_detection(Detection::Keyword(1), Instant::now()),
            TriggerOutcome::Inactive
        );
        assert_eq!(machine.state(), TriggerState::Inactive);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_shutdown_during_cooldown() {
        let (mut machine, _rx) = machine(2.0);
        let handle = machine.handle();
        handle.apply(TriggerEvent::StreamStarted).unwrap();
        let t0 = Instant::now();

        machine.on_detection(Detection::Keyword(0), t0);
        handle.apply(TriggerEvent::Shutdown).unwrap();

        // Expiry after shutdown must not re-arm the machine
        assert_eq!(machine.tick(t0 + Duration::from_secs(3)), TriggerState::Inactive);
        assert_eq!(
            machine.on_detection(Detection::Keyword(0), t0 + Duration::from_secs(3)),
            TriggerOutcome::Inactive
        );
    }

    #[test]
    fn test_unrepresentable_cooldown_never_elapses() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = TriggerStateHandle::new();
        handle.apply(TriggerEvent::StreamStarted).unwrap();
        let mut machine =
            TriggerStateMachine::new(handle, Duration::MAX, DispatchHints::default(), tx);
        let t0 = Instant::now();

        assert_eq!(
            machine.on_detection(Detection::Keyword(0), t0),
            TriggerOutcome::Triggered { keyword_index: 0 }
        );
        let later = t0 + Duration::from_secs(100_000);
        assert_eq!(machine.tick(later), TriggerState::Cooldown);
        assert!(matches!(
            machine.on_detection(Detection::Keyword(0), later),
            TriggerOutcome::Suppressed { .. }
        ));
        assert_eq!(drain(&mut rx).len(), 1);

        // Shutdown still works
        machine.handle().apply(TriggerEvent::Shutdown).unwrap();
        assert_eq!(machine.tick(later), TriggerState::Inactive);
    }

    #[test]
    fn test_full_queue_still_enters_cooldown() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = TriggerStateHandle::new();
        handle.apply(TriggerEvent::StreamStarted).unwrap();
        let mut machine =
            TriggerStateMachine::new(handle, Duration::ZERO, DispatchHints::default(), tx);
        let t0 = Instant::now();

        machine.on_detection(Detection::Keyword(0), t0);
        machine.tick(t0);
        machine.on_detection(Detection::Keyword(0), t0);

        assert_eq!(machine.state(), TriggerState::Cooldown);
        assert_eq!(machine.stats().triggers, 2);
        assert_eq!(machine.stats().dispatches_enqueued, 1);
        assert_eq!(machine.stats().dispatches_dropped, 1);
    }

    #[test]
    fn test_dispatch_carries_keyword_and_hints() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = TriggerStateHandle::new();
        handle.apply(TriggerEvent::StreamStarted).unwrap();
        let hints = DispatchHints {
            language: "de".to_string(),
            device_id: Some("o1".to_string()),
            channel_id: None,
        };
        let mut machine = TriggerStateMachine::new(handle, Duration::from_secs(2), hints.clone(), tx);

        machine.on_detection(Detection::Keyword(2), Instant::now());

        let request = rx.try_recv().unwrap();
        assert_eq!(request.keyword_index, 2);
        assert_eq!(request.hints, hints);
    }

    #[test]
    fn test_concurrent_shutdown_and_expiry() {
        for _ in 0..100 {
            let (mut machine, _rx) = machine(0.0);
            let handle = machine.handle();
            handle.apply(TriggerEvent::StreamStarted).unwrap();
            let t0 = Instant::now();
            machine.on_detection(Detection::Keyword(0), t0);

            let shutdown = {
                let handle = handle.clone();
                std::thread::spawn(move || handle.apply(TriggerEvent::Shutdown))
            };
            machine.tick(t0);

            // Whichever runs first, shutdown always lands and nothing re-arms after it
            assert!(shutdown.join().unwrap().is_ok());
            assert_eq!(handle.get(), TriggerState::Inactive);
        }
    }
}
