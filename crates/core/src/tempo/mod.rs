//! Shared tempo record and the controller that owns its BPM and pause fields.
//!
//! Field ownership:
//! - `bpm`, `paused`: [`TempoController`] only.
//! - `connected`, `last_heartbeat_at`, `beat_count`, `calibration_ready`:
//!   the tempo listener only.
//! - `mode`: whoever selects the input source (the binary or the replay driver).
//!
//! Everything else reads copies obtained through [`SharedTempo::snapshot`].

pub(crate) mod listener;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;

pub use listener::TempoListener;

/// Upper bound for any accepted tempo.
pub const MAX_BPM: f32 = 240.0;
pub const DEFAULT_BPM: f32 = 120.0;

/// Where tempo changes come from. The variants are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    /// Tempo follows the wand; playback aborts if the wand disconnects.
    LiveGesture,
    /// Tempo is set by the operator or taken from the loaded stream.
    #[default]
    StandardTempo,
    /// A recorded session is driving tempo and visuals; live hardware data is
    /// suspended.
    Replay,
}

/// Snapshot of the tempo record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoState {
    pub bpm: f32,
    pub paused: bool,
    pub connected: bool,
    pub last_heartbeat_at: Option<Instant>,
    pub mode: InputMode,
    pub calibration_ready: bool,
    /// Running count of `BEAT_TRIG` events, used for warm-up gating.
    pub beat_count: u64,
}

impl Default for TempoState {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            paused: false,
            connected: false,
            last_heartbeat_at: None,
            mode: InputMode::default(),
            calibration_ready: false,
            beat_count: 0,
        }
    }
}

impl TempoState {
    /// True when the scheduler has to hold: explicitly paused or zero tempo.
    pub fn is_holding(&self) -> bool {
        self.paused || self.bpm <= 0.0
    }

    pub fn gesture_required(&self) -> bool {
        self.mode == InputMode::LiveGesture
    }
}

/// Thread-safe handle over the single [`TempoState`] of a process.
#[derive(Debug, Clone, Default)]
pub struct SharedTempo {
    inner: Arc<RwLock<TempoState>>,
}

impl SharedTempo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: TempoState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn snapshot(&self) -> TempoState {
        *self.inner.read()
    }

    pub fn bpm(&self) -> f32 {
        self.inner.read().bpm
    }

    pub fn mode(&self) -> InputMode {
        self.inner.read().mode
    }

    pub fn beat_count(&self) -> u64 {
        self.inner.read().beat_count
    }

    pub fn set_mode(&self, mode: InputMode) -> InputMode {
        let mut state = self.inner.write();
        let previous = state.mode;
        state.mode = mode;
        if previous != mode {
            tracing::info!(?previous, ?mode, "input mode changed");
        }
        previous
    }

    pub(crate) fn mark_heartbeat(&self, now: Instant) {
        let mut state = self.inner.write();
        if !state.connected {
            tracing::info!("wand connection established");
        }
        state.connected = true;
        state.last_heartbeat_at = Some(now);
    }

    pub(crate) fn mark_disconnected(&self) {
        let mut state = self.inner.write();
        if state.connected {
            tracing::warn!("wand connection lost");
        }
        state.connected = false;
    }

    /// Flips `connected` off when the last heartbeat is older than `timeout`.
    /// Returns true if this call caused the transition.
    pub(crate) fn expire_heartbeat(&self, now: Instant, timeout: Duration) -> bool {
        let mut state = self.inner.write();
        let stale = state
            .last_heartbeat_at
            .map_or(true, |at| now.saturating_duration_since(at) > timeout);
        if state.connected && stale {
            state.connected = false;
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "wand heartbeat timed out");
            return true;
        }
        false
    }

    pub(crate) fn count_beat(&self) -> u64 {
        let mut state = self.inner.write();
        state.beat_count += 1;
        state.beat_count
    }

    pub(crate) fn set_calibration_ready(&self, ready: bool) {
        let mut state = self.inner.write();
        if state.calibration_ready != ready {
            tracing::info!(ready, "calibration readiness changed");
        }
        state.calibration_ready = ready;
    }

    fn update<R>(&self, f: impl FnOnce(&mut TempoState) -> R) -> R {
        f(&mut self.inner.write())
    }
}

/// Clamps `raw` into `[0, max_bpm]` and applies pause-via-zero-tempo to
/// `state`. Returns the stored BPM.
pub fn normalize(raw: f32, max_bpm: f32, state: &mut TempoState) -> f32 {
    let bpm = if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, max_bpm.max(0.0))
    };

    if bpm <= 0.0 {
        state.paused = true;
    } else if state.bpm <= 0.0 {
        state.paused = false;
    }

    state.bpm = bpm;
    bpm
}

/// The only writer of `bpm` and `paused`.
///
/// Live wand readings, replayed recordings and operator requests all pass
/// through the same controller so they behave identically downstream.
#[derive(Debug, Clone)]
pub struct TempoController {
    tempo: SharedTempo,
    max_bpm: f32,
}

impl TempoController {
    pub fn new(tempo: SharedTempo) -> Self {
        Self::with_max_bpm(tempo, MAX_BPM)
    }

    pub fn with_max_bpm(tempo: SharedTempo, max_bpm: f32) -> Self {
        Self { tempo, max_bpm }
    }

    pub fn tempo(&self) -> &SharedTempo {
        &self.tempo
    }

    /// Accepts one tempo sample.
    pub fn normalize(&self, raw: f32) -> f32 {
        let max_bpm = self.max_bpm;
        let bpm = self.tempo.update(|state| normalize(raw, max_bpm, state));
        tracing::trace!(raw, bpm, "tempo sample applied");
        bpm
    }

    pub fn pause(&self) {
        self.tempo.update(|state| state.paused = true);
    }

    /// Clears a manual pause; a zero tempo keeps the scheduler paused.
    pub fn resume(&self) -> bool {
        self.tempo.update(|state| {
            if state.bpm > 0.0 {
                state.paused = false;
            }
            !state.paused
        })
    }

    /// Called when a playback run ends so the next run does not inherit a
    /// manual pause. Zero tempo stays paused.
    pub fn release_pause(&self) {
        self.tempo.update(|state| {
            if state.bpm > 0.0 {
                state.paused = false;
            }
        });
    }
}
