//! Tempo-synchronised playback of an [`EventStream`].
//!
//! The scheduler converts tick deltas into wall-clock waits using the BPM it
//! reads from the shared tempo record while it waits, so tempo changes and
//! pauses take effect within one wait chunk. Stop requests wake the scheduler
//! through a channel instead of waiting for the chunk to elapse.

mod sink;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

pub use sink::{ChannelSink, EventSink, LogSink, UdpSink};

use crate::{
    ConductorError, EventStream, PlaybackConfig, Result, SharedTempo, TempoController,
};

/// Lifecycle of the engine's single playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Waiting for the conductor's preparatory beats.
    Warmup,
    Running,
    Paused,
    Stopped,
}

/// How a [`PlaybackEngine::run`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every event was emitted.
    Completed,
    /// Stopped by request.
    Stopped,
    /// The wand disconnected while gesture tracking was required.
    Disconnected,
    /// The sink or the scheduler failed; playback ended early.
    Failed,
    /// `run` was called without a loaded stream.
    NothingLoaded,
}

/// Options for [`PlaybackEngine::load`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Start in the paused state; playback waits for a resume.
    pub start_paused: bool,
    /// Hold in [`SessionState::Warmup`] until the preparatory beats arrive.
    pub warmup: bool,
    /// Ask the sensor bridge to record this session.
    pub record: bool,
}

/// Point-in-time view of the session for monitoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub state: SessionState,
    pub playing: bool,
    pub cursor_ticks: u64,
    pub total_ticks: u64,
    pub percent: f32,
    /// Position mapped onto the stream's nominal duration.
    pub elapsed: Duration,
    pub nominal_duration: Duration,
    pub bpm: f32,
}

/// What other loops need to follow the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    /// Incremented by every successful load.
    pub generation: u64,
    pub state: SessionState,
    /// The scheduler has entered `Running` at least once in this generation.
    pub entered_running: bool,
    pub record_requested: bool,
}

impl SessionSnapshot {
    /// Started and not yet ended: `Running` or `Paused` after the first
    /// `Running`.
    pub fn in_progress(&self) -> bool {
        self.entered_running && matches!(self.state, SessionState::Running | SessionState::Paused)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionStatus {
    generation: u64,
    state: SessionState,
    entered_running: bool,
    playing: bool,
    cursor_ticks: u64,
    total_ticks: u64,
    nominal_duration: Duration,
    record_requested: bool,
}

/// Read-only view of the session, handed to other loops such as the bridge.
#[derive(Debug, Clone)]
pub struct SessionMonitor {
    status: Arc<RwLock<SessionStatus>>,
}

impl SessionMonitor {
    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status.read();
        SessionSnapshot {
            generation: status.generation,
            state: status.state,
            entered_running: status.entered_running,
            record_requested: status.record_requested,
        }
    }
}

struct PendingRun {
    stream: EventStream,
    options: LoadOptions,
}

/// Single-session playback engine. Cloning yields another handle to the same
/// engine, so one clone can run the scheduler while others stop or monitor it.
#[derive(Clone)]
pub struct PlaybackEngine {
    tempo: SharedTempo,
    controller: TempoController,
    status: Arc<RwLock<SessionStatus>>,
    pending: Arc<Mutex<Option<PendingRun>>>,
    stop_requested: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    pause_chunk: Duration,
    warmup_default_beats: u32,
    gesture_required: bool,
}

impl PlaybackEngine {
    pub fn new(controller: TempoController, config: &PlaybackConfig) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            tempo: controller.tempo().clone(),
            controller,
            status: Arc::new(RwLock::new(SessionStatus::default())),
            pending: Arc::new(Mutex::new(None)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
            pause_chunk: config.pause_chunk(),
            warmup_default_beats: config.warmup_default_beats,
            gesture_required: config.gesture_required,
        }
    }

    pub fn monitor(&self) -> SessionMonitor {
        SessionMonitor {
            status: Arc::clone(&self.status),
        }
    }

    /// Arms a new session.
    ///
    /// # Errors
    /// [`ConductorError::AlreadyRunning`] if a session is loaded or playing;
    /// nothing is changed in that case.
    pub fn load(&self, stream: EventStream, options: LoadOptions) -> Result<()> {
        let mut pending = self.pending.lock();
        let mut status = self.status.write();
        if status.playing || pending.is_some() {
            return Err(ConductorError::AlreadyRunning);
        }
        if stream.is_empty() {
            return Err(ConductorError::invalid_stream("stream has no events"));
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        while self.wake_rx.try_recv().is_ok() {}

        *status = SessionStatus {
            generation: status.generation.wrapping_add(1),
            state: SessionState::Idle,
            entered_running: false,
            playing: true,
            cursor_ticks: 0,
            total_ticks: stream.total_ticks(),
            nominal_duration: stream.nominal_duration(),
            record_requested: options.record,
        };
        if options.start_paused {
            self.controller.pause();
        }

        tracing::info!(
            events = stream.len(),
            total_ticks = stream.total_ticks(),
            ticks_per_beat = stream.ticks_per_beat(),
            ?options,
            "playback session loaded"
        );
        *pending = Some(PendingRun { stream, options });
        Ok(())
    }

    /// Stops the current session, waits for it to wind down, then loads
    /// `stream`.
    pub fn reload(
        &self,
        stream: EventStream,
        options: LoadOptions,
        timeout: Duration,
    ) -> Result<()> {
        self.stop();
        let deadline = Instant::now() + timeout;
        while self.status.read().playing && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.load(stream, options)
    }

    /// Requests a stop. The scheduler observes it within one wait chunk. A
    /// loaded session that never started is discarded immediately.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        if self.pending.lock().take().is_some() {
            self.finish();
        }
        tracing::info!("playback stop requested");
    }

    pub fn pause(&self) {
        self.controller.pause();
    }

    pub fn resume(&self) -> bool {
        self.controller.resume()
    }

    pub fn progress(&self) -> Progress {
        let status = *self.status.read();
        let percent = if status.total_ticks > 0 {
            (status.cursor_ticks as f64 / status.total_ticks as f64 * 100.0) as f32
        } else {
            0.0
        };
        let elapsed = if status.total_ticks > 0 {
            status
                .nominal_duration
                .mul_f64(status.cursor_ticks as f64 / status.total_ticks as f64)
        } else {
            Duration::ZERO
        };

        Progress {
            state: status.state,
            playing: status.playing,
            cursor_ticks: status.cursor_ticks,
            total_ticks: status.total_ticks,
            percent,
            elapsed,
            nominal_duration: status.nominal_duration,
            bpm: self.tempo.bpm(),
        }
    }

    /// Runs the loaded session on a dedicated thread.
    pub fn spawn(&self, mut sink: Box<dyn EventSink>) -> std::io::Result<JoinHandle<RunOutcome>> {
        let engine = self.clone();
        thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || engine.run(sink.as_mut()))
    }

    /// Plays the loaded session to completion or until interrupted. Always
    /// leaves the engine idle with the cursor rewound, whatever the outcome.
    pub fn run(&self, sink: &mut dyn EventSink) -> RunOutcome {
        let Some(PendingRun { stream, options }) = self.pending.lock().take() else {
            return RunOutcome::NothingLoaded;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.play(&stream, options, sink)))
            .unwrap_or_else(|_| {
                tracing::error!("playback scheduler panicked; stopping session");
                RunOutcome::Failed
            });

        self.finish();
        tracing::info!(?outcome, "playback session ended");
        outcome
    }

    fn play(
        &self,
        stream: &EventStream,
        options: LoadOptions,
        sink: &mut dyn EventSink,
    ) -> RunOutcome {
        let mut watch = Interrupts {
            gesture: self.gesture_required && self.tempo.snapshot().gesture_required(),
            seen_connected: false,
        };

        if options.warmup {
            let target = stream.warmup_beats(self.warmup_default_beats);
            if let Some(outcome) = self.warm_up(target, &mut watch) {
                return outcome;
            }
        }
        self.set_state(SessionState::Running);

        let ticks_per_beat = stream.ticks_per_beat();
        for event in stream.events() {
            if let Some(outcome) = self.interrupted(&mut watch) {
                return outcome;
            }
            if let Some(outcome) = self.hold_while_paused(&mut watch) {
                return outcome;
            }
            if event.delta_ticks > 0 {
                let waited = self.wait_ticks(event.delta_ticks, ticks_per_beat, &mut watch);
                if let Some(outcome) = waited {
                    return outcome;
                }
            }

            self.status.write().cursor_ticks += u64::from(event.delta_ticks);

            if !event.is_meta {
                if let Err(err) = sink.send(&event.payload) {
                    tracing::warn!(%err, "event sink failed; stopping playback");
                    return RunOutcome::Failed;
                }
            }
        }

        RunOutcome::Completed
    }

    fn warm_up(&self, target: u32, watch: &mut Interrupts) -> Option<RunOutcome> {
        self.set_state(SessionState::Warmup);
        let baseline = self.tempo.beat_count();
        tracing::info!(beats = target, "waiting for preparatory beats");

        loop {
            if let Some(outcome) = self.interrupted(watch) {
                return Some(outcome);
            }
            let counted = self.tempo.beat_count().saturating_sub(baseline);
            if counted >= u64::from(target) {
                tracing::info!(counted, "warm-up complete");
                return None;
            }
            self.nap(self.pause_chunk);
        }
    }

    fn hold_while_paused(&self, watch: &mut Interrupts) -> Option<RunOutcome> {
        while self.tempo.snapshot().is_holding() {
            self.set_state(SessionState::Paused);
            if let Some(outcome) = self.interrupted(watch) {
                return Some(outcome);
            }
            self.nap(self.pause_chunk);
        }
        self.set_state(SessionState::Running);
        None
    }

    /// Waits out `delta_ticks`, re-reading the tempo every chunk. The
    /// remaining distance is tracked in beats so a tempo change only affects
    /// the part of the wait that has not elapsed yet.
    fn wait_ticks(
        &self,
        delta_ticks: u32,
        ticks_per_beat: u16,
        watch: &mut Interrupts,
    ) -> Option<RunOutcome> {
        let mut remaining_beats = f64::from(delta_ticks) / f64::from(ticks_per_beat);

        while remaining_beats > 0.0 {
            if let Some(outcome) = self.hold_while_paused(watch) {
                return Some(outcome);
            }
            if let Some(outcome) = self.interrupted(watch) {
                return Some(outcome);
            }

            let bpm = f64::from(self.tempo.bpm());
            if bpm <= 0.0 {
                continue;
            }
            // Clamp before converting: a tiny positive BPM overflows Duration.
            let remaining_secs = remaining_beats * 60.0 / bpm;
            let chunk = Duration::from_secs_f64(remaining_secs.min(self.pause_chunk.as_secs_f64()));
            let started = Instant::now();
            self.nap(chunk);
            remaining_beats -= started.elapsed().as_secs_f64() * bpm / 60.0;
        }
        None
    }

    fn interrupted(&self, watch: &mut Interrupts) -> Option<RunOutcome> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Some(RunOutcome::Stopped);
        }
        if watch.gesture {
            if self.tempo.snapshot().connected {
                watch.seen_connected = true;
            } else if watch.seen_connected {
                tracing::warn!("wand disconnected during gesture playback");
                return Some(RunOutcome::Disconnected);
            }
        }
        None
    }

    /// Sleeps for up to `duration`, returning early on a stop request.
    fn nap(&self, duration: Duration) {
        if let Err(RecvTimeoutError::Disconnected) = self.wake_rx.recv_timeout(duration) {
            thread::sleep(duration);
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut status = self.status.write();
        if status.state != state {
            tracing::debug!(from = ?status.state, to = ?state, "playback state");
            status.state = state;
        }
        if state == SessionState::Running {
            status.entered_running = true;
        }
    }

    fn finish(&self) {
        {
            let mut status = self.status.write();
            status.state = SessionState::Stopped;
            status.playing = false;
            status.cursor_ticks = 0;
            status.record_requested = false;
        }
        self.controller.release_pause();
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("status", &*self.status.read())
            .field("pause_chunk", &self.pause_chunk)
            .field("gesture_required", &self.gesture_required)
            .finish()
    }
}

/// Per-run disconnect tracking. A gesture run only aborts on disconnect after
/// the wand has been seen connected during that run.
struct Interrupts {
    gesture: bool,
    seen_connected: bool,
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{InputMode, TempoState, TimedEvent};

    fn engine_at(bpm: f32, mode: InputMode) -> (PlaybackEngine, SharedTempo) {
        let tempo = SharedTempo::with_state(TempoState {
            bpm,
            paused: bpm <= 0.0,
            mode,
            ..Default::default()
        });
        let engine = PlaybackEngine::new(
            TempoController::new(tempo.clone()),
            &PlaybackConfig::default(),
        );
        (engine, tempo)
    }

    fn stream(deltas: &[u32]) -> EventStream {
        let events = deltas
            .iter()
            .enumerate()
            .map(|(i, delta)| TimedEvent::new(*delta, [0x90, 60 + i as u8, 100]))
            .collect();
        EventStream::new(480, events).unwrap()
    }

    fn spawn_with_channel(
        engine: &PlaybackEngine,
    ) -> (JoinHandle<RunOutcome>, Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = engine.spawn(Box::new(ChannelSink::new(tx))).unwrap();
        (handle, rx)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn plays_two_events_at_sixty_bpm_in_about_a_second() {
        let (engine, _) = engine_at(60.0, InputMode::StandardTempo);
        engine.load(stream(&[0, 480]), LoadOptions::default()).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelSink::new(tx);
        let started = Instant::now();
        let outcome = engine.run(&mut sink);
        let elapsed = started.elapsed();

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(elapsed >= Duration::from_millis(950), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
        let payloads: Vec<Vec<u8>> = rx.try_iter().collect();
        assert_eq!(payloads, vec![vec![0x90, 60, 100], vec![0x90, 61, 100]]);

        let progress = engine.progress();
        assert_eq!(progress.cursor_ticks, 0);
        assert!(!progress.playing);
    }

    #[test]
    fn rejects_load_while_a_session_is_armed() {
        let (engine, _) = engine_at(120.0, InputMode::StandardTempo);
        engine.load(stream(&[0]), LoadOptions::default()).unwrap();
        let err = engine.load(stream(&[0]), LoadOptions::default()).unwrap_err();
        assert!(matches!(err, ConductorError::AlreadyRunning));

        engine.stop();
        engine.load(stream(&[0]), LoadOptions::default()).unwrap();
    }

    #[test]
    fn zero_tempo_holds_the_cursor() {
        let (engine, tempo) = engine_at(0.0, InputMode::StandardTempo);
        let controller = TempoController::new(tempo);
        engine.load(stream(&[0, 480]), LoadOptions::default()).unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        assert!(wait_for(|| engine.progress().state == SessionState::Paused));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(engine.progress().cursor_ticks, 0);
        assert!(rx.try_recv().is_err());

        controller.normalize(240.0);
        assert_eq!(handle.join().unwrap(), RunOutcome::Completed);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn stop_rewinds_within_one_chunk() {
        let (engine, _) = engine_at(60.0, InputMode::StandardTempo);
        engine.load(stream(&[0, 480 * 100]), LoadOptions::default()).unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let requested = Instant::now();
        engine.stop();
        assert_eq!(handle.join().unwrap(), RunOutcome::Stopped);
        assert!(requested.elapsed() < Duration::from_millis(200));

        let progress = engine.progress();
        assert_eq!(progress.cursor_ticks, 0);
        assert!(!progress.playing);
        assert_eq!(progress.state, SessionState::Stopped);
    }

    #[test]
    fn tempo_change_only_affects_the_next_wait() {
        let (engine, tempo) = engine_at(240.0, InputMode::StandardTempo);
        let controller = TempoController::new(tempo);
        engine.load(stream(&[0, 480, 480]), LoadOptions::default()).unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let first = Instant::now();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = Instant::now();
        controller.normalize(60.0);
        rx.recv_timeout(Duration::from_secs(3)).unwrap();
        let third = Instant::now();

        assert!(second - first < Duration::from_millis(500));
        assert!(third - second > Duration::from_millis(700));
        assert_eq!(handle.join().unwrap(), RunOutcome::Completed);
    }

    #[test]
    fn warmup_waits_for_signature_beats() {
        let (engine, tempo) = engine_at(240.0, InputMode::StandardTempo);
        let stream = stream(&[0, 120]).with_time_signature(2);
        engine
            .load(
                stream,
                LoadOptions {
                    warmup: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        assert!(wait_for(|| engine.progress().state == SessionState::Warmup));
        tempo.count_beat();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(engine.progress().state, SessionState::Warmup);
        assert!(rx.try_recv().is_err());

        tempo.count_beat();
        assert_eq!(handle.join().unwrap(), RunOutcome::Completed);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn gesture_playback_aborts_on_disconnect() {
        let (engine, tempo) = engine_at(60.0, InputMode::LiveGesture);
        tempo.mark_heartbeat(Instant::now());
        engine.load(stream(&[0, 480 * 100]), LoadOptions::default()).unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        tempo.mark_disconnected();
        assert_eq!(handle.join().unwrap(), RunOutcome::Disconnected);
        assert_eq!(engine.progress().cursor_ticks, 0);
    }

    #[test]
    fn sink_failure_is_a_clean_stop() {
        let (engine, _) = engine_at(120.0, InputMode::StandardTempo);
        engine.load(stream(&[0, 0]), LoadOptions::default()).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);

        let outcome = engine.run(&mut ChannelSink::new(tx));
        assert_eq!(outcome, RunOutcome::Failed);
        assert!(!engine.progress().playing);
        engine.load(stream(&[0]), LoadOptions::default()).unwrap();
    }

    #[test]
    fn empty_stream_is_rejected() {
        let (engine, _) = engine_at(120.0, InputMode::StandardTempo);
        let empty = EventStream::new(480, Vec::new()).unwrap();
        let err = engine.load(empty, LoadOptions::default()).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidStream(_)));
        assert!(!engine.progress().playing);
    }

    #[test]
    fn start_paused_holds_the_cursor_until_resume() {
        let (engine, _) = engine_at(240.0, InputMode::StandardTempo);
        let options = LoadOptions {
            start_paused: true,
            ..Default::default()
        };
        engine.load(stream(&[0, 120]), options).unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        assert!(wait_for(|| engine.progress().state == SessionState::Paused));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(engine.progress().cursor_ticks, 0);
        assert!(rx.try_recv().is_err());

        let session = engine.monitor().snapshot();
        assert_eq!(session.generation, 1);
        assert!(session.entered_running);
        assert!(session.in_progress());

        assert!(engine.resume());
        assert_eq!(handle.join().unwrap(), RunOutcome::Completed);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn manual_pause_mid_wait_freezes_the_cursor() {
        let (engine, _) = engine_at(240.0, InputMode::StandardTempo);
        engine.load(stream(&[120; 40]), LoadOptions::default()).unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        engine.pause();
        assert!(wait_for(|| engine.progress().state == SessionState::Paused));
        let held = engine.progress().cursor_ticks;
        let emitted = rx.try_iter().count();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(engine.progress().cursor_ticks, held);
        assert_eq!(rx.try_iter().count(), 0);
        assert!(held < 120 * 40);

        assert!(engine.resume());
        assert_eq!(handle.join().unwrap(), RunOutcome::Completed);
        assert_eq!(1 + emitted + rx.try_iter().count(), 40);
    }

    #[test]
    fn tiny_positive_tempo_crawls_instead_of_failing() {
        let (engine, tempo) = engine_at(1e-40, InputMode::StandardTempo);
        let controller = TempoController::new(tempo);
        engine.load(stream(&[0, 480]), LoadOptions::default()).unwrap();
        let (handle, rx) = spawn_with_channel(&engine);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(engine.progress().state, SessionState::Running);
        assert!(!handle.is_finished());

        controller.normalize(240.0);
        assert_eq!(handle.join().unwrap(), RunOutcome::Completed);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn reload_ends_the_active_run_and_arms_a_fresh_session() {
        let (engine, _) = engine_at(60.0, InputMode::StandardTempo);
        engine.load(stream(&[0, 480 * 100]), LoadOptions::default()).unwrap();
        let (first, rx) = spawn_with_channel(&engine);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        engine
            .reload(stream(&[0, 0]), LoadOptions::default(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(first.join().unwrap(), RunOutcome::Stopped);

        let progress = engine.progress();
        assert!(progress.playing);
        assert_eq!(progress.cursor_ticks, 0);
        assert_eq!(progress.state, SessionState::Idle);
        assert_eq!(engine.monitor().snapshot().generation, 2);

        let (second, rx) = spawn_with_channel(&engine);
        assert_eq!(second.join().unwrap(), RunOutcome::Completed);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn progress_maps_cursor_onto_nominal_duration() {
        let (engine, tempo) = engine_at(0.0, InputMode::StandardTempo);
        let controller = TempoController::new(tempo);
        engine.load(stream(&[0, 480, 480]), LoadOptions::default()).unwrap();
        assert_eq!(engine.progress().total_ticks, 960);
        assert_eq!(engine.progress().nominal_duration, Duration::from_secs(1));

        let (handle, _rx) = spawn_with_channel(&engine);
        controller.normalize(240.0);
        assert!(wait_for(|| engine.progress().cursor_ticks >= 480));
        let progress = engine.progress();
        assert!(progress.percent >= 50.0);
        assert!(progress.elapsed >= Duration::from_millis(500));
        handle.join().unwrap();
    }
}
