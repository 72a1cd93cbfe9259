//! Orientation calibration.
//!
//! [`OrientationTracker`] is a pure state machine driven by injected
//! timestamps; [`TrackerService`] wires it to the hub's visual feed, the
//! viewer and the command/status ports.

mod service;

use std::time::{Duration, Instant};

use nalgebra::{Matrix3, Vector3};
use serde::Serialize;

pub use service::{TrackerService, ViewerCommand};

use crate::{
    protocol::{CalibrationStatus, DeviceCommand},
    TrackerConfig,
};

/// Calibration phases, in the order a healthy session walks through them.
/// The discriminant is the machine-readable phase code sent to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CalibrationPhase {
    #[default]
    WaitingForSignal = 0,
    Countdown = 1,
    Calibrated = 2,
    Running = 3,
}

impl CalibrationPhase {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Side effects the tracker asks its host to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerNotice {
    /// Sent to the wand through the hub's command port.
    Device(DeviceCommand),
    /// Sent to the playback side.
    Calibration(CalibrationStatus),
}

/// One message of the viewer stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerFrame {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub phase: u8,
    pub status_text: String,
    pub beat_flag: bool,
}

/// Minimal rotation taking the direction of `from` onto the direction of
/// `to` (Rodrigues). Identity when either vector is zero or they are
/// collinear.
pub fn rotation_between(from: &Vector3<f32>, to: &Vector3<f32>) -> Matrix3<f32> {
    let (from_norm, to_norm) = (from.norm(), to.norm());
    if from_norm == 0.0 || to_norm == 0.0 {
        return Matrix3::identity();
    }

    let a = from / from_norm;
    let b = to / to_norm;
    let v = a.cross(&b);
    let c = a.dot(&b);
    let s = v.norm();
    if s == 0.0 {
        return Matrix3::identity();
    }

    let k = v.cross_matrix();
    Matrix3::identity() + k + k * k * ((1.0 - c) / (s * s))
}

#[derive(Debug, Clone)]
pub struct OrientationTracker {
    phase: CalibrationPhase,
    correction: Matrix3<f32>,
    reference: Vector3<f32>,
    raw: Vector3<f32>,
    countdown_started_at: Option<Instant>,
    last_sample_at: Option<Instant>,
    signal_timeout: Duration,
    countdown: Duration,
    beat_flag: bool,
}

impl OrientationTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        let [x, y, z] = config.reference_axis;
        Self {
            phase: CalibrationPhase::WaitingForSignal,
            correction: Matrix3::identity(),
            reference: Vector3::new(x, y, z),
            raw: Vector3::new(x, y, z),
            countdown_started_at: None,
            last_sample_at: None,
            signal_timeout: config.signal_timeout(),
            countdown: config.countdown(),
            beat_flag: false,
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn correction(&self) -> &Matrix3<f32> {
        &self.correction
    }

    /// Latest raw vector with the current correction applied.
    pub fn aligned(&self) -> Vector3<f32> {
        self.correction * self.raw
    }

    /// Accepts one raw orientation sample. Zero-length and non-finite vectors
    /// are dropped and do not count as signal.
    pub fn ingest(&mut self, raw: Vector3<f32>, now: Instant) -> bool {
        if !raw.iter().all(|v| v.is_finite()) || raw.norm() == 0.0 {
            return false;
        }
        self.raw = raw;
        self.last_sample_at = Some(now);
        true
    }

    /// Advances timers and produces the frame to publish for this tick.
    pub fn tick(&mut self, now: Instant) -> (ViewerFrame, Vec<TrackerNotice>) {
        let mut notices = Vec::new();
        let stale = self
            .last_sample_at
            .map_or(true, |at| now.saturating_duration_since(at) > self.signal_timeout);

        if stale {
            if self.phase != CalibrationPhase::WaitingForSignal {
                tracing::warn!(from = ?self.phase, "orientation signal lost");
                self.enter_waiting();
                notices.extend(lost_notices());
            }
        } else {
            if self.phase == CalibrationPhase::WaitingForSignal {
                self.enter_countdown(now);
            }
            if self.phase == CalibrationPhase::Countdown && self.countdown_elapsed(now) {
                self.correction = rotation_between(&self.raw, &self.reference);
                self.set_phase(CalibrationPhase::Calibrated);
                notices.push(TrackerNotice::Device(DeviceCommand::EnableButton));
            }
        }

        (self.frame(now), notices)
    }

    /// Hardware button or viewer "begin": the only manual transition.
    pub fn begin(&mut self) -> Vec<TrackerNotice> {
        if self.phase != CalibrationPhase::Calibrated {
            tracing::debug!(phase = ?self.phase, "begin ignored");
            return Vec::new();
        }
        self.set_phase(CalibrationPhase::Running);
        vec![
            TrackerNotice::Device(DeviceCommand::CalibrationComplete),
            TrackerNotice::Calibration(CalibrationStatus::Ready),
        ]
    }

    /// A beat trigger from the wand doubles as the calibration button.
    pub fn beat(&mut self) -> Vec<TrackerNotice> {
        if self.phase == CalibrationPhase::Calibrated {
            return self.begin();
        }
        self.beat_flag = true;
        Vec::new()
    }

    /// Drops the current calibration and restarts the countdown.
    pub fn request_recalibration(&mut self, now: Instant) -> Vec<TrackerNotice> {
        match self.phase {
            CalibrationPhase::Calibrated | CalibrationPhase::Running => {
                let notices = self.leave_calibrated();
                self.enter_countdown(now);
                notices
            }
            _ => Vec::new(),
        }
    }

    /// Back to square one; the next fresh sample starts a new countdown.
    pub fn reset(&mut self) -> Vec<TrackerNotice> {
        let notices = match self.phase {
            CalibrationPhase::Calibrated | CalibrationPhase::Running => self.leave_calibrated(),
            _ => Vec::new(),
        };
        self.enter_waiting();
        notices
    }

    fn leave_calibrated(&mut self) -> Vec<TrackerNotice> {
        self.correction = Matrix3::identity();
        lost_notices().collect()
    }

    fn enter_waiting(&mut self) {
        self.correction = Matrix3::identity();
        self.countdown_started_at = None;
        self.set_phase(CalibrationPhase::WaitingForSignal);
    }

    fn enter_countdown(&mut self, now: Instant) {
        self.correction = Matrix3::identity();
        self.countdown_started_at = Some(now);
        self.set_phase(CalibrationPhase::Countdown);
    }

    fn countdown_elapsed(&self, now: Instant) -> bool {
        self.countdown_started_at
            .map_or(false, |at| now.saturating_duration_since(at) >= self.countdown)
    }

    fn set_phase(&mut self, phase: CalibrationPhase) {
        if self.phase != phase {
            tracing::info!(from = ?self.phase, to = ?phase, "calibration phase");
            self.phase = phase;
        }
    }

    fn status_text(&self, now: Instant) -> String {
        match self.phase {
            CalibrationPhase::WaitingForSignal => "WAITING FOR WAND...".to_string(),
            CalibrationPhase::Countdown => {
                let elapsed = self
                    .countdown_started_at
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                let remaining = self.countdown.saturating_sub(elapsed).as_secs_f32().ceil();
                format!("HOLD FORWARD - CALIBRATING IN {remaining:.0}")
            }
            CalibrationPhase::Calibrated => "CALIBRATED - PRESS BUTTON TO BEGIN".to_string(),
            CalibrationPhase::Running => "READY".to_string(),
        }
    }

    fn frame(&mut self, now: Instant) -> ViewerFrame {
        let aligned = self.aligned();
        ViewerFrame {
            x: aligned.x,
            y: aligned.y,
            z: aligned.z,
            phase: self.phase.code(),
            status_text: self.status_text(now),
            beat_flag: std::mem::take(&mut self.beat_flag),
        }
    }
}

fn lost_notices() -> impl Iterator<Item = TrackerNotice> {
    [
        TrackerNotice::Device(DeviceCommand::DisableButton),
        TrackerNotice::Calibration(CalibrationStatus::Lost),
    ]
    .into_iter()
}
