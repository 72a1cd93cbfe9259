//! Replays a recorded session through the live pipeline.
//!
//! Spatial columns go to the visual consumer as `DATA,...` lines and the
//! tempo column goes through the [`TempoController`], so downstream behaviour
//! matches a live wand. Hardware input is suspended for the duration by
//! switching the input mode to [`InputMode::Replay`].

use std::{
    net::{SocketAddr, UdpSocket},
    path::Path,
    thread,
    time::{Duration, Instant},
};

use crate::{
    bridge::resolve, protocol::data_line, InputMode, ReplayConfig, Result, SharedTempo, Shutdown,
    TempoController,
};

const SLEEP_CHUNK: Duration = Duration::from_millis(50);

/// One row of a recording.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySample {
    /// Seconds on the recording's clock.
    pub timestamp: f64,
    pub spatial: Vec<f32>,
    pub bpm: f32,
}

impl ReplaySample {
    /// `timestamp,<spatial>...,bpm`; at least one spatial column.
    fn parse(line: &str) -> Option<Self> {
        let columns: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if columns.len() < 3 {
            return None;
        }
        let timestamp = columns[0].parse::<f64>().ok().filter(|t| t.is_finite())?;
        let (tempo, spatial) = columns[1..].split_last()?;
        let bpm = tempo.parse::<f32>().ok()?;
        let spatial = spatial
            .iter()
            .map(|field| field.parse::<f32>().ok().filter(|v| v.is_finite()))
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            timestamp,
            spatial,
            bpm,
        })
    }
}

/// Parses a recording, skipping the header row and any malformed rows.
pub fn parse_recording(content: &str) -> Vec<ReplaySample> {
    let mut skipped = 0_usize;
    let samples = content
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let sample = ReplaySample::parse(line);
            if sample.is_none() {
                skipped += 1;
            }
            sample
        })
        .collect();
    if skipped > 0 {
        tracing::debug!(skipped, "malformed recording rows skipped");
    }
    samples
}

pub fn load_recording(path: &Path) -> Result<Vec<ReplaySample>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_recording(&content))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Finished { samples: usize },
    Interrupted { samples: usize },
}

/// Restores the previous input mode when the replay ends, however it ends.
struct ModeGuard<'a> {
    tempo: &'a SharedTempo,
    previous: InputMode,
}

impl<'a> ModeGuard<'a> {
    fn enter(tempo: &'a SharedTempo) -> Self {
        let previous = tempo.set_mode(InputMode::Replay);
        Self { tempo, previous }
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.tempo.set_mode(self.previous);
    }
}

#[derive(Debug)]
pub struct ReplayDriver {
    controller: TempoController,
    socket: UdpSocket,
    visual_target: SocketAddr,
    max_gap: Duration,
}

impl ReplayDriver {
    pub fn new(controller: TempoController, config: &ReplayConfig) -> Result<Self> {
        Ok(Self {
            controller,
            socket: UdpSocket::bind(("0.0.0.0", 0))?,
            visual_target: resolve(&config.visual_target)?,
            max_gap: config.max_gap(),
        })
    }

    /// Plays `samples` in real time, reproducing the recorded gaps (each
    /// capped at the configured maximum).
    pub fn run(&self, samples: &[ReplaySample], shutdown: &Shutdown) -> ReplayOutcome {
        let _mode = ModeGuard::enter(self.controller.tempo());
        tracing::info!(samples = samples.len(), addr = %self.visual_target, "replay started");

        let mut previous: Option<f64> = None;
        for (index, sample) in samples.iter().enumerate() {
            if let Some(prev) = previous {
                if !self.wait(self.gap(prev, sample.timestamp), shutdown) {
                    tracing::info!(played = index, "replay interrupted");
                    return ReplayOutcome::Interrupted { samples: index };
                }
            } else if shutdown.is_triggered() {
                return ReplayOutcome::Interrupted { samples: 0 };
            }
            previous = Some(sample.timestamp);

            let mut line = data_line(&sample.spatial);
            line.push('\n');
            if let Err(err) = self.socket.send_to(line.as_bytes(), self.visual_target) {
                tracing::debug!(%err, "replay datagram not delivered");
            }
            self.controller.normalize(sample.bpm);
        }

        tracing::info!(samples = samples.len(), "replay finished");
        ReplayOutcome::Finished {
            samples: samples.len(),
        }
    }

    fn gap(&self, previous: f64, current: f64) -> Duration {
        let seconds = current - previous;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(seconds).min(self.max_gap)
    }

    /// Returns false if shutdown fired before `duration` elapsed.
    fn wait(&self, duration: Duration, shutdown: &Shutdown) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if shutdown.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_CHUNK));
        }
    }
}
