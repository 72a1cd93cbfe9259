use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{ConductorError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub tempo: TempoConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

impl AppConfig {
    /// Reads a TOML configuration file. Missing sections and fields fall back
    /// to their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            ConductorError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| ConductorError::Config(err.to_string()))
    }

    /// Loads `path` when given, otherwise returns the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Shape of the `DATA,...` lines the wand firmware emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorFields {
    /// Calibrated pointing vector: `X,Y,Z`.
    #[default]
    Orientation,
    /// Raw accelerometer and gyroscope axes.
    Inertial,
    /// Raw axes followed by a beat flag column.
    InertialWithBeat,
}

impl SensorFields {
    pub fn column_names(self) -> &'static [&'static str] {
        match self {
            Self::Orientation => &["X", "Y", "Z"],
            Self::Inertial => &["AX", "AY", "AZ", "GX", "GY", "GZ"],
            Self::InertialWithBeat => &["AX", "AY", "AZ", "GX", "GY", "GZ", "Beat"],
        }
    }

    pub fn count(self) -> usize {
        self.column_names().len()
    }
}

/// Serial hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub tempo_target: String,
    pub visual_target: String,
    pub command_bind: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    pub log_dir: String,
    pub sensor_fields: SensorFields,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 921_600,
            read_timeout_ms: 20,
            tempo_target: "127.0.0.1:5005".to_string(),
            visual_target: "127.0.0.1:5006".to_string(),
            command_bind: "127.0.0.1:5007".to_string(),
            heartbeat_interval_ms: 1000,
            reconnect_backoff_ms: 500,
            max_reconnect_backoff_ms: 4000,
            log_dir: "logs".to_string(),
            sensor_fields: SensorFields::default(),
        }
    }
}

impl BridgeConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Tempo ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub listen: String,
    pub max_bpm: f32,
    pub connection_timeout_ms: u64,
    pub default_bpm: f32,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5005".to_string(),
            max_bpm: crate::tempo::MAX_BPM,
            connection_timeout_ms: 3000,
            default_bpm: 120.0,
        }
    }
}

impl TempoConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Playback scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub pause_chunk_ms: u64,
    pub warmup_default_beats: u32,
    pub gesture_required: bool,
    pub sink_target: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            pause_chunk_ms: 50,
            warmup_default_beats: 4,
            gesture_required: true,
            sink_target: None,
        }
    }
}

impl PlaybackConfig {
    pub fn pause_chunk(&self) -> Duration {
        Duration::from_millis(self.pause_chunk_ms.clamp(1, 50))
    }
}

/// Orientation tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub listen: String,
    pub viewer_target: String,
    pub viewer_commands: String,
    pub command_target: String,
    pub status_target: String,
    pub signal_timeout_ms: u64,
    pub countdown_ms: u64,
    pub publish_hz: u32,
    pub reference_axis: [f32; 3],
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5006".to_string(),
            viewer_target: "127.0.0.1:8765".to_string(),
            viewer_commands: "127.0.0.1:8766".to_string(),
            command_target: "127.0.0.1:5007".to_string(),
            status_target: "127.0.0.1:5005".to_string(),
            signal_timeout_ms: 1500,
            countdown_ms: 3000,
            publish_hz: 60,
            reference_axis: [1.0, 0.0, 0.0],
        }
    }
}

impl TrackerConfig {
    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    pub fn countdown(&self) -> Duration {
        Duration::from_millis(self.countdown_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.publish_hz.max(1)))
    }
}

/// Recorded-session replay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub max_gap_ms: u64,
    pub visual_target: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_gap_ms: 1000,
            visual_target: "127.0.0.1:5006".to_string(),
        }
    }
}

impl ReplayConfig {
    pub fn max_gap(&self) -> Duration {
        Duration::from_millis(self.max_gap_ms)
    }
}
