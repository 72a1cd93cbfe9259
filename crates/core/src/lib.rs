//! Core library for the wand conductor.
//!
//! A handheld wand streams orientation samples and a derived tempo over a
//! serial link. The [`bridge`] fans that stream out to the rest of the system,
//! the [`playback`] engine advances a MIDI event stream at the tempo held in
//! the shared [`tempo`] record, and the [`tracker`] turns raw orientation into
//! a calibrated heading for a viewer. Each subsystem runs its own loop; they
//! only meet through the shared records and UDP datagrams.

pub mod bridge;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod record;
pub mod replay;
pub mod shutdown;
pub mod tempo;
pub mod timeline;
pub mod tracker;

pub use bridge::{DeviceConnector, SensorBridge, SerialDevice, SerialPortConnector};
pub use config::{
    AppConfig, BridgeConfig, PlaybackConfig, ReplayConfig, SensorFields, TempoConfig,
    TrackerConfig,
};
pub use error::{ConductorError, Result};
pub use playback::{
    ChannelSink, EventSink, LoadOptions, LogSink, PlaybackEngine, Progress, RunOutcome,
    SessionMonitor, SessionSnapshot, SessionState, UdpSink,
};
pub use protocol::{DeviceCommand, SensorLine};
pub use record::{Recorder, RecordingSession};
pub use replay::{ReplayDriver, ReplayOutcome, ReplaySample};
pub use shutdown::Shutdown;
pub use tempo::{InputMode, SharedTempo, TempoController, TempoListener, TempoState};
pub use timeline::{EventStream, TimedEvent};
pub use tracker::{CalibrationPhase, OrientationTracker, TrackerService, ViewerFrame};
