use std::{path::Path, time::Duration};

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use crate::{tempo::DEFAULT_BPM, ConductorError, Result};

const DEFAULT_MICROS_PER_BEAT: u32 = 500_000;

/// One entry of an [`EventStream`]. `payload` holds raw MIDI bytes for
/// channel and system-exclusive events and is empty for meta events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub delta_ticks: u32,
    pub payload: Vec<u8>,
    pub is_meta: bool,
}

impl TimedEvent {
    pub fn new(delta_ticks: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delta_ticks,
            payload: payload.into(),
            is_meta: false,
        }
    }

    pub fn meta(delta_ticks: u32) -> Self {
        Self {
            delta_ticks,
            payload: Vec::new(),
            is_meta: true,
        }
    }
}

/// Time-ordered, immutable event sequence at a fixed tick resolution.
#[derive(Debug, Clone)]
pub struct EventStream {
    ticks_per_beat: u16,
    events: Vec<TimedEvent>,
    total_ticks: u64,
    time_signature_numerator: Option<u8>,
    detected_bpm: Option<f32>,
    nominal_duration: Duration,
}

impl EventStream {
    /// Builds a stream from already merged events. The nominal duration
    /// assumes the standard MIDI tempo of 120 BPM.
    pub fn new(ticks_per_beat: u16, events: Vec<TimedEvent>) -> Result<Self> {
        if ticks_per_beat == 0 {
            return Err(ConductorError::invalid_stream("ticks per beat must be positive"));
        }

        let total_ticks = events.iter().map(|e| u64::from(e.delta_ticks)).sum();
        let nominal_duration = ticks_to_duration(total_ticks, ticks_per_beat, DEFAULT_BPM);
        Ok(Self {
            ticks_per_beat,
            events,
            total_ticks,
            time_signature_numerator: None,
            detected_bpm: None,
            nominal_duration,
        })
    }

    /// Marks the stream with a time-signature numerator, as if read from a
    /// `time_signature` meta event.
    #[must_use]
    pub fn with_time_signature(mut self, numerator: u8) -> Self {
        self.time_signature_numerator = Some(numerator);
        self
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_smf_bytes(&bytes)
    }

    /// Parses a Standard MIDI File and merges all of its tracks.
    pub fn from_smf_bytes(bytes: &[u8]) -> Result<Self> {
        let smf = Smf::parse(bytes)?;
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(tpb) => tpb.as_int(),
            Timing::Timecode(..) => {
                return Err(ConductorError::invalid_stream(
                    "SMPTE timecode files are not supported",
                ))
            }
        };
        if ticks_per_beat == 0 {
            return Err(ConductorError::invalid_stream("ticks per beat must be positive"));
        }

        let mut absolute = Vec::new();
        let mut total_ticks = 0_u64;
        for track in &smf.tracks {
            let mut tick = 0_u64;
            for event in track {
                tick += u64::from(event.delta.as_int());
                absolute.push((tick, event.kind));
            }
            total_ticks = total_ticks.max(tick);
        }
        // Stable: ties keep track order.
        absolute.sort_by_key(|(tick, _)| *tick);

        let mut events = Vec::with_capacity(absolute.len());
        let mut time_signature_numerator = None;
        let mut detected_bpm = None;
        let mut micros_per_beat = DEFAULT_MICROS_PER_BEAT;
        let mut nominal_seconds = 0.0_f64;
        let mut previous_tick = 0_u64;

        for (tick, kind) in absolute {
            let delta = tick - previous_tick;
            previous_tick = tick;
            nominal_seconds +=
                delta as f64 * f64::from(micros_per_beat) / 1e6 / f64::from(ticks_per_beat);

            let delta_ticks = u32::try_from(delta)
                .map_err(|_| ConductorError::invalid_stream("event delta out of range"))?;

            let event = match kind {
                TrackEventKind::Midi { channel, message } => {
                    TimedEvent::new(delta_ticks, encode_channel_message(channel.as_int(), message))
                }
                TrackEventKind::SysEx(data) => {
                    let mut payload = Vec::with_capacity(data.len() + 1);
                    payload.push(0xF0);
                    payload.extend_from_slice(data);
                    TimedEvent::new(delta_ticks, payload)
                }
                TrackEventKind::Escape(data) => TimedEvent::new(delta_ticks, data.to_vec()),
                TrackEventKind::Meta(meta) => {
                    match meta {
                        MetaMessage::Tempo(value) if value.as_int() > 0 => {
                            micros_per_beat = value.as_int();
                            detected_bpm = Some((60e6 / f64::from(micros_per_beat)) as f32);
                        }
                        MetaMessage::TimeSignature(numerator, ..) => {
                            time_signature_numerator.get_or_insert(numerator);
                        }
                        _ => {}
                    }
                    TimedEvent::meta(delta_ticks)
                }
            };
            events.push(event);
        }

        tracing::debug!(
            events = events.len(),
            ticks_per_beat,
            total_ticks,
            ?time_signature_numerator,
            ?detected_bpm,
            "loaded midi stream"
        );

        Ok(Self {
            ticks_per_beat,
            events,
            total_ticks,
            time_signature_numerator,
            detected_bpm,
            nominal_duration: Duration::from_secs_f64(nominal_seconds),
        })
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.ticks_per_beat
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn time_signature_numerator(&self) -> Option<u8> {
        self.time_signature_numerator
    }

    /// Tempo of the last `set_tempo` event, if the stream has one.
    pub fn detected_bpm(&self) -> Option<f32> {
        self.detected_bpm
    }

    /// Duration of the stream when played at its own tempo map.
    pub fn nominal_duration(&self) -> Duration {
        self.nominal_duration
    }

    /// Preparatory beats to absorb before playback starts.
    pub fn warmup_beats(&self, default: u32) -> u32 {
        self.time_signature_numerator
            .map_or(default, u32::from)
            .max(1)
    }
}

/// Wall-clock length of `ticks` at a constant tempo.
pub fn ticks_to_duration(ticks: u64, ticks_per_beat: u16, bpm: f32) -> Duration {
    if bpm <= 0.0 || ticks_per_beat == 0 {
        return Duration::ZERO;
    }
    let seconds = ticks as f64 * (60.0 / f64::from(bpm)) / f64::from(ticks_per_beat);
    Duration::from_secs_f64(seconds)
}

fn encode_channel_message(channel: u8, message: MidiMessage) -> Vec<u8> {
    let ch = channel & 0x0F;
    match message {
        MidiMessage::NoteOff { key, vel } => vec![0x80 | ch, key.as_int(), vel.as_int()],
        MidiMessage::NoteOn { key, vel } => vec![0x90 | ch, key.as_int(), vel.as_int()],
        MidiMessage::Aftertouch { key, vel } => vec![0xA0 | ch, key.as_int(), vel.as_int()],
        MidiMessage::Controller { controller, value } => {
            vec![0xB0 | ch, controller.as_int(), value.as_int()]
        }
        MidiMessage::ProgramChange { program } => vec![0xC0 | ch, program.as_int()],
        MidiMessage::ChannelAftertouch { vel } => vec![0xD0 | ch, vel.as_int()],
        MidiMessage::PitchBend { bend } => {
            let value = bend.0.as_int();
            vec![0xE0 | ch, (value & 0x7F) as u8, (value >> 7) as u8]
        }
    }
}
