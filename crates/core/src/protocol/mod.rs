//! Text protocols spoken between the wand, the hub and its consumers.
//!
//! Everything on the wire is newline-delimited ASCII. The wand emits
//! [`SensorLine`]s, upstream controllers send [`DeviceCommand`]s through the
//! hub, and the orientation tracker reports [`CalibrationStatus`] datagrams to
//! the playback side.

use std::fmt;

/// Heartbeat the hub emits while the serial device is open.
pub const HEARTBEAT_LINE: &str = "STATUS: CONNECTED";
/// Notification the hub emits when the device is lost or cannot be opened.
pub const DISCONNECT_LINE: &str = "STATUS: DISCONNECTED";

/// Link state reported through `STATUS:` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// One parsed line from the wand (or a datagram relayed by the hub).
#[derive(Debug, Clone, PartialEq)]
pub enum SensorLine {
    /// `BPM: <float>`
    Bpm(f32),
    /// `STATUS: CONNECTED` / `STATUS: DISCONNECTED`
    Status(LinkStatus),
    /// `DATA,<f1>,<f2>,...`
    Data(Vec<f32>),
    /// `BEAT_TRIG`
    BeatTrigger,
    /// `LOG:<text>`
    Log(String),
    /// `CALIB_STATUS:READY` / `CALIB_STATUS:LOST`
    Calibration(CalibrationStatus),
}

/// Reasons a recognised line could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    /// The prefix matched but a numeric field did not parse.
    BadNumber(String),
    /// A `DATA` line carried fewer than three or more than seven fields.
    FieldCount(usize),
    /// The prefix matched but the value was not one of the known keywords.
    UnknownValue(String),
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadNumber(field) => write!(f, "unparsable numeric field `{field}`"),
            Self::FieldCount(count) => write!(f, "unexpected data field count {count}"),
            Self::UnknownValue(value) => write!(f, "unknown value `{value}`"),
        }
    }
}

impl std::error::Error for LineError {}

pub const MIN_DATA_FIELDS: usize = 3;
pub const MAX_DATA_FIELDS: usize = 7;

impl SensorLine {
    /// Parses one line. `Ok(None)` means the line is not part of the protocol
    /// and should be ignored.
    pub fn parse(raw: &str) -> Result<Option<Self>, LineError> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(None);
        }

        if let Some(rest) = line.strip_prefix("BPM:") {
            return parse_number(rest).map(|bpm| Some(Self::Bpm(bpm)));
        }

        if let Some(rest) = line.strip_prefix("STATUS:") {
            return match rest.trim() {
                "CONNECTED" => Ok(Some(Self::Status(LinkStatus::Connected))),
                "DISCONNECTED" => Ok(Some(Self::Status(LinkStatus::Disconnected))),
                other => Err(LineError::UnknownValue(other.to_string())),
            };
        }

        if let Some(rest) = line.strip_prefix("DATA,") {
            let fields = rest
                .split(',')
                .map(parse_number)
                .collect::<Result<Vec<_>, _>>()?;
            if !(MIN_DATA_FIELDS..=MAX_DATA_FIELDS).contains(&fields.len()) {
                return Err(LineError::FieldCount(fields.len()));
            }
            return Ok(Some(Self::Data(fields)));
        }

        if line == "BEAT_TRIG" {
            return Ok(Some(Self::BeatTrigger));
        }

        if let Some(rest) = line.strip_prefix("LOG:") {
            return Ok(Some(Self::Log(rest.trim().to_string())));
        }

        if let Some(rest) = line.strip_prefix(CalibrationStatus::PREFIX) {
            return CalibrationStatus::from_keyword(rest.trim())
                .map(|status| Some(Self::Calibration(status)))
                .ok_or_else(|| LineError::UnknownValue(rest.trim().to_string()));
        }

        Ok(None)
    }

    /// Parses raw datagram or serial bytes, replacing invalid UTF-8.
    pub fn parse_bytes(raw: &[u8]) -> Result<Option<Self>, LineError> {
        Self::parse(&String::from_utf8_lossy(raw))
    }
}

fn parse_number(field: &str) -> Result<f32, LineError> {
    let trimmed = field.trim();
    trimmed
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| LineError::BadNumber(trimmed.to_string()))
}

/// Formats a `DATA,...` line without the trailing newline.
pub fn data_line(fields: &[f32]) -> String {
    let mut line = String::from("DATA");
    for field in fields {
        line.push(',');
        line.push_str(&field.to_string());
    }
    line
}

/// Commands understood by the wand firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Beats per bar the beat detector should expect.
    SetSignature(u8),
    DisableButton,
    EnableButton,
    CalibrationComplete,
    /// Anything else, forwarded untouched.
    Raw(String),
}

impl DeviceCommand {
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim();
        match text {
            "DISABLE_BUTTON" => Self::DisableButton,
            "ENABLE_BUTTON" => Self::EnableButton,
            "CALIB_COMPLETE" => Self::CalibrationComplete,
            _ => text
                .strip_prefix("SET_SIG:")
                .and_then(|n| n.trim().parse::<u8>().ok())
                .map_or_else(|| Self::Raw(text.to_string()), Self::SetSignature),
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetSignature(beats) => write!(f, "SET_SIG:{beats}"),
            Self::DisableButton => f.write_str("DISABLE_BUTTON"),
            Self::EnableButton => f.write_str("ENABLE_BUTTON"),
            Self::CalibrationComplete => f.write_str("CALIB_COMPLETE"),
            Self::Raw(text) => f.write_str(text),
        }
    }
}

/// Calibration readiness reported by the orientation tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    Ready,
    Lost,
}

impl CalibrationStatus {
    const PREFIX: &'static str = "CALIB_STATUS:";

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "READY" => Some(Self::Ready),
            "LOST" => Some(Self::Lost),
            _ => None,
        }
    }

    pub fn datagram(self) -> &'static str {
        match self {
            Self::Ready => "CALIB_STATUS:READY",
            Self::Lost => "CALIB_STATUS:LOST",
        }
    }
}
