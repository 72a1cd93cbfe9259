/// Result alias that carries the custom [`ConductorError`] type.
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Common error type for the core crate.
///
/// Only invalid requests surface through this type. Transient I/O problems and
/// malformed input inside the long-running loops are logged and absorbed where
/// they happen.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A stream was loaded while another playback session is still active.
    #[error("a playback session is already running")]
    AlreadyRunning,
    /// The event stream could not be used for playback.
    #[error("invalid event stream: {0}")]
    InvalidStream(String),
    /// The configuration file could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Standard MIDI File parse failure.
    #[error("midi parse error: {0}")]
    Midi(#[from] midly::Error),
    /// Serial device could not be opened.
    #[error("serial device error: {0}")]
    Serial(#[from] serialport::Error),
}

impl ConductorError {
    pub fn invalid_stream<T: Into<String>>(reason: T) -> Self {
        Self::InvalidStream(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_keep_their_source_text() {
        let io = ConductorError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "no wand"));
        assert_eq!(io.to_string(), "no wand");
        assert_eq!(
            ConductorError::invalid_stream("empty").to_string(),
            "invalid event stream: empty"
        );
    }
}
