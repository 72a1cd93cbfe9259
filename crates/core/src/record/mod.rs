use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};

use crate::{playback::SessionSnapshot, InputMode, Result, SensorFields};

/// One open recording file.
#[derive(Debug)]
pub struct RecordingSession {
    writer: BufWriter<File>,
    path: PathBuf,
    started_at: DateTime<Local>,
    fields: SensorFields,
    rows: u64,
}

impl RecordingSession {
    /// Creates `dir/session_<timestamp>.csv` and writes the header row.
    pub fn create(dir: &Path, fields: SensorFields, started_at: DateTime<Local>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "session_{}.csv",
            started_at.format("%Y%m%d_%H%M%S_%3f")
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_header = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);

        if needs_header {
            writeln!(writer, "Timestamp,{},bpm", fields.column_names().join(","))?;
        }

        Ok(Self {
            writer,
            path,
            started_at,
            fields,
            rows: 0,
        })
    }

    /// Appends `(timestamp, fields..., bpm)`. Samples whose field count does
    /// not match the session's sensor layout are skipped and reported as
    /// `Ok(false)`.
    pub fn append(
        &mut self,
        timestamp: DateTime<Local>,
        values: &[f32],
        bpm: f32,
    ) -> io::Result<bool> {
        if values.len() != self.fields.count() {
            return Ok(false);
        }

        let seconds = timestamp.timestamp_millis() as f64 / 1000.0;
        write!(self.writer, "{seconds:.3}")?;
        for value in values {
            write!(self.writer, ",{value}")?;
        }
        writeln!(self.writer, ",{bpm}")?;
        self.rows += 1;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and closes the file. Consuming `self` makes a second close
    /// impossible.
    pub fn close(mut self) -> io::Result<PathBuf> {
        self.writer.flush()?;
        tracing::info!(
            path = %self.path.display(),
            rows = self.rows,
            duration_s = (Local::now() - self.started_at).num_seconds(),
            "recording closed"
        );
        Ok(self.path)
    }
}

/// What [`Recorder::observe`] did in response to a lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    Started(PathBuf),
    Finished(PathBuf),
}

/// Follows the playback lifecycle and owns at most one [`RecordingSession`].
///
/// At most one recording is opened per playback generation: as soon as a
/// session that asked for recording is seen in progress, however late the
/// first poll arrives. It ends when that session leaves `Running`/`Paused` or
/// a newer generation is loaded. Nothing is recorded while a replay is
/// driving the pipeline.
#[derive(Debug)]
pub struct Recorder {
    dir: PathBuf,
    fields: SensorFields,
    session: Option<RecordingSession>,
    /// Generation the last recording was opened for.
    recorded: Option<u64>,
}

impl Recorder {
    pub fn new(dir: impl Into<PathBuf>, fields: SensorFields) -> Self {
        Self {
            dir: dir.into(),
            fields,
            session: None,
            recorded: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Feeds the latest playback snapshot. Opening or closing failures are
    /// logged; the recorder simply stays closed.
    pub fn observe(&mut self, session: SessionSnapshot, mode: InputMode) -> Option<RecorderEvent> {
        let in_progress = session.in_progress();

        if self.session.is_some() {
            if !in_progress || self.recorded != Some(session.generation) {
                return self.stop();
            }
            return None;
        }

        let wanted = in_progress && session.record_requested && mode != InputMode::Replay;
        if wanted && self.recorded != Some(session.generation) {
            let started = self.start();
            if started.is_some() {
                self.recorded = Some(session.generation);
            }
            return started;
        }
        None
    }

    fn start(&mut self) -> Option<RecorderEvent> {
        match RecordingSession::create(&self.dir, self.fields, Local::now()) {
            Ok(session) => {
                let path = session.path().to_path_buf();
                tracing::info!(path = %path.display(), "recording started");
                self.session = Some(session);
                Some(RecorderEvent::Started(path))
            }
            Err(err) => {
                tracing::warn!(%err, dir = %self.dir.display(), "cannot open recording file");
                None
            }
        }
    }

    pub fn stop(&mut self) -> Option<RecorderEvent> {
        let session = self.session.take()?;
        match session.close() {
            Ok(path) => Some(RecorderEvent::Finished(path)),
            Err(err) => {
                tracing::warn!(%err, "recording flush failed on close");
                None
            }
        }
    }

    /// Appends one sample if a recording is open.
    pub fn record_sample(&mut self, values: &[f32], bpm: f32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.append(Local::now(), values, bpm) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(fields = values.len(), "sample layout mismatch; not recorded");
            }
            Err(err) => tracing::warn!(%err, "failed to append recording row"),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}
