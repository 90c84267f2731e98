//! The experiment data log: one CSV row per completed stage.
//!
//! The file is append-only. The header goes in once, when the file is empty,
//! and every row is flushed to disk before [RecordSink::write_record]
//! returns, so a crash can only lose the row being written.

use chrono::Local;
use log::{debug, info};

use std::{
    borrow::Cow,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::session::{file_component, SessionInfo};
use crate::stage::Stage;

/// Column names, in order.
pub const HEADER: [&str; 9] = [
    "timestamp",
    "subject",
    "condition",
    "facilitator",
    "event",
    "stage_id",
    "selection",
    "stimulus_id",
    "stimulus_file",
];

/// Local time with millisecond resolution, as written in the timestamp
/// column.
pub fn now_stamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S-%3f").to_string()
}

/// [now_stamp] without the characters some file systems reject.
pub fn file_stamp() -> String {
    now_stamp().replace(':', "-")
}

/// What happened to the stage a row is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The stage ran to completion.
    Finished,
    /// The stage's stimulus could not be loaded, so it was skipped.
    StimulusError,
}

impl EventKind {
    /// The value of the event column.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Finished => "finished",
            EventKind::StimulusError => "stimulus_error",
        }
    }
}

/// One row, minus the session columns the logger fills in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// See [now_stamp].
    pub timestamp: String,
    /// What happened.
    pub event: EventKind,
    /// The stage's id.
    pub stage_id: String,
    /// What the subject picked.
    pub selection: Option<String>,
    /// The stimulus' id.
    pub stimulus_id: Option<String>,
    /// The stimulus' file name, without directories.
    pub stimulus_file: Option<String>,
}

impl LogRecord {
    /// The record for `stage`, stamped now.
    pub fn for_stage(stage: &Stage, event: EventKind) -> Self {
        let stimulus = stage.stimulus();
        LogRecord {
            timestamp: now_stamp(),
            event,
            stage_id: stage.id.to_string(),
            selection: stage.selection().map(str::to_owned),
            stimulus_id: stimulus.map(|s| s.id.clone()),
            stimulus_file: stimulus.map(|s| {
                s.file
                    .file_name()
                    .map_or_else(|| s.file.display().to_string(), |n| {
                        n.to_string_lossy().into_owned()
                    })
            }),
        }
    }
}

/// A row could not be written.
#[derive(Debug)]
pub enum LogWriteError {
    /// Returned when io fails when opening or appending to the log.
    Io(io::Error),
}

impl fmt::Display for LogWriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogWriteError::Io(error) => write!(f, "could not write data log: {}", error),
        }
    }
}

impl std::error::Error for LogWriteError {}

impl From<io::Error> for LogWriteError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Somewhere completed stages are recorded.
pub trait RecordSink {
    /// Appends one record durably.
    fn write_record(&mut self, record: &LogRecord) -> Result<(), LogWriteError>;

    /// The file the records end up in, if there is one.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// The CSV data log of one session.
#[derive(Debug)]
pub struct DataLogger {
    path: PathBuf,
    file: File,
    session: SessionInfo,
}

fn escape(field: &str) -> Cow<'_, str> {
    if field.contains(&[',', '"', '\n', '\r'][..]) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn csv_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = fields
        .into_iter()
        .map(escape)
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

impl DataLogger {
    /// `<dir>/<stamp>_<subject>_<condition>_<experiment>_<facilitator>.csv`
    pub fn path_for(dir: impl AsRef<Path>, session: &SessionInfo, stamp: &str) -> PathBuf {
        let name = [
            stamp,
            session.subject.as_str(),
            session.condition.as_str(),
            session.experiment.as_str(),
            session.facilitator.as_str(),
        ]
        .map(file_component)
        .join("_");
        dir.as_ref().join(format!("{name}.csv"))
    }

    /// Opens `path` for appending, creating it and its directory if needed.
    /// The header is written only if the file is empty, so reopening the log
    /// of a resumed session continues it.
    pub fn open(path: impl AsRef<Path>, session: SessionInfo) -> Result<Self, LogWriteError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(csv_line(HEADER).as_bytes())?;
            file.sync_data()?;
            info!("data log created at {}", path.display());
        } else {
            info!("appending to data log {}", path.display());
        }

        Ok(DataLogger {
            path,
            file,
            session,
        })
    }

    /// Where the rows go.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for DataLogger {
    fn write_record(&mut self, record: &LogRecord) -> Result<(), LogWriteError> {
        let line = csv_line([
            record.timestamp.as_str(),
            self.session.subject.as_str(),
            self.session.condition.as_str(),
            self.session.facilitator.as_str(),
            record.event.as_str(),
            record.stage_id.as_str(),
            record.selection.as_deref().unwrap_or(""),
            record.stimulus_id.as_deref().unwrap_or(""),
            record.stimulus_file.as_deref().unwrap_or(""),
        ]);

        debug!("logging record {}", line.trim_end());
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageIdAllocator, StageKind, StimulusRef};

    fn session() -> SessionInfo {
        SessionInfo {
            subject: "4".to_owned(),
            condition: "B".to_owned(),
            facilitator: "sam".to_owned(),
            experiment: "words".to_owned(),
        }
    }

    fn answered_trial(ids: &mut StageIdAllocator, selection: &str) -> Stage {
        let mut stage = Stage::trial(
            ids,
            StimulusRef {
                id: "bat".to_owned(),
                file: PathBuf::from("assets/vtt/bat.vtt"),
            },
            vec!["bat".to_owned(), "pat".to_owned()],
            "bat",
        );
        if let StageKind::ForcedChoiceTrial { selection: s, .. } = &mut stage.kind {
            *s = Some(selection.to_owned());
        }
        stage
    }

    #[test]
    fn header_once_then_one_row_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = DataLogger::path_for(dir.path(), &session(), "2024-01-02T03-04-05-006");
        assert!(path.ends_with("2024-01-02T03-04-05-006_4_B_words_sam.csv"));

        let mut ids = StageIdAllocator::new();
        {
            let mut logger = DataLogger::open(&path, session()).unwrap();
            let stage = answered_trial(&mut ids, "bat");
            logger
                .write_record(&LogRecord::for_stage(&stage, EventKind::Finished))
                .unwrap();
        }
        {
            let mut logger = DataLogger::open(&path, session()).unwrap();
            let stage = Stage::prompt(&mut ids, "done", "All done", "F4");
            logger
                .write_record(&LogRecord::for_stage(&stage, EventKind::Finished))
                .unwrap();
        }

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER.join(","));
        assert!(lines[1].ends_with(",4,B,sam,finished,trial-bat-000,bat,bat,bat.vtt"));
        assert!(lines[2].ends_with(",4,B,sam,finished,done-001,,,"));
    }

    #[test]
    fn awkward_fields_are_quoted() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_line(["x", "y,z"]), "x,\"y,z\"\n");
    }

    #[test]
    fn stimulus_errors_are_labelled() {
        let mut ids = StageIdAllocator::new();
        let stage = answered_trial(&mut ids, "pat");
        let record = LogRecord::for_stage(&stage, EventKind::StimulusError);
        assert_eq!(record.event.as_str(), "stimulus_error");
        assert_eq!(record.selection.as_deref(), Some("pat"));
        assert_eq!(record.stimulus_file.as_deref(), Some("bat.vtt"));
    }
}
