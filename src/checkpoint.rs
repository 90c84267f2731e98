//! Checkpoints let an interrupted session pick up where it stopped.
//!
//! A checkpoint is a [Snapshot] written as RON to
//! `<state dir>/<subject>_<condition>_<experiment>.savestate`. It is written
//! to a temporary file first and renamed over the old one, so a reader sees
//! either the previous checkpoint or the new one, never half of one.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use std::{
    borrow::Cow,
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::session::{file_component, SessionKey};
use crate::stage::{Stage, StageId, StageIdAllocator};

/// Bumped whenever [Snapshot] changes shape.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume, and nothing tied to a live device or screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version, see [SNAPSHOT_VERSION].
    pub version: u32,
    /// The session this belongs to.
    pub session: SessionKey,
    /// Stages still to run, in order.
    pub stages: Vec<Stage>,
    /// The most recent instructional stage, shown again on resume.
    pub last_instructions: Option<Stage>,
    /// Id counter, so resumed stages never reuse an id.
    pub ids: StageIdAllocator,
    /// Stages already completed, in completion order.
    pub completed: Vec<StageId>,
    /// The data log the session writes to.
    pub log_path: Option<PathBuf>,
}

/// What [CheckpointStore::save] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A checkpoint was written.
    Saved,
    /// Too little was left to be worth resuming; any checkpoint was removed.
    Deleted,
}

/// Why a checkpoint could not be written or trusted.
#[derive(Debug)]
pub enum CheckpointError {
    /// Returned when io fails when reading or writing files.
    Io(io::Error),

    /// Returned when serialization of the snapshot fails.
    Serialize(ron::Error),

    /// Returned when the checkpoint is not a readable snapshot.
    Parse(ron::de::SpannedError),

    /// The checkpoint was written by an incompatible version.
    VersionMismatch {
        /// Version in the file.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// The checkpoint belongs to a different session.
    KeyMismatch {
        /// Key in the file.
        found: SessionKey,
    },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CheckpointError as CE;
        let msg = match self {
            CE::Io(error) => Cow::from(format!("io error: {}", error)),
            CE::Serialize(error) => Cow::from(format!("ron error: {}", error)),
            CE::Parse(error) => Cow::from(format!("corrupt checkpoint: {}", error)),
            CE::VersionMismatch { found, expected } => Cow::from(format!(
                "checkpoint version {found} cannot be resumed by version {expected}"
            )),
            CE::KeyMismatch { found } => Cow::from(format!(
                "checkpoint belongs to subject {} / condition {} / experiment {}",
                found.subject, found.condition, found.experiment
            )),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for CheckpointError {}

impl From<io::Error> for CheckpointError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::Error> for CheckpointError {
    fn from(value: ron::Error) -> Self {
        Self::Serialize(value)
    }
}

impl From<ron::de::SpannedError> for CheckpointError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::Parse(value)
    }
}

impl Snapshot {
    /// A snapshot at the current version.
    pub fn new(session: SessionKey, stages: Vec<Stage>, ids: StageIdAllocator) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            session,
            stages,
            last_instructions: None,
            ids,
            completed: Vec::new(),
            log_path: None,
        }
    }
}

/// The checkpoint file of one session.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    key: SessionKey,
}

impl CheckpointStore {
    /// The store for `key` inside `dir`. Nothing is touched on disk.
    pub fn new(dir: impl AsRef<Path>, key: SessionKey) -> Self {
        let name = format!(
            "{}_{}_{}.savestate",
            file_component(&key.subject),
            file_component(&key.condition),
            file_component(&key.experiment)
        );
        CheckpointStore {
            path: dir.as_ref().join(name),
            key,
        }
    }

    /// Where the checkpoint lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a checkpoint file is present.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically replaces the checkpoint, or deletes it when fewer than two
    /// stages remain.
    pub fn save(&self, snapshot: &Snapshot) -> Result<SaveOutcome, CheckpointError> {
        if snapshot.stages.len() < 2 {
            self.delete()?;
            return Ok(SaveOutcome::Deleted);
        }

        let text = ron::ser::to_string_pretty(snapshot, ron::ser::PrettyConfig::default())?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("savestate.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            "checkpoint saved to {} ({} stages left)",
            self.path.display(),
            snapshot.stages.len()
        );
        Ok(SaveOutcome::Saved)
    }

    /// Reads the checkpoint. `Ok(None)` when there is none; anything present
    /// but unusable is an error.
    pub fn load(&self) -> Result<Option<Snapshot>, CheckpointError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let snapshot: Snapshot = ron::from_str(&text)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        if snapshot.session != self.key {
            return Err(CheckpointError::KeyMismatch {
                found: snapshot.session,
            });
        }

        info!(
            "loaded checkpoint {} with {} stages left",
            self.path.display(),
            snapshot.stages.len()
        );
        Ok(Some(snapshot))
    }

    /// Removes the checkpoint if there is one.
    pub fn delete(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("checkpoint {} removed", self.path.display());
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Moves an unusable checkpoint aside so a fresh session can start
    /// without destroying it.
    pub fn quarantine(&self) -> Result<PathBuf, CheckpointError> {
        let aside = self.path.with_extension("savestate.corrupt");
        fs::rename(&self.path, &aside)?;
        warn!(
            "checkpoint {} moved to {}",
            self.path.display(),
            aside.display()
        );
        Ok(aside)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageKind, StimulusRef};

    fn key() -> SessionKey {
        SessionKey {
            subject: "12".to_owned(),
            condition: "A".to_owned(),
            experiment: "words".to_owned(),
        }
    }

    fn snapshot(stages: usize) -> Snapshot {
        let mut ids = StageIdAllocator::new();
        let stages = (0..stages)
            .map(|i| {
                Stage::trial(
                    &mut ids,
                    StimulusRef {
                        id: format!("s{i}"),
                        file: PathBuf::from(format!("s{i}.vtt")),
                    },
                    vec!["a".to_owned(), "b".to_owned()],
                    "a",
                )
            })
            .collect();
        let mut snapshot = Snapshot::new(key(), stages, ids);
        snapshot.last_instructions = Some(Stage::new(
            &mut snapshot.ids,
            "instructions",
            StageKind::InstructionWithMedia {
                text: "Listen".to_owned(),
                media: Some(PathBuf::from("intro.mp4")),
                button_label: "Continue".to_owned(),
                enable_after_ms: 0,
            },
        ));
        snapshot
    }

    #[test]
    fn missing_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), key());
        assert!(store.load().unwrap().is_none());
        assert!(store.path().ends_with("12_A_words.savestate"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), key());
        let snapshot = snapshot(4);

        assert_eq!(store.save(&snapshot).unwrap(), SaveOutcome::Saved);
        assert_eq!(store.load().unwrap(), Some(snapshot));
        assert!(!dir.path().join("12_A_words.savestate.tmp").exists());
    }

    #[test]
    fn one_stage_left_deletes_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), key());

        store.save(&snapshot(3)).unwrap();
        assert!(store.exists());

        assert_eq!(store.save(&snapshot(1)).unwrap(), SaveOutcome::Deleted);
        assert!(!store.exists());
        assert_eq!(store.save(&snapshot(0)).unwrap(), SaveOutcome::Deleted);
    }

    #[test]
    fn corrupt_checkpoint_is_an_error_and_can_be_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), key());
        fs::write(store.path(), "(version: 1, sess").unwrap();

        assert!(matches!(store.load(), Err(CheckpointError::Parse(_))));

        let aside = store.quarantine().unwrap();
        assert!(aside.exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn foreign_or_old_checkpoints_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), key());

        let mut old = snapshot(3);
        old.version = 0;
        store.save(&old).unwrap();
        assert!(matches!(
            store.load(),
            Err(CheckpointError::VersionMismatch {
                found: 0,
                expected: 1
            })
        ));

        let mut foreign = snapshot(3);
        foreign.session.subject = "13".to_owned();
        store.save(&foreign).unwrap();
        assert!(matches!(
            store.load(),
            Err(CheckpointError::KeyMismatch { .. })
        ));
    }
}
