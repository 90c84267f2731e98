//! Decoded stimuli, kept around so each `.vtt` file is read once per session.

use log::debug;

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::protocol::{FrameError, SoundBite};
use crate::vtt_format::{DecodeError, Stimulus};

/// A stimulus together with the sound bite that plays it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedStimulus {
    /// The decoded container.
    pub stimulus: Stimulus,
    /// Ready for [crate::protocol::Command::LoadSoundBite].
    pub bite: SoundBite,
}

impl LoadedStimulus {
    /// Checks that `stimulus` fits on the device.
    pub fn new(stimulus: Stimulus) -> Result<Self, FrameError> {
        let bite = SoundBite::from_stimulus(&stimulus)?;
        Ok(LoadedStimulus { stimulus, bite })
    }
}

/// A stimulus file that cannot be played. Fatal for that stimulus only.
#[derive(Debug)]
pub enum StimulusError {
    /// The container does not decode.
    Decode {
        /// The offending file.
        path: PathBuf,
        /// Why it does not decode.
        source: DecodeError,
    },
    /// The stimulus decodes but cannot be sent to the device.
    Frame {
        /// The offending file.
        path: PathBuf,
        /// Why it cannot be framed.
        source: FrameError,
    },
}

impl fmt::Display for StimulusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StimulusError::Decode { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
            StimulusError::Frame { path, source } => {
                write!(f, "{}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StimulusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StimulusError::Decode { source, .. } => Some(source),
            StimulusError::Frame { source, .. } => Some(source),
        }
    }
}

/// Cache of loaded stimuli, keyed by path. Failures are not cached.
#[derive(Debug, Default)]
pub struct StimulusLibrary {
    loaded: HashMap<PathBuf, Arc<LoadedStimulus>>,
}

impl StimulusLibrary {
    /// An empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stimulus at `path`, reading and decoding it on first use.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<Arc<LoadedStimulus>, StimulusError> {
        let path = path.as_ref();
        if let Some(loaded) = self.loaded.get(path) {
            return Ok(loaded.clone());
        }

        let stimulus = Stimulus::from_path(path).map_err(|source| StimulusError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded = LoadedStimulus::new(stimulus).map_err(|source| StimulusError::Frame {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(
            "loaded {} ({} samples)",
            path.display(),
            loaded.stimulus.samples().len()
        );

        let loaded = Arc::new(loaded);
        self.loaded.insert(path.to_path_buf(), loaded.clone());
        Ok(loaded)
    }

    /// Registers an in-memory stimulus under `path`.
    pub fn insert(&mut self, path: impl Into<PathBuf>, stimulus: Stimulus) -> Result<(), FrameError> {
        let loaded = LoadedStimulus::new(stimulus)?;
        self.loaded.insert(path.into(), Arc::new(loaded));
        Ok(())
    }

    /// Number of cached stimuli.
    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtt_format::Sample;
    use std::fs;

    #[test]
    fn files_are_decoded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.vtt");
        Stimulus::builder()
            .set_period(10)
            .add_samples([Sample::default(); 3])
            .build()
            .unwrap()
            .to_path(&path)
            .unwrap();

        let mut library = StimulusLibrary::new();
        let first = library.load(&path).unwrap();
        fs::remove_file(&path).unwrap();
        let second = library.load(&path).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.bite.period(), 10);
    }

    #[test]
    fn broken_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.vtt");
        fs::write(&bad, b"RIFF....").unwrap();

        let mut library = StimulusLibrary::new();
        assert!(matches!(
            library.load(&bad),
            Err(StimulusError::Decode {
                source: DecodeError::BadMagic,
                ..
            })
        ));

        let slow = dir.path().join("slow.vtt");
        Stimulus::builder()
            .set_period(1000)
            .build()
            .unwrap()
            .to_path(&slow)
            .unwrap();
        assert!(matches!(
            library.load(&slow),
            Err(StimulusError::Frame { .. })
        ));
        assert!(library.is_empty());
    }
}
