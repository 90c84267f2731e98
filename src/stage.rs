//! The units an experiment is made of. A [Stage] is a tagged variant rather
//! than an open-ended record, so whether a stage carries a stimulus is a
//! question for the type system.

use serde::{Deserialize, Serialize};

use std::{fmt, path::PathBuf};

/// Stable identifier of a stage, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(String);

impl StageId {
    /// The identifier as written to logs.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out [StageId]s. The counter only goes up and is checkpointed with
/// the session, so an id is never reused, not even across a resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageIdAllocator {
    next: u32,
}

impl StageIdAllocator {
    /// Starts counting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh id of the form `name-007`.
    pub fn allocate(&mut self, name: &str) -> StageId {
        let id = StageId(format!("{}-{:03}", name, self.next));
        self.next += 1;
        id
    }

    /// How many ids have been handed out.
    pub fn issued(&self) -> u32 {
        self.next
    }
}

/// How a prompt goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dismiss {
    /// A button, clickable only once `enable_after_ms` has passed.
    Button {
        /// Button caption.
        label: String,
        /// Delay before the button accepts input.
        enable_after_ms: u64,
    },
    /// A named key, for instance `F4`.
    Key(String),
    /// The prompt dismisses itself.
    Timer {
        /// Delay before dismissal.
        after_ms: u64,
    },
}

/// Timing of one forced-choice trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialTiming {
    /// From stage start to the stimulus.
    pub before_ms: u64,
    /// Window reserved for the stimulus itself.
    pub stimulus_ms: u64,
    /// From the end of the stimulus window until input opens.
    pub after_ms: u64,
}

impl Default for TrialTiming {
    fn default() -> Self {
        TrialTiming {
            before_ms: 1000,
            stimulus_ms: 500,
            after_ms: 750,
        }
    }
}

impl TrialTiming {
    /// No delays at all, for simulated sessions.
    pub fn zero() -> Self {
        TrialTiming {
            before_ms: 0,
            stimulus_ms: 0,
            after_ms: 0,
        }
    }
}

/// Which stimulus a trial plays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StimulusRef {
    /// Identifier written to the log.
    pub id: String,
    /// The `.vtt` container.
    pub file: PathBuf,
}

/// What a stage does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageKind {
    /// Static text.
    Prompt {
        /// Text shown.
        text: String,
        /// How the prompt goes away.
        dismiss: Dismiss,
    },
    /// Play a stimulus and ask which of `options` it was.
    ForcedChoiceTrial {
        /// What gets played.
        stimulus: StimulusRef,
        /// Response options, in presentation order.
        options: Vec<String>,
        /// The correct option; used by simulated subjects.
        target: String,
        /// What the subject picked. Unset until the stage completes.
        selection: Option<String>,
        /// Delays around the stimulus.
        timing: TrialTiming,
        /// Masking noise level while the stimulus plays.
        masking_noise: Option<f32>,
    },
    /// A rest.
    Break {
        /// Text shown.
        text: String,
    },
    /// Instructions, optionally with a picture or video.
    InstructionWithMedia {
        /// Text shown.
        text: String,
        /// Media shown alongside.
        media: Option<PathBuf>,
        /// Continue button caption.
        button_label: String,
        /// Delay before the button accepts input.
        enable_after_ms: u64,
    },
}

/// One unit of subject-facing content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Unique within the session.
    pub id: StageId,
    /// Human-readable name, also the prefix of the id.
    pub name: String,
    /// What the stage does.
    pub kind: StageKind,
}

impl Stage {
    /// Allocates an id and builds the stage.
    pub fn new(ids: &mut StageIdAllocator, name: impl Into<String>, kind: StageKind) -> Self {
        let name = name.into();
        Stage {
            id: ids.allocate(&name),
            name,
            kind,
        }
    }

    /// A key-dismissed prompt.
    pub fn prompt(
        ids: &mut StageIdAllocator,
        name: &str,
        text: impl Into<String>,
        key: &str,
    ) -> Self {
        Self::new(
            ids,
            name,
            StageKind::Prompt {
                text: text.into(),
                dismiss: Dismiss::Key(key.to_owned()),
            },
        )
    }

    /// A forced-choice trial with default timing and no masking noise.
    pub fn trial(
        ids: &mut StageIdAllocator,
        stimulus: StimulusRef,
        options: Vec<String>,
        target: impl Into<String>,
    ) -> Self {
        let name = format!("trial-{}", stimulus.id);
        Self::new(
            ids,
            name,
            StageKind::ForcedChoiceTrial {
                stimulus,
                options,
                target: target.into(),
                selection: None,
                timing: TrialTiming::default(),
                masking_noise: None,
            },
        )
    }

    /// Whether this stage is the instructions a resumed session should show
    /// again.
    pub fn is_instructional(&self) -> bool {
        matches!(self.kind, StageKind::InstructionWithMedia { .. })
    }

    /// The stimulus this stage plays, if any.
    pub fn stimulus(&self) -> Option<&StimulusRef> {
        match &self.kind {
            StageKind::ForcedChoiceTrial { stimulus, .. } => Some(stimulus),
            _ => None,
        }
    }

    /// The options the subject picks from; empty for non-trials.
    pub fn options(&self) -> &[String] {
        match &self.kind {
            StageKind::ForcedChoiceTrial { options, .. } => options,
            _ => &[],
        }
    }

    /// The recorded selection, once there is one.
    pub fn selection(&self) -> Option<&str> {
        match &self.kind {
            StageKind::ForcedChoiceTrial { selection, .. } => selection.as_deref(),
            _ => None,
        }
    }

    /// Displayed text for non-trial stages.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            StageKind::Prompt { text, .. }
            | StageKind::Break { text }
            | StageKind::InstructionWithMedia { text, .. } => Some(text),
            StageKind::ForcedChoiceTrial { .. } => None,
        }
    }
}
