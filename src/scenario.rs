//! Scenario files describe an experiment as blocks of trials. They are RON
//! documents, for example:
//!
//! ```ron
//! (
//!     experiment: "words",
//!     instructions: [(text: "You will feel a word on your arm.")],
//!     blocks: [
//!         (
//!             name: "practice",
//!             stimuli: [(id: "bat", file: "vtt/bat.vtt"), (id: "pat", file: "vtt/pat.vtt")],
//!             shuffle: true,
//!             breaks: 1,
//!         ),
//!     ],
//!     counterbalance: true,
//! )
//! ```
//!
//! Relative stimulus and media paths are resolved against the directory the
//! scenario file is in.

use log::{info, warn};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use std::{
    borrow::Cow,
    collections::HashSet,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use crate::engine::StagePlan;
use crate::library::StimulusLibrary;
use crate::stage::{Stage, StageIdAllocator, StageKind, StimulusRef, TrialTiming};

fn default_break_text() -> String {
    "Take a short break. Continue when you are ready.".to_owned()
}

fn default_button_label() -> String {
    "Continue".to_owned()
}

fn default_enable_after_ms() -> u64 {
    5000
}

fn default_repeats() -> usize {
    1
}

/// An instruction screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instructions {
    /// Text shown.
    pub text: String,
    /// Picture or video shown alongside.
    #[serde(default)]
    pub media: Option<PathBuf>,
    /// Continue button caption.
    #[serde(default = "default_button_label")]
    pub button_label: String,
    /// Delay before the button accepts input.
    #[serde(default = "default_enable_after_ms")]
    pub enable_after_ms: u64,
}

/// A run of trials sharing response options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Used in stage names and logs.
    pub name: String,
    /// Shown before the block's first trial.
    #[serde(default)]
    pub instructions: Vec<Instructions>,
    /// One trial per stimulus and repeat. The stimulus id is the correct
    /// response.
    pub stimuli: Vec<StimulusRef>,
    /// Response options. Empty means the ids of the block's stimuli.
    #[serde(default)]
    pub options: Vec<String>,
    /// Shuffle the trials of the block.
    #[serde(default)]
    pub shuffle: bool,
    /// Breaks spread evenly between the block's trials.
    #[serde(default)]
    pub breaks: usize,
    /// How many times each stimulus is played.
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    /// Masking noise level for the block's trials.
    #[serde(default)]
    pub masking_noise: Option<f32>,
}

/// A whole experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Experiment type, part of file names and checkpoint keys.
    pub experiment: String,
    /// Shown before the first block.
    #[serde(default)]
    pub instructions: Vec<Instructions>,
    /// Blocks in order.
    pub blocks: Vec<Block>,
    /// Odd-numbered subjects get the blocks in reverse order.
    #[serde(default)]
    pub counterbalance: bool,
    /// Text of the break screens.
    #[serde(default = "default_break_text")]
    pub break_text: String,
    /// Timing of every trial.
    #[serde(default)]
    pub timing: TrialTiming,
}

/// Why a scenario could not be used.
#[derive(Debug)]
pub enum ScenarioError {
    /// Returned when the scenario file cannot be read.
    Io(io::Error),
    /// Returned when the scenario file is not valid RON for a [Scenario].
    Parse(ron::de::SpannedError),
    /// No trial survived stimulus loading.
    Empty,
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ScenarioError::Io(error) => Cow::from(format!("io error: {}", error)),
            ScenarioError::Parse(error) => Cow::from(format!("scenario error: {}", error)),
            ScenarioError::Empty => Cow::from("scenario has no playable trials"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ScenarioError {}

impl From<io::Error> for ScenarioError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::de::SpannedError> for ScenarioError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::Parse(value)
    }
}

/// Whether `subject` counts as odd for counterbalancing. Numeric ids use
/// their value, anything else the sum of its bytes.
pub fn is_odd_subject(subject: &str) -> bool {
    match subject.trim().parse::<u64>() {
        Ok(n) => n % 2 == 1,
        Err(_) => subject.bytes().map(u64::from).sum::<u64>() % 2 == 1,
    }
}

/// Where the breaks go among `trials` trials: after the returned indices.
fn break_points(trials: usize, breaks: usize) -> Vec<usize> {
    let breaks = breaks.min(trials.saturating_sub(1));
    (1..=breaks).map(|i| i * trials / (breaks + 1)).collect()
}

impl Scenario {
    /// Parses a scenario held in memory. Paths are left as written.
    pub fn parse(text: &str) -> Result<Self, ScenarioError> {
        Ok(ron::from_str(text)?)
    }

    /// Reads a scenario file and resolves its relative paths.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let mut scenario = Self::parse(&fs::read_to_string(path)?)?;
        if let Some(base) = path.parent() {
            scenario.resolve_paths(base);
        }
        Ok(scenario)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        for instructions in self.instructions.iter_mut().chain(
            self.blocks
                .iter_mut()
                .flat_map(|block| block.instructions.iter_mut()),
        ) {
            if let Some(media) = instructions.media.as_mut() {
                resolve(media);
            }
        }
        for stimulus in self.blocks.iter_mut().flat_map(|b| b.stimuli.iter_mut()) {
            resolve(&mut stimulus.file);
        }
    }

    fn instruction_stage(ids: &mut StageIdAllocator, name: &str, spec: &Instructions) -> Stage {
        Stage::new(
            ids,
            name,
            StageKind::InstructionWithMedia {
                text: spec.text.clone(),
                media: spec.media.clone(),
                button_label: spec.button_label.clone(),
                enable_after_ms: spec.enable_after_ms,
            },
        )
    }

    /// The stage sequence for `subject`.
    ///
    /// Every stimulus is loaded through `library` first; ones that fail are
    /// reported and dropped. Block order is reversed for odd subjects when
    /// counterbalancing.
    pub fn build(
        &self,
        subject: &str,
        rng: &mut impl Rng,
        library: &mut StimulusLibrary,
    ) -> Result<StagePlan, ScenarioError> {
        let mut ids = StageIdAllocator::new();
        let mut stages = Vec::new();
        let mut rejected = HashSet::new();

        for spec in &self.instructions {
            stages.push(Self::instruction_stage(&mut ids, "instructions", spec));
        }

        let mut blocks: Vec<&Block> = self.blocks.iter().collect();
        if self.counterbalance && is_odd_subject(subject) {
            info!("subject {subject} gets blocks in reverse order");
            blocks.reverse();
        }

        let mut trial_count = 0;
        for block in blocks {
            let mut playable: Vec<&StimulusRef> = Vec::new();
            for stimulus in &block.stimuli {
                match library.load(&stimulus.file) {
                    Ok(_) => playable.push(stimulus),
                    Err(error) => {
                        if rejected.insert(stimulus.file.clone()) {
                            warn!("dropping stimulus {}: {error}", stimulus.id);
                        }
                    }
                }
            }
            let mut trials: Vec<&StimulusRef> = Vec::with_capacity(playable.len() * block.repeats);
            for _ in 0..block.repeats {
                trials.extend(playable.iter().copied());
            }
            if block.shuffle {
                trials.shuffle(rng);
            }
            if trials.is_empty() {
                warn!("block {} has no playable trials", block.name);
                continue;
            }

            for spec in &block.instructions {
                stages.push(Self::instruction_stage(
                    &mut ids,
                    &format!("{}-instructions", block.name),
                    spec,
                ));
            }

            let options = if block.options.is_empty() {
                let mut seen = HashSet::new();
                playable
                    .iter()
                    .filter(|s| seen.insert(s.id.clone()))
                    .map(|s| s.id.clone())
                    .collect()
            } else {
                block.options.clone()
            };

            let breaks = break_points(trials.len(), block.breaks);
            for (idx, stimulus) in trials.iter().enumerate() {
                if breaks.contains(&idx) {
                    stages.push(Stage::new(
                        &mut ids,
                        format!("{}-break", block.name),
                        StageKind::Break {
                            text: self.break_text.clone(),
                        },
                    ));
                }
                stages.push(Stage::new(
                    &mut ids,
                    format!("{}-{}", block.name, stimulus.id),
                    StageKind::ForcedChoiceTrial {
                        stimulus: (*stimulus).clone(),
                        options: options.clone(),
                        target: stimulus.id.clone(),
                        selection: None,
                        timing: self.timing,
                        masking_noise: block.masking_noise,
                    },
                ));
                trial_count += 1;
            }
        }

        if trial_count == 0 {
            return Err(ScenarioError::Empty);
        }
        info!(
            "scenario {} built: {} stages, {} trials",
            self.experiment,
            stages.len(),
            trial_count
        );
        Ok(StagePlan { stages, ids })
    }
}
