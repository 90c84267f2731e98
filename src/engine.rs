//! The trial execution engine: a state machine that walks a queue of stages,
//! drives the device for the ones that carry a stimulus, records each
//! completed stage and checkpoints after every one.
//!
//! ```text
//! Idle -> AwaitingDevice(s) -> Running(s) -> AwaitingInput(s) -> Completing(s) -> ... -> Finished
//!                \________________\_____________> SerialErrorSuspended(s, action)
//! ```
//!
//! Everything happens on the caller's thread. Delays are events in a
//! [Scheduler]; device writes go through a [DeviceLink], normally a
//! [crate::component::DeviceWorker], so a stalled device shows up as a
//! [TransportError::Timeout] instead of a hang.

use log::{debug, error, info, warn};

use std::{
    borrow::Cow,
    collections::VecDeque,
    fmt,
    path::PathBuf,
    time::Duration,
};

use crate::ambient::{Ambient, Silence};
use crate::checkpoint::{CheckpointError, CheckpointStore, SaveOutcome, Snapshot, SNAPSHOT_VERSION};
use crate::data_logger::{EventKind, LogRecord, RecordSink};
use crate::device::DeviceLink;
use crate::library::{StimulusError, StimulusLibrary};
use crate::protocol::Command;
use crate::scheduler::Scheduler;
use crate::session::SessionInfo;
use crate::stage::{Dismiss, Stage, StageId, StageIdAllocator, StageKind, TrialTiming};
use crate::transport::{Endpoint, TransportError};

/// How long [Engine::run] lets the front-end wait for input before checking
/// timers again.
const INPUT_POLL: Duration = Duration::from_millis(50);

/// Sound bites are always loaded into, and played from, slot 0.
const BITE_SLOT: u8 = 0;

/// Where a stage is in its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Not started.
    Idle,
    /// Timers for the stage are pending.
    Running(StageId),
    /// A device command for the stage is in flight.
    AwaitingDevice(StageId),
    /// Waiting for the subject.
    AwaitingInput(StageId),
    /// Being logged and checkpointed.
    Completing(StageId),
    /// A device command failed; waiting for the operator.
    SerialErrorSuspended {
        /// The interrupted stage.
        stage: StageId,
        /// What to redo once the device is back.
        action: DeviceAction,
    },
    /// No stages left.
    Finished,
}

/// The device step that was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    /// The liveness probe at stage start.
    Ping,
    /// Uploading the stage's sound bite.
    Prepare,
    /// Playing the sound bite.
    Trigger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    TriggerStimulus(StageId),
    StimulusDone(StageId),
    OpenInput(StageId),
    DismissTimer(StageId),
}

/// What the subject did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Picked a response option.
    Select(String),
    /// Dismissed a prompt, break or instruction screen.
    Dismiss,
    /// The operator ended the session.
    Quit,
}

/// Completed stages out of all stages known so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Stages completed, including those of earlier runs of the session.
    pub completed: usize,
    /// Completed plus remaining.
    pub total: usize,
}

/// How [Engine::run] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every stage was completed.
    Completed,
    /// The operator quit, or gave up on a failed device.
    Aborted,
}

/// A stage sequence plus the allocator its ids came from.
#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    /// Stages in presentation order.
    pub stages: Vec<Stage>,
    /// Continues numbering after the last stage.
    pub ids: StageIdAllocator,
}

/// The subject-facing side of a session: screens, keys, and the operator's
/// device picker.
pub trait Frontend {
    /// A new stage begins.
    fn show(&mut self, stage: &Stage, progress: Progress);

    /// The stimulus of `stage` just started playing.
    fn stimulus_cue(&mut self, _stage: &Stage) {}

    /// `stage` now accepts a response.
    fn input_opened(&mut self, _stage: &Stage) {}

    /// A device command failed while running `stage`.
    fn device_error(&mut self, stage: &Stage, error: &TransportError);

    /// Waits at most `wait` for a response to `stage`.
    fn collect(&mut self, stage: &Stage, wait: Duration) -> Option<Response>;

    /// Asks the operator for a device to continue with after `failed`
    /// stopped working. `None` gives up.
    fn reselect_device(&mut self, failed: &Endpoint, error: &TransportError) -> Option<Endpoint>;

    /// A message for the operator.
    fn notify(&mut self, _message: &str) {}

    /// The session is over.
    fn finished(&mut self) {}
}

/// Builds a device link for an endpoint the operator picked.
pub type Connector = Box<dyn FnMut(&Endpoint) -> Box<dyn DeviceLink>>;

/// Misuse of the engine's operations.
#[derive(Debug)]
pub enum EngineError {
    /// [Engine::start] was called twice.
    AlreadyStarted,
    /// An operation that needs a running session was called before
    /// [Engine::start].
    NotStarted,
    /// The current stage is not waiting for a response.
    NotAwaitingInput,
    /// [Engine::resume_after_device_recovery] without a device failure.
    NotSuspended,
    /// The response is not one of the stage's options.
    NoSuchOption(String),
    /// The checkpoint to resume from is unusable.
    Checkpoint(CheckpointError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use EngineError as EE;
        let msg = match self {
            EE::AlreadyStarted => Cow::from("engine already started"),
            EE::NotStarted => Cow::from("engine not started"),
            EE::NotAwaitingInput => Cow::from("current stage is not waiting for a response"),
            EE::NotSuspended => Cow::from("engine is not suspended on a device error"),
            EE::NoSuchOption(option) => Cow::from(format!("{option:?} is not a valid response")),
            EE::Checkpoint(error) => Cow::from(format!("cannot resume: {error}")),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for EngineError {}

impl From<CheckpointError> for EngineError {
    fn from(value: CheckpointError) -> Self {
        Self::Checkpoint(value)
    }
}

enum Body {
    Trial {
        file: PathBuf,
        timing: TrialTiming,
        masking_noise: Option<f32>,
    },
    Timer(u64),
    Input,
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Collects the engine's collaborators. Only the session, the front-end and
/// the device are required.
pub struct EngineBuilder<F: Frontend> {
    session: SessionInfo,
    frontend: F,
    device: Box<dyn DeviceLink>,
    logger: Option<Box<dyn RecordSink>>,
    checkpoints: Option<CheckpointStore>,
    ambient: Box<dyn Ambient>,
    library: StimulusLibrary,
    connector: Option<Connector>,
    virtual_clock: bool,
}

impl<F: Frontend> EngineBuilder<F> {
    /// Records every completed stage to `logger`.
    pub fn set_logger(self, logger: impl RecordSink + 'static) -> Self {
        EngineBuilder {
            logger: Some(Box::new(logger)),
            ..self
        }
    }

    /// Checkpoints after every completed stage.
    pub fn set_checkpoints(self, store: CheckpointStore) -> Self {
        EngineBuilder {
            checkpoints: Some(store),
            ..self
        }
    }

    /// Plays masking noise through `ambient`.
    pub fn set_ambient(self, ambient: impl Ambient + 'static) -> Self {
        EngineBuilder {
            ambient: Box::new(ambient),
            ..self
        }
    }

    /// Uses a pre-filled stimulus library.
    pub fn set_library(self, library: StimulusLibrary) -> Self {
        EngineBuilder { library, ..self }
    }

    /// How to reach a device the operator picks after a failure. Without
    /// one, the current link is retried.
    pub fn set_connector(
        self,
        connector: impl FnMut(&Endpoint) -> Box<dyn DeviceLink> + 'static,
    ) -> Self {
        EngineBuilder {
            connector: Some(Box::new(connector)),
            ..self
        }
    }

    /// Timers fire immediately, in order, without waiting.
    pub fn virtual_clock(self) -> Self {
        EngineBuilder {
            virtual_clock: true,
            ..self
        }
    }

    /// An idle engine.
    pub fn build(self) -> Engine<F> {
        Engine {
            session: self.session,
            frontend: self.frontend,
            device: self.device,
            logger: self.logger,
            checkpoints: self.checkpoints,
            ambient: self.ambient,
            library: self.library,
            connector: self.connector,
            scheduler: if self.virtual_clock {
                Scheduler::virtual_clock()
            } else {
                Scheduler::new()
            },
            state: EngineState::Idle,
            queue: VecDeque::new(),
            current: None,
            last_instructions: None,
            ids: StageIdAllocator::new(),
            completed: Vec::new(),
            device_error: None,
        }
    }
}

/// Runs one session.
pub struct Engine<F: Frontend> {
    session: SessionInfo,
    frontend: F,
    device: Box<dyn DeviceLink>,
    logger: Option<Box<dyn RecordSink>>,
    checkpoints: Option<CheckpointStore>,
    ambient: Box<dyn Ambient>,
    library: StimulusLibrary,
    connector: Option<Connector>,
    scheduler: Scheduler<Event>,
    state: EngineState,
    queue: VecDeque<Stage>,
    current: Option<Stage>,
    last_instructions: Option<Stage>,
    ids: StageIdAllocator,
    completed: Vec<StageId>,
    device_error: Option<TransportError>,
}

impl<F: Frontend> Engine<F> {
    /// Start assembling an engine.
    pub fn builder(
        session: SessionInfo,
        frontend: F,
        device: Box<dyn DeviceLink>,
    ) -> EngineBuilder<F> {
        EngineBuilder {
            session,
            frontend,
            device,
            logger: None,
            checkpoints: None,
            ambient: Box::new(Silence::default()),
            library: StimulusLibrary::new(),
            connector: None,
            virtual_clock: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// The stage being run, if any.
    pub fn current_stage(&self) -> Option<&Stage> {
        self.current.as_ref()
    }

    /// Stages after the current one.
    pub fn remaining(&self) -> impl Iterator<Item = &Stage> {
        self.queue.iter()
    }

    /// Ids of completed stages, in completion order.
    pub fn completed(&self) -> &[StageId] {
        &self.completed
    }

    /// The front-end.
    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    /// The front-end, mutably.
    pub fn frontend_mut(&mut self) -> &mut F {
        &mut self.frontend
    }

    /// Completed stages out of all stages.
    pub fn progress(&self) -> Progress {
        let completed = self.completed.len();
        Progress {
            completed,
            total: completed + self.queue.len() + usize::from(self.current.is_some()),
        }
    }

    /// What a checkpoint taken now would hold. The current stage, if it has
    /// not completed, is first in line.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            session: self.session.key(),
            stages: self.current.iter().chain(self.queue.iter()).cloned().collect(),
            last_instructions: self.last_instructions.clone(),
            ids: self.ids.clone(),
            completed: self.completed.clone(),
            log_path: self
                .logger
                .as_ref()
                .and_then(|logger| logger.location())
                .map(|path| path.to_path_buf()),
        }
    }

    /// Loads the queue and shows the first stage.
    ///
    /// With a checkpoint, its stages are restored behind a notice saying so,
    /// preceded by the last instructions the subject saw, if any. Otherwise
    /// `plan` is used, followed by a closing screen.
    pub fn start(&mut self, plan: StagePlan, resume_from: Option<Snapshot>) -> Result<(), EngineError> {
        if self.state != EngineState::Idle {
            return Err(EngineError::AlreadyStarted);
        }

        match resume_from {
            Some(snapshot) => self.restore(snapshot)?,
            None => {
                info!("starting fresh with {} stages", plan.stages.len());
                self.ids = plan.ids;
                self.queue = plan.stages.into();
                let finished = Stage::prompt(
                    &mut self.ids,
                    "finished",
                    "You are finished!\n\nPlease let the facilitator know.",
                    "F4",
                );
                self.queue.push_back(finished);
            }
        }

        for (idx, stage) in self.queue.iter().enumerate() {
            debug!("queue[{idx}] = {} ({})", stage.id, stage.name);
        }

        self.advance();
        Ok(())
    }

    /// Starts `plan` from scratch because the saved state was unusable. A
    /// notice naming `unusable` comes first so the operator sees it.
    pub fn start_over(&mut self, mut plan: StagePlan, unusable: &CheckpointError) -> Result<(), EngineError> {
        warn!("saved state discarded: {unusable}");
        let notice = Stage::new(
            &mut plan.ids,
            "restore-failed",
            StageKind::Prompt {
                text: format!(
                    "The saved session could not be restored, a new one starts now.\n\n{unusable}"
                ),
                dismiss: Dismiss::Button {
                    label: "Continue".to_owned(),
                    enable_after_ms: 5000,
                },
            },
        );
        plan.stages.insert(0, notice);
        self.start(plan, None)
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<(), EngineError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            }
            .into());
        }
        if snapshot.session != self.session.key() {
            return Err(CheckpointError::KeyMismatch {
                found: snapshot.session,
            }
            .into());
        }

        warn!(
            "resuming after {} completed stages, {} left",
            snapshot.completed.len(),
            snapshot.stages.len()
        );
        self.ids = snapshot.ids;
        self.completed = snapshot.completed;
        self.queue = snapshot.stages.into();
        self.last_instructions = snapshot.last_instructions;

        let detail = match &self.last_instructions {
            Some(instructions) => {
                let again = Stage::new(&mut self.ids, instructions.name.clone(), instructions.kind.clone());
                self.queue.push_front(again);
                "The last instructions you saw will be repeated on the next screen."
            }
            None => "When you are ready, the evaluation will resume from where you left off.",
        };
        let state_file = self
            .checkpoints
            .as_ref()
            .map(|store| format!("\n\nState file: {}", store.path().display()))
            .unwrap_or_default();
        let notice = Stage::new(
            &mut self.ids,
            "restore",
            StageKind::Prompt {
                text: format!("Your session has been restored!\n\n{detail}{state_file}"),
                dismiss: Dismiss::Button {
                    label: "Continue".to_owned(),
                    enable_after_ms: 5000,
                },
            },
        );
        self.queue.push_front(notice);
        Ok(())
    }

    /// Moves to the next stage, or to [EngineState::Finished].
    fn advance(&mut self) {
        let Some(stage) = self.queue.pop_front() else {
            info!("all stages done");
            self.current = None;
            self.scheduler.clear();
            self.ambient.stop();
            self.state = EngineState::Finished;
            self.frontend.finished();
            return;
        };

        self.current = Some(stage);
        let progress = self.progress();
        info!("progress at {}/{}", progress.completed + 1, progress.total);
        if let Some(stage) = &self.current {
            info!("current stage = {} ({})", stage.id, stage.name);
            self.frontend.show(stage, progress);
        }

        self.begin_current();
    }

    /// Device work for the current stage, from the top.
    fn begin_current(&mut self) {
        let Some(id) = self.current.as_ref().map(|s| s.id.clone()) else {
            return;
        };

        self.state = EngineState::AwaitingDevice(id);
        if let Err(error) = self.device.send(Command::Ping) {
            self.suspend(DeviceAction::Ping, error);
            return;
        }
        self.start_body(DeviceAction::Prepare);
    }

    fn start_body(&mut self, from: DeviceAction) {
        let Some(stage) = self.current.as_ref() else {
            return;
        };
        let id = stage.id.clone();
        let body = match &stage.kind {
            StageKind::ForcedChoiceTrial {
                stimulus,
                timing,
                masking_noise,
                ..
            } => Body::Trial {
                file: stimulus.file.clone(),
                timing: *timing,
                masking_noise: *masking_noise,
            },
            StageKind::Prompt {
                dismiss: Dismiss::Timer { after_ms },
                ..
            } => Body::Timer(*after_ms),
            _ => Body::Input,
        };

        match body {
            Body::Trial {
                file,
                timing,
                masking_noise,
            } => {
                let loaded = match self.library.load(&file) {
                    Ok(loaded) => loaded,
                    Err(error) => {
                        self.skip_current(error);
                        return;
                    }
                };

                self.state = EngineState::AwaitingDevice(id.clone());
                if let Err(error) = self.device.send(Command::LoadSoundBite(loaded.bite.clone())) {
                    self.suspend(DeviceAction::Prepare, error);
                    return;
                }
                if let Some(level) = masking_noise {
                    self.ambient.start(level);
                }

                self.state = EngineState::Running(id.clone());
                let delay = match from {
                    DeviceAction::Trigger => Duration::ZERO,
                    _ => ms(timing.before_ms),
                };
                self.scheduler.schedule(delay, Event::TriggerStimulus(id));
            }
            Body::Timer(after_ms) => {
                self.open_input();
                self.scheduler.schedule(ms(after_ms), Event::DismissTimer(id));
            }
            Body::Input => self.open_input(),
        }
    }

    fn open_input(&mut self) {
        self.ambient.stop();
        if let Some(stage) = &self.current {
            self.state = EngineState::AwaitingInput(stage.id.clone());
            self.frontend.input_opened(stage);
        }
    }

    fn current_timing(&self) -> TrialTiming {
        match self.current.as_ref().map(|s| &s.kind) {
            Some(StageKind::ForcedChoiceTrial { timing, .. }) => *timing,
            _ => TrialTiming::zero(),
        }
    }

    fn is_running(&self, id: &StageId) -> bool {
        matches!(&self.state, EngineState::Running(s) if s == id)
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::TriggerStimulus(id) if self.is_running(&id) => {
                if let Err(error) = self.device.send(Command::PlaySoundBite(BITE_SLOT)) {
                    self.suspend(DeviceAction::Trigger, error);
                    return;
                }
                if let Some(stage) = &self.current {
                    self.frontend.stimulus_cue(stage);
                }
                let window = ms(self.current_timing().stimulus_ms);
                self.scheduler.schedule(window, Event::StimulusDone(id));
            }
            Event::StimulusDone(id) if self.is_running(&id) => {
                let after = ms(self.current_timing().after_ms);
                self.scheduler.schedule(after, Event::OpenInput(id));
            }
            Event::OpenInput(id) if self.is_running(&id) => self.open_input(),
            Event::DismissTimer(id)
                if matches!(&self.state, EngineState::AwaitingInput(s) if *s == id) =>
            {
                if let Err(error) = self.complete_current_stage(None) {
                    warn!("timed dismissal of {id} failed: {error}");
                }
            }
            stale => debug!("ignoring {stale:?} in state {:?}", self.state),
        }
    }

    fn suspend(&mut self, action: DeviceAction, error: TransportError) {
        self.scheduler.clear();
        self.ambient.stop();

        let Some(stage) = &self.current else {
            return;
        };
        error!(
            "device error during {action:?} of {}: {error}",
            stage.id
        );
        self.frontend.device_error(stage, &error);
        self.state = EngineState::SerialErrorSuspended {
            stage: stage.id.clone(),
            action,
        };
        self.device_error = Some(error);
    }

    /// The stimulus of the current stage cannot be played: note it and move
    /// on.
    fn skip_current(&mut self, error: StimulusError) {
        warn!("skipping stage: {error}");
        self.frontend
            .notify(&format!("Stimulus could not be loaded and was skipped: {error}"));
        if let Some(stage) = self.current.take() {
            self.retire(stage, EventKind::StimulusError);
        }
        self.advance();
    }

    /// Records the subject's response to the current stage, logs it,
    /// checkpoints, and moves on.
    ///
    /// Trials need one of their options; every other stage takes `None`.
    pub fn complete_current_stage(&mut self, selection: Option<String>) -> Result<(), EngineError> {
        let Some(stage) = self.current.as_mut() else {
            return Err(match self.state {
                EngineState::Idle => EngineError::NotStarted,
                _ => EngineError::NotAwaitingInput,
            });
        };
        if !matches!(&self.state, EngineState::AwaitingInput(id) if *id == stage.id) {
            return Err(EngineError::NotAwaitingInput);
        }

        match (&mut stage.kind, selection) {
            (
                StageKind::ForcedChoiceTrial {
                    options,
                    selection: recorded,
                    ..
                },
                Some(choice),
            ) => {
                if !options.contains(&choice) {
                    return Err(EngineError::NoSuchOption(choice));
                }
                *recorded = Some(choice);
            }
            (StageKind::ForcedChoiceTrial { .. }, None) => {
                return Err(EngineError::NoSuchOption(String::new()))
            }
            (_, Some(choice)) => return Err(EngineError::NoSuchOption(choice)),
            (_, None) => {}
        }

        self.state = EngineState::Completing(stage.id.clone());
        self.scheduler.clear();
        if let Some(stage) = self.current.take() {
            self.retire(stage, EventKind::Finished);
        }
        self.advance();
        Ok(())
    }

    fn retire(&mut self, stage: Stage, event: EventKind) {
        if stage.is_instructional() {
            self.last_instructions = Some(stage.clone());
        }

        if let Some(logger) = self.logger.as_mut() {
            if let Err(error) = logger.write_record(&LogRecord::for_stage(&stage, event)) {
                error!("record for {} lost: {error}", stage.id);
                self.frontend
                    .notify(&format!("Could not write the data log: {error}"));
            }
        }

        info!("{} {}", stage.id, event.as_str());
        self.completed.push(stage.id);
        self.save_checkpoint();
    }

    fn save_checkpoint(&mut self) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        match store.save(&self.snapshot()) {
            Ok(SaveOutcome::Saved) => {}
            Ok(SaveOutcome::Deleted) => debug!("nothing left worth resuming"),
            Err(error) => {
                error!("checkpoint not saved: {error}");
                self.frontend
                    .notify(&format!("Could not save progress: {error}"));
            }
        }
    }

    /// Swaps in a new device link. The old one is dropped.
    pub fn replace_device(&mut self, device: Box<dyn DeviceLink>) {
        info!(
            "device {} replaced by {}",
            self.device.endpoint(),
            device.endpoint()
        );
        self.device = device;
    }

    /// Redoes the interrupted device action of the suspended stage. The stage
    /// is not shown again and nothing is logged.
    ///
    /// A failed ping reruns the whole stage start. A failed upload is
    /// retried. A failed trigger uploads the sound bite again before playing
    /// it, since the device may have been swapped or reset.
    pub fn resume_after_device_recovery(&mut self) -> Result<(), EngineError> {
        let EngineState::SerialErrorSuspended { action, stage } = &self.state else {
            return Err(EngineError::NotSuspended);
        };
        info!("resuming {stage} at {action:?}");

        let action = *action;
        self.device_error = None;
        match action {
            DeviceAction::Ping => self.begin_current(),
            DeviceAction::Prepare => self.start_body(DeviceAction::Prepare),
            DeviceAction::Trigger => self.start_body(DeviceAction::Trigger),
        }
        Ok(())
    }

    /// Fires timers until the engine waits on the subject, the operator, or
    /// nothing. With a real clock this sleeps through the delays.
    pub fn pump(&mut self) {
        while matches!(
            self.state,
            EngineState::Running(_) | EngineState::AwaitingInput(_)
        ) {
            match self.scheduler.pop_next() {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    /// Runs the session to the end through the front-end.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        loop {
            match &self.state {
                EngineState::Idle => return Err(EngineError::NotStarted),
                EngineState::Finished => return Ok(RunOutcome::Completed),
                EngineState::SerialErrorSuspended { .. } => {
                    let error = self.device_error.take().unwrap_or(TransportError::NotConnected);
                    let failed = self.device.endpoint();
                    let Some(endpoint) = self.frontend.reselect_device(&failed, &error) else {
                        warn!("operator gave up after device error: {error}");
                        return Ok(RunOutcome::Aborted);
                    };
                    if let Some(connector) = self.connector.as_mut() {
                        let device = connector(&endpoint);
                        self.replace_device(device);
                    }
                    self.resume_after_device_recovery()?;
                }
                EngineState::AwaitingInput(_) => {
                    if let Some(event) = self.scheduler.pop_due() {
                        self.handle_event(event);
                        continue;
                    }
                    let wait = self
                        .scheduler
                        .next_due()
                        .map_or(INPUT_POLL, |due| due.min(INPUT_POLL));
                    let Some(stage) = &self.current else {
                        continue;
                    };
                    match self.frontend.collect(stage, wait) {
                        Some(Response::Quit) => {
                            warn!("session aborted by operator at {}", stage.id);
                            self.scheduler.clear();
                            self.ambient.stop();
                            return Ok(RunOutcome::Aborted);
                        }
                        Some(Response::Select(choice)) => self.respond(Some(choice)),
                        Some(Response::Dismiss) => self.respond(None),
                        None if self.scheduler.is_virtual() => {
                            if let Some(event) = self.scheduler.pop_next() {
                                self.handle_event(event);
                            }
                        }
                        None => {}
                    }
                }
                EngineState::Running(_)
                | EngineState::AwaitingDevice(_)
                | EngineState::Completing(_) => match self.scheduler.pop_next() {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("no pending timers in state {:?}", self.state);
                        return Ok(RunOutcome::Aborted);
                    }
                },
            }
        }
    }

    fn respond(&mut self, selection: Option<String>) {
        if let Err(error) = self.complete_current_stage(selection) {
            debug!("response rejected: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_logger::LogWriteError;
    use crate::device::{Device, DeviceProfile};
    use crate::protocol::Opcode;
    use crate::stage::StimulusRef;
    use crate::transport::mock::MockTransport;
    use crate::vtt_format::{Sample, Stimulus};

    #[derive(Default)]
    struct Screen {
        shown: Vec<String>,
        opened: Vec<String>,
        cues: usize,
        errors: usize,
        notices: Vec<String>,
        finished: bool,
    }

    impl Frontend for Screen {
        fn show(&mut self, stage: &Stage, _progress: Progress) {
            self.shown.push(stage.name.clone());
        }

        fn stimulus_cue(&mut self, _stage: &Stage) {
            self.cues += 1;
        }

        fn input_opened(&mut self, stage: &Stage) {
            self.opened.push(stage.name.clone());
        }

        fn device_error(&mut self, _stage: &Stage, _error: &TransportError) {
            self.errors += 1;
        }

        fn collect(&mut self, _stage: &Stage, _wait: Duration) -> Option<Response> {
            None
        }

        fn reselect_device(&mut self, _failed: &Endpoint, _error: &TransportError) -> Option<Endpoint> {
            None
        }

        fn finished(&mut self) {
            self.finished = true;
        }

        fn notify(&mut self, message: &str) {
            self.notices.push(message.to_owned());
        }
    }

    fn session() -> SessionInfo {
        SessionInfo {
            subject: "1".to_owned(),
            condition: "A".to_owned(),
            facilitator: "f".to_owned(),
            experiment: "unit".to_owned(),
        }
    }

    fn library() -> StimulusLibrary {
        let mut library = StimulusLibrary::new();
        let stimulus = Stimulus::builder()
            .set_period(10)
            .add_samples([Sample::default(); 4])
            .build()
            .unwrap();
        library.insert("a.vtt", stimulus).unwrap();
        library
    }

    fn plan() -> StagePlan {
        let mut ids = StageIdAllocator::new();
        let stages = vec![
            Stage::prompt(&mut ids, "welcome", "Hello", "space"),
            Stage::trial(
                &mut ids,
                StimulusRef {
                    id: "a".to_owned(),
                    file: PathBuf::from("a.vtt"),
                },
                vec!["a".to_owned(), "b".to_owned()],
                "a",
            ),
        ];
        StagePlan { stages, ids }
    }

    fn engine(mock: &MockTransport) -> Engine<Screen> {
        let device = Device::new(Box::new(mock.clone()), DeviceProfile::default());
        Engine::builder(session(), Screen::default(), Box::new(device))
            .set_library(library())
            .virtual_clock()
            .build()
    }

    #[test]
    fn walks_a_plan_to_the_end() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        engine.start(plan(), None).unwrap();

        assert_eq!(engine.progress(), Progress { completed: 0, total: 3 });
        assert!(matches!(engine.state(), EngineState::AwaitingInput(_)));
        engine.complete_current_stage(None).unwrap();

        assert!(matches!(engine.state(), EngineState::Running(_)));
        assert!(matches!(
            engine.complete_current_stage(Some("a".to_owned())),
            Err(EngineError::NotAwaitingInput)
        ));
        engine.pump();
        assert!(matches!(engine.state(), EngineState::AwaitingInput(_)));
        assert_eq!(engine.frontend().cues, 1);

        engine.complete_current_stage(Some("b".to_owned())).unwrap();
        assert_eq!(engine.current_stage().map(|s| s.name.as_str()), Some("finished"));
        engine.complete_current_stage(None).unwrap();

        assert_eq!(engine.state(), &EngineState::Finished);
        assert!(engine.frontend().finished);
        assert_eq!(engine.completed().len(), 3);
        assert_eq!(
            engine.frontend().shown,
            vec!["welcome", "trial-a", "finished"]
        );

        let opcodes: Vec<Opcode> = mock.commands().iter().map(Command::opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::Ping,
                Opcode::Ping,
                Opcode::LoadSoundBite,
                Opcode::PlaySoundBite,
                Opcode::Ping
            ]
        );
    }

    #[test]
    fn responses_are_validated() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        assert!(matches!(
            engine.complete_current_stage(None),
            Err(EngineError::NotStarted)
        ));
        engine.start(plan(), None).unwrap();

        assert!(matches!(
            engine.complete_current_stage(Some("a".to_owned())),
            Err(EngineError::NoSuchOption(_))
        ));
        engine.complete_current_stage(None).unwrap();
        engine.pump();
        assert!(matches!(
            engine.complete_current_stage(Some("c".to_owned())),
            Err(EngineError::NoSuchOption(_))
        ));
        assert!(matches!(
            engine.complete_current_stage(None),
            Err(EngineError::NoSuchOption(_))
        ));
        assert_eq!(engine.completed().len(), 1);
        assert!(matches!(engine.start(plan(), None), Err(EngineError::AlreadyStarted)));
    }

    #[test]
    fn failed_trigger_suspends_and_resumes_with_reupload() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        engine.start(plan(), None).unwrap();
        engine.complete_current_stage(None).unwrap();

        mock.fail_opcode(Opcode::PlaySoundBite, 1);
        engine.pump();
        assert!(matches!(
            engine.state(),
            EngineState::SerialErrorSuspended {
                action: DeviceAction::Trigger,
                ..
            }
        ));
        assert_eq!(engine.frontend().errors, 1);
        assert_eq!(engine.completed().len(), 1);

        mock.clear();
        engine.resume_after_device_recovery().unwrap();
        engine.pump();
        assert!(matches!(engine.state(), EngineState::AwaitingInput(_)));
        let opcodes: Vec<Opcode> = mock.commands().iter().map(Command::opcode).collect();
        assert_eq!(opcodes, vec![Opcode::LoadSoundBite, Opcode::PlaySoundBite]);
        assert_eq!(engine.frontend().shown.len(), 2);
        assert!(matches!(
            engine.resume_after_device_recovery(),
            Err(EngineError::NotSuspended)
        ));
    }

    #[test]
    fn undecodable_stimulus_is_skipped() {
        let mock = MockTransport::new();
        let device = Device::new(Box::new(mock.clone()), DeviceProfile::default());
        let mut engine = Engine::builder(session(), Screen::default(), Box::new(device))
            .virtual_clock()
            .build();

        let mut plan = plan();
        plan.stages.remove(0);
        if let StageKind::ForcedChoiceTrial { stimulus, .. } = &mut plan.stages[0].kind {
            stimulus.file = PathBuf::from("/nonexistent/missing.vtt");
        }
        engine.start(plan, None).unwrap();

        assert_eq!(engine.current_stage().map(|s| s.name.as_str()), Some("finished"));
        assert_eq!(engine.completed().len(), 1);
    }

    #[test]
    fn timer_prompts_dismiss_themselves() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        let mut ids = StageIdAllocator::new();
        let stages = vec![Stage::new(
            &mut ids,
            "pause",
            StageKind::Prompt {
                text: "Wait".to_owned(),
                dismiss: Dismiss::Timer { after_ms: 2000 },
            },
        )];
        engine.start(StagePlan { stages, ids }, None).unwrap();
        engine.pump();

        assert_eq!(engine.current_stage().map(|s| s.name.as_str()), Some("finished"));
        assert_eq!(engine.completed().len(), 1);
    }

    #[derive(Clone, Default)]
    struct Recorder(std::rc::Rc<std::cell::RefCell<Vec<Option<f32>>>>);

    impl Ambient for Recorder {
        fn start(&mut self, level: f32) {
            self.0.borrow_mut().push(Some(level));
        }

        fn stop(&mut self) {
            self.0.borrow_mut().push(None);
        }
    }

    #[test]
    fn masking_noise_plays_until_input_opens() {
        let mock = MockTransport::new();
        let recorder = Recorder::default();
        let device = Device::new(Box::new(mock.clone()), DeviceProfile::default());
        let mut engine = Engine::builder(session(), Screen::default(), Box::new(device))
            .set_library(library())
            .set_ambient(recorder.clone())
            .virtual_clock()
            .build();

        let mut plan = plan();
        plan.stages.remove(0);
        if let StageKind::ForcedChoiceTrial { masking_noise, .. } = &mut plan.stages[0].kind {
            *masking_noise = Some(0.25);
        }
        engine.start(plan, None).unwrap();
        assert_eq!(recorder.0.borrow().as_slice(), &[Some(0.25)]);

        engine.pump();
        assert_eq!(recorder.0.borrow().as_slice(), &[Some(0.25), None]);
    }

    #[test]
    fn snapshot_puts_the_current_stage_first() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        engine.start(plan(), None).unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.stages.len(), 3);
        assert_eq!(snapshot.stages[0].name, "welcome");
        assert!(snapshot.completed.is_empty());
    }

    struct BrokenSink;

    impl RecordSink for BrokenSink {
        fn write_record(&mut self, _record: &LogRecord) -> Result<(), LogWriteError> {
            Err(LogWriteError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    #[test]
    fn failed_ping_and_lost_records_do_not_stop_the_session() {
        let mock = MockTransport::new();
        let device = Device::new(Box::new(mock.clone()), DeviceProfile::default());
        let mut engine = Engine::builder(session(), Screen::default(), Box::new(device))
            .set_library(library())
            .set_logger(BrokenSink)
            .virtual_clock()
            .build();
        engine.start(plan(), None).unwrap();

        mock.fail_opcode(Opcode::Ping, 1);
        engine.complete_current_stage(None).unwrap();
        assert_eq!(engine.completed().len(), 1);
        assert!(matches!(
            engine.state(),
            EngineState::SerialErrorSuspended {
                action: DeviceAction::Ping,
                ..
            }
        ));

        mock.clear();
        engine.resume_after_device_recovery().unwrap();
        let opcodes: Vec<Opcode> = mock.commands().iter().map(Command::opcode).collect();
        assert_eq!(opcodes, vec![Opcode::Ping, Opcode::LoadSoundBite]);

        engine.pump();
        engine.complete_current_stage(Some("a".to_owned())).unwrap();
        assert_eq!(engine.completed().len(), 2);
        assert_eq!(
            engine.frontend().shown,
            vec!["welcome", "trial-a", "finished"]
        );
        assert_eq!(engine.frontend().notices.len(), 2);
        assert!(engine.frontend().notices[0].contains("disk full"));
    }

    #[test]
    fn snapshots_of_other_versions_or_sessions_are_refused() {
        let mock = MockTransport::new();
        let mut first = engine(&mock);
        first.start(plan(), None).unwrap();
        first.complete_current_stage(None).unwrap();
        let snapshot = first.snapshot();

        let mut stale = snapshot.clone();
        stale.version = SNAPSHOT_VERSION + 1;
        let mut engine = engine(&mock);
        assert!(matches!(
            engine.start(plan(), Some(stale)),
            Err(EngineError::Checkpoint(CheckpointError::VersionMismatch { .. }))
        ));
        assert_eq!(engine.state(), &EngineState::Idle);

        let mut foreign = snapshot;
        foreign.session = SessionInfo {
            subject: "2".to_owned(),
            ..session()
        }
        .key();
        assert!(matches!(
            engine.start(plan(), Some(foreign)),
            Err(EngineError::Checkpoint(CheckpointError::KeyMismatch { .. }))
        ));
        assert!(engine.frontend().shown.is_empty());
    }

    #[test]
    fn starting_over_explains_the_discarded_state_first() {
        let mock = MockTransport::new();
        let mut engine = engine(&mock);
        let unusable = CheckpointError::VersionMismatch {
            found: 0,
            expected: SNAPSHOT_VERSION,
        };
        engine.start_over(plan(), &unusable).unwrap();

        let notice = engine.current_stage().unwrap();
        assert_eq!(notice.name, "restore-failed");
        assert!(notice.text().unwrap().contains("could not be restored"));

        engine.complete_current_stage(None).unwrap();
        assert_eq!(engine.current_stage().map(|s| s.name.as_str()), Some("welcome"));
        assert_eq!(engine.frontend().shown, vec!["restore-failed", "welcome"]);
    }
}
