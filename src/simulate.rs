//! A stand-in subject for dry runs: answers every trial with no delay.

use log::{info, warn};
use rand::{seq::SliceRandom, Rng};

use std::time::Duration;

use crate::engine::{Frontend, Progress, Response};
use crate::stage::{Stage, StageKind};
use crate::transport::{Endpoint, TransportError};

/// Picks the target with probability `accuracy`, otherwise any option.
#[derive(Debug)]
pub struct SimulatedSubject<R: Rng> {
    rng: R,
    accuracy: f64,
}

impl<R: Rng> SimulatedSubject<R> {
    /// `accuracy` is clamped into `0.0..=1.0`.
    pub fn new(rng: R, accuracy: f64) -> Self {
        SimulatedSubject {
            rng,
            accuracy: accuracy.clamp(0.0, 1.0),
        }
    }

    /// The answer to `stage`, or `None` if the stage is not a trial.
    pub fn answer(&mut self, stage: &Stage) -> Option<String> {
        let StageKind::ForcedChoiceTrial {
            options, target, ..
        } = &stage.kind
        else {
            return None;
        };

        if self.rng.gen_bool(self.accuracy) {
            Some(target.clone())
        } else {
            options.choose(&mut self.rng).cloned()
        }
    }
}

/// Drives a whole session with a [SimulatedSubject] and no screen.
#[derive(Debug)]
pub struct SimulatedFrontend<R: Rng> {
    subject: SimulatedSubject<R>,
    answered: usize,
    correct: usize,
    device_errors: usize,
}

impl<R: Rng> SimulatedFrontend<R> {
    /// Answers trials through `subject`.
    pub fn new(subject: SimulatedSubject<R>) -> Self {
        SimulatedFrontend {
            subject,
            answered: 0,
            correct: 0,
            device_errors: 0,
        }
    }

    /// Trials answered so far.
    pub fn answered(&self) -> usize {
        self.answered
    }

    /// Trials answered with the target.
    pub fn correct(&self) -> usize {
        self.correct
    }

    /// Device failures seen.
    pub fn device_errors(&self) -> usize {
        self.device_errors
    }
}

impl<R: Rng> Frontend for SimulatedFrontend<R> {
    fn show(&mut self, stage: &Stage, progress: Progress) {
        info!(
            "[{}/{}] {}",
            progress.completed + 1,
            progress.total,
            stage.name
        );
    }

    fn device_error(&mut self, stage: &Stage, error: &TransportError) {
        self.device_errors += 1;
        warn!("device error in {}: {error}", stage.id);
    }

    fn collect(&mut self, stage: &Stage, _wait: Duration) -> Option<Response> {
        match self.subject.answer(stage) {
            Some(answer) => {
                self.answered += 1;
                if let StageKind::ForcedChoiceTrial { target, .. } = &stage.kind {
                    if *target == answer {
                        self.correct += 1;
                    }
                }
                Some(Response::Select(answer))
            }
            None => Some(Response::Dismiss),
        }
    }

    fn reselect_device(&mut self, _failed: &Endpoint, _error: &TransportError) -> Option<Endpoint> {
        None
    }

    fn finished(&mut self) {
        info!("simulated subject answered {}/{} correctly", self.correct, self.answered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageIdAllocator, StimulusRef};
    use rand::{rngs::StdRng, SeedableRng};
    use std::path::PathBuf;

    fn trial(ids: &mut StageIdAllocator) -> Stage {
        Stage::trial(
            ids,
            StimulusRef {
                id: "x".to_owned(),
                file: PathBuf::from("x.vtt"),
            },
            vec!["x".to_owned(), "y".to_owned(), "z".to_owned()],
            "y",
        )
    }

    #[test]
    fn perfect_subject_always_hits_target() {
        let mut ids = StageIdAllocator::new();
        let stage = trial(&mut ids);
        let mut subject = SimulatedSubject::new(StdRng::seed_from_u64(1), 1.0);
        for _ in 0..20 {
            assert_eq!(subject.answer(&stage).as_deref(), Some("y"));
        }
    }

    #[test]
    fn guessing_subject_stays_within_options() {
        let mut ids = StageIdAllocator::new();
        let stage = trial(&mut ids);
        let mut subject = SimulatedSubject::new(StdRng::seed_from_u64(7), 0.0);
        for _ in 0..20 {
            let answer = subject.answer(&stage).unwrap();
            assert!(stage.options().contains(&answer));
        }

        let prompt = Stage::prompt(&mut ids, "p", "text", "F4");
        assert_eq!(subject.answer(&prompt), None);
    }
}
