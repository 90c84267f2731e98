//! Background masking noise played while a trial's stimulus runs.

use log::debug;

/// A background sound source with an explicit lifecycle, owned by whoever
/// runs the session.
pub trait Ambient {
    /// Starts, or changes the level of, the noise. `level` is a linear gain.
    fn start(&mut self, level: f32);

    /// Stops the noise. Stopping something that is not playing is fine.
    fn stop(&mut self);
}

/// Plays nothing. Remembers the last level so callers can be checked.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Silence {
    level: Option<f32>,
}

impl Silence {
    /// The level the noise would be playing at.
    pub fn level(&self) -> Option<f32> {
        self.level
    }
}

impl Ambient for Silence {
    fn start(&mut self, level: f32) {
        debug!("masking noise at {level}");
        self.level = Some(level);
    }

    fn stop(&mut self) {
        if self.level.take().is_some() {
            debug!("masking noise stopped");
        }
    }
}
