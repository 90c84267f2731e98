//! Who is being tested, and under which condition.

use serde::{Deserialize, Serialize};

/// The people and setup behind one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Participant id.
    pub subject: String,
    /// Experimental condition.
    pub condition: String,
    /// Who runs the session.
    pub facilitator: String,
    /// Experiment type, from the scenario.
    pub experiment: String,
}

/// What a checkpoint belongs to. The facilitator is not part of it: a
/// session may be resumed by somebody else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Participant id.
    pub subject: String,
    /// Experimental condition.
    pub condition: String,
    /// Experiment type.
    pub experiment: String,
}

impl SessionInfo {
    /// The checkpoint key for this session.
    pub fn key(&self) -> SessionKey {
        SessionKey {
            subject: self.subject.clone(),
            condition: self.condition.clone(),
            experiment: self.experiment.clone(),
        }
    }
}

/// Keeps file names portable: anything but ASCII alphanumerics, `-` and `.`
/// becomes `-`.
pub fn file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_drops_facilitator() {
        let info = SessionInfo {
            subject: "7".to_owned(),
            condition: "A".to_owned(),
            facilitator: "jo".to_owned(),
            experiment: "words".to_owned(),
        };
        let key = info.key();
        assert_eq!(key.subject, "7");
        assert_eq!(key.experiment, "words");
    }

    #[test]
    fn file_components_are_sanitised() {
        assert_eq!(file_component("p 01/x_y"), "p-01-x-y");
        assert_eq!(file_component("v1.2"), "v1.2");
    }
}
