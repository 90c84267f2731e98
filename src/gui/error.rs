use std::{error::Error, fmt::Display};

/// Failures of the terminal front-end.
#[derive(Debug)]
pub enum GuiError {
    /// The terminal could not be set up, drawn to or read from.
    IOError(std::io::Error),
}

impl Display for GuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuiError::IOError(error) => write!(f, "terminal error: {error}"),
        }
    }
}

impl Error for GuiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GuiError::IOError(error) => Some(error),
        }
    }
}

impl From<std::io::Error> for GuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}
