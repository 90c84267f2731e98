//! Terminal front-end for the `vibrotrial` binary.

mod device_selector;
mod error;
mod presenter;

pub use device_selector::device_selector;
pub use error::GuiError;
pub use presenter::{interpret, key_matches, TerminalPresenter};
