//! VibroTrial runs perceptual experiments on a wearable tactile array. A
//! subject feels speech rendered as vibration, one word at a time, and picks
//! what they felt from a set of options.
//!
//! The host side, which is this crate, is built from three layers:
//!
//! - The stimulus container ([vtt_format]): `.vtt` files holding a sampled
//!   phone, pitch and intensity track plus its transcriptions.
//! - The device layer ([protocol], [transport], [device], [component]):
//!   command framing, byte streams to serial or TCP endpoints, calibration,
//!   and a worker thread so a stalled device cannot freeze a session.
//! - The trial engine ([engine]): walks a sequence of [stage::Stage]s built
//!   from a [scenario], logs every completed stage ([data_logger]) and
//!   checkpoints after each one ([checkpoint]) so a crashed session resumes
//!   where it stopped.
//!
//! The `vibrotrial` binary runs a session in the terminal; `vttinfo`
//! inspects, builds and plays stimulus containers.

#![warn(missing_docs)]
pub mod ambient;
pub mod args;
pub mod checkpoint;
pub mod component;
pub mod data_logger;
pub mod device;
pub mod engine;
pub mod execution_log;
pub mod gui;
pub mod library;
pub mod protocol;
pub mod scenario;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod simulate;
pub mod stage;
pub mod transport;
pub mod vtt_format;
