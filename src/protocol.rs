//! Framing for the byte-stream protocol spoken by the tactile actuator array.
//!
//! Every command is a header byte ([HEADER]) followed by an opcode byte and an
//! opcode-specific payload. The framing knows nothing about the transport, so
//! the same bytes go out over a serial port or a TCP socket.

use nom::{
    branch::alt,
    bytes::complete::tag,
    combinator::{all_consuming, map, value},
    multi::{length_count, many0},
    number::complete::{le_u16, le_u8},
    sequence::{preceded, tuple},
    Finish, IResult,
};

use std::{borrow::Cow, fmt};

use crate::vtt_format::{sample, Sample, Stimulus};

/// Byte that precedes every opcode.
pub const HEADER: u8 = 0x00;

/// The most samples the firmware can hold in one sound bite.
pub const MAX_SOUND_BITE_SAMPLES: usize = 14000;

/// Opcodes understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Run the actuator self-calibration.
    Calibrate = 0x01,
    /// Enable a single actuator.
    Enable = 0x02,
    /// Disable a single actuator.
    Disable = 0x03,
    /// Drive one cell with a pitch and an intensity.
    CombinedSignal = 0x06,
    /// Silence every actuator.
    Stop = 0x07,
    /// Upload a sound bite into device memory.
    LoadSoundBite = 0x08,
    /// Play a previously loaded sound bite.
    PlaySoundBite = 0x09,
    /// Set the resting intensity of one actuator.
    SetActuatorIntensity = 0x0A,
    /// Fire one short pulse on one actuator.
    PulseActuator = 0x0B,
    /// Liveness probe; carries no payload.
    Ping = 0x0C,
}

/// A sample sequence, ready to be uploaded with [Command::LoadSoundBite].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundBite {
    period: u8,
    samples: Vec<Sample>,
}

/// Returned when a command cannot be framed, or a frame cannot be read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The sound bite holds more samples than the device can store.
    SoundBiteTooLong {
        /// Number of samples offered.
        samples: usize,
    },

    /// The sample period does not fit in the one-byte period field, or is 0.
    PeriodOutOfRange(u32),

    /// The byte stream is not a sequence of well-formed frames.
    Malformed {
        /// Offset of the first byte that could not be parsed.
        offset: usize,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            FrameError::SoundBiteTooLong { samples } => Cow::from(format!(
                "sound bite has {samples} samples, device holds at most {MAX_SOUND_BITE_SAMPLES}"
            )),
            FrameError::PeriodOutOfRange(period) => {
                Cow::from(format!("sample period {period} ms does not fit in a frame"))
            }
            FrameError::Malformed { offset } => {
                Cow::from(format!("malformed frame at byte {offset}"))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for FrameError {}

impl SoundBite {
    /// Checks that `samples` fit in device memory and that `period` fits in
    /// its frame field.
    pub fn new(period: u32, samples: Vec<Sample>) -> Result<Self, FrameError> {
        let period = match u8::try_from(period) {
            Ok(p) if p > 0 => p,
            _ => return Err(FrameError::PeriodOutOfRange(period)),
        };
        if samples.len() > MAX_SOUND_BITE_SAMPLES {
            return Err(FrameError::SoundBiteTooLong {
                samples: samples.len(),
            });
        }
        Ok(SoundBite { period, samples })
    }

    /// The sound bite that plays `stimulus`.
    pub fn from_stimulus(stimulus: &Stimulus) -> Result<Self, FrameError> {
        Self::new(stimulus.sample_period(), stimulus.samples().to_vec())
    }

    /// Milliseconds between samples.
    pub fn period(&self) -> u8 {
        self.period
    }

    /// The samples, in playback order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// A copy with every intensity passed through `f`.
    pub fn map_intensity(&self, f: impl Fn(u8) -> u8) -> Self {
        SoundBite {
            period: self.period,
            samples: self
                .samples
                .iter()
                .map(|s| Sample {
                    intensity: f(s.intensity),
                    ..*s
                })
                .collect(),
        }
    }
}

/// One device command with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// See [Opcode::Calibrate].
    Calibrate,
    /// See [Opcode::Enable].
    Enable(u8),
    /// See [Opcode::Disable].
    Disable(u8),
    /// See [Opcode::CombinedSignal].
    CombinedSignal {
        /// Actuator cell.
        cell: u8,
        /// Pitch byte.
        pitch: u8,
        /// Intensity byte.
        intensity: u8,
    },
    /// See [Opcode::Stop].
    Stop,
    /// See [Opcode::LoadSoundBite].
    LoadSoundBite(SoundBite),
    /// See [Opcode::PlaySoundBite]; the payload is the bite id.
    PlaySoundBite(u8),
    /// See [Opcode::SetActuatorIntensity].
    SetActuatorIntensity {
        /// Actuator cell.
        cell: u8,
        /// Intensity byte.
        intensity: u8,
    },
    /// See [Opcode::PulseActuator].
    PulseActuator(u8),
    /// See [Opcode::Ping].
    Ping,
}

impl Command {
    /// The opcode this command is framed with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Calibrate => Opcode::Calibrate,
            Command::Enable(_) => Opcode::Enable,
            Command::Disable(_) => Opcode::Disable,
            Command::CombinedSignal { .. } => Opcode::CombinedSignal,
            Command::Stop => Opcode::Stop,
            Command::LoadSoundBite(_) => Opcode::LoadSoundBite,
            Command::PlaySoundBite(_) => Opcode::PlaySoundBite,
            Command::SetActuatorIntensity { .. } => Opcode::SetActuatorIntensity,
            Command::PulseActuator(_) => Opcode::PulseActuator,
            Command::Ping => Opcode::Ping,
        }
    }

    /// Frames the command, header byte first.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![HEADER, self.opcode() as u8];

        match self {
            Command::Calibrate | Command::Stop | Command::Ping => {}
            Command::Enable(cell) | Command::Disable(cell) | Command::PulseActuator(cell) => {
                frame.push(*cell)
            }
            Command::PlaySoundBite(id) => frame.push(*id),
            Command::CombinedSignal {
                cell,
                pitch,
                intensity,
            } => frame.extend_from_slice(&[*cell, *pitch, *intensity]),
            Command::SetActuatorIntensity { cell, intensity } => {
                frame.extend_from_slice(&[*cell, *intensity])
            }
            Command::LoadSoundBite(bite) => {
                frame.reserve(3 + 3 * bite.samples.len());
                frame.push(bite.period);
                // SoundBite::new caps the count well below u16::MAX
                frame.extend_from_slice(&(bite.samples.len() as u16).to_le_bytes());
                frame.extend(
                    bite.samples
                        .iter()
                        .flat_map(|s| [s.phone, s.pitch, s.intensity]),
                );
            }
        }

        frame
    }
}

fn op(code: Opcode) -> [u8; 1] {
    [code as u8]
}

fn payload(input: &[u8]) -> IResult<&[u8], Command> {
    alt((
        value(Command::Calibrate, tag(&op(Opcode::Calibrate)[..])),
        map(preceded(tag(&op(Opcode::Enable)[..]), le_u8), Command::Enable),
        map(preceded(tag(&op(Opcode::Disable)[..]), le_u8), Command::Disable),
        map(
            preceded(
                tag(&op(Opcode::CombinedSignal)[..]),
                tuple((le_u8, le_u8, le_u8)),
            ),
            |(cell, pitch, intensity)| Command::CombinedSignal {
                cell,
                pitch,
                intensity,
            },
        ),
        value(Command::Stop, tag(&op(Opcode::Stop)[..])),
        map(
            preceded(
                tag(&op(Opcode::LoadSoundBite)[..]),
                tuple((le_u8, length_count(le_u16, sample))),
            ),
            |(period, samples)| Command::LoadSoundBite(SoundBite { period, samples }),
        ),
        map(
            preceded(tag(&op(Opcode::PlaySoundBite)[..]), le_u8),
            Command::PlaySoundBite,
        ),
        map(
            preceded(
                tag(&op(Opcode::SetActuatorIntensity)[..]),
                tuple((le_u8, le_u8)),
            ),
            |(cell, intensity)| Command::SetActuatorIntensity { cell, intensity },
        ),
        map(
            preceded(tag(&op(Opcode::PulseActuator)[..]), le_u8),
            Command::PulseActuator,
        ),
        value(Command::Ping, tag(&op(Opcode::Ping)[..])),
    ))(input)
}

fn frame(input: &[u8]) -> IResult<&[u8], Command> {
    preceded(tag(&[HEADER][..]), payload)(input)
}

/// Reads one frame from the front of `bytes`, returning the command and the
/// unread remainder.
pub fn decode_frame(bytes: &[u8]) -> Result<(Command, &[u8]), FrameError> {
    match frame(bytes).finish() {
        Ok((rest, command)) => Ok((command, rest)),
        Err(e) => Err(FrameError::Malformed {
            offset: bytes.len() - e.input.len(),
        }),
    }
}

/// Reads back a byte stream that holds nothing but whole frames.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Command>, FrameError> {
    match all_consuming(many0(frame))(bytes).finish() {
        Ok((_, commands)) => Ok(commands),
        Err(e) => Err(FrameError::Malformed {
            offset: bytes.len() - e.input.len(),
        }),
    }
}
