//! This module provides an API to read and write [Stimulus] containers, the
//! `.vtt` files that hold one tactile stimulus each. The files have the
//! following structure, all integers little-endian:
//!
//! | offset | field                                          | type    |
//! |--------|------------------------------------------------|---------|
//! | 0      | magic bytes, `VTT`                             | 3 bytes |
//! | 3      | format version, currently `0`                  | u8      |
//! | 4      | flags, bit 0 set when a WAV file is embedded   | u32     |
//! | 8      | written text length in bytes                   | u32     |
//! | 12     | phonetic text length in bytes                  | u32     |
//! | 16     | sample count                                   | u32     |
//! | 20     | sample period in milliseconds                  | u32     |
//!
//! Then come the written text and the phonetic transcription (both ASCII),
//! then `3 * sample count` bytes of samples, each a phone cell, a pitch byte
//! and an intensity byte (see [crate::signal]). When the audio flag is set,
//! every remaining byte belongs to the embedded WAV file.

use nom::{
    bytes::complete::{tag, take},
    combinator::map,
    multi::count,
    number::complete::{le_u32, le_u8},
    sequence::tuple,
    Finish, IResult,
};

use std::{
    borrow::Cow,
    fmt,
    fs::File,
    io::{Cursor, Read, Write},
    path::Path,
};

use crate::signal::phone_label;

/// The literal tag every container starts with.
pub const MAGIC: &[u8; 3] = b"VTT";
/// The only format version this module reads and writes.
pub const FORMAT_VERSION: u8 = 0;
/// Flag bit marking an embedded WAV file after the samples.
pub const FLAG_EMBEDDED_AUDIO: u32 = 0b1;
/// Size of the fixed part of the header.
pub const FIXED_HEADER_LEN: usize = 24;

/// One instant of a stimulus: which cell to drive, at what pitch and how hard.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sample {
    /// Actuator cell, or [crate::signal::NO_CELL] for silence.
    pub phone: u8,
    /// Mel-spaced pitch byte.
    pub pitch: u8,
    /// Intensity byte.
    pub intensity: u8,
}

/// A decoded stimulus container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stimulus {
    written_text: String,
    phonetic_text: String,
    sample_period: u32,
    samples: Vec<Sample>,
    audio: Option<Vec<u8>>,
}

/// Everything that can go wrong while reading a container, or while building
/// one that would not read back.
#[derive(Debug)]
pub enum DecodeError {
    /// The first three bytes are not [MAGIC].
    BadMagic,

    /// Fewer bytes remain than the header declares.
    Truncated {
        /// Bytes the header says the container holds.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A text field holds a byte outside the ASCII range.
    NonAscii {
        /// Which text field.
        field: &'static str,
        /// Offset of the first bad byte within that field.
        offset: usize,
    },

    /// The header announces a format version this module does not know.
    UnsupportedVersion(u8),

    /// The sample period is zero.
    ZeroPeriod,

    /// The embedded audio is not a readable WAV file.
    Audio(hound::Error),

    /// Returned when io fails when reading or writing files.
    Io(std::io::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use DecodeError as DE;
        let msg = match self {
            DE::BadMagic => Cow::from("not a VTT container (bad magic bytes)"),
            DE::Truncated { needed, available } => Cow::from(format!(
                "truncated container: header declares {needed} bytes, found {available}"
            )),
            DE::NonAscii { field, offset } => {
                Cow::from(format!("non-ASCII byte in {field} text at offset {offset}"))
            }
            DE::UnsupportedVersion(version) => {
                Cow::from(format!("unsupported format version {version}"))
            }
            DE::ZeroPeriod => Cow::from("sample period must be greater than zero"),
            DE::Audio(error) => Cow::from(format!("embedded audio error: {error}")),
            DE::Io(error) => Cow::from(format!("io error: {error}")),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hound::Error> for DecodeError {
    fn from(value: hound::Error) -> Self {
        Self::Audio(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FixedHeader {
    version: u8,
    flags: u32,
    written_len: u32,
    phonetic_len: u32,
    sample_count: u32,
    sample_period: u32,
}

fn fixed_header(input: &[u8]) -> IResult<&[u8], FixedHeader> {
    map(
        tuple((tag(&MAGIC[..]), le_u8, le_u32, le_u32, le_u32, le_u32, le_u32)),
        |(_, version, flags, written_len, phonetic_len, sample_count, sample_period)| {
            FixedHeader {
                version,
                flags,
                written_len,
                phonetic_len,
                sample_count,
                sample_period,
            }
        },
    )(input)
}

/// Parses one three-byte sample. Shared with the device frame decoder.
pub(crate) fn sample(input: &[u8]) -> IResult<&[u8], Sample> {
    map(tuple((le_u8, le_u8, le_u8)), |(phone, pitch, intensity)| {
        Sample {
            phone,
            pitch,
            intensity,
        }
    })(input)
}

fn check_magic(bytes: &[u8]) -> Result<(), DecodeError> {
    let seen = &bytes[..bytes.len().min(MAGIC.len())];
    if seen != &MAGIC[..seen.len()] {
        return Err(DecodeError::BadMagic);
    }
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: FIXED_HEADER_LEN,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn ascii_text(field: &'static str, bytes: &[u8]) -> Result<String, DecodeError> {
    match bytes.iter().position(|b| !b.is_ascii()) {
        Some(offset) => Err(DecodeError::NonAscii { field, offset }),
        None => Ok(bytes.iter().map(|&b| b as char).collect()),
    }
}

fn ascii_string(field: &'static str, text: &str) -> Result<(), DecodeError> {
    ascii_text(field, text.as_bytes()).map(|_| ())
}

impl Stimulus {
    /// Make a [StimulusBuilder], which can be used to set the texts, period
    /// and samples before building the [Stimulus].
    pub fn builder() -> StimulusBuilder {
        StimulusBuilder::new()
    }

    /// Decodes a container held in memory.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_magic(bytes)?;

        let truncated = |needed: usize| DecodeError::Truncated {
            needed,
            available: bytes.len(),
        };

        let (rest, header) = fixed_header(bytes)
            .finish()
            .map_err(|_| truncated(FIXED_HEADER_LEN))?;

        if header.version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(header.version));
        }
        if header.sample_period == 0 {
            return Err(DecodeError::ZeroPeriod);
        }

        let body_len = (header.written_len as usize)
            .checked_add(header.phonetic_len as usize)
            .and_then(|len| len.checked_add((header.sample_count as usize).checked_mul(3)?))
            .ok_or_else(|| truncated(usize::MAX))?;
        if rest.len() < body_len {
            return Err(truncated(FIXED_HEADER_LEN + body_len));
        }

        let (rest, (written, phonetic, samples)) = tuple((
            take(header.written_len as usize),
            take(header.phonetic_len as usize),
            count(sample, header.sample_count as usize),
        ))(rest)
        .finish()
        .map_err(|_: nom::error::Error<&[u8]>| truncated(FIXED_HEADER_LEN + body_len))?;

        let audio = if header.flags & FLAG_EMBEDDED_AUDIO != 0 {
            Some(rest.to_vec())
        } else {
            if !rest.is_empty() {
                log::debug!("ignoring {} trailing bytes after samples", rest.len());
            }
            None
        };

        Ok(Stimulus {
            written_text: ascii_text("written", written)?,
            phonetic_text: ascii_text("phonetic", phonetic)?,
            sample_period: header.sample_period,
            samples,
            audio,
        })
    }

    /// Encodes the container. `decode(encode(s)) == s` for every [Stimulus].
    pub fn encode(&self) -> Vec<u8> {
        let audio_len = self.audio.as_ref().map_or(0, Vec::len);
        let mut buf = Vec::with_capacity(
            FIXED_HEADER_LEN
                + self.written_text.len()
                + self.phonetic_text.len()
                + 3 * self.samples.len()
                + audio_len,
        );

        let flags = if self.audio.is_some() {
            FLAG_EMBEDDED_AUDIO
        } else {
            0
        };

        buf.extend_from_slice(MAGIC);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&(self.written_text.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.phonetic_text.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.samples.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.sample_period.to_le_bytes());
        buf.extend_from_slice(self.written_text.as_bytes());
        buf.extend_from_slice(self.phonetic_text.as_bytes());
        buf.extend(
            self.samples
                .iter()
                .flat_map(|s| [s.phone, s.pitch, s.intensity]),
        );
        if let Some(audio) = &self.audio {
            buf.extend_from_slice(audio);
        }

        buf
    }

    /// Write out a [Stimulus] to the path provided.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), DecodeError> {
        let mut handle = File::create(path)?;
        self.to_file(&mut handle)
    }

    /// Write out a [Stimulus] to the [Write]able object provided.
    pub fn to_file(&self, file: &mut impl Write) -> Result<(), DecodeError> {
        file.write_all(&self.encode())?;
        Ok(())
    }

    /// Read a [Stimulus] from the path provided.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let mut handle = File::open(path)?;
        Self::from_file(&mut handle)
    }

    /// Read a [Stimulus] from the [Read]able object provided.
    pub fn from_file(file: &mut impl Read) -> Result<Self, DecodeError> {
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        Self::decode(&raw)
    }

    /// The written-text transcription.
    pub fn written_text(&self) -> &str {
        &self.written_text
    }

    /// The phonetic transcription.
    pub fn phonetic_text(&self) -> &str {
        &self.phonetic_text
    }

    /// Milliseconds between samples.
    pub fn sample_period(&self) -> u32 {
        self.sample_period
    }

    /// The samples, in playback order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Raw bytes of the embedded WAV file, if there is one.
    pub fn audio(&self) -> Option<&[u8]> {
        self.audio.as_deref()
    }

    /// Playback length in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * self.sample_period as u64
    }

    /// Reads the header of the embedded WAV file.
    pub fn audio_spec(&self) -> Result<Option<hound::WavSpec>, DecodeError> {
        match &self.audio {
            None => Ok(None),
            Some(audio) => {
                let reader = hound::WavReader::new(Cursor::new(audio.as_slice()))?;
                Ok(Some(reader.spec()))
            }
        }
    }

    /// A one-line rendering of the phone track: one character group per
    /// sample change, with `-` marking a phone held over several samples and
    /// blanks marking silence.
    pub fn phonetic_preview(&self) -> String {
        let mut preview = String::new();
        let mut last: Option<&str> = None;

        for sample in &self.samples {
            let phone = phone_label(sample.phone);
            match phone {
                Some(p) if last == Some(p) => preview.push('-'),
                Some(p) => preview.push_str(p),
                None => preview.push(' '),
            }
            last = phone;
        }

        preview.trim().to_owned()
    }
}

/// This builder contains the data required to assemble a [Stimulus].
#[derive(Debug, Clone)]
pub struct StimulusBuilder {
    written_text: String,
    phonetic_text: String,
    sample_period: u32,
    samples: Vec<Sample>,
    audio: Option<Vec<u8>>,
}

impl Default for StimulusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StimulusBuilder {
    /// Instantiate a builder with empty texts, no samples and a sample period
    /// of 1 ms.
    fn new() -> Self {
        StimulusBuilder {
            written_text: String::new(),
            phonetic_text: String::new(),
            sample_period: 1,
            samples: Vec::new(),
            audio: None,
        }
    }

    /// Sets the sample period, in milliseconds.
    pub fn set_period(self, sample_period: u32) -> Self {
        StimulusBuilder {
            sample_period,
            ..self
        }
    }

    /// Sets the written-text transcription.
    pub fn set_written_text(self, text: impl Into<String>) -> Self {
        StimulusBuilder {
            written_text: text.into(),
            ..self
        }
    }

    /// Sets the phonetic transcription.
    pub fn set_phonetic_text(self, text: impl Into<String>) -> Self {
        StimulusBuilder {
            phonetic_text: text.into(),
            ..self
        }
    }

    /// Appends samples.
    pub fn add_samples(mut self, samples: impl IntoIterator<Item = Sample>) -> Self {
        self.samples.extend(samples);
        self
    }

    /// Embeds a WAV file, stored byte-for-byte.
    pub fn embed_audio(self, wav: Vec<u8>) -> Self {
        StimulusBuilder {
            audio: Some(wav),
            ..self
        }
    }

    /// Builds the [Stimulus], refusing anything that would not decode back:
    /// non-ASCII text or a zero sample period.
    pub fn build(self) -> Result<Stimulus, DecodeError> {
        ascii_string("written", &self.written_text)?;
        ascii_string("phonetic", &self.phonetic_text)?;
        if self.sample_period == 0 {
            return Err(DecodeError::ZeroPeriod);
        }

        Ok(Stimulus {
            written_text: self.written_text,
            phonetic_text: self.phonetic_text,
            sample_period: self.sample_period,
            samples: self.samples,
            audio: self.audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::io::Cursor;

    fn hello() -> Stimulus {
        Stimulus::builder()
            .set_period(10)
            .set_written_text("a bad")
            .set_phonetic_text("AH B AE D")
            .add_samples([
                Sample {
                    phone: 27,
                    pitch: 100,
                    intensity: 200,
                },
                Sample {
                    phone: 0,
                    pitch: 110,
                    intensity: 210,
                },
                Sample {
                    phone: 0,
                    pitch: 115,
                    intensity: 190,
                },
                Sample {
                    phone: 255,
                    pitch: 0,
                    intensity: 0,
                },
            ])
            .build()
            .unwrap()
    }

    fn tiny_wav() -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..16i16 {
                writer.write_sample(i * 100).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn header_layout_matches_file_format() {
        let bytes = hello().encode();

        assert_eq!(&bytes[0..3], b"VTT");
        assert_eq!(bytes[3], 0);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &5u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &9u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &4u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &10u32.to_le_bytes());
        assert_eq!(&bytes[24..29], b"a bad");
        assert_eq!(&bytes[38..41], &[27, 100, 200]);
        assert_eq!(bytes.len(), FIXED_HEADER_LEN + 5 + 9 + 12);
    }

    #[test]
    fn decode_inverts_encode() {
        let stimulus = hello();
        assert_eq!(Stimulus::decode(&stimulus.encode()).unwrap(), stimulus);

        let empty = Stimulus::builder().build().unwrap();
        assert_eq!(Stimulus::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn embedded_audio_survives_and_parses() {
        let wav = tiny_wav();
        let stimulus = Stimulus::builder()
            .set_period(1)
            .embed_audio(wav.clone())
            .build()
            .unwrap();

        let bytes = stimulus.encode();
        assert_eq!(&bytes[4..8], &FLAG_EMBEDDED_AUDIO.to_le_bytes());

        let decoded = Stimulus::decode(&bytes).unwrap();
        assert_eq!(decoded.audio(), Some(wav.as_slice()));

        let spec = decoded.audio_spec().unwrap().unwrap();
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(spec.channels, 1);
    }

    #[test]
    fn garbage_audio_is_reported_not_panicked() {
        let stimulus = Stimulus::builder()
            .embed_audio(vec![1, 2, 3])
            .build()
            .unwrap();
        assert!(matches!(stimulus.audio_spec(), Err(DecodeError::Audio(_))));
    }

    #[test]
    fn wrong_magic_is_bad_magic() {
        let mut bytes = hello().encode();
        bytes[0] = b'X';
        assert!(matches!(Stimulus::decode(&bytes), Err(DecodeError::BadMagic)));

        assert!(matches!(Stimulus::decode(b"WAV"), Err(DecodeError::BadMagic)));
        assert!(matches!(Stimulus::decode(b"Z"), Err(DecodeError::BadMagic)));
    }

    #[test]
    fn short_inputs_are_truncated() {
        assert!(matches!(
            Stimulus::decode(b""),
            Err(DecodeError::Truncated {
                needed: FIXED_HEADER_LEN,
                available: 0
            })
        ));
        assert!(matches!(
            Stimulus::decode(b"VT"),
            Err(DecodeError::Truncated { .. })
        ));

        let bytes = hello().encode();
        let cut = &bytes[..bytes.len() - 1];
        match Stimulus::decode(cut) {
            Err(DecodeError::Truncated { needed, available }) => {
                assert_eq!(needed, bytes.len());
                assert_eq!(available, bytes.len() - 1);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn absurd_lengths_do_not_allocate_or_panic() {
        let mut bytes = hello().encode();
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Stimulus::decode(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn non_ascii_text_is_rejected() {
        let mut bytes = hello().encode();
        bytes[25] = 0xC3;
        assert!(matches!(
            Stimulus::decode(&bytes),
            Err(DecodeError::NonAscii {
                field: "written",
                offset: 1
            })
        ));

        assert!(matches!(
            Stimulus::builder().set_phonetic_text("ʃ").build(),
            Err(DecodeError::NonAscii {
                field: "phonetic",
                ..
            })
        ));
    }

    #[test]
    fn unknown_versions_and_zero_periods_are_rejected() {
        let mut bytes = hello().encode();
        bytes[3] = 7;
        assert!(matches!(
            Stimulus::decode(&bytes),
            Err(DecodeError::UnsupportedVersion(7))
        ));

        let mut bytes = hello().encode();
        bytes[20..24].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(Stimulus::decode(&bytes), Err(DecodeError::ZeroPeriod)));
    }

    #[test]
    fn write_and_read_path() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let data = hello();

        data.to_path(tempfile.path()).unwrap();
        let read_data = Stimulus::from_path(tempfile.path()).unwrap();
        assert_eq!(data, read_data);
    }

    #[test]
    fn preview_collapses_held_phones() {
        let stimulus = hello();
        assert_eq!(stimulus.phonetic_preview(), "AHB-");
        assert_eq!(stimulus.duration_ms(), 40);
    }
}
