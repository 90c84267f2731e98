//! Turns continuous speech measurements into the byte-sized samples that the
//! tactile array understands.
//!
//! Every sample carries three bytes: the actuator cell of the current phone,
//! a pitch byte and an intensity byte. Pitch is clamped to the range of human
//! voice fundamentals and spaced on the mel scale before it is squeezed into
//! a byte, so that byte distances roughly follow perceived pitch distances.
//! Loudness is clamped and scaled linearly.
//!
//! The [SignalPlayer] replays phone, pitch and loudness tracks side by side at
//! a fixed period, which is how stimulus containers get built from analysed
//! recordings.

use std::fmt;

use crate::vtt_format::Sample;

/// Physical layout of the actuator array: the phone rendered by each cell.
/// Gaps in the array are `None`.
pub const PHONE_LAYOUT: [Option<&str>; 42] = [
    Some("B"),
    Some("D"),
    Some("G"),
    Some("HH"),
    Some("DH"),
    None,
    Some("P"),
    Some("T"),
    Some("K"),
    Some("TH"),
    Some("F"),
    None,
    Some("M"),
    Some("N"),
    Some("SH"),
    Some("S"),
    Some("V"),
    Some("W"),
    Some("Y"),
    Some("NG"),
    Some("CH"),
    Some("ZH"),
    Some("Z"),
    Some("L"),
    Some("R"),
    Some("ER"),
    Some("JH"),
    Some("AH"),
    Some("AO"),
    Some("AA"),
    Some("AW"),
    Some("UW"),
    Some("UH"),
    Some("OW"),
    Some("OY"),
    Some("AX"),
    Some("IY"),
    Some("EY"),
    Some("IH"),
    Some("EH"),
    Some("AE"),
    Some("AY"),
];

/// Cell id sent when no actuator should be driven (silence, unknown phone).
pub const NO_CELL: u8 = 255;

/// Lowest pitch that can be rendered, in Hz.
pub const PITCH_MIN_HZ: f64 = 30.0;
/// Highest pitch that can be rendered, in Hz.
pub const PITCH_MAX_HZ: f64 = 260.0;
/// Loudness at which the intensity byte saturates.
pub const LOUDNESS_MAX: f64 = 50.0;

/// Mel transform, O'Shaughnessy (1987).
pub fn mel(hz: f64) -> f64 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

/// Inverse of [mel].
pub fn de_mel(m: f64) -> f64 {
    700.0 * ((m / 1127.0).exp() - 1.0)
}

/// Maps a pitch in Hz onto a byte. Values outside
/// [PITCH_MIN_HZ]..=[PITCH_MAX_HZ] are clamped first; NaN reads as the
/// lowest pitch.
pub fn normalize_pitch(hz: f64) -> u8 {
    let hz = if hz.is_nan() {
        PITCH_MIN_HZ
    } else {
        hz.clamp(PITCH_MIN_HZ, PITCH_MAX_HZ)
    };
    let min_mel = mel(PITCH_MIN_HZ);
    let max_mel = mel(PITCH_MAX_HZ);
    let scaled = (mel(hz) - min_mel) / (max_mel - min_mel);

    (scaled * 255.0).clamp(0.0, 255.0) as u8
}

/// Maps a loudness value onto a byte, clamping to `0..=LOUDNESS_MAX`.
pub fn normalize_intensity(loudness: f64) -> u8 {
    let loudness = if loudness.is_nan() {
        0.0
    } else {
        loudness.clamp(0.0, LOUDNESS_MAX)
    };

    (255.0 * loudness / LOUDNESS_MAX) as u8
}

/// Looks up the actuator cell for a phone label. Stress markers (`AH1`) and
/// case are ignored; unknown phones map to [NO_CELL].
pub fn phone_index(label: &str) -> u8 {
    let phone = label
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .to_ascii_uppercase();

    PHONE_LAYOUT
        .iter()
        .position(|p| *p == Some(phone.as_str()))
        .map_or(NO_CELL, |idx| idx as u8)
}

/// The phone rendered by a cell, if the cell exists and is populated.
pub fn phone_label(cell: u8) -> Option<&'static str> {
    PHONE_LAYOUT.get(cell as usize).copied().flatten()
}

/// Shapes one instant of measurements into a [Sample].
pub fn format_signal(phone: Option<&str>, pitch_hz: f64, loudness: f64) -> Sample {
    Sample {
        phone: phone.map_or(NO_CELL, phone_index),
        pitch: normalize_pitch(pitch_hz),
        intensity: normalize_intensity(loudness),
    }
}

/// A step-held series of timestamped values. Timestamps are in seconds and
/// must be ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries<T> {
    records: Vec<(f64, T)>,
    idx: usize,
    elapsed: f64,
}

impl<T> Default for TimeSeries<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeSeries<T> {
    /// An empty series.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            idx: 0,
            elapsed: 0.0,
        }
    }

    /// Appends a value that takes effect at `time`.
    pub fn push(&mut self, time: f64, value: T) {
        self.records.push((time, value));
    }

    /// Number of records in the series.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the series holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Moves the playhead forward by `delta` seconds and returns the value in
    /// effect at the new position.
    pub fn advance(&mut self, delta: f64) -> Option<&T> {
        self.elapsed += delta;
        while self.idx + 1 < self.records.len() && self.elapsed >= self.records[self.idx + 1].0 {
            self.idx += 1;
        }
        self.records.get(self.idx).map(|(_, value)| value)
    }

    /// True once the playhead has reached the last record.
    pub fn is_done(&self) -> bool {
        self.idx + 1 >= self.records.len()
    }

    /// Rewinds the playhead.
    pub fn reset(&mut self) {
        self.idx = 0;
        self.elapsed = 0.0;
    }
}

/// Returned when a measurement track cannot be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackError {
    /// 1-based line of the offending record.
    pub line: usize,
    /// What was wrong with it.
    pub reason: String,
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

impl std::error::Error for TrackError {}

/// Reads a two-column `time,value` track. Blank lines and lines starting with
/// `#` are skipped, as is a first line whose time column is not a number
/// (a header).
pub fn read_track<T, F>(text: &str, parse: F) -> Result<TimeSeries<T>, TrackError>
where
    F: Fn(&str) -> Option<T>,
{
    let mut series = TimeSeries::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (time, value) = line.split_once(',').ok_or_else(|| TrackError {
            line: idx + 1,
            reason: "expected `time,value`".to_owned(),
        })?;

        let time = match time.trim().parse::<f64>() {
            Ok(time) => time,
            Err(_) if idx == 0 => continue,
            Err(_) => {
                return Err(TrackError {
                    line: idx + 1,
                    reason: format!("bad timestamp `{}`", time.trim()),
                })
            }
        };

        let value = parse(value.trim()).ok_or_else(|| TrackError {
            line: idx + 1,
            reason: format!("bad value `{}`", value.trim()),
        })?;

        series.push(time, value);
    }

    Ok(series)
}

/// Replays phone, pitch and loudness tracks in lockstep.
#[derive(Debug, Clone)]
pub struct SignalPlayer {
    phones: TimeSeries<Option<String>>,
    pitch: TimeSeries<f64>,
    loudness: TimeSeries<f64>,
}

impl SignalPlayer {
    /// Combines the three tracks. A `None` phone marks silence.
    pub fn new(
        phones: TimeSeries<Option<String>>,
        pitch: TimeSeries<f64>,
        loudness: TimeSeries<f64>,
    ) -> Self {
        Self {
            phones,
            pitch,
            loudness,
        }
    }

    fn step(&mut self, delta: f64) -> Sample {
        let phone = self.phones.advance(delta).cloned().flatten();
        let pitch = self.pitch.advance(delta).copied().unwrap_or(0.0);
        let loudness = self.loudness.advance(delta).copied().unwrap_or(0.0);
        format_signal(phone.as_deref(), pitch, loudness)
    }

    /// Samples all tracks every `period` seconds, starting at time zero and
    /// stopping as soon as any track runs out. `None` unless `period` is a
    /// positive, finite number of seconds.
    pub fn to_samples(&mut self, period: f64) -> Option<Vec<Sample>> {
        if !(period.is_finite() && period > 0.0) {
            return None;
        }
        self.phones.reset();
        self.pitch.reset();
        self.loudness.reset();

        let mut samples = vec![self.step(0.0)];
        while !(self.phones.is_done() || self.pitch.is_done() || self.loudness.is_done()) {
            samples.push(self.step(period));
        }
        Some(samples)
    }
}
