//! # Musical Tuning Module
//!
//! Pure conversions between frequencies, pitch units, note labels and scale
//! membership, plus the scale-quantized correction a pitch shifter would
//! consume.
//!
//! ## Conventions
//! - A pitch unit is a fractional MIDI number: integers are equal-tempered
//!   semitones and A4 (440 Hz) is 69.
//! - Note labels use sharps, `C4` is pitch unit 60.
//! - Scales are generated over the full pitch-unit range 0..=127.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Reference pitch A4 in Hz.
pub const A4_FREQUENCY: f64 = 440.0;
/// Pitch unit of A4.
pub const A4_PITCH_UNIT: f64 = 69.0;
/// Highest pitch unit a scale note can take.
pub const MAX_PITCH_UNIT: u8 = 127;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

const MAJOR_INTERVALS: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
const MINOR_INTERVALS: [u8; 7] = [0, 2, 3, 5, 7, 8, 10];

/// One of the twelve pitch classes, `C` = 0 through `B` = 11.
///
/// The only way to get one is through a checked constructor, so every
/// `PitchClass` in circulation is a valid scale root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PitchClass(u8);

impl PitchClass {
    pub const C: PitchClass = PitchClass(0);
    pub const A: PitchClass = PitchClass(9);

    /// Creates a pitch class from its index.
    ///
    /// # Returns
    /// * `Err(InvalidConfiguration)` - if `index` is 12 or more
    pub fn new(index: u8) -> Result<Self> {
        if index < 12 {
            Ok(Self(index))
        } else {
            Err(EngineError::config(format!(
                "pitch class {index} is outside 0-11"
            )))
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Sharp spelling of the pitch class, e.g. `"F#"`.
    pub fn name(self) -> &'static str {
        NOTE_NAMES[self.0 as usize]
    }
}

impl TryFrom<u8> for PitchClass {
    type Error = EngineError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PitchClass> for u8 {
    fn from(value: PitchClass) -> Self {
        value.0
    }
}

impl FromStr for PitchClass {
    type Err = EngineError;

    /// Parses `C`, `c#`, `Db`, `B` and so on. Flats are folded onto the
    /// sharp spelling.
    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        let letter = chars.next().map(|c| c.to_ascii_uppercase());
        let base: i8 = match letter {
            Some('C') => 0,
            Some('D') => 2,
            Some('E') => 4,
            Some('F') => 5,
            Some('G') => 7,
            Some('A') => 9,
            Some('B') => 11,
            _ => return Err(EngineError::config(format!("unknown key `{s}`"))),
        };
        let accidental: i8 = match chars.as_str() {
            "" => 0,
            "#" | "s" | "sharp" => 1,
            "b" | "flat" => -1,
            _ => return Err(EngineError::config(format!("unknown key `{s}`"))),
        };
        Self::new((base + accidental).rem_euclid(12) as u8)
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two scale shapes the engine can quantize to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleKind {
    Major,
    Minor,
}

impl ScaleKind {
    /// Semitone offsets from the root, ascending.
    pub fn intervals(self) -> &'static [u8; 7] {
        match self {
            ScaleKind::Major => &MAJOR_INTERVALS,
            ScaleKind::Minor => &MINOR_INTERVALS,
        }
    }
}

impl FromStr for ScaleKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "major" | "maj" => Ok(ScaleKind::Major),
            "minor" | "min" => Ok(ScaleKind::Minor),
            other => Err(EngineError::config(format!("unknown scale `{other}`"))),
        }
    }
}

impl fmt::Display for ScaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleKind::Major => f.write_str("major"),
            ScaleKind::Minor => f.write_str("minor"),
        }
    }
}

/// A root plus a scale shape, e.g. A minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleDefinition {
    pub root: PitchClass,
    pub kind: ScaleKind,
}

impl ScaleDefinition {
    pub fn new(root: PitchClass, kind: ScaleKind) -> Self {
        Self { root, kind }
    }

    /// Every pitch unit in 0..=127 that belongs to this scale.
    pub fn notes(&self) -> &'static [u8] {
        scale_notes(*self)
    }
}

impl fmt::Display for ScaleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.root, self.kind)
    }
}

/// The correction that moves a detected pitch onto the nearest scale note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchCorrection {
    /// Frequency of the target scale note in Hz.
    pub target_frequency_hz: f64,
    /// Signed distance in semitones from the input to the target.
    pub semitone_shift: f64,
    /// Target scale note as a pitch unit.
    pub target_note: u8,
    /// Target scale note label, e.g. `"E4"`.
    pub target_note_label: String,
}

/// Note sets for all 24 scales, computed once.
///
/// Indexed by `kind * 12 + root`.
static SCALE_TABLE: Lazy<Vec<Vec<u8>>> = Lazy::new(|| {
    [ScaleKind::Major, ScaleKind::Minor]
        .into_iter()
        .flat_map(|kind| (0..12).map(move |root| build_scale_notes(PitchClass(root), kind)))
        .collect()
});

/// Converts a frequency to a fractional pitch unit.
///
/// # Returns
/// * `12 * log2(f / 440) + 69`, or `0.0` for non-positive input
pub fn frequency_to_pitch_unit(frequency_hz: f64) -> f64 {
    if frequency_hz <= 0.0 {
        return 0.0;
    }
    12.0 * (frequency_hz / A4_FREQUENCY).log2() + A4_PITCH_UNIT
}

/// Converts a pitch unit back to a frequency in Hz.
pub fn pitch_unit_to_frequency(pitch_unit: f64) -> f64 {
    A4_FREQUENCY * 2.0_f64.powf((pitch_unit - A4_PITCH_UNIT) / 12.0)
}

/// Label of the semitone nearest to `pitch_unit`, e.g. `69.3` -> `"A4"`.
pub fn pitch_unit_to_note_label(pitch_unit: f64) -> String {
    let nearest = pitch_unit.round() as i64;
    let name = NOTE_NAMES[nearest.rem_euclid(12) as usize];
    let octave = nearest.div_euclid(12) - 1;
    format!("{name}{octave}")
}

/// Label of an integer note, e.g. `60` -> `"C4"`.
pub fn format_note_label(note: u8) -> String {
    pitch_unit_to_note_label(note as f64)
}

/// Generates the note set of a scale without touching the cache.
///
/// Emits `octave * 12 + root + offset` for octaves 0..=10 and keeps the
/// values inside 0..=127. The patterns are ascending and span less than an
/// octave, so the output is strictly ascending.
pub fn build_scale_notes(root: PitchClass, kind: ScaleKind) -> Vec<u8> {
    let mut notes = Vec::with_capacity(11 * 7);
    for octave in 0..=10u16 {
        for &offset in kind.intervals() {
            let note = octave * 12 + root.index() as u16 + offset as u16;
            if note <= MAX_PITCH_UNIT as u16 {
                notes.push(note as u8);
            }
        }
    }
    notes
}

/// Cached note set of `scale`, ascending and duplicate free.
pub fn scale_notes(scale: ScaleDefinition) -> &'static [u8] {
    let kind_offset = match scale.kind {
        ScaleKind::Major => 0,
        ScaleKind::Minor => 12,
    };
    &SCALE_TABLE[kind_offset + scale.root.index() as usize]
}

/// Alias of [`scale_notes`] for callers that think in terms of a key.
pub fn get_scale_notes(root: PitchClass, kind: ScaleKind) -> &'static [u8] {
    scale_notes(ScaleDefinition::new(root, kind))
}

/// Finds the scale note closest to `pitch_unit`.
///
/// Scans the notes in ascending order and only replaces the current best on
/// a strictly smaller distance, so a tie resolves to the lower note.
pub fn nearest_scale_note(pitch_unit: f64, scale: ScaleDefinition) -> u8 {
    let notes = scale_notes(scale);
    let mut best = notes[0];
    let mut best_distance = f64::INFINITY;
    for &note in notes {
        let distance = (note as f64 - pitch_unit).abs();
        if distance < best_distance {
            best_distance = distance;
            best = note;
        }
    }
    best
}

/// Computes how far `frequency_hz` has to move to land on `scale`.
///
/// # Arguments
/// * `frequency_hz` - Detected frequency in Hz
/// * `scale` - Active key and scale
///
/// # Returns
/// * The target note, its frequency and the signed semitone shift
pub fn calculate_pitch_correction(frequency_hz: f64, scale: ScaleDefinition) -> PitchCorrection {
    let input = frequency_to_pitch_unit(frequency_hz);
    let target_note = nearest_scale_note(input, scale);
    PitchCorrection {
        target_frequency_hz: pitch_unit_to_frequency(target_note as f64),
        semitone_shift: target_note as f64 - input,
        target_note,
        target_note_label: format_note_label(target_note),
    }
}

/// Deviation from the nearest equal-tempered semitone in cents.
///
/// Independent of key and scale: positive is sharp, negative is flat, and
/// the value always lies in `[-50, 50]`.
pub fn cents_deviation(frequency_hz: f64) -> f64 {
    let pitch_unit = frequency_to_pitch_unit(frequency_hz);
    (pitch_unit - pitch_unit.round()) * 100.0
}

/// Calculates the deviation from a target frequency in cents.
///
/// # Returns
/// * Cent deviation (positive = sharp, negative = flat)
pub fn calculate_cents_deviation(frequency_hz: f64, target_hz: f64) -> f64 {
    1200.0 * (frequency_hz / target_hz).log2()
}
