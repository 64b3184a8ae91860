use std::str::FromStr;

use drumseq_transport::STEPS_PER_BEAT;
use serde::{Deserialize, Serialize};

/// Default tempo of new tracks and sync groups, in BPM.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Denominators a bar can be expressed in at 16th-note step resolution.
const SUPPORTED_DENOMINATORS: [u32; 5] = [1, 2, 4, 8, 16];

/// Most beats a bar may hold; 64/1 is 1024 steps.
pub const MAX_NUMERATOR: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeSignatureError {
    #[error("time signature '{0}' is not in N/D form")]
    Malformed(String),
    #[error("time signature '{0}' has a zero numerator")]
    ZeroNumerator(String),
    #[error("time signature '{0}' has unsupported denominator {1}")]
    UnsupportedDenominator(String, u32),
    #[error("time signature '{0}' has {1} beats per bar, at most 64 allowed")]
    TooManyBeats(String, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.numerator
    }

    /// 16th-note steps in one bar: 16 at 4/4, 12 at 3/4 and 6/8.
    /// Saturates instead of overflowing for meters built by hand.
    pub fn steps_per_bar(&self) -> usize {
        let steps = self
            .numerator
            .checked_mul(STEPS_PER_BEAT * 4)
            .unwrap_or(u32::MAX)
            / self.denominator.max(1);
        steps as usize
    }

    /// Seconds per step. A step is a 16th note regardless of the meter.
    pub fn step_duration(&self, tempo: f64) -> f64 {
        60.0 / tempo / STEPS_PER_BEAT as f64
    }

    /// Seconds per metronome beat (one denominator note).
    pub fn beat_duration(&self, tempo: f64) -> f64 {
        60.0 / tempo * 4.0 / self.denominator.max(1) as f64
    }

    pub fn seconds_per_bar(&self, tempo: f64) -> f64 {
        self.steps_per_bar() as f64 * self.step_duration(tempo)
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

impl From<(u32, u32)> for TimeSignature {
    fn from((numerator, denominator): (u32, u32)) -> Self {
        Self::new(numerator, denominator)
    }
}

impl From<TimeSignature> for (u32, u32) {
    fn from(ts: TimeSignature) -> Self {
        (ts.numerator, ts.denominator)
    }
}

impl std::fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for TimeSignature {
    type Err = TimeSignatureError;

    /// Parses `"N/D"` where both parts are plain digit runs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TimeSignatureError::Malformed(s.to_string());

        let (num, den) = s.split_once('/').ok_or_else(malformed)?;
        let is_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !is_digits(num) || !is_digits(den) {
            return Err(malformed());
        }

        let numerator: u32 = num.parse().map_err(|_| malformed())?;
        let denominator: u32 = den.parse().map_err(|_| malformed())?;

        if numerator == 0 {
            return Err(TimeSignatureError::ZeroNumerator(s.to_string()));
        }
        if numerator > MAX_NUMERATOR {
            return Err(TimeSignatureError::TooManyBeats(s.to_string(), numerator));
        }
        if !SUPPORTED_DENOMINATORS.contains(&denominator) {
            return Err(TimeSignatureError::UnsupportedDenominator(
                s.to_string(),
                denominator,
            ));
        }

        Ok(Self::new(numerator, denominator))
    }
}

impl TryFrom<String> for TimeSignature {
    type Error = TimeSignatureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSignature> for String {
    fn from(ts: TimeSignature) -> Self {
        ts.to_string()
    }
}

/// Tempo and meter of a timeline, with conversions between seconds and
/// grid positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeContext {
    pub tempo: f64,
    pub time_signature: TimeSignature,
}

impl TimeContext {
    pub fn new(tempo: f64, time_signature: impl Into<TimeSignature>) -> Self {
        Self {
            tempo,
            time_signature: time_signature.into(),
        }
    }

    pub fn step_duration(&self) -> f64 {
        self.time_signature.step_duration(self.tempo)
    }

    pub fn beat_duration(&self) -> f64 {
        self.time_signature.beat_duration(self.tempo)
    }

    pub fn seconds_per_bar(&self) -> f64 {
        self.time_signature.seconds_per_bar(self.tempo)
    }

    pub fn steps_to_seconds(&self, steps: usize) -> f64 {
        steps as f64 * self.step_duration()
    }

    /// Step containing `seconds`.
    pub fn seconds_to_step(&self, seconds: f64) -> usize {
        (seconds.max(0.0) / self.step_duration()).floor() as usize
    }

    pub fn bars_to_seconds(&self, bars: usize) -> f64 {
        bars as f64 * self.seconds_per_bar()
    }

    pub fn format_position(&self, seconds: f64) -> MusicalPosition {
        let step = self.seconds_to_step(seconds);
        let steps_per_bar = self.time_signature.steps_per_bar().max(1);
        let steps_per_beat = (steps_per_bar / self.time_signature.beats_per_bar().max(1) as usize).max(1);

        let bar = step / steps_per_bar;
        let step_in_bar = step % steps_per_bar;

        MusicalPosition {
            bar: bar as u32 + 1,
            beat: (step_in_bar / steps_per_beat) as u32 + 1,
            step: (step_in_bar % steps_per_beat) as u32 + 1,
        }
    }
}

impl Default for TimeContext {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPO, TimeSignature::default())
    }
}

/// One-based bar.beat.step position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MusicalPosition {
    pub bar: u32,
    pub beat: u32,
    pub step: u32,
}

impl std::fmt::Display for MusicalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bar, self.beat, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_signature() {
        assert_eq!("4/4".parse(), Ok(TimeSignature::new(4, 4)));
        assert_eq!("7/8".parse(), Ok(TimeSignature::new(7, 8)));
        assert_eq!("12/16".parse(), Ok(TimeSignature::new(12, 16)));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "4", "4/", "/4", "4-4", " 4/4", "4/4 ", "a/4", "4/4/4", "-3/4"] {
            assert!(
                matches!(bad.parse::<TimeSignature>(), Err(TimeSignatureError::Malformed(_))),
                "'{bad}' should be malformed"
            );
        }
    }

    #[test]
    fn test_parse_rejects_unsupported_values() {
        assert!(matches!(
            "0/4".parse::<TimeSignature>(),
            Err(TimeSignatureError::ZeroNumerator(_))
        ));
        assert!(matches!(
            "4/3".parse::<TimeSignature>(),
            Err(TimeSignatureError::UnsupportedDenominator(_, 3))
        ));
        assert!(matches!(
            "4/0".parse::<TimeSignature>(),
            Err(TimeSignatureError::UnsupportedDenominator(_, 0))
        ));
    }

    #[test]
    fn test_parse_caps_beats_per_bar() {
        assert_eq!("64/4".parse(), Ok(TimeSignature::new(64, 4)));
        assert_eq!("64/1".parse::<TimeSignature>().unwrap().steps_per_bar(), 1024);
        assert_eq!(
            "65/4".parse::<TimeSignature>(),
            Err(TimeSignatureError::TooManyBeats("65/4".into(), 65))
        );
        assert!(matches!(
            "300000000/4".parse::<TimeSignature>(),
            Err(TimeSignatureError::TooManyBeats(_, 300_000_000))
        ));
        assert!(serde_json::from_str::<TimeSignature>("\"300000000/4\"").is_err());
    }

    #[test]
    fn test_oversized_meter_saturates() {
        let huge = TimeSignature::new(300_000_000, 4);
        assert_eq!(huge.steps_per_bar(), (u32::MAX / 4) as usize);
    }

    #[test]
    fn test_steps_per_bar() {
        assert_eq!(TimeSignature::new(4, 4).steps_per_bar(), 16);
        assert_eq!(TimeSignature::new(3, 4).steps_per_bar(), 12);
        assert_eq!(TimeSignature::new(6, 8).steps_per_bar(), 12);
        assert_eq!(TimeSignature::new(7, 8).steps_per_bar(), 14);
    }

    #[test]
    fn test_durations_at_120_bpm() {
        let ts = TimeSignature::default();
        assert_eq!(ts.step_duration(120.0), 0.125);
        assert_eq!(ts.beat_duration(120.0), 0.5);
        assert_eq!(ts.seconds_per_bar(120.0), 2.0);

        let ts = TimeSignature::new(6, 8);
        assert_eq!(ts.beat_duration(120.0), 0.25);
        assert_eq!(ts.seconds_per_bar(120.0), 1.5);
    }

    #[test]
    fn test_time_signature_serde_as_string() {
        let json = serde_json::to_string(&TimeSignature::new(3, 4)).unwrap();
        assert_eq!(json, "\"3/4\"");
        let ts: TimeSignature = serde_json::from_str("\"6/8\"").unwrap();
        assert_eq!(ts, TimeSignature::new(6, 8));
        assert!(serde_json::from_str::<TimeSignature>("\"six/8\"").is_err());
    }

    #[test]
    fn test_format_position() {
        let ctx = TimeContext::default();
        assert_eq!(ctx.format_position(0.0).to_string(), "1.1.1");
        assert_eq!(ctx.format_position(0.5).to_string(), "1.2.1");
        assert_eq!(ctx.format_position(0.625).to_string(), "1.2.2");
        assert_eq!(ctx.format_position(2.0).to_string(), "2.1.1");
    }

    #[test]
    fn test_seconds_to_step() {
        let ctx = TimeContext::new(120.0, (4, 4));
        assert_eq!(ctx.seconds_to_step(0.0), 0);
        assert_eq!(ctx.seconds_to_step(0.124), 0);
        assert_eq!(ctx.seconds_to_step(0.125), 1);
        assert_eq!(ctx.seconds_to_step(-1.0), 0);
        assert_eq!(ctx.bars_to_seconds(4), 8.0);
    }
}
