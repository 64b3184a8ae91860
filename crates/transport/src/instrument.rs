use serde::{Deserialize, Serialize};

/// Number of lanes in a default track.
pub const DEFAULT_ROWS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentCategory {
    Kick,
    Snare,
    Hihat,
    Cymbal,
    Tom,
    Percussion,
}

/// A drum voice. Immutable reference data; lanes are matched to
/// instruments by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub name: String,
    pub color: String,
    /// General MIDI percussion note number.
    pub pitch: u8,
    /// Base velocity, 0.0..=1.0.
    pub velocity: f32,
    pub category: InstrumentCategory,
}

impl Instrument {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        pitch: u8,
        velocity: f32,
        category: InstrumentCategory,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: "#9CA3AF".to_string(),
            pitch,
            velocity: velocity.clamp(0.0, 1.0),
            category,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

const KIT: [(&str, &str, &str, u8, f32, InstrumentCategory); 13] = [
    ("kick", "Kick", "#EF4444", 36, 0.9, InstrumentCategory::Kick),
    ("snare", "Snare", "#F59E0B", 38, 0.8, InstrumentCategory::Snare),
    ("hihat_closed", "Hi-Hat Closed", "#10B981", 42, 0.6, InstrumentCategory::Hihat),
    ("hihat_open", "Hi-Hat Open", "#059669", 46, 0.7, InstrumentCategory::Hihat),
    ("crash", "Crash", "#8B5CF6", 49, 0.8, InstrumentCategory::Cymbal),
    ("ride", "Bell Tap", "#06B6D4", 51, 0.7, InstrumentCategory::Cymbal),
    ("tom_high", "Snare Backstick", "#F97316", 50, 0.7, InstrumentCategory::Tom),
    ("tom_mid", "Snare Rim Shot", "#EC4899", 47, 0.7, InstrumentCategory::Tom),
    ("tom_floor", "Snare Stick", "#84CC16", 41, 0.7, InstrumentCategory::Tom),
    ("tom1", "Snare Rim", "#FCD34D", 45, 0.6, InstrumentCategory::Tom),
    ("splash", "Splash", "#A855F7", 55, 0.6, InstrumentCategory::Cymbal),
    ("china", "China", "#DC2626", 52, 0.8, InstrumentCategory::Cymbal),
    ("rimshot", "Rim Shot", "#FBBF24", 37, 0.6, InstrumentCategory::Percussion),
];

/// The full built-in kit.
pub fn drum_kit() -> Vec<Instrument> {
    KIT.iter()
        .map(|&(id, name, color, pitch, velocity, category)| {
            Instrument::new(id, name, pitch, velocity, category).with_color(color)
        })
        .collect()
}

/// Instruments of a freshly created track: the first [`DEFAULT_ROWS`] of the kit.
pub fn default_instruments() -> Vec<Instrument> {
    let mut kit = drum_kit();
    kit.truncate(DEFAULT_ROWS);
    kit
}

pub fn find_instrument<'a>(instruments: &'a [Instrument], id: &str) -> Option<&'a Instrument> {
    instruments.iter().find(|inst| inst.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_instruments_are_first_rows_of_kit() {
        let defaults = default_instruments();
        assert_eq!(defaults.len(), DEFAULT_ROWS);
        assert_eq!(defaults[0].id, "kick");
        assert_eq!(defaults[1].id, "snare");
        assert_eq!(defaults[2].id, "hihat_closed");
        assert_eq!(defaults[0].pitch, 36);
    }

    #[test]
    fn test_kit_ids_are_unique() {
        let kit = drum_kit();
        let mut ids: Vec<&str> = kit.iter().map(|inst| inst.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), kit.len());
    }

    #[test]
    fn test_velocity_is_clamped() {
        let inst = Instrument::new("x", "X", 40, 1.7, InstrumentCategory::Percussion);
        assert_eq!(inst.velocity, 1.0);
    }

    #[test]
    fn test_find_instrument() {
        let kit = drum_kit();
        assert_eq!(find_instrument(&kit, "china").map(|i| i.pitch), Some(52));
        assert!(find_instrument(&kit, "cowbell").is_none());
    }

    #[test]
    fn test_category_serializes_lowercase() {
        let json = serde_json::to_string(&InstrumentCategory::Hihat).unwrap();
        assert_eq!(json, "\"hihat\"");
    }
}
