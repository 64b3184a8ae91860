use serde::{Deserialize, Serialize};

mod grid;
mod instrument;
mod sync_group;

pub use grid::{Grid, Lane, STARTER_BAR_STEPS};
pub use instrument::{
    DEFAULT_ROWS, Instrument, InstrumentCategory, default_instruments, drum_kit, find_instrument,
};
pub use sync_group::{SyncGroupId, UnknownSyncGroup};

/// Grid steps per quarter-note beat (one step is a 16th note).
pub const STEPS_PER_BEAT: u32 = 4;

/// Trigger sent from the scheduler to the audio host.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerCommand {
    NoteOn {
        pitch: u8,
        velocity: f32,
        track_id: String,
    },
    Metronome {
        accent: bool,
    },
}

/// A note derived from an active grid cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrumNote {
    pub instrument_id: String,
    pub pitch: u8,
    pub velocity: f32,
    pub lane: usize,
    pub step: usize,
    /// Start, in seconds from the beginning of the timeline.
    pub time: f64,
    /// Length of one step, in seconds.
    pub duration: f64,
}
