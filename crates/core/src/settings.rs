use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compile::TempoPolicy;
use crate::history::DEFAULT_HISTORY_CAPACITY;

/// Tunables for the manager and the playback runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tick_interval_ms: u64,
    /// Bounded wait for the init guard and the audio bring-up.
    pub init_timeout_ms: u64,
    pub history_capacity: usize,
    /// Bars compiled when a caller doesn't ask for a length.
    pub default_bars: usize,
    pub tempo_policy: TempoPolicy,
    pub loop_enabled: bool,
    pub metronome_enabled: bool,
    pub trigger_ring_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 8,
            init_timeout_ms: 5000,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_bars: 32,
            tempo_policy: TempoPolicy::default(),
            loop_enabled: true,
            metronome_enabled: false,
            trigger_ring_capacity: 256,
        }
    }
}

impl Settings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}
