//! Pure functions that flatten sync groups into one playable timeline.

use std::ops::Range;

use drumseq_transport::{DrumNote, Grid, Instrument, Lane, SyncGroupId};
use serde::{Deserialize, Serialize};

use crate::sync_groups::{SyncGroup, SyncGroupRegistry};
use crate::time::{DEFAULT_TEMPO, TimeContext, TimeSignature};

/// How the combined timeline picks its tempo and meter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempoPolicy {
    /// Scan groups A..F; the last one whose value differs from the default
    /// wins, otherwise the default.
    #[default]
    LastNonDefault,
    /// The track's own tempo and meter.
    TrackOverride,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompileOptions {
    pub bars: usize,
    pub policy: TempoPolicy,
    pub track_tempo: f64,
    pub track_time_signature: TimeSignature,
}

impl CompileOptions {
    pub fn new(bars: usize) -> Self {
        Self {
            bars,
            policy: TempoPolicy::default(),
            track_tempo: DEFAULT_TEMPO,
            track_time_signature: TimeSignature::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("sync group {group} has instrument '{instrument}' which is not on the track")]
    UnknownInstrument {
        group: SyncGroupId,
        instrument: String,
    },
    #[error("bar range {start}..{end} is empty")]
    EmptyRange { start: usize, end: usize },
}

/// Flattened, read-only output of [`compile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedTimeline {
    pub grid: Grid,
    pub instruments: Vec<Instrument>,
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub start_bar: usize,
    pub bars: usize,
    pub steps_per_bar: usize,
    pub total_duration: f64,
    /// Registry revision this timeline was built from.
    pub revision: u64,
}

impl CombinedTimeline {
    pub fn time_context(&self) -> TimeContext {
        TimeContext::new(self.tempo, self.time_signature)
    }

    pub fn total_steps(&self) -> usize {
        self.bars * self.steps_per_bar
    }

    pub fn step_duration(&self) -> f64 {
        self.time_signature.step_duration(self.tempo)
    }

    pub fn beat_duration(&self) -> f64 {
        self.time_signature.beat_duration(self.tempo)
    }

    /// Length of one loop of the timeline.
    pub fn pattern_duration(&self) -> f64 {
        self.total_duration
    }

    pub fn cell_count(&self) -> usize {
        self.grid.cell_count()
    }

    /// One note per active cell, ordered by step then lane.
    pub fn notes(&self) -> Vec<DrumNote> {
        let step_duration = self.step_duration();
        let mut notes = Vec::with_capacity(self.cell_count());

        for step in 0..self.grid.columns() {
            for lane in self.grid.active_rows(step) {
                let Some(inst) = self.instruments.get(lane) else {
                    continue;
                };
                notes.push(DrumNote {
                    instrument_id: inst.id.clone(),
                    pitch: inst.pitch,
                    velocity: inst.velocity,
                    lane,
                    step,
                    time: step as f64 * step_duration,
                    duration: step_duration,
                });
            }
        }

        notes
    }
}

/// Compile bars `0..options.bars`.
pub fn compile(
    registry: &SyncGroupRegistry,
    instruments: &[Instrument],
    options: &CompileOptions,
) -> Result<CombinedTimeline, CompileError> {
    compile_range(registry, instruments, 0..options.bars, options)
}

/// Compile bars `range`, each bar copied from the group it follows.
///
/// Group rows are matched to track lanes by instrument id. Track lanes a
/// group doesn't carry stay silent for that group's bars.
pub fn compile_range(
    registry: &SyncGroupRegistry,
    instruments: &[Instrument],
    range: Range<usize>,
    options: &CompileOptions,
) -> Result<CombinedTimeline, CompileError> {
    if range.is_empty() {
        return Err(CompileError::EmptyRange {
            start: range.start,
            end: range.end,
        });
    }

    let (tempo, time_signature) = resolve_tempo(registry, options);
    let steps_per_bar = time_signature.steps_per_bar();
    let bars = range.len();

    // lane_maps[group][track lane] = row in that group's grid
    let mut lane_maps: [Option<Vec<Option<usize>>>; 6] = Default::default();
    for bar in range.clone() {
        let id = registry.bar_group(bar);
        if lane_maps[id as usize].is_none() {
            lane_maps[id as usize] = Some(lane_map(registry.group(id), instruments)?);
        }
    }

    let mut lanes: Vec<Vec<bool>> = vec![vec![false; bars * steps_per_bar]; instruments.len()];
    for (offset, bar) in range.clone().enumerate() {
        let id = registry.bar_group(bar);
        let group = registry.group(id);
        let Some(map) = &lane_maps[id as usize] else {
            continue;
        };

        let start = offset * steps_per_bar;
        for (lane, row) in map.iter().enumerate() {
            let Some(source) = row.and_then(|row| group.grid.lane(row)) else {
                continue;
            };
            let len = source.len().min(steps_per_bar);
            lanes[lane][start..start + len].copy_from_slice(&source[..len]);
        }
    }

    let total_duration = bars as f64 * time_signature.seconds_per_bar(tempo);
    log::trace!(
        "compiled bars {}..{} at {tempo} bpm {time_signature}, {total_duration:.3}s",
        range.start,
        range.end
    );

    Ok(CombinedTimeline {
        grid: Grid::from_lanes(lanes.into_iter().map(Lane::from).collect()),
        instruments: instruments.to_vec(),
        tempo,
        time_signature,
        start_bar: range.start,
        bars,
        steps_per_bar,
        total_duration,
        revision: registry.revision(),
    })
}

/// Tempo and meter of the combined timeline under `options.policy`.
pub fn resolve_tempo(
    registry: &SyncGroupRegistry,
    options: &CompileOptions,
) -> (f64, TimeSignature) {
    match options.policy {
        TempoPolicy::TrackOverride => (options.track_tempo, options.track_time_signature),
        TempoPolicy::LastNonDefault => {
            let default_signature = TimeSignature::default();
            let mut tempo = DEFAULT_TEMPO;
            let mut time_signature = default_signature;
            for group in registry.groups() {
                if (group.tempo - DEFAULT_TEMPO).abs() > f64::EPSILON {
                    tempo = group.tempo;
                }
                if group.time_signature != default_signature {
                    time_signature = group.time_signature;
                }
            }
            (tempo, time_signature)
        }
    }
}

fn lane_map(group: &SyncGroup, instruments: &[Instrument]) -> Result<Vec<Option<usize>>, CompileError> {
    if let Some(stray) = group
        .instruments
        .iter()
        .find(|inst| !instruments.iter().any(|t| t.id == inst.id))
    {
        return Err(CompileError::UnknownInstrument {
            group: group.id,
            instrument: stray.id.clone(),
        });
    }

    Ok(instruments
        .iter()
        .map(|inst| group.instruments.iter().position(|g| g.id == inst.id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drumseq_transport::{default_instruments, drum_kit};

    fn setup() -> (SyncGroupRegistry, Vec<Instrument>) {
        let instruments = default_instruments();
        (SyncGroupRegistry::new(&instruments), instruments)
    }

    #[test]
    fn test_all_bars_on_a_tiles_group_a() {
        let (registry, instruments) = setup();
        let timeline = compile(&registry, &instruments, &CompileOptions::new(4)).unwrap();

        assert_eq!(timeline.grid.rows(), 8);
        assert_eq!(timeline.grid.columns(), 64);
        assert_eq!(timeline.total_steps(), 64);
        assert_eq!(timeline.grid, Grid::starter(8, 64));
        assert_eq!(timeline.total_duration, 8.0);
    }

    #[test]
    fn test_edited_group_applies_to_assigned_bars_only() {
        let (mut registry, instruments) = setup();
        for bar in 0..4 {
            registry.assign_bar(bar, SyncGroupId::B);
        }
        let edited = Grid::new(8, 16).toggled(5, 3).unwrap();
        registry.set_group_grid(SyncGroupId::B, edited.clone()).unwrap();

        let timeline = compile(&registry, &instruments, &CompileOptions::new(8)).unwrap();

        for bar in 0..4 {
            for lane in 0..8 {
                let slice = &timeline.grid.lane(lane).unwrap()[bar * 16..(bar + 1) * 16];
                assert_eq!(slice, edited.lane(lane).unwrap(), "bar {bar} lane {lane}");
            }
        }
        let starter = Grid::starter(8, 16);
        for bar in 4..8 {
            for lane in 0..8 {
                let slice = &timeline.grid.lane(lane).unwrap()[bar * 16..(bar + 1) * 16];
                assert_eq!(slice, starter.lane(lane).unwrap(), "bar {bar} lane {lane}");
            }
        }
    }

    #[test]
    fn test_lanes_align_by_instrument_id() {
        let (mut registry, instruments) = setup();
        // group B only carries snare then kick
        registry
            .set_group_instruments(
                SyncGroupId::B,
                vec![instruments[1].clone(), instruments[0].clone()],
            )
            .unwrap();
        registry.assign_bar(0, SyncGroupId::B);

        let timeline = compile(&registry, &instruments, &CompileOptions::new(1)).unwrap();

        assert_eq!(timeline.grid.get(0, 0), Some(true), "kick stays on lane 0");
        assert_eq!(timeline.grid.get(1, 4), Some(true), "snare stays on lane 1");
        assert_eq!(timeline.grid.get(2, 0), Some(false), "hat not in group B");
    }

    #[test]
    fn test_unknown_instrument_is_an_error() {
        let (mut registry, instruments) = setup();
        let mut group_instruments = instruments.clone();
        group_instruments[7] = drum_kit()[12].clone();
        registry
            .set_group_instruments(SyncGroupId::C, group_instruments)
            .unwrap();
        registry.assign_bar(1, SyncGroupId::C);

        let err = compile(&registry, &instruments, &CompileOptions::new(2)).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownInstrument {
                group: SyncGroupId::C,
                instrument: "rimshot".to_string()
            }
        );

        // bar 1 is outside this range, so group C is not consulted
        assert!(compile(&registry, &instruments, &CompileOptions::new(1)).is_ok());
    }

    #[test]
    fn test_last_non_default_tempo_wins() {
        let (mut registry, instruments) = setup();
        registry.set_group_tempo(SyncGroupId::B, 90.0).unwrap();
        registry.set_group_tempo(SyncGroupId::E, 140.0).unwrap();
        registry.set_group_time_signature(SyncGroupId::C, TimeSignature::new(3, 4));

        let timeline = compile(&registry, &instruments, &CompileOptions::new(2)).unwrap();

        assert_eq!(timeline.tempo, 140.0);
        assert_eq!(timeline.time_signature, TimeSignature::new(3, 4));
        assert_eq!(timeline.steps_per_bar, 12);
        // group A is still 16 steps wide; only the first 12 are used
        assert_eq!(timeline.grid.columns(), 24);
    }

    #[test]
    fn test_track_override_policy() {
        let (mut registry, instruments) = setup();
        registry.set_group_tempo(SyncGroupId::B, 90.0).unwrap();

        let options = CompileOptions {
            bars: 2,
            policy: TempoPolicy::TrackOverride,
            track_tempo: 100.0,
            track_time_signature: TimeSignature::default(),
        };
        let timeline = compile(&registry, &instruments, &options).unwrap();

        assert_eq!(timeline.tempo, 100.0);
        assert!((timeline.total_duration - 2.0 * 4.0 * 60.0 / 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_compile_range() {
        let (mut registry, instruments) = setup();
        registry.assign_bar(2, SyncGroupId::B);
        registry
            .set_group_grid(SyncGroupId::B, Grid::new(8, 16))
            .unwrap();

        let timeline =
            compile_range(&registry, &instruments, 2..4, &CompileOptions::new(32)).unwrap();

        assert_eq!(timeline.start_bar, 2);
        assert_eq!(timeline.bars, 2);
        assert_eq!(timeline.grid.columns(), 32);
        assert_eq!(timeline.grid.get(0, 0), Some(false), "bar 2 is blank group B");
        assert_eq!(timeline.grid.get(0, 16), Some(true), "bar 3 is group A");

        assert!(matches!(
            compile_range(&registry, &instruments, 3..3, &CompileOptions::new(1)),
            Err(CompileError::EmptyRange { .. })
        ));
    }

    #[test]
    fn test_notes_follow_active_cells() {
        let (registry, instruments) = setup();
        let timeline = compile(&registry, &instruments, &CompileOptions::new(1)).unwrap();
        let notes = timeline.notes();

        assert_eq!(notes.len(), 12);
        let first = &notes[0];
        assert_eq!(first.instrument_id, "kick");
        assert_eq!(first.pitch, 36);
        assert_eq!(first.time, 0.0);
        assert_eq!(first.duration, 0.125);
        assert_eq!(first.velocity, instruments[0].velocity);

        let snare = notes.iter().find(|n| n.instrument_id == "snare").unwrap();
        assert_eq!(snare.step, 4);
        assert_eq!(snare.time, 0.5);
    }
}
