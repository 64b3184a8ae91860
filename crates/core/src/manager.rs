//! Per-track orchestration: working state, sync groups, history, compiled
//! output caching and change events.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use drumseq_project::{ExportData, PatternData, SnapshotStore, TrackData};
use drumseq_transport::{
    DrumNote, Grid, Instrument, STARTER_BAR_STEPS, SyncGroupId, default_instruments,
};
use serde::Serialize;

use crate::compile::{CombinedTimeline, CompileOptions, compile, compile_range};
use crate::error::SequencerError;
use crate::events::{EventBus, TrackChange, TrackEvent};
use crate::history::{HistoryExport, HistoryItem, HistoryStack, HistoryStats, TrackSnapshot};
use crate::presets;
use crate::settings::Settings;
use crate::sync_groups::SyncGroupRegistry;
use crate::time::{DEFAULT_TEMPO, TimeSignature};
use crate::validate::{self, Violation, Violations};

fn parse_time_signature(value: &str) -> Result<TimeSignature, Violations> {
    value
        .parse()
        .map_err(|err| Violations::from(Violation::from(err)))
}

/// A saved one-bar pattern a track can switch to.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub grid: Grid,
    pub instruments: Vec<Instrument>,
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub sync_group: SyncGroupId,
}

impl Pattern {
    pub fn to_data(&self) -> PatternData {
        PatternData {
            id: self.id.clone(),
            name: self.name.clone(),
            grid: self.grid.clone(),
            instruments: self.instruments.clone(),
            tempo: self.tempo,
            time_signature: self.time_signature.to_string(),
            sync_group: self.sync_group,
        }
    }

    pub fn from_data(data: &PatternData) -> Result<Self, Violations> {
        Violations::check(validate::validate(
            &data.grid,
            &data.instruments,
            data.tempo,
            &data.time_signature,
        ))?;
        Ok(Self {
            id: data.id.clone(),
            name: data.name.clone(),
            grid: data.grid.clone(),
            instruments: data.instruments.clone(),
            tempo: data.tempo,
            time_signature: parse_time_signature(&data.time_signature)?,
            sync_group: data.sync_group,
        })
    }

    fn validate(&self) -> Result<(), Violations> {
        let mut violations = validate::validate_grid(&self.grid, &self.instruments);
        violations.extend(validate::validate_tempo(self.tempo));
        Violations::check(violations)
    }
}

/// Everything the manager owns for one track.
#[derive(Debug, Clone)]
pub struct DrumTrack {
    id: String,
    grid: Grid,
    instruments: Vec<Instrument>,
    tempo: f64,
    time_signature: TimeSignature,
    sync_groups: SyncGroupRegistry,
    history: HistoryStack<TrackSnapshot>,
    pattern_ids: Vec<String>,
    active_pattern_id: Option<String>,
    revision: u64,
}

impl DrumTrack {
    /// A blank one-bar grid over the default kit.
    fn new(id: &str, history_capacity: usize) -> Self {
        let instruments = default_instruments();
        Self {
            id: id.to_string(),
            grid: Grid::new(instruments.len(), STARTER_BAR_STEPS),
            sync_groups: SyncGroupRegistry::new(&instruments),
            instruments,
            tempo: DEFAULT_TEMPO,
            time_signature: TimeSignature::default(),
            history: HistoryStack::new(history_capacity),
            pattern_ids: Vec::new(),
            active_pattern_id: None,
            revision: 0,
        }
    }

    fn from_data(data: &TrackData, history_capacity: usize) -> Result<Self, SequencerError> {
        Violations::check(validate::validate(
            &data.grid,
            &data.instruments,
            data.tempo,
            &data.time_signature,
        ))?;
        let time_signature = parse_time_signature(&data.time_signature)?;

        let sync_groups = SyncGroupRegistry::from_data(
            &data.instruments,
            &data.sync_groups_data,
            &data.bar_sync_groups,
        )?;
        for group in sync_groups.groups() {
            Violations::check(validate::validate_subset(&group.instruments, &data.instruments))?;
        }

        Ok(Self {
            id: data.track_id.clone(),
            grid: data.grid.clone(),
            instruments: data.instruments.clone(),
            tempo: data.tempo,
            time_signature,
            sync_groups,
            history: HistoryStack::new(history_capacity),
            pattern_ids: data.pattern_ids.clone(),
            active_pattern_id: data.active_pattern_id.clone(),
            revision: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    pub fn sync_groups(&self) -> &SyncGroupRegistry {
        &self.sync_groups
    }

    pub fn history(&self) -> &HistoryStack<TrackSnapshot> {
        &self.history
    }

    pub fn pattern_ids(&self) -> &[String] {
        &self.pattern_ids
    }

    pub fn active_pattern_id(&self) -> Option<&str> {
        self.active_pattern_id.as_deref()
    }

    /// Bumped on every accepted mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            grid: self.grid.clone(),
            instruments: self.instruments.clone(),
            tempo: self.tempo,
            time_signature: self.time_signature,
            bar_sync_groups: self.sync_groups.assignments().clone(),
        }
    }

    pub fn to_data(&self) -> TrackData {
        let (sync_groups_data, bar_sync_groups) = self.sync_groups.to_data();
        TrackData {
            track_id: self.id.clone(),
            grid: self.grid.clone(),
            instruments: self.instruments.clone(),
            tempo: self.tempo,
            time_signature: self.time_signature.to_string(),
            sync_groups_data,
            bar_sync_groups,
            pattern_ids: self.pattern_ids.clone(),
            active_pattern_id: self.active_pattern_id.clone(),
        }
    }

    fn compile_options(&self, bars: usize, settings: &Settings) -> CompileOptions {
        CompileOptions {
            bars,
            policy: settings.tempo_policy,
            track_tempo: self.tempo,
            track_time_signature: self.time_signature,
        }
    }

    fn record(&mut self, description: impl Into<String>) {
        let snapshot = self.snapshot();
        self.history.push(snapshot, description);
    }

    /// Groups re-aligned to a new track instrument list. Groups drop
    /// instruments the track no longer has and pick up ones it gained. A
    /// group left with nothing takes the whole new list on a blank grid.
    fn realigned_groups(&self, instruments: &[Instrument]) -> Result<SyncGroupRegistry, SequencerError> {
        let mut groups = self.sync_groups.clone();

        for id in SyncGroupId::ALL {
            let group = groups.group(id);
            let mut kept: Vec<Instrument> = group
                .instruments
                .iter()
                .filter_map(|inst| instruments.iter().find(|t| t.id == inst.id))
                .cloned()
                .collect();

            if kept.is_empty() {
                log::debug!("{}: sync group {id} lost all its instruments, starting it blank", self.id);
                kept = instruments.to_vec();
            } else {
                let added: Vec<Instrument> = instruments
                    .iter()
                    .filter(|inst| {
                        !self.instruments.iter().any(|p| p.id == inst.id)
                            && !kept.iter().any(|k| k.id == inst.id)
                    })
                    .cloned()
                    .collect();
                kept.extend(added);
            }

            if kept != group.instruments {
                groups.set_group_instruments(id, kept)?;
            }
        }
        Ok(groups)
    }

    /// Swap in a new instrument list. Nothing changes unless every group
    /// can follow.
    fn replace_instruments(&mut self, instruments: Vec<Instrument>) -> Result<(), SequencerError> {
        self.sync_groups = self.realigned_groups(&instruments)?;
        self.instruments = instruments;
        Ok(())
    }

    fn restore(&mut self, snapshot: TrackSnapshot) -> Result<(), SequencerError> {
        let mut sync_groups = if snapshot.instruments != self.instruments {
            self.realigned_groups(&snapshot.instruments)?
        } else {
            self.sync_groups.clone()
        };
        if &snapshot.bar_sync_groups != sync_groups.assignments() {
            sync_groups.set_assignments(snapshot.bar_sync_groups);
        }

        self.sync_groups = sync_groups;
        self.instruments = snapshot.instruments;
        self.grid = snapshot.grid;
        self.tempo = snapshot.tempo;
        self.time_signature = snapshot.time_signature;
        Ok(())
    }

    fn check_grid(&self, grid: &Grid) -> Result<(), Violations> {
        Violations::check(validate::validate_grid(grid, &self.instruments))
    }
}

/// Compiled output handed to playback.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackData {
    pub timeline: Arc<CombinedTimeline>,
    pub notes: Arc<[DrumNote]>,
}

impl PlaybackData {
    pub fn grid(&self) -> &Grid {
        &self.timeline.grid
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.timeline.instruments
    }

    pub fn tempo(&self) -> f64 {
        self.timeline.tempo
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.timeline.time_signature
    }

    pub fn total_duration(&self) -> f64 {
        self.timeline.total_duration
    }

    pub fn total_bars(&self) -> usize {
        self.timeline.bars
    }

    pub fn total_steps(&self) -> usize {
        self.timeline.total_steps()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedStats {
    pub total_bars: usize,
    pub total_steps: usize,
    pub total_duration: f64,
    pub cell_count: usize,
    pub tempo: f64,
    pub time_signature: String,
    pub instruments_count: usize,
    pub sync_groups_used: BTreeSet<SyncGroupId>,
    pub last_modified: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncGroupStats {
    pub name: String,
    pub cell_count: usize,
    pub last_modified: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub total_tracks: usize,
    pub active_tracks: usize,
    pub total_patterns: usize,
    pub listeners: usize,
    pub cached_timelines: usize,
}

type CacheKey = (String, usize, u64);

/// Owner of every drum track.
///
/// Each mutation is validated before anything changes; a rejected one is
/// logged and leaves the track untouched.
#[derive(Debug, Default)]
pub struct DrumTrackManager {
    tracks: BTreeMap<String, DrumTrack>,
    patterns: BTreeMap<String, Pattern>,
    active_tracks: BTreeSet<String>,
    cache: HashMap<CacheKey, Arc<PlaybackData>>,
    events: EventBus,
    settings: Settings,
}

impl DrumTrackManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // Tracks

    pub fn create_track(&mut self, track_id: &str) -> Result<&DrumTrack, SequencerError> {
        let track = DrumTrack::new(track_id, self.settings.history_capacity);
        self.insert_new(track)
    }

    /// New track whose working grid and group A start from a built-in beat.
    pub fn create_track_from_preset(
        &mut self,
        track_id: &str,
        preset: &str,
    ) -> Result<&DrumTrack, SequencerError> {
        let Some(preset) = presets::preset(preset) else {
            log::warn!("unknown preset '{preset}' for new track {track_id}");
            return Err(SequencerError::PresetNotFound(preset.to_string()));
        };

        let mut track = DrumTrack::new(track_id, self.settings.history_capacity);
        track.grid = preset.grid(&track.instruments);
        track
            .sync_groups
            .set_group_grid(SyncGroupId::DEFAULT, preset.grid(&track.instruments))?;

        let pattern = Pattern {
            id: format!("preset-{}-{track_id}", preset.id),
            name: preset.name.to_string(),
            grid: track.grid.clone(),
            instruments: track.instruments.clone(),
            tempo: track.tempo,
            time_signature: track.time_signature,
            sync_group: SyncGroupId::DEFAULT,
        };
        track.pattern_ids.push(pattern.id.clone());
        track.active_pattern_id = Some(pattern.id.clone());

        if self.tracks.contains_key(track_id) {
            return Err(SequencerError::TrackExists(track_id.to_string()));
        }
        self.patterns.insert(pattern.id.clone(), pattern);
        self.insert_new(track)
    }

    /// Remove a track with its patterns and cached output.
    pub fn delete_track(&mut self, track_id: &str) -> Result<(), SequencerError> {
        let track = self
            .tracks
            .remove(track_id)
            .ok_or_else(|| SequencerError::TrackNotFound(track_id.to_string()))?;

        self.active_tracks.remove(track_id);
        for pattern_id in &track.pattern_ids {
            self.patterns.remove(pattern_id);
        }
        self.invalidate(track_id);

        log::info!("deleted drum track {track_id}");
        self.events.emit(&TrackEvent::TrackDeleted {
            track_id: track_id.to_string(),
        });
        Ok(())
    }

    pub fn set_track_active(&mut self, track_id: &str, active: bool) -> Result<(), SequencerError> {
        self.track(track_id)?;
        let changed = if active {
            self.active_tracks.insert(track_id.to_string())
        } else {
            self.active_tracks.remove(track_id)
        };
        if changed {
            self.events.emit(&TrackEvent::TrackActiveChanged {
                track_id: track_id.to_string(),
                active,
            });
        }
        Ok(())
    }

    /// Drop every track and pattern. Subscriptions stay.
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.patterns.clear();
        self.active_tracks.clear();
        self.cache.clear();
        log::debug!("drum track manager cleared");
    }

    // Working state

    pub fn toggle_cell(&mut self, track_id: &str, row: usize, col: usize) -> Result<bool, SequencerError> {
        let value = self.mutate(track_id, "toggle cell", |track| {
            let grid = track
                .grid
                .toggled(row, col)
                .ok_or(SequencerError::CellOutOfRange { row, col })?;
            let value = grid.get(row, col).unwrap_or(false);
            track.grid = grid;
            track.record(format!("Toggle cell ({row}, {col})"));
            Ok(value)
        })?;
        self.emit_updated(track_id, TrackChange::Grid);
        Ok(value)
    }

    pub fn set_grid(&mut self, track_id: &str, grid: Grid) -> Result<(), SequencerError> {
        self.mutate(track_id, "set grid", |track| {
            track.check_grid(&grid)?;
            track.grid = grid;
            track.record("Update grid");
            Ok(())
        })?;
        self.emit_updated(track_id, TrackChange::Grid);
        Ok(())
    }

    /// Replace the instrument list. Lanes follow their instrument id; new
    /// instruments start silent.
    pub fn set_instruments(
        &mut self,
        track_id: &str,
        instruments: Vec<Instrument>,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "set instruments", |track| {
            Violations::check(validate::validate_instruments(&instruments))?;
            let grid = track.grid.remapped(&track.instruments, &instruments);
            track.replace_instruments(instruments)?;
            track.grid = grid;
            track.record("Update instruments");
            Ok(())
        })?;
        self.emit_updated(track_id, TrackChange::Instruments);
        self.emit_combined(track_id);
        Ok(())
    }

    pub fn set_tempo(&mut self, track_id: &str, tempo: f64) -> Result<(), SequencerError> {
        self.mutate(track_id, "set tempo", |track| {
            if let Some(violation) = validate::validate_tempo(tempo) {
                return Err(Violations::from(violation).into());
            }
            track.tempo = tempo;
            track.record(format!("Set tempo to {tempo}"));
            Ok(())
        })?;
        self.emit_updated(track_id, TrackChange::Tempo);
        self.emit_combined(track_id);
        Ok(())
    }

    /// Change the meter. The working grid keeps its bar count and each bar
    /// is resized to the new step count.
    pub fn set_time_signature(&mut self, track_id: &str, time_signature: &str) -> Result<(), SequencerError> {
        self.mutate(track_id, "set time signature", |track| {
            let time_signature = parse_time_signature(time_signature)?;
            let bars = (track.grid.columns() / track.time_signature.steps_per_bar().max(1)).max(1);
            track.grid = track.grid.with_columns(bars * time_signature.steps_per_bar());
            track.time_signature = time_signature;
            track.record(format!("Set time signature to {time_signature}"));
            Ok(())
        })?;
        self.emit_updated(track_id, TrackChange::TimeSignature);
        self.emit_combined(track_id);
        Ok(())
    }

    // Sync groups

    pub fn set_bar_sync_group(
        &mut self,
        track_id: &str,
        bar: usize,
        group: SyncGroupId,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "assign bar", |track| {
            track.sync_groups.assign_bar(bar, group);
            track.record(format!("Assign bar {} to {}", bar + 1, group.display_name()));
            Ok(())
        })?;
        self.events.emit(&TrackEvent::BarSyncGroupChanged {
            track_id: track_id.to_string(),
            bar,
            group,
        });
        self.emit_combined(track_id);
        Ok(())
    }

    pub fn update_sync_group_grid(
        &mut self,
        track_id: &str,
        group: SyncGroupId,
        grid: Grid,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "update sync group grid", |track| {
            Ok(track.sync_groups.set_group_grid(group, grid)?)
        })?;
        self.emit_group_updated(track_id, group);
        Ok(())
    }

    /// Group instruments must all be on the track.
    pub fn update_sync_group_instruments(
        &mut self,
        track_id: &str,
        group: SyncGroupId,
        instruments: Vec<Instrument>,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "update sync group instruments", |track| {
            Violations::check(validate::validate_subset(&instruments, &track.instruments))?;
            Ok(track.sync_groups.set_group_instruments(group, instruments)?)
        })?;
        self.emit_group_updated(track_id, group);
        Ok(())
    }

    pub fn update_sync_group_tempo(
        &mut self,
        track_id: &str,
        group: SyncGroupId,
        tempo: f64,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "update sync group tempo", |track| {
            Ok(track.sync_groups.set_group_tempo(group, tempo)?)
        })?;
        self.emit_group_updated(track_id, group);
        Ok(())
    }

    pub fn update_sync_group_time_signature(
        &mut self,
        track_id: &str,
        group: SyncGroupId,
        time_signature: &str,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "update sync group time signature", |track| {
            let time_signature = parse_time_signature(time_signature)?;
            track.sync_groups.set_group_time_signature(group, time_signature);
            Ok(())
        })?;
        self.emit_group_updated(track_id, group);
        Ok(())
    }

    pub fn reset_sync_group(&mut self, track_id: &str, group: SyncGroupId) -> Result<(), SequencerError> {
        self.mutate(track_id, "reset sync group", |track| {
            track.sync_groups.reset_group(group, &track.instruments);
            Ok(())
        })?;
        self.events.emit(&TrackEvent::SyncGroupReset {
            track_id: track_id.to_string(),
            group,
        });
        self.emit_combined(track_id);
        Ok(())
    }

    pub fn copy_sync_group(
        &mut self,
        track_id: &str,
        from: SyncGroupId,
        to: SyncGroupId,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "copy sync group", |track| {
            track.sync_groups.copy_group(from, to);
            Ok(())
        })?;
        self.events.emit(&TrackEvent::SyncGroupCopied {
            track_id: track_id.to_string(),
            from,
            to,
        });
        self.emit_combined(track_id);
        Ok(())
    }

    // Patterns

    /// Lay a built-in beat onto the working grid and group A.
    pub fn apply_preset(&mut self, track_id: &str, preset: &str) -> Result<(), SequencerError> {
        let Some(preset) = presets::preset(preset) else {
            log::warn!("unknown preset '{preset}' for track {track_id}");
            return Err(SequencerError::PresetNotFound(preset.to_string()));
        };

        self.mutate(track_id, "apply preset", |track| {
            let grid = preset.grid(&track.instruments).with_columns(track.grid.columns());
            let group = track.sync_groups.group(SyncGroupId::DEFAULT);
            let group_grid = preset
                .grid(&group.instruments)
                .with_columns(group.time_signature.steps_per_bar());

            track.sync_groups.set_group_grid(SyncGroupId::DEFAULT, group_grid)?;
            track.grid = grid;
            track.record(format!("Apply preset {}", preset.name));
            Ok(())
        })?;
        self.emit_updated(track_id, TrackChange::Pattern);
        self.emit_combined(track_id);
        Ok(())
    }

    /// Register a pattern on the track and mark it active.
    pub fn add_pattern(&mut self, track_id: &str, pattern: Pattern) -> Result<(), SequencerError> {
        let pattern_id = pattern.id.clone();
        self.mutate(track_id, "add pattern", |track| {
            pattern.validate()?;
            if !track.pattern_ids.contains(&pattern.id) {
                track.pattern_ids.push(pattern.id.clone());
            }
            track.active_pattern_id = Some(pattern.id.clone());
            Ok(())
        })?;
        self.patterns.insert(pattern_id, pattern);
        self.emit_updated(track_id, TrackChange::Pattern);
        Ok(())
    }

    /// Load one of the track's patterns into its working state.
    pub fn set_active_pattern(&mut self, track_id: &str, pattern_id: &str) -> Result<(), SequencerError> {
        let pattern = self
            .patterns
            .get(pattern_id)
            .filter(|_| {
                self.tracks
                    .get(track_id)
                    .is_some_and(|t| t.pattern_ids.iter().any(|id| id == pattern_id))
            })
            .cloned();

        self.mutate(track_id, "set active pattern", |track| {
            let pattern =
                pattern.ok_or_else(|| SequencerError::PatternNotFound(pattern_id.to_string()))?;
            pattern.validate()?;

            if pattern.instruments != track.instruments {
                track.replace_instruments(pattern.instruments.clone())?;
            }
            track.grid = pattern.grid.clone();
            track.tempo = pattern.tempo;
            track.time_signature = pattern.time_signature;
            track.active_pattern_id = Some(pattern.id.clone());
            track.record(format!("Load pattern {}", pattern.name));
            Ok(())
        })?;
        self.emit_updated(track_id, TrackChange::Pattern);
        self.emit_combined(track_id);
        Ok(())
    }

    pub fn pattern(&self, pattern_id: &str) -> Option<&Pattern> {
        self.patterns.get(pattern_id)
    }

    // History

    /// Step back one edit. `Ok(false)` at the oldest entry.
    pub fn undo(&mut self, track_id: &str) -> Result<bool, SequencerError> {
        self.step_history(track_id, "undo", |history| history.undo().cloned())
    }

    /// Step forward one edit. `Ok(false)` at the newest entry.
    pub fn redo(&mut self, track_id: &str) -> Result<bool, SequencerError> {
        self.step_history(track_id, "redo", |history| history.redo().cloned())
    }

    pub fn jump_to_history(&mut self, track_id: &str, index: usize) -> Result<(), SequencerError> {
        let moved = self.step_history(track_id, "jump to history", |history| {
            history.jump_to(index).cloned()
        })?;
        if moved {
            Ok(())
        } else {
            Err(SequencerError::HistoryIndex(index))
        }
    }

    pub fn history_info(&self, track_id: &str) -> Result<HistoryStats, SequencerError> {
        Ok(self.track(track_id)?.history.stats())
    }

    pub fn history_details(&self, track_id: &str) -> Result<Vec<HistoryItem>, SequencerError> {
        Ok(self.track(track_id)?.history.details())
    }

    pub fn search_history(&self, track_id: &str, query: &str) -> Result<Vec<HistoryItem>, SequencerError> {
        Ok(self.track(track_id)?.history.search(query))
    }

    pub fn export_history(&self, track_id: &str) -> Result<HistoryExport<TrackSnapshot>, SequencerError> {
        Ok(self.track(track_id)?.history.export())
    }

    /// Replace the track's history. The working state is left as is.
    pub fn import_history(
        &mut self,
        track_id: &str,
        export: HistoryExport<TrackSnapshot>,
    ) -> Result<(), SequencerError> {
        self.mutate(track_id, "import history", |track| {
            let mut history = track.history.clone();
            history.import(export)?;
            track.history = history;
            Ok(())
        })?;
        self.emit_updated(track_id, TrackChange::History);
        Ok(())
    }

    // Queries

    pub fn track(&self, track_id: &str) -> Result<&DrumTrack, SequencerError> {
        self.tracks
            .get(track_id)
            .ok_or_else(|| SequencerError::TrackNotFound(track_id.to_string()))
    }

    pub fn tracks(&self) -> impl Iterator<Item = &DrumTrack> {
        self.tracks.values()
    }

    pub fn active_tracks(&self) -> impl Iterator<Item = &DrumTrack> {
        self.active_tracks.iter().filter_map(|id| self.tracks.get(id))
    }

    pub fn is_active(&self, track_id: &str) -> bool {
        self.active_tracks.contains(track_id)
    }

    /// Compiled timeline for bars `0..bars` (the configured default when
    /// `None`). Repeated calls between edits return the same `Arc`.
    pub fn get_playback_data(
        &mut self,
        track_id: &str,
        bars: Option<usize>,
    ) -> Result<Arc<PlaybackData>, SequencerError> {
        let bars = bars.unwrap_or(self.settings.default_bars);
        let track = self.track(track_id)?;
        let key = (track_id.to_string(), bars, track.revision);

        if let Some(data) = self.cache.get(&key) {
            return Ok(Arc::clone(data));
        }

        let options = track.compile_options(bars, &self.settings);
        let timeline = compile(&track.sync_groups, &track.instruments, &options)?;
        let data = Arc::new(PlaybackData {
            notes: timeline.notes().into(),
            timeline: Arc::new(timeline),
        });

        log::debug!(
            "compiled {track_id}: {bars} bars, {} notes, {:.2}s",
            data.notes.len(),
            data.total_duration()
        );
        self.cache.insert(key, Arc::clone(&data));
        Ok(data)
    }

    pub fn get_combined_stats(
        &mut self,
        track_id: &str,
        bars: Option<usize>,
    ) -> Result<CombinedStats, SequencerError> {
        let data = self.get_playback_data(track_id, bars)?;
        let track = self.track(track_id)?;
        let timeline = &data.timeline;

        Ok(CombinedStats {
            total_bars: timeline.bars,
            total_steps: timeline.total_steps(),
            total_duration: timeline.total_duration,
            cell_count: timeline.cell_count(),
            tempo: timeline.tempo,
            time_signature: timeline.time_signature.to_string(),
            instruments_count: timeline.instruments.len(),
            sync_groups_used: track.sync_groups.groups_used(timeline.bars),
            last_modified: track.revision,
        })
    }

    pub fn get_bar_sync_group(&self, track_id: &str, bar: usize) -> Result<SyncGroupId, SequencerError> {
        Ok(self.track(track_id)?.sync_groups.bar_group(bar))
    }

    pub fn get_sync_group_stats(
        &self,
        track_id: &str,
    ) -> Result<BTreeMap<SyncGroupId, SyncGroupStats>, SequencerError> {
        let track = self.track(track_id)?;
        Ok(track
            .sync_groups
            .groups()
            .map(|group| {
                (
                    group.id,
                    SyncGroupStats {
                        name: group.name.clone(),
                        cell_count: group.cell_count(),
                        last_modified: group.last_modified,
                    },
                )
            })
            .collect())
    }

    /// Combined grid of bars `start..end`.
    pub fn get_grid_for_bar_range(
        &self,
        track_id: &str,
        start: usize,
        end: usize,
    ) -> Result<Grid, SequencerError> {
        let track = self.track(track_id)?;
        let options = track.compile_options(end, &self.settings);
        Ok(compile_range(&track.sync_groups, &track.instruments, start..end, &options)?.grid)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            total_tracks: self.tracks.len(),
            active_tracks: self.active_tracks.len(),
            total_patterns: self.patterns.len(),
            listeners: self.events.listener_count(),
            cached_timelines: self.cache.len(),
        }
    }

    // Serialization

    pub fn export_data(&self) -> ExportData {
        ExportData::new(
            self.tracks.values().map(DrumTrack::to_data).collect(),
            self.patterns.values().map(Pattern::to_data).collect(),
            self.active_tracks.iter().cloned().collect(),
        )
    }

    /// Replace every track and pattern with `data`. Nothing changes unless
    /// the whole bundle is valid. Returns the number of tracks loaded.
    pub fn import_data(&mut self, data: &ExportData) -> Result<usize, SequencerError> {
        let staged = self.stage_import(data).inspect_err(|err| {
            log::warn!("import rejected: {err}");
        })?;
        let (tracks, patterns) = staged;

        self.tracks = tracks;
        self.patterns = patterns;
        self.active_tracks = data
            .active_tracks
            .iter()
            .filter(|id| self.tracks.contains_key(*id))
            .cloned()
            .collect();
        self.cache.clear();

        let count = self.tracks.len();
        log::info!("imported {count} drum tracks");
        self.events.emit(&TrackEvent::DataImported { tracks: count });
        Ok(count)
    }

    pub fn save_track(&self, track_id: &str, store: &dyn SnapshotStore) -> Result<(), SequencerError> {
        let data = self.track(track_id)?.to_data();
        drumseq_project::save_track(store, &data)?;
        log::debug!("saved snapshot of {track_id}");
        Ok(())
    }

    /// Restore a track from `store`, creating it if needed. `Ok(false)` if
    /// the store has nothing for it.
    pub fn load_track(&mut self, track_id: &str, store: &dyn SnapshotStore) -> Result<bool, SequencerError> {
        let Some(data) = drumseq_project::load_track(store, track_id)? else {
            return Ok(false);
        };

        let mut track = DrumTrack::from_data(&data, self.settings.history_capacity)
            .inspect_err(|err| log::warn!("snapshot of {track_id} rejected: {err}"))?;
        track.id = track_id.to_string();

        match self.tracks.get_mut(track_id) {
            Some(existing) => {
                track.revision = existing.revision + 1;
                *existing = track;
                self.invalidate(track_id);
                self.emit_updated(track_id, TrackChange::Restored);
                self.emit_combined(track_id);
            }
            None => {
                self.insert_new(track)?;
            }
        }
        Ok(true)
    }

    fn stage_import(
        &self,
        data: &ExportData,
    ) -> Result<(BTreeMap<String, DrumTrack>, BTreeMap<String, Pattern>), SequencerError> {
        data.check_version()?;

        let mut tracks = BTreeMap::new();
        for track_data in &data.tracks {
            let track = DrumTrack::from_data(track_data, self.settings.history_capacity)?;
            if tracks.insert(track.id.clone(), track).is_some() {
                return Err(SequencerError::TrackExists(track_data.track_id.clone()));
            }
        }

        let patterns = data
            .patterns
            .iter()
            .map(|p| Ok((p.id.clone(), Pattern::from_data(p)?)))
            .collect::<Result<BTreeMap<_, _>, Violations>>()?;

        Ok((tracks, patterns))
    }

    fn insert_new(&mut self, track: DrumTrack) -> Result<&DrumTrack, SequencerError> {
        let id = track.id.clone();
        if self.tracks.contains_key(&id) {
            log::warn!("drum track {id} already exists");
            return Err(SequencerError::TrackExists(id));
        }

        self.tracks.insert(id.clone(), track);
        self.active_tracks.insert(id.clone());
        log::info!("created drum track {id}");
        self.events.emit(&TrackEvent::TrackCreated {
            track_id: id.clone(),
        });
        self.track(&id)
    }

    /// Run a validated edit on one track. `op` must not change anything
    /// before it has validated its input.
    fn mutate<R>(
        &mut self,
        track_id: &str,
        op: &str,
        op_fn: impl FnOnce(&mut DrumTrack) -> Result<R, SequencerError>,
    ) -> Result<R, SequencerError> {
        let Some(track) = self.tracks.get_mut(track_id) else {
            log::warn!("{op}: drum track not found: {track_id}");
            return Err(SequencerError::TrackNotFound(track_id.to_string()));
        };

        // Edits run on a draft so a rejected one leaves no partial writes.
        let mut draft = track.clone();
        match op_fn(&mut draft) {
            Ok(value) => {
                draft.revision += 1;
                *track = draft;
                self.invalidate(track_id);
                Ok(value)
            }
            Err(err) => {
                log::warn!("{op} rejected for {track_id}: {err}");
                Err(err)
            }
        }
    }

    fn step_history(
        &mut self,
        track_id: &str,
        op: &str,
        step: impl FnOnce(&mut HistoryStack<TrackSnapshot>) -> Option<TrackSnapshot>,
    ) -> Result<bool, SequencerError> {
        let moved = self.mutate(track_id, op, |track| {
            let mut history = track.history.clone();
            let Some(snapshot) = step(&mut history) else {
                return Ok(false);
            };
            track.restore(snapshot)?;
            track.history = history;
            Ok(true)
        })?;
        if moved {
            self.emit_updated(track_id, TrackChange::History);
            self.emit_combined(track_id);
        }
        Ok(moved)
    }

    fn invalidate(&mut self, track_id: &str) {
        self.cache.retain(|(id, _, _), _| id != track_id);
    }

    fn emit_updated(&self, track_id: &str, change: TrackChange) {
        self.events.emit(&TrackEvent::TrackUpdated {
            track_id: track_id.to_string(),
            change,
        });
    }

    fn emit_group_updated(&self, track_id: &str, group: SyncGroupId) {
        self.events.emit(&TrackEvent::SyncGroupUpdated {
            track_id: track_id.to_string(),
            group,
        });
        self.emit_combined(track_id);
    }

    fn emit_combined(&self, track_id: &str) {
        let revision = self.tracks.get(track_id).map_or(0, DrumTrack::revision);
        self.events.emit(&TrackEvent::CombinedDataUpdated {
            track_id: track_id.to_string(),
            revision,
        });
    }
}
