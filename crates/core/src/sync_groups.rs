use std::collections::{BTreeMap, BTreeSet};

use drumseq_project::SyncGroupData;
use drumseq_transport::{Grid, Instrument, SyncGroupId};

use crate::time::{DEFAULT_TEMPO, TimeSignature};
use crate::validate::{self, Violation, Violations};

/// A reusable one-bar pattern that any number of bars can follow.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncGroup {
    pub id: SyncGroupId,
    pub name: String,
    pub grid: Grid,
    pub instruments: Vec<Instrument>,
    pub tempo: f64,
    pub time_signature: TimeSignature,
    /// Registry revision of the last write to this group.
    pub last_modified: u64,
}

impl SyncGroup {
    /// Group seeded with the starter beat.
    pub fn new(id: SyncGroupId, instruments: &[Instrument]) -> Self {
        let time_signature = TimeSignature::default();
        Self {
            id,
            name: id.display_name(),
            grid: Grid::starter(instruments.len(), time_signature.steps_per_bar()),
            instruments: instruments.to_vec(),
            tempo: DEFAULT_TEMPO,
            time_signature,
            last_modified: 0,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.grid.cell_count()
    }

    pub fn to_data(&self) -> SyncGroupData {
        SyncGroupData {
            grid: self.grid.clone(),
            instruments: self.instruments.clone(),
            tempo: self.tempo,
            time_signature: self.time_signature.to_string(),
        }
    }

    fn check_grid(&self, grid: &Grid) -> Vec<Violation> {
        let mut violations = validate::validate_grid(grid, &self.instruments);
        let expected = self.time_signature.steps_per_bar();
        if grid.columns() != expected {
            violations.push(Violation::StepCountMismatch {
                expected,
                actual: grid.columns(),
            });
        }
        violations
    }
}

/// The six sync groups of a track plus the bar → group assignment.
///
/// Every write bumps [`SyncGroupRegistry::revision`], so anything compiled
/// from an older revision is known to be stale.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncGroupRegistry {
    groups: [SyncGroup; 6],
    bars: BTreeMap<usize, SyncGroupId>,
    revision: u64,
}

impl SyncGroupRegistry {
    pub fn new(instruments: &[Instrument]) -> Self {
        Self {
            groups: SyncGroupId::ALL.map(|id| SyncGroup::new(id, instruments)),
            bars: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn group(&self, id: SyncGroupId) -> &SyncGroup {
        &self.groups[id as usize]
    }

    pub fn groups(&self) -> impl Iterator<Item = &SyncGroup> {
        self.groups.iter()
    }

    pub fn group_grid(&self, id: SyncGroupId) -> &Grid {
        &self.group(id).grid
    }

    pub fn set_group_grid(&mut self, id: SyncGroupId, grid: Grid) -> Result<(), Violations> {
        Violations::check(self.group(id).check_grid(&grid))?;
        self.touch(id).grid = grid;
        Ok(())
    }

    /// Replace the group's instrument list, carrying lanes over by id.
    pub fn set_group_instruments(
        &mut self,
        id: SyncGroupId,
        instruments: Vec<Instrument>,
    ) -> Result<(), Violations> {
        Violations::check(validate::validate_instruments(&instruments))?;
        let group = self.touch(id);
        group.grid = group.grid.remapped(&group.instruments, &instruments);
        group.instruments = instruments;
        Ok(())
    }

    pub fn set_group_tempo(&mut self, id: SyncGroupId, tempo: f64) -> Result<(), Violations> {
        if let Some(violation) = validate::validate_tempo(tempo) {
            return Err(violation.into());
        }
        self.touch(id).tempo = tempo;
        Ok(())
    }

    /// Change the group's meter; its one-bar grid is cut or padded to fit.
    pub fn set_group_time_signature(&mut self, id: SyncGroupId, time_signature: TimeSignature) {
        let group = self.touch(id);
        group.grid = group.grid.with_columns(time_signature.steps_per_bar());
        group.time_signature = time_signature;
    }

    /// Restore the group to the starter beat on `instruments`.
    pub fn reset_group(&mut self, id: SyncGroupId, instruments: &[Instrument]) {
        let revision = self.bump();
        let mut fresh = SyncGroup::new(id, instruments);
        fresh.last_modified = revision;
        self.groups[id as usize] = fresh;
    }

    /// Copy grid, instruments, tempo and meter of `from` into `to`.
    pub fn copy_group(&mut self, from: SyncGroupId, to: SyncGroupId) {
        let source = self.group(from).clone();
        let target = self.touch(to);
        target.grid = source.grid;
        target.instruments = source.instruments;
        target.tempo = source.tempo;
        target.time_signature = source.time_signature;
    }

    pub fn assign_bar(&mut self, bar: usize, id: SyncGroupId) {
        self.bump();
        self.bars.insert(bar, id);
    }

    /// Group a bar follows; unassigned bars follow the default group.
    pub fn bar_group(&self, bar: usize) -> SyncGroupId {
        self.bars.get(&bar).copied().unwrap_or(SyncGroupId::DEFAULT)
    }

    pub fn assignments(&self) -> &BTreeMap<usize, SyncGroupId> {
        &self.bars
    }

    pub fn set_assignments(&mut self, bars: BTreeMap<usize, SyncGroupId>) {
        self.bump();
        self.bars = bars;
    }

    /// Distinct groups followed by bars `0..bars`.
    pub fn groups_used(&self, bars: usize) -> BTreeSet<SyncGroupId> {
        (0..bars).map(|bar| self.bar_group(bar)).collect()
    }

    pub fn cell_count(&self, id: SyncGroupId) -> usize {
        self.group(id).cell_count()
    }

    /// Persisted form: one entry per group plus `[bar, group]` pairs.
    pub fn to_data(&self) -> (BTreeMap<SyncGroupId, SyncGroupData>, Vec<(usize, SyncGroupId)>) {
        let groups = self.groups.iter().map(|g| (g.id, g.to_data())).collect();
        let bars = self.bars.iter().map(|(&bar, &id)| (bar, id)).collect();
        (groups, bars)
    }

    /// Rebuild from persisted data. Groups missing from `groups` start from
    /// the starter beat on `instruments`.
    pub fn from_data(
        instruments: &[Instrument],
        groups: &BTreeMap<SyncGroupId, SyncGroupData>,
        bars: &[(usize, SyncGroupId)],
    ) -> Result<Self, Violations> {
        let mut registry = Self::new(instruments);

        for (&id, data) in groups {
            let time_signature: TimeSignature = data
                .time_signature
                .parse()
                .map_err(|err| Violations::from(Violation::from(err)))?;

            Violations::check(validate::validate_instruments(&data.instruments))?;

            let group = &mut registry.groups[id as usize];
            group.instruments = data.instruments.clone();
            group.time_signature = time_signature;
            if let Some(violation) = validate::validate_tempo(data.tempo) {
                return Err(violation.into());
            }
            group.tempo = data.tempo;

            Violations::check(group.check_grid(&data.grid))?;
            group.grid = data.grid.clone();
        }

        registry.bars = bars.iter().copied().collect();
        Ok(registry)
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn touch(&mut self, id: SyncGroupId) -> &mut SyncGroup {
        let revision = self.bump();
        let group = &mut self.groups[id as usize];
        group.last_modified = revision;
        group
    }
}
