use std::collections::HashSet;

use drumseq_transport::{Grid, Instrument};

use crate::time::{TimeSignature, TimeSignatureError};

/// One reason a grid, instrument list, tempo or meter was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("grid is empty")]
    EmptyGrid,

    #[error("row {row} has {actual} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("grid has {rows} rows for {instruments} instruments")]
    RowCountMismatch { rows: usize, instruments: usize },

    #[error("grid has {actual} steps, expected {expected}")]
    StepCountMismatch { expected: usize, actual: usize },

    #[error("tempo must be a positive number, got {0}")]
    InvalidTempo(f64),

    #[error(transparent)]
    TimeSignature(#[from] TimeSignatureError),

    #[error("instrument list is empty")]
    NoInstruments,

    #[error("duplicate instrument id '{0}'")]
    DuplicateInstrument(String),

    #[error("instrument '{0}' is not on the track")]
    InstrumentNotOnTrack(String),
}

/// A non-empty set of violations, carried by a rejected mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    /// `Ok` when `violations` is empty.
    pub fn check(violations: Vec<Violation>) -> Result<(), Violations> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Violations(violations))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    pub fn contains(&self, violation: &Violation) -> bool {
        self.0.contains(violation)
    }
}

impl std::fmt::Display for Violations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Violations {}

impl From<Violation> for Violations {
    fn from(violation: Violation) -> Self {
        Violations(vec![violation])
    }
}

/// Check a full track state. Never panics; returns every violation found.
pub fn validate(
    grid: &Grid,
    instruments: &[Instrument],
    tempo: f64,
    time_signature: &str,
) -> Vec<Violation> {
    let mut violations = validate_grid(grid, instruments);
    violations.extend(validate_tempo(tempo));
    if let Err(err) = time_signature.parse::<TimeSignature>() {
        violations.push(err.into());
    }
    violations
}

/// Shape checks: non-empty, rectangular, one lane per instrument, unique ids.
pub fn validate_grid(grid: &Grid, instruments: &[Instrument]) -> Vec<Violation> {
    let mut violations = Vec::new();

    if grid.is_empty() {
        violations.push(Violation::EmptyGrid);
    }

    let expected = grid.columns();
    for (row, lane) in grid.lanes().enumerate() {
        if lane.len() != expected {
            violations.push(Violation::RaggedRow {
                row,
                expected,
                actual: lane.len(),
            });
        }
    }

    if grid.rows() != instruments.len() {
        violations.push(Violation::RowCountMismatch {
            rows: grid.rows(),
            instruments: instruments.len(),
        });
    }

    violations.extend(validate_instruments(instruments));
    violations
}

pub fn validate_instruments(instruments: &[Instrument]) -> Vec<Violation> {
    if instruments.is_empty() {
        return vec![Violation::NoInstruments];
    }

    let mut seen = HashSet::new();
    instruments
        .iter()
        .filter(|inst| !seen.insert(inst.id.as_str()))
        .map(|inst| Violation::DuplicateInstrument(inst.id.clone()))
        .collect()
}

pub fn validate_tempo(tempo: f64) -> Option<Violation> {
    if tempo.is_finite() && tempo > 0.0 {
        None
    } else {
        Some(Violation::InvalidTempo(tempo))
    }
}

/// Every id in `subset` must name an instrument in `track`.
pub fn validate_subset(subset: &[Instrument], track: &[Instrument]) -> Vec<Violation> {
    subset
        .iter()
        .filter(|inst| !track.iter().any(|t| t.id == inst.id))
        .map(|inst| Violation::InstrumentNotOnTrack(inst.id.clone()))
        .collect()
}
