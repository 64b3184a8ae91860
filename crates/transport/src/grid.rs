use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Instrument;

/// Steps in one bar of the starter pattern (one 16th note per step at 4/4).
pub const STARTER_BAR_STEPS: usize = 16;

/// Lane of a grid, shared between grid values.
pub type Lane = Arc<[bool]>;

/// Step grid with one lane per instrument.
///
/// Lanes are stored as `Arc<[bool]>` so that cloning a grid only bumps
/// reference counts. Editing one cell through [`Grid::toggled`] produces a
/// new grid that reallocates only the edited lane and shares every other lane
/// with the original.
///
/// A grid may be constructed from ragged rows (e.g. untrusted input). Such a
/// grid is never rejected here; validation reports it.
///
/// ```text
/// Grid
/// ├─ lanes[0]: Arc<[bool]> ──> [x . . . x . . . x . . . x . . .]
/// ├─ lanes[1]: Arc<[bool]> ──> [. . . . x . . . . . . . x . . .]
/// └─ ...
/// ```
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Vec<bool>>", into = "Vec<Vec<bool>>")]
pub struct Grid {
    lanes: Vec<Lane>,
}

impl Grid {
    /// Blank grid with `rows` lanes of `columns` cells.
    pub fn new(rows: usize, columns: usize) -> Self {
        let blank: Lane = Arc::from(vec![false; columns]);
        Self {
            lanes: (0..rows).map(|_| Arc::clone(&blank)).collect(),
        }
    }

    pub fn from_rows(rows: Vec<Vec<bool>>) -> Self {
        Self {
            lanes: rows.into_iter().map(Arc::from).collect(),
        }
    }

    pub fn from_lanes(lanes: Vec<Lane>) -> Self {
        Self { lanes }
    }

    /// Deterministic starter beat, stamped into every complete 16-step bar:
    /// kick (lane 0) on steps 0 and 8, snare (lane 1) on 4 and 12, closed hat
    /// (lane 2) on every even step. Lanes that don't exist are skipped.
    pub fn starter(rows: usize, columns: usize) -> Self {
        let mut cells = vec![vec![false; columns]; rows];
        let bars = columns / STARTER_BAR_STEPS;

        for bar in 0..bars {
            let start = bar * STARTER_BAR_STEPS;
            if let Some(kick) = cells.get_mut(0) {
                kick[start] = true;
                kick[start + 8] = true;
            }
            if let Some(snare) = cells.get_mut(1) {
                snare[start + 4] = true;
                snare[start + 12] = true;
            }
            if let Some(hat) = cells.get_mut(2) {
                for step in (0..STARTER_BAR_STEPS).step_by(2) {
                    hat[start + step] = true;
                }
            }
        }

        Self::from_rows(cells)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.lanes.len()
    }

    /// Length of the first lane, or 0 for an empty grid.
    #[inline]
    pub fn columns(&self) -> usize {
        self.lanes.first().map_or(0, |lane| lane.len())
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty() || self.columns() == 0
    }

    pub fn is_rectangular(&self) -> bool {
        let columns = self.columns();
        self.lanes.iter().all(|lane| lane.len() == columns)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<bool> {
        self.lanes.get(row).and_then(|lane| lane.get(col).copied())
    }

    pub fn lane(&self, row: usize) -> Option<&[bool]> {
        self.lanes.get(row).map(|lane| &lane[..])
    }

    pub fn lane_arc(&self, row: usize) -> Option<&Lane> {
        self.lanes.get(row)
    }

    pub fn lanes(&self) -> impl Iterator<Item = &[bool]> + '_ {
        self.lanes.iter().map(|lane| &lane[..])
    }

    /// Copy of this grid with one cell flipped, or `None` if out of range.
    pub fn toggled(&self, row: usize, col: usize) -> Option<Self> {
        let current = self.get(row, col)?;
        self.with_cell(row, col, !current)
    }

    /// Copy of this grid with one cell set, or `None` if out of range.
    pub fn with_cell(&self, row: usize, col: usize, value: bool) -> Option<Self> {
        let lane = self.lanes.get(row)?;
        if col >= lane.len() {
            return None;
        }

        let mut cells = lane.to_vec();
        cells[col] = value;

        let mut lanes = self.lanes.clone();
        lanes[row] = Arc::from(cells);
        Some(Self { lanes })
    }

    /// Copy of this grid with one lane replaced by a shared lane.
    pub fn with_lane(&self, row: usize, lane: Lane) -> Option<Self> {
        if row >= self.lanes.len() {
            return None;
        }
        let mut lanes = self.lanes.clone();
        lanes[row] = lane;
        Some(Self { lanes })
    }

    /// Grid with every lane cut or blank-padded to `columns` cells. Lanes
    /// already of that length are shared.
    pub fn with_columns(&self, columns: usize) -> Self {
        let lanes = self
            .lanes
            .iter()
            .map(|lane| {
                if lane.len() == columns {
                    Arc::clone(lane)
                } else {
                    let mut cells = vec![false; columns];
                    let keep = lane.len().min(columns);
                    cells[..keep].copy_from_slice(&lane[..keep]);
                    Arc::from(cells)
                }
            })
            .collect();
        Self { lanes }
    }

    /// Re-key lanes from the `from` instrument order to the `to` order,
    /// matching by instrument id. Lanes of retained instruments are shared;
    /// new instruments get blank lanes.
    pub fn remapped(&self, from: &[Instrument], to: &[Instrument]) -> Self {
        let columns = self.columns();
        let blank: Lane = Arc::from(vec![false; columns]);
        let lanes = to
            .iter()
            .map(|inst| {
                from.iter()
                    .position(|old| old.id == inst.id)
                    .and_then(|row| self.lanes.get(row))
                    .map_or_else(|| Arc::clone(&blank), Arc::clone)
            })
            .collect();
        Self { lanes }
    }

    /// Rows whose cell in `col` is active.
    pub fn active_rows(&self, col: usize) -> impl Iterator<Item = usize> + '_ {
        self.lanes
            .iter()
            .enumerate()
            .filter(move |(_, lane)| lane.get(col).copied().unwrap_or(false))
            .map(|(row, _)| row)
    }

    pub fn cell_count(&self) -> usize {
        self.lanes
            .iter()
            .map(|lane| lane.iter().filter(|&&cell| cell).count())
            .sum()
    }

    pub fn to_rows(&self) -> Vec<Vec<bool>> {
        self.lanes.iter().map(|lane| lane.to_vec()).collect()
    }

    /// True when `row` shares its storage with the same lane of `other`.
    pub fn shares_lane(&self, other: &Grid, row: usize) -> bool {
        match (self.lanes.get(row), other.lanes.get(row)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Vec<Vec<bool>>> for Grid {
    fn from(rows: Vec<Vec<bool>>) -> Self {
        Self::from_rows(rows)
    }
}

impl From<Grid> for Vec<Vec<bool>> {
    fn from(grid: Grid) -> Self {
        grid.to_rows()
    }
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .lanes
            .iter()
            .map(|lane| lane.iter().map(|&c| if c { 'x' } else { '.' }).collect())
            .collect();
        f.debug_struct("Grid")
            .field("rows", &self.rows())
            .field("columns", &self.columns())
            .field("lanes", &rendered)
            .finish()
    }
}
