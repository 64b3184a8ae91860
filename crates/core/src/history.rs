use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use drumseq_transport::{Grid, Instrument, SyncGroupId};
use serde::{Deserialize, Serialize};

use crate::time::TimeSignature;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Undoable state of a track. Grid lanes are shared with live state, so a
/// snapshot costs a handful of reference-count bumps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSnapshot {
    pub grid: Grid,
    pub instruments: Vec<Instrument>,
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub bar_sync_groups: BTreeMap<usize, SyncGroupId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    pub snapshot: T,
    pub description: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Serialized form of a [`HistoryStack`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryExport<T> {
    pub entries: Vec<HistoryEntry<T>>,
    pub cursor: Option<usize>,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("history cursor {cursor:?} is invalid for {len} entries")]
    InvalidCursor { cursor: Option<usize>, len: usize },
    #[error("history capacity must be at least 1")]
    ZeroCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub len: usize,
    pub capacity: usize,
    pub cursor: Option<usize>,
    pub can_undo: bool,
    pub can_redo: bool,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
    pub index: usize,
    pub description: String,
    pub timestamp: u64,
    pub is_current: bool,
}

/// Bounded undo stack with an explicit cursor.
///
/// The cursor points at the entry describing the current state; `None` means
/// the stack is empty. Undo never moves past the oldest entry.
#[derive(Debug, Clone)]
pub struct HistoryStack<T> {
    entries: VecDeque<HistoryEntry<T>>,
    cursor: Option<usize>,
    capacity: usize,
}

impl<T: Clone> HistoryStack<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: None,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, snapshot: T, description: impl Into<String>) {
        if let Some(cursor) = self.cursor {
            self.entries.truncate(cursor + 1);
        }

        self.entries.push_back(HistoryEntry {
            snapshot,
            description: description.into(),
            timestamp: now_millis(),
        });

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.cursor = Some(self.entries.len() - 1);
    }

    /// Step back and return the snapshot there, or `None` at the oldest entry.
    pub fn undo(&mut self) -> Option<&T> {
        let cursor = self.cursor.filter(|&c| c > 0)? - 1;
        self.cursor = Some(cursor);
        self.entries.get(cursor).map(|entry| &entry.snapshot)
    }

    /// Step forward and return the snapshot there, or `None` at the newest entry.
    pub fn redo(&mut self) -> Option<&T> {
        let cursor = self.cursor? + 1;
        if cursor >= self.entries.len() {
            return None;
        }
        self.cursor = Some(cursor);
        self.entries.get(cursor).map(|entry| &entry.snapshot)
    }

    pub fn jump_to(&mut self, index: usize) -> Option<&T> {
        if index >= self.entries.len() {
            return None;
        }
        self.cursor = Some(index);
        self.entries.get(index).map(|entry| &entry.snapshot)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor.is_some_and(|c| c > 0)
    }

    pub fn can_redo(&self) -> bool {
        self.cursor.is_some_and(|c| c + 1 < self.entries.len())
    }

    pub fn current(&self) -> Option<&HistoryEntry<T>> {
        self.entries.get(self.cursor?)
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }

    /// Entries whose description contains `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<HistoryItem> {
        let query = query.to_lowercase();
        self.details()
            .into_iter()
            .filter(|item| item.description.to_lowercase().contains(&query))
            .collect()
    }

    pub fn details(&self) -> Vec<HistoryItem> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| HistoryItem {
                index,
                description: entry.description.clone(),
                timestamp: entry.timestamp,
                is_current: self.cursor == Some(index),
            })
            .collect()
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            len: self.entries.len(),
            capacity: self.capacity,
            cursor: self.cursor,
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            oldest: self.entries.front().map(|e| e.timestamp),
            newest: self.entries.back().map(|e| e.timestamp),
        }
    }

    /// Drop the oldest entries until at most `target` remain, never dropping
    /// the current entry. Returns the number dropped.
    pub fn optimize(&mut self, target: usize) -> usize {
        let excess = self.entries.len().saturating_sub(target.max(1));
        let removable = excess.min(self.cursor.unwrap_or(0));
        self.entries.drain(..removable);
        self.cursor = self.cursor.map(|c| c - removable);
        if removable > 0 {
            log::debug!("history optimized, dropped {removable} entries");
        }
        removable
    }

    pub fn export(&self) -> HistoryExport<T> {
        HistoryExport {
            entries: self.entries.iter().cloned().collect(),
            cursor: self.cursor,
            capacity: self.capacity,
        }
    }

    /// Replace the whole stack. Entries beyond the capacity are dropped
    /// from the oldest end.
    pub fn import(&mut self, export: HistoryExport<T>) -> Result<(), HistoryError> {
        if export.capacity == 0 {
            return Err(HistoryError::ZeroCapacity);
        }
        let len = export.entries.len();
        let cursor_ok = match export.cursor {
            None => len == 0,
            Some(c) => c < len,
        };
        if !cursor_ok {
            return Err(HistoryError::InvalidCursor {
                cursor: export.cursor,
                len,
            });
        }

        let excess = len.saturating_sub(export.capacity);
        self.entries = export.entries.into_iter().skip(excess).collect();
        self.capacity = export.capacity;
        self.cursor = export.cursor.map(|c| c.saturating_sub(excess));
        Ok(())
    }
}

impl<T: Clone> Default for HistoryStack<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
