mod load;
mod save;
mod store;

use std::collections::BTreeMap;

use drumseq_transport::{Grid, Instrument, SyncGroupId};
use serde::{Deserialize, Serialize};

pub use load::{load_export, load_export_bytes};
pub use save::{save_export, save_export_binary};
pub use store::{FileStore, MemoryStore, SnapshotStore, load_track, save_track};

/// Version written into every export bundle.
pub const EXPORT_VERSION: &str = "1.0.0";

/// Persisted state of one sync group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncGroupData {
    pub grid: Grid,
    pub instruments: Vec<Instrument>,
    pub tempo: f64,
    pub time_signature: String,
}

/// Persisted state of one drum track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    pub track_id: String,
    pub grid: Grid,
    pub instruments: Vec<Instrument>,
    pub tempo: f64,
    pub time_signature: String,
    pub sync_groups_data: BTreeMap<SyncGroupId, SyncGroupData>,
    /// `[barIndex, group]` pairs; bars not listed follow group A.
    pub bar_sync_groups: Vec<(usize, SyncGroupId)>,
    #[serde(default)]
    pub pattern_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_pattern_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternData {
    pub id: String,
    pub name: String,
    pub grid: Grid,
    pub instruments: Vec<Instrument>,
    pub tempo: f64,
    pub time_signature: String,
    #[serde(default)]
    pub sync_group: SyncGroupId,
}

/// Everything the manager owns, as one portable bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    pub tracks: Vec<TrackData>,
    #[serde(default)]
    pub patterns: Vec<PatternData>,
    #[serde(default)]
    pub active_tracks: Vec<String>,
    pub version: String,
}

impl ExportData {
    pub fn new(
        tracks: Vec<TrackData>,
        patterns: Vec<PatternData>,
        active_tracks: Vec<String>,
    ) -> Self {
        Self {
            tracks,
            patterns,
            active_tracks,
            version: EXPORT_VERSION.to_string(),
        }
    }

    /// Bundles from any 1.x writer are readable.
    pub fn check_version(&self) -> Result<(), ProjectError> {
        let major = self.version.split('.').next().unwrap_or_default();
        if major == "1" {
            Ok(())
        } else {
            Err(ProjectError::UnsupportedVersion(self.version.clone()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),

    #[error("Unsupported export version '{0}'")]
    UnsupportedVersion(String),
}
