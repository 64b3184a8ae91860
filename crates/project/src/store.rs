use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{ProjectError, TrackData};

/// Keyed storage for per-track JSON snapshots.
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, track_id: &str, json: &str) -> Result<(), ProjectError>;

    /// `Ok(None)` when nothing was ever saved for the track.
    fn load_snapshot(&self, track_id: &str) -> Result<Option<String>, ProjectError>;
}

pub fn save_track(store: &dyn SnapshotStore, track: &TrackData) -> Result<(), ProjectError> {
    let json = serde_json::to_string(track)?;
    store.save_snapshot(&track.track_id, &json)
}

pub fn load_track(
    store: &dyn SnapshotStore,
    track_id: &str,
) -> Result<Option<TrackData>, ProjectError> {
    match store.load_snapshot(track_id)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// One `<track>.json` file per track inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, track_id: &str) -> PathBuf {
        let file_name: String = track_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }
}

impl SnapshotStore for FileStore {
    fn save_snapshot(&self, track_id: &str, json: &str) -> Result<(), ProjectError> {
        fs::create_dir_all(&self.root)?;
        let path = self.snapshot_path(track_id);
        fs::write(&path, json)?;
        log::debug!("saved snapshot for {track_id} to {}", path.display());
        Ok(())
    }

    fn load_snapshot(&self, track_id: &str) -> Result<Option<String>, ProjectError> {
        match fs::read_to_string(self.snapshot_path(track_id)) {
            Ok(json) => Ok(Some(json)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn save_snapshot(&self, track_id: &str, json: &str) -> Result<(), ProjectError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| std::io::Error::other("snapshot store lock poisoned"))?;
        snapshots.insert(track_id.to_string(), json.to_string());
        Ok(())
    }

    fn load_snapshot(&self, track_id: &str) -> Result<Option<String>, ProjectError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| std::io::Error::other("snapshot store lock poisoned"))?;
        Ok(snapshots.get(track_id).cloned())
    }
}
