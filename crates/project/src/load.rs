use crate::{ExportData, ProjectError};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub fn load_export(path: &Path) -> Result<ExportData, ProjectError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    // Try JSON first, fall back to MessagePack
    let export: ExportData = serde_json::from_reader(reader).or_else(|_| {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        rmp_serde::decode::from_read(reader).map_err(ProjectError::from)
    })?;

    export.check_version()?;
    log::debug!(
        "loaded export bundle {} ({} tracks)",
        path.display(),
        export.tracks.len()
    );
    Ok(export)
}

pub fn load_export_bytes(bytes: &[u8]) -> Result<ExportData, ProjectError> {
    let export: ExportData = serde_json::from_slice(bytes)
        .or_else(|_| rmp_serde::decode::from_slice(bytes).map_err(ProjectError::from))?;
    export.check_version()?;
    Ok(export)
}
