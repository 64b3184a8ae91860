use crate::{ExportData, ProjectError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub fn save_export(path: &Path, export: &ExportData) -> Result<(), ProjectError> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, export)?;

    log::debug!("saved export bundle {}", path.display());
    Ok(())
}

/// MessagePack variant of [`save_export`], with named fields.
pub fn save_export_binary(path: &Path, export: &ExportData) -> Result<(), ProjectError> {
    let bytes = rmp_serde::encode::to_vec_named(export)?;
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
