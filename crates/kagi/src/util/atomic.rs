use std::{
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::error::KagiResult;

/// Write `data` to `path` so that readers only ever see the old or the new file.
///
/// The data lands in a hidden temp file next to the target, is synced, and is
/// then renamed over `path`. Temp files start with `.` so the classifier and
/// static file listings skip them.
pub fn write_atomic(path: &Path, data: &[u8]) -> KagiResult<()> {
    let mut tmp = temp_file_for(path)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Written,
    /// The destination already held the same bytes.
    Unchanged,
}

/// Like [`write_atomic`], but leaves `path` untouched if it already holds `data`.
pub fn write_if_changed(path: &Path, data: &[u8]) -> KagiResult<PublishOutcome> {
    if std::fs::read(path).is_ok_and(|existing| existing == data) {
        return Ok(PublishOutcome::Unchanged);
    }
    write_atomic(path, data)?;
    Ok(PublishOutcome::Written)
}

/// Check that `dir` exists and we are allowed to create files in it.
pub fn probe_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = tempfile::Builder::new()
        .prefix(".kagi-probe")
        .tempfile_in(dir)?;
    probe.close()
}

/// Remove every entry in `dir`, keeping the directory itself.
pub fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn temp_file_for(path: &Path) -> std::io::Result<NamedTempFile> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".partial")
        .tempfile_in(parent)
}
