// Log directory mirroring
// Replaces the mirror with a fresh copy of the run's log directory

use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::errors::{Result, TrainError};

/// Remove `dst` and copy the tree at `src` into it; returns files copied
pub fn mirror_dir(src: &Path, dst: &Path) -> Result<usize> {
    if dst.exists() {
        fs::remove_dir_all(dst)?;
    }
    fs::create_dir_all(dst)?;

    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| TrainError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| TrainError::data(format!("unexpected path in log dir: {}", e)))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    tracing::debug!(
        src = %src.display(),
        dst = %dst.display(),
        files = copied,
        "Mirrored log directory"
    );
    Ok(copied)
}
