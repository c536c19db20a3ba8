//! On-disk progress descriptor: the JSON record that enables resume.

use crate::engine::partfile::descriptor_path;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartDescriptor {
    pub offset: u64,
    pub length: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressDescriptor {
    pub id: i64,
    pub url: String,
    pub filename: String,
    pub parts: Vec<PartDescriptor>,
}

impl ProgressDescriptor {
    /// Writes the descriptor to `<dir>/.dman/<filename>.<id>.dman`. Returns the path written.
    pub fn save(&self, target_dir: &Path) -> std::io::Result<PathBuf> {
        let path = descriptor_path(target_dir, &self.filename, self.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Reads a descriptor from an explicit progress-file path.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// The download's target directory, inferred from a progress-file path:
    /// `<dir>/.dman/<file>.dman` -> `<dir>`.
    pub fn infer_target_dir(progress_path: &Path) -> Option<PathBuf> {
        progress_path.parent()?.parent().map(Path::to_path_buf)
    }
}

/// Reconciles a descriptor's recorded `received` against the part file's
/// actual on-disk size. Workers write sequentially and never skip ahead, so
/// the on-disk size is always authoritative: if it is smaller than what the
/// descriptor recorded, the write was never synced past that point; if it is
/// larger, the sync raced the crash and the extra bytes are valid. Either way
/// the reconciled `received` is simply the on-disk size.
pub fn reconcile_received(on_disk_size: u64) -> u64 {
    on_disk_size
}

pub fn remove(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
