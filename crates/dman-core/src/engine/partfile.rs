//! Part file and `.dman` directory layout.
//!
//! ```text
//! <dir>/
//!   .dman/
//!     <filename>.<id>.<offset>   part files
//!     <filename>.<id>.dman       progress descriptor
//!   <filename>                   final file, written by the rebuilder
//! ```

use crate::engine::tunables::{PART_DIR_NAME, PROGRESS_FILE_EXT};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub fn part_dir(target_dir: &Path) -> PathBuf {
    target_dir.join(PART_DIR_NAME)
}

pub fn part_file_path(target_dir: &Path, filename: &str, id: i64, offset: u64) -> PathBuf {
    part_dir(target_dir).join(format!("{filename}.{id}.{offset}"))
}

pub fn descriptor_path(target_dir: &Path, filename: &str, id: i64) -> PathBuf {
    part_dir(target_dir).join(format!("{filename}.{id}.{PROGRESS_FILE_EXT}"))
}

pub fn ensure_part_dir(target_dir: &Path) -> std::io::Result<PathBuf> {
    let dir = part_dir(target_dir);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Removes the `.dman` directory if it exists and is empty. Best-effort.
pub fn remove_part_dir_if_empty(target_dir: &Path) {
    let dir = part_dir(target_dir);
    if let Ok(mut entries) = fs::read_dir(&dir) {
        if entries.next().is_none() {
            let _ = fs::remove_dir(&dir);
        }
    }
}

/// Creates a fresh, empty part file for a new job.
pub fn create_part_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// Opens an existing part file read-write for resume, seeking to the end.
/// Returns the file and its on-disk size.
pub fn open_part_file_for_resume(path: &Path) -> std::io::Result<(File, u64)> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let size = file.metadata()?.len();
    file.seek(SeekFrom::End(0))?;
    Ok((file, size))
}
