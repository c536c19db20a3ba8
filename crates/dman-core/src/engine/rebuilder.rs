//! Concatenates completed part files into the final destination.

use crate::engine::partfile::{part_file_path, remove_part_dir_if_empty};
use crate::engine::types::DownloadError;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Picks a free name for the final file: `name.ext`, or `name (1).ext`,
/// `name (2).ext`, ... for the smallest free `k` if `name.ext` is taken.
pub fn unique_final_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut k = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({k}){ext}"));
        if !candidate.exists() {
            return candidate;
        }
        k += 1;
    }
}

/// Concatenates the part files for `parts` (offset, length pairs, any order)
/// into the final file under `target_dir/filename`, removing each source
/// part file as it is consumed and the `.dman` directory if left empty.
/// Returns the final path.
pub fn rebuild(
    target_dir: &Path,
    filename: &str,
    id: i64,
    mut parts: Vec<(u64, u64)>,
) -> Result<PathBuf, DownloadError> {
    parts.sort_by_key(|(offset, _)| *offset);
    let Some(&(first_offset, _)) = parts.first() else {
        return Err(DownloadError::LocalIo("rebuild called with no parts".to_string()));
    };

    let accumulator_path = part_file_path(target_dir, filename, id, first_offset);
    let mut accumulator = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&accumulator_path)
        .map_err(io_err)?;
    accumulator.seek(SeekFrom::End(0)).map_err(io_err)?;

    for &(offset, _) in &parts[1..] {
        let part_path = part_file_path(target_dir, filename, id, offset);
        let mut part = fs::File::open(&part_path).map_err(io_err)?;
        io::copy(&mut part, &mut accumulator).map_err(io_err)?;
        drop(part);
        fs::remove_file(&part_path).map_err(io_err)?;
    }
    drop(accumulator);

    let final_path = unique_final_path(target_dir, filename);
    fs::rename(&accumulator_path, &final_path).map_err(io_err)?;
    remove_part_dir_if_empty(target_dir);
    Ok(final_path)
}

fn io_err(e: io::Error) -> DownloadError {
    DownloadError::LocalIo(e.to_string())
}
