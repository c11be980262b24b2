//! Splitting files into fixed-size parts and enumerating upload targets.

use crate::error::UploadError;
use crate::types::Chunk;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Reports the total size of a file.
pub trait FileSizer {
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

/// [`FileSizer`] backed by filesystem metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSizer;

impl FileSizer for OsFileSizer {
    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

/// Splits `[0, total)` into contiguous `[start, end)` ranges of `part_size`
/// bytes. The last range may be shorter; an empty file yields no ranges.
///
/// `part_size` must be non-zero.
pub fn split_ranges(part_size: u64, total: u64) -> Vec<(u64, u64)> {
    debug_assert!(part_size > 0);
    let mut ranges = Vec::with_capacity(total.div_ceil(part_size.max(1)) as usize);
    let mut start = 0;
    while start < total {
        let end = start + part_size.min(total - start);
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Sizes `path` through `sizer` and returns its chunks in file order.
///
/// # Arguments
///
/// * `sizer` - File size oracle
/// * `path` - File to split
/// * `part_size` - Size of every chunk but the last
pub fn chunk_file<S: FileSizer + ?Sized>(
    sizer: &S,
    path: &Path,
    part_size: u64,
) -> Result<Vec<Chunk>, UploadError> {
    if part_size == 0 {
        return Err(UploadError::InvalidConfig(
            "part size must be non-zero".to_string(),
        ));
    }
    let total = sizer.file_size(path)?;
    Ok(split_ranges(part_size, total)
        .into_iter()
        .map(|(start, end)| Chunk::new(path, start, end))
        .collect())
}

/// Returns every file at or beneath `target`.
///
/// A file yields itself and a directory yields all files below it, sorted by
/// path. A missing target yields an empty list.
pub fn collect_file_paths(target: &Path) -> Result<Vec<PathBuf>, UploadError> {
    let metadata = match std::fs::metadata(target) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    if !metadata.is_dir() {
        return Ok(vec![target.to_path_buf()]);
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(target).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}
