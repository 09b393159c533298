//! Locating generated artifacts in the pipeline's output directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Failure to locate an artifact.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// The directory is missing or holds no matching file.
    #[error("No file matching '{prefix}*{suffix}' in {}", .dir.display())]
    NotFound {
        dir: PathBuf,
        prefix: String,
        suffix: String,
    },

    /// The directory exists but could not be read.
    #[error("Failed to read {}: {source}", .dir.display())]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Find the most recently modified regular file in `dir` whose name starts
/// with `prefix` and ends with `suffix`.
///
/// The scan is non-recursive. Ties on modification time go to the
/// lexicographically smallest file name so repeated calls agree. Entries
/// whose metadata cannot be read are skipped.
pub fn find_latest(dir: &Path, prefix: &str, suffix: &str) -> Result<PathBuf, LocateError> {
    let not_found = || LocateError::NotFound {
        dir: dir.to_path_buf(),
        prefix: prefix.to_string(),
        suffix: suffix.to_string(),
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(source) => {
            return Err(LocateError::Io {
                dir: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut best: Option<(SystemTime, String)> = None;
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(prefix) || !name.ends_with(suffix) {
            continue;
        }
        let Ok(meta) = std::fs::metadata(entry.path()) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };

        let newer = match &best {
            None => true,
            Some((best_time, best_name)) => {
                modified > *best_time || (modified == *best_time && name < *best_name)
            }
        };
        if newer {
            best = Some((modified, name));
        }
    }

    best.map(|(_, name)| dir.join(name)).ok_or_else(not_found)
}
