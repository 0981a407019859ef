//! Calibration database (ACDB) file discovery.
//!
//! The engine consumes a set of `.acdb` files at initialization plus an
//! optional delta file carrying field tuning on top of the base set.
//! Files live in a directory configured by the service.

use std::path::{Path, PathBuf};

use agm_core::Result;
use tracing::{info, warn};

/// Maximum number of calibration files the engine accepts.
pub const MAX_ACDB_FILES: usize = 20;

/// Data handed to [`GraphEngine::initialize`].
///
/// [`GraphEngine::initialize`]: crate::GraphEngine::initialize
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineInitData {
    /// Base calibration files.
    pub acdb_files: Vec<PathBuf>,
    /// Optional delta calibration file.
    pub delta_file: Option<PathBuf>,
}

/// Collect every regular `*.acdb` file in `dir`, up to `max` entries.
///
/// An unreadable directory is an error; a directory without any
/// calibration files only logs a warning, since the engine can run
/// uncalibrated. Entries beyond `max` are dropped with a warning.
pub fn discover_acdb_files(dir: &Path, max: usize) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "acdb") {
            if files.len() >= max {
                warn!(dir = %dir.display(), max, "dropping calibration files beyond engine limit");
                break;
            }
            info!(file = %path.display(), "calibration file");
            files.push(path);
        }
    }

    if files.is_empty() {
        warn!(dir = %dir.display(), "no .acdb files found");
    }
    // Directory iteration order is platform-defined; keep the set stable.
    files.sort();
    Ok(files)
}
