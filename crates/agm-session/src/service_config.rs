//! Service configuration.

use std::path::{Path, PathBuf};

use agm_core::{AgmError, Result};
use agm_engine::acdb::MAX_ACDB_FILES;
use serde::{Deserialize, Serialize};

/// Platform paths and limits for one manager instance.
///
/// Loadable from a TOML file; unset fields keep their defaults:
///
/// ```toml
/// pcm_registry = "/proc/asound/pcm"
/// acdb_dir = "/vendor/etc/acdb"
/// acdb_delta_file = "/data/vendor/audio/delta.acdb"
/// max_acdb_files = 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Line-oriented PCM registry enumerating the audio endpoints.
    pub pcm_registry: PathBuf,
    /// Directory of `.acdb` calibration files.
    pub acdb_dir: PathBuf,
    /// Optional delta calibration file layered on the base set.
    pub acdb_delta_file: Option<PathBuf>,
    /// Cap on the number of calibration files handed to the engine.
    pub max_acdb_files: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pcm_registry: PathBuf::from("/proc/asound/pcm"),
            acdb_dir: PathBuf::from("/vendor/etc/acdb"),
            acdb_delta_file: None,
            max_acdb_files: MAX_ACDB_FILES,
        }
    }
}

impl ServiceConfig {
    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|err| AgmError::invalid_argument(format!("config {}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_platform_paths() {
        let config = ServiceConfig::default();
        assert_eq!(config.pcm_registry, PathBuf::from("/proc/asound/pcm"));
        assert_eq!(config.max_acdb_files, MAX_ACDB_FILES);
        assert!(config.acdb_delta_file.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agm.toml");
        std::fs::write(&path, "acdb_dir = \"/tmp/acdb\"\nmax_acdb_files = 4\n").unwrap();

        let config = ServiceConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.acdb_dir, PathBuf::from("/tmp/acdb"));
        assert_eq!(config.max_acdb_files, 4);
        assert_eq!(config.pcm_registry, PathBuf::from("/proc/asound/pcm"));
    }

    #[test]
    fn malformed_toml_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agm.toml");
        std::fs::write(&path, "max_acdb_files = \"many\"\n").unwrap();
        assert!(matches!(
            ServiceConfig::from_toml_file(&path),
            Err(AgmError::InvalidArgument(_))
        ));
    }
}
