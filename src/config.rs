//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries the
//! server section plus one [`PathConfig`] per recording path. Every section
//! defaults sensibly so a completely empty file is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Pseudo-path names that never refer to a concrete recording path and are
/// skipped by index rebuilds.
pub const RESERVED_PATH_NAMES: [&str; 2] = ["all", "all_others"];

/// True for the reserved pseudo-path names.
pub fn is_reserved_path(name: &str) -> bool {
    RESERVED_PATH_NAMES.contains(&name)
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: HashMap<String, PathConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: HashMap::new(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9996,
        }
    }
}

/// On-disk format of a path's recording segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// Fragmented MP4, the only format the index and playback engine accept.
    #[default]
    Fmp4,
    /// MPEG-TS recordings exist on disk but are rejected for indexed playback.
    Mpegts,
}

impl std::fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordFormat::Fmp4 => write!(f, "fmp4"),
            RecordFormat::Mpegts => write!(f, "mpegts"),
        }
    }
}

/// Per-path recording settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory that holds this path's segment files (one subdirectory per
    /// path name underneath).
    pub record_path: PathBuf,
    pub record_format: RecordFormat,
    /// Maximum allowed gap, in seconds, between where one segment's muxed
    /// output ended and the next segment's start time for the two to be
    /// served as one continuous stream.
    pub concat_tolerance_secs: f64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            record_path: PathBuf::from("./recordings"),
            record_format: RecordFormat::Fmp4,
            concat_tolerance_secs: 1.0,
        }
    }
}

impl PathConfig {
    /// Contiguity tolerance as a signed duration.
    pub fn concat_tolerance(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::milliseconds((self.concat_tolerance_secs * 1000.0) as i64)
    }
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from `path`, or return defaults when no path is
    /// given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                Self::from_toml(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    /// Look up the configuration for a recording path.
    pub fn find_path_conf(&self, name: &str) -> Option<&PathConfig> {
        self.paths.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 9996);
        assert!(config.paths.is_empty());
    }

    #[test]
    fn parses_paths_section() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 8554

            [paths.cam1]
            record_path = "/var/recordings"
            record_format = "fmp4"
            concat_tolerance_secs = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8554);
        let cam1 = config.find_path_conf("cam1").unwrap();
        assert_eq!(cam1.record_format, RecordFormat::Fmp4);
        assert_eq!(cam1.concat_tolerance(), chrono::TimeDelta::milliseconds(500));
    }

    #[test]
    fn rejects_unknown_record_format() {
        let res = Config::from_toml(
            r#"
            [paths.cam1]
            record_format = "avi"
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn reserved_path_names() {
        assert!(is_reserved_path("all"));
        assert!(is_reserved_path("all_others"));
        assert!(!is_reserved_path("cam1"));
    }
}
