//! Configuration sources: command line flags override environment variables,
//! which override the optional TOML config file.

use crate::error::DownloadError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const ENV_USERNAME: &str = "DATACITE_USERNAME";
pub const ENV_PASSWORD: &str = "DATACITE_PASSWORD";
pub const ENV_REFRESH_INTERVAL: &str = "DATACITE_REFRESH_INTERVAL";

/// Default credential refresh interval, in minutes.
pub const DEFAULT_REFRESH_MINUTES: u64 = 20;

/// Optional settings read from a TOML file. Every field may be omitted.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub bucket: Option<String>,
    pub retries: Option<u32>,
    /// Minutes between credential refreshes.
    pub refresh_interval: Option<u64>,
    pub workers: Option<usize>,
}

impl FileConfig {
    /// Config file locations, most specific first: `~/.datacite-dl.toml`,
    /// then the platform config directory.
    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dirs) = directories::BaseDirs::new() {
            paths.push(dirs.home_dir().join(".datacite-dl.toml"));
            paths.push(dirs.config_dir().join("datacite-dl").join("config.toml"));
        }
        paths
    }

    pub fn load_from(path: &Path) -> Result<Self, DownloadError> {
        let text = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&text).map_err(|e| {
            DownloadError::InvalidArgument(format!(
                "invalid config file {}: {e}",
                path.display()
            ))
        })?;
        if config.password.is_some() {
            warn!(
                "Password loaded from {}; prefer the {ENV_PASSWORD} environment variable",
                path.display()
            );
        }
        Ok(config)
    }

    /// Loads the first config file that exists; absent files yield defaults,
    /// a present-but-broken file is an error.
    pub fn discover() -> Result<Self, DownloadError> {
        for path in Self::candidate_paths() {
            if path.is_file() {
                debug!("Loading config from {}", path.display());
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }
}

/// Reads an environment variable, treating empty values as unset.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Picks the highest-priority value: command line, then environment, then
/// config file, then the built-in default.
pub fn resolve<T>(cli: Option<T>, env: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(env).or(file).unwrap_or(default)
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub password: String,
    pub output_dir: PathBuf,
    pub bucket: String,
    pub retries: u32,
    pub refresh_interval: Duration,
    pub workers: usize,
    pub skip_verify: bool,
    pub fresh: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub max_size: Option<u64>,
    pub assume_yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_parses_all_fields() {
        let config: FileConfig = toml::from_str(
            r#"
            username = "alice"
            output_dir = "/data/datacite"
            retries = 5
            refresh_interval = 15
            workers = 8
            bucket = "my-bucket"
            "#,
        )
        .unwrap();

        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.output_dir, Some(PathBuf::from("/data/datacite")));
        assert_eq!(config.retries, Some(5));
        assert_eq!(config.refresh_interval, Some(15));
        assert_eq!(config.workers, Some(8));
        assert_eq!(config.bucket.as_deref(), Some("my-bucket"));
        assert_eq!(config.password, None);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<FileConfig>("typo_field = 1").unwrap_err();
        assert!(err.to_string().contains("typo_field"));
    }

    #[test]
    fn load_from_reports_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retries = \"not a number\"").unwrap();

        let err = FileConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, DownloadError::InvalidArgument(_)));
    }

    #[test]
    fn resolve_prefers_cli_then_env_then_file() {
        assert_eq!(resolve(Some(1), Some(2), Some(3), 4), 1);
        assert_eq!(resolve(None, Some(2), Some(3), 4), 2);
        assert_eq!(resolve(None, None, Some(3), 4), 3);
        assert_eq!(resolve::<u32>(None, None, None, 4), 4);
    }
}
