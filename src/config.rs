// ⚙️ Configuration
// Defaults suit a local checkout; every field can be overridden from the environment.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IndexError, Result};

pub const DEFAULT_DIRECTORY_URL: &str =
    "https://directory.spineservices.nhs.uk/ORD/2-0-0/organisations";

/// Monthly "Appointments in General Practice" publication pages
pub const DEFAULT_PUBLICATION_URL: &str =
    "https://digital.nhs.uk/data-and-information/publications/statistical/appointments-in-general-practice";

/// Minimum gap between consecutive directory calls
pub const DEFAULT_LOOKUP_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct Config {
    /// Working area for unpacked monthly archives and CSV exports
    pub data_dir: PathBuf,
    /// SQLite file holding datasets and the reconciliation cache
    pub database_path: PathBuf,
    pub directory_base_url: String,
    pub publication_base_url: String,
    pub lookup_interval: Duration,
    pub lookup_timeout: Duration,
    pub rate_limit_backoff: Duration,
    pub download_timeout: Duration,
    /// Upper bound on one pipeline run; None = unbounded
    pub pipeline_timeout: Option<Duration>,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("data"),
            database_path: PathBuf::from("data/gp_index.db"),
            directory_base_url: DEFAULT_DIRECTORY_URL.to_string(),
            publication_base_url: DEFAULT_PUBLICATION_URL.to_string(),
            lookup_interval: Duration::from_millis(DEFAULT_LOOKUP_INTERVAL_MS),
            lookup_timeout: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(5),
            download_timeout: Duration::from_secs(300),
            pipeline_timeout: None,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by `GP_INDEX_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(dir) = lookup("GP_INDEX_DATA_DIR") {
            config.database_path = PathBuf::from(&dir).join("gp_index.db");
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(db) = lookup("GP_INDEX_DB") {
            config.database_path = PathBuf::from(db);
        }
        if let Some(url) = lookup("GP_INDEX_DIRECTORY_URL") {
            config.directory_base_url = url;
        }
        if let Some(url) = lookup("GP_INDEX_PUBLICATION_URL") {
            config.publication_base_url = url;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "GP_INDEX_LOOKUP_INTERVAL_MS")? {
            config.lookup_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GP_INDEX_LOOKUP_TIMEOUT_SECS")? {
            config.lookup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GP_INDEX_DOWNLOAD_TIMEOUT_SECS")? {
            config.download_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GP_INDEX_PIPELINE_TIMEOUT_SECS")? {
            config.pipeline_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(filter) = lookup("GP_INDEX_LOG") {
            config.log_filter = filter;
        }

        Ok(config)
    }

    /// Where a month's CSV export is written
    pub fn export_path(&self, month: &str) -> PathBuf {
        self.data_dir.join(format!("icb_gp_suppliers_{}.csv", month))
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| IndexError::Config(format!("{} must be a number, got '{}'", key, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.lookup_interval, Duration::from_millis(200));
        assert_eq!(config.directory_base_url, DEFAULT_DIRECTORY_URL);
        assert!(config.pipeline_timeout.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("GP_INDEX_DATA_DIR", "/srv/gp"),
            ("GP_INDEX_LOOKUP_INTERVAL_MS", "0"),
            ("GP_INDEX_PIPELINE_TIMEOUT_SECS", "1800"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/gp"));
        assert_eq!(config.database_path, PathBuf::from("/srv/gp/gp_index.db"));
        assert_eq!(config.lookup_interval, Duration::ZERO);
        assert_eq!(config.pipeline_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(
            config.export_path("2025-01"),
            PathBuf::from("/srv/gp/icb_gp_suppliers_2025-01.csv")
        );
    }

    #[test]
    fn test_malformed_number_is_config_error() {
        let err = Config::from_lookup(lookup_from(&[("GP_INDEX_LOOKUP_INTERVAL_MS", "fast")])).unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }
}
