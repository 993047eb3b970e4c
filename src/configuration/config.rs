use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::ConfigError;
use crate::income::Thresholds;
use crate::storage::types::StorageType;

/// Default Firestore REST endpoint.
pub const DEFAULT_DOCUMENT_URL: &str = "https://firestore.googleapis.com/v1";

/// Application configuration structure that defines all runtime parameters.
///
/// It is read from a TOML file with [`Config::from_file`]; every key is
/// optional and falls back to [`Config::default`]. Command-line flags and
/// environment variables collected in [`ConfigOverrides`] are applied on top.
///
/// # Example
///
/// ```toml
/// data_dir = "/var/lib/ssi-tracker"
/// default_backend = "indexedDB"
/// realtime_url = "https://example-rtdb.firebaseio.com"
/// income_limit = 1600.0
/// ```
///
/// # Fields Overview
///
/// - `data_dir`: directory holding the local key-value file and SQLite file
/// - `default_backend`: backend used when no preference has been persisted
/// - `key_value_file` / `document_db_file`: file names inside `data_dir`
/// - `realtime_url` / `realtime_auth`: realtime database root and secret;
///   the `realtimeDB` backend is only available when the URL is set
/// - `document_url` / `document_project` / `document_auth` /
///   `document_collection`: document database endpoint; the `firestore`
///   backend is only available when a project is set
/// - `income_limit` / `fixed_benefit_amount`: eligibility constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: PathBuf,
    pub default_backend: String,
    pub key_value_file: String,
    pub document_db_file: String,
    pub realtime_url: Option<String>,
    pub realtime_auth: Option<String>,
    pub document_url: String,
    pub document_project: Option<String>,
    pub document_auth: Option<String>,
    pub document_collection: String,
    pub income_limit: f64,
    pub fixed_benefit_amount: f64,
}

impl Default for Config {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            data_dir: PathBuf::from("ssi-data"),
            default_backend: StorageType::default().as_str().to_string(),
            key_value_file: "local-storage.json".to_string(),
            document_db_file: "income.sqlite".to_string(),
            realtime_url: None,
            realtime_auth: None,
            document_url: DEFAULT_DOCUMENT_URL.to_string(),
            document_project: None,
            document_auth: None,
            document_collection: "income-data".to_string(),
            income_limit: thresholds.income_limit,
            fixed_benefit_amount: thresholds.fixed_benefit_amount,
        }
    }
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config = Config::from_toml(&raw)?;
        info!("Configuration read from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml(raw: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("income_limit", self.income_limit),
            ("fixed_benefit_amount", self.fixed_benefit_amount),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        self.default_backend_type()?;
        if self.key_value_file.trim().is_empty() || self.document_db_file.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "storage file names must not be empty".to_string(),
            ));
        }
        if self.document_collection.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "document_collection must not be empty".to_string(),
            ));
        }
        for (name, url) in [
            ("realtime_url", self.realtime_url.as_deref()),
            ("document_url", Some(self.document_url.as_str())),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::InvalidValue(format!(
                        "{} must be an http(s) URL, got '{}'",
                        name, url
                    )));
                }
            }
        }
        Ok(())
    }

    /// Applies command-line and environment overrides, then revalidates.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(backend) = &overrides.backend {
            self.default_backend = backend.clone();
        }
        if let Some(url) = &overrides.realtime_url {
            self.realtime_url = Some(url.clone());
        }
        if let Some(auth) = &overrides.realtime_auth {
            self.realtime_auth = Some(auth.clone());
        }
        if let Some(project) = &overrides.document_project {
            self.document_project = Some(project.clone());
        }
        if let Some(auth) = &overrides.document_auth {
            self.document_auth = Some(auth.clone());
        }
        if let Some(limit) = overrides.income_limit {
            self.income_limit = limit;
        }
        debug!("Configuration overrides applied");
        self.validate()
    }

    /// Creates `data_dir` if it does not exist yet.
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            ConfigError::DirectoryDoesNotExist(format!("{}: {}", self.data_dir.display(), e))
        })
    }

    pub fn default_backend_type(&self) -> Result<StorageType, ConfigError> {
        self.default_backend
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!(
                "unknown default_backend '{}'",
                self.default_backend
            )))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            income_limit: self.income_limit,
            fixed_benefit_amount: self.fixed_benefit_amount,
        }
    }

    pub fn key_value_path(&self) -> PathBuf {
        self.data_dir.join(&self.key_value_file)
    }

    pub fn document_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.document_db_file)
    }
}

/// Settings that may be overridden from the command line or environment.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    /// Directory for local storage files
    #[arg(long, env = "SSI_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Backend used when no preference is stored
    #[arg(long, env = "SSI_BACKEND")]
    pub backend: Option<String>,

    /// Realtime database root URL
    #[arg(long, env = "SSI_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// Realtime database auth secret or token
    #[arg(long, env = "SSI_REALTIME_AUTH", hide_env_values = true)]
    pub realtime_auth: Option<String>,

    /// Document database project id
    #[arg(long, env = "SSI_DOCUMENT_PROJECT")]
    pub document_project: Option<String>,

    /// Document database bearer token
    #[arg(long, env = "SSI_DOCUMENT_AUTH", hide_env_values = true)]
    pub document_auth: Option<String>,

    /// Monthly job income limit
    #[arg(long)]
    pub income_limit: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        overrides: ConfigOverrides,
    }

    fn overrides_under_test(args: &[&str]) -> Result<ConfigOverrides, clap::Error> {
        let mut argv = vec!["ssi-tracker"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).map(|cli| cli.overrides)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.default_backend_type().unwrap(), StorageType::RealtimeSync);
        assert_eq!(config.document_collection, "income-data");
        assert_eq!(config.thresholds(), Thresholds::default());
    }

    #[test]
    fn test_from_file_partial_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "data_dir = \"/tmp/ssi\"\ndefault_backend = \"indexedDB\"\nincome_limit = 1700.0"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ssi"));
        assert_eq!(config.default_backend_type().unwrap(), StorageType::LocalDocument);
        assert_eq!(config.income_limit, 1700.0);
        assert_eq!(config.fixed_benefit_amount, 1798.0);
        assert_eq!(config.document_db_path(), PathBuf::from("/tmp/ssi/income.sqlite"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_toml("income_limit = -1.0"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            Config::from_toml("default_backend = \"bogus\""),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            Config::from_toml("realtime_url = \"ftp://nope\""),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            Config::from_toml("unknown_key = 1"),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file(Path::new("/nonexistent/ssi.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_ensure_data_dir_creates_directory() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().join("nested/data"),
            ..Config::default()
        };
        config.ensure_data_dir().unwrap();
        assert!(config.data_dir.is_dir());
    }

    #[test]
    #[serial]
    fn test_overrides_from_args() {
        let overrides = overrides_under_test(&[
            "--backend",
            "localStorage",
            "--realtime-url",
            "https://rtdb.example.com",
            "--income-limit",
            "1800",
        ])
        .unwrap_or_else(|e| panic!("{}", e));

        let mut config = Config::default();
        config.apply_overrides(&overrides).unwrap();
        assert_eq!(config.default_backend_type().unwrap(), StorageType::LocalKeyValue);
        assert_eq!(config.realtime_url.as_deref(), Some("https://rtdb.example.com"));
        assert_eq!(config.income_limit, 1800.0);
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        std::env::set_var("SSI_DATA_DIR", "/tmp/from-env");
        let overrides = overrides_under_test(&[]);
        std::env::remove_var("SSI_DATA_DIR");

        let overrides = overrides.unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(overrides.data_dir, Some(PathBuf::from("/tmp/from-env")));
    }

    #[test]
    #[serial]
    fn test_invalid_override_is_rejected() {
        let overrides = overrides_under_test(&["--backend", "bogus"]).unwrap();
        let mut config = Config::default();
        assert!(config.apply_overrides(&overrides).is_err());
    }
}
