use thiserror::Error;

/// Failures raised by a backend adapter.
///
/// Adapters return these to the [`StorageManager`](crate::storage_manager::StorageManager),
/// which logs them and turns them into a failure flag plus a notification.
/// None of them is fatal to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or rejected the request.
    #[error("Storage transport failure: {0}")]
    Transport(String),
    /// A stored payload could not be encoded or decoded.
    #[error("Storage serialization failure: {0}")]
    Serialization(String),
    /// Unknown backend, missing user scope or missing client settings.
    #[error("Invalid storage configuration: {0}")]
    InvalidConfiguration(String),
    /// The addressed entry does not exist in the current scope.
    #[error("Entry not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Transport(err.to_string())
    }
}

impl From<sea_orm::DbErr> for StorageError {
    fn from(err: sea_orm::DbErr) -> Self {
        StorageError::Transport(err.to_string())
    }
}

// Request URLs may carry credentials in their query string, so the URL is
// dropped from the message.
impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_decode() {
            StorageError::Serialization(err.to_string())
        } else {
            StorageError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlError(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Directory error: {0}")]
    DirectoryDoesNotExist(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

/// Top-level error of the command-line driver.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Operation failed: {0}")]
    OperationFailed(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(StorageError::from(err), StorageError::Serialization(_)));
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let mapped = StorageError::from(err);
        assert!(matches!(mapped, StorageError::Transport(_)));
        assert_eq!(mapped.to_string(), "Storage transport failure: gone");
    }

    #[test]
    fn test_toml_error_maps_to_config_error() {
        let err = toml::from_str::<toml::Table>("= broken").unwrap_err();
        assert!(matches!(ConfigError::from(err), ConfigError::TomlError(_)));
    }
}
