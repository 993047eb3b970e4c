use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error_handling::types::StorageError;

/// The four storage backends a user can pick from.
///
/// The string forms are the values persisted as the user's preference and
/// must stay stable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    #[serde(rename = "localStorage")]
    LocalKeyValue,
    #[serde(rename = "indexedDB")]
    LocalDocument,
    #[serde(rename = "firestore")]
    RemoteDocument,
    #[default]
    #[serde(rename = "realtimeDB")]
    RealtimeSync,
}

impl StorageType {
    pub const ALL: [StorageType; 4] = [
        StorageType::LocalKeyValue,
        StorageType::LocalDocument,
        StorageType::RemoteDocument,
        StorageType::RealtimeSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::LocalKeyValue => "localStorage",
            StorageType::LocalDocument => "indexedDB",
            StorageType::RemoteDocument => "firestore",
            StorageType::RealtimeSync => "realtimeDB",
        }
    }

    /// Human-readable name used in notifications.
    pub fn label(&self) -> &'static str {
        match self {
            StorageType::LocalKeyValue => "Local Storage",
            StorageType::LocalDocument => "IndexedDB",
            StorageType::RemoteDocument => "Firestore",
            StorageType::RealtimeSync => "Realtime Database",
        }
    }

    /// Resolves a persisted preference, falling back to `fallback` for
    /// missing or unknown values.
    pub fn from_preference(value: Option<&str>, fallback: StorageType) -> StorageType {
        value.and_then(|v| v.parse().ok()).unwrap_or(fallback)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                StorageError::InvalidConfiguration(format!("unknown storage type '{}'", s))
            })
    }
}

/// The (backend, user) pair an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub backend: StorageType,
    pub user_id: Option<String>,
}

impl Scope {
    pub fn new(backend: StorageType, user_id: Option<&str>) -> Self {
        Self {
            backend,
            user_id: user_id.map(str::to_string),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user_id {
            Some(uid) => write!(f, "{}/{}", self.backend, uid),
            None => write!(f, "{}/<unscoped>", self.backend),
        }
    }
}
