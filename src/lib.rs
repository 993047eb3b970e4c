//! Storage core of an SSI income tracker.
//!
//! Income entries are kept in one of four interchangeable backends behind
//! the [`Storage`](storage::storage_trait::Storage) trait. The
//! [`StorageManager`](storage_manager::StorageManager) facade owns the
//! in-memory working set, scopes every call by the signed-in user and keeps
//! the realtime backend's listener lifecycle in check.

pub mod configuration;
pub mod error_handling;
pub mod income;
pub mod storage;
pub mod storage_manager;

pub use configuration::Config;
pub use error_handling::types::{ConfigError, StorageError, TrackerError};
pub use income::{IncomeEntry, IncomeSummary, IncomeType, NewIncome, Thresholds};
pub use storage::storage_trait::Storage;
pub use storage::types::StorageType;
pub use storage_manager::{BackendRegistry, ManagerSettings, StorageEvent, StorageManager};
