//! Storage Trait
//!
//! This module defines the `Storage` trait, the uniform asynchronous interface
//! every backend adapter implements.
//!
//! Implementors are responsible for:
//! - Loading, replacing, appending, removing and clearing a user's entries
//! - Stamping the owning user onto every entry they persist
//! - Stripping backend-internal identifiers before returning entries
//!
//! Backends able to push live updates additionally override
//! `load_and_subscribe` and `detach`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error_handling::types::StorageError;
use crate::income::IncomeEntry;
use crate::storage::types::StorageType;

/// Receives every full snapshot pushed by a subscribed backend.
pub type SnapshotSink = Arc<dyn Fn(Vec<IncomeEntry>) + Send + Sync>;

/// The `Storage` trait defines the interface for income entry backends.
///
/// `user_id` selects the partition an operation targets. `None` is the
/// legacy unscoped mode and addresses every stored entry.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Which of the four backends this adapter implements.
    fn kind(&self) -> StorageType;

    /// Fetches all entries of `user_id`.
    async fn load(&self, user_id: Option<&str>) -> Result<Vec<IncomeEntry>, StorageError>;

    /// Replaces the durable state of `user_id` with `entries`.
    async fn save(&self, entries: &[IncomeEntry], user_id: Option<&str>)
        -> Result<(), StorageError>;

    /// Appends one entry without rewriting the set. Re-adding an entry with
    /// the same id replaces it.
    async fn add(&self, entry: &IncomeEntry, user_id: Option<&str>) -> Result<(), StorageError>;

    /// Deletes one entry by id.
    async fn remove(&self, id: &str, user_id: Option<&str>) -> Result<(), StorageError>;

    /// Deletes every entry of `user_id`.
    async fn clear(&self, user_id: Option<&str>) -> Result<(), StorageError>;

    /// Whether `load_and_subscribe` attaches a live listener.
    fn supports_subscribe(&self) -> bool {
        false
    }

    /// Loads and, for push-capable backends, attaches a listener feeding
    /// `sink` with every later snapshot of the same scope.
    async fn load_and_subscribe(
        &self,
        user_id: Option<&str>,
        sink: SnapshotSink,
    ) -> Result<Vec<IncomeEntry>, StorageError> {
        let _ = sink;
        self.load(user_id).await
    }

    /// Tears down any live listener. No-op for backends without one.
    async fn detach(&self) {}
}
