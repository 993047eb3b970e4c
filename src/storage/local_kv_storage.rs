use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};

use crate::error_handling::types::StorageError;
use crate::income::IncomeEntry;
use crate::storage::key_value::KeyValueStore;
use crate::storage::storage_trait::Storage;
use crate::storage::types::StorageType;

/// Key holding the entries of the legacy unscoped mode.
pub const BASE_DATA_KEY: &str = "ssiIncomeData";

/// Key under which the entries of `user_id` are stored.
pub fn user_storage_key(user_id: Option<&str>) -> String {
    match user_id {
        Some(uid) => format!("user_{}_{}", uid, BASE_DATA_KEY),
        None => BASE_DATA_KEY.to_string(),
    }
}

/// `localStorage` adapter: each user's whole entry list is one JSON value in
/// the key-value store.
///
/// The store has no partial update, so `add` and `remove` are
/// read-modify-write cycles over the user's key.
pub struct LocalKvStorage {
    store: Arc<dyn KeyValueStore>,
}

impl LocalKvStorage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn read(&self, key: &str) -> Result<Vec<IncomeEntry>, StorageError> {
        match self.store.get(key)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                error!("Malformed entries under '{}': {}", key, e);
                StorageError::from(e)
            }),
            None => Ok(Vec::new()),
        }
    }

    fn write(&self, key: &str, entries: &[IncomeEntry]) -> Result<(), StorageError> {
        let json = serde_json::to_string(entries)?;
        self.store.set(key, &json).map_err(|e| {
            error!("Failed to write entries under '{}': {}", key, e);
            e
        })
    }
}

#[async_trait]
impl Storage for LocalKvStorage {
    fn kind(&self) -> StorageType {
        StorageType::LocalKeyValue
    }

    async fn load(&self, user_id: Option<&str>) -> Result<Vec<IncomeEntry>, StorageError> {
        let key = user_storage_key(user_id);
        let entries = self.read(&key)?;
        debug!("Loaded {} entr(ies) from '{}'", entries.len(), key);
        Ok(entries)
    }

    async fn save(
        &self,
        entries: &[IncomeEntry],
        user_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let key = user_storage_key(user_id);
        let stamped: Vec<IncomeEntry> = entries.iter().map(|e| e.scoped_to(user_id)).collect();
        self.write(&key, &stamped)?;
        info!("Saved {} entr(ies) under '{}'", stamped.len(), key);
        Ok(())
    }

    async fn add(&self, entry: &IncomeEntry, user_id: Option<&str>) -> Result<(), StorageError> {
        let key = user_storage_key(user_id);
        let mut entries = self.read(&key)?;
        entries.retain(|e| e.id != entry.id);
        entries.push(entry.scoped_to(user_id));
        self.write(&key, &entries)?;
        debug!("Added entry {} under '{}'", entry.id, key);
        Ok(())
    }

    async fn remove(&self, id: &str, user_id: Option<&str>) -> Result<(), StorageError> {
        let key = user_storage_key(user_id);
        let mut entries = self.read(&key)?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(StorageError::NotFound(id.to_string()));
        }
        self.write(&key, &entries)?;
        debug!("Removed entry {} from '{}'", id, key);
        Ok(())
    }

    async fn clear(&self, user_id: Option<&str>) -> Result<(), StorageError> {
        let key = user_storage_key(user_id);
        self.store.remove(&key)?;
        info!("Cleared '{}'", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::income::{IncomeType, NewIncome, Thresholds};
    use crate::storage::key_value::MemoryKeyValueStore;

    fn storage() -> (Arc<MemoryKeyValueStore>, LocalKvStorage) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        (kv.clone(), LocalKvStorage::new(kv))
    }

    fn job(amount: f64, date: &str) -> IncomeEntry {
        NewIncome::job(amount, date)
            .into_entry(&Thresholds::default())
            .unwrap()
    }

    #[test]
    fn test_user_storage_key() {
        assert_eq!(user_storage_key(None), "ssiIncomeData");
        assert_eq!(user_storage_key(Some("u1")), "user_u1_ssiIncomeData");
    }

    #[tokio::test]
    async fn test_save_stamps_user_and_scopes_by_key() {
        let (kv, storage) = storage();
        storage.save(&[job(10.0, "2024-01-01")], Some("u1")).await.unwrap();
        storage.save(&[job(20.0, "2024-01-02")], Some("u2")).await.unwrap();

        let u1 = storage.load(Some("u1")).await.unwrap();
        assert_eq!(u1.len(), 1);
        assert_eq!(u1[0].user_id.as_deref(), Some("u1"));
        assert_eq!(u1[0].amount, 10.0);
        assert!(kv.get("user_u2_ssiIncomeData").unwrap().is_some());
        assert!(storage.load(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_is_idempotent_per_id() {
        let (_, storage) = storage();
        let e = job(5.0, "2024-01-01");
        storage.add(&e, Some("u1")).await.unwrap();
        storage.add(&e, Some("u1")).await.unwrap();
        let loaded = storage.load(Some("u1")).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind, IncomeType::Job);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (_, storage) = storage();
        let a = job(1.0, "2024-01-01");
        let b = job(2.0, "2024-01-02");
        storage.save(&[a.clone(), b.clone()], None).await.unwrap();
        storage.remove(&a.id, None).await.unwrap();
        assert!(matches!(
            storage.remove(&a.id, None).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(storage.load(None).await.unwrap(), vec![b]);
        storage.clear(None).await.unwrap();
        assert!(storage.load(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_load() {
        let (kv, storage) = storage();
        kv.set("ssiIncomeData", "[{\"id\":").unwrap();
        assert!(matches!(
            storage.load(None).await,
            Err(StorageError::Serialization(_))
        ));
    }
}
