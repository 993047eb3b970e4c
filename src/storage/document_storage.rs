use std::path::Path;

use async_trait::async_trait;
use log::{debug, error, info};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};

use crate::error_handling::types::StorageError;
use crate::income::{IncomeEntry, IncomeType};
use crate::storage::db_entities::{self as income_entries, Column, Entity};
use crate::storage::storage_trait::Storage;
use crate::storage::types::StorageType;

fn to_active_model(entry: &IncomeEntry, user_id: Option<&str>) -> income_entries::ActiveModel {
    let stamped = entry.scoped_to(user_id);
    // Unscoped writes keep each row under the user stamped on it, so a later
    // scoped upsert of the same id hits the same primary key.
    let owner = stamped.user_id.clone().unwrap_or_default();
    income_entries::ActiveModel {
        owner: Set(owner),
        id: Set(stamped.id),
        user_id: Set(stamped.user_id),
        kind: Set(stamped.kind.as_str().to_string()),
        amount: Set(stamped.amount),
        date: Set(stamped.date),
        description: Set(stamped.description),
        timestamp: Set(stamped.timestamp),
    }
}

fn into_entry(model: income_entries::Model) -> Result<IncomeEntry, StorageError> {
    let kind = model.kind.parse::<IncomeType>().map_err(|_| {
        error!("Row {} has unknown income type '{}'", model.id, model.kind);
        StorageError::Serialization(format!("unknown income type '{}'", model.kind))
    })?;
    Ok(IncomeEntry {
        id: model.id,
        kind,
        amount: model.amount,
        date: model.date,
        description: model.description,
        timestamp: model.timestamp,
        user_id: model.user_id,
    })
}

/// `indexedDB` adapter: an embedded SQLite document table accessed through
/// SeaORM.
///
/// `save` runs its delete and inserts in one transaction, so unlike the
/// remote stores a failed replace leaves the previous rows in place.
pub struct DocumentStorage {
    db: DatabaseConnection,
}

impl DocumentStorage {
    /// Opens (creating if missing) the SQLite file at `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create database dir {}: {}", parent.display(), e);
                StorageError::from(e)
            })?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        Self::connect(&url).await
    }

    /// Connects to an arbitrary SQLite URL, e.g. `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let mut opts = ConnectOptions::new(url.to_string());
        opts.max_connections(1).sqlx_logging(false);
        let db = Database::connect(opts).await.map_err(|e| {
            error!("Failed to open document store {}: {}", url, e);
            StorageError::from(e)
        })?;
        for statement in income_entries::CREATE_SCHEMA {
            db.execute_unprepared(statement).await.map_err(|e| {
                error!("Failed to apply document store schema: {}", e);
                StorageError::from(e)
            })?;
        }
        info!("DocumentStorage opened at {}", url);
        Ok(Self { db })
    }
}

#[async_trait]
impl Storage for DocumentStorage {
    fn kind(&self) -> StorageType {
        StorageType::LocalDocument
    }

    async fn load(&self, user_id: Option<&str>) -> Result<Vec<IncomeEntry>, StorageError> {
        let mut query = Entity::find();
        if let Some(uid) = user_id {
            query = query.filter(Column::Owner.eq(uid));
        }
        let rows = query
            .order_by_desc(Column::Date)
            .order_by_asc(Column::Timestamp)
            .all(&self.db)
            .await
            .map_err(|e| {
                error!("Failed to load entries: {}", e);
                StorageError::from(e)
            })?;
        debug!("Loaded {} row(s) for {:?}", rows.len(), user_id);
        rows.into_iter().map(into_entry).collect()
    }

    async fn save(
        &self,
        entries: &[IncomeEntry],
        user_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin().await?;

        let mut delete = Entity::delete_many();
        if let Some(uid) = user_id {
            delete = delete.filter(Column::Owner.eq(uid));
        }
        let removed = delete.exec(&txn).await.map_err(|e| {
            error!("Failed to delete previous entries: {}", e);
            StorageError::from(e)
        })?;

        if !entries.is_empty() {
            let models: Vec<_> = entries.iter().map(|e| to_active_model(e, user_id)).collect();
            Entity::insert_many(models)
                .exec_without_returning(&txn)
                .await
                .map_err(|e| {
                    error!("Failed to insert entries: {}", e);
                    StorageError::from(e)
                })?;
        }

        txn.commit().await?;
        info!(
            "Replaced {} row(s) with {} entr(ies) for {:?}",
            removed.rows_affected,
            entries.len(),
            user_id
        );
        Ok(())
    }

    async fn add(&self, entry: &IncomeEntry, user_id: Option<&str>) -> Result<(), StorageError> {
        Entity::insert(to_active_model(entry, user_id))
            .on_conflict(
                OnConflict::columns([Column::Owner, Column::Id])
                    .update_columns([
                        Column::UserId,
                        Column::Kind,
                        Column::Amount,
                        Column::Date,
                        Column::Description,
                        Column::Timestamp,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| {
                error!("Failed to add entry {}: {}", entry.id, e);
                StorageError::from(e)
            })?;
        debug!("Added entry {} for {:?}", entry.id, user_id);
        Ok(())
    }

    async fn remove(&self, id: &str, user_id: Option<&str>) -> Result<(), StorageError> {
        let mut delete = Entity::delete_many().filter(Column::Id.eq(id));
        if let Some(uid) = user_id {
            delete = delete.filter(Column::Owner.eq(uid));
        }
        let result = delete.exec(&self.db).await.map_err(|e| {
            error!("Failed to remove entry {}: {}", id, e);
            StorageError::from(e)
        })?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        debug!("Removed entry {} for {:?}", id, user_id);
        Ok(())
    }

    async fn clear(&self, user_id: Option<&str>) -> Result<(), StorageError> {
        let mut delete = Entity::delete_many();
        if let Some(uid) = user_id {
            delete = delete.filter(Column::Owner.eq(uid));
        }
        let result = delete.exec(&self.db).await.map_err(|e| {
            error!("Failed to clear entries: {}", e);
            StorageError::from(e)
        })?;
        info!("Cleared {} row(s) for {:?}", result.rows_affected, user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::income::{NewIncome, Thresholds};
    use tempfile::TempDir;

    async fn temp_db() -> (TempDir, DocumentStorage) {
        let dir = TempDir::new().unwrap();
        let storage = DocumentStorage::open(dir.path().join("test.sqlite3"))
            .await
            .unwrap();
        (dir, storage)
    }

    fn job(amount: f64, date: &str) -> IncomeEntry {
        NewIncome::job(amount, date)
            .into_entry(&Thresholds::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_db_save_and_load_scoped() {
        let (_dir, storage) = temp_db().await;
        let a = job(500.0, "2024-03-01");
        let b = job(1200.0, "2024-02-01");
        storage.save(&[b.clone(), a.clone()], Some("u1")).await.unwrap();
        storage.save(&[job(1.0, "2024-01-01")], Some("u2")).await.unwrap();

        let loaded = storage.load(Some("u1")).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, a.id);
        assert_eq!(loaded[1].id, b.id);
        assert!(loaded.iter().all(|e| e.user_id.as_deref() == Some("u1")));

        // Unscoped mode sees every row.
        assert_eq!(storage.load(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_db_save_replaces_previous_rows() {
        let (_dir, storage) = temp_db().await;
        storage.save(&[job(1.0, "2024-01-01"), job(2.0, "2024-01-02")], Some("u1")).await.unwrap();
        let keep = job(3.0, "2024-01-03");
        storage.save(&[keep.clone()], Some("u1")).await.unwrap();
        let loaded = storage.load(Some("u1")).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, keep.id);
    }

    #[tokio::test]
    async fn test_db_add_remove_clear() {
        let (_dir, storage) = temp_db().await;
        let e = job(42.0, "2024-04-01");
        storage.add(&e, Some("u1")).await.unwrap();
        storage.add(&e, Some("u1")).await.unwrap();
        assert_eq!(storage.load(Some("u1")).await.unwrap().len(), 1);

        assert!(matches!(
            storage.remove(&e.id, Some("u2")).await,
            Err(StorageError::NotFound(_))
        ));
        storage.remove(&e.id, Some("u1")).await.unwrap();
        assert!(storage.load(Some("u1")).await.unwrap().is_empty());

        storage.add(&job(1.0, "2024-01-01"), Some("u1")).await.unwrap();
        storage.add(&job(2.0, "2024-01-01"), Some("u2")).await.unwrap();
        storage.clear(Some("u1")).await.unwrap();
        assert!(storage.load(Some("u1")).await.unwrap().is_empty());
        assert_eq!(storage.load(Some("u2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_db_unscoped_rewrite_keeps_ids_unique_per_user() {
        let (_dir, storage) = temp_db().await;
        let e = job(42.0, "2024-04-01");
        storage.add(&e, Some("u1")).await.unwrap();

        let all = storage.load(None).await.unwrap();
        storage.save(&all, None).await.unwrap();
        storage.add(&e, Some("u1")).await.unwrap();

        let loaded = storage.load(Some("u1")).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, e.id);

        storage.remove(&e.id, Some("u1")).await.unwrap();
        assert!(storage.load(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_db_unscoped_save_keeps_same_id_for_two_users() {
        let (_dir, storage) = temp_db().await;
        let e = job(7.0, "2024-05-01");
        storage.add(&e, Some("u1")).await.unwrap();
        storage.add(&e, Some("u2")).await.unwrap();

        let all = storage.load(None).await.unwrap();
        assert_eq!(all.len(), 2);
        storage.save(&all, None).await.unwrap();
        assert_eq!(storage.load(Some("u1")).await.unwrap().len(), 1);
        assert_eq!(storage.load(Some("u2")).await.unwrap().len(), 1);
    }
}
