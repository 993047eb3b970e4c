use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::{Map, Value};

use crate::error_handling::types::StorageError;
use crate::income::{sort_for_display, IncomeEntry};
use crate::storage::document_client::{Document, DocumentClient, FieldFilter, WriteOp};
use crate::storage::storage_trait::Storage;
use crate::storage::types::StorageType;

/// Default collection holding every user's entries.
pub const DEFAULT_COLLECTION: &str = "income-data";

const USER_FIELD: &str = "userId";

/// `firestore` adapter: one document per entry in a shared collection,
/// partitioned by the `userId` field.
///
/// Document handles never leave this module; entries are matched to
/// documents by their `id` field.
pub struct RemoteDocumentStorage {
    client: Arc<dyn DocumentClient>,
    collection: String,
}

impl RemoteDocumentStorage {
    pub fn new(client: Arc<dyn DocumentClient>, collection: &str) -> Self {
        Self {
            client,
            collection: collection.to_string(),
        }
    }

    async fn documents(&self, user_id: Option<&str>) -> Result<Vec<Document>, StorageError> {
        let filter = user_id.map(|uid| FieldFilter::eq(USER_FIELD, uid));
        self.client
            .query(&self.collection, filter.as_ref())
            .await
            .map_err(|e| {
                error!("Query on '{}' failed: {}", self.collection, e);
                e
            })
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StorageError> {
        self.client.commit(&self.collection, writes).await.map_err(|e| {
            error!("Commit to '{}' failed: {}", self.collection, e);
            e
        })
    }
}

fn to_fields(entry: &IncomeEntry, user_id: Option<&str>) -> Result<Map<String, Value>, StorageError> {
    match serde_json::to_value(entry.scoped_to(user_id))? {
        Value::Object(fields) => Ok(fields),
        other => Err(StorageError::Serialization(format!(
            "entry serialized to non-object {}",
            other
        ))),
    }
}

fn entry_id(doc: &Document) -> Option<&str> {
    doc.fields.get("id").and_then(Value::as_str)
}

fn delete_of(doc: Document) -> WriteOp {
    WriteOp::Delete { name: doc.name }
}

#[async_trait]
impl Storage for RemoteDocumentStorage {
    fn kind(&self) -> StorageType {
        StorageType::RemoteDocument
    }

    async fn load(&self, user_id: Option<&str>) -> Result<Vec<IncomeEntry>, StorageError> {
        let docs = self.documents(user_id).await?;
        let mut entries = docs
            .into_iter()
            .map(|doc| {
                serde_json::from_value::<IncomeEntry>(Value::Object(doc.fields)).map_err(|e| {
                    error!("Malformed document {}: {}", doc.name, e);
                    StorageError::from(e)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        sort_for_display(&mut entries);
        debug!("Loaded {} entr(ies) from '{}'", entries.len(), self.collection);
        Ok(entries)
    }

    async fn save(
        &self,
        entries: &[IncomeEntry],
        user_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let existing = self.documents(user_id).await?;
        let mut writes: Vec<WriteOp> = existing.into_iter().map(delete_of).collect();
        for entry in entries {
            writes.push(WriteOp::Create {
                fields: to_fields(entry, user_id)?,
            });
        }
        self.commit(writes).await?;
        info!("Saved {} entr(ies) to '{}'", entries.len(), self.collection);
        Ok(())
    }

    async fn add(&self, entry: &IncomeEntry, user_id: Option<&str>) -> Result<(), StorageError> {
        let fields = to_fields(entry, user_id)?;
        let stale: Vec<WriteOp> = self
            .documents(user_id)
            .await?
            .into_iter()
            .filter(|doc| entry_id(doc) == Some(entry.id.as_str()))
            .map(delete_of)
            .collect();

        if stale.is_empty() {
            self.client
                .create(&self.collection, fields)
                .await
                .map_err(|e| {
                    error!("Failed to add entry {}: {}", entry.id, e);
                    e
                })?;
        } else {
            let mut writes = stale;
            writes.push(WriteOp::Create { fields });
            self.commit(writes).await?;
        }
        debug!("Added entry {} to '{}'", entry.id, self.collection);
        Ok(())
    }

    async fn remove(&self, id: &str, user_id: Option<&str>) -> Result<(), StorageError> {
        let writes: Vec<WriteOp> = self
            .documents(user_id)
            .await?
            .into_iter()
            .filter(|doc| entry_id(doc) == Some(id))
            .map(delete_of)
            .collect();
        if writes.is_empty() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        self.commit(writes).await?;
        debug!("Removed entry {} from '{}'", id, self.collection);
        Ok(())
    }

    async fn clear(&self, user_id: Option<&str>) -> Result<(), StorageError> {
        let writes: Vec<WriteOp> = self
            .documents(user_id)
            .await?
            .into_iter()
            .map(delete_of)
            .collect();
        let count = writes.len();
        self.commit(writes).await?;
        info!("Cleared {} document(s) from '{}'", count, self.collection);
        Ok(())
    }
}
