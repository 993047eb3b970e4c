use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::error_handling::types::StorageError;
use crate::income::IncomeEntry;
use crate::storage::realtime_client::{ClosedCallback, RealtimeClient, ValueCallback};
use crate::storage::storage_trait::{SnapshotSink, Storage};
use crate::storage::sync_listener::{
    process_snapshot, snapshot_children, ListenerState, SyncListener,
};
use crate::storage::types::StorageType;

/// Path holding entries of the legacy unscoped mode.
pub const PUBLIC_PATH: &str = "public-data";

/// Path probed by [`RealtimeStorage::test_connection`].
pub const CONNECTION_TEST_PATH: &str = "connection-test";

const CONNECTION_TEST_MESSAGE: &str = "Connection test successful";
const USER_PATH_TEST_MESSAGE: &str = "User path test successful";

/// Tree path holding the entries of `user_id`.
pub fn scope_path(user_id: Option<&str>) -> String {
    match user_id {
        Some(uid) => format!("users/{}/income-data", uid),
        None => PUBLIC_PATH.to_string(),
    }
}

fn child_key(entry: &IncomeEntry, index: usize) -> String {
    if entry.id.is_empty() {
        format!("entry_{}_{}", Utc::now().timestamp_millis(), index)
    } else {
        entry.id.clone()
    }
}

/// `realtimeDB` adapter: entries live as children of the scope path, keyed
/// by entry id. It is the only backend that pushes updates.
///
/// At most one listener is attached at a time. Attach and teardown are
/// serialised by the listener lock so two loads never leave two listeners
/// registered. A listener the client closes on its own moves the state back
/// to `Detached`; the next load attaches a fresh one.
pub struct RealtimeStorage {
    client: Arc<dyn RealtimeClient>,
    listener: Arc<Mutex<SyncListener>>,
}

impl RealtimeStorage {
    pub fn new(client: Arc<dyn RealtimeClient>) -> Self {
        Self {
            client,
            listener: Arc::new(Mutex::new(SyncListener::new())),
        }
    }

    fn closed_callback(&self) -> ClosedCallback {
        let listener = Arc::clone(&self.listener);
        Arc::new(move |handle| {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move {
                listener.lock().await.mark_closed(handle);
            });
        })
    }

    /// Current lifecycle state of the sync listener.
    pub async fn listener_state(&self) -> ListenerState {
        self.listener.lock().await.state().clone()
    }

    /// Writes then reads back a probe at `connection-test`.
    pub async fn test_connection(&self) -> Result<(), StorageError> {
        self.probe(CONNECTION_TEST_PATH, CONNECTION_TEST_MESSAGE).await?;
        info!("Realtime database connection test successful");
        Ok(())
    }

    /// Writes then reads back a probe under the user's own subtree.
    pub async fn test_user_path(&self, user_id: &str) -> Result<(), StorageError> {
        if user_id.is_empty() {
            return Err(StorageError::InvalidConfiguration(
                "no user id provided for path test".to_string(),
            ));
        }
        let path = format!("users/{}/test", user_id);
        self.probe(&path, USER_PATH_TEST_MESSAGE).await?;
        info!("User data path test successful for {}", user_id);
        Ok(())
    }

    async fn probe(&self, path: &str, message: &str) -> Result<(), StorageError> {
        let payload = json!({
            "timestamp": Utc::now().timestamp_millis(),
            "message": message,
        });
        self.client.set(path, payload).await.map_err(|e| {
            error!("Probe write to '{}' failed: {}", path, e);
            e
        })?;
        let read = self.client.get(path).await?;
        let echoed = read
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str);
        if echoed != Some(message) {
            error!("Probe at '{}' read back unexpected data: {:?}", path, read);
            return Err(StorageError::Transport(format!(
                "unexpected probe data at '{}'",
                path
            )));
        }
        Ok(())
    }

    async fn teardown(&self, listener: &mut SyncListener) {
        if let Some(attachment) = listener.take_for_teardown() {
            self.client.unlisten(&attachment.path, attachment.handle).await;
        }
    }
}

#[async_trait]
impl Storage for RealtimeStorage {
    fn kind(&self) -> StorageType {
        StorageType::RealtimeSync
    }

    async fn load(&self, user_id: Option<&str>) -> Result<Vec<IncomeEntry>, StorageError> {
        let path = scope_path(user_id);
        let snapshot = self.client.get(&path).await.map_err(|e| {
            error!("Failed to read '{}': {}", path, e);
            e
        })?;
        let entries = process_snapshot(snapshot);
        debug!("Loaded {} entr(ies) from '{}'", entries.len(), path);
        Ok(entries)
    }

    async fn save(
        &self,
        entries: &[IncomeEntry],
        user_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let path = scope_path(user_id);
        let mut children = Map::new();
        for (i, entry) in entries.iter().enumerate() {
            children.insert(
                child_key(entry, i),
                serde_json::to_value(entry.scoped_to(user_id))?,
            );
        }
        let count = children.len();
        self.client
            .set(&path, Value::Object(children))
            .await
            .map_err(|e| {
                error!("Failed to save to '{}': {}", path, e);
                e
            })?;
        info!("Saved {} entr(ies) to '{}'", count, path);
        Ok(())
    }

    async fn add(&self, entry: &IncomeEntry, user_id: Option<&str>) -> Result<(), StorageError> {
        let path = format!("{}/{}", scope_path(user_id), child_key(entry, 0));
        let value = serde_json::to_value(entry.scoped_to(user_id))?;
        self.client.set(&path, value).await.map_err(|e| {
            error!("Failed to add entry at '{}': {}", path, e);
            e
        })?;
        debug!("Added entry at '{}'", path);
        Ok(())
    }

    async fn remove(&self, id: &str, user_id: Option<&str>) -> Result<(), StorageError> {
        let path = scope_path(user_id);
        let snapshot = self.client.get(&path).await?;
        let key = snapshot_children(snapshot)
            .into_iter()
            .find(|(key, child)| {
                key.as_str() == id || child.get("id").and_then(Value::as_str) == Some(id)
            })
            .map(|(key, _)| key)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let child_path = format!("{}/{}", path, key);
        self.client.remove(&child_path).await.map_err(|e| {
            error!("Failed to remove '{}': {}", child_path, e);
            e
        })?;
        debug!("Removed '{}'", child_path);
        Ok(())
    }

    async fn clear(&self, user_id: Option<&str>) -> Result<(), StorageError> {
        let path = scope_path(user_id);
        self.client.remove(&path).await.map_err(|e| {
            error!("Failed to clear '{}': {}", path, e);
            e
        })?;
        info!("Cleared '{}'", path);
        Ok(())
    }

    fn supports_subscribe(&self) -> bool {
        true
    }

    async fn load_and_subscribe(
        &self,
        user_id: Option<&str>,
        sink: SnapshotSink,
    ) -> Result<Vec<IncomeEntry>, StorageError> {
        let path = scope_path(user_id);
        let mut listener = self.listener.lock().await;

        if let Some(previous) = listener.begin_attach(&path) {
            self.client.unlisten(&previous.path, previous.handle).await;
        }

        let initial = match self.client.get(&path).await {
            Ok(snapshot) => process_snapshot(snapshot),
            Err(e) => {
                error!("Initial fetch of '{}' failed: {}", path, e);
                listener.abort_attach();
                return Err(e);
            }
        };

        let callback: ValueCallback = Arc::new(move |snapshot| sink(process_snapshot(snapshot)));
        let handle = match self.client.listen(&path, callback, self.closed_callback()).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to attach listener on '{}': {}", path, e);
                listener.abort_attach();
                return Err(e);
            }
        };
        if !listener.complete_attach(handle) {
            self.client.unlisten(&path, handle).await;
        }
        info!("Loaded {} entr(ies) from '{}' and subscribed", initial.len(), path);
        Ok(initial)
    }

    async fn detach(&self) {
        let mut listener = self.listener.lock().await;
        self.teardown(&mut listener).await;
    }
}
