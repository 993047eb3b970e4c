use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};

use crate::configuration::Config;
use crate::error_handling::types::StorageError;
use crate::storage::document_client::{HttpDocumentClient, InMemoryDocumentClient};
use crate::storage::document_storage::DocumentStorage;
use crate::storage::key_value::KeyValueStore;
use crate::storage::local_kv_storage::LocalKvStorage;
use crate::storage::realtime_client::{HttpRealtimeClient, InMemoryRealtimeDb};
use crate::storage::realtime_storage::RealtimeStorage;
use crate::storage::remote_document::{RemoteDocumentStorage, DEFAULT_COLLECTION};
use crate::storage::storage_trait::Storage;
use crate::storage::types::StorageType;

/// The adapters available to a session, one per backend at most.
///
/// The realtime adapter is also kept under its concrete type so its
/// connection diagnostics stay reachable.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<StorageType, Arc<dyn Storage>>,
    realtime: Option<Arc<RealtimeStorage>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `storage` under its own kind, replacing any previous one.
    pub fn register(&mut self, storage: Arc<dyn Storage>) {
        let kind = storage.kind();
        if self.backends.insert(kind, storage).is_some() {
            warn!("Replacing registered {} adapter", kind);
        }
    }

    pub fn register_realtime(&mut self, storage: Arc<RealtimeStorage>) {
        self.realtime = Some(storage.clone());
        self.register(storage);
    }

    pub fn get(&self, kind: StorageType) -> Option<Arc<dyn Storage>> {
        self.backends.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StorageType) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Registered kinds in the canonical backend order.
    pub fn kinds(&self) -> Vec<StorageType> {
        StorageType::ALL
            .into_iter()
            .filter(|k| self.backends.contains_key(k))
            .collect()
    }

    pub fn realtime(&self) -> Option<Arc<RealtimeStorage>> {
        self.realtime.clone()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Storage>> {
        self.backends.values()
    }

    /// Every backend, with the remote ones served by in-process databases
    /// and the local document store in memory.
    pub async fn in_process(kv: Arc<dyn KeyValueStore>) -> Result<Self, StorageError> {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalKvStorage::new(kv)));
        registry.register(Arc::new(DocumentStorage::connect("sqlite::memory:").await?));
        registry.register(Arc::new(RemoteDocumentStorage::new(
            Arc::new(InMemoryDocumentClient::new()),
            DEFAULT_COLLECTION,
        )));
        registry.register_realtime(Arc::new(RealtimeStorage::new(Arc::new(
            InMemoryRealtimeDb::new(),
        ))));
        Ok(registry)
    }

    /// Local backends always; remote ones when their endpoint is configured.
    pub async fn from_config(
        config: &Config,
        kv: Arc<dyn KeyValueStore>,
    ) -> Result<Self, StorageError> {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalKvStorage::new(kv)));
        registry.register(Arc::new(DocumentStorage::open(config.document_db_path()).await?));

        match &config.document_project {
            Some(project) => {
                let client = HttpDocumentClient::new(
                    &config.document_url,
                    project,
                    config.document_auth.clone(),
                );
                registry.register(Arc::new(RemoteDocumentStorage::new(
                    Arc::new(client),
                    &config.document_collection,
                )));
            }
            None => info!("No document project configured, firestore backend disabled"),
        }

        match &config.realtime_url {
            Some(url) => {
                let client = HttpRealtimeClient::new(url, config.realtime_auth.clone());
                registry.register_realtime(Arc::new(RealtimeStorage::new(Arc::new(client))));
            }
            None => info!("No realtime URL configured, realtimeDB backend disabled"),
        }
        Ok(registry)
    }
}
