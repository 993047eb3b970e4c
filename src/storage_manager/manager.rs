use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::error_handling::types::{StorageError, TrackerError};
use crate::income::{sort_for_display, IncomeEntry, IncomeSummary, Thresholds};
use crate::storage::key_value::KeyValueStore;
use crate::storage::storage_trait::{SnapshotSink, Storage};
use crate::storage::types::{Scope, StorageType};
use crate::storage_manager::events::StorageEvent;
use crate::storage_manager::registry::BackendRegistry;

/// Key of the persisted backend preference in the local key-value store.
pub const PREFERENCE_KEY: &str = "preferredStorageType";

const EVENT_CAPACITY: usize = 64;

/// Knobs the manager needs beyond its backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManagerSettings {
    pub thresholds: Thresholds,
    /// Backend used when the stored preference is missing or unknown.
    pub default_backend: StorageType,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            default_backend: StorageType::default(),
        }
    }
}

/// Mutable session state, shared with the push sink.
///
/// `scope_generation` changes whenever the (backend, user) scope changes or
/// listeners are detached; results tagged with an older generation are
/// dropped. `data_version` changes on every write to `entries`, so a load
/// that raced with a push does not overwrite the newer pushed data.
#[derive(Debug)]
struct SessionState {
    current_backend: StorageType,
    current_user_id: Option<String>,
    entries: Vec<IncomeEntry>,
    scope_generation: u64,
    data_version: u64,
}

impl SessionState {
    fn scope(&self) -> Scope {
        Scope::new(self.current_backend, self.current_user_id.as_deref())
    }

    fn replace_entries(&mut self, mut entries: Vec<IncomeEntry>) {
        sort_for_display(&mut entries);
        self.entries = entries;
        self.data_version += 1;
    }
}

/// Snapshot of the scope an operation was started for.
#[derive(Debug, Clone)]
struct Ticket {
    backend: StorageType,
    user_id: Option<String>,
    generation: u64,
    version: u64,
}

/// Session facade over the registered storage backends.
///
/// Every public operation reports success as a `bool`, logs failures and
/// broadcasts a [`StorageEvent::Notification`]; changes to the working set
/// are broadcast as [`StorageEvent::Refreshed`]. Adapter errors never
/// propagate to the caller.
///
/// The state lock is never held across an `.await`, so the manager can be
/// shared behind an `Arc` and driven from several tasks.
pub struct StorageManager {
    registry: BackendRegistry,
    preferences: Arc<dyn KeyValueStore>,
    thresholds: Thresholds,
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<StorageEvent>,
}

impl StorageManager {
    /// Builds a session with the persisted backend preference.
    ///
    /// Falls back to `settings.default_backend` when the preference is
    /// missing or unknown, and then to the first registered backend when
    /// that one is not available.
    pub fn new(
        registry: BackendRegistry,
        preferences: Arc<dyn KeyValueStore>,
        settings: ManagerSettings,
    ) -> Result<Self, TrackerError> {
        let stored = preferences.get(PREFERENCE_KEY).unwrap_or_else(|e| {
            warn!("Could not read backend preference: {}", e);
            None
        });
        let preferred = StorageType::from_preference(stored.as_deref(), settings.default_backend);

        let backend = if registry.contains(preferred) {
            preferred
        } else {
            let fallback = registry.kinds().first().copied().ok_or_else(|| {
                StorageError::InvalidConfiguration("no storage backend registered".to_string())
            })?;
            warn!(
                "Preferred backend {} is not available, using {}",
                preferred, fallback
            );
            fallback
        };
        info!("Storage manager starting on {}", backend);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            registry,
            preferences,
            thresholds: settings.thresholds,
            state: Arc::new(Mutex::new(SessionState {
                current_backend: backend,
                current_user_id: None,
                entries: Vec::new(),
                scope_generation: 0,
                data_version: 0,
            })),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StorageEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_refresh(&self, state: &SessionState) {
        self.emit(StorageEvent::Refreshed {
            backend: state.current_backend,
            entries: state.entries.clone(),
        });
    }

    fn ticket(&self) -> Ticket {
        let state = self.lock();
        Ticket {
            backend: state.current_backend,
            user_id: state.current_user_id.clone(),
            generation: state.scope_generation,
            version: state.data_version,
        }
    }

    fn adapter(&self, backend: StorageType) -> Result<Arc<dyn Storage>, StorageError> {
        self.registry.get(backend).ok_or_else(|| {
            StorageError::InvalidConfiguration(format!("backend {} is not available", backend))
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn current_backend(&self) -> StorageType {
        self.lock().current_backend
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.lock().current_user_id.clone()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// The working set in display order.
    pub fn entries(&self) -> Vec<IncomeEntry> {
        self.lock().entries.clone()
    }

    pub fn summary(&self) -> IncomeSummary {
        IncomeSummary::compute(&self.lock().entries, &self.thresholds)
    }

    /// Switches to `storage_type` and reloads from it.
    ///
    /// Unknown or unavailable backends are rejected and the current one is
    /// kept. On success the choice is persisted, the previous backend's
    /// listener is detached and the working set is replaced by the new
    /// backend's content.
    pub async fn set_backend(&self, storage_type: &str) -> bool {
        let backend = match storage_type.parse::<StorageType>() {
            Ok(b) if self.registry.contains(b) => b,
            Ok(b) => {
                error!("Storage backend {} is not configured", b);
                self.emit(StorageEvent::error(format!("{} is not available", b.label())));
                return false;
            }
            Err(e) => {
                error!("Rejected backend switch: {}", e);
                self.emit(StorageEvent::error(format!(
                    "Invalid storage type: {}",
                    storage_type
                )));
                return false;
            }
        };

        if let Err(e) = self.preferences.set(PREFERENCE_KEY, backend.as_str()) {
            warn!("Could not persist backend preference: {}", e);
        }

        let previous = {
            let mut state = self.lock();
            let previous = state.current_backend;
            state.current_backend = backend;
            state.scope_generation += 1;
            state.entries.clear();
            state.data_version += 1;
            previous
        };
        if previous != backend {
            if let Some(adapter) = self.registry.get(previous) {
                adapter.detach().await;
            }
        }
        info!("Storage backend switched from {} to {}", previous, backend);
        self.emit(StorageEvent::success(format!(
            "Switched to {}",
            backend.label()
        )));

        self.load_from_storage().await;
        true
    }

    /// Records the account scope. Does not reload; callers follow up with
    /// [`load_from_storage`](Self::load_from_storage).
    pub fn set_user_id(&self, user_id: Option<&str>) {
        let user_id = user_id.filter(|u| !u.is_empty()).map(str::to_string);
        let mut state = self.lock();
        if state.current_user_id != user_id {
            debug!("User scope changed to {:?}", user_id);
            state.current_user_id = user_id;
        }
        state.scope_generation += 1;
    }

    /// Detaches every live listener, e.g. on sign-out. Pushes already in
    /// flight are discarded.
    pub async fn detach_listeners(&self) {
        self.lock().scope_generation += 1;
        for adapter in self.registry.all() {
            adapter.detach().await;
        }
        debug!("All storage listeners detached");
    }

    fn make_sink(&self, ticket: &Ticket) -> SnapshotSink {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let backend = ticket.backend;
        let generation = ticket.generation;
        let initial = Arc::new(AtomicBool::new(true));

        Arc::new(move |entries: Vec<IncomeEntry>| {
            let first = initial.swap(false, Ordering::SeqCst);
            let refreshed = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.scope_generation != generation || state.current_backend != backend {
                    debug!("Discarding push for stale scope");
                    return;
                }
                state.replace_entries(entries);
                state.entries.clone()
            };
            debug!("Applied pushed snapshot of {} entr(ies)", refreshed.len());
            let _ = events.send(StorageEvent::Refreshed {
                backend,
                entries: refreshed,
            });
            if !first {
                let _ = events.send(StorageEvent::info("Data updated from another device"));
            }
        })
    }

    async fn reload(&self, notify: bool) -> bool {
        let ticket = self.ticket();
        let scope = Scope::new(ticket.backend, ticket.user_id.as_deref());
        let adapter = match self.adapter(ticket.backend) {
            Ok(a) => a,
            Err(e) => {
                error!("Cannot load {}: {}", scope, e);
                return false;
            }
        };

        let result = if adapter.supports_subscribe() {
            let sink = self.make_sink(&ticket);
            adapter
                .load_and_subscribe(ticket.user_id.as_deref(), sink)
                .await
        } else {
            adapter.load(ticket.user_id.as_deref()).await
        };

        match result {
            Ok(entries) => {
                let mut state = self.lock();
                if state.scope_generation != ticket.generation {
                    debug!("Discarding load for stale scope {}", scope);
                    return false;
                }
                if state.data_version == ticket.version {
                    state.replace_entries(entries);
                } else {
                    debug!("Working set changed during load of {}, keeping newer data", scope);
                }
                info!("Loaded {} entr(ies) for {}", state.entries.len(), state.scope());
                self.emit_refresh(&state);
                drop(state);
                if notify {
                    self.emit(StorageEvent::success(format!(
                        "Data loaded successfully from {}",
                        ticket.backend.label()
                    )));
                }
                true
            }
            Err(e) => {
                error!("Failed to load {}: {}", scope, e);
                self.emit(StorageEvent::error(format!(
                    "Failed to load data from {}",
                    ticket.backend.label()
                )));
                false
            }
        }
    }

    /// Replaces the working set with the active backend's content for the
    /// current user. On failure the previous working set is kept.
    pub async fn load_from_storage(&self) -> bool {
        self.reload(true).await
    }

    /// Writes the whole working set to the active backend.
    pub async fn save_to_storage(&self) -> bool {
        let (ticket, entries) = {
            let state = self.lock();
            (
                Ticket {
                    backend: state.current_backend,
                    user_id: state.current_user_id.clone(),
                    generation: state.scope_generation,
                    version: state.data_version,
                },
                state.entries.clone(),
            )
        };
        let label = ticket.backend.label();
        let result = match self.adapter(ticket.backend) {
            Ok(adapter) => adapter.save(&entries, ticket.user_id.as_deref()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.emit(StorageEvent::success(format!("Data saved successfully to {}", label)));
                true
            }
            Err(e) => {
                error!("Failed to save to {}: {}", label, e);
                self.emit(StorageEvent::error(format!("Failed to save data to {}", label)));
                false
            }
        }
    }

    /// Adds `entry` to the working set right away, persists it with the
    /// backend's native append and then reconciles with a reload.
    ///
    /// An entry whose id is already present replaces the old one, so a
    /// retried add never duplicates. The optimistic insert is undone when
    /// the backend rejects it.
    pub async fn add_entry(&self, entry: IncomeEntry) -> bool {
        let (ticket, replaced) = {
            let mut state = self.lock();
            let replaced = state
                .entries
                .iter()
                .position(|e| e.id == entry.id)
                .map(|i| state.entries.remove(i));
            let mut entries = std::mem::take(&mut state.entries);
            entries.push(entry.scoped_to(state.current_user_id.as_deref()));
            state.replace_entries(entries);
            self.emit_refresh(&state);
            (
                Ticket {
                    backend: state.current_backend,
                    user_id: state.current_user_id.clone(),
                    generation: state.scope_generation,
                    version: state.data_version,
                },
                replaced,
            )
        };
        let label = ticket.backend.label();

        let result = match self.adapter(ticket.backend) {
            Ok(adapter) => adapter.add(&entry, ticket.user_id.as_deref()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Failed to add entry {} to {}: {}", entry.id, label, e);
            let mut state = self.lock();
            if state.scope_generation == ticket.generation {
                let mut entries = std::mem::take(&mut state.entries);
                entries.retain(|e| e.id != entry.id);
                entries.extend(replaced);
                state.replace_entries(entries);
                self.emit_refresh(&state);
            }
            drop(state);
            self.emit(StorageEvent::error(format!("Failed to add entry to {}", label)));
            return false;
        }

        info!("Entry {} added to {}", entry.id, label);
        self.emit(StorageEvent::success(format!("Entry added to {}", label)));
        self.reload(false).await;
        true
    }

    /// Removes one entry from the working set and the active backend, then
    /// reconciles with a reload.
    pub async fn delete_entry(&self, id: &str) -> bool {
        let (ticket, removed) = {
            let mut state = self.lock();
            let Some(pos) = state.entries.iter().position(|e| e.id == id) else {
                drop(state);
                warn!("Entry {} is not in the working set", id);
                self.emit(StorageEvent::error("Entry not found"));
                return false;
            };
            let removed = state.entries.remove(pos);
            state.data_version += 1;
            self.emit_refresh(&state);
            (
                Ticket {
                    backend: state.current_backend,
                    user_id: state.current_user_id.clone(),
                    generation: state.scope_generation,
                    version: state.data_version,
                },
                removed,
            )
        };
        let label = ticket.backend.label();

        let result = match self.adapter(ticket.backend) {
            Ok(adapter) => adapter.remove(id, ticket.user_id.as_deref()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                debug!("Entry {} was already gone from {}", id, label);
            }
            Err(e) => {
                error!("Failed to delete entry {} from {}: {}", id, label, e);
                let mut state = self.lock();
                if state.scope_generation == ticket.generation {
                    let mut entries = std::mem::take(&mut state.entries);
                    entries.push(removed);
                    state.replace_entries(entries);
                    self.emit_refresh(&state);
                }
                drop(state);
                self.emit(StorageEvent::error(format!(
                    "Failed to delete entry from {}",
                    label
                )));
                return false;
            }
        }

        info!("Entry {} deleted from {}", id, label);
        self.emit(StorageEvent::success(format!("Entry deleted from {}", label)));
        self.reload(false).await;
        true
    }

    /// Deletes every entry of the current user from the active backend,
    /// then empties the working set.
    pub async fn clear_storage(&self) -> bool {
        let ticket = self.ticket();
        let label = ticket.backend.label();
        let result = match self.adapter(ticket.backend) {
            Ok(adapter) => adapter.clear(ticket.user_id.as_deref()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                let mut state = self.lock();
                if state.scope_generation == ticket.generation {
                    state.replace_entries(Vec::new());
                    self.emit_refresh(&state);
                }
                drop(state);
                info!("Cleared all entries from {}", label);
                self.emit(StorageEvent::success(format!("All data cleared from {}", label)));
                true
            }
            Err(e) => {
                error!("Failed to clear {}: {}", label, e);
                self.emit(StorageEvent::error(format!("Failed to clear data from {}", label)));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::income::{NewIncome, Thresholds};
    use crate::storage::key_value::MemoryKeyValueStore;
    use crate::storage_manager::events::NotificationLevel;

    async fn manager_on(backend: &str) -> (Arc<MemoryKeyValueStore>, StorageManager) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.set(PREFERENCE_KEY, backend).unwrap();
        let registry = BackendRegistry::in_process(kv.clone()).await.unwrap();
        let manager = StorageManager::new(registry, kv.clone(), ManagerSettings::default()).unwrap();
        (kv, manager)
    }

    fn job(amount: f64, date: &str) -> IncomeEntry {
        NewIncome::job(amount, date)
            .into_entry(&Thresholds::default())
            .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<StorageEvent>) -> Vec<StorageEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_preference_selects_initial_backend() {
        let (_, manager) = manager_on("indexedDB").await;
        assert_eq!(manager.current_backend(), StorageType::LocalDocument);

        let (_, manager) = manager_on("garbage").await;
        assert_eq!(manager.current_backend(), StorageType::RealtimeSync);
    }

    #[tokio::test]
    async fn test_unavailable_default_falls_back_to_first_registered() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(crate::storage::local_kv_storage::LocalKvStorage::new(
            kv.clone(),
        )));
        let manager = StorageManager::new(registry, kv, ManagerSettings::default()).unwrap();
        assert_eq!(manager.current_backend(), StorageType::LocalKeyValue);
    }

    #[tokio::test]
    async fn test_empty_registry_is_rejected() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        assert!(StorageManager::new(BackendRegistry::new(), kv, ManagerSettings::default()).is_err());
    }

    #[tokio::test]
    async fn test_set_backend_bogus_keeps_current() {
        let (kv, manager) = manager_on("localStorage").await;
        let mut rx = manager.subscribe_events();
        assert!(!manager.set_backend("bogus").await);
        assert_eq!(manager.current_backend(), StorageType::LocalKeyValue);
        assert_eq!(kv.get(PREFERENCE_KEY).unwrap().as_deref(), Some("localStorage"));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            StorageEvent::Notification { level: NotificationLevel::Error, .. }
        )));
    }

    #[tokio::test]
    async fn test_set_backend_persists_preference_and_reloads() {
        let (kv, manager) = manager_on("localStorage").await;
        assert!(manager.add_entry(job(10.0, "2024-01-01")).await);
        assert!(manager.set_backend("indexedDB").await);
        assert_eq!(kv.get(PREFERENCE_KEY).unwrap().as_deref(), Some("indexedDB"));
        assert!(manager.entries().is_empty());
    }

    #[tokio::test]
    async fn test_add_then_load_has_entry_once() {
        let (_, manager) = manager_on("localStorage").await;
        manager.set_user_id(Some("u1"));
        let entry = job(500.0, "2024-03-01");
        assert!(manager.add_entry(entry.clone()).await);
        assert!(manager.add_entry(entry.clone()).await);
        assert!(manager.load_from_storage().await);
        let entries = manager.entries();
        assert_eq!(entries.iter().filter(|e| e.id == entry.id).count(), 1);
        assert_eq!(entries[0].user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_set_user_id_does_not_reload() {
        let (_, manager) = manager_on("localStorage").await;
        manager.set_user_id(Some("u1"));
        manager.add_entry(job(5.0, "2024-01-01")).await;
        manager.set_user_id(Some("u2"));
        assert_eq!(manager.entries().len(), 1);
        manager.load_from_storage().await;
        assert!(manager.entries().is_empty());
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let (_, manager) = manager_on("indexedDB").await;
        let a = job(1.0, "2024-01-01");
        let b = job(2.0, "2024-01-02");
        manager.add_entry(a.clone()).await;
        manager.add_entry(b.clone()).await;
        assert!(manager.delete_entry(&a.id).await);
        assert!(!manager.delete_entry("missing").await);
        manager.load_from_storage().await;
        assert_eq!(manager.entries(), vec![b]);
    }

    #[tokio::test]
    async fn test_clear_then_load_is_empty() {
        let (_, manager) = manager_on("firestore").await;
        manager.add_entry(job(1.0, "2024-01-01")).await;
        assert!(manager.clear_storage().await);
        assert!(manager.entries().is_empty());
        assert!(manager.load_from_storage().await);
        assert!(manager.entries().is_empty());
    }

    #[tokio::test]
    async fn test_push_notifies_only_after_initial_load() {
        let (_, manager) = manager_on("realtimeDB").await;
        manager.set_user_id(Some("u1"));
        let mut rx = manager.subscribe_events();
        assert!(manager.load_from_storage().await);
        let updates = |events: &[StorageEvent]| {
            events
                .iter()
                .filter(|e| matches!(e, StorageEvent::Notification { message, .. }
                    if message == "Data updated from another device"))
                .count()
        };
        assert_eq!(updates(&drain(&mut rx)), 0);

        // A write from another device reaches the attached listener.
        let realtime = manager.registry().realtime().unwrap();
        realtime.add(&job(7.0, "2024-05-05"), Some("u1")).await.unwrap();
        assert_eq!(updates(&drain(&mut rx)), 1);
        assert_eq!(manager.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_summary_reflects_working_set() {
        let (_, manager) = manager_on("localStorage").await;
        manager.add_entry(job(500.0, "2024-03-01")).await;
        manager.add_entry(job(1200.0, "2024-02-01")).await;
        let summary = manager.summary();
        assert_eq!(summary.job_total, 1700.0);
        assert_eq!(summary.remaining_allowed, 0.0);
    }

    /// Local adapter whose loads can be held open until released, so the
    /// working set can change while a load is in flight.
    struct GatedStorage {
        inner: crate::storage::local_kv_storage::LocalKvStorage,
        armed: AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        sink: Mutex<Option<SnapshotSink>>,
    }

    impl GatedStorage {
        fn new(kv: Arc<MemoryKeyValueStore>) -> Self {
            Self {
                inner: crate::storage::local_kv_storage::LocalKvStorage::new(kv),
                armed: AtomicBool::new(false),
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
                sink: Mutex::new(None),
            }
        }

        fn push(&self, entries: Vec<IncomeEntry>) {
            let sink = self.sink.lock().unwrap().clone().unwrap();
            sink(entries);
        }
    }

    #[async_trait::async_trait]
    impl Storage for GatedStorage {
        fn kind(&self) -> StorageType {
            StorageType::LocalKeyValue
        }

        async fn load(&self, user_id: Option<&str>) -> Result<Vec<IncomeEntry>, StorageError> {
            let snapshot = self.inner.load(user_id).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            snapshot
        }

        async fn save(
            &self,
            entries: &[IncomeEntry],
            user_id: Option<&str>,
        ) -> Result<(), StorageError> {
            self.inner.save(entries, user_id).await
        }

        async fn add(&self, entry: &IncomeEntry, user_id: Option<&str>) -> Result<(), StorageError> {
            self.inner.add(entry, user_id).await
        }

        async fn remove(&self, id: &str, user_id: Option<&str>) -> Result<(), StorageError> {
            self.inner.remove(id, user_id).await
        }

        async fn clear(&self, user_id: Option<&str>) -> Result<(), StorageError> {
            self.inner.clear(user_id).await
        }

        fn supports_subscribe(&self) -> bool {
            true
        }

        async fn load_and_subscribe(
            &self,
            user_id: Option<&str>,
            sink: SnapshotSink,
        ) -> Result<Vec<IncomeEntry>, StorageError> {
            *self.sink.lock().unwrap() = Some(sink);
            self.load(user_id).await
        }
    }

    fn gated_manager() -> (Arc<GatedStorage>, Arc<StorageManager>) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let gated = Arc::new(GatedStorage::new(kv.clone()));
        let mut registry = BackendRegistry::new();
        registry.register(gated.clone());
        let manager = StorageManager::new(registry, kv, ManagerSettings::default()).unwrap();
        (gated, Arc::new(manager))
    }

    #[tokio::test]
    async fn test_load_finishing_after_user_change_is_discarded() {
        let (gated, manager) = gated_manager();
        gated.inner.add(&job(100.0, "2024-01-01"), Some("u1")).await.unwrap();
        manager.set_user_id(Some("u1"));

        gated.armed.store(true, Ordering::SeqCst);
        let in_flight = tokio::spawn({
            let manager = manager.clone();
            async move { manager.load_from_storage().await }
        });
        gated.entered.notified().await;
        manager.set_user_id(Some("u2"));
        gated.release.notify_one();

        assert!(!in_flight.await.unwrap());
        assert!(manager.entries().is_empty());
        assert_eq!(manager.current_user_id().as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_load_finishing_after_push_keeps_pushed_data() {
        let (gated, manager) = gated_manager();
        gated.inner.add(&job(100.0, "2024-01-01"), Some("u1")).await.unwrap();
        manager.set_user_id(Some("u1"));

        gated.armed.store(true, Ordering::SeqCst);
        let in_flight = tokio::spawn({
            let manager = manager.clone();
            async move { manager.load_from_storage().await }
        });
        gated.entered.notified().await;
        let pushed = job(250.0, "2024-02-01").scoped_to(Some("u1"));
        gated.push(vec![pushed.clone()]);
        gated.release.notify_one();

        assert!(in_flight.await.unwrap());
        assert_eq!(manager.entries(), vec![pushed]);
    }
}
