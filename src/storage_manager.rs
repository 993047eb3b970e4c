//! Storage Manager
//!
//! The single facade the outer layers (UI, auth, CLI) talk to. It owns the
//! in-memory working set, selects the active backend, scopes every call by
//! the current user and reports outcomes as [`StorageEvent`]s.

pub mod events;
pub mod manager;
pub mod registry;

pub use events::{NotificationLevel, StorageEvent};
pub use manager::{ManagerSettings, StorageManager, PREFERENCE_KEY};
pub use registry::BackendRegistry;
