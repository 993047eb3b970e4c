//! Storage subsystem
//!
//! This module provides the four interchangeable backends income entries can
//! be persisted to, behind one asynchronous trait.
//!
//! Components:
//! - `storage_trait`: the Storage trait defining a uniform API.
//! - `types`: backend identifiers and scopes shared by every adapter.
//! - `key_value` / `local_kv_storage`: JSON file key-value store and the
//!   `localStorage` adapter on top of it.
//! - `db_entities` / `document_storage`: SeaORM entity and the embedded
//!   SQLite `indexedDB` adapter.
//! - `document_client` / `remote_document`: document database clients and
//!   the `firestore` adapter.
//! - `realtime_client` / `realtime_storage`: realtime tree clients and the
//!   `realtimeDB` adapter, the only one that pushes updates.
//! - `sync_listener`: lifecycle of the realtime adapter's single listener
//!   and snapshot ordering.

pub mod db_entities;
pub mod document_client;
pub mod document_storage;
pub mod key_value;
pub mod local_kv_storage;
pub mod realtime_client;
pub mod realtime_storage;
pub mod remote_document;
pub mod storage_trait;
pub mod sync_listener;
pub mod types;
