//! # Sync Listener Lifecycle
//!
//! Tracks the single live listener the realtime backend keeps on a scope
//! path, and converts the snapshots it pushes into ordered entry lists.
//!
//! ## States
//!
//! ```text
//!             load (after teardown)         handle returned
//! ┌──────────┐ ───────────────────▶ ┌───────────┐ ─────────────▶ ┌──────────┐
//! │ Detached │                      │ Attaching │                │ Attached │
//! └──────────┘ ◀─────────────────── └───────────┘                └──────────┘
//!      ▲          fetch/listen failed                                 │
//!      └──────────────────────────────────────────────────────────────┘
//!         teardown (sign-out, backend switch, reload) or listener closed
//! ```
//!
//! The path and the handle are recorded together on `Attached`, and teardown
//! always unregisters at the recorded path, never at one recomputed from the
//! current user.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::{debug, warn};
use serde_json::Value;

use crate::income::{sort_for_display, IncomeEntry};
use crate::storage::realtime_client::ListenerHandle;

/// A registered listener and the path it was registered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: String,
    pub handle: ListenerHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ListenerState {
    #[default]
    Detached,
    Attaching {
        path: String,
    },
    Attached(Attachment),
}

/// State machine for the one listener a realtime session may hold.
#[derive(Debug, Default)]
pub struct SyncListener {
    state: ListenerState,
}

impl SyncListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ListenerState {
        &self.state
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.state, ListenerState::Attached(_))
    }

    /// Path of the attached listener, if any.
    pub fn attached_path(&self) -> Option<&str> {
        match &self.state {
            ListenerState::Attached(a) => Some(&a.path),
            _ => None,
        }
    }

    /// Moves to `Detached` and hands back whatever listener was attached so
    /// the caller can unregister it at its recorded path.
    pub fn take_for_teardown(&mut self) -> Option<Attachment> {
        match std::mem::take(&mut self.state) {
            ListenerState::Attached(attachment) => {
                debug!("Sync listener on '{}' detached", attachment.path);
                Some(attachment)
            }
            ListenerState::Attaching { path } => {
                debug!("Abandoned attach on '{}'", path);
                None
            }
            ListenerState::Detached => None,
        }
    }

    /// `Detached -> Attaching`. Any previous attachment is returned and must
    /// be torn down by the caller.
    pub fn begin_attach(&mut self, path: &str) -> Option<Attachment> {
        let previous = self.take_for_teardown();
        self.state = ListenerState::Attaching {
            path: path.to_string(),
        };
        debug!("Sync listener attaching on '{}'", path);
        previous
    }

    /// `Attaching -> Attached`. Returns `false` when no attach was pending,
    /// in which case the caller owns `handle` and must unregister it.
    pub fn complete_attach(&mut self, handle: ListenerHandle) -> bool {
        match std::mem::take(&mut self.state) {
            ListenerState::Attaching { path } => {
                debug!("Sync listener attached on '{}' as {:?}", path, handle);
                self.state = ListenerState::Attached(Attachment { path, handle });
                true
            }
            other => {
                warn!("Listener {:?} registered with no attach pending", handle);
                self.state = other;
                false
            }
        }
    }

    /// `Attached -> Detached` when the listener `handle` died on its own.
    /// The client has already dropped it, so there is nothing to tear down.
    /// Returns `false` if `handle` is not the attached listener.
    pub fn mark_closed(&mut self, handle: ListenerHandle) -> bool {
        match &self.state {
            ListenerState::Attached(a) if a.handle == handle => {
                warn!("Sync listener on '{}' closed, live updates stopped", a.path);
                self.state = ListenerState::Detached;
                true
            }
            _ => {
                debug!("Ignoring close of stale listener {:?}", handle);
                false
            }
        }
    }

    /// `Attaching -> Detached` after a failed fetch or registration.
    pub fn abort_attach(&mut self) {
        if let ListenerState::Attaching { path } = &self.state {
            debug!("Attach on '{}' aborted", path);
            self.state = ListenerState::Detached;
        }
    }
}

/// Normalises a stored date to `YYYY-MM-DD`.
///
/// Full timestamps are truncated to their date. Anything unparseable is
/// returned unchanged.
pub fn normalize_date(raw: &str) -> String {
    if NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
        return raw.to_string();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.date_naive().format("%Y-%m-%d").to_string();
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return dt.date().format("%Y-%m-%d").to_string();
        }
    }
    for fmt in ["%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    warn!("Invalid date format: {}", raw);
    raw.to_string()
}

fn child_to_entry(key: &str, mut child: Value) -> Option<IncomeEntry> {
    let obj = child.as_object_mut()?;
    if let Some(Value::String(date)) = obj.get("date") {
        let normalized = normalize_date(date);
        obj.insert("date".to_string(), Value::String(normalized));
    }
    let missing_id = obj
        .get("id")
        .and_then(Value::as_str)
        .map_or(true, str::is_empty);
    if missing_id {
        obj.insert("id".to_string(), Value::String(key.to_string()));
    }
    match serde_json::from_value::<IncomeEntry>(child) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Skipping malformed child '{}': {}", key, e);
            None
        }
    }
}

/// Keyed children of a snapshot. Sequential numeric keys come back as an
/// array, whose indices are the keys.
pub fn snapshot_children(value: Option<Value>) -> Vec<(String, Value)> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => map.into_iter().collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        Some(other) => {
            warn!("Ignoring non-collection snapshot {}", other);
            Vec::new()
        }
    }
}

/// Converts a pushed snapshot (an unordered keyed map) into the ordered
/// working set. Identical snapshots always yield identical sequences.
pub fn process_snapshot(value: Option<Value>) -> Vec<IncomeEntry> {
    let mut entries: Vec<IncomeEntry> = snapshot_children(value)
        .into_iter()
        .filter_map(|(key, child)| child_to_entry(&key, child))
        .collect();
    sort_for_display(&mut entries);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lifecycle_transitions() {
        let mut listener = SyncListener::new();
        assert_eq!(listener.state(), &ListenerState::Detached);

        assert!(listener.begin_attach("users/u1/income-data").is_none());
        assert!(matches!(listener.state(), ListenerState::Attaching { .. }));
        assert!(listener.complete_attach(ListenerHandle(1)));
        assert_eq!(listener.attached_path(), Some("users/u1/income-data"));

        // Re-attaching for another scope hands back the old attachment.
        let previous = listener.begin_attach("users/u2/income-data").unwrap();
        assert_eq!(previous.path, "users/u1/income-data");
        assert_eq!(previous.handle, ListenerHandle(1));
        listener.abort_attach();
        assert_eq!(listener.state(), &ListenerState::Detached);
    }

    #[test]
    fn test_complete_without_pending_attach_is_rejected() {
        let mut listener = SyncListener::new();
        assert!(!listener.complete_attach(ListenerHandle(7)));
        assert_eq!(listener.state(), &ListenerState::Detached);
    }

    #[test]
    fn test_teardown_uses_recorded_path() {
        let mut listener = SyncListener::new();
        listener.begin_attach("public-data");
        listener.complete_attach(ListenerHandle(3));
        let attachment = listener.take_for_teardown().unwrap();
        assert_eq!(attachment.path, "public-data");
        assert!(listener.take_for_teardown().is_none());
    }

    #[test]
    fn test_mark_closed_only_detaches_matching_handle() {
        let mut listener = SyncListener::new();
        listener.begin_attach("users/u1/income-data");
        listener.complete_attach(ListenerHandle(4));
        assert!(!listener.mark_closed(ListenerHandle(3)));
        assert!(listener.is_attached());
        assert!(listener.mark_closed(ListenerHandle(4)));
        assert_eq!(listener.state(), &ListenerState::Detached);
        assert!(listener.take_for_teardown().is_none());
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2024-03-01"), "2024-03-01");
        assert_eq!(normalize_date("2024-03-01T10:00:00.000Z"), "2024-03-01");
        assert_eq!(normalize_date("2024-03-01 08:30:00"), "2024-03-01");
        assert_eq!(normalize_date("03/15/2024"), "2024-03-15");
        assert_eq!(normalize_date("soon"), "soon");
    }

    #[test]
    fn test_process_snapshot_orders_and_is_idempotent() {
        let snapshot = json!({
            "b": {"id": "b", "type": "job", "amount": 1200.0, "date": "2024-02-01", "timestamp": 2},
            "a": {"id": "a", "type": "job", "amount": 500.0, "date": "2024-03-01T00:00:00Z", "timestamp": 1},
            "c": {"id": "c", "type": "ssi", "amount": 1798.0, "date": "2024-02-01", "timestamp": 1},
            "junk": "not an entry"
        });
        let first = process_snapshot(Some(snapshot.clone()));
        let second = process_snapshot(Some(snapshot));
        assert_eq!(first, second);

        let ids: Vec<&str> = first.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(first[0].date, "2024-03-01");
    }

    #[test]
    fn test_process_snapshot_fills_missing_id_from_key() {
        let entries = process_snapshot(Some(json!({
            "entry_1_0": {"type": "job", "amount": 5.0, "date": "2024-01-01"}
        })));
        assert_eq!(entries[0].id, "entry_1_0");
        assert_eq!(entries[0].description, "No description");
    }

    #[test]
    fn test_process_array_snapshot_keys_by_index() {
        let entries = process_snapshot(Some(json!([
            {"type": "job", "amount": 5.0, "date": "2024-01-01"},
            null,
            {"id": "x", "type": "ssi", "amount": 9.0, "date": "2024-02-01"}
        ])));
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "0"]);
    }

    #[test]
    fn test_process_empty_snapshot() {
        assert!(process_snapshot(None).is_empty());
        assert!(process_snapshot(Some(Value::Null)).is_empty());
    }
}
