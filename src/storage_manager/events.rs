use std::fmt;

use crate::income::IncomeEntry;
use crate::storage::types::StorageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Success,
    Info,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotificationLevel::Success => "success",
            NotificationLevel::Info => "info",
            NotificationLevel::Error => "error",
        })
    }
}

/// Broadcast by the manager after every state change.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    /// The working set changed; `entries` is its new content in display order.
    Refreshed {
        backend: StorageType,
        entries: Vec<IncomeEntry>,
    },
    /// A transient message for the user.
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

impl StorageEvent {
    pub fn success(message: impl Into<String>) -> Self {
        StorageEvent::Notification {
            level: NotificationLevel::Success,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        StorageEvent::Notification {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StorageEvent::Notification {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}
