//! Types for the item store.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of a tracked item.
///
/// Stored as its integer discriminant so the table stays compatible with
/// databases written by earlier versions of the updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ItemStatus {
    /// Discovered, no update requested yet.
    Pending = 0,
    /// The update API accepted the request.
    UpdateSucceeded = 1,
    /// The update request failed after retries.
    UpdateFailed = 2,
}

impl ItemStatus {
    /// Convert to the integer stored in the database.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Parse from the integer stored in the database.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::UpdateSucceeded),
            2 => Some(Self::UpdateFailed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UpdateSucceeded => "update_succeeded",
            Self::UpdateFailed => "update_failed",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A media item tracked by external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedItem {
    /// Identifier from the source system; primary key.
    pub external_id: String,
    /// Time of the last status transition.
    pub last_update: DateTime<Utc>,
    pub status: ItemStatus,
}

impl TrackedItem {
    /// Create a freshly discovered item.
    pub fn new_pending(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            last_update: Utc::now(),
            status: ItemStatus::Pending,
        }
    }
}

/// Statistics for a single run, written to `sync_runs` on completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRunStats {
    /// Items newly inserted during discovery.
    pub discovered: u64,
    /// Items whose update request succeeded.
    pub updated: u64,
    /// Items whose update request failed.
    pub failed: u64,
    /// Whether a stop request cut the run short.
    pub interrupted: bool,
}

/// A row of the `sync_runs` table.
#[derive(Debug, Clone)]
pub struct SyncRunRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: SyncRunStats,
}
