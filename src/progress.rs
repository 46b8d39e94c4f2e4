//! Store-wide progress counts.

use std::sync::Arc;

use serde::Serialize;

use crate::state::{ItemStatus, ItemStore, StateError};

/// Item counts by status. `total` is read independently, so it can differ
/// from the sum of the other fields while a run is writing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total: u64,
}

#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn ItemStore>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    /// Read the current counts. Never fails: a count that cannot be read is
    /// logged and reported as 0.
    pub async fn report(&self) -> Progress {
        Progress {
            pending: or_zero("pending", self.store.count_by_status(ItemStatus::Pending).await),
            succeeded: or_zero(
                "succeeded",
                self.store.count_by_status(ItemStatus::UpdateSucceeded).await,
            ),
            failed: or_zero(
                "failed",
                self.store.count_by_status(ItemStatus::UpdateFailed).await,
            ),
            total: or_zero("total", self.store.count_all().await),
        }
    }
}

fn or_zero(field: &str, count: Result<u64, StateError>) -> u64 {
    count.unwrap_or_else(|e| {
        tracing::warn!(field, error = %e, "Failed to read progress count");
        0
    })
}
