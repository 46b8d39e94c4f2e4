use thiserror::Error;

use crate::mediahaven::SourceError;
use crate::state::StateError;

/// Errors that end a run. Page and item failures are absorbed and logged.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("MediaHaven rejected the configured credentials: {0}")]
    Auth(#[source] SourceError),

    #[error("Item store failure: {0}")]
    State(#[from] StateError),
}
