use thiserror::Error;

use crate::retry::RetryPolicy;

/// Typed update request errors enabling retry classification.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Update API returned HTTP {status} for {media_id}")]
    HttpStatus { status: u16, media_id: String },

    #[error("Update API request for {media_id} failed: {source}")]
    Http {
        source: reqwest::Error,
        media_id: String,
    },

    /// HTTP 200 but the body did not carry `status: "OK"`.
    #[error("Update API did not accept {media_id} (status={status:?})")]
    Rejected {
        media_id: String,
        status: Option<String>,
    },
}

impl UpdateError {
    /// Whether this error is transient under `policy`.
    ///
    /// Connection failures and timeouts are always retried; HTTP statuses
    /// only when the policy lists them. A rejection in a successful response
    /// is final.
    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        match self {
            UpdateError::HttpStatus { status, .. } => policy.is_retryable_status(*status),
            UpdateError::Http { .. } => true,
            UpdateError::Rejected { .. } => false,
        }
    }
}
