//! Client for the VRT request API.
//!
//! One call per item asks the API to push refreshed metadata back into
//! MediaHaven. Transient failures are retried with backoff; the caller only
//! ever sees whether the request was accepted.

pub mod error;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};

pub use self::error::UpdateError;

/// Requests a metadata update for a single item.
#[async_trait]
pub trait UpdateApi: Send + Sync {
    /// `true` only when the API accepted the request. Failures are logged,
    /// never returned.
    async fn request_update(&self, external_id: &str) -> bool;
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    media_id: &'a str,
    media_type: &'a str,
    destination: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug)]
pub struct UpdateRequester {
    client: Client,
    url: String,
    policy: RetryPolicy,
}

impl UpdateRequester {
    pub fn new(url: &str, policy: RetryPolicy, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            policy,
        })
    }

    async fn send(&self, media_id: &str) -> Result<(), UpdateError> {
        let body = UpdateRequest {
            media_id,
            media_type: "metadata",
            destination: "mediahaven",
        };
        let http_err = |source| UpdateError::Http {
            source,
            media_id: media_id.to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(http_err)?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(UpdateError::HttpStatus {
                status,
                media_id: media_id.to_string(),
            });
        }

        let text = response.text().await.map_err(http_err)?;
        // An unparseable body counts as a rejection.
        let status = serde_json::from_str::<UpdateResponse>(&text)
            .ok()
            .and_then(|r| r.status);
        if status.as_deref() == Some("OK") {
            Ok(())
        } else {
            Err(UpdateError::Rejected {
                media_id: media_id.to_string(),
                status,
            })
        }
    }
}

#[async_trait]
impl UpdateApi for UpdateRequester {
    async fn request_update(&self, external_id: &str) -> bool {
        let result = retry_with_backoff(
            &self.policy,
            |e: &UpdateError| {
                if e.is_retryable(&self.policy) {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.send(external_id),
        )
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(external_id, "Update request accepted");
                true
            }
            Err(e) => {
                tracing::warn!(external_id, error = %e, "Update request failed");
                false
            }
        }
    }
}
