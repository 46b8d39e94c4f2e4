//! MediaHaven listing client.
//!
//! Pages through `/media/` filtered on one media type. An OAuth password
//! grant token is fetched lazily and cached for the lifetime of the client;
//! a 401 from the listing endpoint triggers exactly one re-authentication
//! and one retry of the same request.

pub mod error;
pub mod responses;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;

pub use self::error::SourceError;
use self::responses::{MediaDataResponse, TokenResponse};

/// MediaHaven v2 JSON representation.
const MEDIAHAVEN_ACCEPT: &str = "application/vnd.mediahaven.v2+json";

/// One page of listing results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Raw records in the order returned.
    pub records: Vec<Value>,
    /// Number of items matching the filter, across all pages.
    pub total_count: u64,
}

/// Paginated source of media records.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn get_page(&self, offset: u64, page_size: u64) -> Result<Page, SourceError>;
}

/// Read the identifier of a record at a JSON pointer (e.g.
/// `/Dynamic/dc_identifier_cpid`).
///
/// Strings are trimmed; numbers are accepted and rendered in decimal.
/// Missing, null, empty, or structured values yield `None`.
pub fn extract_identifier(record: &Value, pointer: &str) -> Option<String> {
    match record.pointer(pointer)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Connection settings for [`MediahavenClient`].
#[derive(Clone)]
pub struct MediahavenSettings {
    pub host: String,
    pub username: String,
    pub password: String,
    pub media_type: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for MediahavenSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediahavenSettings")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("media_type", &self.media_type)
            .finish()
    }
}

pub struct MediahavenClient {
    client: Client,
    settings: MediahavenSettings,
    /// Cached bearer token. Replaced only after the server rejects it.
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for MediahavenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediahavenClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MediahavenClient {
    pub fn new(settings: MediahavenSettings) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            client,
            settings,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.host.trim_end_matches('/'), path)
    }

    /// Return the cached token, fetching one on first use.
    async fn token(&self) -> Result<String, SourceError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.fetch_token().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Discard the cached token and fetch a new one.
    async fn refresh_token(&self) -> Result<String, SourceError> {
        let mut guard = self.token.lock().await;
        *guard = None;
        let token = self.fetch_token().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn fetch_token(&self) -> Result<String, SourceError> {
        let url = self.url("/oauth/access_token");
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .form(&[("grant_type", "password")])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(SourceError::Auth(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response.text().await?;
        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| SourceError::Upstream {
                status: status.as_u16(),
                message: format!("invalid token response: {e}"),
            })?;

        tracing::info!(
            token_type = ?token.token_type,
            expires_in = ?token.expires_in,
            "Obtained MediaHaven access token"
        );
        Ok(token.access_token)
    }

    async fn fetch_page(
        &self,
        token: &str,
        offset: u64,
        page_size: u64,
    ) -> Result<Page, SourceError> {
        let url = self.url("/media/");
        let query = format!("+(type_viaa:\"{}\")", self.settings.media_type);
        tracing::debug!(offset, page_size, "GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT, MEDIAHAVEN_ACCEPT)
            .query(&[
                ("q", query),
                ("startIndex", offset.to_string()),
                ("nrOfResults", page_size.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(SourceError::Auth(body));
        }
        if !status.is_success() {
            return Err(SourceError::Upstream {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: MediaDataResponse =
            serde_json::from_str(&body).map_err(|e| SourceError::Upstream {
                status: status.as_u16(),
                message: format!("invalid listing response: {e}"),
            })?;

        Ok(Page {
            records: data.media_data_list,
            total_count: data.total_nr_of_results,
        })
    }
}

#[async_trait]
impl MediaSource for MediahavenClient {
    async fn get_page(&self, offset: u64, page_size: u64) -> Result<Page, SourceError> {
        let token = self.token().await?;
        match self.fetch_page(&token, offset, page_size).await {
            Err(SourceError::Auth(reason)) => {
                tracing::info!("MediaHaven rejected the access token, re-authenticating: {reason}");
                let token = self.refresh_token().await?;
                self.fetch_page(&token, offset, page_size).await
            }
            other => other,
        }
    }
}
