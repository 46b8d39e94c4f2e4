use thiserror::Error;

/// Failures of the MediaHaven listing client.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Credentials or token rejected.
    #[error("MediaHaven authentication failed: {0}")]
    Auth(String),

    /// The request could not complete (connection, timeout, body read).
    #[error("MediaHaven request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success status or an unparseable body.
    #[error("MediaHaven returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }
}
