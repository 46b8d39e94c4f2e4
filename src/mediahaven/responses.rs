use serde::Deserialize;
use serde_json::Value;

/// Response from `/oauth/access_token`.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Response from `/media/`.
///
/// Records are kept as opaque JSON: the identifier lives under a
/// configurable path and nothing else in a record is read.
#[derive(Debug, Deserialize)]
pub struct MediaDataResponse {
    #[serde(rename = "TotalNrOfResults")]
    pub total_nr_of_results: u64,
    #[serde(rename = "MediaDataList", default)]
    pub media_data_list: Vec<Value>,
}
