//! Source adapter contract + the remote-board JSON API adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use earlybird_core::{LocationBucket, WorkEnvironment};
use earlybird_store::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "earlybird-adapters";

pub const REMOTE_BOARD_SOURCE_ID: &str = "remoteok";
pub const REMOTE_BOARD_API_URL: &str = "https://remoteok.io/api";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Source-specific shape of one scraped posting before normalization.
/// Fields are optional because the upstream feed is not under our
/// control; eligibility gating happens downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawJobRecord {
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Posted date as the source reports it. Kept loose: the feed has
    /// shipped both epoch seconds and free-form strings.
    #[serde(default)]
    pub date: Option<JsonValue>,
    /// Canonical posting URL, populated by the adapter during parsing.
    #[serde(default)]
    pub url: Option<String>,
}

impl RawJobRecord {
    /// Epoch seconds when the source date is present and numeric.
    pub fn posted_epoch_secs(&self) -> Option<i64> {
        match &self.date {
            Some(JsonValue::Number(n)) => n.as_f64().map(|v| v as i64),
            Some(JsonValue::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn has_required_fields(&self) -> bool {
        self.position.as_deref().is_some_and(|s| !s.trim().is_empty())
            && self.company.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fixed location discriminator folded into the job content hash.
    fn location_discriminator(&self) -> &'static str;

    /// Location bucket applied when a record carries no usable location.
    fn default_location(&self) -> LocationBucket;

    /// Human-readable location applied when the record has none.
    fn default_location_label(&self) -> &'static str;

    /// Work environment postings from this source are assumed to have.
    fn work_environment(&self) -> WorkEnvironment;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawJobRecord>, AdapterError>;

    fn parse_listing(&self, body: &[u8]) -> Result<Vec<RawJobRecord>, AdapterError>;
}

/// Adapter for the remote-board public JSON API. The response is a JSON
/// array whose first element is feed metadata, not a posting.
#[derive(Debug, Clone)]
pub struct RemoteBoardAdapter {
    api_url: String,
}

impl RemoteBoardAdapter {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
        }
    }

    fn posting_url(&self, id: &JsonValue) -> Option<String> {
        let id = match id {
            JsonValue::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            JsonValue::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(format!("https://remoteok.io/remote-jobs/{id}"))
    }
}

#[async_trait]
impl SourceAdapter for RemoteBoardAdapter {
    fn source_id(&self) -> &'static str {
        REMOTE_BOARD_SOURCE_ID
    }

    fn location_discriminator(&self) -> &'static str {
        "remote"
    }

    fn default_location(&self) -> LocationBucket {
        LocationBucket::EuRemote
    }

    fn default_location_label(&self) -> &'static str {
        "Remote"
    }

    fn work_environment(&self) -> WorkEnvironment {
        WorkEnvironment::Remote
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawJobRecord>, AdapterError> {
        let response = http
            .fetch_bytes(ctx.run_id, self.source_id(), &self.api_url)
            .await?;
        self.parse_listing(&response.body)
    }

    fn parse_listing(&self, body: &[u8]) -> Result<Vec<RawJobRecord>, AdapterError> {
        let values: Vec<JsonValue> = serde_json::from_slice(body)
            .map_err(|e| AdapterError::Message(format!("invalid listing JSON: {e}")))?;

        // First array element is feed metadata.
        let records = values
            .into_iter()
            .skip(1)
            .filter_map(|value| {
                let mut record: RawJobRecord = serde_json::from_value(value).ok()?;
                if record.url.is_none() {
                    record.url = record.id.as_ref().and_then(|id| self.posting_url(id));
                }
                Some(record)
            })
            .collect();
        Ok(records)
    }
}

pub fn remote_board_adapter() -> RemoteBoardAdapter {
    RemoteBoardAdapter::new(REMOTE_BOARD_API_URL)
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        REMOTE_BOARD_SOURCE_ID => Some(Box::new(remote_board_adapter())),
        _ => None,
    }
}
