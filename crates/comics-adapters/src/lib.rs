//! Archive API contract + the HTTP client for xkcd-style `info.0.json` endpoints.

use async_trait::async_trait;
use comics_core::RawPayload;
use comics_storage::{FetchError, HttpClientConfig, HttpFetcher};
use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "comics-adapters";

/// Any upstream failure other than a per-identifier gap. Always fatal for the
/// operation that hit it.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("archive served comic {served} when asked for {requested}")]
    Mismatch { requested: i64, served: i64 },
}

#[async_trait]
pub trait ComicApi: Send + Sync {
    /// Highest identifier the archive currently serves.
    async fn fetch_latest_id(&self) -> Result<i64, UpstreamError>;

    /// One identifier; `Ok(None)` when the archive reports it does not exist.
    async fn fetch_one(&self, id: i64) -> Result<Option<RawPayload>, UpstreamError>;
}

/// Outcome of a range fetch. Every requested identifier is in exactly one of
/// the two vectors, both ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeFetch {
    pub payloads: Vec<RawPayload>,
    pub missing: Vec<i64>,
}

/// Fetch every identifier in `[start, end]`.
///
/// At most `concurrency` lookups are in flight (`1` means strictly one after
/// another). Results are consumed in identifier order whatever the completion
/// order, and the first fatal error aborts the whole range without a partial
/// result. A payload whose integer `num` is not the identifier it was fetched
/// under is fatal, so a batch never carries the same `num` twice. A `num` that
/// is absent or not an integer is left for the validator to reject.
pub async fn fetch_range<A>(
    api: &A,
    start: i64,
    end: i64,
    concurrency: usize,
) -> Result<RangeFetch, UpstreamError>
where
    A: ComicApi + ?Sized,
{
    let mut out = RangeFetch::default();
    if start > end {
        return Ok(out);
    }

    let mut lookups = stream::iter(start..=end)
        .map(|id| async move { api.fetch_one(id).await.map(|payload| (id, payload)) })
        .buffered(concurrency.max(1));

    while let Some(result) = lookups.next().await {
        match result? {
            (id, Some(payload)) => {
                if let Some(served) = payload.get("num").and_then(integer_num) {
                    if served != id {
                        return Err(UpstreamError::Mismatch {
                            requested: id,
                            served,
                        });
                    }
                }
                debug!(id, "comic pulled");
                out.payloads.push(payload);
            }
            (id, None) => {
                warn!(id, "comic does not exist");
                out.missing.push(id);
            }
        }
    }

    info!(
        start,
        end,
        fetched = out.payloads.len(),
        missing = out.missing.len(),
        "range fetch complete"
    );
    Ok(out)
}

/// HTTP client for `{base_url}/info.0.json` and `{base_url}/{id}/info.0.json`.
#[derive(Debug)]
pub struct XkcdClient {
    base_url: String,
    run_id: Uuid,
    http: HttpFetcher,
}

impl XkcdClient {
    pub fn new(base_url: impl Into<String>, http: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            run_id: Uuid::new_v4(),
            http: HttpFetcher::new(http)?,
        })
    }

    /// Tag outgoing request spans with the pipeline run they belong to.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn latest_url(&self) -> String {
        format!("{}/info.0.json", self.base_url)
    }

    pub fn comic_url(&self, id: i64) -> String {
        format!("{}/{id}/info.0.json", self.base_url)
    }

    async fn get_object(&self, url: &str) -> Result<RawPayload, FetchOutcome> {
        let resp = self
            .http
            .fetch_bytes(self.run_id, url)
            .await
            .map_err(|source| FetchOutcome::Failed(source, url.to_string()))?;
        parse_payload(url, &resp.body).map_err(FetchOutcome::Malformed)
    }
}

enum FetchOutcome {
    Failed(FetchError, String),
    Malformed(UpstreamError),
}

impl FetchOutcome {
    fn into_upstream(self) -> UpstreamError {
        match self {
            FetchOutcome::Failed(source, url) => UpstreamError::Fetch { url, source },
            FetchOutcome::Malformed(err) => err,
        }
    }
}

#[async_trait]
impl ComicApi for XkcdClient {
    async fn fetch_latest_id(&self) -> Result<i64, UpstreamError> {
        let url = self.latest_url();
        let payload = self
            .get_object(&url)
            .await
            .map_err(FetchOutcome::into_upstream)?;
        let latest = latest_num(&url, &payload)?;
        info!(latest, "latest available comic number");
        Ok(latest)
    }

    async fn fetch_one(&self, id: i64) -> Result<Option<RawPayload>, UpstreamError> {
        let url = self.comic_url(id);
        match self.get_object(&url).await {
            Ok(payload) => Ok(Some(payload)),
            Err(FetchOutcome::Failed(source, _)) if source.is_not_found() => Ok(None),
            Err(other) => Err(other.into_upstream()),
        }
    }
}

/// Decode a response body that must be a JSON object.
pub fn parse_payload(url: &str, body: &[u8]) -> Result<RawPayload, UpstreamError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|err| UpstreamError::Malformed {
            url: url.to_string(),
            reason: format!("invalid json: {err}"),
        })?;
    match value {
        JsonValue::Object(map) => Ok(map),
        _ => Err(UpstreamError::Malformed {
            url: url.to_string(),
            reason: "expected a json object".to_string(),
        }),
    }
}

/// The `num` of a latest-comic payload; must be an integer.
pub fn latest_num(url: &str, payload: &RawPayload) -> Result<i64, UpstreamError> {
    let num = payload.get("num").ok_or_else(|| UpstreamError::Malformed {
        url: url.to_string(),
        reason: "missing `num`".to_string(),
    })?;
    integer_num(num).ok_or_else(|| UpstreamError::Malformed {
        url: url.to_string(),
        reason: format!("`num` is not an integer: {num}"),
    })
}

fn integer_num(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
