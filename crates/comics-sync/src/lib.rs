//! Backfill and incremental sync orchestration for the comic archive.
//!
//! A run is extract (range fetch) → validate → quarantine rejects → clean →
//! append. Scheduling and retries belong to whatever invokes these entry
//! points; every fatal error is returned unchanged.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use comics_adapters::{fetch_range, ComicApi, RangeFetch, UpstreamError, XkcdClient};
use comics_core::{clean, validate, Watermark};
use comics_storage::{ArtifactStore, HttpClientConfig};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod poll;
pub mod quarantine;
pub mod store;

pub use poll::{has_new_data, incremental_range, wait_for_new_data, PollSettings};
pub use quarantine::write_quarantine;
pub use store::{MemoryRecordStore, PgRecordStore, RecordStore, StorageError};

pub const CRATE_NAME: &str = "comics-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("table {table} has no watermark; run a backfill before incremental extraction")]
    MissingWatermark { table: String },
    #[error("writing quarantine artifact: {0:#}")]
    Quarantine(anyhow::Error),
}

/// Connection parameters for the raw-table database. `url` wins when set.
#[derive(Clone)]
pub struct PostgresSettings {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for PostgresSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSettings")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl PostgresSettings {
    pub fn connect_options(&self) -> Result<PgConnectOptions, StorageError> {
        match &self.url {
            Some(url) => PgConnectOptions::from_str(url).map_err(StorageError::Config),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .database(&self.database)
                .username(&self.user)
                .password(&self.password)),
        }
    }
}

/// Process configuration, built once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub postgres: PostgresSettings,
    pub raw_table: String,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub poll: PollSettings,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            base_url: lookup("COMICS_BASE_URL")
                .or_else(|| lookup("BASE_URL"))
                .unwrap_or_else(|| "https://xkcd.com".to_string()),
            postgres: PostgresSettings {
                url: lookup("DATABASE_URL"),
                host: lookup("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: lookup("POSTGRES_PORT")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(5440),
                database: lookup("POSTGRES_DB").unwrap_or_else(|| "comics".to_string()),
                user: lookup("POSTGRES_USER").unwrap_or_else(|| "comics".to_string()),
                password: lookup("POSTGRES_PASSWORD").unwrap_or_else(|| "comics".to_string()),
            },
            raw_table: lookup("COMICS_RAW_TABLE").unwrap_or_else(|| "raw_comics".to_string()),
            artifacts_dir: lookup("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            user_agent: lookup("COMICS_USER_AGENT")
                .unwrap_or_else(|| "comics-elt/0.1".to_string()),
            http_timeout_secs: parsed("COMICS_HTTP_TIMEOUT_SECS").unwrap_or(20),
            fetch_concurrency: parsed("COMICS_FETCH_CONCURRENCY")
                .map(|n| n.max(1) as usize)
                .unwrap_or(1),
            poll: PollSettings {
                interval: Duration::from_secs(parsed("COMICS_POLL_INTERVAL_SECS").unwrap_or(300)),
                timeout: Duration::from_secs(parsed("COMICS_POLL_TIMEOUT_SECS").unwrap_or(3600)),
            },
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: self.fetch_concurrency.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Backfill,
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Backfill => f.write_str("backfill"),
            RunMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Inclusive identifier range requested from the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchWindow {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    /// `None` when an incremental run found nothing past the watermark.
    pub window: Option<FetchWindow>,
    pub fetched: usize,
    pub missing: Vec<i64>,
    pub valid: usize,
    pub invalid: usize,
    pub loaded: u64,
    pub quarantine_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn nothing_to_do(run_id: Uuid, mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            mode,
            window: None,
            fetched: 0,
            missing: Vec::new(),
            valid: 0,
            invalid: 0,
            loaded: 0,
            quarantine_path: None,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

pub struct SyncPipeline<A, S> {
    run_id: Uuid,
    api: A,
    store: S,
    artifacts: ArtifactStore,
    table: String,
    fetch_concurrency: usize,
}

impl<A, S> SyncPipeline<A, S>
where
    A: ComicApi,
    S: RecordStore,
{
    pub fn new(config: &SyncConfig, api: A, store: S) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            api,
            store,
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            table: config.raw_table.clone(),
            fetch_concurrency: config.fetch_concurrency.max(1),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn current_watermark(&self) -> Result<Watermark, SyncError> {
        Ok(self.store.current_watermark(&self.table).await?)
    }

    pub async fn ensure_table(&self) -> Result<(), SyncError> {
        self.store.ensure_table(&self.table).await?;
        info!(table = %self.table, "raw table ready");
        Ok(())
    }

    pub async fn has_new_data(&self) -> Result<bool, SyncError> {
        has_new_data(&self.api, &self.store, &self.table).await
    }

    pub async fn wait_for_new_data(&self, settings: PollSettings) -> Result<bool, SyncError> {
        wait_for_new_data(&self.api, &self.store, &self.table, settings).await
    }

    /// Full load of `[start, end]`; `start` defaults to 1 and `end` to the
    /// archive's latest identifier.
    pub async fn run_backfill(
        &self,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<RunSummary, SyncError> {
        let span = info_span!("sync_run", run_id = %self.run_id, mode = %RunMode::Backfill);
        async move {
            let started_at = Utc::now();
            info!("starting backfill");
            let end = match end {
                Some(end) => end,
                None => self.api.fetch_latest_id().await?,
            };
            let window = FetchWindow {
                start: start.unwrap_or(1),
                end,
            };
            self.load_window(RunMode::Backfill, started_at, window).await
        }
        .instrument(span)
        .await
    }

    /// Load everything past the current watermark. Requires a prior backfill.
    pub async fn run_incremental(&self) -> Result<RunSummary, SyncError> {
        let span = info_span!("sync_run", run_id = %self.run_id, mode = %RunMode::Incremental);
        async move {
            let started_at = Utc::now();
            let watermark = self.store.current_watermark(&self.table).await?.ok_or_else(|| {
                SyncError::MissingWatermark {
                    table: self.table.clone(),
                }
            })?;
            let latest = self.api.fetch_latest_id().await?;

            match incremental_range(watermark, latest) {
                None => {
                    info!(watermark, latest, "archive has nothing past the watermark");
                    Ok(RunSummary::nothing_to_do(
                        self.run_id,
                        RunMode::Incremental,
                        started_at,
                    ))
                }
                Some((start, end)) => {
                    info!(watermark, latest, "fetching latest comics");
                    self.load_window(RunMode::Incremental, started_at, FetchWindow { start, end })
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn load_window(
        &self,
        mode: RunMode,
        started_at: DateTime<Utc>,
        window: FetchWindow,
    ) -> Result<RunSummary, SyncError> {
        let RangeFetch { payloads, missing } =
            fetch_range(&self.api, window.start, window.end, self.fetch_concurrency).await?;
        let fetched = payloads.len();

        let (valid, invalid) = validate(payloads);
        let quarantine = write_quarantine(&self.artifacts, self.run_id, started_at, &invalid)
            .await
            .map_err(SyncError::Quarantine)?;

        let cleaned = clean(valid);
        let loaded = self.store.append(&cleaned, &self.table).await?;

        let summary = RunSummary {
            run_id: self.run_id,
            mode,
            window: Some(window),
            fetched,
            missing,
            valid: cleaned.len(),
            invalid: invalid.len(),
            loaded,
            quarantine_path: quarantine.map(|stored| stored.absolute_path.display().to_string()),
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            start = window.start,
            end = window.end,
            fetched = summary.fetched,
            missing = summary.missing.len(),
            invalid = summary.invalid,
            loaded = summary.loaded,
            "{mode} complete"
        );
        Ok(summary)
    }
}

pub type LivePipeline = SyncPipeline<XkcdClient, PgRecordStore>;

/// Wire the HTTP archive client and the PostgreSQL store from `config`.
pub fn live_pipeline(config: &SyncConfig) -> anyhow::Result<LivePipeline> {
    let run_id = Uuid::new_v4();
    let api = XkcdClient::new(config.base_url.clone(), config.http_client_config())?
        .with_run_id(run_id);
    let store = PgRecordStore::new(config.postgres.connect_options()?);
    Ok(SyncPipeline::new(config, api, store).with_run_id(run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.base_url, "https://xkcd.com");
        assert_eq!(config.raw_table, "raw_comics");
        assert_eq!(config.fetch_concurrency, 1);
        assert_eq!(config.postgres.port, 5440);
        assert_eq!(config.postgres.url, None);
        assert_eq!(config.poll, PollSettings::default());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("BASE_URL", "http://archive.local"),
            ("POSTGRES_DB", "comics_dw"),
            ("POSTGRES_PORT", "5432"),
            ("COMICS_FETCH_CONCURRENCY", "0"),
            ("COMICS_POLL_INTERVAL_SECS", "30"),
            ("COMICS_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]));
        assert_eq!(config.base_url, "http://archive.local");
        assert_eq!(config.postgres.database, "comics_dw");
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.fetch_concurrency, 1);
        assert_eq!(config.poll.interval, Duration::from_secs(30));
        assert_eq!(config.http_timeout_secs, 20);
    }

    #[test]
    fn specific_base_url_wins_over_generic() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("BASE_URL", "http://generic"),
            ("COMICS_BASE_URL", "http://specific"),
        ]));
        assert_eq!(config.base_url, "http://specific");
    }

    #[test]
    fn debug_output_hides_credentials() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("POSTGRES_PASSWORD", "hunter2"),
            ("DATABASE_URL", "postgres://u:hunter2@db/comics"),
        ]));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"), "{rendered}");
        assert!(config.postgres.connect_options().is_ok());
    }

    #[test]
    fn malformed_database_url_is_a_config_error() {
        let config = SyncConfig::from_lookup(lookup(&[("DATABASE_URL", "not a database url")]));
        assert!(matches!(
            config.postgres.connect_options(),
            Err(StorageError::Config(_))
        ));
        let err = live_pipeline(&config).err().expect("bad url rejected");
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Config(_))
        ));
    }

    #[test]
    fn run_summary_serializes_mode_in_lowercase() {
        let summary =
            RunSummary::nothing_to_do(Uuid::nil(), RunMode::Incremental, Utc::now());
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["mode"], "incremental");
        assert!(value["window"].is_null());
    }
}
