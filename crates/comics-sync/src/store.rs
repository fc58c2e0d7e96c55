//! Raw-table persistence: watermark reads and append-only loads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use comics_core::{ComicRecord, Watermark, RECORD_FIELDS};
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Rows per multi-row INSERT; keeps bind parameters far below the protocol limit.
pub const INSERT_CHUNK_ROWS: usize = 1000;

const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("invalid database configuration: {0}")]
    Config(#[source] sqlx::Error),
    #[error("connecting to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("query on {table} failed: {source}")]
    Query {
        table: String,
        #[source]
        source: BoxDynError,
    },
    #[error("write to {table} failed after {written} rows: {source}")]
    Write {
        table: String,
        written: u64,
        #[source]
        source: BoxDynError,
    },
}

/// Reject anything but a plain, unquoted SQL identifier.
pub fn validate_table_name(table: &str) -> Result<(), StorageError> {
    let mut chars = table.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if head_ok && tail_ok && table.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(StorageError::InvalidTableName(table.to_string()))
    }
}

/// Seam between the pipeline and the raw table.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// `MAX(num)` of the table; `None` when it holds no rows.
    async fn current_watermark(&self, table: &str) -> Result<Watermark, StorageError>;

    /// Append without any dedup or upsert. Returns the number of rows written.
    async fn append(&self, records: &[ComicRecord], table: &str) -> Result<u64, StorageError>;

    /// Create the table when it does not exist yet.
    async fn ensure_table(&self, table: &str) -> Result<(), StorageError>;
}

/// PostgreSQL store. Every operation opens its own connection and closes it
/// before returning, on success and on failure.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    options: PgConnectOptions,
}

impl PgRecordStore {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    async fn connect(&self) -> Result<PgConnection, StorageError> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(StorageError::Connect)
    }

    async fn release(conn: PgConnection) {
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing database connection");
        }
    }

    fn create_table_sql(table: &str) -> String {
        let columns = RECORD_FIELDS
            .iter()
            .map(|field| format!("{field} {}", column_type(field)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS {table} ({columns})")
    }

    async fn create_table(conn: &mut PgConnection, table: &str) -> Result<(), StorageError> {
        sqlx::query(&Self::create_table_sql(table))
            .execute(&mut *conn)
            .await
            .map_err(|source| StorageError::Query {
                table: table.to_string(),
                source: source.into(),
            })?;
        Ok(())
    }

    async fn max_num(conn: &mut PgConnection, table: &str) -> Result<Watermark, StorageError> {
        let sql = format!("SELECT MAX(num) FROM {table}");
        sqlx::query_scalar::<_, Option<i64>>(&sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(|source| StorageError::Query {
                table: table.to_string(),
                source: source.into(),
            })
    }

    async fn insert_chunks(
        conn: &mut PgConnection,
        records: &[ComicRecord],
        table: &str,
    ) -> Result<u64, StorageError> {
        Self::create_table(conn, table).await?;

        let mut written = 0u64;
        for chunk in records.chunks(INSERT_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} ({}) ",
                RECORD_FIELDS.join(", ")
            ));
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.month)
                    .push_bind(record.num)
                    .push_bind(record.year)
                    .push_bind(record.news.as_str())
                    .push_bind(record.safe_title.as_str())
                    .push_bind(record.transcript.as_deref())
                    .push_bind(record.alt.as_deref())
                    .push_bind(record.img.as_str())
                    .push_bind(record.title.as_str())
                    .push_bind(record.day);
            });
            let result = builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(|source| StorageError::Write {
                    table: table.to_string(),
                    written,
                    source: source.into(),
                })?;
            written += result.rows_affected();
        }
        Ok(written)
    }
}

fn column_type(field: &str) -> &'static str {
    match field {
        "month" | "num" | "year" | "day" => "BIGINT",
        _ => "TEXT",
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn current_watermark(&self, table: &str) -> Result<Watermark, StorageError> {
        validate_table_name(table)?;
        let mut conn = self.connect().await?;
        let result = Self::max_num(&mut conn, table).await;
        Self::release(conn).await;
        let watermark = result?;
        info!(table, ?watermark, "read watermark");
        Ok(watermark)
    }

    async fn append(&self, records: &[ComicRecord], table: &str) -> Result<u64, StorageError> {
        validate_table_name(table)?;
        if records.is_empty() {
            info!(table, "nothing to append");
            return Ok(0);
        }
        let mut conn = self.connect().await?;
        let result = Self::insert_chunks(&mut conn, records, table).await;
        Self::release(conn).await;
        let written = result?;
        info!(table, written, "appended records");
        Ok(written)
    }

    async fn ensure_table(&self, table: &str) -> Result<(), StorageError> {
        validate_table_name(table)?;
        let mut conn = self.connect().await?;
        let result = Self::create_table(&mut conn, table).await;
        Self::release(conn).await;
        result
    }
}

/// In-process store keyed by table name, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    tables: Mutex<BTreeMap<String, Vec<ComicRecord>>>,
    fail_writes: Mutex<bool>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `append` fail with a write error.
    pub async fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().await = fail;
    }

    pub async fn rows(&self, table: &str) -> Vec<ComicRecord> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn current_watermark(&self, table: &str) -> Result<Watermark, StorageError> {
        validate_table_name(table)?;
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.iter().map(|r| r.num).max()))
    }

    async fn append(&self, records: &[ComicRecord], table: &str) -> Result<u64, StorageError> {
        validate_table_name(table)?;
        if records.is_empty() {
            return Ok(0);
        }
        if *self.fail_writes.lock().await {
            return Err(StorageError::Write {
                table: table.to_string(),
                written: 0,
                source: "injected write failure".into(),
            });
        }
        let mut tables = self.tables.lock().await;
        tables
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn ensure_table(&self, table: &str) -> Result<(), StorageError> {
        validate_table_name(table)?;
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(num: i64) -> ComicRecord {
        ComicRecord {
            month: 1,
            num,
            year: 2006,
            news: String::new(),
            safe_title: format!("Comic {num}"),
            transcript: None,
            alt: Some("alt".into()),
            img: format!("https://imgs.example.com/{num}.png"),
            title: format!("Comic {num}"),
            day: 1,
        }
    }

    #[test]
    fn table_names_must_be_plain_identifiers() {
        for ok in ["raw_comics", "_staging", "Comics2"] {
            assert!(validate_table_name(ok).is_ok(), "{ok}");
        }
        let too_long = "t".repeat(64);
        for bad in ["", "2comics", "raw-comics", "raw comics", "x;DROP TABLE y", "\"q\"", too_long.as_str()] {
            assert!(
                matches!(validate_table_name(bad), Err(StorageError::InvalidTableName(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn create_table_sql_lists_columns_in_record_order() {
        assert_eq!(
            PgRecordStore::create_table_sql("raw_comics"),
            "CREATE TABLE IF NOT EXISTS raw_comics (month BIGINT, num BIGINT, year BIGINT, \
             news TEXT, safe_title TEXT, transcript TEXT, alt TEXT, img TEXT, title TEXT, day BIGINT)"
        );
    }

    #[tokio::test]
    async fn empty_table_has_no_watermark() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.current_watermark("raw_comics").await.unwrap(), None);
        store.ensure_table("raw_comics").await.unwrap();
        assert_eq!(store.current_watermark("raw_comics").await.unwrap(), None);
    }

    #[tokio::test]
    async fn append_never_deduplicates() {
        let store = MemoryRecordStore::new();
        let batch = vec![record(39), record(40)];
        assert_eq!(store.append(&batch, "raw_comics").await.unwrap(), 2);
        assert_eq!(store.append(&batch, "raw_comics").await.unwrap(), 2);

        assert_eq!(store.rows("raw_comics").await.len(), 4);
        assert_eq!(store.current_watermark("raw_comics").await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn injected_write_failure_surfaces_as_storage_error() {
        let store = MemoryRecordStore::new();
        store.set_fail_writes(true).await;
        let err = store.append(&[record(1)], "raw_comics").await.unwrap_err();
        assert!(matches!(err, StorageError::Write { written: 0, .. }));
        assert!(store.rows("raw_comics").await.is_empty());
    }
}
