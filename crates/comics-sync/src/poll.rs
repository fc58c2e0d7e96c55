//! Read-only "is there anything new upstream" checks used to gate incremental runs.

use std::time::Duration;

use comics_adapters::ComicApi;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::store::RecordStore;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Identifiers an incremental run should fetch: `[watermark + 1, latest]`, or
/// `None` when the archive has nothing past the watermark.
pub fn incremental_range(watermark: i64, latest: i64) -> Option<(i64, i64)> {
    (latest > watermark).then(|| (watermark + 1, latest))
}

/// `latest > watermark`. Fails when the table has no watermark yet, since
/// incremental runs require a completed backfill.
pub async fn has_new_data<A, S>(api: &A, store: &S, table: &str) -> Result<bool, SyncError>
where
    A: ComicApi + ?Sized,
    S: RecordStore + ?Sized,
{
    let latest = api.fetch_latest_id().await?;
    let watermark = store
        .current_watermark(table)
        .await?
        .ok_or_else(|| SyncError::MissingWatermark {
            table: table.to_string(),
        })?;
    let fresh = latest > watermark;
    info!(latest, watermark, fresh, "polled archive");
    Ok(fresh)
}

/// Poll every `interval` until new data shows up (`true`) or `timeout` runs
/// out (`false`). Errors end the wait immediately.
pub async fn wait_for_new_data<A, S>(
    api: &A,
    store: &S,
    table: &str,
    settings: PollSettings,
) -> Result<bool, SyncError>
where
    A: ComicApi + ?Sized,
    S: RecordStore + ?Sized,
{
    let deadline = Instant::now() + settings.timeout;
    loop {
        if has_new_data(api, store, table).await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            info!(timeout_secs = settings.timeout.as_secs(), "no new comics before timeout");
            return Ok(false);
        }
        let pause = settings.interval.min(deadline - now);
        debug!(pause_secs = pause.as_secs(), "waiting before next poll");
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use comics_adapters::UpstreamError;
    use comics_core::{ComicRecord, RawPayload};

    use crate::store::MemoryRecordStore;

    /// Latest id grows by one after `publish_after` polls.
    struct Archive {
        latest: AtomicI64,
        polls: AtomicUsize,
        publish_after: usize,
    }

    impl Archive {
        fn new(latest: i64, publish_after: usize) -> Self {
            Self {
                latest: AtomicI64::new(latest),
                polls: AtomicUsize::new(0),
                publish_after,
            }
        }
    }

    #[async_trait]
    impl ComicApi for Archive {
        async fn fetch_latest_id(&self) -> Result<i64, UpstreamError> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls == self.publish_after {
                self.latest.fetch_add(1, Ordering::SeqCst);
            }
            Ok(self.latest.load(Ordering::SeqCst))
        }

        async fn fetch_one(&self, _id: i64) -> Result<Option<RawPayload>, UpstreamError> {
            Ok(None)
        }
    }

    async fn store_with_max(num: i64) -> MemoryRecordStore {
        let store = MemoryRecordStore::new();
        let record = ComicRecord {
            month: 1,
            num,
            year: 2024,
            news: String::new(),
            safe_title: "x".into(),
            transcript: None,
            alt: None,
            img: "https://imgs.example.com/x.png".into(),
            title: "x".into(),
            day: 1,
        };
        store.append(&[record], "raw_comics").await.unwrap();
        store
    }

    #[test]
    fn range_starts_right_after_the_watermark() {
        assert_eq!(incremental_range(40, 40), None);
        assert_eq!(incremental_range(40, 39), None);
        assert_eq!(incremental_range(40, 41), Some((41, 41)));
        assert_eq!(incremental_range(40, 45), Some((41, 45)));
    }

    #[tokio::test]
    async fn new_data_iff_latest_exceeds_watermark() {
        let store = store_with_max(40).await;
        for (latest, expected) in [(39, false), (40, false), (41, true), (500, true)] {
            let archive = Archive::new(latest, usize::MAX);
            assert_eq!(
                has_new_data(&archive, &store, "raw_comics").await.unwrap(),
                expected,
                "latest {latest}"
            );
        }
    }

    #[tokio::test]
    async fn empty_store_cannot_be_polled() {
        let store = MemoryRecordStore::new();
        let archive = Archive::new(10, usize::MAX);
        let err = has_new_data(&archive, &store, "raw_comics").await.unwrap_err();
        assert!(matches!(err, SyncError::MissingWatermark { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_a_comic_is_published() {
        let store = store_with_max(40).await;
        let archive = Archive::new(40, 3);
        let settings = PollSettings {
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(3600),
        };
        let started = Instant::now();
        assert!(wait_for_new_data(&archive, &store, "raw_comics", settings)
            .await
            .unwrap());
        assert_eq!(archive.polls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_at_the_timeout() {
        let store = store_with_max(40).await;
        let archive = Archive::new(40, usize::MAX);
        let settings = PollSettings {
            interval: Duration::from_secs(300),
            timeout: Duration::from_secs(1000),
        };
        let started = Instant::now();
        assert!(!wait_for_new_data(&archive, &store, "raw_comics", settings)
            .await
            .unwrap());
        assert_eq!(started.elapsed(), Duration::from_secs(1000));
        assert_eq!(archive.polls.load(Ordering::SeqCst), 5);
    }
}
