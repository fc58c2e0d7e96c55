//! On-disk quarantine for payloads the validator rejected.

use anyhow::Context;
use chrono::{DateTime, Utc};
use comics_core::InvalidRecord;
use comics_storage::{ArtifactKey, ArtifactStore, StoredArtifact};
use tracing::warn;
use uuid::Uuid;

pub const QUARANTINE_CATEGORY: &str = "quarantine";

/// Persist the rejected payloads of one run as a single JSON artifact under
/// `{stamp}/quarantine/{run_id}/`. Nothing is written for an empty batch.
pub async fn write_quarantine(
    store: &ArtifactStore,
    run_id: Uuid,
    written_at: DateTime<Utc>,
    invalid: &[InvalidRecord],
) -> anyhow::Result<Option<StoredArtifact>> {
    if invalid.is_empty() {
        return Ok(None);
    }

    let bytes = serde_json::to_vec_pretty(invalid).context("serializing quarantined records")?;
    let key = ArtifactKey {
        run_id,
        written_at,
        category: QUARANTINE_CATEGORY,
    };
    let stored = store
        .store_bytes(&key, "json", &bytes)
        .await
        .with_context(|| format!("storing quarantine for run {run_id}"))?;
    warn!(
        %run_id,
        records = invalid.len(),
        path = %stored.absolute_path.display(),
        "quarantined invalid records"
    );
    Ok(Some(stored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn rejected(num: i64) -> InvalidRecord {
        let record = json!({ "num": num, "month": "1" });
        InvalidRecord {
            record: record.as_object().cloned().unwrap_or_default(),
            error: "1 validation error for ComicRecord; title: field required".into(),
        }
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let stored = write_quarantine(&store, Uuid::new_v4(), Utc::now(), &[])
            .await
            .unwrap();
        assert!(stored.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn quarantine_round_trips_payload_and_error() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let (run_id, at) = (Uuid::new_v4(), Utc::now());
        let batch = vec![rejected(7), rejected(8)];

        let first = write_quarantine(&store, run_id, at, &batch)
            .await
            .unwrap()
            .expect("stored");
        let again = write_quarantine(&store, run_id, at, &batch)
            .await
            .unwrap()
            .expect("stored");
        assert!(again.deduplicated);
        assert_eq!(first.absolute_path, again.absolute_path);

        let text = std::fs::read_to_string(&first.absolute_path).unwrap();
        let parsed: Vec<InvalidRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, batch);
        assert!(first
            .relative_path
            .starts_with(at.format("%Y%m%d_%H%M%S").to_string()));
        assert!(first
            .relative_path
            .parent()
            .is_some_and(|p| p.ends_with(format!("{QUARANTINE_CATEGORY}/{run_id}"))));
    }
}
