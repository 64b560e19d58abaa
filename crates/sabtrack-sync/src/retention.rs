//! Age-based removal of frozen records.

use chrono::{DateTime, Duration, Utc};
use sabtrack_core::DownloadStatus;
use sabtrack_storage::{RecordStore, StoreResult};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    pub cutoff: DateTime<Utc>,
    pub removed: usize,
    pub removed_completed: usize,
    pub removed_failed: usize,
    pub remaining_frozen: u64,
}

/// Delete completed and failed records whose `completed_at` is older than
/// `window`. Both terminal kinds age identically.
pub async fn sweep(
    store: &dyn RecordStore,
    window: Duration,
    now: DateTime<Utc>,
) -> StoreResult<RetentionOutcome> {
    let cutoff = now - window;
    let removed = store.delete_terminal_before(cutoff).await?;
    let remaining_frozen = store.count(&DownloadStatus::TERMINAL).await?;

    for record in &removed {
        debug!(id = %record.id, name = %record.display_name(), status = %record.status, "retention removed record");
    }
    let removed_failed = removed.iter().filter(|r| r.status == DownloadStatus::Failed).count();
    let outcome = RetentionOutcome {
        cutoff,
        removed: removed.len(),
        removed_completed: removed.len() - removed_failed,
        removed_failed,
        remaining_frozen,
    };
    info!(
        removed = outcome.removed,
        completed = outcome.removed_completed,
        failed = outcome.removed_failed,
        remaining = outcome.remaining_frozen,
        "retention sweep"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sabtrack_core::{CanonicalItem, DownloadRecord};
    use sabtrack_storage::SqliteRecordStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).single().unwrap()
    }

    fn terminal(id: &str, status: DownloadStatus, hours_ago: i64) -> DownloadRecord {
        let item = CanonicalItem {
            id: id.into(),
            name: id.into(),
            status,
            detailed_status: None,
            progress_percent: 100.0,
            size_total_mb: 1.0,
            size_left_mb: 0.0,
            time_left: None,
            speed_mbps: 0.0,
            category: None,
            priority: None,
            queue_position: None,
            season: None,
            episode: None,
            completed_at: Some(now() - Duration::hours(hours_ago)),
            failed: status == DownloadStatus::Failed,
            failure_reason: None,
        };
        DownloadRecord::from_item(&item, now())
    }

    #[tokio::test]
    async fn failed_at_49h_goes_and_completed_at_47h_stays() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        store.insert_new(&terminal("failed-49", DownloadStatus::Failed, 49)).await.unwrap();
        store.insert_new(&terminal("completed-47", DownloadStatus::Completed, 47)).await.unwrap();

        let outcome = sweep(&store, Duration::hours(48), now()).await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.removed_failed, 1);
        assert_eq!(outcome.remaining_frozen, 1);
        assert!(store.get("failed-49").await.unwrap().is_none());
        assert!(store.get("completed-47").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn both_terminal_kinds_age_out() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        store.insert_new(&terminal("failed-49", DownloadStatus::Failed, 49)).await.unwrap();
        store.insert_new(&terminal("completed-49", DownloadStatus::Completed, 49)).await.unwrap();
        store.insert_new(&terminal("failed-47", DownloadStatus::Failed, 47)).await.unwrap();

        let outcome = sweep(&store, Duration::hours(48), now()).await.unwrap();
        assert_eq!((outcome.removed_completed, outcome.removed_failed), (1, 1));
        assert!(store.get("completed-49").await.unwrap().is_none());
        assert!(store.get("failed-47").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn active_records_are_never_swept() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let mut stale = terminal("active", DownloadStatus::Queued, 100);
        stale.completed_at = None;
        store.insert_new(&stale).await.unwrap();

        let outcome = sweep(&store, Duration::hours(1), now()).await.unwrap();
        assert_eq!(outcome.removed, 0);
        assert!(store.get("active").await.unwrap().is_some());
    }
}
