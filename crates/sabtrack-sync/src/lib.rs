//! Reconciliation, enrichment and retention over the download record store,
//! plus the service surface the HTTP layer and CLI drive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sabtrack_adapters::{AdapterError, ArrCatalog, CatalogSource, QueueSource, SabnzbdClient};
use sabtrack_core::{DownloadRecord, DownloadStats, DownloadStatus};
use sabtrack_storage::{HttpClientConfig, HttpFetcher, RecordStore, SqliteRecordStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod enrichment;
pub mod matching;
pub mod reconcile;
pub mod retention;
pub mod scheduler;

pub use config::{AppConfig, RetentionConfig, ScheduleConfig, UpstreamConfig};
pub use enrichment::EnrichmentOutcome;
pub use matching::{clean, score, CatalogRouter, ACCEPTANCE_THRESHOLD};
pub use reconcile::{plan_post_processing, plan_transition, reconcile, FetchedState, ReconcileFailure, ReconcileOutcome, Transition};
pub use retention::RetentionOutcome;
pub use scheduler::{SingleFlight, TickGuards, TickScheduler};

pub const CRATE_NAME: &str = "sabtrack-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileFailure),
}

#[derive(Debug, Error)]
pub enum PriorityError {
    #[error("unknown priority level {0}")]
    UnknownLevel(String),
    #[error("download {0} not found")]
    NotFound(String),
    #[error("download {id} is {status}; only active downloads can be reprioritised")]
    NotActive { id: String, status: DownloadStatus },
    #[error("upstream rejected priority change: {0}")]
    Upstream(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tracker knobs lifted out of [`AppConfig`].
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub history_limit: usize,
    pub retention_window: chrono::Duration,
    pub enrichment_batch_size: usize,
    /// Lowercased level name to upstream integer.
    pub priority_levels: BTreeMap<String, i32>,
}

impl TrackerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            history_limit: config.upstream.history_limit,
            retention_window: config.retention.window(),
            enrichment_batch_size: config.schedule.enrichment_batch_size,
            priority_levels: config
                .priority_levels
                .iter()
                .map(|(level, value)| (level.to_lowercase(), *value))
                .collect(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            history_limit: UpstreamConfig::default().history_limit,
            retention_window: RetentionConfig::default().window(),
            enrichment_batch_size: ScheduleConfig::default().enrichment_batch_size,
            priority_levels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncTickReport {
    pub run_id: Uuid,
    pub queue_fetched: bool,
    pub history_fetched: bool,
    pub outcome: ReconcileOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityUpdate {
    pub id: String,
    pub level: String,
    pub value: i32,
    pub position: Option<i64>,
}

/// The download tracker: one store, one upstream, N catalogs.
pub struct Tracker {
    store: Arc<dyn RecordStore>,
    upstream: Arc<dyn QueueSource>,
    router: CatalogRouter,
    settings: TrackerSettings,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        upstream: Arc<dyn QueueSource>,
        catalogs: Vec<Arc<dyn CatalogSource>>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            store,
            upstream,
            router: CatalogRouter::new(catalogs),
            settings,
        }
    }

    /// Open the configured database and build the SABnzbd and catalog clients.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteRecordStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.upstream.timeout_secs),
            ..Default::default()
        })?);

        let upstream = SabnzbdClient::new(&config.upstream.url, config.upstream.api_key.clone(), Arc::clone(&http));
        let catalogs = config
            .catalogs
            .iter()
            .map(|c| Arc::new(ArrCatalog::new(c.clone(), Arc::clone(&http))) as Arc<dyn CatalogSource>)
            .collect();

        info!(
            upstream = %config.upstream.url,
            catalogs = config.catalogs.len(),
            database = %config.database_url,
            "tracker configured"
        );
        Ok(Self::new(
            Arc::new(store),
            Arc::new(upstream),
            catalogs,
            TrackerSettings::from_config(config),
        ))
    }

    /// Swap the upstream source, e.g. for replaying recorded responses.
    pub fn with_upstream(mut self, upstream: Arc<dyn QueueSource>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Fetch queue and history, then reconcile whatever arrived.
    pub async fn run_sync_tick(&self) -> Result<SyncTickReport, SyncError> {
        let run_id = Uuid::new_v4();
        self.sync_once(run_id)
            .instrument(info_span!("sync_tick", %run_id))
            .await
    }

    async fn sync_once(&self, run_id: Uuid) -> Result<SyncTickReport, SyncError> {
        let (queue, history) = tokio::join!(
            self.upstream.fetch_queue(),
            self.upstream.fetch_history(self.settings.history_limit)
        );
        let (queue, history) = match (queue, history) {
            (Err(queue_err), Err(history_err)) => {
                warn!(error = %history_err, "history fetch failed");
                return Err(SyncError::Upstream(queue_err));
            }
            (queue, history) => (fetched(queue, "queue"), fetched(history, "history")),
        };

        let state = FetchedState { queue, history };
        let outcome = reconcile(self.store.as_ref(), &state, Utc::now()).await?;
        Ok(SyncTickReport {
            run_id,
            queue_fetched: state.queue.is_some(),
            history_fetched: state.history.is_some(),
            outcome,
        })
    }

    pub async fn run_enrichment_tick(&self) -> Result<EnrichmentOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let outcome = enrichment::enrich_batch(
            self.store.as_ref(),
            &self.router,
            self.settings.enrichment_batch_size,
        )
        .instrument(info_span!("enrichment_tick", %run_id))
        .await?;
        Ok(outcome)
    }

    pub async fn run_cleanup_tick(&self) -> Result<RetentionOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let outcome = retention::sweep(self.store.as_ref(), self.settings.retention_window, Utc::now())
            .instrument(info_span!("cleanup_tick", %run_id))
            .await?;
        Ok(outcome)
    }

    /// Every record, or only those with `status`.
    pub async fn downloads(&self, status: Option<DownloadStatus>) -> Result<Vec<DownloadRecord>, StoreError> {
        match status {
            Some(status) => self.store.list(&[status]).await,
            None => self.store.list(&[]).await,
        }
    }

    pub async fn stats(&self) -> Result<DownloadStats, StoreError> {
        self.store.stats().await
    }

    /// Change an active download's priority upstream and mirror it locally.
    pub async fn update_priority(&self, id: &str, level: &str) -> Result<PriorityUpdate, PriorityError> {
        let value = *self
            .settings
            .priority_levels
            .get(&level.trim().to_lowercase())
            .ok_or_else(|| PriorityError::UnknownLevel(level.to_string()))?;

        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| PriorityError::NotFound(id.to_string()))?;
        if record.is_frozen() {
            return Err(PriorityError::NotActive {
                id: id.to_string(),
                status: record.status,
            });
        }

        let ack = self.upstream.set_priority(id, value).await?;
        tracing::debug!(target: "sabtrack::priority", id, level, value, position = ?ack.position, "priority acknowledged");

        if !self.store.set_priority(id, &value.to_string(), Utc::now()).await? {
            // Froze between the check and the write.
            let status = self.store.get(id).await?.map_or(DownloadStatus::Failed, |r| r.status);
            return Err(PriorityError::NotActive {
                id: id.to_string(),
                status,
            });
        }
        info!(id, level, value, "priority updated");
        Ok(PriorityUpdate {
            id: id.to_string(),
            level: level.to_string(),
            value,
            position: ack.position,
        })
    }

    /// Let enrichment retry every record that still has no poster.
    pub async fn reset_poster_flags(&self) -> Result<u64, StoreError> {
        let reset = self.store.reset_poster_attempts().await?;
        info!(reset, "poster flags reset");
        Ok(reset)
    }
}

fn fetched<T>(result: Result<T, AdapterError>, what: &'static str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, what, "upstream fetch failed; continuing with partial data");
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{item, ScriptedUpstream};
    use super::*;

    async fn tracker(upstream: Arc<ScriptedUpstream>) -> Tracker {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let settings = TrackerSettings {
            priority_levels: [("low".to_string(), -1), ("high".to_string(), 1)].into_iter().collect(),
            ..TrackerSettings::default()
        };
        Tracker::new(Arc::new(store), upstream, Vec::new(), settings)
    }

    #[tokio::test]
    async fn sync_tick_tracks_and_orphans() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let tracker = tracker(Arc::clone(&upstream)).await;

        upstream.set(
            Some(vec![item("a", DownloadStatus::Downloading, Some(1)), item("b", DownloadStatus::Queued, Some(2))]),
            Some(vec![]),
        );
        let report = tracker.run_sync_tick().await.unwrap();
        assert_eq!(report.outcome.created, 2);
        assert_eq!(report.outcome.snapshot.downloading, 1);

        upstream.set(Some(vec![item("b", DownloadStatus::Downloading, Some(1))]), Some(vec![]));
        let report = tracker.run_sync_tick().await.unwrap();
        assert_eq!(report.outcome.orphaned, 1);

        let failed = tracker.downloads(Some(DownloadStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "a");

        let stats = tracker.stats().await.unwrap();
        assert_eq!((stats.downloading, stats.failed), (1, 1));
        assert_eq!(stats.total_speed_mbps, 11.11);
    }

    #[tokio::test]
    async fn one_failed_fetch_still_reconciles_the_other() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let tracker = tracker(Arc::clone(&upstream)).await;

        upstream.set(Some(vec![item("a", DownloadStatus::Downloading, Some(1))]), Some(vec![]));
        tracker.run_sync_tick().await.unwrap();

        upstream.set(None, Some(vec![item("z", DownloadStatus::Completed, None)]));
        let report = tracker.run_sync_tick().await.unwrap();
        assert!(!report.queue_fetched);
        assert_eq!(report.outcome.created, 1);
        assert_eq!(report.outcome.orphaned, 0);

        upstream.set(None, None);
        assert!(matches!(tracker.run_sync_tick().await, Err(SyncError::Upstream(_))));
        assert_eq!(tracker.downloads(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn priority_update_checks_level_and_state() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let tracker = tracker(Arc::clone(&upstream)).await;
        upstream.set(
            Some(vec![item("a", DownloadStatus::Queued, Some(2))]),
            Some(vec![item("done", DownloadStatus::Completed, None)]),
        );
        tracker.run_sync_tick().await.unwrap();

        let update = tracker.update_priority("a", "HIGH").await.unwrap();
        assert_eq!(update.value, 1);
        assert_eq!(tracker.store().get("a").await.unwrap().unwrap().priority.as_deref(), Some("1"));
        assert_eq!(upstream.priority_calls.lock().unwrap().as_slice(), &[("a".to_string(), 1)]);

        assert!(matches!(tracker.update_priority("a", "paused").await, Err(PriorityError::UnknownLevel(_))));
        assert!(matches!(tracker.update_priority("nope", "low").await, Err(PriorityError::NotFound(_))));
        assert!(matches!(
            tracker.update_priority("done", "low").await,
            Err(PriorityError::NotActive { status: DownloadStatus::Completed, .. })
        ));
        assert_eq!(upstream.priority_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enrichment_without_catalogs_marks_attempted_and_reset_reopens() {
        let upstream = Arc::new(ScriptedUpstream::default());
        let tracker = tracker(Arc::clone(&upstream)).await;
        upstream.set(Some(vec![item("a", DownloadStatus::Downloading, Some(1))]), Some(vec![]));
        tracker.run_sync_tick().await.unwrap();

        let outcome = tracker.run_enrichment_tick().await.unwrap();
        assert_eq!((outcome.attempted, outcome.unmatched), (1, 1));
        assert_eq!(tracker.run_enrichment_tick().await.unwrap().attempted, 0);
        assert_eq!(tracker.reset_poster_flags().await.unwrap(), 1);
        assert_eq!(tracker.run_enrichment_tick().await.unwrap().attempted, 1);
    }

    #[tokio::test]
    async fn busy_sync_job_is_skipped() {
        let upstream = Arc::new(ScriptedUpstream::default());
        upstream.set(Some(vec![]), Some(vec![]));
        let tracker = tracker(Arc::clone(&upstream)).await;
        let guards = TickGuards::default();
        let previous = tokio::sync::Mutex::new(None);

        let held = guards.sync.try_enter().unwrap();
        assert!(!scheduler::sync_job(&tracker, &guards.sync, &previous).await);
        drop(held);
        assert!(scheduler::sync_job(&tracker, &guards.sync, &previous).await);
        assert_eq!(*previous.lock().await, Some(Default::default()));
        assert!(scheduler::cleanup_job(&tracker, &guards.cleanup).await);
    }
}
