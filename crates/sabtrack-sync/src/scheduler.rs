//! Periodic ticks with one run in flight per tick kind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sabtrack_core::QueueSnapshot;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::Tracker;

/// Skip-if-busy guard for one tick kind.
#[derive(Debug, Clone)]
pub struct SingleFlight {
    kind: &'static str,
    lock: Arc<Mutex<()>>,
}

impl SingleFlight {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// `None` while another run of this kind holds the guard.
    pub fn try_enter(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.lock).try_lock_owned().ok()
    }

    /// Resolve once no run of this kind is in flight.
    pub async fn wait_idle(&self) {
        drop(self.lock.lock().await);
    }
}

#[derive(Debug, Clone)]
pub struct TickGuards {
    pub sync: SingleFlight,
    pub enrichment: SingleFlight,
    pub cleanup: SingleFlight,
}

impl Default for TickGuards {
    fn default() -> Self {
        Self {
            sync: SingleFlight::new("sync"),
            enrichment: SingleFlight::new("enrichment"),
            cleanup: SingleFlight::new("cleanup"),
        }
    }
}

impl TickGuards {
    pub async fn wait_idle(&self) {
        for guard in [&self.sync, &self.enrichment, &self.cleanup] {
            guard.wait_idle().await;
            debug!(tick = guard.kind(), "tick idle");
        }
    }
}

/// One guarded sync tick. The summary is logged at info only when the queue
/// shape differs from `previous`. Returns `false` if skipped as busy.
pub async fn sync_job(
    tracker: &Tracker,
    guard: &SingleFlight,
    previous: &Mutex<Option<QueueSnapshot>>,
) -> bool {
    let Some(_running) = guard.try_enter() else {
        debug!("sync tick still running; skipped");
        return false;
    };
    match tracker.run_sync_tick().await {
        Ok(report) => {
            let snapshot = report.outcome.snapshot;
            let mut last = previous.lock().await;
            if last.as_ref() != Some(&snapshot) {
                info!(
                    downloading = snapshot.downloading,
                    queued = snapshot.queued,
                    paused = snapshot.paused,
                    completed = snapshot.completed,
                    failed = snapshot.failed,
                    created = report.outcome.created,
                    orphaned = report.outcome.orphaned,
                    "queue changed"
                );
            } else {
                debug!(updated = report.outcome.updated, "queue unchanged");
            }
            *last = Some(snapshot);
        }
        Err(err) => error!(error = %err, "sync tick failed"),
    }
    true
}

pub async fn enrichment_job(tracker: &Tracker, guard: &SingleFlight) -> bool {
    let Some(_running) = guard.try_enter() else {
        debug!("enrichment tick still running; skipped");
        return false;
    };
    if let Err(err) = tracker.run_enrichment_tick().await {
        error!(error = %err, "enrichment tick failed");
    }
    true
}

pub async fn cleanup_job(tracker: &Tracker, guard: &SingleFlight) -> bool {
    let Some(_running) = guard.try_enter() else {
        debug!("cleanup tick still running; skipped");
        return false;
    };
    if let Err(err) = tracker.run_cleanup_tick().await {
        error!(error = %err, "cleanup tick failed");
    }
    true
}

/// The three repeating ticks driven by `tokio-cron-scheduler`.
pub struct TickScheduler {
    scheduler: JobScheduler,
    guards: TickGuards,
}

impl TickScheduler {
    pub async fn start(tracker: Arc<Tracker>, config: &AppConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let guards = TickGuards::default();
        let previous = Arc::new(Mutex::new(None::<QueueSnapshot>));

        let sync = {
            let (tracker, guard, previous) =
                (Arc::clone(&tracker), guards.sync.clone(), Arc::clone(&previous));
            Job::new_repeated_async(
                Duration::from_secs(config.schedule.sync_interval_secs),
                move |_id, _sched| {
                    let (tracker, guard, previous) =
                        (Arc::clone(&tracker), guard.clone(), Arc::clone(&previous));
                    Box::pin(async move {
                        sync_job(&tracker, &guard, &previous).await;
                    })
                },
            )
            .context("creating sync job")?
        };

        let enrichment = {
            let (tracker, guard) = (Arc::clone(&tracker), guards.enrichment.clone());
            Job::new_repeated_async(
                Duration::from_secs(config.schedule.enrichment_interval_secs),
                move |_id, _sched| {
                    let (tracker, guard) = (Arc::clone(&tracker), guard.clone());
                    Box::pin(async move {
                        enrichment_job(&tracker, &guard).await;
                    })
                },
            )
            .context("creating enrichment job")?
        };

        let cleanup = {
            let (tracker, guard) = (Arc::clone(&tracker), guards.cleanup.clone());
            Job::new_repeated_async(config.retention.check_interval(), move |_id, _sched| {
                let (tracker, guard) = (Arc::clone(&tracker), guard.clone());
                Box::pin(async move {
                    cleanup_job(&tracker, &guard).await;
                })
            })
            .context("creating cleanup job")?
        };

        for job in [sync, enrichment, cleanup] {
            scheduler.add(job).await.context("adding scheduler job")?;
        }
        scheduler.start().await.context("starting scheduler")?;
        info!(
            sync_secs = config.schedule.sync_interval_secs,
            enrichment_secs = config.schedule.enrichment_interval_secs,
            cleanup_minutes = config.retention.check_interval_minutes,
            "scheduler started"
        );

        Ok(Self { scheduler, guards })
    }

    /// Stop firing new ticks, then wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        self.guards.wait_idle().await;
        info!("scheduler stopped");
        Ok(())
    }
}
