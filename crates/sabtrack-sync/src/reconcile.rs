//! Merging fetched items into the record store under the freeze/orphan rules.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sabtrack_adapters::{observed_ids, ParsedHistory, ParsedQueue, PostProcessing};
use sabtrack_core::{CanonicalItem, DownloadRecord, DownloadStatus, QueueSnapshot, ORPHAN_FAILURE_REASON};
use sabtrack_storage::{RecordStore, StoreError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Whatever one sync tick managed to fetch. A `None` side failed upstream.
#[derive(Debug, Clone, Default)]
pub struct FetchedState {
    pub queue: Option<ParsedQueue>,
    pub history: Option<ParsedHistory>,
}

/// What to do with one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Create(DownloadRecord),
    Overwrite(DownloadRecord),
    Freeze(DownloadRecord),
    Ignore,
}

/// Decide the state-machine step for `item` given the stored record.
pub fn plan_transition(
    existing: Option<&DownloadRecord>,
    item: &CanonicalItem,
    now: DateTime<Utc>,
) -> Transition {
    let Some(existing) = existing else {
        return Transition::Create(DownloadRecord::from_item(item, now));
    };
    if existing.is_frozen() {
        return Transition::Ignore;
    }

    let mut next = existing.clone();
    next.overwrite_from(item, now);
    if item.status.is_terminal() {
        next.completed_at = existing.completed_at.or(item.completed_at).or(Some(now));
        Transition::Freeze(next)
    } else {
        Transition::Overwrite(next)
    }
}

/// Demote an active record whose job left the queue for post-processing.
///
/// It gives up its queue slot and speed so the next slot can download, and
/// carries the phase in `detailed_status`. Unknown ids are never created here.
pub fn plan_post_processing(
    existing: Option<&DownloadRecord>,
    phase: &str,
    now: DateTime<Utc>,
) -> Transition {
    let Some(existing) = existing.filter(|r| !r.is_frozen()) else {
        return Transition::Ignore;
    };
    let already_demoted = existing.status == DownloadStatus::Queued
        && existing.queue_position.is_none()
        && existing.speed_mbps == 0.0
        && existing.detailed_status.as_deref() == Some(phase);
    if already_demoted {
        return Transition::Ignore;
    }

    let mut next = existing.clone();
    next.status = DownloadStatus::Queued;
    next.queue_position = None;
    next.speed_mbps = 0.0;
    next.time_left = None;
    next.detailed_status = Some(phase.to_string());
    next.updated_at = now;
    Transition::Overwrite(next)
}

/// Queue items followed by history items, one per id. A terminal observation
/// of an id beats an active one.
pub fn merge_observations(state: &FetchedState) -> Vec<CanonicalItem> {
    let queue = state.queue.iter().flat_map(|q| q.items.iter());
    let history = state.history.iter().flat_map(|h| h.items.iter());

    let mut merged: Vec<CanonicalItem> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in queue.chain(history) {
        match index.get(&item.id) {
            Some(&at) => {
                if item.status.is_terminal() && !merged[at].status.is_terminal() {
                    merged[at] = item.clone();
                }
            }
            None => {
                index.insert(item.id.clone(), merged.len());
                merged.push(item.clone());
            }
        }
    }
    merged
}

pub fn snapshot_of(items: &[CanonicalItem]) -> QueueSnapshot {
    let mut snapshot = QueueSnapshot::default();
    for item in items {
        match item.status {
            DownloadStatus::Downloading => snapshot.downloading += 1,
            DownloadStatus::Queued => snapshot.queued += 1,
            DownloadStatus::Paused => snapshot.paused += 1,
            DownloadStatus::Completed => snapshot.completed += 1,
            DownloadStatus::Failed => snapshot.failed += 1,
        }
    }
    snapshot
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub frozen: usize,
    pub ignored: usize,
    pub orphaned: usize,
    pub orphan_check_ran: bool,
    pub snapshot: QueueSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Frozen,
    Ignored,
}

impl ReconcileOutcome {
    fn count(&mut self, applied: Applied) {
        match applied {
            Applied::Created => self.created += 1,
            Applied::Updated => self.updated += 1,
            Applied::Frozen => self.frozen += 1,
            Applied::Ignored => self.ignored += 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("reconciliation stopped after a store failure")]
pub struct ReconcileFailure {
    pub outcome: ReconcileOutcome,
    #[source]
    pub source: StoreError,
}

async fn apply_item(
    store: &dyn RecordStore,
    item: &CanonicalItem,
    now: DateTime<Utc>,
) -> Result<Applied, StoreError> {
    let existing = store.get(&item.id).await?;
    apply(store, plan_transition(existing.as_ref(), item, now)).await
}

async fn apply_post_processing(
    store: &dyn RecordStore,
    job: &PostProcessing,
    now: DateTime<Utc>,
) -> Result<Applied, StoreError> {
    let existing = store.get(&job.id).await?;
    let applied = apply(store, plan_post_processing(existing.as_ref(), &job.phase, now)).await?;
    if applied == Applied::Updated {
        debug!(id = %job.id, phase = %job.phase, "download left the queue for post-processing");
    }
    Ok(applied)
}

async fn apply(store: &dyn RecordStore, transition: Transition) -> Result<Applied, StoreError> {
    let applied = match transition {
        Transition::Create(record) => {
            if store.insert_new(&record).await? {
                info!(id = %record.id, name = %record.name, status = %record.status, "new download tracked");
                Applied::Created
            } else {
                Applied::Ignored
            }
        }
        Transition::Overwrite(record) => {
            if store.update_unfrozen(&record).await? {
                Applied::Updated
            } else {
                Applied::Ignored
            }
        }
        Transition::Freeze(record) => {
            if store.update_unfrozen(&record).await? {
                info!(id = %record.id, name = %record.name, status = %record.status, "download finished");
                Applied::Frozen
            } else {
                Applied::Ignored
            }
        }
        Transition::Ignore => Applied::Ignored,
    };
    Ok(applied)
}

/// Fail every active record that no longer appears anywhere upstream.
async fn fail_orphans(
    store: &dyn RecordStore,
    seen: &HashSet<&str>,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let mut orphaned = 0;
    for record in store.list(&DownloadStatus::ACTIVE).await? {
        if seen.contains(record.id.as_str()) {
            continue;
        }
        if store.mark_orphaned(&record.id, ORPHAN_FAILURE_REASON, now).await? {
            warn!(id = %record.id, name = %record.name, "download removed upstream; marked failed");
            orphaned += 1;
        }
    }
    Ok(orphaned)
}

/// Apply one tick's fetched state.
///
/// Orphan detection only runs when both queue and history were fetched; with
/// either side missing, absence proves nothing. A store failure stops the merge
/// but the orphan pass still runs before the failure is reported.
pub async fn reconcile(
    store: &dyn RecordStore,
    state: &FetchedState,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, ReconcileFailure> {
    let items = merge_observations(state);
    let mut outcome = ReconcileOutcome {
        snapshot: snapshot_of(&items),
        ..Default::default()
    };
    let mut failure: Option<StoreError> = None;

    for item in &items {
        match apply_item(store, item, now).await {
            Ok(applied) => outcome.count(applied),
            Err(err) => {
                error!(id = %item.id, error = %err, "store write failed; stopping merge");
                failure = Some(err);
                break;
            }
        }
    }

    // A job reported with a terminal state is handled above.
    let merged: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
    let post_processing = state
        .history
        .iter()
        .flat_map(|h| h.post_processing.iter())
        .filter(|job| !merged.contains(job.id.as_str()));
    if failure.is_none() {
        for job in post_processing {
            match apply_post_processing(store, job, now).await {
                Ok(applied) => outcome.count(applied),
                Err(err) => {
                    error!(id = %job.id, error = %err, "store write failed; stopping merge");
                    failure = Some(err);
                    break;
                }
            }
        }
    }

    if let (Some(queue), Some(history)) = (&state.queue, &state.history) {
        let seen: HashSet<&str> = observed_ids(&queue.items, history).collect();
        outcome.orphan_check_ran = true;
        match fail_orphans(store, &seen, now).await {
            Ok(count) => outcome.orphaned = count,
            Err(err) => {
                error!(error = %err, "orphan detection failed");
                failure.get_or_insert(err);
            }
        }
    } else {
        debug!("partial fetch; orphan detection skipped");
    }

    match failure {
        Some(source) => Err(ReconcileFailure { outcome, source }),
        None => Ok(outcome),
    }
}
