//! Poster/media enrichment of records that have not been looked up yet.

use sabtrack_core::{DownloadRecord, DownloadStatus};
use sabtrack_storage::{RecordStore, StoreResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::matching::{CatalogRouter, EntryCache};

/// Lookup order for unattempted records. Within a status, active records go
/// by queue position and terminal ones newest first.
pub const ENRICHMENT_ORDER: [DownloadStatus; 5] = [
    DownloadStatus::Downloading,
    DownloadStatus::Queued,
    DownloadStatus::Paused,
    DownloadStatus::Completed,
    DownloadStatus::Failed,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentOutcome {
    pub attempted: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub errored: usize,
}

/// Up to `limit` records still waiting for a lookup, in [`ENRICHMENT_ORDER`].
pub async fn select_batch(store: &dyn RecordStore, limit: usize) -> StoreResult<Vec<DownloadRecord>> {
    let mut batch = Vec::with_capacity(limit);
    for status in ENRICHMENT_ORDER {
        let remaining = limit.saturating_sub(batch.len());
        if remaining == 0 {
            break;
        }
        batch.extend(store.list_unattempted(status, remaining).await?);
    }
    Ok(batch)
}

/// Look up one batch. Every selected record ends up marked attempted, whether
/// it matched, missed, or its catalog was unreachable.
pub async fn enrich_batch(
    store: &dyn RecordStore,
    router: &CatalogRouter,
    limit: usize,
) -> StoreResult<EnrichmentOutcome> {
    let batch = select_batch(store, limit).await?;
    let mut cache = EntryCache::default();
    let mut outcome = EnrichmentOutcome::default();

    for record in &batch {
        let found = match router
            .route(&mut cache, &record.name, record.category.as_deref())
            .await
        {
            Ok(Some(found)) => {
                debug!(target: "sabtrack::poster", id = %record.id, title = %found.media_title, poster = ?found.poster_url, "media matched");
                outcome.matched += 1;
                Some(found)
            }
            Ok(None) => {
                debug!(target: "sabtrack::poster", id = %record.id, name = %record.name, "no confident match");
                outcome.unmatched += 1;
                None
            }
            Err(err) => {
                warn!(id = %record.id, error = %err, "catalog lookup failed");
                outcome.errored += 1;
                None
            }
        };
        store.record_match(&record.id, found.as_ref()).await?;
        outcome.attempted += 1;
    }

    if outcome.attempted > 0 {
        info!(
            attempted = outcome.attempted,
            matched = outcome.matched,
            unmatched = outcome.unmatched,
            errored = outcome.errored,
            "enrichment batch done"
        );
    }
    Ok(outcome)
}
