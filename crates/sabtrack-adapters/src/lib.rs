//! Upstream and catalog adapter contracts plus boundary parsing into canonical items.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sabtrack_core::{CanonicalItem, MediaType};
use sabtrack_storage::FetchError;
use serde::de::DeserializeOwned;
use thiserror::Error;

mod catalog;
mod normalize;
mod release;
mod sabnzbd;

pub use catalog::{ArrCatalog, ArrCatalogConfig, CatalogEntry, CatalogImage};
pub use normalize::{lenient_f64, normalize_episode, normalize_season, parse_speed_mbps};
pub use release::{parse_release, ReleaseInfo};
pub use sabnzbd::{
    classify_queue, parse_history, HistoryPayload, HistoryResponse, HistorySlot, ParsedHistory,
    ParsedQueue, PostProcessing, PriorityAck, QueuePayload, QueueResponse, QueueSlot,
    SabnzbdClient,
};

pub const CRATE_NAME: &str = "sabtrack-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {what} payload: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The upstream download manager reporting its live queue and recent history.
#[async_trait]
pub trait QueueSource: Send + Sync {
    async fn fetch_queue(&self) -> Result<ParsedQueue, AdapterError>;

    async fn fetch_history(&self, limit: usize) -> Result<ParsedHistory, AdapterError>;

    async fn set_priority(&self, id: &str, priority: i32) -> Result<PriorityAck, AdapterError>;
}

/// A library catalog bound to one upstream category.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &str;
    fn media_type(&self) -> MediaType;
    fn category(&self) -> &str;
    /// Base URL that relative image paths resolve against.
    fn base_url(&self) -> &str;

    async fn list_entries(&self) -> Result<Vec<CatalogEntry>, AdapterError>;
}

/// Replays recorded `queue.json` / `history.json` API responses from a directory.
#[derive(Debug, Clone)]
pub struct FixtureQueueSource {
    dir: PathBuf,
}

impl FixtureQueueSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl QueueSource for FixtureQueueSource {
    async fn fetch_queue(&self) -> Result<ParsedQueue, AdapterError> {
        let response: QueueResponse = read_json_file(self.dir.join("queue.json"))?;
        Ok(classify_queue(&response.queue.unwrap_or_default()))
    }

    async fn fetch_history(&self, limit: usize) -> Result<ParsedHistory, AdapterError> {
        let response: HistoryResponse = read_json_file(self.dir.join("history.json"))?;
        let mut history = response.history.unwrap_or_default();
        history.slots.truncate(limit);
        Ok(parse_history(&history))
    }

    async fn set_priority(&self, id: &str, _priority: i32) -> Result<PriorityAck, AdapterError> {
        Err(AdapterError::Malformed {
            what: "priority",
            detail: format!("recorded source cannot reprioritise {id}"),
        })
    }
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Ids observed in one fetch, whether or not they produced a write.
pub fn observed_ids<'a>(
    queue: &'a [CanonicalItem],
    history: &'a ParsedHistory,
) -> impl Iterator<Item = &'a str> {
    queue
        .iter()
        .chain(history.items.iter())
        .map(|item| item.id.as_str())
        .chain(history.post_processing.iter().map(|job| job.id.as_str()))
}
