//! SABnzbd queue/history payloads, classification into canonical items, and the API client.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sabtrack_core::{CanonicalItem, DownloadStatus};
use sabtrack_storage::{HttpFetcher, JsonRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::normalize::{lenient_f64, normalize_episode, normalize_season, parse_speed_mbps};
use crate::release::parse_release;
use crate::{AdapterError, QueueSource};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// History phases that mean the job is still being post-processed.
const POST_PROCESSING_PHASES: &[&str] = &[
    "queued",
    "quickcheck",
    "verifying",
    "repairing",
    "fetching",
    "extracting",
    "moving",
    "running",
    "checking",
    "propagating",
    "grabbing",
    "downloading",
];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueueResponse {
    pub queue: Option<QueuePayload>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QueuePayload {
    pub slots: Vec<QueueSlot>,
    pub paused: Option<JsonValue>,
    pub speed: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSlot {
    pub nzo_id: Option<String>,
    pub filename: Option<String>,
    pub status: Option<String>,
    pub percentage: Option<JsonValue>,
    pub mb: Option<JsonValue>,
    pub mbleft: Option<JsonValue>,
    pub timeleft: Option<String>,
    pub cat: Option<String>,
    pub priority: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HistoryResponse {
    pub history: Option<HistoryPayload>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryPayload {
    pub slots: Vec<HistorySlot>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HistorySlot {
    pub nzo_id: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub fail_message: Option<String>,
    pub bytes: Option<JsonValue>,
    pub category: Option<String>,
    pub completed: Option<JsonValue>,
}

/// Canonical view of one queue fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQueue {
    pub items: Vec<CanonicalItem>,
    pub paused: bool,
    pub speed_mbps: f64,
    pub rejected: usize,
}

/// A job SABnzbd moved to history that is still being post-processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessing {
    pub id: String,
    pub phase: String,
}

/// Canonical view of one history fetch.
///
/// `post_processing` jobs count as observed but carry no terminal state yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedHistory {
    pub items: Vec<CanonicalItem>,
    pub post_processing: Vec<PostProcessing>,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriorityAck {
    pub position: Option<i64>,
}

impl PriorityAck {
    fn from_response(value: &JsonValue) -> Result<Self, AdapterError> {
        if value.get("status").and_then(JsonValue::as_bool) == Some(false) {
            let detail = value
                .get("error")
                .and_then(JsonValue::as_str)
                .unwrap_or("upstream rejected the priority change")
                .to_string();
            return Err(AdapterError::Malformed {
                what: "priority",
                detail,
            });
        }
        let position = value.get("position").and_then(|p| match p {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Ok(Self { position })
    }
}

fn truthy(raw: Option<&JsonValue>) -> bool {
    match raw {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => matches!(s.trim(), "1" | "true" | "True" | "TRUE"),
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

fn text(raw: Option<&JsonValue>) -> Option<String> {
    match raw? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// `*` is SABnzbd's "no category" marker.
fn category(raw: Option<&str>) -> Option<String> {
    non_empty(raw).filter(|c| c != "*")
}

fn epoch_seconds(raw: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    let secs = lenient_f64(raw);
    if secs > 0.0 {
        DateTime::from_timestamp(secs as i64, 0)
    } else {
        None
    }
}

/// Derive canonical queue items from a raw queue payload.
///
/// Position is the 1-based slot order. A slot is `paused` if it says so or the
/// whole queue is paused; otherwise the slot in position 1 is `downloading`
/// (post-processing phases included) and every other slot is `queued`. Only
/// the downloading slot reports speed, taken from the queue aggregate.
pub fn classify_queue(payload: &QueuePayload) -> ParsedQueue {
    let queue_paused = truthy(payload.paused.as_ref());
    let speed_mbps = payload.speed.as_deref().map(parse_speed_mbps).unwrap_or(0.0);

    let mut items = Vec::with_capacity(payload.slots.len());
    let mut rejected = 0usize;

    for (index, slot) in payload.slots.iter().enumerate() {
        let position = u32::try_from(index + 1).unwrap_or(u32::MAX);
        let Some(id) = non_empty(slot.nzo_id.as_deref()) else {
            warn!(position, "queue slot without nzo_id skipped");
            rejected += 1;
            continue;
        };

        let detailed_status = non_empty(slot.status.as_deref());
        let slot_paused = detailed_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("paused"));
        let status = if slot_paused || queue_paused {
            DownloadStatus::Paused
        } else if position == 1 {
            DownloadStatus::Downloading
        } else {
            DownloadStatus::Queued
        };

        let progress_percent = lenient_f64(slot.percentage.as_ref()).clamp(0.0, 100.0);
        let speed = if status == DownloadStatus::Downloading && progress_percent > 0.0 {
            speed_mbps
        } else {
            0.0
        };

        let priority = text(slot.priority.as_ref());
        if position <= 3 {
            debug!(target: "sabtrack::priority", position, ?priority, "queue slot priority");
        }

        let name = non_empty(slot.filename.as_deref()).unwrap_or_else(|| id.clone());
        let release = parse_release(&name);
        debug!(target: "sabtrack::parse", %name, title = %release.title, year = ?release.year, "parsed queue release");

        items.push(CanonicalItem {
            id,
            name,
            status,
            detailed_status,
            progress_percent,
            size_total_mb: lenient_f64(slot.mb.as_ref()),
            size_left_mb: lenient_f64(slot.mbleft.as_ref()),
            time_left: non_empty(slot.timeleft.as_deref()),
            speed_mbps: speed,
            category: category(slot.cat.as_deref()),
            priority,
            queue_position: Some(position),
            season: normalize_season(release.season.as_ref()),
            episode: normalize_episode(release.episode.as_ref()),
            completed_at: None,
            failed: false,
            failure_reason: None,
        });
    }

    ParsedQueue {
        items,
        paused: queue_paused,
        speed_mbps,
        rejected,
    }
}

/// Derive terminal canonical items from a raw history payload.
pub fn parse_history(payload: &HistoryPayload) -> ParsedHistory {
    let mut parsed = ParsedHistory::default();

    for slot in &payload.slots {
        let Some(id) = non_empty(slot.nzo_id.as_deref()) else {
            warn!("history slot without nzo_id skipped");
            parsed.rejected += 1;
            continue;
        };

        let status_raw = non_empty(slot.status.as_deref());
        let fail_message = non_empty(slot.fail_message.as_deref());
        let failed = fail_message.is_some()
            || status_raw
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("failed"));
        let phase = status_raw.as_deref().filter(|s| {
            POST_PROCESSING_PHASES
                .iter()
                .any(|phase| phase.eq_ignore_ascii_case(s))
        });
        if let (Some(phase), false) = (phase, failed) {
            parsed.post_processing.push(PostProcessing {
                id,
                phase: phase.to_string(),
            });
            continue;
        }

        let name = non_empty(slot.name.as_deref()).unwrap_or_else(|| id.clone());
        let release = parse_release(&name);

        parsed.items.push(CanonicalItem {
            id,
            name,
            status: if failed {
                DownloadStatus::Failed
            } else {
                DownloadStatus::Completed
            },
            detailed_status: status_raw,
            progress_percent: if failed { 0.0 } else { 100.0 },
            size_total_mb: lenient_f64(slot.bytes.as_ref()) / BYTES_PER_MB,
            size_left_mb: 0.0,
            time_left: None,
            speed_mbps: 0.0,
            category: category(slot.category.as_deref()),
            priority: None,
            queue_position: None,
            season: normalize_season(release.season.as_ref()),
            episode: normalize_episode(release.episode.as_ref()),
            completed_at: epoch_seconds(slot.completed.as_ref()),
            failed,
            failure_reason: fail_message,
        });
    }

    parsed
}

/// SABnzbd JSON API client.
#[derive(Debug, Clone)]
pub struct SabnzbdClient {
    base_url: String,
    api_key: String,
    http: Arc<HttpFetcher>,
}

impl SabnzbdClient {
    pub fn new(base_url: &str, api_key: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        mode: &str,
        extra: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let url = format!("{}/api", self.base_url);
        let mut request = JsonRequest::get("sabnzbd", &url)
            .query("apikey", &self.api_key)
            .query("output", "json")
            .query("mode", mode);
        for (key, value) in extra {
            request = request.query(key, value);
        }
        Ok(self.http.fetch_json(request).await?)
    }
}

#[async_trait]
impl QueueSource for SabnzbdClient {
    async fn fetch_queue(&self) -> Result<ParsedQueue, AdapterError> {
        let response: QueueResponse = self.call("queue", &[]).await?;
        let payload = response.queue.ok_or_else(|| AdapterError::Malformed {
            what: "queue",
            detail: "response has no `queue` object".into(),
        })?;
        Ok(classify_queue(&payload))
    }

    async fn fetch_history(&self, limit: usize) -> Result<ParsedHistory, AdapterError> {
        let response: HistoryResponse = self
            .call("history", &[("limit", limit.to_string())])
            .await?;
        let payload = response.history.ok_or_else(|| AdapterError::Malformed {
            what: "history",
            detail: "response has no `history` object".into(),
        })?;
        Ok(parse_history(&payload))
    }

    async fn set_priority(&self, id: &str, priority: i32) -> Result<PriorityAck, AdapterError> {
        let response: JsonValue = self
            .call(
                "queue",
                &[
                    ("name", "priority".to_string()),
                    ("value", id.to_string()),
                    ("value2", priority.to_string()),
                ],
            )
            .await?;
        PriorityAck::from_response(&response)
    }
}
