//! Core download-tracking domain model for sabtrack.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sabtrack-core";

/// Failure reason recorded on records the upstream source stopped reporting.
pub const ORPHAN_FAILURE_REASON: &str = "removed upstream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Queued,
    Paused,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub const ACTIVE: [DownloadStatus; 3] = [Self::Downloading, Self::Queued, Self::Paused];
    pub const TERMINAL: [DownloadStatus; 2] = [Self::Completed, Self::Failed];
    pub const ALL: [DownloadStatus; 5] = [
        Self::Downloading,
        Self::Queued,
        Self::Paused,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Queued => "queued",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed records are frozen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value `{value}` for {kind}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for DownloadStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "download status",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Tv => "tv",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "movie" => Ok(Self::Movie),
            "tv" => Ok(Self::Tv),
            _ => Err(ParseEnumError {
                kind: "media type",
                value: s.to_string(),
            }),
        }
    }
}

/// Normalized upstream observation handed from the adapters into reconciliation.
///
/// `season` and `episode` are already collapsed to a scalar here; the list
/// shapes the upstream release parser can emit never reach this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: String,
    pub name: String,
    pub status: DownloadStatus,
    pub detailed_status: Option<String>,
    pub progress_percent: f64,
    pub size_total_mb: f64,
    pub size_left_mb: f64,
    pub time_left: Option<String>,
    pub speed_mbps: f64,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub queue_position: Option<u32>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed: bool,
    pub failure_reason: Option<String>,
}

/// Metadata found for a release in a catalog instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMatch {
    pub media_type: MediaType,
    pub media_title: String,
    pub poster_url: Option<String>,
    pub year: Option<i32>,
    pub catalog_instance: String,
}

/// Persisted download record, keyed by the upstream-issued `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub status: DownloadStatus,
    pub detailed_status: Option<String>,
    pub progress_percent: f64,
    pub size_total_mb: f64,
    pub size_left_mb: f64,
    pub time_left: Option<String>,
    pub speed_mbps: f64,
    pub queue_position: Option<u32>,
    pub media_type: Option<MediaType>,
    pub media_title: Option<String>,
    pub poster_url: Option<String>,
    pub year: Option<i32>,
    pub catalog_instance: Option<String>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub poster_attempted: bool,
    pub added_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub failed: bool,
    pub failure_reason: Option<String>,
}

impl DownloadRecord {
    /// Build a fresh record from the first observation of an id.
    pub fn from_item(item: &CanonicalItem, now: DateTime<Utc>) -> Self {
        let mut record = Self {
            id: item.id.clone(),
            name: item.name.clone(),
            category: None,
            priority: None,
            status: item.status,
            detailed_status: None,
            progress_percent: 0.0,
            size_total_mb: 0.0,
            size_left_mb: 0.0,
            time_left: None,
            speed_mbps: 0.0,
            queue_position: None,
            media_type: None,
            media_title: None,
            poster_url: None,
            year: None,
            catalog_instance: None,
            season: None,
            episode: None,
            poster_attempted: false,
            added_at: now,
            completed_at: None,
            updated_at: now,
            failed: false,
            failure_reason: None,
        };
        record.overwrite_from(item, now);
        if item.status.is_terminal() {
            record.completed_at = Some(item.completed_at.unwrap_or(now));
        }
        record
    }

    /// Copy every observed field except `id` and `added_at`.
    ///
    /// Media enrichment columns and `completed_at` are not part of an
    /// observation and are left alone.
    pub fn overwrite_from(&mut self, item: &CanonicalItem, now: DateTime<Utc>) {
        self.name = item.name.clone();
        self.category = item.category.clone();
        self.priority = item.priority.clone();
        self.status = item.status;
        self.detailed_status = item.detailed_status.clone();
        self.progress_percent = item.progress_percent;
        self.size_total_mb = item.size_total_mb;
        self.size_left_mb = item.size_left_mb;
        self.time_left = item.time_left.clone();
        self.speed_mbps = item.speed_mbps;
        self.queue_position = item.queue_position;
        self.season = item.season;
        self.episode = item.episode;
        self.failed = item.failed;
        self.failure_reason = item.failure_reason.clone();
        self.updated_at = now;
    }

    pub fn is_frozen(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn display_name(&self) -> &str {
        self.media_title.as_deref().unwrap_or(&self.name)
    }
}

/// Counts per status plus the summed speed of the active slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadStats {
    pub downloading: u64,
    pub queued: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_speed_mbps: f64,
}

/// Shape of the upstream queue after a sync tick, compared tick-to-tick by
/// the caller to decide whether anything worth logging changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub downloading: usize,
    pub queued: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueSnapshot {
    pub fn total(&self) -> usize {
        self.downloading + self.queued + self.paused + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn item(id: &str, status: DownloadStatus) -> CanonicalItem {
        CanonicalItem {
            id: id.to_string(),
            name: "Some.Show.S01E02.1080p.WEB-DL".to_string(),
            status,
            detailed_status: Some("Downloading".into()),
            progress_percent: 42.0,
            size_total_mb: 1000.0,
            size_left_mb: 580.0,
            time_left: Some("0:10:00".into()),
            speed_mbps: 12.5,
            category: Some("tv".into()),
            priority: Some("Normal".into()),
            queue_position: Some(1),
            season: Some(1),
            episode: Some(2),
            completed_at: None,
            failed: false,
            failure_reason: None,
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in DownloadStatus::ALL {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
        assert!("extracting".parse::<DownloadStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&DownloadStatus::Downloading).unwrap(),
            "\"downloading\""
        );
    }

    #[test]
    fn terminal_statuses_are_exactly_completed_and_failed() {
        let terminal: Vec<_> = DownloadStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, DownloadStatus::TERMINAL.to_vec());
    }

    #[test]
    fn active_item_creates_record_without_completion_time() {
        let record = DownloadRecord::from_item(&item("a", DownloadStatus::Downloading), ts(1));
        assert_eq!(record.added_at, ts(1));
        assert_eq!(record.completed_at, None);
        assert!(!record.poster_attempted);
        assert_eq!(record.queue_position, Some(1));
    }

    #[test]
    fn terminal_item_prefers_upstream_completion_time() {
        let mut done = item("b", DownloadStatus::Completed);
        done.completed_at = Some(ts(2));
        let record = DownloadRecord::from_item(&done, ts(5));
        assert_eq!(record.completed_at, Some(ts(2)));

        let record = DownloadRecord::from_item(&item("c", DownloadStatus::Failed), ts(5));
        assert_eq!(record.completed_at, Some(ts(5)));
    }

    #[test]
    fn overwrite_keeps_identity_and_enrichment() {
        let mut record = DownloadRecord::from_item(&item("a", DownloadStatus::Queued), ts(1));
        record.media_title = Some("Some Show".into());
        record.poster_attempted = true;

        let mut next = item("a", DownloadStatus::Downloading);
        next.progress_percent = 90.0;
        record.overwrite_from(&next, ts(3));

        assert_eq!(record.added_at, ts(1));
        assert_eq!(record.updated_at, ts(3));
        assert_eq!(record.progress_percent, 90.0);
        assert_eq!(record.media_title.as_deref(), Some("Some Show"));
        assert!(record.poster_attempted);
        assert_eq!(record.display_name(), "Some Show");
    }
}
