//! Record store contract and its SQLite implementation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sabtrack_core::{DownloadRecord, DownloadStats, DownloadStatus, MediaMatch, MediaType};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {id} has invalid {field}: {value}")]
    CorruptRow {
        id: String,
        field: &'static str,
        value: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Keyed persistence for download records.
///
/// Observation writes never touch media columns; enrichment writes never
/// touch status.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<DownloadRecord>>;

    /// Insert a record for an unseen id. Returns `false` if the id already exists.
    async fn insert_new(&self, record: &DownloadRecord) -> StoreResult<bool>;

    /// Overwrite observed fields (including status and `completed_at`) of a
    /// record that is not frozen. Returns `false` if the stored record is
    /// frozen or missing.
    async fn update_unfrozen(&self, record: &DownloadRecord) -> StoreResult<bool>;

    /// Force an active record into `failed` with `reason`.
    async fn mark_orphaned(&self, id: &str, reason: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Write media metadata (when found) and mark the poster lookup attempted.
    async fn record_match(&self, id: &str, found: Option<&MediaMatch>) -> StoreResult<bool>;

    /// Mirror an upstream priority change onto an active record.
    async fn set_priority(&self, id: &str, priority: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Records in any of `statuses`; an empty slice lists everything.
    async fn list(&self, statuses: &[DownloadStatus]) -> StoreResult<Vec<DownloadRecord>>;

    /// Records of `status` whose poster lookup has not been attempted yet.
    /// Active records come in queue order, terminal ones newest first.
    async fn list_unattempted(
        &self,
        status: DownloadStatus,
        limit: usize,
    ) -> StoreResult<Vec<DownloadRecord>>;

    /// Delete every frozen record completed strictly before `cutoff`,
    /// returning what was removed.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DownloadRecord>>;

    async fn count(&self, statuses: &[DownloadStatus]) -> StoreResult<u64>;

    async fn stats(&self) -> StoreResult<DownloadStats>;

    /// Clear `poster_attempted` on records that still have no poster.
    async fn reset_poster_attempts(&self) -> StoreResult<u64>;
}

/// SQLite-backed record store.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: Pool<Sqlite>,
}

impl SqliteRecordStore {
    /// Open (creating if missing) the database at `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        if let Some(path) = sqlite_file_path(database_url) {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // One connection serialises writers and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn sqlite_file_path(database_url: &str) -> Option<&Path> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(Path::new(path))
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, category, priority, status, detailed_status, progress_percent,
           size_total_mb, size_left_mb, time_left, speed_mbps, queue_position,
           media_type, media_title, poster_url, year, catalog_instance, season, episode,
           poster_attempted, added_at, completed_at, updated_at, failed, failure_reason
      FROM downloads
"#;

const TERMINAL_PREDICATE: &str = "status IN ('completed', 'failed')";

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn decode_ts(id: &str, field: &'static str, raw: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(raw).ok_or_else(|| StoreError::CorruptRow {
        id: id.to_string(),
        field,
        value: raw.to_string(),
    })
}

fn decode_record(row: &SqliteRow) -> StoreResult<DownloadRecord> {
    let id: String = row.try_get("id")?;

    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<DownloadStatus>()
        .map_err(|_| StoreError::CorruptRow {
            id: id.clone(),
            field: "status",
            value: status_raw.clone(),
        })?;

    let media_type = match row.try_get::<Option<String>, _>("media_type")? {
        Some(raw) => Some(raw.parse::<MediaType>().map_err(|_| StoreError::CorruptRow {
            id: id.clone(),
            field: "media_type",
            value: raw.clone(),
        })?),
        None => None,
    };

    let queue_position = match row.try_get::<Option<i64>, _>("queue_position")? {
        Some(raw) => Some(u32::try_from(raw).map_err(|_| StoreError::CorruptRow {
            id: id.clone(),
            field: "queue_position",
            value: raw.to_string(),
        })?),
        None => None,
    };

    let added_at = decode_ts(&id, "added_at", row.try_get("added_at")?)?;
    let updated_at = decode_ts(&id, "updated_at", row.try_get("updated_at")?)?;
    let completed_at = match row.try_get::<Option<i64>, _>("completed_at")? {
        Some(raw) => Some(decode_ts(&id, "completed_at", raw)?),
        None => None,
    };

    Ok(DownloadRecord {
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        priority: row.try_get("priority")?,
        status,
        detailed_status: row.try_get("detailed_status")?,
        progress_percent: row.try_get("progress_percent")?,
        size_total_mb: row.try_get("size_total_mb")?,
        size_left_mb: row.try_get("size_left_mb")?,
        time_left: row.try_get("time_left")?,
        speed_mbps: row.try_get("speed_mbps")?,
        queue_position,
        media_type,
        media_title: row.try_get("media_title")?,
        poster_url: row.try_get("poster_url")?,
        year: row.try_get("year")?,
        catalog_instance: row.try_get("catalog_instance")?,
        season: row.try_get("season")?,
        episode: row.try_get("episode")?,
        poster_attempted: row.try_get("poster_attempted")?,
        added_at,
        completed_at,
        updated_at,
        failed: row.try_get("failed")?,
        failure_reason: row.try_get("failure_reason")?,
        id,
    })
}

fn push_status_filter(builder: &mut QueryBuilder<'_, Sqlite>, statuses: &[DownloadStatus]) {
    builder.push(" status IN (");
    let mut separated = builder.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, id: &str) -> StoreResult<Option<DownloadRecord>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn insert_new(&self, record: &DownloadRecord) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO downloads (
                id, name, category, priority, status, detailed_status, progress_percent,
                size_total_mb, size_left_mb, time_left, speed_mbps, queue_position,
                media_type, media_title, poster_url, year, catalog_instance, season, episode,
                poster_attempted, added_at, completed_at, updated_at, failed, failure_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.category)
        .bind(&record.priority)
        .bind(record.status.as_str())
        .bind(&record.detailed_status)
        .bind(record.progress_percent)
        .bind(record.size_total_mb)
        .bind(record.size_left_mb)
        .bind(&record.time_left)
        .bind(record.speed_mbps)
        .bind(record.queue_position.map(i64::from))
        .bind(record.media_type.map(MediaType::as_str))
        .bind(&record.media_title)
        .bind(&record.poster_url)
        .bind(record.year)
        .bind(&record.catalog_instance)
        .bind(record.season)
        .bind(record.episode)
        .bind(record.poster_attempted)
        .bind(millis(record.added_at))
        .bind(record.completed_at.map(millis))
        .bind(millis(record.updated_at))
        .bind(record.failed)
        .bind(&record.failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_unfrozen(&self, record: &DownloadRecord) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE downloads
               SET name = ?, category = ?, priority = ?, status = ?, detailed_status = ?,
                   progress_percent = ?, size_total_mb = ?, size_left_mb = ?, time_left = ?,
                   speed_mbps = ?, queue_position = ?, season = ?, episode = ?,
                   completed_at = COALESCE(completed_at, ?), updated_at = ?,
                   failed = ?, failure_reason = ?
             WHERE id = ?
               AND NOT {TERMINAL_PREDICATE}
            "#
        ))
        .bind(&record.name)
        .bind(&record.category)
        .bind(&record.priority)
        .bind(record.status.as_str())
        .bind(&record.detailed_status)
        .bind(record.progress_percent)
        .bind(record.size_total_mb)
        .bind(record.size_left_mb)
        .bind(&record.time_left)
        .bind(record.speed_mbps)
        .bind(record.queue_position.map(i64::from))
        .bind(record.season)
        .bind(record.episode)
        .bind(record.completed_at.map(millis))
        .bind(millis(record.updated_at))
        .bind(record.failed)
        .bind(&record.failure_reason)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_orphaned(&self, id: &str, reason: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE downloads
               SET status = 'failed', failed = 1, failure_reason = ?,
                   completed_at = COALESCE(completed_at, ?), updated_at = ?
             WHERE id = ?
               AND NOT {TERMINAL_PREDICATE}
            "#
        ))
        .bind(reason)
        .bind(millis(now))
        .bind(millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_match(&self, id: &str, found: Option<&MediaMatch>) -> StoreResult<bool> {
        let result = match found {
            Some(found) => {
                sqlx::query(
                    r#"
                    UPDATE downloads
                       SET media_type = ?, media_title = ?, poster_url = ?, year = ?,
                           catalog_instance = ?, poster_attempted = 1
                     WHERE id = ?
                    "#,
                )
                .bind(found.media_type.as_str())
                .bind(&found.media_title)
                .bind(&found.poster_url)
                .bind(found.year)
                .bind(&found.catalog_instance)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE downloads SET poster_attempted = 1 WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn set_priority(&self, id: &str, priority: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE downloads SET priority = ?, updated_at = ? WHERE id = ? AND NOT {TERMINAL_PREDICATE}"
        ))
        .bind(priority)
        .bind(millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, statuses: &[DownloadStatus]) -> StoreResult<Vec<DownloadRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        if !statuses.is_empty() {
            builder.push(" WHERE");
            push_status_filter(&mut builder, statuses);
        }
        builder.push(
            " ORDER BY queue_position IS NULL, queue_position, completed_at DESC, added_at DESC",
        );
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_record).collect()
    }

    async fn list_unattempted(
        &self,
        status: DownloadStatus,
        limit: usize,
    ) -> StoreResult<Vec<DownloadRecord>> {
        let order = if status.is_terminal() {
            "completed_at DESC, added_at DESC"
        } else {
            "queue_position IS NULL, queue_position, added_at"
        };
        let rows = sqlx::query(&format!(
            r#"{SELECT_COLUMNS}
             WHERE status = ? AND poster_attempted = 0 AND poster_url IS NULL
             ORDER BY {order}
             LIMIT ?"#
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_record).collect()
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<DownloadRecord>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE {TERMINAL_PREDICATE} AND completed_at < ? ORDER BY completed_at"
        ))
        .bind(millis(cutoff))
        .fetch_all(&mut *tx)
        .await?;
        let removed = rows.iter().map(decode_record).collect::<StoreResult<Vec<_>>>()?;

        let result = sqlx::query(&format!(
            "DELETE FROM downloads WHERE {TERMINAL_PREDICATE} AND completed_at < ?"
        ))
        .bind(millis(cutoff))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(selected = removed.len(), deleted = result.rows_affected(), "retention delete");
        Ok(removed)
    }

    async fn count(&self, statuses: &[DownloadStatus]) -> StoreResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS n FROM downloads");
        if !statuses.is_empty() {
            builder.push(" WHERE");
            push_status_filter(&mut builder, statuses);
        }
        let row = builder.build().fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn stats(&self) -> StoreResult<DownloadStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n, COALESCE(SUM(speed_mbps), 0.0) AS speed
              FROM downloads
             GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = DownloadStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n = row.try_get::<i64, _>("n")?.max(0) as u64;
            match status.parse::<DownloadStatus>() {
                Ok(DownloadStatus::Downloading) => {
                    stats.downloading = n;
                    let speed: f64 = row.try_get("speed")?;
                    stats.total_speed_mbps = (speed * 100.0).round() / 100.0;
                }
                Ok(DownloadStatus::Queued) => stats.queued = n,
                Ok(DownloadStatus::Paused) => stats.paused = n,
                Ok(DownloadStatus::Completed) => stats.completed = n,
                Ok(DownloadStatus::Failed) => stats.failed = n,
                Err(_) => {
                    return Err(StoreError::CorruptRow {
                        id: "<aggregate>".into(),
                        field: "status",
                        value: status,
                    })
                }
            }
        }
        Ok(stats)
    }

    async fn reset_poster_attempts(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE downloads SET poster_attempted = 0 WHERE poster_url IS NULL AND poster_attempted = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
