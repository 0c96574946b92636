//! Append-only request log with rolling daily aggregates.
//!
//! Recording never blocks the caller: events go onto an unbounded queue
//! drained by a single writer task. The writer stores each event and updates
//! its day's rollup in one transaction, keyed by the event id, so replaying
//! an event is a no-op.

use chrono::{NaiveDate, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{
    models::metrics::{CacheEvent, DailyStats, MetricsEvent, RequestCategory},
    services::entity_store::StoreResult,
};

const WRITE_ATTEMPTS: u32 = 5;
const WRITE_BACKOFF: Duration = Duration::from_millis(50);

const DAILY_COLUMNS: &str = "stat_date, total_requests, list_requests, get_requests, \
     put_requests, delete_requests, other_requests, error_count, bytes_downloaded, \
     bytes_uploaded, avg_duration_ms, max_duration_ms, cache_hits, cache_misses, \
     cache_saved_requests";

enum Command {
    Request(MetricsEvent),
    Cache(CacheEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(FromRow)]
struct RequestTotals {
    total_requests: i64,
    list_requests: i64,
    get_requests: i64,
    put_requests: i64,
    delete_requests: i64,
    other_requests: i64,
    error_count: i64,
    bytes_downloaded: i64,
    bytes_uploaded: i64,
    avg_duration_ms: f64,
    max_duration_ms: i64,
}

#[derive(FromRow)]
struct CacheTotals {
    cache_hits: i64,
    cache_misses: i64,
    cache_saved_requests: i64,
}

#[derive(Clone)]
pub struct MetricsRecorder {
    db: Arc<SqlitePool>,
    queue: mpsc::UnboundedSender<Command>,
}

impl MetricsRecorder {
    /// Create a recorder and spawn its writer task on the current runtime.
    pub fn spawn(db: Arc<SqlitePool>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(db.clone(), rx));
        Self { db, queue }
    }

    /// Queue one request event. Returns immediately.
    pub fn record_request(&self, event: MetricsEvent) {
        if self.queue.send(Command::Request(event)).is_err() {
            warn!("metrics writer stopped; request event dropped");
        }
    }

    /// Queue one cache decision. Returns immediately.
    pub fn record_cache_event(&self, event: CacheEvent) {
        if self.queue.send(Command::Cache(event)).is_err() {
            warn!("metrics writer stopped; cache event dropped");
        }
    }

    /// Wait until every event queued before this call has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Rollup for one calendar day.
    pub async fn daily_stats(&self, date: NaiveDate) -> StoreResult<Option<DailyStats>> {
        let sql = format!(
            "SELECT {} FROM metrics_daily_stats WHERE stat_date = ?",
            DAILY_COLUMNS
        );
        Ok(sqlx::query_as::<_, DailyStats>(&sql)
            .bind(date.to_string())
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Rollups for the most recent `days` days that have any activity.
    pub async fn recent_daily_stats(&self, days: i64) -> StoreResult<Vec<DailyStats>> {
        let sql = format!(
            "SELECT {} FROM metrics_daily_stats ORDER BY stat_date DESC LIMIT ?",
            DAILY_COLUMNS
        );
        Ok(sqlx::query_as::<_, DailyStats>(&sql)
            .bind(days.max(1))
            .fetch_all(&*self.db)
            .await?)
    }

    /// Recompute one day's rollup from the event log, replacing the running
    /// values and any drift they accumulated.
    pub async fn reconcile_daily(&self, date: NaiveDate) -> StoreResult<DailyStats> {
        let day = date.to_string();
        let mut tx = self.db.begin().await?;
        ensure_daily_row(&mut tx, &day).await?;

        let requests = sqlx::query_as::<_, RequestTotals>(
            "SELECT COUNT(*) AS total_requests,
                    COALESCE(SUM(category = 'list'), 0) AS list_requests,
                    COALESCE(SUM(category = 'get'), 0) AS get_requests,
                    COALESCE(SUM(category = 'put'), 0) AS put_requests,
                    COALESCE(SUM(category = 'delete'), 0) AS delete_requests,
                    COALESCE(SUM(category = 'other'), 0) AS other_requests,
                    COALESCE(SUM(success = 0), 0) AS error_count,
                    COALESCE(SUM(CASE WHEN category IN ('get', 'list') THEN bytes ELSE 0 END), 0)
                        AS bytes_downloaded,
                    COALESCE(SUM(CASE WHEN category = 'put' THEN bytes ELSE 0 END), 0)
                        AS bytes_uploaded,
                    COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms,
                    COALESCE(MAX(duration_ms), 0) AS max_duration_ms
             FROM metrics_requests WHERE stat_date = ?",
        )
        .bind(&day)
        .fetch_one(&mut *tx)
        .await?;

        let cache = sqlx::query_as::<_, CacheTotals>(
            "SELECT COALESCE(SUM(hit = 1), 0) AS cache_hits,
                    COALESCE(SUM(hit = 0), 0) AS cache_misses,
                    COALESCE(SUM(saved_requests), 0) AS cache_saved_requests
             FROM metrics_cache_events WHERE stat_date = ?",
        )
        .bind(&day)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE metrics_daily_stats SET
                total_requests = ?, list_requests = ?, get_requests = ?, put_requests = ?,
                delete_requests = ?, other_requests = ?, error_count = ?,
                bytes_downloaded = ?, bytes_uploaded = ?, avg_duration_ms = ?,
                max_duration_ms = ?, cache_hits = ?, cache_misses = ?,
                cache_saved_requests = ?, updated_at = ?
             WHERE stat_date = ?",
        )
        .bind(requests.total_requests)
        .bind(requests.list_requests)
        .bind(requests.get_requests)
        .bind(requests.put_requests)
        .bind(requests.delete_requests)
        .bind(requests.other_requests)
        .bind(requests.error_count)
        .bind(requests.bytes_downloaded)
        .bind(requests.bytes_uploaded)
        .bind(requests.avg_duration_ms)
        .bind(requests.max_duration_ms)
        .bind(cache.cache_hits)
        .bind(cache.cache_misses)
        .bind(cache.cache_saved_requests)
        .bind(Utc::now())
        .bind(&day)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.daily_stats(date)
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    /// Persist one request event and fold it into its day's rollup.
    /// Returns false when the event id was already recorded.
    pub async fn apply_request(&self, event: &MetricsEvent) -> StoreResult<bool> {
        apply_request(&self.db, event).await
    }

    /// Persist one cache event and fold it into its day's rollup.
    /// Returns false when the event id was already recorded.
    pub async fn apply_cache_event(&self, event: &CacheEvent) -> StoreResult<bool> {
        apply_cache_event(&self.db, event).await
    }
}

async fn run_writer(db: Arc<SqlitePool>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Request(event) => {
                with_retry("request", || apply_request(&db, &event)).await;
            }
            Command::Cache(event) => {
                with_retry("cache", || apply_cache_event(&db, &event)).await;
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("metrics writer stopped");
}

async fn with_retry<F, Fut>(kind: &str, mut write: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<bool>>,
{
    let mut delay = WRITE_BACKOFF;
    for attempt in 1..=WRITE_ATTEMPTS {
        match write().await {
            Ok(_) => return,
            Err(err) if attempt < WRITE_ATTEMPTS => {
                warn!("{} metrics write failed (attempt {}): {}", kind, attempt, err);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => {
                error!("{} metrics event lost after {} attempts: {}", kind, attempt, err);
            }
        }
    }
}

async fn apply_request(db: &SqlitePool, event: &MetricsEvent) -> StoreResult<bool> {
    let day = event.stat_date().to_string();
    let mut tx = db.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO metrics_requests (
            id, recorded_at, stat_date, operation, category, profile_id, bucket_name,
            duration_ms, bytes, success, error
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING",
    )
    .bind(event.id.to_string())
    .bind(event.recorded_at)
    .bind(&day)
    .bind(&event.operation)
    .bind(event.category.as_str())
    .bind(event.profile_id.as_deref())
    .bind(event.bucket_name.as_deref())
    .bind(event.duration_ms)
    .bind(event.bytes)
    .bind(event.success)
    .bind(event.error.as_deref())
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if !inserted {
        return Ok(false);
    }

    ensure_daily_row(&mut tx, &day).await?;
    let flag = |category: RequestCategory| i64::from(event.category == category);
    let (downloaded, uploaded) = match event.category {
        RequestCategory::Get | RequestCategory::List => (event.bytes, 0),
        RequestCategory::Put => (0, event.bytes),
        _ => (0, 0),
    };

    // Running mean: new_avg = old_avg + (duration - old_avg) / new_count.
    sqlx::query(
        "UPDATE metrics_daily_stats SET
            total_requests = total_requests + 1,
            list_requests = list_requests + ?,
            get_requests = get_requests + ?,
            put_requests = put_requests + ?,
            delete_requests = delete_requests + ?,
            other_requests = other_requests + ?,
            error_count = error_count + ?,
            bytes_downloaded = bytes_downloaded + ?,
            bytes_uploaded = bytes_uploaded + ?,
            avg_duration_ms = avg_duration_ms + (? - avg_duration_ms) / (total_requests + 1),
            max_duration_ms = MAX(max_duration_ms, ?),
            updated_at = ?
         WHERE stat_date = ?",
    )
    .bind(flag(RequestCategory::List))
    .bind(flag(RequestCategory::Get))
    .bind(flag(RequestCategory::Put))
    .bind(flag(RequestCategory::Delete))
    .bind(flag(RequestCategory::Other))
    .bind(i64::from(!event.success))
    .bind(downloaded)
    .bind(uploaded)
    .bind(event.duration_ms as f64)
    .bind(event.duration_ms)
    .bind(Utc::now())
    .bind(&day)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

async fn apply_cache_event(db: &SqlitePool, event: &CacheEvent) -> StoreResult<bool> {
    let day = event.stat_date().to_string();
    let mut tx = db.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO metrics_cache_events (
            id, recorded_at, stat_date, operation, profile_id, bucket_name, hit, saved_requests
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING",
    )
    .bind(event.id.to_string())
    .bind(event.recorded_at)
    .bind(&day)
    .bind(&event.operation)
    .bind(event.profile_id.as_deref())
    .bind(event.bucket_name.as_deref())
    .bind(event.hit)
    .bind(event.saved_requests)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if !inserted {
        return Ok(false);
    }

    ensure_daily_row(&mut tx, &day).await?;
    sqlx::query(
        "UPDATE metrics_daily_stats SET
            cache_hits = cache_hits + ?,
            cache_misses = cache_misses + ?,
            cache_saved_requests = cache_saved_requests + ?,
            updated_at = ?
         WHERE stat_date = ?",
    )
    .bind(i64::from(event.hit))
    .bind(i64::from(!event.hit))
    .bind(event.saved_requests)
    .bind(Utc::now())
    .bind(&day)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

async fn ensure_daily_row(conn: &mut SqliteConnection, day: &str) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO metrics_daily_stats (stat_date, updated_at) VALUES (?, ?)
         ON CONFLICT(stat_date) DO NOTHING",
    )
    .bind(day)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
