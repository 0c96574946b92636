//! HTTP handlers for request metrics and storage statistics.

use crate::{AppState, errors::AppError};
use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::metrics::DailyStats;

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    /// `YYYY-MM-DD`; defaults to today (UTC).
    pub date: Option<NaiveDate>,
    /// Recompute the rollup from the event log before returning it.
    #[serde(default)]
    pub reconcile: bool,
}

#[derive(Debug, Deserialize)]
pub struct StorageQuery {
    pub profile: String,
}

#[derive(Serialize)]
struct DailyResponse {
    #[serde(flatten)]
    stats: DailyStats,
    cache_hit_rate: f64,
}

/// GET `/metrics/daily?date=&reconcile=`
pub async fn daily(
    State(state): State<AppState>,
    Query(q): Query<DailyQuery>,
) -> Result<impl IntoResponse, AppError> {
    let date = q.date.unwrap_or_else(|| Utc::now().date_naive());
    state.metrics.flush().await;

    let stats = if q.reconcile {
        state.metrics.reconcile_daily(date).await?
    } else {
        state
            .metrics
            .daily_stats(date)
            .await?
            .unwrap_or_else(|| DailyStats {
                stat_date: date.to_string(),
                ..DailyStats::default()
            })
    };

    Ok(Json(DailyResponse {
        cache_hit_rate: stats.cache_hit_rate(),
        stats,
    }))
}

/// GET `/metrics/storage?profile=` — totals per storage class.
pub async fn storage(
    State(state): State<AppState>,
    Query(q): Query<StorageQuery>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.query.storage_stats(&q.profile).await?))
}
