//! HTTP handlers for read-side index operations: browse, statistics, search,
//! version history and bucket settings.

use crate::{
    AppState,
    errors::AppError,
    models::{browse::SearchQuery, job::{JobKey, SyncOptions}},
    services::entity_store::normalize_prefix,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, warn};

/// `?prefix=` accepted by prefix-scoped endpoints; missing means the bucket root.
#[derive(Debug, Deserialize, Default)]
pub struct PrefixQuery {
    pub prefix: Option<String>,
}

impl PrefixQuery {
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub prefix: Option<String>,
    pub extension: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct VersionsQuery {
    pub key: String,
}

/// GET `/profiles/{profile}/buckets` — per-bucket totals of a profile.
pub async fn list_buckets(
    State(state): State<AppState>,
    Path(profile): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.query.bucket_stats(&profile).await?))
}

/// GET `/profiles/{profile}/buckets/{bucket}/browse?prefix=`
///
/// Served from the index. On a miss a background sync of the prefix is
/// started when auto sync is enabled; the response does not wait for it.
pub async fn browse(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(q): Query<PrefixQuery>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.query.browse(&profile, &bucket, q.prefix()).await?;

    if !result.fully_indexed && state.auto_sync {
        let key = JobKey::new(&profile, &bucket, normalize_prefix(q.prefix()));
        if !state.store.registry().is_covered(&key) {
            match state.sync.trigger_sync(key.clone(), SyncOptions::default()) {
                Ok(_) => debug!("browse miss on {}; sync started", key),
                Err(err) => warn!("browse miss on {}; sync not started: {}", key, err),
            }
        }
    }

    Ok(Json(result))
}

/// GET `/profiles/{profile}/buckets/{bucket}/stats?prefix=`
pub async fn prefix_stats(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(q): Query<PrefixQuery>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(
        state
            .query
            .prefix_stats(&profile, &bucket, q.prefix())
            .await?,
    ))
}

/// GET `/profiles/{profile}/buckets/{bucket}/search?q=&prefix=&extension=&limit=`
pub async fn search(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, AppError> {
    let query = SearchQuery {
        text: params.q,
        prefix: params.prefix,
        extension: params.extension,
        limit: params.limit,
    };
    Ok(Json(state.query.search(&profile, &bucket, &query).await?))
}

/// GET `/profiles/{profile}/buckets/{bucket}/versions?key=`
pub async fn versions(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(q): Query<VersionsQuery>,
) -> Result<impl IntoResponse, AppError> {
    if q.key.is_empty() {
        return Err(AppError::bad_request("key must not be empty"));
    }
    let versions = state.query.versions(&profile, &bucket, &q.key).await?;
    if versions.is_empty() {
        return Err(AppError::not_found(format!("no versions of `{}`", q.key)));
    }
    Ok(Json(versions))
}

/// GET `/profiles/{profile}/buckets/{bucket}/info` — cached bucket settings,
/// refreshed from the remote when stale.
pub async fn bucket_info(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.sync.bucket_info(&profile, &bucket).await?))
}

/// POST `/profiles/{profile}/buckets/{bucket}/invalidate?prefix=`
pub async fn invalidate(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(q): Query<PrefixQuery>,
) -> Result<impl IntoResponse, AppError> {
    state
        .store
        .invalidate_prefix(&profile, &bucket, q.prefix())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE `/profiles/{profile}/buckets/{bucket}/index?prefix=` — drop every
/// indexed row at or under the prefix.
pub async fn purge(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(q): Query<PrefixQuery>,
) -> Result<impl IntoResponse, AppError> {
    let removed = state
        .store
        .purge_prefix(&profile, &bucket, q.prefix())
        .await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}
