//! HTTP handlers for sync jobs: trigger, cancel and a server-sent progress
//! stream.

use crate::{
    AppState,
    errors::AppError,
    handlers::index_handlers::PrefixQuery,
    models::job::{JobKey, SyncOptions},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, Stream};
use serde::Deserialize;

/// Body of `POST .../sync`.
#[derive(Debug, Deserialize, Default)]
pub struct SyncRequest {
    #[serde(default)]
    pub prefix: String,
    pub max_requests: Option<u32>,
    pub page_size: Option<i32>,
    #[serde(default)]
    pub force: bool,
}

/// POST `/profiles/{profile}/buckets/{bucket}/sync` — start (or attach to)
/// a sync job and return its current progress.
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    body: Option<Json<SyncRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let key = JobKey::new(profile, bucket, req.prefix);
    let options = SyncOptions {
        max_requests: req.max_requests,
        page_size: req.page_size,
        force: req.force,
    };
    let handle = state.sync.trigger_sync(key, options)?;
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot())))
}

/// DELETE `/profiles/{profile}/buckets/{bucket}/sync?prefix=`
pub async fn cancel_sync(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(q): Query<PrefixQuery>,
) -> Result<impl IntoResponse, AppError> {
    let key = JobKey::new(profile, bucket, q.prefix());
    if !state.sync.cancel_sync(&key) {
        return Err(AppError::not_found(format!("no active sync for {}", key)));
    }
    Ok(StatusCode::ACCEPTED)
}

/// GET `/profiles/{profile}/buckets/{bucket}/sync/events?prefix=` — one event
/// per progress change, ending after the terminal state.
pub async fn sync_events(
    State(state): State<AppState>,
    Path((profile, bucket)): Path<(String, String)>,
    Query(q): Query<PrefixQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let key = JobKey::new(profile, bucket, q.prefix());
    let handle = state
        .sync
        .job(&key)
        .ok_or_else(|| AppError::not_found(format!("no active sync for {}", key)))?;

    let events = stream::unfold(
        (handle.subscribe(), false, false),
        |(mut rx, started, done)| async move {
            if done {
                return None;
            }
            if started && rx.changed().await.is_err() {
                return None;
            }
            let progress = rx.borrow_and_update().clone();
            let terminal = progress.status.is_terminal();
            let event = Event::default()
                .event(progress.status.as_str())
                .json_data(&progress);
            Some((event, (rx, true, terminal)))
        },
    );

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
