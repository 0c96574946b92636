//! Defines routes for browsing, syncing and inspecting the bucket index.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Bucket index** (under `/profiles/{profile}/buckets/{bucket}`)
//!   - `GET    /browse?prefix=` — direct children with folder statistics
//!   - `GET    /stats?prefix=` — recursive totals of a prefix
//!   - `GET    /search?q=&prefix=&extension=&limit=` — basename search
//!   - `GET    /versions?key=` — version history of a key
//!   - `GET    /info` — cached bucket settings
//!   - `POST   /invalidate?prefix=` — drop completion of a prefix
//!   - `DELETE /index?prefix=` — purge indexed rows under a prefix
//!
//! - **Sync jobs**
//!   - `POST   /sync` — trigger or attach
//!   - `DELETE /sync?prefix=` — cancel
//!   - `GET    /sync/events?prefix=` — server-sent progress
//!
//! - **Metrics**
//!   - `GET    /metrics/daily?date=`, `GET /metrics/storage?profile=`

use crate::{
    AppState,
    handlers::{
        health_handlers::{healthz, readyz},
        index_handlers::{
            browse, bucket_info, invalidate, list_buckets, prefix_stats, purge, search, versions,
        },
        metrics_handlers::{daily, storage},
        sync_handlers::{cancel_sync, sync_events, trigger_sync},
    },
};
use axum::{
    Router,
    routing::{delete, get, post},
};

/// Build and return the router for every index route.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    let bucket = Router::new()
        .route("/browse", get(browse))
        .route("/stats", get(prefix_stats))
        .route("/search", get(search))
        .route("/versions", get(versions))
        .route("/info", get(bucket_info))
        .route("/invalidate", post(invalidate))
        .route("/index", delete(purge))
        .route("/sync", post(trigger_sync).delete(cancel_sync))
        .route("/sync/events", get(sync_events));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/profiles/{profile}/buckets", get(list_buckets))
        .nest("/profiles/{profile}/buckets/{bucket}", bucket)
        .route("/metrics/daily", get(daily))
        .route("/metrics/storage", get(storage))
}
