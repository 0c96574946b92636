//! Local, persistent index of remote object-storage buckets.
//!
//! Listings are paged from the remote into SQLite by resumable sync jobs, so
//! browsing, aggregate statistics and search are served locally instead of
//! issuing fresh remote requests.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod remote;
pub mod routes;
pub mod services;

use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

use crate::{
    config::AppConfig,
    remote::RemoteProvider,
    services::{
        entity_store::EntityStore, job_registry::JobRegistry, metrics_recorder::MetricsRecorder,
        query_facade::QueryFacade, sync_engine::SyncEngine, version_ledger::VersionLedger,
    },
};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,

    /// Root of the filesystem remote; probed by the readiness check.
    pub storage_dir: PathBuf,
    pub store: EntityStore,
    pub ledger: VersionLedger,
    pub metrics: MetricsRecorder,
    pub sync: SyncEngine,
    pub query: QueryFacade,

    /// Trigger a background sync when a browse misses the index.
    pub auto_sync: bool,
}

impl AppState {
    /// Wire every service around one pool. Must run inside a Tokio runtime,
    /// which hosts the metrics writer.
    pub fn new(db: Arc<SqlitePool>, cfg: &AppConfig, remote: Arc<dyn RemoteProvider>) -> Self {
        let registry = JobRegistry::new();
        let store = EntityStore::new(db.clone(), registry);
        let ledger = VersionLedger::new(store.clone());
        let metrics = MetricsRecorder::spawn(db.clone());
        let sync = SyncEngine::new(store.clone(), remote, metrics.clone(), cfg.sync_settings());
        let query = QueryFacade::new(store.clone(), ledger.clone(), metrics.clone());
        Self {
            db,
            storage_dir: PathBuf::from(&cfg.storage_dir),
            store,
            ledger,
            metrics,
            sync,
            query,
            auto_sync: cfg.auto_sync,
        }
    }
}
