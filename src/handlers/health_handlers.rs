//! Liveness and readiness of the index.
//!
//! - GET /healthz  -> process is up
//! - GET /readyz   -> the database is migrated to this build's schema and the
//!   storage directory accepts writes

use crate::{AppState, db};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Cheap and I/O free.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// `GET /readyz`
///
/// 200 once the schema is current and the storage directory is writable,
/// 503 otherwise. The body reports both checks and the number of running
/// sync jobs.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let schema = db::schema_version(&state.db)
        .await
        .map_err(|e| e.to_string());
    let storage = probe_storage_dir(&state.storage_dir).await;
    let report = readiness(schema, storage, state.sync.active_jobs().len());

    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Write, read back and remove a scratch file under `dir`.
async fn probe_storage_dir(dir: &Path) -> Result<(), String> {
    let path = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&path, b"readyz")
        .await
        .map_err(|e| format!("write failed: {}", e))?;
    let read = fs::read(&path).await;
    let _ = fs::remove_file(&path).await;
    match read {
        Ok(bytes) if bytes == b"readyz" => Ok(()),
        Ok(_) => Err("content mismatch".into()),
        Err(e) => Err(format!("read failed: {}", e)),
    }
}

fn readiness(
    schema: Result<i64, String>,
    storage: Result<(), String>,
    active_syncs: usize,
) -> ReadyResponse {
    let expected = db::latest_schema_version();
    let (applied, schema_error) = match schema {
        Ok(v) if v == expected => (Some(v), None),
        Ok(v) => (
            Some(v),
            Some(format!("schema at version {}, expected {}", v, expected)),
        ),
        Err(e) => (None, Some(e)),
    };
    let storage_error = storage.err();

    ReadyResponse {
        ready: schema_error.is_none() && storage_error.is_none(),
        schema: SchemaCheck {
            applied,
            expected,
            error: schema_error,
        },
        storage: StorageCheck {
            writable: storage_error.is_none(),
            error: storage_error,
        },
        active_syncs,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize, Debug)]
struct ReadyResponse {
    ready: bool,
    schema: SchemaCheck,
    storage: StorageCheck,
    active_syncs: usize,
}

#[derive(Serialize, Debug)]
struct SchemaCheck {
    applied: Option<i64>,
    expected: i64,
    error: Option<String>,
}

#[derive(Serialize, Debug)]
struct StorageCheck {
    writable: bool,
    error: Option<String>,
}
