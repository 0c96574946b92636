//! Request metrics, cache accounting and their daily rollups.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Counter family a request is rolled up under.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestCategory {
    List,
    Get,
    Put,
    Delete,
    Other,
}

impl RequestCategory {
    /// Classify a remote operation name (`ListObjectsV2`, `GetObject`, ...).
    pub fn from_operation(operation: &str) -> Self {
        let op = operation.to_ascii_lowercase();
        if op.starts_with("list") {
            Self::List
        } else if op.starts_with("get") || op.starts_with("head") {
            Self::Get
        } else if op.starts_with("put") || op.starts_with("copy") || op.starts_with("upload") {
            Self::Put
        } else if op.starts_with("delete") {
            Self::Delete
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Get => "get",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

/// One observed remote request.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MetricsEvent {
    /// Opaque id; replaying an event with the same id is a no-op.
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub operation: String,
    pub category: RequestCategory,
    pub profile_id: Option<String>,
    pub bucket_name: Option<String>,
    pub duration_ms: i64,
    /// Bytes transferred; counted as downloaded for gets, uploaded for puts.
    pub bytes: i64,
    pub success: bool,
    pub error: Option<String>,
}

impl MetricsEvent {
    pub fn new(operation: impl Into<String>, duration_ms: i64, success: bool) -> Self {
        let operation = operation.into();
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            category: RequestCategory::from_operation(&operation),
            operation,
            profile_id: None,
            bucket_name: None,
            duration_ms,
            bytes: 0,
            success,
            error: None,
        }
    }

    pub fn with_bucket(mut self, profile_id: &str, bucket_name: &str) -> Self {
        self.profile_id = Some(profile_id.to_string());
        self.bucket_name = Some(bucket_name.to_string());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn stat_date(&self) -> NaiveDate {
        self.recorded_at.date_naive()
    }
}

/// One cache decision: served from the index (hit) or needed the remote (miss).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CacheEvent {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub operation: String,
    pub profile_id: Option<String>,
    pub bucket_name: Option<String>,
    pub hit: bool,
    /// Remote requests avoided by a hit.
    pub saved_requests: i64,
}

impl CacheEvent {
    pub fn new(operation: impl Into<String>, hit: bool, saved_requests: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            operation: operation.into(),
            profile_id: None,
            bucket_name: None,
            hit,
            saved_requests: if hit { saved_requests.max(0) } else { 0 },
        }
    }

    pub fn with_bucket(mut self, profile_id: &str, bucket_name: &str) -> Self {
        self.profile_id = Some(profile_id.to_string());
        self.bucket_name = Some(bucket_name.to_string());
        self
    }

    pub fn stat_date(&self) -> NaiveDate {
        self.recorded_at.date_naive()
    }
}

/// A persisted row of `metrics_daily_stats`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, Default, PartialEq)]
pub struct DailyStats {
    pub stat_date: String,
    pub total_requests: i64,
    pub list_requests: i64,
    pub get_requests: i64,
    pub put_requests: i64,
    pub delete_requests: i64,
    pub other_requests: i64,
    pub error_count: i64,
    pub bytes_downloaded: i64,
    pub bytes_uploaded: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub cache_hits: i64,
    pub cache_misses: i64,
    pub cache_saved_requests: i64,
}

impl DailyStats {
    /// Hit rate in percent, derived from the stored counters.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64 * 100.0
        }
    }
}

/// Row of the `v_bucket_stats` view.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BucketStats {
    pub profile_id: String,
    pub bucket_name: String,
    pub object_count: i64,
    pub total_size: i64,
    pub last_modified: Option<String>,
}

/// Row of the `v_storage_stats` view.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StorageStats {
    pub profile_id: String,
    pub storage_class: String,
    pub object_count: i64,
    pub total_size: i64,
}
