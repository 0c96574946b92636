//! Per-prefix indexing progress and completion state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::job::JobStatus;

/// A persisted row of the `prefix_status` table.
///
/// `continuation_token` is the sole resumption handle: it always reflects a
/// fully committed prefix of the remote listing.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PrefixStatus {
    #[serde(skip)]
    pub id: i64,
    pub profile_id: String,
    pub bucket_name: String,
    pub prefix: String,

    /// Set only when a pass ends on a terminal, non-truncated page.
    pub is_complete: bool,
    pub objects_count: i64,
    pub total_size: i64,
    pub continuation_token: Option<String>,
    pub last_indexed_key: Option<String>,
    pub requests_made: i64,

    /// Millisecond epoch of the current (or last) pass.
    pub pass_started_ms: Option<i64>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_completed_at: Option<DateTime<Utc>>,
    pub last_status: String,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,

    /// The completing pass listed one level only: rows under the common
    /// prefixes it returned were left to their own jobs.
    pub is_delimited: bool,
}

impl PrefixStatus {
    /// Parsed `last_status`; unknown values read as idle.
    pub fn status(&self) -> JobStatus {
        self.last_status.parse().unwrap_or(JobStatus::Idle)
    }

    /// Whether a pass was interrupted and can pick up where it stopped.
    pub fn is_resumable(&self) -> bool {
        !self.is_complete && self.continuation_token.is_some()
    }

    /// Whether completion vouches for every key below the prefix, not just
    /// its direct children.
    pub fn covers_subtree(&self) -> bool {
        self.is_complete && !self.is_delimited
    }
}

/// Final counts written when a prefix is marked complete.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefixStats {
    pub objects_count: i64,
    pub total_size: i64,
}
