//! Sync job identity, lifecycle states and progress snapshots.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The (profile, bucket, prefix) tuple identifying one resumable sync unit.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub profile_id: String,
    pub bucket_name: String,
    pub prefix: String,
}

impl JobKey {
    pub fn new(
        profile_id: impl Into<String>,
        bucket_name: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            bucket_name: bucket_name.into(),
            prefix: prefix.into(),
        }
    }

    /// True if `self` covers `other`: same bucket and `other.prefix` lies at or
    /// under `self.prefix`.
    pub fn covers(&self, other: &JobKey) -> bool {
        self.profile_id == other.profile_id
            && self.bucket_name == other.bucket_name
            && other.prefix.starts_with(&self.prefix)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.profile_id, self.bucket_name, self.prefix)
    }
}

/// Lifecycle of a sync job.
///
/// `Idle → Starting → Indexing ⇄ (page loop) → {Completed | Partial | Failed | Cancelled}`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Starting,
    Indexing,
    Completed,
    /// Request budget exhausted; token retained for resumption.
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Indexing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "starting" => Ok(Self::Starting),
            "indexing" => Ok(Self::Indexing),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status `{}`", other)),
        }
    }
}

/// Caller-supplied knobs for one `trigger_sync`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SyncOptions {
    /// Remote list calls allowed for this run (retries included). `None`
    /// falls back to the engine default; `Some(0)` means unlimited.
    pub max_requests: Option<u32>,

    /// Keys per page; `None` uses the engine default.
    pub page_size: Option<i32>,

    /// Invalidate an already complete prefix and index it again.
    #[serde(default)]
    pub force: bool,
}

/// One progress event of a sync job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncProgress {
    pub job_key: JobKey,
    pub objects_indexed: u64,
    pub requests_made: u32,
    /// 0 when unlimited.
    pub max_requests: u32,
    pub is_complete: bool,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Human-readable reason, set on every terminal state.
    pub reason: Option<String>,
}

impl SyncProgress {
    pub fn new(job_key: JobKey, max_requests: u32) -> Self {
        Self {
            job_key,
            objects_indexed: 0,
            requests_made: 0,
            max_requests,
            is_complete: false,
            status: JobStatus::Idle,
            error: None,
            reason: None,
        }
    }
}
