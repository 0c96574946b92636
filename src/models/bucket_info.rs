//! Cached bucket-level settings and first-index progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A persisted row of the `bucket_info` table.
///
/// ACL and encryption fields are time-boxed caches of remote settings, not
/// authoritative values.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BucketInfo {
    #[serde(skip)]
    pub id: i64,
    pub profile_id: String,
    pub bucket_name: String,
    pub region: Option<String>,

    /// Remote versioning status (`Enabled`, `Suspended`), `None` if never enabled.
    pub versioning_status: Option<String>,
    pub encryption_algorithm: Option<String>,
    pub encryption_kms_key_id: Option<String>,

    /// Serialized [`BucketAcl`].
    pub acl_json: Option<String>,
    pub acl_cached_at: Option<DateTime<Utc>>,
    pub settings_cached_at: Option<DateTime<Utc>>,
    pub first_index_objects: i64,
    pub first_index_requests: i64,
    pub first_index_started_at: Option<DateTime<Utc>>,
    pub first_index_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BucketInfo {
    pub fn versioning_enabled(&self) -> bool {
        self.versioning_status.as_deref() == Some("Enabled")
    }

    pub fn acl(&self) -> Option<BucketAcl> {
        self.acl_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Whether the cached settings are older than `ttl` (or were never fetched).
    pub fn settings_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        match self.settings_cached_at {
            Some(at) => now - at >= ttl,
            None => true,
        }
    }
}

/// Remote versioning configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketVersioning {
    pub status: Option<String>,
    pub mfa_delete: Option<String>,
}

/// Default server-side encryption configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketEncryption {
    pub algorithm: Option<String>,
    pub kms_key_id: Option<String>,
}

/// Snapshot of a bucket ACL.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketAcl {
    pub owner: Option<String>,
    pub grants: Vec<AclGrant>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AclGrant {
    pub grantee: String,
    pub permission: String,
}

/// Remote settings fetched in one refresh; any part may be missing when the
/// corresponding call failed.
#[derive(Clone, Debug, Default)]
pub struct BucketSettings {
    pub region: Option<String>,
    pub versioning: Option<BucketVersioning>,
    pub encryption: Option<BucketEncryption>,
    pub acl: Option<BucketAcl>,
}
