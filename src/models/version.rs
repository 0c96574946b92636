//! Represents one entry of an object's version history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::object::ObjectRecord;

/// A version as reported by a versioned listing.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VersionRecord {
    /// Object key the version belongs to.
    pub key: String,

    /// Remote version identifier.
    pub version_id: String,

    /// Whether the remote reports this as the current version.
    pub is_latest: bool,

    /// Delete markers carry no body; size and folder semantics do not apply.
    pub is_delete_marker: bool,

    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
    pub owner: Option<String>,
    pub checksum_algorithm: Option<String>,
    pub restore_status: Option<String>,
    pub content_type: Option<String>,
    pub encryption: Option<String>,
}

impl VersionRecord {
    /// The object-view record for a live (non-marker) version.
    pub fn to_object_record(&self) -> ObjectRecord {
        ObjectRecord {
            key: self.key.clone(),
            version_id: Some(self.version_id.clone()),
            size: self.size,
            last_modified: self.last_modified,
            etag: self.etag.clone(),
            storage_class: self.storage_class.clone(),
            owner: self.owner.clone(),
            checksum_algorithm: self.checksum_algorithm.clone(),
            restore_status: self.restore_status.clone(),
            content_type: self.content_type.clone(),
            encryption: self.encryption.clone(),
        }
    }
}

/// A persisted row of the `object_versions` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectVersion {
    pub id: i64,
    pub profile_id: String,
    pub bucket_name: String,
    pub key: String,
    pub version_id: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub storage_class: String,
    pub owner: Option<String>,
    pub checksum_algorithm: Option<String>,
    pub restore_status: Option<String>,
    pub content_type: Option<String>,
    pub encryption: Option<String>,
    pub parent_prefix: String,
    pub basename: String,
    pub extension: Option<String>,
    pub depth: i64,
    pub is_latest: bool,
    pub is_delete_marker: bool,
    pub indexed_at: DateTime<Utc>,
}
