//! Represents an indexed object mirrored from a remote bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Attributes of one remote object as reported by a listing page.
///
/// This is the write-side shape: identity is completed by the profile and
/// bucket the batch is applied to, and derived fields are computed from `key`
/// at write time.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectRecord {
    /// Full object key (path-like identifier within the bucket).
    pub key: String,

    /// Version identifier, present only for versioned listings.
    pub version_id: Option<String>,

    /// Size in bytes.
    pub size: i64,

    /// Timestamp when the object was last modified remotely.
    pub last_modified: Option<DateTime<Utc>>,

    /// ETag reported by the remote store.
    pub etag: Option<String>,

    /// Storage class (e.g., STANDARD, GLACIER). Defaults to STANDARD.
    pub storage_class: Option<String>,

    /// Owner display name or id.
    pub owner: Option<String>,

    /// Checksum algorithm used by the remote (e.g., CRC32C, SHA256).
    pub checksum_algorithm: Option<String>,

    /// Restore status for archived storage classes.
    pub restore_status: Option<String>,

    /// Content type (MIME type), when the listing carries it.
    pub content_type: Option<String>,

    /// Server-side encryption description.
    pub encryption: Option<String>,
}

impl ObjectRecord {
    /// Create a plain record with a key and size; everything else unset.
    pub fn new(key: impl Into<String>, size: i64) -> Self {
        Self {
            key: key.into(),
            size,
            ..Self::default()
        }
    }

    /// Storage class with the remote default applied.
    pub fn storage_class_or_default(&self) -> &str {
        self.storage_class.as_deref().unwrap_or(DEFAULT_STORAGE_CLASS)
    }
}

/// Storage class assumed when the remote omits one.
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// Path-derived fields of a key. Always a pure function of the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyParts {
    /// Everything up to and including the last `/` before the basename.
    pub parent_prefix: String,

    /// Last path segment, without a trailing `/` for folders.
    pub basename: String,

    /// Lowercased extension of the basename, if any.
    pub extension: Option<String>,

    /// Number of `/` separators in `parent_prefix`.
    pub depth: i64,

    /// Whether the key is a folder marker (ends with `/`).
    pub is_folder: bool,
}

impl KeyParts {
    /// Derive the path fields of `key`.
    ///
    /// `photos/2025/img.JPG` → parent `photos/2025/`, basename `img.JPG`,
    /// extension `jpg`, depth 2. `photos/2025/` → parent `photos/`, basename
    /// `2025`, folder, depth 1.
    pub fn derive(key: &str) -> Self {
        let is_folder = key.ends_with('/');
        let trimmed = if is_folder {
            &key[..key.len() - 1]
        } else {
            key
        };

        let (parent_prefix, basename) = match trimmed.rfind('/') {
            Some(pos) => (&trimmed[..=pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };

        let extension = if is_folder {
            None
        } else {
            basename
                .rfind('.')
                .filter(|&pos| pos > 0 && pos + 1 < basename.len())
                .map(|pos| basename[pos + 1..].to_ascii_lowercase())
        };

        Self {
            parent_prefix: parent_prefix.to_string(),
            basename: basename.to_string(),
            extension,
            depth: parent_prefix.matches('/').count() as i64,
            is_folder,
        }
    }
}

/// A persisted row of the `objects` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct IndexedObject {
    /// Internal row id.
    pub id: i64,
    pub profile_id: String,
    pub bucket_name: String,
    pub key: String,
    pub version_id: Option<String>,
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
    pub is_folder: bool,

    /// Millisecond epoch of the sync pass that last saw this row.
    pub indexed_pass: i64,
    pub indexed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_nested_file() {
        let parts = KeyParts::derive("photos/2025/img.JPG");
        assert_eq!(parts.parent_prefix, "photos/2025/");
        assert_eq!(parts.basename, "img.JPG");
        assert_eq!(parts.extension.as_deref(), Some("jpg"));
        assert_eq!(parts.depth, 2);
        assert!(!parts.is_folder);
    }

    #[test]
    fn derives_root_file() {
        let parts = KeyParts::derive("README");
        assert_eq!(parts.parent_prefix, "");
        assert_eq!(parts.basename, "README");
        assert_eq!(parts.extension, None);
        assert_eq!(parts.depth, 0);
    }

    #[test]
    fn derives_folder_marker() {
        let parts = KeyParts::derive("photos/2025/");
        assert_eq!(parts.parent_prefix, "photos/");
        assert_eq!(parts.basename, "2025");
        assert_eq!(parts.extension, None);
        assert_eq!(parts.depth, 1);
        assert!(parts.is_folder);
    }

    #[test]
    fn hidden_files_have_no_extension() {
        assert_eq!(KeyParts::derive("a/.env").extension, None);
        assert_eq!(KeyParts::derive("a/trailing.").extension, None);
        assert_eq!(
            KeyParts::derive("a/archive.tar.gz").extension.as_deref(),
            Some("gz")
        );
    }
}
