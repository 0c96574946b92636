//! Read-side shapes served to the browsing layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::prefix_status::PrefixStatus;

/// Whether a child entry is a synthesized folder or an object row.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    Folder,
    File,
}

/// A direct child of a prefix with its aggregate statistics.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChildEntry {
    pub kind: ChildKind,

    /// Full key (files) or full child prefix ending in `/` (folders).
    pub key: String,

    /// Display name: the basename, or the folder segment without `/`.
    pub name: String,

    /// Object size for files; recursive total size for folders.
    pub size: i64,

    /// 1 for files; recursive non-folder descendant count for folders.
    pub object_count: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
    pub version_id: Option<String>,
}

/// Recursive count and size of non-folder descendants.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub count: i64,
    pub total_size: i64,
}

/// Result of a browse: children plus completion state of the index.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BrowseResult {
    pub entries: Vec<ChildEntry>,

    /// Status row of the browsed prefix itself, if one exists.
    pub prefix_status: Option<PrefixStatus>,

    /// True when the prefix or one of its ancestors has a complete index.
    pub fully_indexed: bool,
}

/// Aggregate statistics for a prefix plus whether they are final.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PrefixSummary {
    pub profile_id: String,
    pub bucket_name: String,
    pub prefix: String,
    pub aggregate: Aggregate,
    pub fully_indexed: bool,
    pub prefix_status: Option<PrefixStatus>,
}

/// Search filters over indexed, non-folder objects.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SearchQuery {
    /// Case-insensitive substring matched against the basename.
    pub text: String,
    pub prefix: Option<String>,
    pub extension: Option<String>,
    pub limit: Option<i64>,
}
