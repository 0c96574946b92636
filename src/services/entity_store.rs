//! src/services/entity_store.rs
//!
//! EntityStore — the persistent repository of indexed objects, prefix status
//! and bucket metadata, backed by SQLite. It owns every invariant of the
//! index: unique identities, derived path fields, and the completion state of
//! each prefix. Every write is a single transaction, so a failed batch never
//! leaves partially applied rows behind.

use crate::{
    models::{
        browse::{Aggregate, ChildEntry, ChildKind, SearchQuery},
        bucket_info::{BucketInfo, BucketSettings},
        job::{JobKey, JobStatus},
        metrics::{BucketStats, StorageStats},
        object::{IndexedObject, KeyParts, ObjectRecord},
        prefix_status::{PrefixStats, PrefixStatus},
    },
    remote::ListPage,
    services::job_registry::JobRegistry,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A write would break a uniqueness or consistency rule. The enclosing
    /// transaction has been rolled back; re-sync the affected prefix.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Summary of one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertResult {
    /// Rows inserted or replaced.
    pub upserted: u64,
    /// Rows removed because the key switched between versioned and unversioned.
    pub superseded: u64,
    /// Non-folder records in the batch.
    pub objects: u64,
    /// Sum of non-folder sizes in the batch.
    pub bytes: i64,
}

/// How a sync pass begins.
#[derive(Debug, Clone)]
pub(crate) enum PassStart {
    /// The prefix is complete and no refresh was forced.
    AlreadyComplete(PrefixStatus),
    Ready(PassState),
}

/// Resumption state loaded (or reset) at the start of a pass.
#[derive(Debug, Clone)]
pub(crate) struct PassState {
    /// Millisecond epoch identifying the pass; rows it touches carry it.
    pub pass_ms: i64,
    pub token: Option<String>,
    pub resumed: bool,
    pub objects_count: i64,
    pub requests_made: i64,
}

/// Result of committing one page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageCommit {
    pub objects_count: i64,
    pub total_size: i64,
    pub is_complete: bool,
    pub removed: u64,
}

const MAX_KEY_LEN: usize = 1024;
const MAX_SEARCH_LIMIT: i64 = 1000;

const OBJECT_COLUMNS: &str = "id, profile_id, bucket_name, key, version_id, size, last_modified, \
     etag, storage_class, owner, checksum_algorithm, restore_status, content_type, encryption, \
     parent_prefix, basename, extension, depth, is_folder, indexed_pass, indexed_at";

const PREFIX_STATUS_COLUMNS: &str = "id, profile_id, bucket_name, prefix, is_complete, \
     objects_count, total_size, continuation_token, last_indexed_key, requests_made, \
     pass_started_ms, sync_started_at, sync_completed_at, last_status, last_error, updated_at, \
     is_delimited";

const BUCKET_INFO_COLUMNS: &str = "id, profile_id, bucket_name, region, versioning_status, \
     encryption_algorithm, encryption_kms_key_id, acl_json, acl_cached_at, settings_cached_at, \
     first_index_objects, first_index_requests, first_index_started_at, \
     first_index_completed_at, updated_at";

/// Per-bucket write serialization; unrelated buckets never wait on each other.
#[derive(Default)]
struct ScopeLocks {
    inner: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl ScopeLocks {
    fn scope(&self, profile: &str, bucket: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry((profile.to_string(), bucket.to_string()))
            .or_default()
            .clone()
    }
}

#[derive(FromRow)]
struct ChildFileRow {
    key: String,
    version_id: Option<String>,
    size: i64,
    last_modified: Option<DateTime<Utc>>,
    storage_class: String,
    basename: String,
    is_folder: bool,
}

#[derive(FromRow)]
struct FolderGroupRow {
    child_prefix: String,
    total_size: i64,
    object_count: i64,
    last_modified: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct AggregateRow {
    count: i64,
    total_size: i64,
}

#[derive(Clone)]
pub struct EntityStore {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,

    /// Active jobs; consulted before any write to a prefix-status row from
    /// outside a job.
    registry: Arc<JobRegistry>,

    locks: Arc<ScopeLocks>,
}

impl EntityStore {
    pub fn new(db: Arc<SqlitePool>, registry: Arc<JobRegistry>) -> Self {
        Self {
            db,
            registry,
            locks: Arc::new(ScopeLocks::default()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Write lock of one (profile, bucket) scope.
    pub(crate) fn scope_lock(&self, profile: &str, bucket: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.scope(profile, bucket)
    }

    /// Insert or replace a batch of records, all-or-nothing.
    ///
    /// Derived fields are computed from each key. A batch naming the same
    /// identity twice, or carrying an invalid record, fails as a whole with
    /// `InvariantViolation`.
    pub async fn upsert_objects(
        &self,
        profile: &str,
        bucket: &str,
        batch: &[ObjectRecord],
    ) -> StoreResult<UpsertResult> {
        ensure_unique_batch(batch)?;
        let lock = self.locks.scope(profile, bucket);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let pass_ms = now.timestamp_millis();
        let mut tx = self.db.begin().await?;
        let result = upsert_batch_tx(&mut tx, profile, bucket, batch, pass_ms, now).await?;
        tx.commit().await?;

        debug!(
            "upserted {} rows into {}/{} ({} superseded)",
            result.upserted, profile, bucket, result.superseded
        );
        Ok(result)
    }

    /// All rows stored for `key` (one unversioned row or the live versioned set).
    pub async fn get_object(
        &self,
        profile: &str,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Vec<IndexedObject>> {
        let sql = format!(
            "SELECT {} FROM objects WHERE profile_id = ? AND bucket_name = ? AND key = ? \
             ORDER BY version_id",
            OBJECT_COLUMNS
        );
        Ok(sqlx::query_as::<_, IndexedObject>(&sql)
            .bind(profile)
            .bind(bucket)
            .bind(key)
            .fetch_all(&*self.db)
            .await?)
    }

    /// Direct children of `prefix`: synthesized folders first, then objects,
    /// each in key order. Folder statistics are recursive.
    pub async fn get_children(
        &self,
        profile: &str,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Vec<ChildEntry>> {
        let prefix = normalize_prefix(prefix);
        let prefix_len = prefix.chars().count() as i64;

        let direct = sqlx::query_as::<_, ChildFileRow>(
            "SELECT key, version_id, size, last_modified, storage_class, basename, is_folder
             FROM objects
             WHERE profile_id = ? AND bucket_name = ? AND parent_prefix = ?
             ORDER BY key, version_id",
        )
        .bind(profile)
        .bind(bucket)
        .bind(&prefix)
        .fetch_all(&*self.db)
        .await?;

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT substr(parent_prefix, 1, ");
        builder.push_bind(prefix_len);
        builder.push(" + instr(substr(parent_prefix, ");
        builder.push_bind(prefix_len);
        builder.push(
            " + 1), '/')) AS child_prefix, \
             COALESCE(SUM(CASE WHEN is_folder = 0 THEN size ELSE 0 END), 0) AS total_size, \
             COALESCE(SUM(CASE WHEN is_folder = 0 THEN 1 ELSE 0 END), 0) AS object_count, \
             MAX(last_modified) AS last_modified \
             FROM objects WHERE profile_id = ",
        );
        builder.push_bind(profile);
        builder.push(" AND bucket_name = ");
        builder.push_bind(bucket);
        builder.push(" AND parent_prefix > ");
        builder.push_bind(&prefix);
        if let Some(upper) = prefix_upper_bound(&prefix) {
            builder.push(" AND parent_prefix < ");
            builder.push_bind(upper);
        }
        builder.push(" GROUP BY child_prefix");
        let groups: Vec<FolderGroupRow> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut folders: BTreeMap<String, ChildEntry> = BTreeMap::new();
        for group in groups {
            folders.insert(
                group.child_prefix.clone(),
                ChildEntry {
                    kind: ChildKind::Folder,
                    name: folder_name(&group.child_prefix),
                    key: group.child_prefix,
                    size: group.total_size,
                    object_count: group.object_count,
                    last_modified: group.last_modified,
                    storage_class: None,
                    version_id: None,
                },
            );
        }

        let mut files = Vec::new();
        for row in direct {
            if row.is_folder {
                // Explicit folder marker: show it even when nothing lives below.
                folders.entry(row.key.clone()).or_insert_with(|| ChildEntry {
                    kind: ChildKind::Folder,
                    name: row.basename.clone(),
                    key: row.key.clone(),
                    size: 0,
                    object_count: 0,
                    last_modified: row.last_modified,
                    storage_class: None,
                    version_id: None,
                });
                continue;
            }
            files.push(ChildEntry {
                kind: ChildKind::File,
                name: row.basename,
                key: row.key,
                size: row.size,
                object_count: 1,
                last_modified: row.last_modified,
                storage_class: Some(row.storage_class),
                version_id: row.version_id,
            });
        }

        let mut entries: Vec<ChildEntry> = folders.into_values().collect();
        entries.extend(files);
        Ok(entries)
    }

    /// Recursive count and total size of non-folder objects under `prefix`.
    ///
    /// Folder-shaped prefixes are answered from the `parent_prefix` index;
    /// any other prefix falls back to a key range.
    pub async fn aggregate(
        &self,
        profile: &str,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Aggregate> {
        let mut conn = self.db.acquire().await?;
        aggregate_conn(&mut conn, profile, bucket, prefix).await
    }

    /// Case-insensitive basename search over non-folder objects.
    pub async fn search(
        &self,
        profile: &str,
        bucket: &str,
        query: &SearchQuery,
    ) -> StoreResult<Vec<IndexedObject>> {
        let limit = query.limit.unwrap_or(100).clamp(1, MAX_SEARCH_LIMIT);

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM objects WHERE profile_id = ",
            OBJECT_COLUMNS
        ));
        builder.push_bind(profile);
        builder.push(" AND bucket_name = ");
        builder.push_bind(bucket);
        builder.push(" AND is_folder = 0");

        if !query.text.is_empty() {
            builder.push(" AND lower(basename) LIKE ");
            builder.push_bind(format!("%{}%", escape_like(&query.text.to_lowercase())));
            builder.push(" ESCAPE '\\'");
        }
        if let Some(prefix) = query.prefix.as_deref().filter(|p| !p.is_empty()) {
            push_key_range(&mut builder, "key", prefix);
        }
        if let Some(ext) = query.extension.as_deref() {
            builder.push(" AND extension = ");
            builder.push_bind(ext.trim_start_matches('.').to_ascii_lowercase());
        }

        builder.push(" ORDER BY key ASC, version_id ASC LIMIT ");
        builder.push_bind(limit);

        Ok(builder.build_query_as().fetch_all(&*self.db).await?)
    }

    /// Status row of one prefix, if it has ever been indexed.
    pub async fn prefix_status(
        &self,
        profile: &str,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Option<PrefixStatus>> {
        let sql = format!(
            "SELECT {} FROM prefix_status WHERE profile_id = ? AND bucket_name = ? AND prefix = ?",
            PREFIX_STATUS_COLUMNS
        );
        Ok(sqlx::query_as::<_, PrefixStatus>(&sql)
            .bind(profile)
            .bind(bucket)
            .bind(prefix)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Status rows of `prefix` and each of its ancestors, root first.
    pub async fn prefix_lineage(
        &self,
        profile: &str,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Vec<PrefixStatus>> {
        let lineage = ancestor_prefixes(prefix);
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM prefix_status WHERE profile_id = ",
            PREFIX_STATUS_COLUMNS
        ));
        builder.push_bind(profile);
        builder.push(" AND bucket_name = ");
        builder.push_bind(bucket);
        builder.push(" AND prefix IN (");
        let mut separated = builder.separated(", ");
        for p in &lineage {
            separated.push_bind(p.clone());
        }
        builder.push(") ORDER BY length(prefix)");
        Ok(builder.build_query_as().fetch_all(&*self.db).await?)
    }

    /// Mark a prefix fully indexed with final counts.
    ///
    /// Fails with `InvariantViolation` while a sync for the same key is in
    /// flight; a running job finalizes its own prefix on its terminal page.
    pub async fn mark_prefix_complete(
        &self,
        profile: &str,
        bucket: &str,
        prefix: &str,
        stats: PrefixStats,
    ) -> StoreResult<PrefixStatus> {
        let key = JobKey::new(profile, bucket, prefix);
        if self.registry.is_active(&key) {
            return Err(StoreError::InvariantViolation(format!(
                "cannot mark {} complete while its sync is in flight",
                key
            )));
        }

        let lock = self.locks.scope(profile, bucket);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        ensure_status_row(&mut tx, &key, now).await?;
        sqlx::query(
            "UPDATE prefix_status
             SET is_complete = 1, is_delimited = 0, objects_count = ?, total_size = ?,
                 continuation_token = NULL, sync_completed_at = ?, last_status = 'completed',
                 last_error = NULL, updated_at = ?
             WHERE profile_id = ? AND bucket_name = ? AND prefix = ?",
        )
        .bind(stats.objects_count)
        .bind(stats.total_size)
        .bind(now)
        .bind(now)
        .bind(profile)
        .bind(bucket)
        .bind(prefix)
        .execute(&mut *tx)
        .await?;
        let status = fetch_status(&mut tx, &key).await?;
        tx.commit().await?;
        Ok(status)
    }

    /// Clear completion and the resumption token of a prefix after drift or a
    /// manual refresh. Rows stay visible, marked stale, until re-synced.
    ///
    /// Ancestors lose their completion flag as well, since their completeness
    /// covered this prefix.
    pub async fn invalidate_prefix(
        &self,
        profile: &str,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<()> {
        let key = JobKey::new(profile, bucket, prefix);
        if self.registry.is_covered(&key) {
            return Err(StoreError::InvariantViolation(format!(
                "cannot invalidate {} while a covering sync is in flight",
                key
            )));
        }

        let lock = self.locks.scope(profile, bucket);
        let _guard = lock.lock().await;
        let mut tx = self.db.begin().await?;
        invalidate_tx(&mut tx, &key, Utc::now()).await?;
        tx.commit().await?;
        debug!("invalidated {}", key);
        Ok(())
    }

    /// Delete every object, version and status row at or under `prefix`.
    pub async fn purge_prefix(&self, profile: &str, bucket: &str, prefix: &str) -> StoreResult<u64> {
        let key = JobKey::new(profile, bucket, prefix);
        if self.registry.overlaps(&key) {
            return Err(StoreError::InvariantViolation(format!(
                "cannot purge {} while an overlapping sync is in flight",
                key
            )));
        }

        let lock = self.locks.scope(profile, bucket);
        let _guard = lock.lock().await;
        let mut tx = self.db.begin().await?;

        let mut removed = 0;
        for (table, column) in [
            ("objects", "key"),
            ("object_versions", "key"),
            ("prefix_status", "prefix"),
        ] {
            let mut builder =
                QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE profile_id = ", table));
            builder.push_bind(profile);
            builder.push(" AND bucket_name = ");
            builder.push_bind(bucket);
            push_key_range(&mut builder, column, prefix);
            let result = builder.build().execute(&mut *tx).await?;
            if table == "objects" {
                removed = result.rows_affected();
            }
        }
        invalidate_ancestors(&mut tx, &key, Utc::now()).await?;
        tx.commit().await?;
        debug!("purged {} objects under {}", removed, key);
        Ok(removed)
    }

    /// Cached settings of a bucket, if it has been accessed before.
    pub async fn bucket_info(&self, profile: &str, bucket: &str) -> StoreResult<Option<BucketInfo>> {
        let sql = format!(
            "SELECT {} FROM bucket_info WHERE profile_id = ? AND bucket_name = ?",
            BUCKET_INFO_COLUMNS
        );
        Ok(sqlx::query_as::<_, BucketInfo>(&sql)
            .bind(profile)
            .bind(bucket)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Upsert freshly fetched bucket settings. Parts missing from `settings`
    /// keep their previously cached values.
    pub async fn store_bucket_settings(
        &self,
        profile: &str,
        bucket: &str,
        settings: &BucketSettings,
    ) -> StoreResult<BucketInfo> {
        let now = Utc::now();
        let acl_json = settings
            .acl
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let acl_cached_at = acl_json.as_ref().map(|_| now);
        let fetched_any = settings.region.is_some()
            || settings.versioning.is_some()
            || settings.encryption.is_some()
            || settings.acl.is_some();

        let lock = self.locks.scope(profile, bucket);
        let _guard = lock.lock().await;
        let mut tx = self.db.begin().await?;
        ensure_bucket_row(&mut tx, profile, bucket, now).await?;
        sqlx::query(
            "UPDATE bucket_info SET
                region = COALESCE(?, region),
                versioning_status = CASE WHEN ? THEN ? ELSE versioning_status END,
                encryption_algorithm = CASE WHEN ? THEN ? ELSE encryption_algorithm END,
                encryption_kms_key_id = CASE WHEN ? THEN ? ELSE encryption_kms_key_id END,
                acl_json = COALESCE(?, acl_json),
                acl_cached_at = COALESCE(?, acl_cached_at),
                settings_cached_at = CASE WHEN ? THEN ? ELSE settings_cached_at END,
                updated_at = ?
             WHERE profile_id = ? AND bucket_name = ?",
        )
        .bind(settings.region.as_deref())
        .bind(settings.versioning.is_some())
        .bind(settings.versioning.as_ref().and_then(|v| v.status.clone()))
        .bind(settings.encryption.is_some())
        .bind(settings.encryption.as_ref().and_then(|e| e.algorithm.clone()))
        .bind(settings.encryption.is_some())
        .bind(settings.encryption.as_ref().and_then(|e| e.kms_key_id.clone()))
        .bind(acl_json)
        .bind(acl_cached_at)
        .bind(fetched_any)
        .bind(now)
        .bind(now)
        .bind(profile)
        .bind(bucket)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.bucket_info(profile, bucket)
            .await?
            .ok_or_else(|| StoreError::Sqlx(sqlx::Error::RowNotFound))
    }

    /// Per-bucket totals from the `v_bucket_stats` view.
    pub async fn bucket_stats(&self, profile: &str) -> StoreResult<Vec<BucketStats>> {
        Ok(sqlx::query_as::<_, BucketStats>(
            "SELECT profile_id, bucket_name, object_count, total_size, last_modified
             FROM v_bucket_stats WHERE profile_id = ? ORDER BY bucket_name",
        )
        .bind(profile)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Per-storage-class totals from the `v_storage_stats` view.
    pub async fn storage_stats(&self, profile: &str) -> StoreResult<Vec<StorageStats>> {
        Ok(sqlx::query_as::<_, StorageStats>(
            "SELECT profile_id, storage_class, object_count, total_size
             FROM v_storage_stats WHERE profile_id = ? ORDER BY storage_class",
        )
        .bind(profile)
        .fetch_all(&*self.db)
        .await?)
    }

    // --- Sync engine path ---

    /// Load or reset the resumption state of `key` at job start.
    ///
    /// A stored continuation token resumes the interrupted pass with its
    /// original pass id and counts. Without one a fresh pass starts; `force`
    /// discards both completion and token first.
    pub(crate) async fn begin_pass(&self, key: &JobKey, force: bool) -> StoreResult<PassStart> {
        let lock = self.locks.scope(&key.profile_id, &key.bucket_name);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        ensure_status_row(&mut tx, key, now).await?;
        ensure_bucket_row(&mut tx, &key.profile_id, &key.bucket_name, now).await?;
        if force {
            invalidate_tx(&mut tx, key, now).await?;
        }

        let status = fetch_status(&mut tx, key).await?;
        if status.is_complete && status.continuation_token.is_none() {
            tx.commit().await?;
            return Ok(PassStart::AlreadyComplete(status));
        }

        if let (Some(token), Some(pass_ms)) = (&status.continuation_token, status.pass_started_ms) {
            sqlx::query(
                "UPDATE prefix_status SET last_status = 'starting', last_error = NULL, updated_at = ?
                 WHERE id = ?",
            )
            .bind(now)
            .bind(status.id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(PassStart::Ready(PassState {
                pass_ms,
                token: Some(token.clone()),
                resumed: true,
                objects_count: status.objects_count,
                requests_made: status.requests_made,
            }));
        }

        // Pass ids must increase even if the clock does not.
        let pass_ms = now
            .timestamp_millis()
            .max(status.pass_started_ms.unwrap_or(0) + 1);
        sqlx::query(
            "UPDATE prefix_status
             SET objects_count = 0, total_size = 0, continuation_token = NULL, is_delimited = 0,
                 last_indexed_key = NULL, requests_made = 0, pass_started_ms = ?,
                 sync_started_at = ?, sync_completed_at = NULL, last_status = 'starting',
                 last_error = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(pass_ms)
        .bind(now)
        .bind(now)
        .bind(status.id)
        .execute(&mut *tx)
        .await?;
        // Prefixes seen by an abandoned pass must not shield rows from this one.
        sqlx::query(
            "DELETE FROM pass_common_prefixes
             WHERE profile_id = ? AND bucket_name = ? AND job_prefix = ?",
        )
        .bind(&key.profile_id)
        .bind(&key.bucket_name)
        .bind(&key.prefix)
        .execute(&mut *tx)
        .await?;

        if key.prefix.is_empty() {
            sqlx::query(
                "UPDATE bucket_info SET first_index_started_at = COALESCE(first_index_started_at, ?),
                     updated_at = ?
                 WHERE profile_id = ? AND bucket_name = ?",
            )
            .bind(now)
            .bind(now)
            .bind(&key.profile_id)
            .bind(&key.bucket_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(PassStart::Ready(PassState {
            pass_ms,
            token: None,
            resumed: false,
            objects_count: 0,
            requests_made: 0,
        }))
    }

    /// Apply one listing page and advance the resumption token atomically.
    ///
    /// On the terminal page the pass is finalized in the same transaction:
    /// rows under the prefix not seen by this pass are removed, counts are
    /// recomputed from the index and the prefix is marked complete.
    pub(crate) async fn commit_page(
        &self,
        key: &JobKey,
        pass: &PassState,
        page: &ListPage,
        requests_made: i64,
    ) -> StoreResult<PageCommit> {
        for record in &page.objects {
            if !record.key.starts_with(&key.prefix) {
                return Err(StoreError::InvariantViolation(format!(
                    "key `{}` listed outside prefix `{}`",
                    record.key, key.prefix
                )));
            }
        }
        let folders: Vec<&String> = page
            .common_prefixes
            .iter()
            .filter(|p| p.len() > key.prefix.len() && p.starts_with(&key.prefix) && p.ends_with('/'))
            .collect();
        let mut batch = page.objects.clone();
        batch.extend(folders.iter().map(|folder| ObjectRecord::new(folder.as_str(), 0)));
        ensure_unique_batch(&batch)?;

        let lock = self.locks.scope(&key.profile_id, &key.bucket_name);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let upsert = upsert_batch_tx(
            &mut tx,
            &key.profile_id,
            &key.bucket_name,
            &batch,
            pass.pass_ms,
            now,
        )
        .await?;
        for folder in &folders {
            sqlx::query(
                "INSERT INTO pass_common_prefixes
                     (profile_id, bucket_name, job_prefix, pass_ms, common_prefix)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(profile_id, bucket_name, job_prefix, pass_ms, common_prefix) DO NOTHING",
            )
            .bind(&key.profile_id)
            .bind(&key.bucket_name)
            .bind(&key.prefix)
            .bind(pass.pass_ms)
            .bind(folder.as_str())
            .execute(&mut *tx)
            .await?;
        }
        let last_key = page.objects.last().map(|o| o.key.clone());
        let is_complete = page.is_terminal();

        let mut removed = 0;
        if is_complete {
            // Subtrees behind a common prefix were not listed by this pass:
            // their rows are neither reconciled nor counted here.
            let is_delimited: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM pass_common_prefixes
                 WHERE profile_id = ? AND bucket_name = ? AND job_prefix = ? AND pass_ms = ?)",
            )
            .bind(&key.profile_id)
            .bind(&key.bucket_name)
            .bind(&key.prefix)
            .bind(pass.pass_ms)
            .fetch_one(&mut *tx)
            .await?;

            let mut builder =
                QueryBuilder::<Sqlite>::new("DELETE FROM objects WHERE profile_id = ");
            builder.push_bind(&key.profile_id);
            builder.push(" AND bucket_name = ");
            builder.push_bind(&key.bucket_name);
            push_key_range(&mut builder, "key", &key.prefix);
            builder.push(" AND indexed_pass < ");
            builder.push_bind(pass.pass_ms);
            push_outside_common_prefixes(&mut builder, key, pass.pass_ms);
            removed = builder.build().execute(&mut *tx).await?.rows_affected();

            let totals = pass_totals(&mut tx, key, pass.pass_ms).await?;
            sqlx::query(
                "DELETE FROM pass_common_prefixes
                 WHERE profile_id = ? AND bucket_name = ? AND job_prefix = ?",
            )
            .bind(&key.profile_id)
            .bind(&key.bucket_name)
            .bind(&key.prefix)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE prefix_status
                 SET is_complete = 1, is_delimited = ?, objects_count = ?, total_size = ?,
                     continuation_token = NULL,
                     last_indexed_key = COALESCE(?, last_indexed_key), requests_made = ?,
                     sync_completed_at = ?, last_status = 'completed', last_error = NULL,
                     updated_at = ?
                 WHERE profile_id = ? AND bucket_name = ? AND prefix = ?",
            )
            .bind(is_delimited)
            .bind(totals.count)
            .bind(totals.total_size)
            .bind(last_key.as_deref())
            .bind(requests_made)
            .bind(now)
            .bind(now)
            .bind(&key.profile_id)
            .bind(&key.bucket_name)
            .bind(&key.prefix)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE prefix_status
                 SET continuation_token = ?, last_indexed_key = COALESCE(?, last_indexed_key),
                     objects_count = objects_count + ?, total_size = total_size + ?,
                     requests_made = ?, last_status = 'indexing', updated_at = ?
                 WHERE profile_id = ? AND bucket_name = ? AND prefix = ?",
            )
            .bind(page.next_token.as_deref())
            .bind(last_key.as_deref())
            .bind(upsert.objects as i64)
            .bind(upsert.bytes)
            .bind(requests_made)
            .bind(now)
            .bind(&key.profile_id)
            .bind(&key.bucket_name)
            .bind(&key.prefix)
            .execute(&mut *tx)
            .await?;
        }

        let status = fetch_status(&mut tx, key).await?;

        if key.prefix.is_empty() {
            sqlx::query(
                "UPDATE bucket_info
                 SET first_index_objects = CASE WHEN first_index_completed_at IS NULL
                         THEN ? ELSE first_index_objects END,
                     first_index_requests = CASE WHEN first_index_completed_at IS NULL
                         THEN ? ELSE first_index_requests END,
                     first_index_completed_at = CASE WHEN ? AND first_index_completed_at IS NULL
                         THEN ? ELSE first_index_completed_at END,
                     updated_at = ?
                 WHERE profile_id = ? AND bucket_name = ?",
            )
            .bind(status.objects_count)
            .bind(requests_made)
            .bind(is_complete)
            .bind(now)
            .bind(now)
            .bind(&key.profile_id)
            .bind(&key.bucket_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(PageCommit {
            objects_count: status.objects_count,
            total_size: status.total_size,
            is_complete,
            removed,
        })
    }

    /// Record the terminal state of a job that did not complete. The token
    /// and counts are left as the last committed page wrote them.
    pub(crate) async fn record_outcome(
        &self,
        key: &JobKey,
        status: JobStatus,
        error: Option<&str>,
        requests_made: i64,
    ) -> StoreResult<()> {
        let lock = self.locks.scope(&key.profile_id, &key.bucket_name);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        ensure_status_row(&mut tx, key, now).await?;
        sqlx::query(
            "UPDATE prefix_status
             SET last_status = ?, last_error = ?, requests_made = MAX(requests_made, ?),
                 updated_at = ?
             WHERE profile_id = ? AND bucket_name = ? AND prefix = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(requests_made)
        .bind(now)
        .bind(&key.profile_id)
        .bind(&key.bucket_name)
        .bind(&key.prefix)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

// --- Transaction-scoped helpers shared with the version ledger ---

/// Upsert a validated batch inside an open transaction.
pub(crate) async fn upsert_batch_tx(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    batch: &[ObjectRecord],
    pass_ms: i64,
    now: DateTime<Utc>,
) -> StoreResult<UpsertResult> {
    let mut result = UpsertResult::default();
    for record in batch {
        let (parts, superseded) = upsert_object_tx(conn, profile, bucket, record, pass_ms, now).await?;
        result.upserted += 1;
        result.superseded += superseded;
        if !parts.is_folder {
            result.objects += 1;
            result.bytes += record.size;
        }
    }
    Ok(result)
}

/// Insert or replace one object row, keeping a key either unversioned or
/// versioned, never both. Returns the derived fields and the number of rows
/// of the other kind that were removed.
pub(crate) async fn upsert_object_tx(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    record: &ObjectRecord,
    pass_ms: i64,
    now: DateTime<Utc>,
) -> StoreResult<(KeyParts, u64)> {
    validate_record(record)?;
    let parts = KeyParts::derive(&record.key);

    let supersede_sql = if record.version_id.is_some() {
        "DELETE FROM objects WHERE profile_id = ? AND bucket_name = ? AND key = ? AND version_id IS NULL"
    } else {
        "DELETE FROM objects WHERE profile_id = ? AND bucket_name = ? AND key = ? AND version_id IS NOT NULL"
    };
    let superseded = sqlx::query(supersede_sql)
        .bind(profile)
        .bind(bucket)
        .bind(&record.key)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    let conflict_target = if record.version_id.is_some() {
        "(profile_id, bucket_name, key, version_id) WHERE version_id IS NOT NULL"
    } else {
        "(profile_id, bucket_name, key) WHERE version_id IS NULL"
    };
    let sql = format!(
        "INSERT INTO objects (
            profile_id, bucket_name, key, version_id, size, last_modified, etag, storage_class,
            owner, checksum_algorithm, restore_status, content_type, encryption,
            parent_prefix, basename, extension, depth, is_folder, indexed_pass, indexed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT {} DO UPDATE SET
            size = excluded.size,
            last_modified = excluded.last_modified,
            etag = excluded.etag,
            storage_class = excluded.storage_class,
            owner = excluded.owner,
            checksum_algorithm = excluded.checksum_algorithm,
            restore_status = excluded.restore_status,
            content_type = excluded.content_type,
            encryption = excluded.encryption,
            parent_prefix = excluded.parent_prefix,
            basename = excluded.basename,
            extension = excluded.extension,
            depth = excluded.depth,
            is_folder = excluded.is_folder,
            indexed_pass = MAX(objects.indexed_pass, excluded.indexed_pass),
            indexed_at = excluded.indexed_at",
        conflict_target
    );

    sqlx::query(&sql)
        .bind(profile)
        .bind(bucket)
        .bind(&record.key)
        .bind(record.version_id.as_deref())
        .bind(record.size)
        .bind(record.last_modified)
        .bind(record.etag.as_deref())
        .bind(record.storage_class_or_default())
        .bind(record.owner.as_deref())
        .bind(record.checksum_algorithm.as_deref())
        .bind(record.restore_status.as_deref())
        .bind(record.content_type.as_deref())
        .bind(record.encryption.as_deref())
        .bind(&parts.parent_prefix)
        .bind(&parts.basename)
        .bind(parts.extension.as_deref())
        .bind(parts.depth)
        .bind(parts.is_folder)
        .bind(pass_ms)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(map_unique_violation)?;

    Ok((parts, superseded))
}

/// Remove every `objects` row of a key.
pub(crate) async fn delete_key_tx(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    key: &str,
) -> StoreResult<u64> {
    Ok(
        sqlx::query("DELETE FROM objects WHERE profile_id = ? AND bucket_name = ? AND key = ?")
            .bind(profile)
            .bind(bucket)
            .bind(key)
            .execute(&mut *conn)
            .await?
            .rows_affected(),
    )
}

async fn aggregate_conn(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    prefix: &str,
) -> StoreResult<Aggregate> {
    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT COUNT(*) AS count, COALESCE(SUM(size), 0) AS total_size \
         FROM objects WHERE profile_id = ",
    );
    builder.push_bind(profile);
    builder.push(" AND bucket_name = ");
    builder.push_bind(bucket);
    builder.push(" AND is_folder = 0");
    if prefix.is_empty() || prefix.ends_with('/') {
        push_key_range(&mut builder, "parent_prefix", prefix);
    } else {
        push_key_range(&mut builder, "key", prefix);
    }

    let row: AggregateRow = builder.build_query_as().fetch_one(&mut *conn).await?;
    Ok(Aggregate {
        count: row.count,
        total_size: row.total_size,
    })
}

/// Totals of the rows a pass is accountable for: everything under the job
/// prefix except the subtrees behind common prefixes it saw.
async fn pass_totals(
    conn: &mut SqliteConnection,
    key: &JobKey,
    pass_ms: i64,
) -> StoreResult<Aggregate> {
    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT COUNT(*) AS count, COALESCE(SUM(size), 0) AS total_size \
         FROM objects WHERE profile_id = ",
    );
    builder.push_bind(&key.profile_id);
    builder.push(" AND bucket_name = ");
    builder.push_bind(&key.bucket_name);
    builder.push(" AND is_folder = 0");
    push_key_range(&mut builder, "key", &key.prefix);
    push_outside_common_prefixes(&mut builder, key, pass_ms);

    let row: AggregateRow = builder.build_query_as().fetch_one(&mut *conn).await?;
    Ok(Aggregate {
        count: row.count,
        total_size: row.total_size,
    })
}

/// Exclude `objects` rows under any common prefix recorded for the pass.
fn push_outside_common_prefixes<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    key: &'a JobKey,
    pass_ms: i64,
) {
    builder.push(
        " AND NOT EXISTS (SELECT 1 FROM pass_common_prefixes cp \
         WHERE cp.profile_id = objects.profile_id AND cp.bucket_name = objects.bucket_name \
         AND cp.job_prefix = ",
    );
    builder.push_bind(&key.prefix);
    builder.push(" AND cp.pass_ms = ");
    builder.push_bind(pass_ms);
    builder.push(" AND substr(objects.key, 1, length(cp.common_prefix)) = cp.common_prefix)");
}

async fn ensure_status_row(
    conn: &mut SqliteConnection,
    key: &JobKey,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO prefix_status (profile_id, bucket_name, prefix, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(profile_id, bucket_name, prefix) DO NOTHING",
    )
    .bind(&key.profile_id)
    .bind(&key.bucket_name)
    .bind(&key.prefix)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn ensure_bucket_row(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO bucket_info (profile_id, bucket_name, updated_at)
         VALUES (?, ?, ?)
         ON CONFLICT(profile_id, bucket_name) DO NOTHING",
    )
    .bind(profile)
    .bind(bucket)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_status(conn: &mut SqliteConnection, key: &JobKey) -> StoreResult<PrefixStatus> {
    let sql = format!(
        "SELECT {} FROM prefix_status WHERE profile_id = ? AND bucket_name = ? AND prefix = ?",
        PREFIX_STATUS_COLUMNS
    );
    Ok(sqlx::query_as::<_, PrefixStatus>(&sql)
        .bind(&key.profile_id)
        .bind(&key.bucket_name)
        .bind(&key.prefix)
        .fetch_one(&mut *conn)
        .await?)
}

async fn invalidate_tx(
    conn: &mut SqliteConnection,
    key: &JobKey,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE prefix_status
         SET is_complete = 0, continuation_token = NULL, last_status = 'idle', updated_at = ?
         WHERE profile_id = ? AND bucket_name = ? AND prefix = ?",
    )
    .bind(now)
    .bind(&key.profile_id)
    .bind(&key.bucket_name)
    .bind(&key.prefix)
    .execute(&mut *conn)
    .await?;
    invalidate_ancestors(conn, key, now).await
}

async fn invalidate_ancestors(
    conn: &mut SqliteConnection,
    key: &JobKey,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let ancestors: Vec<String> = ancestor_prefixes(&key.prefix)
        .into_iter()
        .filter(|p| *p != key.prefix)
        .collect();
    if ancestors.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE prefix_status SET is_complete = 0, updated_at = ");
    builder.push_bind(now);
    builder.push(" WHERE profile_id = ");
    builder.push_bind(&key.profile_id);
    builder.push(" AND bucket_name = ");
    builder.push_bind(&key.bucket_name);
    builder.push(" AND prefix IN (");
    let mut separated = builder.separated(", ");
    for prefix in ancestors {
        separated.push_bind(prefix);
    }
    builder.push(")");
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

/// Restrict `column` to values starting with `prefix`, as an index-friendly range.
fn push_key_range(builder: &mut QueryBuilder<'_, Sqlite>, column: &str, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    builder.push(format!(" AND {} >= ", column));
    builder.push_bind(prefix.to_string());
    if let Some(upper) = prefix_upper_bound(prefix) {
        builder.push(format!(" AND {} < ", column));
        builder.push_bind(upper);
    }
}

fn validate_record(record: &ObjectRecord) -> StoreResult<()> {
    if record.key.is_empty() {
        return Err(StoreError::InvariantViolation("empty object key".into()));
    }
    if record.key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvariantViolation(format!(
            "key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }
    if record.key.contains('\0') {
        return Err(StoreError::InvariantViolation(format!(
            "key `{}` contains a NUL byte",
            record.key.escape_debug()
        )));
    }
    if record.size < 0 {
        return Err(StoreError::InvariantViolation(format!(
            "negative size {} for `{}`",
            record.size, record.key
        )));
    }
    if record.version_id.as_deref() == Some("") {
        return Err(StoreError::InvariantViolation(format!(
            "empty version id for `{}`",
            record.key
        )));
    }
    Ok(())
}

fn ensure_unique_batch(batch: &[ObjectRecord]) -> StoreResult<()> {
    let mut seen = HashSet::with_capacity(batch.len());
    for record in batch {
        if !seen.insert((record.key.as_str(), record.version_id.as_deref())) {
            return Err(StoreError::InvariantViolation(format!(
                "duplicate identity `{}` (version {:?}) in batch",
                record.key, record.version_id
            )));
        }
    }
    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

pub(crate) fn map_unique_violation(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::InvariantViolation(err.to_string())
    } else {
        StoreError::Sqlx(err)
    }
}

/// Browse prefixes are folder-shaped: empty or ending in `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// `prefix` and each folder-shaped ancestor, root first: `a/b/` → `["", "a/", "a/b/"]`.
pub fn ancestor_prefixes(prefix: &str) -> Vec<String> {
    let mut out = vec![String::new()];
    for (idx, _) in prefix.match_indices('/') {
        out.push(prefix[..=idx].to_string());
    }
    if !prefix.is_empty() && !prefix.ends_with('/') {
        out.push(prefix.to_string());
    }
    out
}

/// Smallest string greater than every string starting with `prefix`.
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // Skip the surrogate gap.
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn folder_name(child_prefix: &str) -> String {
    child_prefix
        .strip_suffix('/')
        .unwrap_or(child_prefix)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_bound_of_folder_prefix() {
        assert_eq!(prefix_upper_bound("photos/").as_deref(), Some("photos0"));
        assert_eq!(prefix_upper_bound("ab").as_deref(), Some("ac"));
        assert_eq!(prefix_upper_bound(""), None);
        assert_eq!(
            prefix_upper_bound("a\u{10FFFF}").as_deref(),
            Some("b")
        );
    }

    #[test]
    fn lineage_lists_root_first() {
        assert_eq!(ancestor_prefixes(""), vec![""]);
        assert_eq!(ancestor_prefixes("a/b/"), vec!["", "a/", "a/b/"]);
        assert_eq!(ancestor_prefixes("a/bc"), vec!["", "a/", "a/bc"]);
    }

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn duplicate_identities_are_rejected() {
        let batch = vec![ObjectRecord::new("a", 1), ObjectRecord::new("a", 2)];
        assert!(matches!(
            ensure_unique_batch(&batch),
            Err(StoreError::InvariantViolation(_))
        ));

        let mut versioned = ObjectRecord::new("a", 1);
        versioned.version_id = Some("v1".into());
        assert!(ensure_unique_batch(&[ObjectRecord::new("a", 1), versioned]).is_ok());
    }

    #[test]
    fn folder_names_drop_the_trailing_slash() {
        assert_eq!(folder_name("photos/2025/"), "2025");
        assert_eq!(folder_name("photos/"), "photos");
        assert_eq!(folder_name("a//"), "");
        assert_eq!(folder_name("a//b/"), "b");
    }
}
