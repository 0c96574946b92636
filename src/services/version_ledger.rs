//! Version history per key, with a single "latest" version per key.
//!
//! The ledger also keeps the non-version view in `objects` in step with the
//! latest version: a latest delete marker removes the key from that view, a
//! latest live version becomes the key's only versioned row.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::{
    models::{
        object::{DEFAULT_STORAGE_CLASS, KeyParts},
        version::{ObjectVersion, VersionRecord},
    },
    services::entity_store::{
        EntityStore, StoreError, StoreResult, delete_key_tx, map_unique_violation,
        upsert_object_tx,
    },
};

const VERSION_COLUMNS: &str = "id, profile_id, bucket_name, key, version_id, size, last_modified, \
     etag, storage_class, owner, checksum_algorithm, restore_status, content_type, encryption, \
     parent_prefix, basename, extension, depth, is_latest, is_delete_marker, indexed_at";

#[derive(Clone)]
pub struct VersionLedger {
    store: EntityStore,
}

impl VersionLedger {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Upsert one version. A latest version demotes every other version of
    /// the key in the same transaction.
    pub async fn record_version(
        &self,
        profile: &str,
        bucket: &str,
        version: &VersionRecord,
    ) -> StoreResult<ObjectVersion> {
        self.record_versions(profile, bucket, std::slice::from_ref(version))
            .await?;
        self.version(profile, bucket, &version.key, &version.version_id)
            .await?
            .ok_or_else(|| {
                StoreError::InvariantViolation(format!(
                    "version `{}` of `{}` vanished after write",
                    version.version_id, version.key
                ))
            })
    }

    /// Apply several versions atomically, in order.
    pub async fn record_versions(
        &self,
        profile: &str,
        bucket: &str,
        versions: &[VersionRecord],
    ) -> StoreResult<usize> {
        let lock = self.store.scope_lock(profile, bucket);
        let _guard = lock.lock().await;
        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;

        let mut touched: Vec<&str> = Vec::new();
        for version in versions {
            record_version_tx(&mut tx, profile, bucket, version, now).await?;
            if !touched.contains(&version.key.as_str()) {
                touched.push(&version.key);
            }
        }
        // Promotion runs once per key so a batch is judged as a whole.
        for key in touched {
            ensure_latest(&mut tx, profile, bucket, key).await?;
            sync_object_view(&mut tx, profile, bucket, key, now).await?;
        }

        tx.commit().await?;
        debug!(
            "recorded {} versions in {}/{}",
            versions.len(),
            profile,
            bucket
        );
        Ok(versions.len())
    }

    /// Current latest version, or `None` when the key has no versions or its
    /// latest version is a delete marker.
    pub async fn latest_view(
        &self,
        profile: &str,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Option<ObjectVersion>> {
        let sql = format!(
            "SELECT {} FROM object_versions
             WHERE profile_id = ? AND bucket_name = ? AND key = ? AND is_latest = 1",
            VERSION_COLUMNS
        );
        let latest = sqlx::query_as::<_, ObjectVersion>(&sql)
            .bind(profile)
            .bind(bucket)
            .bind(key)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(latest.filter(|v| !v.is_delete_marker))
    }

    /// Every version of `key`, latest first, then newest first.
    pub async fn versions(
        &self,
        profile: &str,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Vec<ObjectVersion>> {
        let sql = format!(
            "SELECT {} FROM object_versions
             WHERE profile_id = ? AND bucket_name = ? AND key = ?
             ORDER BY is_latest DESC, last_modified DESC, version_id DESC",
            VERSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, ObjectVersion>(&sql)
            .bind(profile)
            .bind(bucket)
            .bind(key)
            .fetch_all(self.store.pool())
            .await?)
    }

    async fn version(
        &self,
        profile: &str,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> StoreResult<Option<ObjectVersion>> {
        let sql = format!(
            "SELECT {} FROM object_versions
             WHERE profile_id = ? AND bucket_name = ? AND key = ? AND version_id = ?",
            VERSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, ObjectVersion>(&sql)
            .bind(profile)
            .bind(bucket)
            .bind(key)
            .bind(version_id)
            .fetch_optional(self.store.pool())
            .await?)
    }
}

async fn record_version_tx(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    version: &VersionRecord,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    if version.key.is_empty() || version.version_id.is_empty() {
        return Err(StoreError::InvariantViolation(
            "versions need a key and a version id".into(),
        ));
    }
    if version.size < 0 {
        return Err(StoreError::InvariantViolation(format!(
            "negative size {} for `{}`",
            version.size, version.key
        )));
    }

    if version.is_latest {
        sqlx::query(
            "UPDATE object_versions SET is_latest = 0
             WHERE profile_id = ? AND bucket_name = ? AND key = ? AND version_id != ?
               AND is_latest = 1",
        )
        .bind(profile)
        .bind(bucket)
        .bind(&version.key)
        .bind(&version.version_id)
        .execute(&mut *conn)
        .await?;
    }

    let parts = KeyParts::derive(&version.key);
    // Size has no meaning for delete markers.
    let size = if version.is_delete_marker { 0 } else { version.size };
    sqlx::query(
        "INSERT INTO object_versions (
            profile_id, bucket_name, key, version_id, size, last_modified, etag, storage_class,
            owner, checksum_algorithm, restore_status, content_type, encryption,
            parent_prefix, basename, extension, depth, is_latest, is_delete_marker, indexed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(profile_id, bucket_name, key, version_id) DO UPDATE SET
            size = excluded.size,
            last_modified = excluded.last_modified,
            etag = excluded.etag,
            storage_class = excluded.storage_class,
            owner = excluded.owner,
            checksum_algorithm = excluded.checksum_algorithm,
            restore_status = excluded.restore_status,
            content_type = excluded.content_type,
            encryption = excluded.encryption,
            is_latest = excluded.is_latest,
            is_delete_marker = excluded.is_delete_marker,
            indexed_at = excluded.indexed_at",
    )
    .bind(profile)
    .bind(bucket)
    .bind(&version.key)
    .bind(&version.version_id)
    .bind(size)
    .bind(version.last_modified)
    .bind(version.etag.as_deref())
    .bind(version.storage_class.as_deref().unwrap_or(DEFAULT_STORAGE_CLASS))
    .bind(version.owner.as_deref())
    .bind(version.checksum_algorithm.as_deref())
    .bind(version.restore_status.as_deref())
    .bind(version.content_type.as_deref())
    .bind(version.encryption.as_deref())
    .bind(&parts.parent_prefix)
    .bind(&parts.basename)
    .bind(parts.extension.as_deref())
    .bind(parts.depth)
    .bind(version.is_latest)
    .bind(version.is_delete_marker)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(map_unique_violation)?;
    Ok(())
}

/// Promote the newest version when a batch left the key without a latest one.
async fn ensure_latest(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    key: &str,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE object_versions SET is_latest = 1
         WHERE id = (
             SELECT id FROM object_versions
             WHERE profile_id = ?1 AND bucket_name = ?2 AND key = ?3
             ORDER BY last_modified DESC, version_id DESC
             LIMIT 1
         )
         AND NOT EXISTS (
             SELECT 1 FROM object_versions
             WHERE profile_id = ?1 AND bucket_name = ?2 AND key = ?3 AND is_latest = 1
         )",
    )
    .bind(profile)
    .bind(bucket)
    .bind(key)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Mirror the latest version of `key` into the non-version `objects` view.
async fn sync_object_view(
    conn: &mut SqliteConnection,
    profile: &str,
    bucket: &str,
    key: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = format!(
        "SELECT {} FROM object_versions
         WHERE profile_id = ? AND bucket_name = ? AND key = ? AND is_latest = 1",
        VERSION_COLUMNS
    );
    let latest = sqlx::query_as::<_, ObjectVersion>(&sql)
        .bind(profile)
        .bind(bucket)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

    match latest {
        Some(latest) if !latest.is_delete_marker => {
            let record = VersionRecord {
                key: latest.key.clone(),
                version_id: latest.version_id.clone(),
                is_latest: true,
                is_delete_marker: false,
                size: latest.size,
                last_modified: latest.last_modified,
                etag: latest.etag.clone(),
                storage_class: Some(latest.storage_class.clone()),
                owner: latest.owner.clone(),
                checksum_algorithm: latest.checksum_algorithm.clone(),
                restore_status: latest.restore_status.clone(),
                content_type: latest.content_type.clone(),
                encryption: latest.encryption.clone(),
            }
            .to_object_record();
            upsert_object_tx(conn, profile, bucket, &record, now.timestamp_millis(), now).await?;
            sqlx::query(
                "DELETE FROM objects
                 WHERE profile_id = ? AND bucket_name = ? AND key = ?
                   AND version_id IS NOT NULL AND version_id != ?",
            )
            .bind(profile)
            .bind(bucket)
            .bind(key)
            .bind(&latest.version_id)
            .execute(&mut *conn)
            .await?;
        }
        _ => {
            delete_key_tx(conn, profile, bucket, key).await?;
        }
    }
    Ok(())
}
