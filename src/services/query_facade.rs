//! QueryFacade — read-only views over the index for the browsing layer.
//!
//! Nothing here writes index state. Browses are reported to the metrics
//! recorder as cache hits (served by a complete index) or misses.

use crate::{
    models::{
        browse::{BrowseResult, PrefixSummary, SearchQuery},
        metrics::{BucketStats, CacheEvent, StorageStats},
        object::IndexedObject,
        prefix_status::PrefixStatus,
        version::ObjectVersion,
    },
    services::{
        entity_store::{EntityStore, StoreResult, normalize_prefix},
        metrics_recorder::MetricsRecorder,
        version_ledger::VersionLedger,
    },
};

/// One listing call per browsed prefix is what a hit avoids.
const SAVED_PER_HIT: i64 = 1;

#[derive(Clone)]
pub struct QueryFacade {
    store: EntityStore,
    ledger: VersionLedger,
    metrics: MetricsRecorder,
}

impl QueryFacade {
    pub fn new(store: EntityStore, ledger: VersionLedger, metrics: MetricsRecorder) -> Self {
        Self {
            store,
            ledger,
            metrics,
        }
    }

    /// Direct children of `prefix` with recursive folder statistics.
    pub async fn browse(&self, profile: &str, bucket: &str, prefix: &str) -> StoreResult<BrowseResult> {
        let prefix = normalize_prefix(prefix);
        let entries = self.store.get_children(profile, bucket, &prefix).await?;
        let lineage = self.store.prefix_lineage(profile, bucket, &prefix).await?;
        let fully_indexed = children_complete(&lineage, &prefix);
        let prefix_status = lineage.into_iter().find(|s| s.prefix == prefix);

        self.metrics.record_cache_event(
            CacheEvent::new("browse", fully_indexed, SAVED_PER_HIT).with_bucket(profile, bucket),
        );

        Ok(BrowseResult {
            entries,
            prefix_status,
            fully_indexed,
        })
    }

    /// Recursive totals of `prefix` and whether they are final.
    pub async fn prefix_stats(
        &self,
        profile: &str,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<PrefixSummary> {
        let aggregate = self.store.aggregate(profile, bucket, prefix).await?;
        let lineage = self.store.prefix_lineage(profile, bucket, prefix).await?;
        let fully_indexed = lineage.iter().any(PrefixStatus::covers_subtree);
        Ok(PrefixSummary {
            profile_id: profile.to_string(),
            bucket_name: bucket.to_string(),
            prefix: prefix.to_string(),
            aggregate,
            fully_indexed,
            prefix_status: lineage.into_iter().find(|s| s.prefix == prefix),
        })
    }

    pub async fn search(
        &self,
        profile: &str,
        bucket: &str,
        query: &SearchQuery,
    ) -> StoreResult<Vec<IndexedObject>> {
        self.store.search(profile, bucket, query).await
    }

    pub async fn versions(
        &self,
        profile: &str,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Vec<ObjectVersion>> {
        self.ledger.versions(profile, bucket, key).await
    }

    pub async fn bucket_stats(&self, profile: &str) -> StoreResult<Vec<BucketStats>> {
        self.store.bucket_stats(profile).await
    }

    pub async fn storage_stats(&self, profile: &str) -> StoreResult<Vec<StorageStats>> {
        self.store.storage_stats(profile).await
    }
}

/// The children of `prefix` are all known when the prefix itself completed,
/// even one level deep, or when an ancestor completed a recursive listing.
fn children_complete(lineage: &[PrefixStatus], prefix: &str) -> bool {
    lineage
        .iter()
        .any(|status| status.covers_subtree() || (status.is_complete && status.prefix == prefix))
}
