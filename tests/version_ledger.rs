mod common;

use bucket_index::{models::version::VersionRecord, services::entity_store::StoreError};
use chrono::{Duration, TimeZone, Utc};
use common::{BUCKET, Harness, PROFILE, ScriptedLister, page};

fn version(key: &str, id: &str, minute: i64, latest: bool) -> VersionRecord {
    VersionRecord {
        key: key.into(),
        version_id: id.into(),
        is_latest: latest,
        size: 10 * minute,
        last_modified: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)),
        ..VersionRecord::default()
    }
}

async fn harness() -> Harness {
    Harness::new(ScriptedLister::new(vec![page(Vec::new(), None)])).await
}

async fn latest_count(h: &Harness, key: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM object_versions
         WHERE profile_id = ? AND bucket_name = ? AND key = ? AND is_latest = 1",
    )
    .bind(PROFILE)
    .bind(BUCKET)
    .bind(key)
    .fetch_one(&*h.db)
    .await
    .unwrap()
}

#[tokio::test]
async fn exactly_one_version_is_latest() {
    let h = harness().await;
    for (id, minute) in [("v1", 1), ("v2", 2), ("v3", 3)] {
        let stored = h
            .ledger
            .record_version(PROFILE, BUCKET, &version("doc.txt", id, minute, true))
            .await
            .unwrap();
        assert!(stored.is_latest);
        assert_eq!(latest_count(&h, "doc.txt").await, 1);
    }

    let history = h.ledger.versions(PROFILE, BUCKET, "doc.txt").await.unwrap();
    let ids: Vec<_> = history.iter().map(|v| v.version_id.as_str()).collect();
    assert_eq!(ids, vec!["v3", "v2", "v1"]);

    // The non-version view carries only the latest version.
    assert_eq!(
        h.object_rows().await,
        vec![("doc.txt".to_string(), Some("v3".to_string()), 30)]
    );
}

#[tokio::test]
async fn latest_delete_marker_hides_the_key() {
    let h = harness().await;
    h.ledger
        .record_version(PROFILE, BUCKET, &version("gone.txt", "v1", 1, true))
        .await
        .unwrap();

    let mut marker = version("gone.txt", "m1", 2, true);
    marker.is_delete_marker = true;
    let stored = h
        .ledger
        .record_version(PROFILE, BUCKET, &marker)
        .await
        .unwrap();
    assert!(stored.is_delete_marker);
    assert_eq!(stored.size, 0);

    assert!(
        h.ledger
            .latest_view(PROFILE, BUCKET, "gone.txt")
            .await
            .unwrap()
            .is_none()
    );
    assert!(h.object_rows().await.is_empty());
    assert_eq!(
        h.ledger.versions(PROFILE, BUCKET, "gone.txt").await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn newest_version_is_promoted_when_none_is_latest() {
    let h = harness().await;
    let applied = h
        .ledger
        .record_versions(
            PROFILE,
            BUCKET,
            &[
                version("k", "old", 1, false),
                version("k", "new", 5, false),
            ],
        )
        .await
        .unwrap();
    assert_eq!(applied, 2);

    let latest = h
        .ledger
        .latest_view(PROFILE, BUCKET, "k")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.version_id, "new");
    assert_eq!(latest_count(&h, "k").await, 1);
}

#[tokio::test]
async fn older_latest_report_demotes_the_current_one() {
    let h = harness().await;
    h.ledger
        .record_version(PROFILE, BUCKET, &version("k", "v2", 2, true))
        .await
        .unwrap();
    h.ledger
        .record_version(PROFILE, BUCKET, &version("k", "v1", 1, true))
        .await
        .unwrap();

    let latest = h
        .ledger
        .latest_view(PROFILE, BUCKET, "k")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.version_id, "v1");
    assert_eq!(latest_count(&h, "k").await, 1);
}

#[tokio::test]
async fn invalid_version_batches_roll_back() {
    let h = harness().await;
    let mut bad = version("k", "v2", 2, true);
    bad.size = -5;

    let err = h
        .ledger
        .record_versions(PROFILE, BUCKET, &[version("k", "v1", 1, true), bad])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)));
    assert!(h.ledger.versions(PROFILE, BUCKET, "k").await.unwrap().is_empty());
    assert!(h.object_rows().await.is_empty());
}
