mod common;

use bucket_index::{
    models::{
        metrics::{CacheEvent, MetricsEvent},
        object::ObjectRecord,
        prefix_status::PrefixStats,
    },
    services::metrics_recorder::MetricsRecorder,
};
use chrono::Utc;
use common::{BUCKET, Harness, PROFILE, ScriptedLister, page, test_db};

#[tokio::test]
async fn events_roll_up_into_daily_stats() {
    let (_dir, db) = test_db().await;
    let metrics = MetricsRecorder::spawn(db);

    let mut get = MetricsEvent::new("GetObject", 30, true).with_bucket(PROFILE, BUCKET);
    get.bytes = 500;
    let mut put = MetricsEvent::new("PutObject", 10, true);
    put.bytes = 200;
    metrics.record_request(MetricsEvent::new("ListObjectsV2", 20, true));
    metrics.record_request(get);
    metrics.record_request(put);
    metrics.record_request(MetricsEvent::new("DeleteObject", 40, true).with_error("denied"));
    metrics.flush().await;

    let stats = metrics
        .daily_stats(Utc::now().date_naive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.list_requests, 1);
    assert_eq!(stats.get_requests, 1);
    assert_eq!(stats.put_requests, 1);
    assert_eq!(stats.delete_requests, 1);
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.bytes_downloaded, 500);
    assert_eq!(stats.bytes_uploaded, 200);
    assert_eq!(stats.max_duration_ms, 40);
    assert!((stats.avg_duration_ms - 25.0).abs() < 1e-9);
}

#[tokio::test]
async fn replayed_events_are_counted_once() {
    let (_dir, db) = test_db().await;
    let metrics = MetricsRecorder::spawn(db);
    let event = MetricsEvent::new("ListObjectsV2", 12, true);
    let cache = CacheEvent::new("browse", true, 1);

    assert!(metrics.apply_request(&event).await.unwrap());
    assert!(!metrics.apply_request(&event).await.unwrap());
    assert!(metrics.apply_cache_event(&cache).await.unwrap());
    assert!(!metrics.apply_cache_event(&cache).await.unwrap());

    let stats = metrics
        .daily_stats(event.stat_date())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_saved_requests, 1);
}

#[tokio::test]
async fn hit_rate_follows_cache_events() {
    let (_dir, db) = test_db().await;
    let metrics = MetricsRecorder::spawn(db);
    for hit in [true, true, true, false] {
        metrics.record_cache_event(CacheEvent::new("browse", hit, 2));
    }
    metrics.flush().await;

    let stats = metrics
        .daily_stats(Utc::now().date_naive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.cache_hits, 3);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_saved_requests, 6);
    assert_eq!(stats.cache_hit_rate(), 75.0);
}

#[tokio::test]
async fn reconciliation_rebuilds_the_rollup_from_the_log() {
    let (_dir, db) = test_db().await;
    let metrics = MetricsRecorder::spawn(db.clone());
    for ms in [10, 20, 60] {
        metrics.record_request(MetricsEvent::new("GetObject", ms, true));
    }
    metrics.record_cache_event(CacheEvent::new("browse", false, 0));
    metrics.flush().await;

    let today = Utc::now().date_naive();
    let running = metrics.daily_stats(today).await.unwrap().unwrap();

    sqlx::query("UPDATE metrics_daily_stats SET total_requests = 99, get_requests = 0")
        .execute(&*db)
        .await
        .unwrap();

    let rebuilt = metrics.reconcile_daily(today).await.unwrap();
    assert_eq!(rebuilt.total_requests, 3);
    assert_eq!(rebuilt.get_requests, 3);
    assert_eq!(rebuilt.cache_misses, 1);
    assert_eq!(rebuilt.max_duration_ms, running.max_duration_ms);
    assert!((rebuilt.avg_duration_ms - running.avg_duration_ms).abs() < 1e-9);
}

#[tokio::test]
async fn browse_reports_hits_only_for_complete_prefixes() {
    let h = Harness::new(ScriptedLister::new(vec![page(Vec::new(), None)])).await;
    h.store
        .upsert_objects(PROFILE, BUCKET, &[ObjectRecord::new("a/b.txt", 3)])
        .await
        .unwrap();

    let miss = h.query.browse(PROFILE, BUCKET, "a/").await.unwrap();
    assert!(!miss.fully_indexed);
    assert!(miss.prefix_status.is_none());

    h.store
        .mark_prefix_complete(
            PROFILE,
            BUCKET,
            "",
            PrefixStats {
                objects_count: 1,
                total_size: 3,
            },
        )
        .await
        .unwrap();
    let hit = h.query.browse(PROFILE, BUCKET, "a").await.unwrap();
    assert!(hit.fully_indexed);
    assert_eq!(hit.entries.len(), 1);

    let summary = h.query.prefix_stats(PROFILE, BUCKET, "a/").await.unwrap();
    assert!(summary.fully_indexed);
    assert_eq!(summary.aggregate.total_size, 3);

    h.metrics.flush().await;
    let stats = h
        .metrics
        .daily_stats(Utc::now().date_naive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}
