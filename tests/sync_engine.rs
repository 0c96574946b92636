mod common;

use bucket_index::{
    models::{
        job::{JobKey, JobStatus, SyncOptions},
        object::ObjectRecord,
    },
    remote::{ListPage, RemoteError},
};
use common::{BUCKET, Harness, PROFILE, ScriptedLister, chained_pages, objects, page};

fn root() -> JobKey {
    JobKey::new(PROFILE, BUCKET, "")
}

#[tokio::test]
async fn three_pages_complete_the_prefix() {
    let h = Harness::new(ScriptedLister::new(chained_pages(&[1000, 1000, 400]))).await;

    let done = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.is_complete);
    assert_eq!(done.objects_indexed, 2400);
    assert_eq!(done.requests_made, 3);
    assert!(done.reason.is_some());

    let status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert_eq!(status.objects_count, 2400);
    assert_eq!(status.total_size, 24_000);
    assert!(status.is_complete);
    assert_eq!(status.continuation_token, None);
    assert_eq!(status.last_status, "completed");

    let info = h.store.bucket_info(PROFILE, BUCKET).await.unwrap().unwrap();
    assert_eq!(info.first_index_objects, 2400);
    assert_eq!(info.first_index_requests, 3);
    assert!(info.first_index_completed_at.is_some());
}

#[tokio::test]
async fn exhausted_retries_fail_and_keep_the_committed_token() {
    let lister = ScriptedLister::new(chained_pages(&[1000, 1000, 400]));
    lister.fail(Some("t1"), u32::MAX, RemoteError::Throttled("slow down".into()));
    let h = Harness::new(lister).await;

    let done = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("slow down"));
    assert_eq!(h.lister.calls_for(Some("t1")), 5);

    let status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert_eq!(status.objects_count, 1000);
    assert_eq!(status.continuation_token.as_deref(), Some("t1"));
    assert!(!status.is_complete);
    assert_eq!(status.last_status, "failed");
    assert_eq!(h.object_rows().await.len(), 1000);
}

#[tokio::test]
async fn transient_failures_are_retried_within_the_page() {
    let lister = ScriptedLister::new(chained_pages(&[5, 5]));
    lister.fail(Some("t1"), 2, RemoteError::Timeout("30s".into()));
    let h = Harness::new(lister).await;

    let done = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.objects_indexed, 10);
    assert_eq!(done.requests_made, 4);
    assert_eq!(h.lister.calls_for(Some("t1")), 3);
}

#[tokio::test]
async fn cancellation_mid_fetch_keeps_committed_pages_and_resumes() {
    let h = Harness::new(ScriptedLister::new(chained_pages(&[1000, 1000, 400]))).await;
    let (entered, _release) = h.lister.block(Some("t2"));

    let handle = h.sync.trigger_sync(root(), SyncOptions::default()).unwrap();
    entered.notified().await;
    assert!(h.sync.cancel_sync(&root()));
    let done = handle.wait().await;

    assert_eq!(done.status, JobStatus::Cancelled);
    assert!(!done.is_complete);
    let status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert_eq!(status.objects_count, 2000);
    assert_eq!(status.continuation_token.as_deref(), Some("t2"));
    assert_eq!(status.last_status, "cancelled");
    assert_eq!(h.object_rows().await.len(), 2000);

    let resumed = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.objects_indexed, 2400);
    assert_eq!(
        h.lister.tokens_seen(),
        vec![None, Some("t1".into()), Some("t2".into()), Some("t2".into())]
    );
}

#[tokio::test]
async fn concurrent_triggers_attach_to_one_job() {
    let h = Harness::new(ScriptedLister::new(chained_pages(&[10, 10]))).await;
    let (entered, release) = h.lister.block(None);

    let first = h.sync.trigger_sync(root(), SyncOptions::default()).unwrap();
    entered.notified().await;
    let second = h.sync.trigger_sync(root(), SyncOptions::default()).unwrap();
    assert_eq!(h.sync.active_jobs().len(), 1);

    release.notify_one();
    let (a, b) = tokio::join!(first.wait(), second.wait());

    assert_eq!(a, b);
    assert_eq!(a.status, JobStatus::Completed);
    assert_eq!(h.lister.calls_for(None), 1);
    assert_eq!(h.lister.list_calls(), 2);
    assert!(h.sync.active_jobs().is_empty());
}

#[tokio::test]
async fn budget_exhaustion_is_partial_and_resumable() {
    let h = Harness::new(ScriptedLister::new(chained_pages(&[10, 10, 10]))).await;

    let partial = h
        .sync
        .trigger_sync(
            root(),
            SyncOptions {
                max_requests: Some(2),
                ..SyncOptions::default()
            },
        )
        .unwrap()
        .wait()
        .await;
    assert_eq!(partial.status, JobStatus::Partial);
    assert_eq!(partial.requests_made, 2);
    assert_eq!(partial.objects_indexed, 20);
    assert!(partial.error.is_none());

    let status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert_eq!(status.continuation_token.as_deref(), Some("t2"));
    assert_eq!(status.last_status, "partial");

    let resumed = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.objects_indexed, 30);
    assert_eq!(resumed.requests_made, 1);

    let status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert_eq!(status.requests_made, 3);
}

#[tokio::test]
async fn resumed_sync_matches_uninterrupted_sync() {
    let pages = chained_pages(&[7, 7, 7, 3]);

    let interrupted = Harness::new(ScriptedLister::new(pages.clone())).await;
    interrupted
        .sync
        .trigger_sync(
            root(),
            SyncOptions {
                max_requests: Some(1),
                ..SyncOptions::default()
            },
        )
        .unwrap()
        .wait()
        .await;
    interrupted
        .lister
        .fail(Some("t2"), u32::MAX, RemoteError::Network("reset".into()));
    let failed = interrupted
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(failed.status, JobStatus::Failed);
    interrupted
        .lister
        .fail(Some("t2"), 0, RemoteError::Network("reset".into()));
    let done = interrupted
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(done.status, JobStatus::Completed);

    let straight = Harness::new(ScriptedLister::new(pages)).await;
    straight
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(interrupted.object_rows().await, straight.object_rows().await);
    let a = interrupted.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    let b = straight.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert_eq!((a.objects_count, a.total_size), (b.objects_count, b.total_size));
    assert_eq!(a.objects_count, 24);
}

#[tokio::test]
async fn resumed_pass_reconciles_stale_rows_and_keeps_committed_ones() {
    let h = Harness::new(ScriptedLister::new(chained_pages(&[4, 4, 4]))).await;
    h.sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(h.object_rows().await.len(), 12);

    // The remote lost every key under data/p1/.
    h.lister.set_pages(vec![
        page(objects("data/p0/", 4, 10), Some("t1")),
        page(objects("data/p2/", 4, 10), None),
    ]);
    let partial = h
        .sync
        .trigger_sync(
            root(),
            SyncOptions {
                max_requests: Some(1),
                force: true,
                ..SyncOptions::default()
            },
        )
        .unwrap()
        .wait()
        .await;
    assert_eq!(partial.status, JobStatus::Partial);
    // Nothing is reconciled before the pass reaches its last page.
    assert_eq!(h.object_rows().await.len(), 12);

    let resumed = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.objects_indexed, 8);
    assert!(resumed.reason.unwrap().contains("removed 4 deleted keys"));

    let rows = h.object_rows().await;
    assert_eq!(rows.len(), 8);
    assert_eq!(rows.iter().filter(|r| r.0.starts_with("data/p0/")).count(), 4);
    assert!(rows.iter().all(|r| !r.0.starts_with("data/p1/")));
}

#[tokio::test]
async fn delimited_pass_leaves_unlisted_subtrees_alone() {
    let h = Harness::new(ScriptedLister::new(vec![page(objects("logs/", 3, 5), None)])).await;
    let logs = h
        .sync
        .trigger_sync(JobKey::new(PROFILE, BUCKET, "logs/"), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(logs.status, JobStatus::Completed);
    h.store
        .upsert_objects(PROFILE, BUCKET, &[ObjectRecord::new("tmp/x.bin", 2)])
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    // One level of the root: `logs/` is still there, `tmp/` is gone.
    h.lister.set_pages(vec![ListPage {
        objects: vec![ObjectRecord::new("a.txt", 7)],
        common_prefixes: vec!["logs/".into()],
        next_token: None,
        is_truncated: false,
    }]);
    let done = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.objects_indexed, 1);
    assert!(done.reason.unwrap().contains("removed 1 deleted keys"));

    let rows = h.object_rows().await;
    assert_eq!(rows.iter().filter(|r| r.0.starts_with("logs/0")).count(), 3);
    assert!(rows.iter().any(|r| r.0 == "logs/"));
    assert!(rows.iter().all(|r| !r.0.starts_with("tmp/")));

    let status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert!(status.is_complete);
    assert!(status.is_delimited);
    assert_eq!((status.objects_count, status.total_size), (1, 7));

    let nested = h.query.browse(PROFILE, BUCKET, "logs/").await.unwrap();
    assert!(nested.fully_indexed);
    assert_eq!(nested.entries.len(), 3);
    assert!(h.query.browse(PROFILE, BUCKET, "").await.unwrap().fully_indexed);

    // Recursive totals of the root were never listed in one pass.
    assert!(!h.query.prefix_stats(PROFILE, BUCKET, "").await.unwrap().fully_indexed);
    assert!(h.query.prefix_stats(PROFILE, BUCKET, "logs/").await.unwrap().fully_indexed);
}

#[tokio::test]
async fn permission_denied_fails_without_retry() {
    let lister = ScriptedLister::new(chained_pages(&[3]));
    lister.fail(None, u32::MAX, RemoteError::AccessDenied("list forbidden".into()));
    let h = Harness::new(lister).await;

    let done = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("access denied: list forbidden"));
    assert_eq!(h.lister.list_calls(), 1);
}

#[tokio::test]
async fn truncated_page_without_token_is_a_protocol_failure() {
    let mut broken = page(objects("b/", 2, 1), None);
    broken.is_truncated = true;
    let h = Harness::new(ScriptedLister::new(vec![
        page(objects("a/", 2, 1), Some("t1")),
        broken,
    ]))
    .await;

    let done = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.unwrap().contains("protocol"));
    let status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap().unwrap();
    assert_eq!(status.continuation_token.as_deref(), Some("t1"));
    assert_eq!(status.objects_count, 2);
}

#[tokio::test]
async fn empty_listing_completes() {
    let h = Harness::new(ScriptedLister::new(vec![page(Vec::new(), None)])).await;

    let done = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.is_complete);
    assert_eq!(done.objects_indexed, 0);
}

#[tokio::test]
async fn complete_prefix_is_not_relisted_unless_forced() {
    let h = Harness::new(ScriptedLister::new(chained_pages(&[4, 4]))).await;
    h.sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(h.lister.list_calls(), 2);

    let again = h
        .sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    assert_eq!(again.status, JobStatus::Completed);
    assert_eq!(again.requests_made, 0);
    assert_eq!(again.objects_indexed, 8);
    assert_eq!(h.lister.list_calls(), 2);

    // The remote lost every key of the second page.
    h.lister.set_pages(vec![page(objects("data/p0/", 4, 10), None)]);
    let forced = h
        .sync
        .trigger_sync(
            root(),
            SyncOptions {
                force: true,
                ..SyncOptions::default()
            },
        )
        .unwrap()
        .wait()
        .await;
    assert_eq!(forced.status, JobStatus::Completed);
    assert_eq!(forced.objects_indexed, 4);
    assert_eq!(h.lister.list_calls(), 3);
    assert_eq!(h.object_rows().await.len(), 4);
}

#[tokio::test]
async fn list_calls_are_recorded_as_metrics() {
    let lister = ScriptedLister::new(chained_pages(&[2, 2]));
    lister.fail(Some("t1"), 1, RemoteError::Throttled("slow".into()));
    let h = Harness::new(lister).await;

    h.sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    h.metrics.flush().await;

    let today = chrono::Utc::now().date_naive();
    let stats = h.metrics.daily_stats(today).await.unwrap().unwrap();
    assert_eq!(stats.list_requests, 3);
    // Region, versioning, encryption and acl lookups at job start.
    assert_eq!(stats.total_requests, 7);
    // One throttled list call plus the unsupported encryption lookup.
    assert_eq!(stats.error_count, 2);
}

#[tokio::test]
async fn bucket_settings_are_cached_within_ttl() {
    let h = Harness::new(ScriptedLister::new(chained_pages(&[1]))).await;
    h.sync
        .trigger_sync(root(), SyncOptions::default())
        .unwrap()
        .wait()
        .await;
    let calls = h.lister.settings_calls();
    assert_eq!(calls, 3);

    let info = h.sync.bucket_info(PROFILE, BUCKET).await.unwrap();
    assert!(info.versioning_enabled());
    assert_eq!(info.acl().unwrap().owner.as_deref(), Some("owner-1"));
    assert_eq!(info.encryption_algorithm, None);
    assert!(info.settings_cached_at.is_some());
    assert_eq!(h.lister.settings_calls(), calls);
}

#[tokio::test]
async fn nested_prefix_job_only_touches_its_prefix() {
    let h = Harness::new(ScriptedLister::new(vec![page(objects("logs/", 3, 5), None)])).await;
    h.store
        .upsert_objects(PROFILE, BUCKET, &objects("img/", 2, 1))
        .await
        .unwrap();

    let done = h
        .sync
        .trigger_sync(JobKey::new(PROFILE, BUCKET, "logs/"), SyncOptions::default())
        .unwrap()
        .wait()
        .await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.objects_indexed, 3);
    assert_eq!(h.object_rows().await.len(), 5);
    let root_status = h.store.prefix_status(PROFILE, BUCKET, "").await.unwrap();
    assert!(root_status.is_none());
}
