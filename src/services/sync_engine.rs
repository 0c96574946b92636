//! SyncEngine — drives resumable, page-at-a-time indexing jobs.
//!
//! One background task per active job key. Within a job, pages are strictly
//! ordered: the token for page N+1 is only requested after page N has been
//! committed together with that token, so the stored token always describes
//! a fully committed prefix of the remote listing.

use chrono::Utc;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    models::{
        bucket_info::{BucketInfo, BucketSettings},
        job::{JobKey, JobStatus, SyncOptions, SyncProgress},
        metrics::MetricsEvent,
    },
    remote::{ListPage, RemoteError, RemoteLister, RemoteProvider},
    services::{
        entity_store::{EntityStore, PassStart, StoreError},
        job_registry::{Claim, JobHandle, JobLease, JobRegistry},
        metrics_recorder::MetricsRecorder,
    },
};

const MAX_PAGE_SIZE: i32 = 1000;

/// Failures at the sync boundary. Remote errors are classified here once and
/// never leak further as raw transport errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: RemoteError },
    #[error(transparent)]
    PermissionDenied(RemoteError),
    #[error(transparent)]
    Remote(RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        if err.is_permission() {
            Self::PermissionDenied(err)
        } else {
            Self::Remote(err)
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Exponential backoff for transient remote failures within one page fetch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per page, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut backoff = self.base_delay;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2);
            if backoff >= self.max_delay {
                break;
            }
        }
        let backoff = backoff.min(self.max_delay);
        backoff + Duration::from_millis(rand_jitter(backoff))
    }
}

/// Engine-wide defaults; per-trigger [`SyncOptions`] override some of them.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: i32,
    /// Default request budget per job; 0 means unlimited.
    pub max_requests: u32,
    pub retry: RetryPolicy,
    pub bucket_info_ttl: chrono::Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            max_requests: 0,
            retry: RetryPolicy::default(),
            bucket_info_ttl: chrono::Duration::hours(1),
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    store: EntityStore,
    registry: Arc<JobRegistry>,
    remote: Arc<dyn RemoteProvider>,
    metrics: MetricsRecorder,
    settings: SyncSettings,
}

/// How a page fetch ended when it did not fail.
enum Fetched {
    Page(ListPage),
    BudgetExhausted,
    Cancelled,
}

/// Terminal state of one job run.
struct Finish {
    status: JobStatus,
    reason: String,
    error: Option<String>,
}

impl Finish {
    fn new(status: JobStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            error: None,
        }
    }
}

/// Mutable state of a running job.
struct JobRun {
    progress: SyncProgress,
    /// Requests already spent by the pass before this run resumed it.
    pass_requests: i64,
    page_size: i32,
    max_requests: u32,
}

impl JobRun {
    fn persisted_requests(&self) -> i64 {
        self.pass_requests + i64::from(self.progress.requests_made)
    }

    fn budget_exhausted(&self) -> bool {
        self.max_requests > 0 && self.progress.requests_made >= self.max_requests
    }
}

impl SyncEngine {
    pub fn new(
        store: EntityStore,
        remote: Arc<dyn RemoteProvider>,
        metrics: MetricsRecorder,
        settings: SyncSettings,
    ) -> Self {
        Self {
            registry: store.registry().clone(),
            store,
            remote,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Start indexing `key` in the background, or attach to the job already
    /// running for it. The returned handle streams progress and resolves to
    /// the terminal snapshot.
    pub fn trigger_sync(&self, key: JobKey, options: SyncOptions) -> SyncResult<JobHandle> {
        let max_requests = options.max_requests.unwrap_or(self.settings.max_requests);
        let initial = SyncProgress::new(key.clone(), max_requests);

        match self.registry.claim(&key, initial) {
            Claim::Attached(handle) => {
                debug!("sync {} already running; attaching", key);
                Ok(handle)
            }
            Claim::Started(handle, lease) => {
                // The lease must be released even when the profile cannot be
                // resolved, so resolve after claiming and finish on failure.
                let lister = match self.remote.lister(&key.profile_id) {
                    Ok(lister) => lister,
                    Err(err) => {
                        let err = SyncError::from(err);
                        let mut progress = lease.current();
                        progress.status = JobStatus::Failed;
                        progress.error = Some(err.to_string());
                        progress.reason = Some(format!("cannot reach remote: {}", err));
                        lease.finish(progress);
                        return Err(err);
                    }
                };

                let page_size = options
                    .page_size
                    .unwrap_or(self.settings.page_size)
                    .clamp(1, MAX_PAGE_SIZE);
                let engine = self.clone();
                let force = options.force;
                tokio::spawn(async move {
                    engine
                        .run_job(lease, lister, page_size, max_requests, force)
                        .await;
                });
                Ok(handle)
            }
        }
    }

    /// Request cooperative cancellation of the job holding `key`.
    pub fn cancel_sync(&self, key: &JobKey) -> bool {
        let cancelled = self.registry.cancel(key);
        if cancelled {
            info!("sync {} cancellation requested", key);
        }
        cancelled
    }

    /// Handle of the running job for `key`, if any.
    pub fn job(&self, key: &JobKey) -> Option<JobHandle> {
        self.registry.get(key)
    }

    pub fn active_jobs(&self) -> Vec<SyncProgress> {
        self.registry.active()
    }

    /// Cached bucket settings, refreshed from the remote once older than the
    /// configured TTL. A failing settings call keeps the previous value.
    pub async fn bucket_info(&self, profile: &str, bucket: &str) -> SyncResult<BucketInfo> {
        if let Some(info) = self.store.bucket_info(profile, bucket).await?
            && !info.settings_stale(Utc::now(), self.settings.bucket_info_ttl)
        {
            return Ok(info);
        }

        let lister = self.remote.lister(profile)?;
        self.refresh_bucket_info(lister.as_ref(), profile, bucket)
            .await
    }

    async fn refresh_bucket_info(
        &self,
        lister: &dyn RemoteLister,
        profile: &str,
        bucket: &str,
    ) -> SyncResult<BucketInfo> {
        let mut settings = BucketSettings::default();

        let started = Instant::now();
        let region = lister.get_bucket_region(bucket).await;
        self.record_call("GetBucketLocation", profile, bucket, started, &region);
        match region {
            Ok(region) => settings.region = region,
            Err(err) => warn!("region of {}/{} unavailable: {}", profile, bucket, err),
        }

        let started = Instant::now();
        let versioning = lister.get_bucket_versioning(bucket).await;
        self.record_call("GetBucketVersioning", profile, bucket, started, &versioning);
        match versioning {
            Ok(versioning) => settings.versioning = Some(versioning),
            Err(err) => warn!("versioning of {}/{} unavailable: {}", profile, bucket, err),
        }

        let started = Instant::now();
        let encryption = lister.get_bucket_encryption(bucket).await;
        self.record_call("GetBucketEncryption", profile, bucket, started, &encryption);
        match encryption {
            Ok(encryption) => settings.encryption = Some(encryption),
            Err(err) => warn!("encryption of {}/{} unavailable: {}", profile, bucket, err),
        }

        let started = Instant::now();
        let acl = lister.get_bucket_acl(bucket).await;
        self.record_call("GetBucketAcl", profile, bucket, started, &acl);
        match acl {
            Ok(acl) => settings.acl = Some(acl),
            Err(err) => warn!("acl of {}/{} unavailable: {}", profile, bucket, err),
        }

        Ok(self
            .store
            .store_bucket_settings(profile, bucket, &settings)
            .await?)
    }

    async fn run_job(
        self,
        lease: JobLease,
        lister: Arc<dyn RemoteLister>,
        page_size: i32,
        max_requests: u32,
        force: bool,
    ) {
        let key = lease.key().clone();
        let mut run = JobRun {
            progress: lease.current(),
            pass_requests: 0,
            page_size,
            max_requests,
        };
        run.progress.status = JobStatus::Starting;
        lease.publish(run.progress.clone());
        info!(
            "sync {} starting (page size {}, budget {})",
            key, page_size, max_requests
        );

        let finish = match self.drive(&lease, lister.as_ref(), &mut run, force).await {
            Ok(finish) => finish,
            Err(err) => Finish {
                status: JobStatus::Failed,
                reason: format!("sync failed: {}", err),
                error: Some(err.to_string()),
            },
        };

        if finish.status != JobStatus::Completed
            && let Err(err) = self
                .store
                .record_outcome(
                    &key,
                    finish.status,
                    finish.error.as_deref(),
                    run.persisted_requests(),
                )
                .await
        {
            warn!("could not record outcome of {}: {}", key, err);
        }

        let mut progress = run.progress;
        progress.status = finish.status;
        progress.error = finish.error;
        progress.reason = Some(finish.reason);
        info!(
            "sync {} {}: {} objects, {} requests ({})",
            key,
            progress.status,
            progress.objects_indexed,
            progress.requests_made,
            progress.reason.as_deref().unwrap_or_default()
        );
        lease.finish(progress);
    }

    async fn drive(
        &self,
        lease: &JobLease,
        lister: &dyn RemoteLister,
        run: &mut JobRun,
        force: bool,
    ) -> SyncResult<Finish> {
        let key = lease.key();
        let cancel = lease.cancellation();

        let pass = match self.store.begin_pass(key, force).await? {
            PassStart::AlreadyComplete(status) => {
                run.progress.objects_indexed = status.objects_count.max(0) as u64;
                run.progress.is_complete = true;
                return Ok(Finish::new(
                    JobStatus::Completed,
                    "prefix is already fully indexed",
                ));
            }
            PassStart::Ready(pass) => pass,
        };
        if pass.resumed {
            info!("sync {} resuming after {} objects", key, pass.objects_count);
        }

        if let Err(err) = self.bucket_info_for_job(lister, key).await {
            warn!("bucket settings of {} not refreshed: {}", key, err);
        }

        run.pass_requests = pass.requests_made;
        run.progress.objects_indexed = pass.objects_count.max(0) as u64;
        run.progress.status = JobStatus::Indexing;
        lease.publish(run.progress.clone());

        let mut token = pass.token.clone();
        let mut pages = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(Finish::new(
                    JobStatus::Cancelled,
                    format!("cancelled after {} pages", pages),
                ));
            }

            let page = match self
                .fetch_page(lister, key, token.as_deref(), cancel, run)
                .await?
            {
                Fetched::Page(page) => page,
                Fetched::BudgetExhausted => {
                    return Ok(Finish::new(
                        JobStatus::Partial,
                        format!(
                            "request budget of {} exhausted; resume to continue",
                            run.max_requests
                        ),
                    ));
                }
                Fetched::Cancelled => {
                    return Ok(Finish::new(
                        JobStatus::Cancelled,
                        format!("cancelled after {} pages", pages),
                    ));
                }
            };

            if page.is_truncated && page.next_token.is_none() {
                return Err(SyncError::Protocol(
                    "truncated listing page without a continuation token".into(),
                ));
            }
            // A page that arrives after cancellation is discarded uncommitted.
            if cancel.is_cancelled() {
                return Ok(Finish::new(
                    JobStatus::Cancelled,
                    format!("cancelled after {} pages", pages),
                ));
            }

            let commit = self
                .store
                .commit_page(key, &pass, &page, run.persisted_requests())
                .await?;
            pages += 1;
            run.progress.objects_indexed = commit.objects_count.max(0) as u64;
            run.progress.is_complete = commit.is_complete;
            lease.publish(run.progress.clone());
            debug!(
                "sync {} committed page {} ({} keys, {} indexed)",
                key,
                pages,
                page.objects.len(),
                commit.objects_count
            );

            if commit.is_complete {
                let mut reason = format!(
                    "indexed {} objects ({} bytes) in {} pages",
                    commit.objects_count, commit.total_size, pages
                );
                if commit.removed > 0 {
                    reason.push_str(&format!(", removed {} deleted keys", commit.removed));
                }
                return Ok(Finish::new(JobStatus::Completed, reason));
            }
            token = page.next_token;
        }
    }

    /// Refresh stale bucket settings at job start with the job's own client.
    async fn bucket_info_for_job(&self, lister: &dyn RemoteLister, key: &JobKey) -> SyncResult<()> {
        let cached = self
            .store
            .bucket_info(&key.profile_id, &key.bucket_name)
            .await?;
        let stale = cached
            .map(|info| info.settings_stale(Utc::now(), self.settings.bucket_info_ttl))
            .unwrap_or(true);
        if stale {
            self.refresh_bucket_info(lister, &key.profile_id, &key.bucket_name)
                .await?;
        }
        Ok(())
    }

    /// Fetch one page, retrying transient failures with backoff. Every
    /// attempt counts against the request budget.
    async fn fetch_page(
        &self,
        lister: &dyn RemoteLister,
        key: &JobKey,
        token: Option<&str>,
        cancel: &CancellationToken,
        run: &mut JobRun,
    ) -> SyncResult<Fetched> {
        let retry = self.settings.retry;
        let mut attempt = 0;
        loop {
            if run.budget_exhausted() {
                return Ok(Fetched::BudgetExhausted);
            }
            attempt += 1;
            run.progress.requests_made += 1;

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Fetched::Cancelled),
                result = lister.list_page(&key.bucket_name, &key.prefix, token, run.page_size) => result,
            };
            self.record_call(
                "ListObjectsV2",
                &key.profile_id,
                &key.bucket_name,
                started,
                &result,
            );

            match result {
                Ok(page) => return Ok(Fetched::Page(page)),
                Err(err) if err.is_transient() && attempt < retry.max_attempts.max(1) => {
                    let delay = retry.delay(attempt);
                    warn!(
                        "sync {} list attempt {} failed: {}; retrying in {:?}",
                        key, attempt, err, delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(Fetched::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) if err.is_transient() => {
                    return Err(SyncError::RetriesExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn record_call<T>(
        &self,
        operation: &str,
        profile: &str,
        bucket: &str,
        started: Instant,
        result: &Result<T, RemoteError>,
    ) {
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let event = MetricsEvent::new(operation, duration_ms, true).with_bucket(profile, bucket);
        let event = match result {
            Ok(_) => event,
            Err(err) => event.with_error(err.to_string()),
        };
        self.metrics.record_request(event);
    }
}

/// Up to a quarter of `backoff` in extra milliseconds, so concurrent jobs
/// hitting the same throttle do not retry in lockstep.
fn rand_jitter(backoff: Duration) -> u64 {
    use std::time::SystemTime;
    let bound = u64::try_from(backoff.as_millis() / 4).unwrap_or(u64::MAX / 2) + 1;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % bound
}
