//! Registry of active sync jobs.
//!
//! This map (job key → job handle) is the only in-memory shared mutable state
//! of the indexer. A job key is claimed before any work starts, so a second
//! trigger for the same key attaches to the running job instead of paging the
//! remote a second time.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{JobKey, SyncProgress};

/// A caller's view of a running (or finished) job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    pub key: JobKey,
    id: Uuid,
    progress: watch::Receiver<SyncProgress>,
    cancel: CancellationToken,
}

impl JobHandle {
    /// Latest progress snapshot.
    pub fn snapshot(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// A fresh receiver for the progress stream of this job.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    /// Request cooperative cancellation; observed between page fetches.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the job reaches a terminal state and return that snapshot.
    pub async fn wait(&self) -> SyncProgress {
        let mut rx = self.progress.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if current.status.is_terminal() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                // Sender dropped: the last published value is final.
                return rx.borrow().clone();
            }
        }
    }
}

/// Outcome of claiming a job key.
pub enum Claim {
    /// A job for this key is already running; attach to it.
    Attached(JobHandle),
    /// The caller owns the new job and must drive it through the lease.
    Started(JobHandle, JobLease),
}

/// Ownership of a registered job. Publishing goes through the lease and
/// dropping it releases the job key.
pub struct JobLease {
    key: JobKey,
    id: Uuid,
    registry: Arc<JobRegistry>,
    progress: watch::Sender<SyncProgress>,
    cancel: CancellationToken,
}

impl JobLease {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn publish(&self, progress: SyncProgress) {
        self.progress.send_replace(progress);
    }

    pub fn current(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// Release the job key, then publish the terminal snapshot. Anyone who
    /// observes the terminal state can immediately claim the key again.
    pub fn finish(self, progress: SyncProgress) {
        self.registry.release(&self.key, self.id);
        self.progress.send_replace(progress);
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.registry.release(&self.key, self.id);
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobKey, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobKey, JobHandle>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key`, or attach to the job already holding it.
    pub fn claim(self: &Arc<Self>, key: &JobKey, initial: SyncProgress) -> Claim {
        let mut jobs = self.jobs();
        if let Some(existing) = jobs.get(key) {
            return Claim::Attached(existing.clone());
        }

        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let handle = JobHandle {
            key: key.clone(),
            id: Uuid::new_v4(),
            progress: rx,
            cancel: cancel.clone(),
        };
        jobs.insert(key.clone(), handle.clone());

        let lease = JobLease {
            key: key.clone(),
            id: handle.id,
            registry: Arc::clone(self),
            progress: tx,
            cancel,
        };
        Claim::Started(handle, lease)
    }

    fn release(&self, key: &JobKey, id: Uuid) {
        let mut jobs = self.jobs();
        if jobs.get(key).is_some_and(|h| h.id == id) {
            jobs.remove(key);
        }
    }

    pub fn get(&self, key: &JobKey) -> Option<JobHandle> {
        self.jobs().get(key).cloned()
    }

    pub fn is_active(&self, key: &JobKey) -> bool {
        self.jobs().contains_key(key)
    }

    /// Whether an active job covers `key` (same key or an ancestor prefix).
    pub fn is_covered(&self, key: &JobKey) -> bool {
        self.jobs().keys().any(|active| active.covers(key))
    }

    /// Whether an active job overlaps `key` in either direction.
    pub fn overlaps(&self, key: &JobKey) -> bool {
        self.jobs()
            .keys()
            .any(|active| active.covers(key) || key.covers(active))
    }

    /// Cancel the job holding `key`. Returns false when no job is active.
    pub fn cancel(&self, key: &JobKey) -> bool {
        match self.get(key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Progress snapshots of every active job.
    pub fn active(&self) -> Vec<SyncProgress> {
        self.jobs().values().map(JobHandle::snapshot).collect()
    }
}
