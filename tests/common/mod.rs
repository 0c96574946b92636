//! Shared fixtures: a temp-dir SQLite database and a scripted remote.
#![allow(dead_code)]

use async_trait::async_trait;
use bucket_index::{
    db::{connect, run_migrations},
    models::{
        bucket_info::{AclGrant, BucketAcl, BucketEncryption, BucketVersioning},
        object::ObjectRecord,
    },
    remote::{ListPage, RemoteError, RemoteLister, RemoteResult, SharedRemote},
    services::{
        entity_store::EntityStore,
        job_registry::JobRegistry,
        metrics_recorder::MetricsRecorder,
        query_facade::QueryFacade,
        sync_engine::{RetryPolicy, SyncEngine, SyncSettings},
        version_ledger::VersionLedger,
    },
};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Notify;

pub const PROFILE: &str = "p1";
pub const BUCKET: &str = "bucket-a";

/// A migrated database living in its own temp dir.
pub async fn test_db() -> (TempDir, Arc<SqlitePool>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("index.db").display());
    let db = connect(&url).await.unwrap();
    run_migrations(&db).await.unwrap();
    (dir, Arc::new(db))
}

/// Every service wired against one database and one scripted remote.
pub struct Harness {
    pub _dir: TempDir,
    pub db: Arc<SqlitePool>,
    pub store: EntityStore,
    pub ledger: VersionLedger,
    pub metrics: MetricsRecorder,
    pub sync: SyncEngine,
    pub query: QueryFacade,
    pub lister: Arc<ScriptedLister>,
}

impl Harness {
    pub async fn new(lister: ScriptedLister) -> Self {
        Self::with_settings(lister, fast_settings()).await
    }

    pub async fn with_settings(lister: ScriptedLister, settings: SyncSettings) -> Self {
        let (dir, db) = test_db().await;
        let lister = Arc::new(lister);
        let store = EntityStore::new(db.clone(), JobRegistry::new());
        let ledger = VersionLedger::new(store.clone());
        let metrics = MetricsRecorder::spawn(db.clone());
        let remote = Arc::new(SharedRemote(lister.clone()));
        let sync = SyncEngine::new(store.clone(), remote, metrics.clone(), settings);
        let query = QueryFacade::new(store.clone(), ledger.clone(), metrics.clone());
        Self {
            _dir: dir,
            db,
            store,
            ledger,
            metrics,
            sync,
            query,
            lister,
        }
    }

    /// `(key, version_id, size)` of every object row, in key order.
    pub async fn object_rows(&self) -> Vec<(String, Option<String>, i64)> {
        sqlx::query_as(
            "SELECT key, version_id, size FROM objects
             WHERE profile_id = ? AND bucket_name = ? ORDER BY key, version_id",
        )
        .bind(PROFILE)
        .bind(BUCKET)
        .fetch_all(&*self.db)
        .await
        .unwrap()
    }
}

/// Engine settings with millisecond backoff so retry tests stay fast.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..SyncSettings::default()
    }
}

/// `count` objects of `size` bytes each, keyed under `dir`.
pub fn objects(dir: &str, count: usize, size: i64) -> Vec<ObjectRecord> {
    (0..count)
        .map(|i| ObjectRecord::new(format!("{}{:05}.bin", dir, i), size))
        .collect()
}

/// A listing page; truncated whenever it names a next token.
pub fn page(objects: Vec<ObjectRecord>, next: Option<&str>) -> ListPage {
    ListPage {
        objects,
        common_prefixes: Vec::new(),
        next_token: next.map(str::to_string),
        is_truncated: next.is_some(),
    }
}

/// Pages of the given sizes chained by tokens `t1`, `t2`, ... with
/// distinct keys under `data/p{n}/`.
pub fn chained_pages(sizes: &[usize]) -> Vec<ListPage> {
    sizes
        .iter()
        .enumerate()
        .map(|(n, &size)| {
            let next = (n + 1 < sizes.len()).then(|| format!("t{}", n + 1));
            page(objects(&format!("data/p{}/", n), size, 10), next.as_deref())
        })
        .collect()
}

struct Block {
    token: Option<String>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// In-memory remote serving pre-built pages by continuation token.
///
/// The first page answers a `None` token; page N+1 answers the token page N
/// returned. Failures can be queued per token and one fetch can be held open
/// until released.
#[derive(Default)]
pub struct ScriptedLister {
    pages: Mutex<HashMap<Option<String>, ListPage>>,
    failures: Mutex<HashMap<Option<String>, (u32, RemoteError)>>,
    block: Mutex<Option<Block>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
    list_calls: AtomicU32,
    settings_calls: AtomicU32,
}

impl ScriptedLister {
    pub fn new(pages: Vec<ListPage>) -> Self {
        let lister = Self::default();
        lister.set_pages(pages);
        lister
    }

    /// Replace the script, e.g. to simulate remote deletions.
    pub fn set_pages(&self, pages: Vec<ListPage>) {
        let mut map = HashMap::new();
        let mut token = None;
        for page in pages {
            let next = page.next_token.clone();
            map.insert(token, page);
            token = next;
        }
        *self.pages.lock().unwrap() = map;
    }

    /// Fail the next `times` fetches of `token` with `err`.
    pub fn fail(&self, token: Option<&str>, times: u32, err: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .insert(token.map(str::to_string), (times, err));
    }

    /// Hold the next fetch of `token` open. Returns `(entered, release)`:
    /// `entered` fires once the fetch is in flight, `release` lets it finish.
    pub fn block(&self, token: Option<&str>) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.block.lock().unwrap() = Some(Block {
            token: token.map(str::to_string),
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn settings_calls(&self) -> u32 {
        self.settings_calls.load(Ordering::SeqCst)
    }

    /// Tokens of every list call, in call order.
    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens_seen.lock().unwrap().clone()
    }

    pub fn calls_for(&self, token: Option<&str>) -> usize {
        let token = token.map(str::to_string);
        self.tokens_seen
            .lock()
            .unwrap()
            .iter()
            .filter(|t| **t == token)
            .count()
    }
}

#[async_trait]
impl RemoteLister for ScriptedLister {
    async fn list_page(
        &self,
        _bucket: &str,
        _prefix: &str,
        continuation_token: Option<&str>,
        _page_size: i32,
    ) -> RemoteResult<ListPage> {
        let token = continuation_token.map(str::to_string);
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen.lock().unwrap().push(token.clone());

        let held = {
            let mut block = self.block.lock().unwrap();
            if block.as_ref().is_some_and(|b| b.token == token) {
                block.take()
            } else {
                None
            }
        };
        if let Some(held) = held {
            held.entered.notify_one();
            held.release.notified().await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some((remaining, err)) = failures.get_mut(&token)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(err.clone());
            }
        }

        self.pages
            .lock()
            .unwrap()
            .get(&token)
            .cloned()
            .ok_or_else(|| RemoteError::Other(format!("unknown token {:?}", token)))
    }

    async fn get_bucket_acl(&self, _bucket: &str) -> RemoteResult<BucketAcl> {
        self.settings_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BucketAcl {
            owner: Some("owner-1".into()),
            grants: vec![AclGrant {
                grantee: "owner-1".into(),
                permission: "FULL_CONTROL".into(),
            }],
        })
    }

    async fn get_bucket_versioning(&self, _bucket: &str) -> RemoteResult<BucketVersioning> {
        self.settings_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BucketVersioning {
            status: Some("Enabled".into()),
            mfa_delete: None,
        })
    }

    async fn get_bucket_encryption(&self, _bucket: &str) -> RemoteResult<BucketEncryption> {
        self.settings_calls.fetch_add(1, Ordering::SeqCst);
        Err(RemoteError::Unsupported("no default encryption".into()))
    }
}
