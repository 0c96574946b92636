//! Serves a local directory tree as a set of remote buckets.
//!
//! Layout is `root/{bucket}/{key}`: each top-level directory is a bucket and
//! file paths below it are keys. Listings follow ListObjectsV2 rules (key
//! order, prefix filtering, opaque continuation tokens) so the sync engine
//! can index a local tree exactly like a real bucket.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncReadExt};
use tracing::debug;

use super::{ListPage, RemoteError, RemoteLister, RemoteResult};
use crate::models::{
    bucket_info::{AclGrant, BucketAcl, BucketEncryption, BucketVersioning},
    object::ObjectRecord,
};

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MAX_PAGE_SIZE: i32 = 1000;
const LOCAL_OWNER: &str = "local";

/// A key discovered while walking a bucket directory.
#[derive(Debug, Clone)]
struct WalkedEntry {
    key: String,
    path: PathBuf,
    is_folder: bool,
}

#[derive(Debug, Clone)]
pub struct FsLister {
    root: PathBuf,
}

impl FsLister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve and check the directory backing `bucket`.
    async fn bucket_root(&self, bucket: &str) -> RemoteResult<PathBuf> {
        ensure_bucket_name_safe(bucket)?;
        let path = self.root.join(bucket);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(RemoteError::NoSuchBucket(bucket.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(RemoteError::NoSuchBucket(bucket.to_string()))
            }
            Err(err) => Err(map_io_error(err)),
        }
    }

    /// Walk the bucket directory and return every key in lexicographic order.
    ///
    /// Empty directories yield a zero-byte folder marker (`dir/`).
    async fn walk(&self, bucket_root: &Path) -> RemoteResult<Vec<WalkedEntry>> {
        let mut entries = Vec::new();
        let mut pending = vec![(bucket_root.to_path_buf(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut reader = fs::read_dir(&dir).await.map_err(map_io_error)?;
            let mut empty = true;
            while let Some(entry) = reader.next_entry().await.map_err(map_io_error)? {
                empty = false;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    debug!("skipping non UTF-8 path {}", entry.path().display());
                    continue;
                };
                let file_type = entry.file_type().await.map_err(map_io_error)?;
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{}{}/", key_prefix, name)));
                } else if file_type.is_file() {
                    entries.push(WalkedEntry {
                        key: format!("{}{}", key_prefix, name),
                        path: entry.path(),
                        is_folder: false,
                    });
                }
            }
            if empty && !key_prefix.is_empty() {
                entries.push(WalkedEntry {
                    key: key_prefix,
                    path: dir,
                    is_folder: true,
                });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Build the listing record for one walked entry.
    async fn describe(&self, entry: &WalkedEntry) -> RemoteResult<ObjectRecord> {
        let meta = fs::metadata(&entry.path).await.map_err(map_io_error)?;
        let last_modified = meta.modified().ok().map(DateTime::<Utc>::from);

        if entry.is_folder {
            return Ok(ObjectRecord {
                key: entry.key.clone(),
                last_modified,
                owner: Some(LOCAL_OWNER.into()),
                ..ObjectRecord::default()
            });
        }

        Ok(ObjectRecord {
            key: entry.key.clone(),
            size: meta.len() as i64,
            last_modified,
            etag: Some(file_etag(&entry.path).await.map_err(map_io_error)?),
            storage_class: Some("STANDARD".into()),
            owner: Some(LOCAL_OWNER.into()),
            ..ObjectRecord::default()
        })
    }
}

#[async_trait]
impl RemoteLister for FsLister {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        page_size: i32,
    ) -> RemoteResult<ListPage> {
        let bucket_root = self.bucket_root(bucket).await?;
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE) as usize;
        let start_after = continuation_token
            .map(decode_continuation_token)
            .transpose()?;

        let walked = self.walk(&bucket_root).await?;
        let mut candidates = walked
            .into_iter()
            .filter(|e| e.key.starts_with(prefix))
            .filter(|e| start_after.as_deref().is_none_or(|after| e.key.as_str() > after))
            .take(page_size + 1)
            .collect::<Vec<_>>();

        let is_truncated = candidates.len() > page_size;
        if is_truncated {
            candidates.truncate(page_size);
        }

        let mut objects = Vec::with_capacity(candidates.len());
        for entry in &candidates {
            objects.push(self.describe(entry).await?);
        }

        let next_token = if is_truncated {
            candidates.last().map(|e| encode_continuation_token(&e.key))
        } else {
            None
        };

        Ok(ListPage {
            objects,
            common_prefixes: Vec::new(),
            next_token,
            is_truncated,
        })
    }

    async fn get_bucket_acl(&self, bucket: &str) -> RemoteResult<BucketAcl> {
        self.bucket_root(bucket).await?;
        Ok(BucketAcl {
            owner: Some(LOCAL_OWNER.into()),
            grants: vec![AclGrant {
                grantee: LOCAL_OWNER.into(),
                permission: "FULL_CONTROL".into(),
            }],
        })
    }

    async fn get_bucket_versioning(&self, bucket: &str) -> RemoteResult<BucketVersioning> {
        self.bucket_root(bucket).await?;
        Ok(BucketVersioning::default())
    }

    async fn get_bucket_encryption(&self, bucket: &str) -> RemoteResult<BucketEncryption> {
        self.bucket_root(bucket).await?;
        Ok(BucketEncryption::default())
    }

    async fn get_bucket_region(&self, bucket: &str) -> RemoteResult<Option<String>> {
        self.bucket_root(bucket).await?;
        Ok(Some("local".into()))
    }
}

/// Stream a file through MD5 to produce its ETag.
async fn file_etag(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut digest = Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        digest.consume(&buf[..read]);
    }
    Ok(format!("{:x}", digest.compute()))
}

fn map_io_error(err: io::Error) -> RemoteError {
    match err.kind() {
        ErrorKind::PermissionDenied => RemoteError::AccessDenied(err.to_string()),
        ErrorKind::TimedOut => RemoteError::Timeout(err.to_string()),
        ErrorKind::Interrupted | ErrorKind::WouldBlock => RemoteError::Network(err.to_string()),
        _ => RemoteError::Other(err.to_string()),
    }
}

pub(crate) fn encode_continuation_token(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

pub(crate) fn decode_continuation_token(token: &str) -> RemoteResult<String> {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| RemoteError::Other(format!("invalid continuation token `{}`", token)))
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules so a bucket name can never escape `root`:
/// 3–63 characters of lowercase letters, digits, dots and hyphens, starting
/// and ending with a letter or digit, no `..`, not shaped like an IPv4 address.
fn ensure_bucket_name_safe(name: &str) -> RemoteResult<()> {
    let invalid = |reason: &str| {
        Err(RemoteError::Other(format!(
            "bucket `{}` invalid: {}",
            name, reason
        )))
    };

    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return invalid("must start and end with a lowercase letter or digit");
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return invalid("cannot contain consecutive dots or dot-hyphen combinations");
    }
    if is_ipv4_like(name) {
        return invalid("must not be formatted like an IP address");
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seed(dir: &TempDir) {
        let bucket = dir.path().join("bucket-a");
        std::fs::create_dir_all(bucket.join("docs/2025")).unwrap();
        std::fs::create_dir_all(bucket.join("empty")).unwrap();
        std::fs::write(bucket.join("a.txt"), b"hello").unwrap();
        std::fs::write(bucket.join("docs/readme.md"), b"# docs").unwrap();
        std::fs::write(bucket.join("docs/2025/report.pdf"), b"pdf").unwrap();
    }

    #[tokio::test]
    async fn pages_through_keys_in_order() {
        let dir = TempDir::new().unwrap();
        seed(&dir).await;
        let lister = FsLister::new(dir.path());

        let first = lister.list_page("bucket-a", "", None, 2).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt", "docs/2025/report.pdf"]);
        assert!(first.is_truncated);

        let second = lister
            .list_page("bucket-a", "", first.next_token.as_deref(), 2)
            .await
            .unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["docs/readme.md", "empty/"]);
        assert!(second.is_terminal());
    }

    #[tokio::test]
    async fn filters_by_prefix_and_computes_etag() {
        let dir = TempDir::new().unwrap();
        seed(&dir).await;
        let lister = FsLister::new(dir.path());

        let page = lister.list_page("bucket-a", "a", None, 100).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].size, 5);
        assert_eq!(
            page.objects[0].etag.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[tokio::test]
    async fn missing_bucket_is_reported() {
        let dir = TempDir::new().unwrap();
        let lister = FsLister::new(dir.path());
        let err = lister.list_page("nope-bucket", "", None, 10).await.unwrap_err();
        assert_eq!(err, RemoteError::NoSuchBucket("nope-bucket".into()));
    }

    #[test]
    fn rejects_unsafe_bucket_names() {
        assert!(ensure_bucket_name_safe("bucket-a").is_ok());
        assert!(ensure_bucket_name_safe("..").is_err());
        assert!(ensure_bucket_name_safe("Bad_Name").is_err());
        assert!(ensure_bucket_name_safe("192.168.0.1").is_err());
    }

    #[test]
    fn tokens_are_opaque_but_reversible() {
        let token = encode_continuation_token("docs/readme.md");
        assert_ne!(token, "docs/readme.md");
        assert_eq!(decode_continuation_token(&token).unwrap(), "docs/readme.md");
        assert!(decode_continuation_token("%%%").is_err());
    }
}
