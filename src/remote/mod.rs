//! The remote object-store capability consumed by the sync engine.
//!
//! The engine never talks to a transport directly. It receives a
//! [`RemoteProvider`] that hands out one [`RemoteLister`] per profile, which
//! keeps credentials and client construction outside this crate and lets
//! tests script the remote.

pub mod fs_lister;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{
    bucket_info::{BucketAcl, BucketEncryption, BucketVersioning},
    object::ObjectRecord,
};

pub use fs_lister::FsLister;

/// One page of a paginated remote listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectRecord>,
    pub common_prefixes: Vec<String>,
    /// Opaque cursor for the next page.
    pub next_token: Option<String>,
    pub is_truncated: bool,
}

impl ListPage {
    /// A page is terminal only when it carries no cursor and is not truncated.
    pub fn is_terminal(&self) -> bool {
        self.next_token.is_none() && !self.is_truncated
    }
}

/// Failures reported by a remote capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request throttled: {0}")]
    Throttled(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("bucket `{0}` not found")]
    NoSuchBucket(String),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Timeouts, throttling and network failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Throttled(_) | Self::Network(_)
        )
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Listing and bucket-settings calls against one remote account.
///
/// Implemented by real SDK adapters outside this crate, by [`FsLister`], and
/// by scripted fakes in tests.
#[async_trait]
pub trait RemoteLister: Send + Sync {
    /// Fetch one page of keys under `prefix`, resuming at `continuation_token`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        page_size: i32,
    ) -> RemoteResult<ListPage>;

    async fn get_bucket_acl(&self, bucket: &str) -> RemoteResult<BucketAcl>;

    async fn get_bucket_versioning(&self, bucket: &str) -> RemoteResult<BucketVersioning>;

    async fn get_bucket_encryption(&self, bucket: &str) -> RemoteResult<BucketEncryption>;

    /// Region of the bucket, if the remote exposes one.
    async fn get_bucket_region(&self, _bucket: &str) -> RemoteResult<Option<String>> {
        Ok(None)
    }
}

/// Resolves the remote client for a profile.
pub trait RemoteProvider: Send + Sync {
    fn lister(&self, profile_id: &str) -> RemoteResult<Arc<dyn RemoteLister>>;
}

/// A provider that serves every profile with the same client.
#[derive(Clone)]
pub struct SharedRemote(pub Arc<dyn RemoteLister>);

impl RemoteProvider for SharedRemote {
    fn lister(&self, _profile_id: &str) -> RemoteResult<Arc<dyn RemoteLister>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_requires_no_token_and_no_truncation() {
        let mut page = ListPage::default();
        assert!(page.is_terminal());
        page.is_truncated = true;
        assert!(!page.is_terminal());
        page.is_truncated = false;
        page.next_token = Some("t".into());
        assert!(!page.is_terminal());
    }

    #[test]
    fn classifies_errors() {
        assert!(RemoteError::Throttled("slow down".into()).is_transient());
        assert!(RemoteError::Timeout("30s".into()).is_transient());
        assert!(!RemoteError::AccessDenied("nope".into()).is_transient());
        assert!(RemoteError::AccessDenied("nope".into()).is_permission());
        assert!(!RemoteError::NoSuchBucket("b".into()).is_transient());
    }
}
