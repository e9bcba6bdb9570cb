//! Content-addressed artifact cache.

mod fs;

pub use fs::FsCacheStore;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::key::SessionKey;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Listing item for retention tooling. Carries no artifact bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub key: SessionKey,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` on a miss; errors only on storage faults.
    async fn lookup(&self, key: &SessionKey) -> Result<Option<Bytes>, CacheError>;

    /// Overwrites any existing entry. Last writer wins.
    async fn store(&self, key: &SessionKey, bytes: Bytes) -> Result<(), CacheError>;

    /// Returns whether an entry existed.
    async fn delete(&self, key: &SessionKey) -> Result<bool, CacheError>;

    async fn list_entries(&self) -> Result<Vec<EntryInfo>, CacheError>;

    async fn list_keys(&self) -> Result<Vec<SessionKey>, CacheError> {
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .map(|info| info.key)
            .collect())
    }
}
