use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{CacheError, CacheStore, EntryInfo};
use crate::key::SessionKey;

/// Stores each artifact at `<root>/<SessionKey::storage_path>`.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl FsCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.storage_path())
    }

    /// All regular files under the root, relative to it.
    async fn walk(&self) -> Result<Vec<(PathBuf, std::fs::Metadata)>, CacheError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(&dir, e))?
            {
                let path = entry.path();
                let metadata = entry.metadata().await.map_err(|e| io_error(&path, e))?;
                if metadata.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.push((relative.to_path_buf(), metadata));
                }
            }
        }
        Ok(files)
    }
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl CacheStore for FsCacheStore {
    async fn lookup(&self, key: &SessionKey) -> Result<Option<Bytes>, CacheError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn store(&self, key: &SessionKey, bytes: Bytes) -> Result<(), CacheError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        // Readers never observe a partially written artifact.
        let tmp = path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(&path, e));
        }

        debug!(path = %path.display(), bytes = bytes.len(), "artifact stored");
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, CacheError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn list_entries(&self) -> Result<Vec<EntryInfo>, CacheError> {
        let mut entries: Vec<EntryInfo> = self
            .walk()
            .await?
            .into_iter()
            .filter_map(|(relative, metadata)| {
                SessionKey::from_storage_path(&relative).map(|key| EntryInfo {
                    key,
                    size: metadata.len(),
                    created_at: modified_at(&metadata),
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.key.season(), a.key.round(), a.key.frame_skip())
                .cmp(&(b.key.season(), b.key.round(), b.key.frame_skip()))
                .then_with(|| a.key.drivers().cmp(&b.key.drivers()))
        });
        Ok(entries)
    }
}
