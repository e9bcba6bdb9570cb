//! Filesystem provider: `<root>/<season>/<round>.json` plus `<root>/<season>/schedule.json`.

use std::io::ErrorKind;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EventSummary, LoadError, RawSession, SessionLoader};
use crate::key::SessionKey;

pub struct DirectorySessionLoader {
    root: PathBuf,
}

impl DirectorySessionLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read(&self, path: PathBuf, not_found: LoadError) -> Result<Vec<u8>, LoadError> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found),
            Err(e) => Err(LoadError::Unavailable(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait::async_trait]
impl SessionLoader for DirectorySessionLoader {
    async fn load(
        &self,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<RawSession, LoadError> {
        let (season, round) = (key.season(), key.round());
        let path = self
            .root
            .join(season.to_string())
            .join(format!("{}.json", round));
        debug!(path = %path.display(), "reading raw session from directory");

        let bytes = self
            .read(path, LoadError::NotFound { season, round })
            .await?;
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| LoadError::Unavailable(format!("malformed session file: {}", e)))
    }

    async fn list_events(&self, season: i32) -> Result<Vec<EventSummary>, LoadError> {
        let path = self.root.join(season.to_string()).join("schedule.json");
        let bytes = self
            .read(path, LoadError::ScheduleNotFound { season })
            .await?;
        let mut events: Vec<EventSummary> = serde_json::from_slice(&bytes)
            .map_err(|e| LoadError::Unavailable(format!("malformed schedule file: {}", e)))?;
        events.sort_by_key(|event| event.round);
        Ok(events)
    }
}
