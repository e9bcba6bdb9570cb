//! HTTP provider adapter with an optional on-disk raw response cache.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{with_retry, RetryConfig};
use super::{EventSummary, LoadError, RawSession, SessionLoader};
use crate::key::SessionKey;

#[derive(Debug, Clone)]
pub struct HttpSessionLoaderConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryConfig,
    /// Directory for raw provider responses. `None` disables the raw cache.
    pub raw_cache_dir: Option<PathBuf>,
}

impl HttpSessionLoaderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::exponential(3, 250, 5_000),
            raw_cache_dir: None,
        }
    }
}

pub struct HttpSessionLoader {
    client: Client,
    config: HttpSessionLoaderConfig,
}

impl HttpSessionLoader {
    /// Returns an error if the HTTP client fails to build (e.g., TLS configuration issues).
    pub fn new(config: HttpSessionLoaderConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn raw_cache_path(&self, season: i32, round: u32) -> Option<PathBuf> {
        self.config
            .raw_cache_dir
            .as_ref()
            .map(|dir| dir.join(season.to_string()).join(format!("{}.json", round)))
    }

    async fn read_raw_cache(&self, season: i32, round: u32) -> Option<RawSession> {
        let path = self.raw_cache_path(season, round)?;
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(raw) => {
                debug!(path = %path.display(), "raw session served from provider cache");
                Some(raw)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable raw cache entry");
                None
            }
        }
    }

    async fn write_raw_cache(&self, season: i32, round: u32, raw: &RawSession) {
        let Some(path) = self.raw_cache_path(season, round) else {
            return;
        };
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = serde_json::to_vec(raw)?;
            tokio::fs::write(&path, bytes).await?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to write raw provider cache");
        }
    }

    /// GET with retry. `not_found` builds the error for a 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
        not_found: impl Fn() -> LoadError,
    ) -> Result<T, LoadError> {
        let url = self.url(path);
        let result = with_retry(&self.config.retry, cancel, || async {
            let request = self.client.get(&url).send();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                response = request => response.map_err(|e| {
                    if e.is_timeout() {
                        LoadError::Unavailable(format!("request to {} timed out", url))
                    } else {
                        LoadError::Unavailable(format!("network error: {}", e))
                    }
                })?,
            };

            match response.status() {
                status if status.is_success() => {}
                StatusCode::NOT_FOUND => return Err(not_found()),
                status => {
                    warn!(url = %url, status = status.as_u16(), "provider returned error status");
                    return Err(LoadError::Unavailable(format!(
                        "HTTP {} from {}",
                        status.as_u16(),
                        url
                    )));
                }
            }

            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                body = response.bytes() => body
                    .map_err(|e| LoadError::Unavailable(format!("failed to read body: {}", e)))?,
            };
            serde_json::from_slice(&body)
                .map_err(|e| LoadError::Unavailable(format!("undecodable provider response: {}", e)))
        })
        .await;

        match result {
            Err(_) if cancel.is_cancelled() => Err(LoadError::Cancelled),
            other => other,
        }
    }
}

#[async_trait::async_trait]
impl SessionLoader for HttpSessionLoader {
    #[tracing::instrument(
        name = "provider_load",
        skip(self, key, cancel),
        fields(season = key.season(), round = key.round())
    )]
    async fn load(
        &self,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<RawSession, LoadError> {
        let (season, round) = (key.season(), key.round());
        if let Some(raw) = self.read_raw_cache(season, round).await {
            return Ok(raw);
        }
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let raw: RawSession = self
            .get_json(&format!("sessions/{}/{}", season, round), cancel, || {
                LoadError::NotFound { season, round }
            })
            .await?;
        info!(
            drivers = raw.drivers.len(),
            event = %raw.event_name,
            "raw session fetched from provider"
        );

        self.write_raw_cache(season, round, &raw).await;
        Ok(raw)
    }

    async fn list_events(&self, season: i32) -> Result<Vec<EventSummary>, LoadError> {
        let mut events: Vec<EventSummary> = self
            .get_json(
                &format!("schedule/{}", season),
                &CancellationToken::new(),
                || LoadError::ScheduleNotFound { season },
            )
            .await?;
        events.sort_by_key(|event| event.round);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let loader =
            HttpSessionLoader::new(HttpSessionLoaderConfig::new("http://provider:9000/")).unwrap();
        assert_eq!(
            loader.url("sessions/2023/5"),
            "http://provider:9000/sessions/2023/5"
        );
    }

    #[test]
    fn raw_cache_path_uses_season_and_round() {
        let mut config = HttpSessionLoaderConfig::new("http://provider");
        config.raw_cache_dir = Some(PathBuf::from("/tmp/raw"));
        let loader = HttpSessionLoader::new(config).unwrap();
        assert_eq!(
            loader.raw_cache_path(2023, 5),
            Some(PathBuf::from("/tmp/raw/2023/5.json"))
        );
    }

    #[tokio::test]
    async fn raw_cache_round_trips_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HttpSessionLoaderConfig::new("http://127.0.0.1:9");
        config.raw_cache_dir = Some(dir.path().to_path_buf());
        let loader = HttpSessionLoader::new(config).unwrap();

        let raw = RawSession {
            event_name: "Miami Grand Prix".into(),
            season: 2023,
            round: 5,
            total_laps: 57,
            ..Default::default()
        };
        loader.write_raw_cache(2023, 5, &raw).await;
        assert_eq!(loader.read_raw_cache(2023, 5).await, Some(raw));
        assert_eq!(loader.read_raw_cache(2023, 6).await, None);
    }
}
