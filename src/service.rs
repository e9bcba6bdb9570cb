//! Request orchestration: validate, consult the cache, then run or attach.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::codec::{self, CodecError};
use crate::key::{KeyError, KeyParams, SessionKey, DEFAULT_MIN_SEASON};
use crate::payload::TelemetryPayload;
use crate::processor::{ProcessError, TelemetryProcessor};
use crate::progress::{FailureKind, ProgressEvent, ProgressReporter, Subscription};
use crate::registry::{AbandonPolicy, Attachment, InFlightRegistry, RunOwner};
use crate::session::{EventSummary, LoadError, SessionLoader};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Processing(String),
    #[error("run cancelled")]
    Cancelled,
}

impl TelemetryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TelemetryError::Validation(_) => FailureKind::Validation,
            TelemetryError::NotFound(_) => FailureKind::NotFound,
            TelemetryError::Unavailable(_) => FailureKind::Unavailable,
            TelemetryError::Processing(_) => FailureKind::Processing,
            TelemetryError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Rebuilds the error a run failed with from its terminal event.
    pub fn from_failure(kind: FailureKind, message: String) -> Self {
        match kind {
            FailureKind::Validation => TelemetryError::Validation(message),
            FailureKind::NotFound => TelemetryError::NotFound(message),
            FailureKind::Unavailable => TelemetryError::Unavailable(message),
            FailureKind::Processing => TelemetryError::Processing(message),
            FailureKind::Cancelled => TelemetryError::Cancelled,
        }
    }
}

impl From<KeyError> for TelemetryError {
    fn from(e: KeyError) -> Self {
        TelemetryError::Validation(e.to_string())
    }
}

impl From<LoadError> for TelemetryError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::NotFound { .. } | LoadError::ScheduleNotFound { .. } => {
                TelemetryError::NotFound(e.to_string())
            }
            LoadError::Unavailable(_) => TelemetryError::Unavailable(e.to_string()),
            LoadError::Cancelled => TelemetryError::Cancelled,
        }
    }
}

impl From<ProcessError> for TelemetryError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::EmptySession(_) => TelemetryError::Processing(e.to_string()),
            ProcessError::Cancelled => TelemetryError::Cancelled,
        }
    }
}

impl From<CodecError> for TelemetryError {
    fn from(e: CodecError) -> Self {
        TelemetryError::Processing(e.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub min_season: i32,
    /// Applied when a request carries no frame_skip.
    pub default_frame_skip: u32,
    pub abandon_policy: AbandonPolicy,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            min_season: DEFAULT_MIN_SEASON,
            default_frame_skip: 1,
            abandon_policy: AbandonPolicy::default(),
        }
    }
}

/// Per-request switches of the one-shot path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Return the gzip artifact instead of plain JSON.
    pub compress: bool,
    /// Skip the cache lookup and recompute.
    pub refresh: bool,
}

/// Events for one streaming request.
pub enum TelemetryStream {
    /// Served from cache: a single complete event.
    Cached(Option<ProgressEvent>),
    Live(Subscription),
}

impl TelemetryStream {
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        match self {
            TelemetryStream::Cached(event) => event.take(),
            TelemetryStream::Live(subscription) => subscription.recv().await,
        }
    }
}

pub struct TelemetryService {
    loader: Arc<dyn SessionLoader>,
    cache: Arc<dyn CacheStore>,
    registry: Arc<InFlightRegistry>,
    processor: TelemetryProcessor,
    options: ServiceOptions,
}

impl TelemetryService {
    pub fn new(
        loader: Arc<dyn SessionLoader>,
        cache: Arc<dyn CacheStore>,
        options: ServiceOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            loader,
            cache,
            registry: InFlightRegistry::new(options.abandon_policy),
            processor: TelemetryProcessor::new(),
            options,
        })
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Validates request parameters into a key, filling in the default frame skip.
    pub fn key(&self, mut params: KeyParams) -> Result<SessionKey, TelemetryError> {
        if params.frame_skip.is_none() {
            params.frame_skip = Some(i64::from(self.options.default_frame_skip));
        }
        Ok(params.into_key(self.options.min_season)?)
    }

    /// One-shot request: serialized payload, gzip when `options.compress`.
    #[tracing::instrument(
        name = "race_telemetry",
        skip(self, params),
        fields(season = params.season, round = params.round, compress = options.compress)
    )]
    pub async fn fetch(
        self: &Arc<Self>,
        params: KeyParams,
        options: FetchOptions,
    ) -> Result<Bytes, TelemetryError> {
        let key = self.key(params)?;

        if !options.refresh {
            if let Some(artifact) = self.lookup(&key).await {
                match codec::artifact_for_transport(artifact, options.compress) {
                    Ok(body) => {
                        info!(key = %key, bytes = body.len(), "served from cache");
                        return Ok(body);
                    }
                    Err(e) => warn!(key = %key, error = %e, "cached artifact unreadable, recomputing"),
                }
            }
        }

        let subscription = self.attach(&key, options.refresh);
        match subscription.terminal().await {
            Some(ProgressEvent::Complete { data }) => {
                let body = if options.compress {
                    codec::encode_artifact(&data)?
                } else {
                    codec::to_json(&data)?
                };
                Ok(body)
            }
            Some(ProgressEvent::Error { message, kind }) => {
                Err(TelemetryError::from_failure(kind, message))
            }
            _ => Err(TelemetryError::Processing(
                "run ended without a result".to_string(),
            )),
        }
    }

    /// Streaming request. A cache hit yields a single complete event;
    /// otherwise the caller observes the live run for the key.
    pub async fn stream(self: &Arc<Self>, params: KeyParams) -> Result<TelemetryStream, TelemetryError> {
        let key = self.key(params)?;
        if let Some(payload) = self.cached_payload(&key).await {
            info!(key = %key, "streaming from cache");
            return Ok(TelemetryStream::Cached(Some(ProgressEvent::Complete {
                data: payload,
            })));
        }
        Ok(TelemetryStream::Live(self.attach(&key, false)))
    }

    pub async fn list_sessions(&self, season: i64) -> Result<Vec<EventSummary>, TelemetryError> {
        // Same season rules as telemetry requests.
        let key = KeyParams::new(season, 1).into_key(self.options.min_season)?;
        let mut events = self.loader.list_events(key.season()).await?;
        events.sort_by_key(|e| e.round);
        Ok(events)
    }

    fn attach(self: &Arc<Self>, key: &SessionKey, refresh: bool) -> Subscription {
        match self.registry.acquire_or_attach(key) {
            Attachment::Owner(owner, subscription) => {
                tokio::spawn(Arc::clone(self).drive(owner, refresh));
                subscription
            }
            Attachment::Subscriber(subscription) => {
                debug!(key = %key, "joined in-flight run");
                subscription
            }
        }
    }

    async fn lookup(&self, key: &SessionKey) -> Option<Bytes> {
        match self.cache.lookup(key).await {
            Ok(Some(artifact)) => Some(artifact),
            Ok(None) => {
                debug!(key = %key, "cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn cached_payload(&self, key: &SessionKey) -> Option<Arc<TelemetryPayload>> {
        let artifact = self.lookup(key).await?;
        match codec::decode_artifact(&artifact) {
            Ok(payload) => Some(Arc::new(payload)),
            Err(e) => {
                warn!(key = %key, error = %e, "cached artifact unreadable, recomputing");
                None
            }
        }
    }

    #[tracing::instrument(
        name = "telemetry_run",
        skip(self, owner),
        fields(
            season = owner.key().season(),
            round = owner.key().round(),
            frame_skip = owner.key().frame_skip()
        )
    )]
    async fn drive(self: Arc<Self>, owner: RunOwner, refresh: bool) {
        match self.produce(&owner, refresh).await {
            Ok(payload) => {
                info!(frames = payload.frame_count(), "run complete");
                owner.complete(payload);
            }
            Err(e) => {
                match &e {
                    TelemetryError::Unavailable(_) | TelemetryError::NotFound(_) => {
                        warn!(error = %e, "run failed")
                    }
                    TelemetryError::Cancelled => info!("run cancelled"),
                    _ => error!(error = %e, "run failed"),
                }
                owner.fail(e.kind(), e.to_string());
            }
        }
    }

    async fn produce(
        &self,
        owner: &RunOwner,
        refresh: bool,
    ) -> Result<Arc<TelemetryPayload>, TelemetryError> {
        let key = owner.key();

        // Another run may have committed between the caller's miss and our
        // registration.
        if !refresh {
            if let Some(payload) = self.cached_payload(key).await {
                return Ok(payload);
            }
        }

        owner.publish(ProgressEvent::progress(0.0, "Initializing..."));
        owner.publish(ProgressEvent::progress(
            0.0,
            format!(
                "Loading race session for {} Round {}...",
                key.season(),
                key.round()
            ),
        ));

        let cancel = owner.cancel_token();
        let raw = self.loader.load(key, &cancel).await?;
        if cancel.is_cancelled() {
            return Err(TelemetryError::Cancelled);
        }

        let reporter = owner.reporter();
        let processor = self.processor;
        let run_key = key.clone();
        let payload = tokio::task::spawn_blocking(move || {
            let mut on_progress =
                |progress: f64, message: String| reporter.publish(ProgressEvent::progress(progress, message));
            processor.run(&raw, &run_key, &mut on_progress, &cancel)
        })
        .await
        .map_err(|e| TelemetryError::Processing(format!("processing task failed: {}", e)))??;

        let artifact = codec::encode_artifact(&payload)?;
        let size = artifact.len();
        match self.cache.store(key, artifact).await {
            Ok(()) => debug!(key = %key, bytes = size, "artifact cached"),
            // Non-fatal: the requester still gets the computed payload.
            Err(e) => warn!(key = %key, error = %e, "CachePersistFailure"),
        }

        Ok(Arc::new(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_errors_map_to_taxonomy() {
        let not_found: TelemetryError = LoadError::NotFound {
            season: 2023,
            round: 99,
        }
        .into();
        assert_eq!(not_found.kind(), FailureKind::NotFound);
        assert!(not_found.to_string().contains("round 99"));

        let no_schedule: TelemetryError = LoadError::ScheduleNotFound { season: 2019 }.into();
        assert_eq!(no_schedule.kind(), FailureKind::NotFound);
        assert_eq!(no_schedule.to_string(), "no event schedule for season 2019");

        let unavailable: TelemetryError = LoadError::Unavailable("timeout".into()).into();
        assert_eq!(unavailable.kind(), FailureKind::Unavailable);
        assert_eq!(
            TelemetryError::from(LoadError::Cancelled),
            TelemetryError::Cancelled
        );
    }

    #[test]
    fn failure_round_trips_through_terminal_event() {
        let original = TelemetryError::NotFound("session 2023 round 99 not found".into());
        let rebuilt = TelemetryError::from_failure(original.kind(), original.to_string());
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn empty_session_is_processing_fault() {
        let e: TelemetryError = ProcessError::EmptySession("no drivers".into()).into();
        assert_eq!(e.kind(), FailureKind::Processing);
    }
}
