use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::key::KeyParams;
use crate::progress::ProgressEvent;
use crate::service::{FetchOptions, TelemetryError, TelemetryService};
use crate::session::EventSummary;

/// Initialize the tracing subscriber, writing to stderr so command output on
/// stdout stays clean. Uses RUST_LOG env var for filtering (defaults to info).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_writer(std::io::stderr))
            .init();
    }
}

pub fn build_router(service: Arc<TelemetryService>) -> Router {
    Router::new()
        .route("/f1/race-telemetry", post(race_telemetry_post))
        .route("/f1/race-telemetry/:season/:round", get(race_telemetry_get))
        .route("/f1/process-telemetry/:season/:round", get(process_telemetry))
        .route("/f1/sessions/:season", get(sessions))
        .route("/health", get(|| async { "ok" }))
        .with_state(service)
}

/// Serves until Ctrl+C.
pub async fn serve(listener: TcpListener, service: Arc<TelemetryService>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "racecast listening");
    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
}

impl IntoResponse for TelemetryError {
    fn into_response(self) -> Response {
        let status = match &self {
            TelemetryError::Validation(_) => StatusCode::BAD_REQUEST,
            TelemetryError::NotFound(_) => StatusCode::NOT_FOUND,
            TelemetryError::Unavailable(_) | TelemetryError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TelemetryError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct TelemetryQuery {
    drivers: Option<String>,
    frame_skip: Option<i64>,
    compress: Option<bool>,
    refresh: Option<bool>,
}

impl TelemetryQuery {
    fn params(&self, season: i64, round: i64) -> KeyParams {
        KeyParams {
            season,
            round,
            drivers: self
                .drivers
                .as_deref()
                .map(|csv| csv.split(',').map(str::to_string).collect()),
            frame_skip: self.frame_skip,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelemetryRequest {
    #[serde(flatten)]
    params: KeyParams,
    #[serde(default)]
    compress: Option<bool>,
    #[serde(default)]
    refresh: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    season: i64,
    events: Vec<EventSummary>,
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|enc| {
            enc.split(';')
                .next()
                .is_some_and(|name| name.trim().eq_ignore_ascii_case("gzip"))
        })
}

fn validation<E: ToString>(message: E) -> TelemetryError {
    TelemetryError::Validation(message.to_string())
}

async fn one_shot(
    service: Arc<TelemetryService>,
    params: KeyParams,
    compress: Option<bool>,
    refresh: Option<bool>,
    headers: &HeaderMap,
) -> Result<Response, TelemetryError> {
    let options = FetchOptions {
        compress: compress.unwrap_or_else(|| accepts_gzip(headers)),
        refresh: refresh.unwrap_or(false),
    };
    let body = service.fetch(params, options).await?;

    let mut response = Response::new(Body::from(body));
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if options.compress {
        response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    Ok(response)
}

async fn race_telemetry_get(
    State(service): State<Arc<TelemetryService>>,
    path: Result<Path<(i64, i64)>, PathRejection>,
    query: Result<Query<TelemetryQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Response, TelemetryError> {
    let Path((season, round)) = path.map_err(validation)?;
    let Query(query) = query.map_err(validation)?;
    one_shot(
        service,
        query.params(season, round),
        query.compress,
        query.refresh,
        &headers,
    )
    .await
}

async fn race_telemetry_post(
    State(service): State<Arc<TelemetryService>>,
    headers: HeaderMap,
    body: Result<Json<TelemetryRequest>, JsonRejection>,
) -> Result<Response, TelemetryError> {
    let Json(request) = body.map_err(validation)?;
    one_shot(
        service,
        request.params,
        request.compress,
        request.refresh,
        &headers,
    )
    .await
}

async fn sessions(
    State(service): State<Arc<TelemetryService>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<SessionsResponse>, TelemetryError> {
    let Path(season) = path.map_err(validation)?;
    let events = service.list_sessions(season).await?;
    Ok(Json(SessionsResponse { season, events }))
}

async fn process_telemetry(
    State(service): State<Arc<TelemetryService>>,
    path: Result<Path<(i64, i64)>, PathRejection>,
    query: Result<Query<TelemetryQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    let params = match (path, query) {
        (Ok(Path((season, round))), Ok(Query(query))) => Ok(query.params(season, round)),
        (Err(e), _) => Err(validation(e)),
        (_, Err(e)) => Err(validation(e)),
    };
    ws.on_upgrade(move |socket| stream_run(socket, service, params))
}

type WsSender = futures::stream::SplitSink<WebSocket, Message>;

async fn send_event(sender: &mut WsSender, event: &ProgressEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize progress event");
            false
        }
    }
}

/// Relays a run's events as text frames. Closes after the terminal frame or
/// when the client goes away, which detaches this subscriber from the run.
async fn stream_run(
    socket: WebSocket,
    service: Arc<TelemetryService>,
    params: Result<KeyParams, TelemetryError>,
) {
    let (mut sender, mut receiver) = socket.split();

    let stream = match params {
        Ok(params) => service.stream(params).await,
        Err(e) => Err(e),
    };
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let event = ProgressEvent::failure(e.kind(), e.to_string());
            send_event(&mut sender, &event).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                let terminal = event.is_terminal();
                if !send_event(&mut sender, &event).await {
                    debug!("websocket send failed, detaching");
                    return;
                }
                if terminal {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    debug!("client disconnected");
                    return;
                }
                // Anything else from the client is ignored.
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
