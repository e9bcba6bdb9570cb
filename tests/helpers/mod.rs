#![allow(dead_code)] // Test helpers appear unused when compiled independently

use racecast::cache::FsCacheStore;
use racecast::session::{
    EventSummary, LoadError, RawDriver, RawLap, RawSample, RawSession, RawTrackStatus,
    SessionLoader,
};
use racecast::{SessionKey, ServiceOptions, TelemetryService};
use reqwest::Client;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT_ATTEMPTS: usize = 50;
const WAIT_DELAY: Duration = Duration::from_millis(100);

/// In-memory provider that counts loads and can hold them until released.
pub struct StubLoader {
    sessions: HashMap<(i32, u32), RawSession>,
    events: Vec<EventSummary>,
    loads: AtomicUsize,
    gate: Option<Semaphore>,
    stall: Option<Duration>,
    failure: Mutex<Option<LoadError>>,
}

impl StubLoader {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            events: Vec::new(),
            loads: AtomicUsize::new(0),
            gate: None,
            stall: None,
            failure: Mutex::new(None),
        }
    }

    pub fn with_session(mut self, session: RawSession) -> Self {
        self.events.push(EventSummary {
            round: session.round,
            event_name: session.event_name.clone(),
            country: None,
            date: None,
        });
        self.sessions
            .insert((session.season, session.round), session);
        self
    }

    /// Loads block until [`StubLoader::release`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Every load sleeps for `delay` without watching its cancellation token.
    pub fn stalled(mut self, delay: Duration) -> Self {
        self.stall = Some(delay);
        self
    }

    pub fn release(&self, loads: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(loads);
        }
    }

    pub async fn fail_with(&self, error: LoadError) {
        *self.failure.lock().await = Some(error);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SessionLoader for StubLoader {
    async fn load(
        &self,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<RawSession, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => return Err(LoadError::Cancelled),
            }
        }

        if let Some(delay) = self.stall {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.failure.lock().await.clone() {
            return Err(error);
        }

        self.sessions
            .get(&(key.season(), key.round()))
            .cloned()
            .ok_or(LoadError::NotFound {
                season: key.season(),
                round: key.round(),
            })
    }

    async fn list_events(&self, _season: i32) -> Result<Vec<EventSummary>, LoadError> {
        Ok(self.events.clone())
    }
}

/// A synthetic race: every driver has `laps` laps of `samples_per_lap`
/// samples, 5000 m per lap, one sample every 0.25 s.
pub fn race_session(
    season: i32,
    round: u32,
    drivers: &[&str],
    laps: u32,
    samples_per_lap: usize,
) -> RawSession {
    let lap_length = 5000.0;
    let colors = ["#3671C6", "#27F4D2", "#E8002D", "#FF8000"];

    let drivers = drivers
        .iter()
        .enumerate()
        .map(|(i, code)| RawDriver {
            code: code.to_string(),
            number: Some((i + 1).to_string()),
            team_color: Some(colors[i % colors.len()].to_string()),
            laps: (1..=laps)
                .map(|lap| RawLap {
                    lap_number: lap,
                    compound: Some(if lap == 1 { "SOFT" } else { "MEDIUM" }.to_string()),
                    samples: (0..samples_per_lap)
                        .map(|j| {
                            let fraction = j as f64 / samples_per_lap as f64;
                            let index = (lap - 1) as usize * samples_per_lap + j;
                            RawSample {
                                session_time: 3600.0 + index as f64 * 0.25 + i as f64 * 0.05,
                                x: Some(fraction * 1000.0),
                                y: Some(fraction * -500.0),
                                z: Some(12.0),
                                distance: Some(fraction * lap_length),
                                relative_distance: Some(fraction),
                                speed: Some(180.0 + (j % 120) as f64),
                                throttle: Some(if j % 10 == 0 { 0.0 } else { 100.0 }),
                                brake: None,
                                gear: Some(((j % 8) + 1) as i64),
                                drs: Some(if j % 20 == 0 { 12 } else { 0 }),
                            }
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    RawSession {
        event_name: format!("Round {} Grand Prix", round),
        season,
        round,
        total_laps: laps,
        drivers,
        track_status: vec![
            RawTrackStatus {
                time: 3600.0,
                status: "1".to_string(),
                message: Some("AllClear".to_string()),
            },
            RawTrackStatus {
                time: 3610.0,
                status: "2".to_string(),
                message: Some("Yellow".to_string()),
            },
        ],
    }
}

/// The reference race: 2023 round 5 with three drivers.
pub fn miami_2023() -> RawSession {
    let mut session = race_session(2023, 5, &["VER", "PER", "ALO"], 3, 40);
    session.event_name = "Miami Grand Prix".to_string();
    session
}

pub fn service_with(
    loader: Arc<StubLoader>,
    cache_root: &std::path::Path,
    options: ServiceOptions,
) -> Arc<TelemetryService> {
    TelemetryService::new(loader, Arc::new(FsCacheStore::new(cache_root)), options)
}

pub struct TestServer {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    pub base_url: String,
}

impl TestServer {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Serve the racecast router on a free loopback port.
pub async fn spawn_app(service: Arc<TelemetryService>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind app listener");
    let port = listener.local_addr().unwrap().port();
    let app = racecast::build_router(service);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            eprintln!("racecast test server error: {}", err);
        }
    });

    TestServer {
        shutdown_tx,
        handle,
        base_url: format!("http://127.0.0.1:{}", port),
    }
}

/// Best-effort check for whether binding to loopback is permitted in the current sandbox.
pub async fn can_bind_loopback() -> bool {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true, // treat other errors as non-fatal for skipping
    }
}

/// Wait for a server to respond to /health
pub async fn wait_for_health(client: &Client, base_url: &str) {
    poll_until(|| async {
        client
            .get(format!("{}/health", base_url))
            .send()
            .await
            .ok()
            .map(|_| ())
    })
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {} to be healthy", base_url));
}

pub async fn poll_until<T, F, Fut>(mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..WAIT_ATTEMPTS {
        if let Some(result) = f().await {
            return Some(result);
        }
        tokio::time::sleep(WAIT_DELAY).await;
    }
    None
}
