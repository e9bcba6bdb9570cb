//! Progress protocol and per-run event fan-out.
//!
//! A [`RunChannel`] is the delivery side of one in-flight run. Producers call
//! [`ProgressReporter::publish`]; each attached [`Subscription`] receives the
//! events in publication order over its own unbounded queue, so a slow
//! transport never blocks the pipeline.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::key::SessionKey;
use crate::payload::TelemetryPayload;

/// Wire form: `{"type":"progress","progress":..,"message":..}`,
/// `{"type":"complete","data":..}` or `{"type":"error","message":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress { progress: f64, message: String },
    Complete { data: Arc<TelemetryPayload> },
    Error {
        message: String,
        /// In-process classification; not part of the wire format.
        #[serde(skip)]
        kind: FailureKind,
    },
}

/// Why a run failed, so one-shot callers attached to someone else's run can
/// still map the failure to the right status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    NotFound,
    Unavailable,
    #[default]
    Processing,
    Cancelled,
}

impl ProgressEvent {
    pub fn progress(progress: f64, message: impl Into<String>) -> Self {
        ProgressEvent::Progress {
            progress,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Processing, message)
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

/// Sink for a run's events, independent of the transport carrying them.
pub trait ProgressReporter: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Completed,
    Failed,
}

struct ChannelState {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<ProgressEvent>)>,
    progress: f64,
    message: String,
    terminal: Option<ProgressEvent>,
}

pub struct RunChannel {
    key: SessionKey,
    state: Mutex<ChannelState>,
    cancel: CancellationToken,
    cancel_when_abandoned: bool,
}

impl RunChannel {
    pub fn new(key: SessionKey, cancel_when_abandoned: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(ChannelState {
                next_id: 0,
                subscribers: Vec::new(),
                progress: 0.0,
                message: "Queued".to_string(),
                terminal: None,
            }),
            cancel: CancellationToken::new(),
            cancel_when_abandoned,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Fires when the run is abandoned under the cancel policy.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn phase(&self) -> RunPhase {
        match &self.state.lock().terminal {
            None => RunPhase::Running,
            Some(ProgressEvent::Complete { .. }) => RunPhase::Completed,
            Some(_) => RunPhase::Failed,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Attaches a subscriber. It first receives a synthetic progress event with
    /// the current percentage, or only the terminal event if the run is over.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        match &state.terminal {
            Some(terminal) => {
                let _ = tx.send(terminal.clone());
            }
            None => {
                let snapshot = ProgressEvent::progress(state.progress, state.message.clone());
                if tx.send(snapshot).is_ok() {
                    state.subscribers.push((id, tx));
                }
            }
        }

        Subscription {
            id,
            rx,
            channel: Arc::clone(self),
        }
    }

    fn detach(&self, id: u64) {
        let abandoned = {
            let mut state = self.state.lock();
            let before = state.subscribers.len();
            state.subscribers.retain(|(sid, _)| *sid != id);
            before > 0 && state.subscribers.is_empty() && state.terminal.is_none()
        };
        if abandoned {
            self.on_abandoned();
        }
    }

    fn on_abandoned(&self) {
        if self.cancel_when_abandoned {
            info!(key = %self.key, "all subscribers left, cancelling run");
            self.cancel.cancel();
        } else {
            info!(key = %self.key, "all subscribers left, run continues to populate cache");
        }
    }
}

impl ProgressReporter for RunChannel {
    fn publish(&self, event: ProgressEvent) {
        let abandoned = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                debug!(key = %self.key, "event after terminal dropped");
                return;
            }

            let event = match event {
                ProgressEvent::Progress { progress, message } => {
                    let progress = if progress.is_finite() {
                        progress.clamp(state.progress, 100.0)
                    } else {
                        state.progress
                    };
                    state.progress = progress;
                    state.message = message.clone();
                    ProgressEvent::Progress { progress, message }
                }
                terminal => {
                    state.terminal = Some(terminal.clone());
                    terminal
                }
            };

            let had_subscribers = !state.subscribers.is_empty();
            // Broken transports are detached silently.
            state
                .subscribers
                .retain(|(_, tx)| tx.send(event.clone()).is_ok());

            if event.is_terminal() {
                // Dropping the senders ends every subscriber stream.
                state.subscribers.clear();
                false
            } else {
                had_subscribers && state.subscribers.is_empty()
            }
        };
        if abandoned {
            self.on_abandoned();
        }
    }
}

/// One attached receiver of a run's events. Dropping it detaches.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    channel: Arc<RunChannel>,
}

impl Subscription {
    pub fn key(&self) -> &SessionKey {
        self.channel.key()
    }

    /// Next event; `None` once the terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Skips progress events and returns the terminal one.
    pub async fn terminal(mut self) -> Option<ProgressEvent> {
        while let Some(event) = self.recv().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.detach(self.id);
    }
}
