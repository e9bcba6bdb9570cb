//! In-flight run registry: at most one active run per session key.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::key::SessionKey;
use crate::payload::TelemetryPayload;
use crate::progress::{FailureKind, ProgressEvent, ProgressReporter, RunChannel, Subscription};

/// What an active run does once its last subscriber detaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbandonPolicy {
    /// Keep running so the result still lands in the cache.
    #[default]
    Continue,
    /// Fire the run's cancellation token.
    Cancel,
}

impl std::str::FromStr for AbandonPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(AbandonPolicy::Continue),
            "cancel" => Ok(AbandonPolicy::Cancel),
            other => Err(format!("unknown abandon policy: {other}")),
        }
    }
}

/// Result of [`InFlightRegistry::acquire_or_attach`].
pub enum Attachment {
    /// Caller must drive the run. The subscription is the caller's own view.
    Owner(RunOwner, Subscription),
    /// A run for this key is already active.
    Subscriber(Subscription),
}

#[derive(Default)]
pub struct InFlightRegistry {
    runs: Mutex<HashMap<SessionKey, Arc<RunChannel>>>,
    policy: AbandonPolicy,
}

impl InFlightRegistry {
    pub fn new(policy: AbandonPolicy) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(HashMap::new()),
            policy,
        })
    }

    /// Atomically either registers a new run or attaches to the active one.
    pub fn acquire_or_attach(self: &Arc<Self>, key: &SessionKey) -> Attachment {
        let mut runs = self.runs.lock();
        if let Some(existing) = runs.get(key) {
            // A cancelled run is still winding down and will never deliver a
            // result. Register a successor in its place.
            if !existing.cancel_token().is_cancelled() {
                debug!(key = %key, "attaching to in-flight run");
                return Attachment::Subscriber(existing.subscribe());
            }
            debug!(key = %key, "replacing cancelled run");
        }

        let channel = RunChannel::new(key.clone(), self.policy == AbandonPolicy::Cancel);
        runs.insert(key.clone(), Arc::clone(&channel));
        // Subscribing inside the lock so nobody can observe a run without
        // the owner's own subscriber attached.
        let subscription = channel.subscribe();
        drop(runs);

        debug!(key = %key, "registered new run");
        let owner = RunOwner {
            registry: Arc::clone(self),
            channel,
            finished: false,
        };
        Attachment::Owner(owner, subscription)
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.runs.lock().contains_key(key)
    }

    pub fn active_runs(&self) -> usize {
        self.runs.lock().len()
    }

    fn remove(&self, channel: &Arc<RunChannel>) {
        let mut runs = self.runs.lock();
        // Only remove our own entry; never a successor registered later.
        if runs
            .get(channel.key())
            .is_some_and(|current| Arc::ptr_eq(current, channel))
        {
            runs.remove(channel.key());
        }
    }
}

/// Exclusive right to drive one run. Finishing publishes the terminal event
/// and releases the key. Dropping an unfinished owner fails the run.
pub struct RunOwner {
    registry: Arc<InFlightRegistry>,
    channel: Arc<RunChannel>,
    finished: bool,
}

impl RunOwner {
    pub fn key(&self) -> &SessionKey {
        self.channel.key()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.channel.cancel_token().clone()
    }

    pub fn reporter(&self) -> Arc<RunChannel> {
        Arc::clone(&self.channel)
    }

    pub fn complete(self, payload: Arc<TelemetryPayload>) {
        self.finish(ProgressEvent::Complete { data: payload });
    }

    pub fn fail(self, kind: FailureKind, message: impl Into<String>) {
        self.finish(ProgressEvent::failure(kind, message));
    }

    fn finish(mut self, terminal: ProgressEvent) {
        self.finished = true;
        self.channel.publish(terminal);
        self.registry.remove(&self.channel);
    }
}

impl Drop for RunOwner {
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = %self.channel.key(), "run dropped without a terminal event");
            self.channel.publish(ProgressEvent::error("run aborted"));
            self.registry.remove(&self.channel);
        }
    }
}

impl ProgressReporter for RunOwner {
    fn publish(&self, event: ProgressEvent) {
        if event.is_terminal() {
            warn!(key = %self.key(), "terminal events go through complete or fail");
            return;
        }
        self.channel.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyParams, DEFAULT_MIN_SEASON};
    use crate::progress::RunPhase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(round: i64) -> SessionKey {
        KeyParams::new(2023, round)
            .into_key(DEFAULT_MIN_SEASON)
            .unwrap()
    }

    fn expect_owner(attachment: Attachment) -> (RunOwner, Subscription) {
        match attachment {
            Attachment::Owner(owner, sub) => (owner, sub),
            Attachment::Subscriber(_) => panic!("expected owner"),
        }
    }

    fn expect_subscriber(attachment: Attachment) -> Subscription {
        match attachment {
            Attachment::Subscriber(sub) => sub,
            Attachment::Owner(..) => panic!("expected subscriber"),
        }
    }

    #[test]
    fn second_request_attaches() {
        let registry = InFlightRegistry::new(AbandonPolicy::Continue);
        let (owner, _own) = expect_owner(registry.acquire_or_attach(&key(5)));
        let _sub = expect_subscriber(registry.acquire_or_attach(&key(5)));
        // Different key, different run.
        let (_other, _) = expect_owner(registry.acquire_or_attach(&key(6)));
        assert_eq!(registry.active_runs(), 2);
        drop(owner);
    }

    #[tokio::test]
    async fn complete_reaches_all_subscribers_then_releases_key() {
        let registry = InFlightRegistry::new(AbandonPolicy::Continue);
        let (owner, own) = expect_owner(registry.acquire_or_attach(&key(5)));
        let attached = expect_subscriber(registry.acquire_or_attach(&key(5)));

        owner.publish(ProgressEvent::progress(50.0, "half"));
        owner.fail(FailureKind::Unavailable, "upstream down");

        assert!(!registry.is_active(&key(5)));
        let expected = ProgressEvent::failure(FailureKind::Unavailable, "upstream down");
        assert_eq!(own.terminal().await, Some(expected.clone()));
        assert_eq!(attached.terminal().await, Some(expected));

        // Key is free for a new run afterwards.
        let (_next, _) = expect_owner(registry.acquire_or_attach(&key(5)));
    }

    #[tokio::test]
    async fn dropped_owner_aborts_run() {
        let registry = InFlightRegistry::new(AbandonPolicy::Continue);
        let (owner, own) = expect_owner(registry.acquire_or_attach(&key(5)));
        let channel = owner.reporter();
        drop(owner);

        assert_eq!(own.terminal().await, Some(ProgressEvent::error("run aborted")));
        assert_eq!(channel.phase(), RunPhase::Failed);
        assert_eq!(registry.active_runs(), 0);
    }

    #[test]
    fn owner_cannot_publish_terminal_directly() {
        let registry = InFlightRegistry::new(AbandonPolicy::Continue);
        let (owner, _own) = expect_owner(registry.acquire_or_attach(&key(5)));
        owner.publish(ProgressEvent::error("sneaky"));
        assert_eq!(owner.reporter().phase(), RunPhase::Running);
    }

    #[test]
    fn cancel_policy_fires_token_when_everyone_leaves() {
        let registry = InFlightRegistry::new(AbandonPolicy::Cancel);
        let (owner, own) = expect_owner(registry.acquire_or_attach(&key(5)));
        let attached = expect_subscriber(registry.acquire_or_attach(&key(5)));
        let token = owner.cancel_token();

        drop(own);
        assert!(!token.is_cancelled());
        drop(attached);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_run_is_replaced_not_joined() {
        let registry = InFlightRegistry::new(AbandonPolicy::Cancel);
        let (stale, own) = expect_owner(registry.acquire_or_attach(&key(5)));
        drop(own);
        assert!(stale.cancel_token().is_cancelled());
        assert!(registry.is_active(&key(5)));

        let (fresh, fresh_sub) = expect_owner(registry.acquire_or_attach(&key(5)));
        assert!(!fresh.cancel_token().is_cancelled());

        // The stale owner finishing late must not evict its successor.
        stale.fail(FailureKind::Cancelled, "run cancelled");
        assert!(registry.is_active(&key(5)));
        let _joined = expect_subscriber(registry.acquire_or_attach(&key(5)));

        fresh.fail(FailureKind::Processing, "done");
        assert_eq!(fresh_sub.terminal().await, Some(ProgressEvent::error("done")));
        assert!(!registry.is_active(&key(5)));
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("cancel".parse::<AbandonPolicy>(), Ok(AbandonPolicy::Cancel));
        assert_eq!("Continue".parse::<AbandonPolicy>(), Ok(AbandonPolicy::Continue));
        assert!("sometimes".parse::<AbandonPolicy>().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_elect_single_owner() {
        let registry = InFlightRegistry::new(AbandonPolicy::Continue);
        let owners = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let owners = Arc::clone(&owners);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                match registry.acquire_or_attach(&key(5)) {
                    Attachment::Owner(owner, sub) => {
                        owners.fetch_add(1, Ordering::SeqCst);
                        // Hold the run so every other task attaches.
                        (Some(owner), sub)
                    }
                    Attachment::Subscriber(sub) => (None, sub),
                }
            }));
        }

        let mut held = Vec::new();
        for handle in handles {
            held.push(handle.await.unwrap());
        }
        assert_eq!(owners.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_runs(), 1);

        let (owner, subs): (Vec<_>, Vec<_>) = held.into_iter().unzip();
        let owner = owner.into_iter().flatten().next().unwrap();
        owner.fail(FailureKind::Processing, "done");
        for sub in subs {
            assert_eq!(sub.terminal().await, Some(ProgressEvent::error("done")));
        }
    }
}
