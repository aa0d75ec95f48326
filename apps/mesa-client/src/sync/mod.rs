//! The refresh orchestration shared by every live screen.
//!
//! A push signal only says "something changed"; the backend it points at is
//! eventually consistent, so one fetch straight after a signal may still read
//! the pre-mutation state. The policy therefore double-fetches: once
//! immediately, once again after a short settle delay. Screens without a push
//! channel fall back to fixed-interval polling with the same forced fetch.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::cache::{ResourceCache, ResourceSource};
use crate::channel::{ChangeSignal, RealtimeChannel};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Gap between the two forced fetches of a double-fetch.
    pub settle_delay: Duration,
    /// Cadence of the channel-less polling fallback.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Owns the background refresh task for one consumer. `stop` (or drop) aborts
/// the task, which also cancels any pending settle timer; a late-firing
/// refresh against a deactivated consumer is a correctness bug, not just a
/// leak.
pub struct SyncHandle {
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drive a cache from the push channel: connect, fetch once immediately, then
/// double-fetch on every signal.
///
/// The channel connection itself is left alone on `stop`; other consumers may
/// still be using it, and `connect` is idempotent for the next one.
pub fn spawn_live_sync<S>(
    channel: &RealtimeChannel,
    cache: Arc<ResourceCache<S>>,
    config: SyncConfig,
) -> SyncHandle
where
    S: ResourceSource + 'static,
{
    channel.connect();
    let signals = channel.subscribe();
    let settle_delay = config.settle_delay;
    let task = tokio::spawn(async move {
        refresh(&cache, "activation").await;
        signal_loop(signals, cache, settle_delay).await;
    });
    SyncHandle { task }
}

/// Fixed-interval polling for the dashboard variant with no push channel.
/// The first tick fires immediately, covering the activation fetch.
pub fn spawn_poll_sync<S>(cache: Arc<ResourceCache<S>>, config: SyncConfig) -> SyncHandle
where
    S: ResourceSource + 'static,
{
    let poll_interval = config.poll_interval;
    let task = tokio::spawn(async move {
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            refresh(&cache, "poll").await;
        }
    });
    SyncHandle { task }
}

async fn signal_loop<S>(
    mut signals: broadcast::Receiver<ChangeSignal>,
    cache: Arc<ResourceCache<S>>,
    settle_delay: Duration,
) where
    S: ResourceSource,
{
    loop {
        match signals.recv().await {
            Ok(_) => {
                refresh(&cache, "signal").await;
                time::sleep(settle_delay).await;
                refresh(&cache, "settle").await;
            }
            Err(RecvError::Lagged(skipped)) => {
                // Signals carry no ordering or count; whatever we receive
                // next triggers the same refresh.
                tracing::debug!(target: "mesa::sync", skipped, "coalesced change signals");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn refresh<S: ResourceSource>(cache: &ResourceCache<S>, phase: &'static str) {
    if let Err(err) = cache.fetch(true).await {
        tracing::warn!(target: "mesa::sync", error = %err, phase, "forced refresh failed");
    }
}
