//! Heartbeat monitoring
//!
//! A [`HeartbeatMonitor`] runs on its own tokio task and checks the server's
//! heartbeat feed once per interval. After `max_missed` consecutive misses it
//! marks the shared [`HeartbeatState`] dead and calls the error callback;
//! the first successful check afterwards clears the flag and calls the clear
//! callback. Checking never stops while the monitor is alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace, warn};

use crate::rpc::channel::HeartbeatFeed;

/// Liveness flag shared between the monitor and the client.
///
/// Relaxed ordering is enough: the flag only flips between two states and a
/// stale read delays detection by at most one check interval.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatState {
    failed: Arc<AtomicBool>,
}

impl HeartbeatState {
    /// A flag that starts out clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the server is currently considered dead.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Flag the server as dead.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Clear the flag after a heartbeat returns.
    pub fn clear(&self) {
        self.failed.store(false, Ordering::Relaxed);
    }
}

/// Callback invoked on heartbeat loss or recovery.
pub type HeartbeatCallback = Box<dyn Fn() + Send + Sync>;

/// Background heartbeat check loop.
pub struct HeartbeatMonitor {
    handle: JoinHandle<()>,
    state: HeartbeatState,
}

impl HeartbeatMonitor {
    /// Start checking the feed every `interval`.
    ///
    /// `on_error` is called once each time `max_missed` consecutive checks
    /// fail; `on_clear` when a check succeeds after such a failure. The
    /// state flag is updated before either callback runs.
    pub fn spawn(
        mut feed: Box<dyn HeartbeatFeed>,
        interval: Duration,
        max_missed: u32,
        state: HeartbeatState,
        on_error: Option<HeartbeatCallback>,
        on_clear: Option<HeartbeatCallback>,
    ) -> Self {
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut missed: u32 = 0;
            let mut reported = false;

            loop {
                ticker.tick().await;
                if feed.check(interval).await {
                    if reported {
                        info!("Heartbeat restored");
                        task_state.clear();
                        if let Some(cb) = &on_clear {
                            cb();
                        }
                    }
                    missed = 0;
                    reported = false;
                    continue;
                }

                missed = missed.saturating_add(1);
                trace!("Heartbeat missed ({missed}/{max_missed})");
                if missed >= max_missed && !reported {
                    warn!("No heartbeat for {missed} consecutive intervals of {interval:?}");
                    reported = true;
                    task_state.mark_failed();
                    if let Some(cb) = &on_error {
                        cb();
                    }
                }
            }
        });
        Self { handle, state }
    }

    /// The flag this monitor updates.
    pub fn state(&self) -> &HeartbeatState {
        &self.state
    }

    /// Stop checking. The state flag keeps its last value.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
