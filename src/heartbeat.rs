//! Push-channel keep-alive.
//!
//! While a connection is open the monitor sends a `ping` frame every
//! [`HEARTBEAT_INTERVAL`](crate::constants::HEARTBEAT_INTERVAL). It is a
//! keep-alive for intermediary proxies, not a failure detector: the server's
//! `heartbeat` acknowledgement is not tracked, and a dead socket is detected
//! by the transport's own close/error events.
//!
//! Starting is idempotent: any previous timer is cancelled before a new one is
//! spawned, so at most one ping loop exists per monitor.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::constants::HEARTBEAT_INTERVAL;

/// Periodic ping sender bound to one connection manager.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    pings_sent: Arc<AtomicU64>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    ///
    /// A zero `interval` is replaced by the default heartbeat interval.
    pub fn new(interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            log::warn!(
                "[Heartbeat] Zero interval requested, using {}s",
                HEARTBEAT_INTERVAL.as_secs()
            );
            HEARTBEAT_INTERVAL
        } else {
            interval
        };
        Self {
            interval,
            task: Mutex::new(None),
            pings_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ping interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start (or restart) the ping loop.
    ///
    /// `send_ping` is called once per interval, first after one full
    /// interval. Returning `false` means the connection is gone and ends the
    /// loop. Must be called from within a tokio runtime.
    pub fn start<F>(&self, send_ping: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        let interval = self.interval;
        let pings_sent = Arc::clone(&self.pings_sent);
        let mut task = self.task.lock().expect("HeartbeatMonitor mutex poisoned");
        if let Some(previous) = task.take() {
            previous.abort();
            log::debug!("[Heartbeat] Replacing running heartbeat timer");
        }

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !send_ping() {
                    log::debug!("[Heartbeat] Connection gone, stopping heartbeat");
                    break;
                }
                pings_sent.fetch_add(1, Ordering::Relaxed);
                log::trace!("[Heartbeat] Sent ping");
            }
        }));
        log::debug!("[Heartbeat] Started ({}s interval)", interval.as_secs());
    }

    /// Stop the ping loop. No-op when not running.
    pub fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .expect("HeartbeatMonitor mutex poisoned")
            .take()
        {
            task.abort();
            log::debug!("[Heartbeat] Stopped");
        }
    }

    /// Whether a ping loop is active.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("HeartbeatMonitor mutex poisoned")
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Total pings sent by this monitor across all starts.
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
