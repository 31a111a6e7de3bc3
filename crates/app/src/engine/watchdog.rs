//! Watchdog for the capture thread.
//!
//! The capture loop emits a heartbeat for every read attempt. When heartbeats
//! stop (a source blocked past its read timeout, a wedged decoder) the
//! watchdog arms a restart and the session supervisor reconnects.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

use crate::engine::telemetry;

/// Sleep interval between watchdog health checks.
pub const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Grace period at startup before a session is expected to produce frames.
pub const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

/// Why a session restart was requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RestartReason {
    /// No heartbeat within the stale threshold.
    StalledCapture,
    /// Too many consecutive read failures.
    ReadErrors,
    /// Too many consecutive corrupt frames.
    CorruptFrames,
}

impl RestartReason {
    pub fn label(self) -> &'static str {
        match self {
            RestartReason::StalledCapture => "stalled capture",
            RestartReason::ReadErrors => "consecutive read errors",
            RestartReason::CorruptFrames => "consecutive corrupt frames",
        }
    }
}

/// Heartbeat timestamps for one session, in unix millis.
pub struct SessionHealth {
    capture: AtomicU64,
}

impl SessionHealth {
    pub fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
        }
    }

    /// Register a capture heartbeat.
    pub fn beat(&self) {
        self.capture.store(current_millis(), Ordering::Relaxed);
    }

    /// Whether the capture loop has gone quiet for longer than the threshold.
    pub fn is_stale(&self, now: u64, stale_threshold_ms: u64) -> bool {
        now.saturating_sub(self.capture.load(Ordering::Relaxed)) > stale_threshold_ms
    }
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared trigger state between the watchdog and the session supervisor.
pub struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<RestartReason>>,
}

impl WatchdogState {
    pub fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Record a restart reason and mark the watchdog as fired.
    pub fn arm(&self, reason: RestartReason) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(reason);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<RestartReason> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }

    /// Clear the trigger before a reconnect attempt.
    pub fn disarm(&self) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = None;
        }
        self.triggered.store(false, Ordering::SeqCst);
    }
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the watchdog thread polling session health.
///
/// The stale threshold tracks the stream's read timeout so a source blocked
/// inside a read is not flagged prematurely.
pub fn spawn_watchdog(
    health: Arc<SessionHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
    stale_threshold: Duration,
) -> thread::JoinHandle<()> {
    let stale_threshold_ms = stale_threshold.as_millis() as u64;
    telemetry::spawn_thread("session-watchdog", move || {
        while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            if health.is_stale(current_millis(), stale_threshold_ms) {
                error!("watchdog detected stalled capture; requesting session restart");
                metrics::counter!("viscam_watchdog_restarts_total").increment(1);
                state.arm(RestartReason::StalledCapture);
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    })
    .expect("failed to spawn watchdog thread")
}

pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
