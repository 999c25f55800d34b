//! Metrics collection for detection sessions
//!
//! Counts what the frame loop did with every frame and keeps a short history
//! of transport errors. Transport failures never stop a session, so these
//! counters (and the `degraded` flag) are the only place they surface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Maximum number of transport errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Record of a transport error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Point-in-time view of a session's metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Frames handed to the transport successfully
    pub frames_forwarded: u64,
    /// Frames discarded because the session was paused
    pub frames_dropped_paused: u64,
    /// Transport send failures over the session's lifetime
    pub send_failures: u64,
    /// Consecutive send failures since the last success
    pub failure_streak: u32,
    /// Failure streak reached the configured threshold
    pub degraded: bool,
    /// Most recent transport errors, newest first
    pub recent_errors: Vec<ErrorRecord>,
}

/// Counters shared between the frame loop (writer) and status queries (readers)
#[derive(Debug)]
pub struct SessionMetrics {
    frames_forwarded: AtomicU64,
    frames_dropped_paused: AtomicU64,
    send_failures: AtomicU64,
    failure_streak: AtomicU32,
    degraded_threshold: u32,
    errors: Mutex<VecDeque<ErrorRecord>>,
}

impl SessionMetrics {
    /// `degraded_threshold` of 0 disables the degraded signal
    pub fn new(degraded_threshold: u32) -> Self {
        Self {
            frames_forwarded: AtomicU64::new(0),
            frames_dropped_paused: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            failure_streak: AtomicU32::new(0),
            degraded_threshold,
            errors: Mutex::new(VecDeque::with_capacity(MAX_ERROR_HISTORY)),
        }
    }

    pub fn frame_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        let streak = self.failure_streak.swap(0, Ordering::Relaxed);
        if self.degraded_threshold > 0 && streak >= self.degraded_threshold {
            log::info!("Metrics: transport recovered after {} consecutive failures", streak);
        }
    }

    pub fn frame_dropped_paused(&self) {
        self.frames_dropped_paused.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send failure and return the current failure streak
    pub fn send_failed(&self, message: String) -> u32 {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;

        let mut errors = self.errors.lock();
        if errors.len() >= MAX_ERROR_HISTORY {
            errors.pop_back();
        }
        errors.push_front(ErrorRecord {
            timestamp: Utc::now(),
            message,
        });

        streak
    }

    /// Whether `streak` is exactly the point where the session turns degraded
    pub fn crosses_threshold(&self, streak: u32) -> bool {
        self.degraded_threshold > 0 && streak == self.degraded_threshold
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let failure_streak = self.failure_streak.load(Ordering::Relaxed);
        MetricsSnapshot {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_dropped_paused: self.frames_dropped_paused.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            failure_streak,
            degraded: self.degraded_threshold > 0 && failure_streak >= self.degraded_threshold,
            recent_errors: self.errors.lock().iter().cloned().collect(),
        }
    }
}
