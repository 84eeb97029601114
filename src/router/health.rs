//! Coarse per-instance health: three consecutive failures excise the
//! instance from routing candidates; the next success restores it. The
//! circuit breaker decides per attempt, this decides at model scope.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    last_success_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
            last_success_at: Mutex::new(None),
        }
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        *self.last_success_at.lock()
    }

    /// First success recovers the instance and zeroes the counter.
    pub fn record_success(&self) {
        self.healthy.store(true, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_error.lock() = None;
        *self.last_success_at.lock() = Some(Utc::now());
    }

    pub fn record_failure(&self, error: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_error.lock() = Some(error.to_string());
        if failures >= UNHEALTHY_AFTER {
            self.healthy.store(false, Ordering::SeqCst);
        }
    }

    /// Explicit reset, used when configuration reload re-creates state.
    pub fn reset(&self) {
        self.healthy.store(true, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_error.lock() = None;
    }
}
