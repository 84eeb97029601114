//! Adaptive per-instance circuit breaker.
//!
//! Classic three-state machine with one addition: sustained slowness trips
//! the circuit too. Successful calls slower than `latency_threshold` count
//! toward `slow_request_limit`; timeouts open the circuit immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const LATENCY_WINDOW_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// A successful call slower than this counts as a slow request.
    pub latency_threshold: Duration,
    /// Slow requests that open the circuit.
    pub slow_request_limit: u32,
    /// How long the circuit stays open after the last failure.
    pub cooldown: Duration,
    /// Probes admitted while half-open.
    pub half_open_probe_count: u32,
    /// Probe successes required to close again.
    pub half_open_success_min: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            latency_threshold: Duration::from_secs(30),
            slow_request_limit: 10,
            cooldown: Duration::from_secs(30),
            half_open_probe_count: 3,
            half_open_success_min: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    slow_requests: u32,
    last_failure_at: Option<Instant>,
    probes_issued: u32,
    probe_successes: u32,
    latency_window: VecDeque<u64>,
    total_calls: u64,
    total_failures: u64,
}

/// Point-in-time view of the breaker for observability.
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub slow_requests: u32,
    pub avg_latency_ms: f64,
    pub concurrent: u32,
    pub total_calls: u64,
    pub total_failures: u64,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    concurrent: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                slow_requests: 0,
                last_failure_at: None,
                probes_issued: 0,
                probe_successes: 0,
                latency_window: VecDeque::with_capacity(LATENCY_WINDOW_LEN),
                total_calls: 0,
                total_failures: 0,
            }),
            concurrent: AtomicU32::new(0),
        }
    }

    /// Admission check. Open circuits flip to half-open once the cooldown
    /// since the last failure has elapsed; half-open admits a bounded
    /// number of probes.
    pub fn can_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_issued = 1;
                    inner.probe_successes = 0;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_issued < self.config.half_open_probe_count {
                    inner.probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        push_latency(&mut inner.latency_window, latency);

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
                if latency > self.config.latency_threshold {
                    inner.slow_requests += 1;
                    if inner.slow_requests >= self.config.slow_request_limit {
                        open(&mut inner);
                    }
                } else {
                    inner.slow_requests = inner.slow_requests.saturating_sub(1);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_success_min {
                    close(&mut inner);
                }
            }
            // A call that started before the circuit opened; stats only.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    open(&mut inner);
                }
            }
            BreakerState::HalfOpen => open(&mut inner),
            BreakerState::Open => {}
        }
    }

    /// Timeouts open the circuit immediately, whatever the failure count.
    pub fn record_timeout(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        open(&mut inner);
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn begin_call(&self) {
        self.concurrent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_call(&self) {
        let _ = self
            .concurrent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        let avg = if inner.latency_window.is_empty() {
            0.0
        } else {
            inner.latency_window.iter().sum::<u64>() as f64 / inner.latency_window.len() as f64
        };
        BreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            slow_requests: inner.slow_requests,
            avg_latency_ms: avg,
            concurrent: self.concurrent.load(Ordering::SeqCst),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

fn push_latency(window: &mut VecDeque<u64>, latency: Duration) {
    if window.len() == LATENCY_WINDOW_LEN {
        window.pop_front();
    }
    window.push_back(latency.as_millis() as u64);
}

fn open(inner: &mut Inner) {
    inner.state = BreakerState::Open;
    inner.probes_issued = 0;
    inner.probe_successes = 0;
    if inner.last_failure_at.is_none() {
        inner.last_failure_at = Some(Instant::now());
    }
}

fn close(inner: &mut Inner) {
    inner.state = BreakerState::Closed;
    inner.consecutive_failures = 0;
    inner.slow_requests = 0;
    inner.probes_issued = 0;
    inner.probe_successes = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Duration {
        Duration::from_millis(10)
    }

    fn breaker(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(config)
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let b = breaker(BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_request());
    }

    #[test]
    fn single_timeout_opens_immediately() {
        let b = breaker(BreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        });
        b.record_timeout();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn success_decrements_failure_count() {
        let b = breaker(BreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        b.record_failure();
        b.record_failure();
        b.record_success(fast());
        b.record_failure();
        // 2 - 1 + 1 = 2, still below the threshold.
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 2);
    }

    #[test]
    fn sustained_slowness_opens_the_circuit() {
        let b = breaker(BreakerConfig {
            latency_threshold: Duration::from_millis(100),
            slow_request_limit: 2,
            ..Default::default()
        });
        b.record_success(Duration::from_millis(500));
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_success(Duration::from_millis(500));
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn fast_success_repays_one_slow_request() {
        let b = breaker(BreakerConfig {
            latency_threshold: Duration::from_millis(100),
            slow_request_limit: 2,
            ..Default::default()
        });
        b.record_success(Duration::from_millis(500));
        b.record_success(fast());
        b.record_success(Duration::from_millis(500));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn cooldown_gates_half_open_probes() {
        let b = breaker(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(30),
            half_open_probe_count: 3,
            half_open_success_min: 2,
            ..Default::default()
        });
        b.record_failure();
        assert!(!b.can_request());

        std::thread::sleep(Duration::from_millis(40));
        // Exactly the probe budget is admitted.
        assert!(b.can_request());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.can_request());
        assert!(b.can_request());
        assert!(!b.can_request());
    }

    #[test]
    fn enough_probe_successes_close_the_circuit() {
        let b = breaker(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(10),
            half_open_probe_count: 3,
            half_open_success_min: 2,
            ..Default::default()
        });
        b.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.can_request());
        b.record_success(fast());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success(fast());
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn probe_failure_reopens() {
        let b = breaker(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(10),
            ..Default::default()
        });
        b.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.can_request());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_request());
    }
}
