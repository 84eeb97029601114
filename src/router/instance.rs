//! One concrete deployment of a logical model, with its live counters,
//! breaker and health state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::health::HealthState;
use crate::llm::providers::{Provider, ProviderKind};

/// Process-local requests/tokens-per-minute counters.
#[derive(Debug)]
struct MinuteWindow {
    started: Instant,
    requests: u32,
    tokens: u64,
}

impl MinuteWindow {
    fn roll(&mut self) {
        if self.started.elapsed() >= Duration::from_secs(60) {
            self.started = Instant::now();
            self.requests = 0;
            self.tokens = 0;
        }
    }
}

pub struct Instance {
    pub id: String,
    /// The logical model this instance belongs to.
    pub logical_model: String,
    pub kind: ProviderKind,
    pub priority: u32,
    pub weight: u32,
    pub enabled: bool,
    /// 0 means uncapped.
    pub rpm_limit: u32,
    pub tpm_limit: u32,
    /// Base per-attempt timeout for this deployment.
    pub timeout: Duration,
    pub provider: Arc<dyn Provider>,
    pub breaker: CircuitBreaker,
    pub health: HealthState,
    active_requests: AtomicU32,
    minute: Mutex<MinuteWindow>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        logical_model: String,
        provider: Arc<dyn Provider>,
        priority: u32,
        weight: u32,
        enabled: bool,
        rpm_limit: u32,
        tpm_limit: u32,
        timeout: Duration,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            id,
            logical_model,
            kind: provider.kind(),
            priority,
            weight,
            enabled,
            rpm_limit,
            tpm_limit,
            timeout,
            provider,
            breaker: CircuitBreaker::new(breaker_config),
            health: HealthState::new(),
            active_requests: AtomicU32::new(0),
            minute: Mutex::new(MinuteWindow {
                started: Instant::now(),
                requests: 0,
                tokens: 0,
            }),
        }
    }

    pub fn active_requests(&self) -> u32 {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Begin one in-flight request. The returned guard releases the
    /// counters on drop, so cancellation can never leak a slot.
    pub fn begin_request(self: &Arc<Self>) -> ActiveGuard {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        self.breaker.begin_call();
        {
            let mut minute = self.minute.lock();
            minute.roll();
            minute.requests += 1;
        }
        ActiveGuard {
            instance: Arc::clone(self),
        }
    }

    pub fn record_tokens(&self, tokens: u32) {
        let mut minute = self.minute.lock();
        minute.roll();
        minute.tokens += tokens as u64;
    }

    pub fn current_rpm(&self) -> u32 {
        let mut minute = self.minute.lock();
        minute.roll();
        minute.requests
    }

    pub fn current_tpm(&self) -> u64 {
        let mut minute = self.minute.lock();
        minute.roll();
        minute.tokens
    }

    /// At or over its own rpm/tpm ceiling this minute.
    pub fn is_saturated(&self) -> bool {
        (self.rpm_limit > 0 && self.current_rpm() >= self.rpm_limit)
            || (self.tpm_limit > 0 && self.current_tpm() >= self.tpm_limit as u64)
    }

    /// Routable right now: enabled, healthy, and under its rate ceilings.
    pub fn is_candidate(&self) -> bool {
        self.enabled && self.health.is_healthy() && !self.is_saturated()
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("logical_model", &self.logical_model)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

pub struct ActiveGuard {
    instance: Arc<Instance>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let _ = self
            .instance
            .active_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
        self.instance.breaker.end_call();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::instance;

    #[test]
    fn guard_releases_counters_on_drop() {
        let inst = instance("a", "gpt-4", 1, 1);
        assert_eq!(inst.active_requests(), 0);
        {
            let _first = inst.begin_request();
            let _second = inst.begin_request();
            assert_eq!(inst.active_requests(), 2);
        }
        assert_eq!(inst.active_requests(), 0);
        assert_eq!(inst.current_rpm(), 2);
    }

    #[test]
    fn saturation_respects_rpm_ceiling() {
        use super::test_support::NullProvider;
        let inst = instance("a", "gpt-4", 1, 1);
        assert!(!inst.is_saturated());

        let capped = std::sync::Arc::new(super::Instance::new(
            "b".into(),
            "gpt-4".into(),
            std::sync::Arc::new(NullProvider),
            1,
            1,
            true,
            2,
            0,
            std::time::Duration::from_secs(30),
            super::BreakerConfig::default(),
        ));
        let _a = capped.begin_request();
        let _b = capped.begin_request();
        assert!(capped.is_saturated());
    }
}
