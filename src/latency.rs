//! Distributed latency tracking.
//!
//! Every successful attempt records its end-to-end latency into a shared,
//! time-windowed sorted set keyed by logical model, so all replicas route
//! on the same view. Writes are best-effort with a hard 100 ms budget;
//! losing a sample must never slow down or fail a request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::store::CoordStore;

const WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Smoothing factor for the cached exponential moving average.
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyAggregates {
    pub avg_latency: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: usize,
    /// 0-100, derived from p95: <= 500 ms scores 100, >= 5 s scores 0.
    pub health_score: u8,
}

pub struct LatencyTracker {
    store: Arc<dyn CoordStore>,
    window: Duration,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self::with_limits(store, DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }

    pub fn with_limits(store: Arc<dyn CoordStore>, window: Duration, max_samples: usize) -> Self {
        Self {
            store,
            window,
            max_samples,
        }
    }

    fn set_key(model: &str) -> String {
        format!("latency:{model}")
    }

    fn avg_key(model: &str) -> String {
        format!("latency:avg:{model}")
    }

    /// Record one sample. Never returns an error and never exceeds the
    /// write budget.
    pub async fn record(&self, model: &str, latency: Duration) {
        let millis = latency.as_millis() as u64;
        let result = tokio::time::timeout(WRITE_TIMEOUT, self.record_inner(model, millis)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(model, %err, "latency sample dropped"),
            Err(_) => debug!(model, "latency write timed out, sample dropped"),
        }
    }

    async fn record_inner(
        &self,
        model: &str,
        millis: u64,
    ) -> Result<(), crate::store::StoreError> {
        let now_nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() * 1_000_000);
        // Member embeds a unique suffix so equal latencies never collide.
        let member = format!("{millis}:{now_nanos}");
        let key = Self::set_key(model);

        self.store.zadd(&key, &member, now_nanos as f64).await?;
        let horizon = now_nanos as f64 - self.window.as_nanos() as f64;
        self.store.ztrim(&key, horizon, self.max_samples).await?;

        // Fold the sample into the cached moving average.
        let avg_key = Self::avg_key(model);
        let previous: Option<f64> = self
            .store
            .get(&avg_key)
            .await?
            .and_then(|raw| raw.parse().ok());
        let updated = match previous {
            Some(prev) => EMA_ALPHA * millis as f64 + (1.0 - EMA_ALPHA) * prev,
            None => millis as f64,
        };
        self.store
            .set_with_ttl(&avg_key, &format!("{updated:.3}"), self.window)
            .await
    }

    /// Cached average for one model. `None` when there is no data or the
    /// store is unreachable.
    pub async fn average(&self, model: &str) -> Option<f64> {
        let read = tokio::time::timeout(READ_TIMEOUT, self.store.get(&Self::avg_key(model))).await;
        match read {
            Ok(Ok(Some(raw))) => raw.parse().ok(),
            _ => None,
        }
    }

    /// Averages for a set of models, for strategy ordering. Models without
    /// samples are simply absent.
    pub async fn averages(&self, models: &[String]) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        for model in models {
            if let Some(avg) = self.average(model).await {
                out.insert(model.clone(), avg);
            }
        }
        out
    }

    /// Full aggregate view computed from the current window.
    pub async fn aggregates(&self, model: &str) -> Option<LatencyAggregates> {
        let members = tokio::time::timeout(READ_TIMEOUT, self.store.zmembers(&Self::set_key(model)))
            .await
            .ok()?
            .ok()?;

        let mut samples: Vec<f64> = members
            .iter()
            .filter_map(|member| member.split(':').next())
            .filter_map(|millis| millis.parse().ok())
            .collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let sum: f64 = samples.iter().sum();
        let avg = self
            .average(model)
            .await
            .unwrap_or(sum / samples.len() as f64);
        let p95 = percentile(&samples, 0.95);

        Some(LatencyAggregates {
            avg_latency: avg,
            min: samples[0],
            max: samples[samples.len() - 1],
            p50: percentile(&samples, 0.50),
            p95,
            p99: percentile(&samples, 0.99),
            sample_count: samples.len(),
            health_score: health_score(p95),
        })
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((fraction * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Map p95 latency onto a 0-100 score, linear between 500 ms and 5 s.
fn health_score(p95_ms: f64) -> u8 {
    if p95_ms <= 500.0 {
        100
    } else if p95_ms >= 5000.0 {
        0
    } else {
        (100.0 * (5000.0 - p95_ms) / 4500.0).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCoordStore;

    fn tracker() -> (Arc<MemoryCoordStore>, LatencyTracker) {
        let store = Arc::new(MemoryCoordStore::new());
        let tracker = LatencyTracker::new(store.clone() as Arc<dyn CoordStore>);
        (store, tracker)
    }

    #[tokio::test]
    async fn aggregates_reflect_recorded_samples() {
        let (_, tracker) = tracker();
        for millis in [100u64, 200, 300, 400, 500] {
            tracker.record("gpt-4", Duration::from_millis(millis)).await;
        }
        let aggregates = tracker.aggregates("gpt-4").await.unwrap();
        assert_eq!(aggregates.sample_count, 5);
        assert_eq!(aggregates.min, 100.0);
        assert_eq!(aggregates.max, 500.0);
        assert_eq!(aggregates.p50, 300.0);
        assert_eq!(aggregates.health_score, 100);
    }

    #[tokio::test]
    async fn window_holds_at_most_max_samples() {
        let store = Arc::new(MemoryCoordStore::new());
        let tracker =
            LatencyTracker::with_limits(store.clone() as Arc<dyn CoordStore>, DEFAULT_WINDOW, 10);
        for millis in 0..50u64 {
            tracker.record("gpt-4", Duration::from_millis(millis)).await;
        }
        let members = store.zmembers("latency:gpt-4").await.unwrap();
        assert!(members.len() <= 10);
    }

    #[tokio::test]
    async fn store_outage_drops_samples_silently() {
        let (store, tracker) = tracker();
        store.set_unavailable(true);
        tracker.record("gpt-4", Duration::from_millis(100)).await;
        assert!(tracker.average("gpt-4").await.is_none());
        assert!(tracker.aggregates("gpt-4").await.is_none());
    }

    #[test]
    fn health_score_is_linear_between_bounds() {
        assert_eq!(health_score(400.0), 100);
        assert_eq!(health_score(5500.0), 0);
        assert_eq!(health_score(2750.0), 50);
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&sorted, 0.50), 5.0);
        assert_eq!(percentile(&sorted, 0.95), 10.0);
        assert_eq!(percentile(&sorted, 0.99), 10.0);
    }
}
