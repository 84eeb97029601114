//! Async usage settlement: per-request events enter a durable queue and a
//! background worker batches them into the durable store, updates spend
//! and publishes budget alerts.

pub mod queue;
pub mod worker;

pub use queue::UsageQueue;
pub use worker::{UsageWorker, UsageWorkerConfig};
