//! Producer side of the usage stream. Enqueueing is fire-and-forget from
//! the request path's point of view: a store hiccup costs a settlement
//! record, never a response.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::models::UsageEvent;
use crate::store::CoordStore;

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct UsageQueue {
    coord: Arc<dyn CoordStore>,
    stream: String,
}

impl UsageQueue {
    pub fn new(coord: Arc<dyn CoordStore>, stream: impl Into<String>) -> Self {
        Self {
            coord,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub async fn publish(&self, event: &UsageEvent) {
        let payload = event.to_json();
        let push = self.coord.queue_push(&self.stream, &payload);
        match tokio::time::timeout(ENQUEUE_TIMEOUT, push).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(request_id = %event.request_id, %err, "usage event dropped"),
            Err(_) => warn!(request_id = %event.request_id, "usage enqueue timed out, event dropped"),
        }
    }
}
