//! OpenAI-compatible HTTP surface.

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::guard::BudgetGuard;
use crate::latency::LatencyTracker;
use crate::llm::TokenCounter;
use crate::pricing::CostTable;
use crate::router::{FailoverOrchestrator, ModelRegistry};
use crate::store::CoordStore;
use crate::usage::UsageQueue;

/// Everything the handlers need, wired once at startup and passed by
/// explicit reference. No process-wide singletons.
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub orchestrator: Arc<FailoverOrchestrator>,
    pub auth: Arc<Authenticator>,
    pub guard: Arc<BudgetGuard>,
    pub usage: Arc<UsageQueue>,
    pub latency: Arc<LatencyTracker>,
    pub coord: Arc<dyn CoordStore>,
    pub pricing: Arc<dyn CostTable>,
    pub counter: Arc<dyn TokenCounter>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/audio/transcriptions", post(handlers::transcriptions))
        .route("/v1/audio/speech", post(handlers::speech))
        .route("/v1/images/generations", post(handlers::image_generations))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/models/:id", get(handlers::get_model))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
