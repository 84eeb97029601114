//! Shared harness for the end-to-end suites: a scripted mock provider, a
//! fully wired gateway over in-memory stores, and request helpers.

// Each suite pulls a different subset of these helpers.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use parking_lot::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

use switchgate::api::{build_router, AppState};
use switchgate::auth::{hash_key, key_prefix, Authenticator};
use switchgate::config::{BudgetGuardConfig, UsageConfig};
use switchgate::guard::BudgetGuard;
use switchgate::latency::LatencyTracker;
use switchgate::llm::providers::{
    CallContext, ChunkStream, Provider, ProviderKind, UpstreamError,
};
use switchgate::llm::{
    completion_id, ChatChoice, ChatMessage, ChatRequest, ChatResponse, HeuristicCounter,
    MessageContent, MessageDelta, Role, StreamChoice, StreamChunk, Usage,
};
use switchgate::models::key::KeyKind;
use switchgate::models::ApiKey;
use switchgate::pricing::StaticCostTable;
use switchgate::router::{
    BreakerConfig, FailoverOrchestrator, FailoverPolicy, Instance, ModelRegistry,
    RegistrySnapshot, RoutingStrategy,
};
use switchgate::store::{CoordStore, GatewayStore, MemoryCoordStore, MemoryGatewayStore};
use switchgate::usage::{UsageQueue, UsageWorker, UsageWorkerConfig};

pub const RAW_KEY: &str = "sg-test-key-0123456789";

#[derive(Clone)]
pub enum MockBehavior {
    Succeed {
        content: String,
        usage: Option<Usage>,
    },
    FailStatus(u16),
    Timeout,
    Stream {
        chunks: Vec<String>,
        usage: Option<Usage>,
        chunk_delay: Duration,
    },
    /// Yield the chunks, then fail mid-stream.
    StreamThenError {
        chunks: Vec<String>,
    },
}

/// Scripted backend: pops one behavior per call, falling back to a plain
/// success once the script runs dry.
pub struct MockProvider {
    label: String,
    script: Mutex<VecDeque<MockBehavior>>,
    pub calls: AtomicU32,
}

impl MockProvider {
    pub fn scripted(label: &str, script: Vec<MockBehavior>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn always_ok(label: &str) -> Arc<Self> {
        Self::scripted(label, Vec::new())
    }

    fn next(&self) -> MockBehavior {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().pop_front().unwrap_or(MockBehavior::Succeed {
            content: format!("response from {}", self.label),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        })
    }

    fn response(&self, model: &str, content: String, usage: Option<Usage>) -> ChatResponse {
        ChatResponse {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content: Some(MessageContent::Text(content)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: Some("stop".to_string()),
                logprobs: None,
            }],
            usage,
            system_fingerprint: None,
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        _ctx: &CallContext,
    ) -> Result<ChatResponse, UpstreamError> {
        match self.next() {
            MockBehavior::Succeed { content, usage } => {
                Ok(self.response(&request.model, content, usage))
            }
            MockBehavior::FailStatus(status) => Err(UpstreamError::from_status(
                status,
                format!("{} returned {status}", self.label),
                None,
            )),
            MockBehavior::Timeout => Err(UpstreamError::timeout(format!(
                "{} timed out",
                self.label
            ))),
            MockBehavior::Stream { .. } | MockBehavior::StreamThenError { .. } => Err(
                UpstreamError::permanent(Some(400), "scripted a stream for a unary call"),
            ),
        }
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        match self.next() {
            MockBehavior::Stream {
                chunks,
                usage,
                chunk_delay,
            } => {
                let model = request.model.clone();
                let cancel = ctx.cancel.clone();
                let total = chunks.len();
                let stream = async_chunks(model, chunks, usage, chunk_delay, total);
                use futures::StreamExt;
                Ok(Box::pin(stream.take_until(Box::pin(cancel.cancelled_owned()))))
            }
            MockBehavior::FailStatus(status) => Err(UpstreamError::from_status(
                status,
                format!("{} returned {status}", self.label),
                None,
            )),
            MockBehavior::Timeout => Err(UpstreamError::timeout(format!(
                "{} timed out",
                self.label
            ))),
            MockBehavior::Succeed { content, usage } => {
                let model = request.model.clone();
                let stream = async_chunks(model, vec![content], usage, Duration::ZERO, 1);
                Ok(Box::pin(stream))
            }
            MockBehavior::StreamThenError { chunks } => {
                let model = request.model.clone();
                let total = chunks.len();
                let content =
                    async_chunks(model, chunks, None, Duration::ZERO, total).take(total);
                let failure = futures::stream::once(async {
                    Err(UpstreamError::transient("backend dropped the stream"))
                });
                use futures::StreamExt as _;
                Ok(Box::pin(content.chain(failure)))
            }
        }
    }
}

fn async_chunks(
    model: String,
    chunks: Vec<String>,
    usage: Option<Usage>,
    delay: Duration,
    total: usize,
) -> impl futures::Stream<Item = Result<StreamChunk, UpstreamError>> + Send {
    futures::stream::unfold(0usize, move |index| {
        let model = model.clone();
        let chunks = chunks.clone();
        let usage = usage.clone();
        async move {
            if index > total {
                return None;
            }
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            if index == total {
                // Terminal chunk with finish_reason and reported usage.
                let chunk = StreamChunk {
                    id: "mock".into(),
                    object: "chat.completion.chunk".into(),
                    created: 0,
                    model,
                    choices: vec![StreamChoice {
                        index: 0,
                        delta: Some(MessageDelta::default()),
                        text: None,
                        finish_reason: Some("stop".into()),
                    }],
                    usage,
                };
                return Some((Ok(chunk), index + 1));
            }
            let chunk = StreamChunk {
                id: "mock".into(),
                object: "chat.completion.chunk".into(),
                created: 0,
                model,
                choices: vec![StreamChoice {
                    index: 0,
                    delta: Some(MessageDelta {
                        role: (index == 0).then_some(Role::Assistant),
                        content: Some(chunks[index].clone()),
                        tool_calls: None,
                    }),
                    text: None,
                    finish_reason: None,
                }],
                usage: None,
            };
            Some((Ok(chunk), index + 1))
        }
    })
}

pub fn test_key() -> ApiKey {
    ApiKey {
        id: Uuid::new_v4(),
        hash: hash_key(RAW_KEY),
        prefix: key_prefix(RAW_KEY),
        kind: KeyKind::Api,
        user_id: None,
        team_id: None,
        enabled: true,
        allowed_models: HashSet::new(),
        blocked_models: HashSet::new(),
        tpm: 0,
        rpm: 0,
        max_parallel: 0,
        max_budget: None,
        budget_period: None,
        expires_at: None,
        current_spend: 0.0,
        usage_count: 0,
        last_used_at: None,
        budget_reset_at: None,
        revoked_at: None,
    }
}

pub fn instance_with(
    id: &str,
    model: &str,
    provider: Arc<dyn Provider>,
    priority: u32,
    breaker: BreakerConfig,
) -> Arc<Instance> {
    Arc::new(Instance::new(
        id.to_string(),
        model.to_string(),
        provider,
        priority,
        1,
        true,
        0,
        0,
        Duration::from_secs(5),
        breaker,
    ))
}

pub struct TestGateway {
    pub app: Router,
    pub coord: Arc<MemoryCoordStore>,
    pub store: Arc<MemoryGatewayStore>,
    pub worker: UsageWorker,
    pub latency: Arc<LatencyTracker>,
}

pub fn gateway(
    groups: Vec<(String, Vec<Arc<Instance>>)>,
    aliases: HashMap<String, Vec<String>>,
    fallbacks: HashMap<String, String>,
    strategy: RoutingStrategy,
    key: ApiKey,
) -> TestGateway {
    let coord = Arc::new(MemoryCoordStore::with_visibility(Duration::from_millis(50)));
    let store = Arc::new(MemoryGatewayStore::new());
    store.upsert_key(key);

    let snapshot = RegistrySnapshot::from_instances(groups, aliases, fallbacks);
    let registry = Arc::new(ModelRegistry::new(snapshot));
    let latency = Arc::new(LatencyTracker::new(coord.clone() as Arc<dyn CoordStore>));
    let guard_cfg = BudgetGuardConfig {
        // Authoritative on every check; test stores are cheap.
        cache_ttl: 0,
        ..Default::default()
    };
    let guard = Arc::new(BudgetGuard::new(
        coord.clone() as Arc<dyn CoordStore>,
        store.clone() as Arc<dyn GatewayStore>,
        guard_cfg,
    ));
    let orchestrator = Arc::new(FailoverOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&latency),
        strategy,
        FailoverPolicy {
            base_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    ));
    let usage_cfg = UsageConfig::default();
    let worker = UsageWorker::new(
        coord.clone() as Arc<dyn CoordStore>,
        store.clone() as Arc<dyn GatewayStore>,
        Arc::clone(&guard),
        UsageWorkerConfig {
            batch_size: 100,
            interval: Duration::from_millis(50),
            max_retries: 3,
            stream: usage_cfg.stream.clone(),
            consumer: "test".into(),
        },
    );

    let state = Arc::new(AppState {
        registry,
        orchestrator,
        auth: Arc::new(Authenticator::new(
            store.clone() as Arc<dyn GatewayStore>,
            Duration::from_secs(60),
        )),
        guard,
        usage: Arc::new(UsageQueue::new(
            coord.clone() as Arc<dyn CoordStore>,
            usage_cfg.stream,
        )),
        latency: Arc::clone(&latency),
        coord: coord.clone() as Arc<dyn CoordStore>,
        pricing: Arc::new(StaticCostTable::default()),
        counter: Arc::new(HeuristicCounter),
    });

    TestGateway {
        app: build_router(state),
        coord,
        store,
        worker,
        latency,
    }
}

pub fn chat_body(model: &str, stream: bool) -> String {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello there"}],
        "stream": stream,
    })
    .to_string()
}

pub async fn post_chat(app: &Router, body: String, token: Option<&str>) -> Response {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    app.clone()
        .oneshot(builder.body(Body::from(body)).unwrap())
        .await
        .unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

pub fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(response.status(), expected);
}
