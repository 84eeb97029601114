//! Request-plane handlers.
//!
//! Pipeline per request: authenticate, pre-flight budget, model access,
//! rate admission, resolve + failover, relay, settle usage. Streaming
//! responses are relayed chunk by chunk over a body channel with a flush
//! per chunk; the client's disconnect cancels the upstream call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{ModelObject, ModelsResponse};
use super::AppState;
use crate::error::GatewayError;
use crate::guard::RatePermit;
use crate::llm::providers::ChunkStream;
use crate::llm::{
    completion_id, ChatRequest, CompletionRequest, EmbeddingsRequest, ImageGenerationRequest,
    SpeechRequest, StreamChunk, TranscriptionRequest, Usage,
};
use crate::models::{ApiKey, UsageEvent};
use crate::router::{FailoverOutcome, Instance};

const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|err| GatewayError::BadRequest(format!("invalid request body: {err}")))
}

/// Common pre-flight: authenticate, budget, model access, rate admission.
async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    model: &str,
) -> Result<(Arc<ApiKey>, RatePermit), GatewayError> {
    let key = state.auth.authenticate(headers).await?;
    // The pre-flight blocks only when the spend is already over the line.
    state.guard.check_budget(&key, 0.0).await?.into_result()?;
    state.guard.check_model_access(&key, model).await?;
    let permit = state.guard.acquire_rate(&key).await?;
    Ok((key, permit))
}

struct Settlement {
    request_id: String,
    requested_model: String,
    logical_model: String,
    instance: Arc<Instance>,
    key: Arc<ApiKey>,
    usage: Usage,
    latency: Duration,
    status_code: u16,
    error_code: Option<String>,
    error_message: Option<String>,
}

/// Emit one usage event and feed the token windows.
async fn settle(state: &AppState, settlement: Settlement) {
    let cost = state.pricing.cost(
        &settlement.logical_model,
        settlement.usage.prompt_tokens,
        settlement.usage.completion_tokens,
    );
    let event = UsageEvent {
        request_id: settlement.request_id,
        timestamp: chrono::Utc::now(),
        key_id: settlement.key.id,
        user_id: settlement.key.user_id,
        team_id: settlement.key.team_id,
        model: settlement.requested_model,
        provider: settlement.instance.kind,
        instance_id: settlement.instance.id.clone(),
        input_tokens: settlement.usage.prompt_tokens,
        output_tokens: settlement.usage.completion_tokens,
        total_tokens: settlement.usage.total_tokens,
        cost,
        latency_ms: settlement.latency.as_millis() as u64,
        status_code: settlement.status_code,
        cache_hit: false,
        error_code: settlement.error_code,
        error_message: settlement.error_message,
    };
    state
        .guard
        .record_tokens(&settlement.key, event.total_tokens)
        .await;
    settlement.instance.record_tokens(event.total_tokens);
    state.usage.publish(&event).await;
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "switchgate",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// Ready only when the registry has models and the shared store responds.
pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.registry.load();
    if snapshot.model_names().is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "no models configured" })),
        )
            .into_response();
    }
    match tokio::time::timeout(READY_PROBE_TIMEOUT, state.coord.ping()).await {
        Ok(Ok(())) => Json(serde_json::json!({ "status": "ready" })).into_response(),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "shared store unreachable" })),
        )
            .into_response(),
    }
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let snapshot = state.registry.load();
    let data = snapshot
        .model_names()
        .into_iter()
        .map(ModelObject::new)
        .collect();
    Json(ModelsResponse::new(data))
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ModelObject>, GatewayError> {
    let snapshot = state.registry.load();
    if snapshot.contains(&id) {
        Ok(Json(ModelObject::new(id)))
    } else {
        Err(GatewayError::ModelNotFound(id))
    }
}

pub async fn not_found() -> Response {
    let body = crate::error::ErrorResponse {
        error: crate::error::ErrorDetail {
            message: "unknown route".to_string(),
            error_type: "invalid_request_error".to_string(),
            param: None,
            code: Some("route_not_found".to_string()),
        },
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request: ChatRequest = parse_body(&body)?;
    let (key, permit) = admit(&state, &headers, &request.model).await?;
    debug!(model = %request.model, stream = request.stream, "chat completion");

    if request.stream {
        stream_chat(state, key, permit, request).await
    } else {
        unary_chat(state, key, permit, request).await
    }
}

async fn unary_chat(
    state: Arc<AppState>,
    key: Arc<ApiKey>,
    permit: RatePermit,
    request: ChatRequest,
) -> Result<Response, GatewayError> {
    let request_id = completion_id();
    let requested_model = request.model.clone();
    let cancel = CancellationToken::new();
    let shared = Arc::new(request);

    let started = Instant::now();
    let outcome = state
        .orchestrator
        .execute(&requested_model, cancel, {
            let shared = Arc::clone(&shared);
            move |attempt| {
                let request = Arc::clone(&shared);
                async move {
                    attempt
                        .instance
                        .provider
                        .chat(&request, &attempt.ctx)
                        .await
                }
                .boxed()
            }
        })
        .await?;

    let mut response = outcome.value;
    response.model = requested_model.clone();
    let usage = response.usage.clone().unwrap_or_else(|| {
        let prompt = state.counter.count_messages(&shared.messages);
        let completion: u32 = response
            .choices
            .iter()
            .filter_map(|choice| choice.message.content.as_ref())
            .map(|content| state.counter.count(&content.text()))
            .sum();
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    });

    settle(
        &state,
        Settlement {
            request_id,
            requested_model,
            logical_model: outcome.logical_model,
            instance: outcome.instance,
            key,
            usage,
            latency: started.elapsed(),
            status_code: 200,
            error_code: None,
            error_message: None,
        },
    )
    .await;
    drop(permit);

    Ok(Json(response).into_response())
}

async fn stream_chat(
    state: Arc<AppState>,
    key: Arc<ApiKey>,
    permit: RatePermit,
    request: ChatRequest,
) -> Result<Response, GatewayError> {
    let requested_model = request.model.clone();
    let cancel = CancellationToken::new();
    let shared = Arc::new(request);
    let started = Instant::now();

    let outcome = state
        .orchestrator
        .execute(&requested_model, cancel.clone(), {
            let shared = Arc::clone(&shared);
            move |attempt| {
                let request = Arc::clone(&shared);
                async move {
                    attempt
                        .instance
                        .provider
                        .chat_stream(&request, &attempt.ctx)
                        .await
                }
                .boxed()
            }
        })
        .await?;

    let prompt_estimate = state.counter.count_messages(&shared.messages);
    Ok(relay_stream(
        state,
        key,
        permit,
        cancel,
        outcome,
        requested_model,
        prompt_estimate,
        started,
    ))
}

/// Relay a chunk stream to the client as SSE, then settle usage from the
/// terminal chunk (or an estimate when the backend stayed silent).
#[allow(clippy::too_many_arguments)]
fn relay_stream(
    state: Arc<AppState>,
    key: Arc<ApiKey>,
    permit: RatePermit,
    cancel: CancellationToken,
    outcome: FailoverOutcome<ChunkStream>,
    requested_model: String,
    prompt_estimate: u32,
    started: Instant,
) -> Response {
    let (mut sender, body) = Body::channel();
    let request_id = completion_id();

    tokio::spawn(async move {
        let _permit = permit;
        let mut stream = outcome.value;
        let mut reported_usage: Option<Usage> = None;
        let mut collected = String::new();
        let mut client_gone = false;
        let mut stream_error: Option<String> = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(mut chunk) => {
                    if let Some(usage) = &chunk.usage {
                        reported_usage = Some(usage.clone());
                    }
                    for choice in &chunk.choices {
                        if let Some(content) = choice.content() {
                            collected.push_str(content);
                        }
                    }
                    chunk.model = requested_model.clone();
                    let Ok(encoded) = serde_json::to_string(&chunk) else {
                        continue;
                    };
                    // Chunks are written and flushed one at a time, in
                    // arrival order.
                    if sender
                        .send_data(Bytes::from(format!("data: {encoded}\n\n")))
                        .await
                        .is_err()
                    {
                        client_gone = true;
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "stream failed mid-flight");
                    stream_error = Some(err.message.clone());
                    let error_chunk = StreamChunk::error(&requested_model, err.message);
                    if let Ok(encoded) = serde_json::to_string(&error_chunk) {
                        let _ = sender
                            .send_data(Bytes::from(format!("data: {encoded}\n\n")))
                            .await;
                    }
                    break;
                }
            }
        }

        if client_gone {
            // Propagate the disconnect upstream; the in-flight call must
            // abort promptly and unreceived tokens are never billed.
            cancel.cancel();
            debug!("client disconnected during stream");
        } else if stream_error.is_none() {
            let _ = sender.send_data(Bytes::from("data: [DONE]\n\n")).await;
        }
        drop(sender);

        let usage = reported_usage.unwrap_or_else(|| {
            let completion = state.counter.count(&collected);
            Usage {
                prompt_tokens: prompt_estimate,
                completion_tokens: completion,
                total_tokens: prompt_estimate + completion,
            }
        });
        // Billable outcome = some tokens actually flowed.
        if usage.total_tokens == 0 && collected.is_empty() {
            return;
        }
        settle(
            &state,
            Settlement {
                request_id,
                requested_model,
                logical_model: outcome.logical_model,
                instance: outcome.instance,
                key,
                usage,
                latency: started.elapsed(),
                status_code: 200,
                error_code: stream_error.as_ref().map(|_| "stream_error".to_string()),
                error_message: stream_error,
            },
        )
        .await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .expect("static header set is valid")
        .into_response()
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request: CompletionRequest = parse_body(&body)?;
    let (key, permit) = admit(&state, &headers, &request.model).await?;
    let requested_model = request.model.clone();
    let cancel = CancellationToken::new();
    let shared = Arc::new(request);
    let started = Instant::now();

    if shared.stream {
        let outcome = state
            .orchestrator
            .execute(&requested_model, cancel.clone(), {
                let shared = Arc::clone(&shared);
                move |attempt| {
                    let request = Arc::clone(&shared);
                    async move {
                        attempt
                            .instance
                            .provider
                            .completion_stream(&request, &attempt.ctx)
                            .await
                    }
                    .boxed()
                }
            })
            .await?;
        let prompt_estimate = match &shared.prompt {
            crate::llm::StringOrList::One(text) => state.counter.count(text),
            crate::llm::StringOrList::Many(parts) => {
                parts.iter().map(|part| state.counter.count(part)).sum()
            }
        };
        return Ok(relay_stream(
            state,
            key,
            permit,
            cancel,
            outcome,
            requested_model,
            prompt_estimate,
            started,
        ));
    }

    let outcome = state
        .orchestrator
        .execute(&requested_model, cancel, {
            let shared = Arc::clone(&shared);
            move |attempt| {
                let request = Arc::clone(&shared);
                async move {
                    attempt
                        .instance
                        .provider
                        .completion(&request, &attempt.ctx)
                        .await
                }
                .boxed()
            }
        })
        .await?;

    let mut response = outcome.value;
    response.model = requested_model.clone();
    let usage = response.usage.clone().unwrap_or_else(|| {
        let completion: u32 = response
            .choices
            .iter()
            .map(|choice| state.counter.count(&choice.text))
            .sum();
        Usage {
            prompt_tokens: 0,
            completion_tokens: completion,
            total_tokens: completion,
        }
    });
    settle(
        &state,
        Settlement {
            request_id: completion_id(),
            requested_model,
            logical_model: outcome.logical_model,
            instance: outcome.instance,
            key,
            usage,
            latency: started.elapsed(),
            status_code: 200,
            error_code: None,
            error_message: None,
        },
    )
    .await;
    drop(permit);
    Ok(Json(response).into_response())
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request: EmbeddingsRequest = parse_body(&body)?;
    let (key, permit) = admit(&state, &headers, &request.model).await?;
    let requested_model = request.model.clone();
    let shared = Arc::new(request);
    let started = Instant::now();

    let outcome = state
        .orchestrator
        .execute(&requested_model, CancellationToken::new(), {
            let shared = Arc::clone(&shared);
            move |attempt| {
                let request = Arc::clone(&shared);
                async move {
                    attempt
                        .instance
                        .provider
                        .embeddings(&request, &attempt.ctx)
                        .await
                }
                .boxed()
            }
        })
        .await?;

    let mut response = outcome.value;
    response.model = requested_model.clone();
    let usage = response.usage.clone().unwrap_or_default();
    settle(
        &state,
        Settlement {
            request_id: completion_id(),
            requested_model,
            logical_model: outcome.logical_model,
            instance: outcome.instance,
            key,
            usage,
            latency: started.elapsed(),
            status_code: 200,
            error_code: None,
            error_message: None,
        },
    )
    .await;
    drop(permit);
    Ok(Json(response).into_response())
}

pub async fn transcriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, GatewayError> {
    let mut model = None;
    let mut audio: Option<(String, Bytes)> = None;
    let mut language = None;
    let mut prompt = None;
    let mut response_format = None;
    let mut temperature = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| GatewayError::BadRequest(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("audio").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| GatewayError::BadRequest(err.to_string()))?;
                audio = Some((file_name, data));
            }
            "model" => model = Some(read_text_field(field).await?),
            "language" => language = Some(read_text_field(field).await?),
            "prompt" => prompt = Some(read_text_field(field).await?),
            "response_format" => response_format = Some(read_text_field(field).await?),
            "temperature" => {
                temperature = read_text_field(field).await?.parse::<f32>().ok();
            }
            _ => {}
        }
    }

    let model = model.ok_or_else(|| GatewayError::BadRequest("model field is required".into()))?;
    let (file_name, data) =
        audio.ok_or_else(|| GatewayError::BadRequest("file field is required".into()))?;
    let (key, permit) = admit(&state, &headers, &model).await?;

    let request = Arc::new(TranscriptionRequest {
        model: model.clone(),
        file_name,
        audio: data,
        language,
        prompt,
        response_format,
        temperature,
    });
    let started = Instant::now();

    let outcome = state
        .orchestrator
        .execute(&model, CancellationToken::new(), {
            let request = Arc::clone(&request);
            move |attempt| {
                let request = Arc::clone(&request);
                async move {
                    attempt
                        .instance
                        .provider
                        .transcription(&request, &attempt.ctx)
                        .await
                }
                .boxed()
            }
        })
        .await?;

    let response = outcome.value;
    let tokens = state.counter.count(&response.text);
    settle(
        &state,
        Settlement {
            request_id: completion_id(),
            requested_model: model,
            logical_model: outcome.logical_model,
            instance: outcome.instance,
            key,
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: tokens,
                total_tokens: tokens,
            },
            latency: started.elapsed(),
            status_code: 200,
            error_code: None,
            error_message: None,
        },
    )
    .await;
    drop(permit);
    Ok(Json(response).into_response())
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, GatewayError> {
    field
        .text()
        .await
        .map_err(|err| GatewayError::BadRequest(err.to_string()))
}

pub async fn speech(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request: SpeechRequest = parse_body(&body)?;
    let (key, permit) = admit(&state, &headers, &request.model).await?;
    let requested_model = request.model.clone();
    let input_tokens = state.counter.count(&request.input);
    let shared = Arc::new(request);
    let started = Instant::now();

    let outcome = state
        .orchestrator
        .execute(&requested_model, CancellationToken::new(), {
            let shared = Arc::clone(&shared);
            move |attempt| {
                let request = Arc::clone(&shared);
                async move {
                    attempt
                        .instance
                        .provider
                        .speech(&request, &attempt.ctx)
                        .await
                }
                .boxed()
            }
        })
        .await?;

    let audio = outcome.value;
    settle(
        &state,
        Settlement {
            request_id: completion_id(),
            requested_model,
            logical_model: outcome.logical_model,
            instance: outcome.instance,
            key,
            usage: Usage {
                prompt_tokens: input_tokens,
                completion_tokens: 0,
                total_tokens: input_tokens,
            },
            latency: started.elapsed(),
            status_code: 200,
            error_code: None,
            error_message: None,
        },
    )
    .await;
    drop(permit);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, audio.content_type)
        .body(Body::from(audio.audio))
        .expect("static header set is valid")
        .into_response())
}

pub async fn image_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request: ImageGenerationRequest = parse_body(&body)?;
    let model = request
        .model
        .clone()
        .ok_or_else(|| GatewayError::BadRequest("model field is required".into()))?;
    let (key, permit) = admit(&state, &headers, &model).await?;
    let shared = Arc::new(request);
    let started = Instant::now();

    let outcome = state
        .orchestrator
        .execute(&model, CancellationToken::new(), {
            let shared = Arc::clone(&shared);
            move |attempt| {
                let request = Arc::clone(&shared);
                async move {
                    attempt
                        .instance
                        .provider
                        .image_generate(&request, &attempt.ctx)
                        .await
                }
                .boxed()
            }
        })
        .await?;

    info!(model, "image generation served");
    settle(
        &state,
        Settlement {
            request_id: completion_id(),
            requested_model: model,
            logical_model: outcome.logical_model,
            instance: outcome.instance,
            key,
            usage: Usage::default(),
            latency: started.elapsed(),
            status_code: 200,
            error_code: None,
            error_message: None,
        },
    )
    .await;
    drop(permit);
    Ok(Json(outcome.value).into_response())
}
