//! Gateway error taxonomy and its mapping onto the HTTP surface
//!
//! Every error the request plane can produce is a [`GatewayError`] kind.
//! The `IntoResponse` impl is the single place that decides which HTTP
//! status and OpenAI-style error body a kind surfaces as.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::llm::providers::{UpstreamError, UpstreamErrorKind};

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("model access denied: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("budget exceeded: {0}")]
    BudgetDenied(String),

    #[error("rate limit exceeded: {message}")]
    RateDenied {
        message: String,
        retry_after: Option<u64>,
    },

    /// Every candidate instance (and fallback model) was tried and failed.
    #[error("all instances failed after {attempts} attempts: {last_error}")]
    AllInstancesFailed {
        attempts: u32,
        last_error: String,
        /// The last classified failure, used to pick 503 vs 504 vs 429.
        last_kind: UpstreamErrorKind,
        retry_after: Option<u64>,
    },

    /// A permanent upstream failure that must not be retried; the provider's
    /// status code passes through to the client.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The client went away; the connection is closed without a body.
    #[error("client canceled the request")]
    Canceled,

    /// Shared or durable store trouble. Never fatal on the request path; this
    /// kind only surfaces from endpoints that exist to report it (`/ready`).
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BudgetDenied(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::RateDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::AllInstancesFailed { last_kind, .. } => match last_kind {
                UpstreamErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                UpstreamErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            GatewayError::Upstream(err) => err
                .status_code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable `error.type` in the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "invalid_request_error",
            GatewayError::Forbidden(_) => "permission_error",
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::ModelNotFound(_) => "invalid_request_error",
            GatewayError::BudgetDenied(_) => "budget_exceeded",
            GatewayError::RateDenied { .. } => "rate_limit_error",
            GatewayError::AllInstancesFailed { .. } => "service_unavailable",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::Canceled => "client_closed_request",
            GatewayError::StoreUnavailable(_) => "service_unavailable",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Machine-readable `error.code`, where one is defined for the kind.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            GatewayError::Unauthorized(_) => Some("invalid_api_key"),
            GatewayError::ModelNotFound(_) => Some("model_not_found"),
            GatewayError::BudgetDenied(_) => Some("budget_exceeded"),
            GatewayError::RateDenied { .. } => Some("rate_limit_exceeded"),
            GatewayError::AllInstancesFailed { .. } => Some("all_instances_failed"),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateDenied { retry_after, .. } => *retry_after,
            GatewayError::AllInstancesFailed { retry_after, .. } => *retry_after,
            GatewayError::Upstream(err) => err.retry_after,
            _ => None,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::StoreUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::StoreUnavailable(err.to_string())
    }
}

impl From<crate::store::StoreError> for GatewayError {
    fn from(err: crate::store::StoreError) -> Self {
        GatewayError::StoreUnavailable(err.to_string())
    }
}

/// OpenAI-compatible error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(self, GatewayError::Canceled) {
            // The client is gone; there is nobody to send a body to.
            return StatusCode::from_u16(499)
                .unwrap_or(StatusCode::BAD_REQUEST)
                .into_response();
        }

        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                error_type: self.error_type().to_string(),
                param: None,
                code: self.error_code().map(str::to_string),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after() {
            if let Ok(value) = header::HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
