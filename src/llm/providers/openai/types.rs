//! Wire-level helpers shared by the OpenAI and Azure adapters.

use serde::Deserialize;

/// Error envelope the backend returns on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<serde_json::Value>,
}

/// Pull the human-readable message out of an error body, falling back to
/// the raw text when it is not the documented JSON shape.
pub fn parse_error_body(raw: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(raw) {
        Ok(envelope) => envelope.error.message,
        Err(_) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                "upstream returned an empty error body".to_string()
            } else {
                trimmed.chars().take(512).collect()
            }
        }
    }
}

/// Retry-After in seconds, when the backend sent one.
pub fn read_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_parses_documented_shape() {
        let raw = r#"{"error":{"message":"bad key","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        assert_eq!(parse_error_body(raw), "bad key");
    }

    #[test]
    fn error_body_falls_back_to_raw_text() {
        assert_eq!(parse_error_body("gateway exploded"), "gateway exploded");
    }
}
