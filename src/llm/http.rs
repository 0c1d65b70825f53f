use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::ProviderError;
use crate::llm::classify_status;

const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

pub(crate) fn build_client(provider: &str, timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| ProviderError::invalid_request(provider, format!("failed to build HTTP client: {err}")))
}

/// Sends a prepared request and decodes a JSON success body, mapping every
/// failure onto the shared taxonomy.
pub(crate) async fn send_json<R: DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<R, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|err| transport_error(provider, &err))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| transport_error(provider, &err))?;

    if !status.is_success() {
        let message = extract_error_message(&body)
            .unwrap_or_else(|| format!("HTTP {status}: {}", clip(&body)));
        return Err(ProviderError::new(
            provider,
            classify_status(status.as_u16(), &body),
            message,
        ));
    }

    serde_json::from_str(&body)
        .map_err(|err| ProviderError::server(provider, format!("invalid response body: {err}")))
}

fn transport_error(provider: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::network(provider, "request timed out")
    } else {
        ProviderError::network(provider, err.to_string())
    }
}

/// All three public APIs wrap failures as `{"error": {"message": ...}}`.
pub(crate) fn extract_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error.message)
        .filter(|message| !message.trim().is_empty())
}

fn clip(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_nested_error_message() {
        let anthropic = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        assert_eq!(
            extract_error_message(anthropic).as_deref(),
            Some("invalid x-api-key")
        );

        let gemini = r#"{"error":{"code":429,"message":"Resource exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            extract_error_message(gemini).as_deref(),
            Some("Resource exhausted")
        );

        assert!(extract_error_message("<html>bad gateway</html>").is_none());
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY_CHARS + 5);
        let clipped = clip(&body);
        assert!(clipped.ends_with("..."));
        assert_eq!(clipped.chars().count(), MAX_ERROR_BODY_CHARS + 3);
    }
}
