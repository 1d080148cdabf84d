//! Cloud provider clients: AssemblyAI (speech-to-text), Gemini (generation)
//! and Murf (text-to-speech).
//!
//! Keys are read from the environment. A missing key is only an error when
//! the provider is actually called.

pub mod assemblyai;
pub mod gemini;
pub mod murf;

use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

pub use assemblyai::AssemblyAiClient;
pub use gemini::{strip_code_fences, GeminiClient};
pub use murf::MurfClient;

/// Shared HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

pub fn http_client() -> Client {
    HTTP_CLIENT
        .get_or_init(|| {
            Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|e| {
                    log::warn!("HTTP client builder failed, using defaults: {}", e);
                    Client::new()
                })
        })
        .clone()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{0} not configured")]
    MissingApiKey(&'static str),
    #[error("Network error: {0}")]
    Network(String),
    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("Failed to parse {provider} response: {message}")]
    Parse {
        provider: &'static str,
        message: String,
    },
    #[error("{0}")]
    Failed(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiErrorBody {
    Nested { error: ApiErrorDetail },
    Flat { error: String },
    Message { message: String },
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Best-effort extraction of a provider's error message from a response body.
pub(crate) fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody::Nested { error }) => error.message,
        Ok(ApiErrorBody::Flat { error }) => error,
        Ok(ApiErrorBody::Message { message }) => message,
        Err(_) => body.trim().to_string(),
    }
}

/// Turn a non-success response into `ProviderError::Api`.
pub(crate) async fn error_for_status(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = api_error_message(&body);
    log::error!("{} API error ({}): {}", provider, status.as_u16(), message);
    Err(ProviderError::Api {
        provider,
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_extracted_from_common_shapes() {
        assert_eq!(
            api_error_message(r#"{"error":{"message":"API key not valid","code":400}}"#),
            "API key not valid"
        );
        assert_eq!(
            api_error_message(r#"{"error":"Invalid API key"}"#),
            "Invalid API key"
        );
        assert_eq!(
            api_error_message(r#"{"message":"voice not found"}"#),
            "voice not found"
        );
        assert_eq!(api_error_message("Bad Gateway\n"), "Bad Gateway");
    }
}
