//! Gemini `generateContent` client.

use reqwest::Client;
use serde_json::{json, Value};

use super::{error_for_status, http_client, ProviderError};
use crate::settings::{env_non_empty, ProviderSettings};

const PROVIDER: &str = "Gemini";

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>, settings: &ProviderSettings) -> Self {
        Self {
            client: http_client(),
            api_key,
            base_url: settings.gemini_base_url.trim_end_matches('/').to_string(),
            model: settings.gemini_model.clone(),
        }
    }

    /// Reads `GOOGLE_API_KEY`.
    pub fn from_env(settings: &ProviderSettings) -> Self {
        Self::new(env_non_empty("GOOGLE_API_KEY"), settings)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/models/{}:generateContent", self.base_url, self.model)
    }

    /// Send one prompt and return the first candidate's text.
    pub async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey("GOOGLE_API_KEY"))?;

        log::debug!("{}: prompt is {} chars", PROVIDER, prompt.len());

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .json(&json!({ "contents": [{ "parts": [{ "text": prompt }] }] }))
            .send()
            .await?;

        let body: Value = error_for_status(PROVIDER, response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse {
                provider: PROVIDER,
                message: e.to_string(),
            })?;

        let text = candidate_text(&body)?;
        log::info!("{}: {} chars generated", PROVIDER, text.len());
        Ok(text)
    }
}

/// `candidates[0].content.parts[*].text`, concatenated.
pub fn candidate_text(body: &Value) -> Result<String, ProviderError> {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Failed("No candidates".to_string()))?;

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Parse {
            provider: PROVIDER,
            message: "candidate has no content parts".to_string(),
        })?;

    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<String>())
}

/// Remove Markdown code fences models like to wrap JSON in.
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "").replace("```", "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_candidate_text_is_returned() {
        let body = json!({
            "candidates": [
                { "content": { "parts": [{ "text": "Hello " }, { "text": "there" }] } },
                { "content": { "parts": [{ "text": "ignored" }] } }
            ]
        });
        assert_eq!(candidate_text(&body).unwrap(), "Hello there");
    }

    #[test]
    fn no_candidates_is_an_error() {
        assert_eq!(
            candidate_text(&json!({ "candidates": [] })),
            Err(ProviderError::Failed("No candidates".to_string()))
        );
        assert!(candidate_text(&json!({ "promptFeedback": {} })).is_err());
    }

    #[test]
    fn code_fences_are_stripped() {
        let fenced = "```json\n{\"speech\": \"hi\"}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"speech\": \"hi\"}");
        assert_eq!(strip_code_fences("  plain  "), "plain");
    }

    #[test]
    fn endpoint_uses_model_and_trimmed_base() {
        let settings = ProviderSettings {
            gemini_base_url: "http://127.0.0.1:4000/".to_string(),
            gemini_model: "gemini-2.5-flash".to_string(),
            ..ProviderSettings::default()
        };
        let client = GeminiClient::new(Some("k".into()), &settings);
        assert_eq!(
            client.endpoint(),
            "http://127.0.0.1:4000/v1/models/gemini-2.5-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let client = GeminiClient::new(None, &ProviderSettings::default());
        assert_eq!(
            client.generate("hi").await,
            Err(ProviderError::MissingApiKey("GOOGLE_API_KEY"))
        );
    }
}
