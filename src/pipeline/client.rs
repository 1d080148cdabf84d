//! HTTP client for a running backend (`voice-turn-agent serve`).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

use super::{decode_audio_data_url, Greeting, PipelineError, RemotePipeline, TurnReply};
use crate::audio::AudioClip;
use crate::conversation::{ConversationState, Persona};

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct BackendClient {
    client: Client,
    base_url: String,
    persona: Persona,
}

impl BackendClient {
    /// `persona` supplies the request and response keys the backend's persona
    /// uses; it must match the one the backend was started with.
    pub fn new(base_url: &str, persona: Persona) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("HTTP client builder failed ({}), using defaults", e);
                Client::new()
            });

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            persona,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn generate_body(&self, transcript: &str, state: &ConversationState) -> Value {
        let mut body = Map::new();
        body.insert("text".to_string(), Value::String(transcript.to_string()));
        if let Some(key) = &self.persona.request_key {
            body.insert(key.clone(), state.as_value().clone());
        }
        Value::Object(body)
    }

    /// Read a `/api/generate` response body. A missing state key keeps `prior`.
    fn parse_reply(&self, body: &Value, prior: &ConversationState) -> Result<TurnReply, PipelineError> {
        let speech = body
            .get("reply")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Malformed("response has no reply".into()))?
            .to_string();

        let state = self
            .persona
            .response_key
            .as_ref()
            .and_then(|k| body.get(k))
            .filter(|v| !v.is_null())
            .map(|v| ConversationState::new(v.clone()))
            .unwrap_or_else(|| prior.clone());

        let is_complete = self
            .persona
            .completion_key
            .as_ref()
            .and_then(|k| body.get(k))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let audio = reply_audio(body)?;

        Ok(TurnReply {
            speech,
            state,
            is_complete,
            audio,
        })
    }
}

/// Decode the reply audio. An absent `audio` field is not an error.
fn reply_audio(body: &Value) -> Result<Option<Vec<u8>>, PipelineError> {
    match body.get("audio").and_then(Value::as_str) {
        Some(url) => Ok(Some(decode_audio_data_url(url)?)),
        None => {
            if let Some(err) = body.get("error").and_then(Value::as_str) {
                log::warn!("Backend returned no audio: {}", err);
            }
            Ok(None)
        }
    }
}

#[async_trait]
impl RemotePipeline for BackendClient {
    async fn transcribe(&self, clip: AudioClip) -> Result<String, PipelineError> {
        if clip.is_empty() {
            return Ok(String::new());
        }

        let response = self
            .client
            .post(self.url("/api/transcribe"))
            .header("Content-Type", "audio/wav")
            .body(clip.into_bytes())
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        let status = response.status();
        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Malformed(format!("transcribe ({}): {}", status, e)))?;

        match body.error.filter(|e| !e.is_empty()) {
            Some(err) => Err(PipelineError::Remote(err)),
            None => Ok(body.transcript),
        }
    }

    async fn generate(
        &self,
        transcript: &str,
        state: &ConversationState,
    ) -> Result<TurnReply, PipelineError> {
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&self.generate_body(transcript, state))
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Malformed(format!("generate ({}): {}", status, e)))?;

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("backend returned {}", status));
            return Err(PipelineError::Remote(message));
        }

        self.parse_reply(&body, state)
    }

    async fn greeting(&self) -> Result<Option<Greeting>, PipelineError> {
        let response = self
            .client
            .post(self.url("/api/greeting"))
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Remote(format!("backend returned {}", status)));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Malformed(format!("greeting ({}): {}", status, e)))?;

        parse_greeting(&body)
    }
}

fn parse_greeting(body: &Value) -> Result<Option<Greeting>, PipelineError> {
    let Some(speech) = body.get("reply").and_then(Value::as_str) else {
        return Ok(None);
    };
    Ok(Some(Greeting {
        speech: speech.to_string(),
        audio: reply_audio(body)?,
    }))
}
