//! HTTP backend for one persona.
//!
//! `POST /api/transcribe` takes raw audio bytes. `POST /api/generate` takes
//! `{ "text", "<requestKey>": state }` and answers with the reply, the new
//! state under the persona's response key, the completion flag under its
//! completion key and the speech as a base64 data URL. `POST /api/greeting`
//! answers the same way with the persona's opening line, or `{ "reply": null }`
//! for a persona without one.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde_json::{json, Map, Value};

use crate::conversation::ConversationState;
use crate::pipeline::encode_audio_data_url;
use crate::service::{AgentService, GenerateOutcome};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    service: Arc<AgentService>,
}

pub fn create_router(service: Arc<AgentService>) -> Router {
    Router::new()
        .route("/api/transcribe", post(transcribe))
        .route("/api/generate", post(generate))
        .route("/api/greeting", post(greeting))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(AppState { service })
}

/// Serve until ctrl-c.
pub async fn serve(addr: SocketAddr, service: Arc<AgentService>) -> std::io::Result<()> {
    let persona = service.persona().name.clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Serving persona '{}' on http://{}", persona, listener.local_addr()?);

    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {}", e);
            }
            log::info!("Shutting down");
        })
        .await
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "persona": state.service.persona().name }))
}

async fn transcribe(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    log::info!("POST /api/transcribe ({} bytes)", body.len());

    match state.service.transcribe_bytes(body.to_vec()).await {
        Ok(transcript) => (StatusCode::OK, Json(json!({ "transcript": transcript }))),
        Err(e) => {
            log::error!("Transcribe failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "transcript": "", "error": e.to_string() })),
            )
        }
    }
}

async fn generate(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let service = &state.service;
    let persona = service.persona();

    let text = body.get("text").and_then(Value::as_str).unwrap_or_default();
    log::info!("POST /api/generate ({} chars)", text.len());

    // A missing or null state starts the conversation fresh.
    let prior = persona
        .request_key
        .as_ref()
        .and_then(|k| body.get(k))
        .filter(|v| !v.is_null())
        .map(|v| ConversationState::new(v.clone()))
        .unwrap_or_else(|| service.initial_state());

    match service.generate_reply(text, &prior).await {
        Ok(outcome) => (StatusCode::OK, Json(reply_body(service, outcome))),
        Err(e) => {
            log::error!("Generate failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn greeting(State(state): State<AppState>) -> Json<Value> {
    log::info!("POST /api/greeting");
    match state.service.greeting_reply().await {
        Some(outcome) => Json(reply_body(&state.service, outcome)),
        None => Json(json!({ "reply": null })),
    }
}

fn reply_body(service: &AgentService, outcome: GenerateOutcome) -> Value {
    let persona = service.persona();
    let mut body = Map::new();
    body.insert("reply".to_string(), Value::String(outcome.speech));
    if let Some(key) = &persona.response_key {
        body.insert(key.clone(), outcome.state.into_value());
    }

    if let Some(key) = &persona.completion_key {
        body.insert(key.clone(), Value::Bool(outcome.is_complete));
    }
    if let Some(audio) = outcome.audio {
        body.insert(
            "audio".to_string(),
            Value::String(encode_audio_data_url(&audio, outcome.audio_mime)),
        );
    }
    if let Some(err) = outcome.tts_error {
        body.insert("error".to_string(), Value::String(err));
    }

    Value::Object(body)
}
