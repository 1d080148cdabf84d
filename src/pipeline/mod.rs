//! The remote half of a turn: speech-to-text, then reply generation with
//! synthesized audio.
//!
//! The turn controller only sees [`RemotePipeline`]. It is implemented
//! in-process by [`crate::service::AgentService`] and over HTTP by
//! [`BackendClient`], which talks to the routes in [`crate::server`].

pub mod client;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;

use crate::audio::AudioClip;
use crate::conversation::ConversationState;

pub use client::BackendClient;

/// One generated reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub speech: String,
    pub state: ConversationState,
    pub is_complete: bool,
    /// Encoded speech audio. `None` when synthesis failed or was skipped.
    pub audio: Option<Vec<u8>>,
}

/// The persona's opening line, spoken before the first turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Greeting {
    pub speech: String,
    /// `None` when synthesis failed; the line is still shown.
    pub audio: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Transcription,
    Generation,
    Synthesis,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Transcription => write!(f, "Transcription"),
            Leg::Generation => write!(f, "Generation"),
            Leg::Synthesis => write!(f, "Synthesis"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("{leg} timed out after {after:?}")]
    Timeout { leg: Leg, after: Duration },
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("{0}")]
    Remote(String),
    #[error("Unexpected response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait RemotePipeline: Send + Sync + 'static {
    /// Convert a captured clip to text. Blank text means nothing was said.
    async fn transcribe(&self, clip: AudioClip) -> Result<String, PipelineError>;

    /// Produce the reply to `transcript` given the full prior state.
    async fn generate(
        &self,
        transcript: &str,
        state: &ConversationState,
    ) -> Result<TurnReply, PipelineError>;

    /// The persona's opening line with its audio, if the persona has one.
    async fn greeting(&self) -> Result<Option<Greeting>, PipelineError>;
}

/// Bound a pipeline call so a hung provider cannot stall the turn.
pub async fn with_timeout<T, F>(leg: Leg, after: Duration, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout { leg, after }),
    }
}

/// `data:<mime>;base64,<payload>`
pub fn encode_audio_data_url(audio: &[u8], mime: &str) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(audio)
    )
}

/// Accepts a base64 data URL or bare base64.
pub fn decode_audio_data_url(value: &str) -> Result<Vec<u8>, PipelineError> {
    let payload = match value.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| PipelineError::Malformed("audio data URL has no payload".into()))?;
            if !header.ends_with(";base64") {
                return Err(PipelineError::Malformed(format!(
                    "audio data URL is not base64 ({})",
                    header
                )));
            }
            data
        }
        None => value,
    };

    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| PipelineError::Malformed(format!("audio payload: {}", e)))
}
