//! AssemblyAI batch transcription: upload, start a job, poll until done.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{error_for_status, http_client, ProviderError};
use crate::settings::{env_non_empty, ProviderSettings};

const PROVIDER: &str = "AssemblyAI";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptJob {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptStatus {
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssemblyAiClient {
    client: Client,
    api_key: Option<String>,
    upload_url: String,
    transcript_url: String,
    poll_interval: Duration,
}

impl AssemblyAiClient {
    pub fn new(api_key: Option<String>, settings: &ProviderSettings) -> Self {
        Self {
            client: http_client(),
            api_key,
            upload_url: settings.assemblyai_upload_url.clone(),
            transcript_url: settings
                .assemblyai_transcript_url
                .trim_end_matches('/')
                .to_string(),
            poll_interval: Duration::from_millis(settings.transcript_poll_ms.max(10)),
        }
    }

    /// Reads `ASSEMBLYAI_API_KEY`.
    pub fn from_env(settings: &ProviderSettings) -> Self {
        Self::new(env_non_empty("ASSEMBLYAI_API_KEY"), settings)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Transcribe encoded audio. Empty input short-circuits to an empty transcript.
    ///
    /// Polls without its own deadline; callers bound the whole call.
    pub async fn transcribe(&self, audio: Vec<u8>) -> Result<String, ProviderError> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey("ASSEMBLYAI_API_KEY"))?;

        log::info!("{}: uploading {} bytes", PROVIDER, audio.len());
        let response = self
            .client
            .post(&self.upload_url)
            .header("Authorization", api_key)
            .header("Content-Type", "application/octet-stream")
            .body(audio)
            .send()
            .await?;
        let upload: UploadResponse = error_for_status(PROVIDER, response)
            .await?
            .json()
            .await
            .map_err(parse_error)?;

        let response = self
            .client
            .post(&self.transcript_url)
            .header("Authorization", api_key)
            .json(&json!({ "audio_url": upload.upload_url }))
            .send()
            .await?;
        let job: TranscriptJob = error_for_status(PROVIDER, response)
            .await?
            .json()
            .await
            .map_err(parse_error)?;

        log::debug!("{}: polling transcript {}", PROVIDER, job.id);
        let poll_url = format!("{}/{}", self.transcript_url, job.id);

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .client
                .get(&poll_url)
                .header("Authorization", api_key)
                .send()
                .await?;
            let status: TranscriptStatus = error_for_status(PROVIDER, response)
                .await?
                .json()
                .await
                .map_err(parse_error)?;

            match status.status.as_str() {
                "completed" => {
                    let text = status.text.unwrap_or_default();
                    log::info!("{}: transcript ready ({} chars)", PROVIDER, text.len());
                    return Ok(text);
                }
                "error" => {
                    return Err(ProviderError::Failed(format!(
                        "Transcription failed: {}",
                        status.error.unwrap_or_else(|| "unknown error".to_string())
                    )));
                }
                other => log::trace!("{}: job {} is {}", PROVIDER, job.id, other),
            }
        }
    }
}

fn parse_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Parse {
        provider: PROVIDER,
        message: e.to_string(),
    }
}
