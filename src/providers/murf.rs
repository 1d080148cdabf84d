//! Murf text-to-speech. Returns the encoded audio bytes.

use reqwest::Client;
use serde_json::json;

use super::{error_for_status, http_client, ProviderError};
use crate::settings::{env_non_empty, ProviderSettings};

const PROVIDER: &str = "Murf";

#[derive(Debug, Clone)]
pub struct MurfClient {
    client: Client,
    api_key: Option<String>,
    url: String,
    model: String,
    locale: String,
    format: String,
    sample_rate: u32,
}

impl MurfClient {
    pub fn new(api_key: Option<String>, settings: &ProviderSettings) -> Self {
        Self {
            client: http_client(),
            api_key,
            url: settings.murf_tts_url.clone(),
            model: settings.murf_model.clone(),
            locale: settings.murf_locale.clone(),
            format: settings.murf_format.clone(),
            sample_rate: settings.murf_sample_rate,
        }
    }

    /// Reads `MURF_API_KEY`.
    pub fn from_env(settings: &ProviderSettings) -> Self {
        Self::new(env_non_empty("MURF_API_KEY"), settings)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// MIME type of the audio this client requests.
    pub fn mime_type(&self) -> &'static str {
        match self.format.to_ascii_uppercase().as_str() {
            "WAV" => "audio/wav",
            "OGG" => "audio/ogg",
            "FLAC" => "audio/flac",
            _ => "audio/mp3",
        }
    }

    pub async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingApiKey("MURF_API_KEY"))?;

        log::info!(
            "{}: synthesizing {} chars with {}",
            PROVIDER,
            text.len(),
            voice_id
        );

        let response = self
            .client
            .post(&self.url)
            .header("api-key", api_key)
            .json(&json!({
                "voiceId": voice_id,
                "text": text,
                "multiNativeLocale": self.locale,
                "model": self.model,
                "format": self.format,
                "sampleRate": self.sample_rate,
                "channelType": "MONO",
            }))
            .send()
            .await?;

        let audio = error_for_status(PROVIDER, response).await?.bytes().await?;
        if audio.is_empty() {
            return Err(ProviderError::Failed(format!("{} returned no audio", PROVIDER)));
        }

        log::debug!("{}: {} bytes of audio", PROVIDER, audio.len());
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_type_follows_format() {
        let mut settings = ProviderSettings::default();
        assert_eq!(MurfClient::new(None, &settings).mime_type(), "audio/mp3");

        settings.murf_format = "wav".to_string();
        assert_eq!(MurfClient::new(None, &settings).mime_type(), "audio/wav");
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let client = MurfClient::new(None, &ProviderSettings::default());
        assert_eq!(
            client.synthesize("hello", "en-US-matthew").await,
            Err(ProviderError::MissingApiKey("MURF_API_KEY"))
        );
    }
}
