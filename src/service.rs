//! In-process agent: the generation leg for one persona.
//!
//! Transcription goes to AssemblyAI. Generation renders the persona prompt
//! with the full prior state, asks Gemini, interprets the completion (plain
//! text or JSON with speech, state and completion keys), folds the proposed
//! state in per the persona's merge policy, records finished conversations,
//! and synthesizes the reply with Murf. A synthesis failure still returns the
//! reply text and state. Each provider call has its own time bound.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::audio::AudioClip;
use crate::conversation::{ConversationState, InteractionRecord, Persona, RecordStore, ReplyFormat};
use crate::pipeline::{Greeting, Leg, PipelineError, RemotePipeline, TurnReply};
use crate::providers::{strip_code_fences, AssemblyAiClient, GeminiClient, MurfClient, ProviderError};
use crate::settings::{AppSettings, TurnConfig};

/// Reported in place of audio when synthesis fails.
pub const TTS_FAILED: &str = "TTS Failed";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{leg} timed out after {after:?}")]
    Timeout { leg: Leg, after: Duration },
}

impl From<ServiceError> for PipelineError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Timeout { leg, after } => PipelineError::Timeout { leg, after },
            ServiceError::Provider(ProviderError::Network(msg)) => PipelineError::Transport(msg),
            ServiceError::Provider(other) => PipelineError::Remote(other.to_string()),
        }
    }
}

/// What the model said, after interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub speech: String,
    pub state: ConversationState,
    pub is_complete: bool,
    pub voice_id: String,
}

#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub speech: String,
    pub state: ConversationState,
    pub is_complete: bool,
    pub audio: Option<Vec<u8>>,
    pub audio_mime: &'static str,
    /// Set when synthesis failed; the reply is still usable as text.
    pub tts_error: Option<String>,
    pub record: Option<InteractionRecord>,
}

pub struct AgentService {
    persona: Persona,
    knowledge: String,
    records: RecordStore,
    stt: AssemblyAiClient,
    llm: GeminiClient,
    tts: MurfClient,
    transcription_timeout: Duration,
    generation_timeout: Duration,
    synthesis_timeout: Duration,
}

impl AgentService {
    pub fn new(
        persona: Persona,
        records: RecordStore,
        knowledge: String,
        stt: AssemblyAiClient,
        llm: GeminiClient,
        tts: MurfClient,
        turn: &TurnConfig,
    ) -> Self {
        Self {
            persona,
            knowledge,
            records,
            stt,
            llm,
            tts,
            transcription_timeout: turn.transcription_timeout(),
            generation_timeout: turn.generation_timeout(),
            synthesis_timeout: turn.synthesis_timeout(),
        }
    }

    /// Build from settings, with provider keys and endpoint overrides from the
    /// environment.
    pub fn from_settings(settings: &AppSettings, persona: Persona) -> Self {
        let mut providers = settings.providers.clone();
        providers.apply_env();

        let data_dir = settings.data_dir();
        let knowledge = load_knowledge(&data_dir, &persona);

        let stt = AssemblyAiClient::from_env(&providers);
        let llm = GeminiClient::from_env(&providers);
        let tts = MurfClient::from_env(&providers);
        for (name, configured) in [
            ("ASSEMBLYAI_API_KEY", stt.is_configured()),
            ("GOOGLE_API_KEY", llm.is_configured()),
            ("MURF_API_KEY", tts.is_configured()),
        ] {
            if !configured {
                log::warn!("{} is not set; that provider will fail", name);
            }
        }

        Self::new(
            persona,
            RecordStore::new(data_dir),
            knowledge,
            stt,
            llm,
            tts,
            &settings.turn,
        )
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn initial_state(&self) -> ConversationState {
        ConversationState::new(self.persona.initial_state.clone())
    }

    pub async fn transcribe_bytes(&self, audio: Vec<u8>) -> Result<String, ServiceError> {
        let after = self.transcription_timeout;
        match tokio::time::timeout(after, self.stt.transcribe(audio)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ServiceError::Timeout {
                leg: Leg::Transcription,
                after,
            }),
        }
    }

    pub async fn generate_reply(
        &self,
        text: &str,
        prior: &ConversationState,
    ) -> Result<GenerateOutcome, ServiceError> {
        let prompt = self
            .persona
            .render_prompt(text, prior.as_value(), &self.knowledge);

        let after = self.generation_timeout;
        let completion = match tokio::time::timeout(after, self.llm.generate(&prompt)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ServiceError::Timeout {
                    leg: Leg::Generation,
                    after,
                })
            }
        };

        let reply = interpret_completion(&self.persona, &completion, prior);
        log::info!(
            "{}: reply {} chars, complete={}",
            self.persona.name,
            reply.speech.len(),
            reply.is_complete
        );

        let record = if reply.is_complete {
            self.save_record(&reply.state).await
        } else {
            None
        };

        let (audio, tts_error) = self.speak(&reply.speech, &reply.voice_id).await;

        Ok(GenerateOutcome {
            speech: reply.speech,
            state: reply.state,
            is_complete: reply.is_complete,
            audio,
            audio_mime: self.tts.mime_type(),
            tts_error,
            record,
        })
    }

    /// The persona's opening line, synthesized with its default voice.
    pub async fn greeting_reply(&self) -> Option<GenerateOutcome> {
        let speech = self.persona.greeting.clone()?;
        let (audio, tts_error) = self.speak(&speech, &self.persona.voice_id).await;
        Some(GenerateOutcome {
            speech,
            state: self.initial_state(),
            is_complete: false,
            audio,
            audio_mime: self.tts.mime_type(),
            tts_error,
            record: None,
        })
    }

    /// Synthesize `text`. Failures and timeouts become a `TTS Failed` marker.
    async fn speak(&self, text: &str, voice_id: &str) -> (Option<Vec<u8>>, Option<String>) {
        if text.trim().is_empty() {
            return (None, None);
        }

        let after = self.synthesis_timeout;
        let result = match tokio::time::timeout(after, self.tts.synthesize(text, voice_id)).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Timeout {
                leg: Leg::Synthesis,
                after,
            }),
        };

        match result {
            Ok(audio) => (Some(audio), None),
            Err(e) => {
                log::warn!("Synthesis failed, replying without audio: {}", e);
                (None, Some(TTS_FAILED.to_string()))
            }
        }
    }

    async fn save_record(&self, state: &ConversationState) -> Option<InteractionRecord> {
        let file = self.persona.records_file.clone()?;
        let prefix = self.persona.record_prefix.clone();
        let store = self.records.clone();
        let state = state.clone();

        match tokio::task::spawn_blocking(move || store.append(&file, &prefix, &state)).await {
            Ok(Ok(record)) => Some(record),
            Ok(Err(e)) => {
                log::error!("Failed to save record: {}", e);
                None
            }
            Err(e) => {
                log::error!("Record task failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl RemotePipeline for AgentService {
    async fn transcribe(&self, clip: AudioClip) -> Result<String, PipelineError> {
        Ok(self.transcribe_bytes(clip.into_bytes()).await?)
    }

    async fn generate(
        &self,
        transcript: &str,
        state: &ConversationState,
    ) -> Result<TurnReply, PipelineError> {
        let outcome = self.generate_reply(transcript, state).await?;
        Ok(TurnReply {
            speech: outcome.speech,
            state: outcome.state,
            is_complete: outcome.is_complete,
            audio: outcome.audio,
        })
    }

    async fn greeting(&self) -> Result<Option<Greeting>, PipelineError> {
        Ok(self.greeting_reply().await.map(|outcome| Greeting {
            speech: outcome.speech,
            audio: outcome.audio,
        }))
    }
}

/// Read the persona's knowledge file from the data directory. Missing files
/// read as empty so the prompt still renders.
pub fn load_knowledge(data_dir: &Path, persona: &Persona) -> String {
    let Some(file) = &persona.knowledge_file else {
        return String::new();
    };
    let path = data_dir.join(file);
    match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("Knowledge file {:?} unavailable: {}", path, e);
            String::new()
        }
    }
}

/// Interpret a raw completion for `persona`.
///
/// Unparsable JSON falls back to the persona's fallback line with `prior`
/// carried forward and the conversation left open.
pub fn interpret_completion(
    persona: &Persona,
    completion: &str,
    prior: &ConversationState,
) -> ModelReply {
    let fallback = || ModelReply {
        speech: persona.fallback_line.clone(),
        state: prior.clone(),
        is_complete: false,
        voice_id: persona.voice_id.clone(),
    };

    if persona.reply_format == ReplyFormat::Text {
        let speech = completion.trim();
        if speech.is_empty() {
            return fallback();
        }
        return ModelReply {
            speech: speech.to_string(),
            ..fallback()
        };
    }

    let obj = match serde_json::from_str::<Value>(&strip_code_fences(completion)) {
        Ok(Value::Object(obj)) => obj,
        Ok(_) | Err(_) => {
            log::warn!("{}: model reply is not a JSON object", persona.name);
            return fallback();
        }
    };

    let speech = obj
        .get(&persona.speech_key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| persona.fallback_line.clone());

    let state = match persona.response_key.as_ref().and_then(|k| obj.get(k)) {
        Some(proposed) if !proposed.is_null() => {
            prior.apply(ConversationState::new(proposed.clone()), persona.merge)
        }
        _ => prior.clone(),
    };

    let is_complete = persona
        .completion_key
        .as_ref()
        .and_then(|k| obj.get(k))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let voice_id = persona
        .voice_key
        .as_ref()
        .and_then(|k| obj.get(k))
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| persona.voice_id.clone());

    ModelReply {
        speech,
        state,
        is_complete,
        voice_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::find_persona;
    use serde_json::json;

    fn persona(name: &str) -> Persona {
        find_persona(name, &[]).unwrap()
    }

    #[test]
    fn sdr_reply_merges_non_blank_fields() {
        let prior = ConversationState::new(json!({ "name": "", "role": "CTO" }));
        let completion = r#"```json
        {
          "speech": "Nice to meet you, Alex!",
          "lead": { "name": "Alex", "role": "unknown" },
          "isComplete": false
        }
        ```"#;

        let reply = interpret_completion(&persona("sdr"), completion, &prior);
        assert_eq!(reply.speech, "Nice to meet you, Alex!");
        assert_eq!(
            reply.state,
            ConversationState::new(json!({ "name": "Alex", "role": "CTO" }))
        );
        assert!(!reply.is_complete);
    }

    #[test]
    fn replace_policy_takes_model_state() {
        let prior = ConversationState::new(json!({ "drinkType": "Latte", "size": "Large" }));
        let completion = r#"{"speech":"Anything else?","order":{"drinkType":"Mocha","size":""},"isComplete":true}"#;

        let reply = interpret_completion(&persona("barista"), completion, &prior);
        assert_eq!(
            reply.state,
            ConversationState::new(json!({ "drinkType": "Mocha", "size": "" }))
        );
        assert!(reply.is_complete);
    }

    #[test]
    fn unparsable_json_falls_back_with_prior_state() {
        let p = persona("sdr");
        let prior = ConversationState::new(json!({ "name": "Sam" }));

        let reply = interpret_completion(&p, "Sure! Let me check that.", &prior);
        assert_eq!(reply.speech, p.fallback_line);
        assert_eq!(reply.state, prior);
        assert!(!reply.is_complete);
    }

    #[test]
    fn missing_state_key_keeps_prior() {
        let prior = ConversationState::new(json!({ "hp": 10 }));
        let reply = interpret_completion(
            &persona("game-master"),
            r#"{"speech":"The door creaks open."}"#,
            &prior,
        );
        assert_eq!(reply.speech, "The door creaks open.");
        assert_eq!(reply.state, prior);
    }

    #[test]
    fn text_persona_speaks_the_whole_completion() {
        let prior = ConversationState::default();
        let reply = interpret_completion(&persona("companion"), "  Hey, how's it going?\n", &prior);
        assert_eq!(reply.speech, "Hey, how's it going?");
        assert_eq!(reply.state, prior);
    }

    #[test]
    fn model_can_pick_the_voice() {
        let p = persona("tutor");
        let reply = interpret_completion(
            &p,
            r#"{"speech":"Quiz time!","context":{"mode":"quiz"},"voiceId":"en-US-alicia"}"#,
            &ConversationState::empty(),
        );
        assert_eq!(reply.voice_id, "en-US-alicia");

        let reply = interpret_completion(
            &p,
            r#"{"speech":"Back to learning.","context":{"mode":"learn"}}"#,
            &ConversationState::empty(),
        );
        assert_eq!(reply.voice_id, p.voice_id);
    }

    #[test]
    fn service_errors_map_to_pipeline_errors() {
        let timeout: PipelineError = ServiceError::Timeout {
            leg: Leg::Generation,
            after: Duration::from_secs(30),
        }
        .into();
        assert!(matches!(timeout, PipelineError::Timeout { .. }));

        let network: PipelineError =
            ServiceError::Provider(ProviderError::Network("refused".into())).into();
        assert_eq!(network, PipelineError::Transport("refused".into()));

        let api: PipelineError = ServiceError::Provider(ProviderError::Failed("No candidates".into())).into();
        assert_eq!(api, PipelineError::Remote("No candidates".into()));
    }

    #[test]
    fn knowledge_loads_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("company_data.json"), r#"{"pricing":"free"}"#).unwrap();

        assert_eq!(
            load_knowledge(dir.path(), &persona("sdr")),
            r#"{"pricing":"free"}"#
        );
        assert_eq!(load_knowledge(dir.path(), &persona("companion")), "");
        assert_eq!(load_knowledge(&dir.path().join("missing"), &persona("sdr")), "");
    }
}
