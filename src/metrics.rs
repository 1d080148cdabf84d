//! Per-turn timing metrics.
//!
//! Tracks how long each stage of a turn took (listening, transcription,
//! generation) plus an error history. The effect runner feeds it; the summary
//! is logged when a session releases its resources.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Maximum number of finished turns to retain in history
const MAX_TURN_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// A reply was generated.
    Replied,
    /// Nothing was heard; the turn restarted without a reply.
    NoSpeech,
    Failed,
}

/// Metrics for a finished turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub turn_id: String,
    /// Unix timestamp (seconds) when the turn started
    pub started_at: u64,
    pub listening_ms: u64,
    pub audio_bytes: u64,
    pub transcription_ms: u64,
    pub transcript_chars: u64,
    pub generation_ms: u64,
    pub reply_chars: u64,
    /// Time from the capture opening to the outcome
    pub total_turn_ms: u64,
    pub outcome: TurnOutcome,
    pub error_message: Option<String>,
}

/// Summary statistics across finished turns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_turns: u64,
    pub replied_turns: u64,
    pub silent_turns: u64,
    pub failed_turns: u64,
    /// Averages are over replied turns only
    pub avg_listening_ms: u64,
    pub avg_transcription_ms: u64,
    pub avg_generation_ms: u64,
    pub last_error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// "capture", "pipeline", "playback"
    pub error_type: String,
    pub message: String,
    pub turn_id: Option<String>,
}

struct TurnInProgress {
    turn_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    listening_duration: Option<Duration>,
    audio_bytes: Option<u64>,
    transcription_started: Option<Instant>,
    transcription_duration: Option<Duration>,
    transcript_length: Option<usize>,
    generation_started: Option<Instant>,
    generation_duration: Option<Duration>,
    reply_length: Option<usize>,
}

impl TurnInProgress {
    fn new(turn_id: Uuid) -> Self {
        Self {
            turn_id,
            started_at: Instant::now(),
            started_at_unix: chrono::Utc::now().timestamp().max(0) as u64,
            listening_duration: None,
            audio_bytes: None,
            transcription_started: None,
            transcription_duration: None,
            transcript_length: None,
            generation_started: None,
            generation_duration: None,
            reply_length: None,
        }
    }

    fn finish(&self, outcome: TurnOutcome, error_message: Option<String>) -> TurnMetrics {
        let ms = |d: Option<Duration>| d.map(|d| d.as_millis() as u64).unwrap_or(0);
        TurnMetrics {
            turn_id: self.turn_id.to_string(),
            started_at: self.started_at_unix,
            listening_ms: ms(self.listening_duration),
            audio_bytes: self.audio_bytes.unwrap_or(0),
            transcription_ms: ms(self.transcription_duration),
            transcript_chars: self.transcript_length.unwrap_or(0) as u64,
            generation_ms: ms(self.generation_duration),
            reply_chars: self.reply_length.unwrap_or(0) as u64,
            total_turn_ms: self.started_at.elapsed().as_millis() as u64,
            outcome,
            error_message,
        }
    }
}

pub struct MetricsCollector {
    /// Newest first
    history: VecDeque<TurnMetrics>,
    /// Newest first
    errors: VecDeque<ErrorRecord>,
    current: Option<TurnInProgress>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_TURN_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
        }
    }

    /// Start tracking a turn. An unfinished previous turn is dropped.
    pub fn start_turn(&mut self, turn_id: Uuid) {
        if let Some(old) = self.current.take() {
            log::debug!(
                "Metrics: dropping unfinished turn {} for {}",
                old.turn_id,
                turn_id
            );
        }
        self.current = Some(TurnInProgress::new(turn_id));
    }

    /// Capture stopped with `audio_bytes` of encoded audio.
    pub fn listening_stopped(&mut self, turn_id: Uuid, audio_bytes: u64) {
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.listening_duration = Some(turn.started_at.elapsed());
            turn.audio_bytes = Some(audio_bytes);
            log::info!(
                "Metrics: turn {} listened {:?}, {} bytes",
                turn.turn_id,
                turn.listening_duration.unwrap_or_default(),
                audio_bytes
            );
        }
    }

    pub fn transcription_started(&mut self, turn_id: Uuid) {
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.transcription_started = Some(Instant::now());
        }
    }

    pub fn transcription_completed(&mut self, turn_id: Uuid, transcript_len: usize) {
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.transcription_duration = turn.transcription_started.map(|s| s.elapsed());
            turn.transcript_length = Some(transcript_len);
            log::info!(
                "Metrics: turn {} transcribed in {:?} ({} chars)",
                turn.turn_id,
                turn.transcription_duration.unwrap_or_default(),
                transcript_len
            );
        }
    }

    pub fn generation_started(&mut self, turn_id: Uuid) {
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.generation_started = Some(Instant::now());
        }
    }

    pub fn generation_completed(&mut self, turn_id: Uuid, reply_len: usize) {
        if let Some(turn) = self.turn_mut(turn_id) {
            turn.generation_duration = turn.generation_started.map(|s| s.elapsed());
            turn.reply_length = Some(reply_len);
        }
        self.finish_turn(turn_id, TurnOutcome::Replied, None);
    }

    /// The turn produced no transcript worth answering.
    pub fn turn_silent(&mut self, turn_id: Uuid) {
        self.finish_turn(turn_id, TurnOutcome::NoSpeech, None);
    }

    pub fn turn_failed(&mut self, turn_id: Uuid, error_type: &str, error: String) {
        self.record_error(error_type, error.clone(), Some(turn_id));
        self.finish_turn(turn_id, TurnOutcome::Failed, Some(error));
    }

    /// Forget the in-progress turn without recording it.
    pub fn turn_cancelled(&mut self) {
        if let Some(turn) = self.current.take() {
            log::debug!("Metrics: turn {} cancelled", turn.turn_id);
        }
    }

    pub fn record_error(&mut self, error_type: &str, message: String, turn_id: Option<Uuid>) {
        let error = ErrorRecord {
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            error_type: error_type.to_string(),
            message,
            turn_id: turn_id.map(|id| id.to_string()),
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let replied: Vec<_> = self
            .history
            .iter()
            .filter(|t| t.outcome == TurnOutcome::Replied)
            .collect();
        let count = replied.len() as u64;
        let avg = |f: fn(&TurnMetrics) -> u64| {
            if count == 0 {
                0
            } else {
                replied.iter().map(|t| f(t)).sum::<u64>() / count
            }
        };
        let outcome_count =
            |o: TurnOutcome| self.history.iter().filter(|t| t.outcome == o).count() as u64;

        MetricsSummary {
            total_turns: self.history.len() as u64,
            replied_turns: count,
            silent_turns: outcome_count(TurnOutcome::NoSpeech),
            failed_turns: outcome_count(TurnOutcome::Failed),
            avg_listening_ms: avg(|t| t.listening_ms),
            avg_transcription_ms: avg(|t| t.transcription_ms),
            avg_generation_ms: avg(|t| t.generation_ms),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Summarise the session that just ended and start over for the next one.
    pub fn finish_session(&mut self) -> MetricsSummary {
        self.turn_cancelled();
        let summary = self.get_summary();
        *self = Self::new();
        summary
    }

    fn turn_mut(&mut self, turn_id: Uuid) -> Option<&mut TurnInProgress> {
        self.current.as_mut().filter(|t| t.turn_id == turn_id)
    }

    fn finish_turn(&mut self, turn_id: Uuid, outcome: TurnOutcome, error: Option<String>) {
        if !self.current.as_ref().is_some_and(|t| t.turn_id == turn_id) {
            return;
        }
        if let Some(turn) = self.current.take() {
            let metrics = turn.finish(outcome, error);
            log::info!(
                "Metrics: turn {} {:?} in {}ms (listen {}ms, stt {}ms, llm {}ms)",
                metrics.turn_id,
                metrics.outcome,
                metrics.total_turn_ms,
                metrics.listening_ms,
                metrics.transcription_ms,
                metrics.generation_ms
            );
            self.history.push_front(metrics);
            while self.history.len() > MAX_TURN_HISTORY {
                self.history.pop_back();
            }
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
