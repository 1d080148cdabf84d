pub mod audio;
pub mod conversation;
pub mod effects;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod service;
pub mod settings;
pub mod state_machine;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use effects::EffectRunner;
use state_machine::{reduce, Effect, Event, ProcessingStage, State};

/// Coarse status for observers.
/// Uses tagged union format: { "status": "idle" } or { "status": "listening", "turn": 2, ... }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UiStatus {
    Idle,
    Listening {
        turn: u32,
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Processing {
        stage: ProcessingStage,
    },
    Speaking,
    Closed {
        turns: u32,
    },
}

/// What the front end shows: the status plus the last exchange and the last
/// problem worth telling the user about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    #[serde(flatten)]
    pub status: UiStatus,
    pub session_id: Option<String>,
    pub transcript: Option<String>,
    pub reply: Option<String>,
    pub conversation: serde_json::Value,
    pub notice: Option<String>,
}

impl Default for UiState {
    fn default() -> Self {
        state_to_ui(&State::Idle, None)
    }
}

/// Convert internal State to UiState for observers
pub fn state_to_ui(state: &State, notice: Option<&str>) -> UiState {
    let status = match state {
        State::Idle => UiStatus::Idle,
        State::Listening {
            session,
            started_at,
            ..
        } => UiStatus::Listening {
            turn: session.turns + 1,
            elapsed_secs: started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0),
        },
        State::Processing { stage, .. } => UiStatus::Processing { stage: *stage },
        State::Speaking { .. } | State::Settling { .. } => UiStatus::Speaking,
        State::Closed { session } => UiStatus::Closed {
            turns: session.turns,
        },
    };

    let session = state.session();
    UiState {
        status,
        session_id: session.map(|s| s.id.to_string()),
        transcript: session.and_then(|s| s.last_transcript.clone()),
        reply: session.and_then(|s| s.last_reply.clone()),
        conversation: session
            .map(|s| s.conversation.as_value().clone())
            .unwrap_or(serde_json::Value::Null),
        notice: notice.map(str::to_string),
    }
}

/// State loop manager - holds the event sender for dispatching events
#[derive(Clone)]
pub struct StateLoopHandle {
    tx: mpsc::Sender<Event>,
}

impl StateLoopHandle {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Send an event to the state machine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }
}

/// Run the main state loop until `Exit` or until every sender is gone.
/// Returns the final state.
pub async fn run_state_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui: watch::Sender<UiState>,
) -> State {
    let mut state = State::default();
    let mut notice: Option<String> = None;

    ui.send_replace(state_to_ui(&state, None));
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down state loop");
            break;
        }
        if matches!(event, Event::Start { .. }) && !state.is_active() {
            notice = None;
        }

        let old_phase = state.phase();
        let (next, effects) = reduce(&state, event);

        if old_phase != next.phase() {
            log::info!("State transition: {:?} -> {:?}", old_phase, next.phase());
        }

        state = next;

        // Execute effects
        for eff in effects {
            match eff {
                Effect::EmitUi => {
                    ui.send_replace(state_to_ui(&state, notice.as_deref()));
                }
                Effect::Notify { message } => {
                    log::warn!("{}", message);
                    notice = Some(message);
                }
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
    }

    log::info!("State loop ended");
    state
}
