//! Turn controller state machine.
//!
//! All transitions go through [`reduce`], which returns the next state and the
//! effects to run. Nothing else mutates conversation state. Every event that
//! comes back from async work carries the turn id it was started for, and
//! events for any other turn are ignored, so a stopped or superseded turn can
//! never move the machine.
//!
//! One cycle: Listening -> Processing (flush, transcribe, generate) ->
//! Speaking -> Settling -> Listening. A cycle that produced nothing to say
//! goes straight back to Listening with a fresh capture. A session whose
//! persona has a spoken greeting starts in Speaking instead of Listening.

use std::time::Instant;
use uuid::Uuid;

use crate::audio::{AudioClip, TurnEnd};
use crate::conversation::ConversationState;
use crate::pipeline::{Greeting, TurnReply};

/// One conversation from Start until Stop or completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub conversation: ConversationState,
    /// Set by a reply that completes the conversation. Once set, the session
    /// closes after that reply instead of listening again.
    pub should_terminate: bool,
    pub turns: u32,
    pub last_transcript: Option<String>,
    pub last_reply: Option<String>,
}

impl Session {
    pub fn new(initial_state: ConversationState) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation: initial_state,
            should_terminate: false,
            turns: 0,
            last_transcript: None,
            last_reply: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Waiting for the capture to stop and hand over its clip.
    Flushing,
    Transcribing,
    Generating,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum State {
    #[default]
    Idle,
    Listening {
        session: Session,
        turn_id: Uuid,
        started_at: Option<Instant>,
    },
    Processing {
        session: Session,
        turn_id: Uuid,
        stage: ProcessingStage,
    },
    Speaking {
        session: Session,
        turn_id: Uuid,
    },
    /// Brief pause after playback before the microphone reopens.
    Settling {
        session: Session,
        turn_id: Uuid,
    },
    Closed {
        session: Session,
    },
}

/// Coarse phase reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Listening,
    Processing,
    Speaking,
    Closed,
}

impl State {
    pub fn phase(&self) -> Phase {
        match self {
            State::Idle => Phase::Idle,
            State::Listening { .. } => Phase::Listening,
            State::Processing { .. } => Phase::Processing,
            // Settling still reads as speaking; the mic is not open yet.
            State::Speaking { .. } | State::Settling { .. } => Phase::Speaking,
            State::Closed { .. } => Phase::Closed,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, State::Idle | State::Closed { .. })
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            State::Idle => None,
            State::Listening { session, .. }
            | State::Processing { session, .. }
            | State::Speaking { session, .. }
            | State::Settling { session, .. }
            | State::Closed { session } => Some(session),
        }
    }

    pub fn turn_id(&self) -> Option<Uuid> {
        match self {
            State::Listening { turn_id, .. }
            | State::Processing { turn_id, .. }
            | State::Speaking { turn_id, .. }
            | State::Settling { turn_id, .. } => Some(*turn_id),
            State::Idle | State::Closed { .. } => None,
        }
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum Event {
    /// Begin a session with the persona's initial state, speaking the
    /// greeting first when it has audio.
    Start {
        initial_state: ConversationState,
        greeting: Option<Greeting>,
    },
    /// User ended the session.
    Stop,
    /// User ended the current utterance without waiting for silence.
    FinishTurn,
    /// Application exit requested. Handled by the state loop.
    Exit,

    // Capture events
    CaptureStarted { id: Uuid },
    CaptureFailed { id: Uuid, err: String },
    EndOfTurn { id: Uuid, reason: TurnEnd },
    CaptureFlushed { id: Uuid, clip: AudioClip },

    // Pipeline events
    Transcribed { id: Uuid, transcript: String },
    ReplyReady { id: Uuid, reply: TurnReply },
    PipelineFailed { id: Uuid, err: String },

    // Playback events
    PlaybackStarted { id: Uuid },
    PlaybackFinished { id: Uuid },
    PlaybackFailed { id: Uuid, err: String },
    SettleElapsed { id: Uuid },
}

impl Event {
    /// Turn id carried by events that report back from async work.
    pub fn turn_id(&self) -> Option<Uuid> {
        match self {
            Event::CaptureStarted { id }
            | Event::CaptureFailed { id, .. }
            | Event::EndOfTurn { id, .. }
            | Event::CaptureFlushed { id, .. }
            | Event::Transcribed { id, .. }
            | Event::ReplyReady { id, .. }
            | Event::PipelineFailed { id, .. }
            | Event::PlaybackStarted { id }
            | Event::PlaybackFinished { id }
            | Event::PlaybackFailed { id, .. }
            | Event::SettleElapsed { id } => Some(*id),
            Event::Start { .. } | Event::Stop | Event::FinishTurn | Event::Exit => None,
        }
    }
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    StartCapture { id: Uuid },
    /// Stop capturing and hand the clip back as `CaptureFlushed`.
    StopCapture { id: Uuid },
    /// Stop capturing and drop whatever was heard.
    DiscardCapture { id: Uuid },
    Transcribe { id: Uuid, clip: AudioClip },
    Generate {
        id: Uuid,
        transcript: String,
        state: ConversationState,
    },
    Play { id: Uuid, audio: Vec<u8> },
    StopPlayback,
    StartSettleTimer { id: Uuid },
    /// Release capture and playback resources held for the session.
    Release { session_id: Uuid },
    /// Non-fatal problem worth telling the user about.
    Notify { message: String },
    EmitUi,
}

/// Reducer: (state, event) -> (next_state, effects)
///
/// - Never mutates the input state
/// - Ignores events whose turn id is not the current turn
/// - Emits EmitUi after every state change
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    if let Some(event_id) = event.turn_id() {
        if state.turn_id() != Some(event_id) {
            log::debug!(
                "Ignoring stale event for turn {} in {:?}",
                event_id,
                state.phase()
            );
            return (state.clone(), vec![]);
        }
    }

    match (state, event) {
        // -----------------
        // Session lifecycle
        // -----------------
        (
            State::Idle | State::Closed { .. },
            Start {
                initial_state,
                greeting,
            },
        ) => {
            let mut session = Session::new(initial_state);
            log::info!("Session {} started", session.id);
            let Some(greeting) = greeting else {
                return listen(session, vec![]);
            };

            session.last_reply = Some(greeting.speech);
            match greeting.audio {
                Some(audio) if !audio.is_empty() => {
                    let turn_id = Uuid::new_v4();
                    (
                        State::Speaking { session, turn_id },
                        vec![Play { id: turn_id, audio }, EmitUi],
                    )
                }
                _ => listen(session, vec![]),
            }
        }
        (_, Start { .. }) => (state.clone(), vec![]),

        (State::Idle | State::Closed { .. }, Stop) => (state.clone(), vec![]),
        (_, Stop) => {
            let Some(session) = state.session() else {
                return (state.clone(), vec![]);
            };
            log::info!("Session {} stopped by user", session.id);
            let mut effects = Vec::new();
            if let Some(turn_id) = state.turn_id() {
                effects.push(DiscardCapture { id: turn_id });
            }
            effects.extend([
                StopPlayback,
                Release {
                    session_id: session.id,
                },
                EmitUi,
            ]);
            (State::Idle, effects)
        }

        // -----------------
        // Listening
        // -----------------
        (
            State::Listening {
                session, turn_id, ..
            },
            CaptureStarted { .. },
        ) => (
            State::Listening {
                session: session.clone(),
                turn_id: *turn_id,
                started_at: Some(Instant::now()),
            },
            vec![EmitUi],
        ),
        (
            State::Listening {
                session, turn_id, ..
            },
            EndOfTurn { reason, .. },
        ) => {
            log::info!("Turn {} ended ({})", turn_id, reason);
            flush(session, *turn_id)
        }
        (
            State::Listening {
                session, turn_id, ..
            },
            FinishTurn,
        ) => {
            log::info!("Turn {} finished by user", turn_id);
            flush(session, *turn_id)
        }
        (State::Listening { session, .. }, CaptureFailed { err, .. })
        | (
            State::Processing {
                session,
                stage: ProcessingStage::Flushing,
                ..
            },
            CaptureFailed { err, .. },
        ) => {
            log::error!("Capture failed: {}", err);
            (
                State::Idle,
                vec![
                    Release {
                        session_id: session.id,
                    },
                    Notify {
                        message: format!("Microphone unavailable: {}", err),
                    },
                    EmitUi,
                ],
            )
        }

        // -----------------
        // Processing
        // -----------------
        (
            State::Processing {
                session,
                turn_id,
                stage: ProcessingStage::Flushing,
            },
            CaptureFlushed { clip, .. },
        ) => {
            if clip.is_empty() {
                log::info!("Turn {} captured no audio, listening again", turn_id);
                return listen(session.clone(), vec![]);
            }
            (
                State::Processing {
                    session: session.clone(),
                    turn_id: *turn_id,
                    stage: ProcessingStage::Transcribing,
                },
                vec![Transcribe { id: *turn_id, clip }, EmitUi],
            )
        }
        (
            State::Processing {
                session,
                turn_id,
                stage: ProcessingStage::Transcribing,
            },
            Transcribed { transcript, .. },
        ) => {
            let transcript = transcript.trim().to_string();
            if transcript.is_empty() {
                log::info!("Turn {} heard nothing, listening again", turn_id);
                return listen(session.clone(), vec![]);
            }

            let mut session = session.clone();
            session.last_transcript = Some(transcript.clone());
            let state_snapshot = session.conversation.clone();
            (
                State::Processing {
                    session,
                    turn_id: *turn_id,
                    stage: ProcessingStage::Generating,
                },
                vec![
                    Generate {
                        id: *turn_id,
                        transcript,
                        state: state_snapshot,
                    },
                    EmitUi,
                ],
            )
        }
        (
            State::Processing {
                session,
                turn_id,
                stage: ProcessingStage::Transcribing | ProcessingStage::Generating,
            },
            PipelineFailed { err, .. },
        ) => {
            log::warn!("Turn {} failed: {}", turn_id, err);
            listen(session.clone(), vec![Notify { message: err }])
        }
        (
            State::Processing {
                session,
                turn_id,
                stage: ProcessingStage::Generating,
            },
            ReplyReady { reply, .. },
        ) => {
            let mut session = session.clone();
            session.conversation = reply.state;
            session.should_terminate = reply.is_complete;
            session.turns += 1;
            session.last_reply = Some(reply.speech);

            match reply.audio {
                Some(audio) if !audio.is_empty() => (
                    State::Speaking {
                        session,
                        turn_id: *turn_id,
                    },
                    vec![
                        Play {
                            id: *turn_id,
                            audio,
                        },
                        EmitUi,
                    ],
                ),
                _ if session.should_terminate => close(session),
                _ => {
                    log::info!("Turn {} has no reply audio, listening again", turn_id);
                    listen(session, vec![])
                }
            }
        }

        // -----------------
        // Speaking
        // -----------------
        (State::Speaking { .. }, PlaybackStarted { .. }) => (state.clone(), vec![EmitUi]),
        (State::Speaking { session, turn_id }, PlaybackFinished { .. }) => {
            after_playback(session, *turn_id, vec![])
        }
        (State::Speaking { session, turn_id }, PlaybackFailed { err, .. }) => {
            log::warn!("Playback failed: {}", err);
            after_playback(
                session,
                *turn_id,
                vec![Notify {
                    message: format!("Playback failed: {}", err),
                }],
            )
        }

        // -----------------
        // Settling
        // -----------------
        (State::Settling { session, .. }, SettleElapsed { .. }) => listen(session.clone(), vec![]),

        // Everything else is ignored.
        (_, event) => {
            log::debug!("Ignoring {} in {:?}", event_name(&event), state.phase());
            (state.clone(), vec![])
        }
    }
}

/// Open a fresh turn for `session`.
fn listen(session: Session, mut effects: Vec<Effect>) -> (State, Vec<Effect>) {
    let turn_id = Uuid::new_v4();
    effects.push(Effect::StartCapture { id: turn_id });
    effects.push(Effect::EmitUi);
    (
        State::Listening {
            session,
            turn_id,
            started_at: None,
        },
        effects,
    )
}

fn flush(session: &Session, turn_id: Uuid) -> (State, Vec<Effect>) {
    (
        State::Processing {
            session: session.clone(),
            turn_id,
            stage: ProcessingStage::Flushing,
        },
        vec![Effect::StopCapture { id: turn_id }, Effect::EmitUi],
    )
}

fn close(session: Session) -> (State, Vec<Effect>) {
    log::info!(
        "Session {} completed after {} turn(s)",
        session.id,
        session.turns
    );
    let session_id = session.id;
    (
        State::Closed { session },
        vec![Effect::Release { session_id }, Effect::EmitUi],
    )
}

fn after_playback(
    session: &Session,
    turn_id: Uuid,
    mut effects: Vec<Effect>,
) -> (State, Vec<Effect>) {
    if session.should_terminate {
        let (next, close_effects) = close(session.clone());
        effects.extend(close_effects);
        return (next, effects);
    }

    effects.push(Effect::StartSettleTimer { id: turn_id });
    effects.push(Effect::EmitUi);
    (
        State::Settling {
            session: session.clone(),
            turn_id,
        },
        effects,
    )
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::Start { .. } => "Start",
        Event::Stop => "Stop",
        Event::FinishTurn => "FinishTurn",
        Event::Exit => "Exit",
        Event::CaptureStarted { .. } => "CaptureStarted",
        Event::CaptureFailed { .. } => "CaptureFailed",
        Event::EndOfTurn { .. } => "EndOfTurn",
        Event::CaptureFlushed { .. } => "CaptureFlushed",
        Event::Transcribed { .. } => "Transcribed",
        Event::ReplyReady { .. } => "ReplyReady",
        Event::PipelineFailed { .. } => "PipelineFailed",
        Event::PlaybackStarted { .. } => "PlaybackStarted",
        Event::PlaybackFinished { .. } => "PlaybackFinished",
        Event::PlaybackFailed { .. } => "PlaybackFailed",
        Event::SettleElapsed { .. } => "SettleElapsed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clip() -> AudioClip {
        AudioClip::from_samples(&[100, -100, 200], 16_000).unwrap()
    }

    fn reply(is_complete: bool, audio: Option<Vec<u8>>) -> TurnReply {
        TurnReply {
            speech: "Got it.".to_string(),
            state: ConversationState::new(json!({ "name": "Alex" })),
            is_complete,
            audio,
        }
    }

    fn start_capture_id(effects: &[Effect]) -> Uuid {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::StartCapture { id } => Some(*id),
                _ => None,
            })
            .expect("StartCapture effect")
    }

    fn listening() -> (State, Uuid) {
        let (state, effects) = reduce(
            &State::Idle,
            Event::Start {
                initial_state: ConversationState::empty(),
                greeting: None,
            },
        );
        let id = start_capture_id(&effects);
        (state, id)
    }

    fn generating() -> (State, Uuid) {
        let (state, id) = listening();
        let (state, _) = reduce(&state, Event::FinishTurn);
        let (state, _) = reduce(&state, Event::CaptureFlushed { id, clip: clip() });
        let (state, _) = reduce(
            &state,
            Event::Transcribed {
                id,
                transcript: "My name is Alex".to_string(),
            },
        );
        (state, id)
    }

    #[test]
    fn start_opens_a_listening_turn() {
        let (state, effects) = reduce(
            &State::Idle,
            Event::Start {
                initial_state: ConversationState::empty(),
                greeting: None,
            },
        );
        assert_eq!(state.phase(), Phase::Listening);
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
        assert!(state.is_active());
    }

    #[test]
    fn greeting_is_spoken_before_the_first_turn() {
        let greeting = Greeting {
            speech: "Welcome to GourmetGo! What are you craving?".to_string(),
            audio: Some(vec![7, 7, 7]),
        };
        let (state, effects) = reduce(
            &State::Idle,
            Event::Start {
                initial_state: ConversationState::new(json!([])),
                greeting: Some(greeting),
            },
        );
        assert_eq!(state.phase(), Phase::Speaking);
        assert_eq!(
            state.session().unwrap().last_reply.as_deref(),
            Some("Welcome to GourmetGo! What are you craving?")
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
        let id = match &effects[0] {
            Effect::Play { id, audio } => {
                assert_eq!(audio, &vec![7, 7, 7]);
                *id
            }
            other => panic!("expected Play, got {:?}", other),
        };

        let (state, _) = reduce(&state, Event::PlaybackFinished { id });
        let (state, effects) = reduce(&state, Event::SettleElapsed { id });
        assert_eq!(state.phase(), Phase::Listening);
        assert_eq!(state.session().unwrap().turns, 0);
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn greeting_without_audio_listens_right_away() {
        let (state, effects) = reduce(
            &State::Idle,
            Event::Start {
                initial_state: ConversationState::empty(),
                greeting: Some(Greeting {
                    speech: "Hello!".to_string(),
                    audio: None,
                }),
            },
        );
        assert_eq!(state.phase(), Phase::Listening);
        assert_eq!(state.session().unwrap().last_reply.as_deref(), Some("Hello!"));
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn end_of_turn_flushes_capture() {
        let (state, id) = listening();
        let (next, effects) = reduce(
            &state,
            Event::EndOfTurn {
                id,
                reason: TurnEnd::Silence,
            },
        );
        assert!(matches!(
            next,
            State::Processing {
                stage: ProcessingStage::Flushing,
                ..
            }
        ));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { id: stop } if *stop == id)));
    }

    #[test]
    fn flushed_clip_is_transcribed() {
        let (state, id) = listening();
        let (state, _) = reduce(&state, Event::FinishTurn);
        let (next, effects) = reduce(&state, Event::CaptureFlushed { id, clip: clip() });

        assert!(matches!(
            next,
            State::Processing {
                stage: ProcessingStage::Transcribing,
                ..
            }
        ));
        assert!(effects.iter().any(|e| matches!(e, Effect::Transcribe { .. })));
    }

    #[test]
    fn empty_clip_restarts_listening_without_pipeline() {
        let (state, id) = listening();
        let (state, _) = reduce(&state, Event::FinishTurn);
        let (next, effects) = reduce(
            &state,
            Event::CaptureFlushed {
                id,
                clip: AudioClip::empty(),
            },
        );

        assert_eq!(next.phase(), Phase::Listening);
        assert_ne!(next.turn_id(), Some(id));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Transcribe { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn blank_transcript_skips_generation() {
        let (state, id) = listening();
        let (state, _) = reduce(&state, Event::FinishTurn);
        let (state, _) = reduce(&state, Event::CaptureFlushed { id, clip: clip() });
        let (next, effects) = reduce(
            &state,
            Event::Transcribed {
                id,
                transcript: "   ".to_string(),
            },
        );

        assert_eq!(next.phase(), Phase::Listening);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Generate { .. })));
    }

    #[test]
    fn transcript_is_sent_with_current_state() {
        let (state, id) = listening();
        let (state, _) = reduce(&state, Event::FinishTurn);
        let (state, _) = reduce(&state, Event::CaptureFlushed { id, clip: clip() });
        let (next, effects) = reduce(
            &state,
            Event::Transcribed {
                id,
                transcript: "  hello there ".to_string(),
            },
        );

        assert!(matches!(
            next,
            State::Processing {
                stage: ProcessingStage::Generating,
                ..
            }
        ));
        let generate = effects.iter().find_map(|e| match e {
            Effect::Generate {
                transcript, state, ..
            } => Some((transcript.clone(), state.clone())),
            _ => None,
        });
        assert_eq!(
            generate,
            Some(("hello there".to_string(), ConversationState::empty()))
        );
    }

    #[test]
    fn reply_with_audio_replaces_state_and_plays() {
        let (state, id) = generating();
        let (next, effects) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(false, Some(vec![1, 2, 3])),
            },
        );

        assert_eq!(next.phase(), Phase::Speaking);
        let session = next.session().unwrap();
        assert_eq!(
            session.conversation,
            ConversationState::new(json!({ "name": "Alex" }))
        );
        assert_eq!(session.turns, 1);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Play { audio, .. } if audio == &vec![1, 2, 3])));
    }

    #[test]
    fn reply_without_audio_listens_again() {
        let (state, id) = generating();
        let (next, effects) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(false, None),
            },
        );

        assert_eq!(next.phase(), Phase::Listening);
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Play { .. })));
    }

    #[test]
    fn pipeline_failure_recovers_to_listening() {
        let (state, id) = generating();
        let (next, effects) = reduce(
            &state,
            Event::PipelineFailed {
                id,
                err: "Generation timed out after 30s".to_string(),
            },
        );

        assert_eq!(next.phase(), Phase::Listening);
        assert!(effects.iter().any(|e| matches!(e, Effect::Notify { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn playback_finished_settles_then_listens() {
        let (state, id) = generating();
        let (state, _) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(false, Some(vec![9])),
            },
        );
        let (state, effects) = reduce(&state, Event::PlaybackFinished { id });

        assert!(matches!(state, State::Settling { .. }));
        assert_eq!(state.phase(), Phase::Speaking);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartSettleTimer { .. })));
        assert!(!effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));

        let (state, effects) = reduce(&state, Event::SettleElapsed { id });
        assert_eq!(state.phase(), Phase::Listening);
        assert!(effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn completing_reply_closes_after_playback() {
        let (state, id) = generating();
        let (state, _) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(true, Some(vec![9])),
            },
        );
        assert_eq!(state.phase(), Phase::Speaking);

        let (state, effects) = reduce(&state, Event::PlaybackFinished { id });
        assert_eq!(state.phase(), Phase::Closed);
        assert!(!state.is_active());
        assert!(effects.iter().any(|e| matches!(e, Effect::Release { .. })));
        assert!(!effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn completing_reply_without_audio_closes_immediately() {
        let (state, id) = generating();
        let (state, effects) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(true, None),
            },
        );
        assert_eq!(state.phase(), Phase::Closed);
        assert!(!effects.iter().any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn playback_failure_continues_like_finish() {
        let (state, id) = generating();
        let (state, _) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(false, Some(vec![9])),
            },
        );
        let (state, effects) = reduce(
            &state,
            Event::PlaybackFailed {
                id,
                err: "decode".to_string(),
            },
        );

        assert!(matches!(state, State::Settling { .. }));
        assert!(effects.iter().any(|e| matches!(e, Effect::Notify { .. })));
    }

    #[test]
    fn stop_while_speaking_goes_idle_and_stops_playback() {
        let (state, id) = generating();
        let (state, _) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(false, Some(vec![9])),
            },
        );
        let (state, effects) = reduce(&state, Event::Stop);

        assert_eq!(state, State::Idle);
        assert!(effects.iter().any(|e| matches!(e, Effect::StopPlayback)));
        assert!(effects.iter().any(|e| matches!(e, Effect::Release { .. })));

        // Playback reporting in later must not restart anything.
        let (after, effects) = reduce(&state, Event::PlaybackFinished { id });
        assert_eq!(after, State::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn stop_while_listening_discards_capture() {
        let (state, id) = listening();
        let (state, effects) = reduce(&state, Event::Stop);

        assert_eq!(state, State::Idle);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::DiscardCapture { id: d } if *d == id)));
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let (state, effects) = reduce(&State::Idle, Event::Stop);
        assert_eq!(state, State::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_events_are_ignored() {
        let (state, _) = listening();
        let stale = Uuid::new_v4();

        for event in [
            Event::EndOfTurn {
                id: stale,
                reason: TurnEnd::Silence,
            },
            Event::CaptureFlushed {
                id: stale,
                clip: clip(),
            },
            Event::PlaybackFinished { id: stale },
            Event::SettleElapsed { id: stale },
        ] {
            let (next, effects) = reduce(&state, event);
            assert_eq!(next, state);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn late_reply_after_stop_is_discarded() {
        let (state, id) = generating();
        let (state, _) = reduce(&state, Event::Stop);
        let (next, effects) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(false, Some(vec![1])),
            },
        );
        assert_eq!(next, State::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn capture_failure_is_fatal_for_the_session() {
        let (state, id) = listening();
        let (state, effects) = reduce(
            &state,
            Event::CaptureFailed {
                id,
                err: "No audio input device found".to_string(),
            },
        );
        assert_eq!(state, State::Idle);
        assert!(effects.iter().any(|e| matches!(e, Effect::Notify { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::Release { .. })));
    }

    #[test]
    fn start_while_active_is_ignored() {
        let (state, _) = listening();
        let (next, effects) = reduce(
            &state,
            Event::Start {
                initial_state: ConversationState::empty(),
                greeting: None,
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn closed_session_can_start_again() {
        let (state, id) = generating();
        let (state, _) = reduce(
            &state,
            Event::ReplyReady {
                id,
                reply: reply(true, None),
            },
        );
        assert_eq!(state.phase(), Phase::Closed);

        let (next, _) = reduce(
            &state,
            Event::Start {
                initial_state: ConversationState::empty(),
                greeting: None,
            },
        );
        assert_eq!(next.phase(), Phase::Listening);
        assert_eq!(next.session().unwrap().turns, 0);
    }

    #[test]
    fn one_turn_id_per_cycle() {
        let (state, first) = generating();
        let (state, _) = reduce(
            &state,
            Event::ReplyReady {
                id: first,
                reply: reply(false, None),
            },
        );
        let second = state.turn_id().unwrap();
        assert_ne!(first, second);
    }
}
