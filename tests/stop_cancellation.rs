//! `Stop` racing device and pipeline work, through the real effect runner.
//!
//! The microphone, speaker and pipeline are fakes, but the state loop and
//! `VoiceEffectRunner` are the ones the CLI uses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use voice_turn_agent::audio::{
    ActiveCapture, AudioClip, AudioError, CaptureSource, FrameSender, PlaybackError,
    PlaybackHandle, PlaybackSink,
};
use voice_turn_agent::conversation::ConversationState;
use voice_turn_agent::effects::VoiceEffectRunner;
use voice_turn_agent::metrics::MetricsCollector;
use voice_turn_agent::pipeline::{Greeting, PipelineError, RemotePipeline, TurnReply};
use voice_turn_agent::settings::TurnConfig;
use voice_turn_agent::state_machine::{Event, ProcessingStage, State};
use voice_turn_agent::{run_state_loop, UiState, UiStatus};

type Completion = Result<(), PlaybackError>;

/// A microphone that takes `open_delay` to open and counts open streams.
#[derive(Default)]
struct SlowMicrophone {
    open_delay: Duration,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct OpenStream {
    _frames: FrameSender,
    open: Arc<AtomicUsize>,
}

impl ActiveCapture for OpenStream {
    fn finish(self: Box<Self>) -> Result<AudioClip, AudioError> {
        self.open.fetch_sub(1, Ordering::SeqCst);
        AudioClip::from_samples(&[1200; 3200], 16_000)
    }
}

impl CaptureSource for SlowMicrophone {
    fn start(&self, frames: FrameSender) -> Result<Box<dyn ActiveCapture>, AudioError> {
        std::thread::sleep(self.open_delay);
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_open, Ordering::SeqCst);
        Ok(Box::new(OpenStream {
            _frames: frames,
            open: self.open.clone(),
        }))
    }
}

/// A speaker that never finishes a clip on its own.
#[derive(Default)]
struct StuckSpeaker {
    /// Also hold the start report, as if the device were still opening.
    hold_start: bool,
    calls: StdMutex<Vec<&'static str>>,
    pending: StdMutex<Vec<oneshot::Sender<Completion>>>,
}

impl StuckSpeaker {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl PlaybackSink for StuckSpeaker {
    fn play(&self, _audio: Vec<u8>) -> PlaybackHandle {
        self.calls.lock().unwrap().push("play");
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        if self.hold_start {
            pending.push(started_tx);
        } else {
            let _ = started_tx.send(Ok(()));
        }
        pending.push(done_tx);
        PlaybackHandle::new(started_rx, done_rx)
    }

    fn stop(&self) {
        self.calls.lock().unwrap().push("stop");
        self.pending.lock().unwrap().clear();
    }
}

struct SlowModel {
    generate_delay: Duration,
}

#[async_trait]
impl RemotePipeline for SlowModel {
    async fn transcribe(&self, _clip: AudioClip) -> Result<String, PipelineError> {
        Ok("two masala dosas".to_string())
    }

    async fn generate(
        &self,
        _transcript: &str,
        state: &ConversationState,
    ) -> Result<TurnReply, PipelineError> {
        tokio::time::sleep(self.generate_delay).await;
        Ok(TurnReply {
            speech: "Two masala dosas added.".to_string(),
            state: state.clone(),
            is_complete: false,
            audio: Some(vec![7; 16]),
        })
    }

    async fn greeting(&self) -> Result<Option<Greeting>, PipelineError> {
        Ok(None)
    }
}

struct Session {
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    state_loop: tokio::task::JoinHandle<State>,
}

fn start_session(
    microphone: SlowMicrophone,
    speaker: Arc<StuckSpeaker>,
    generate_delay: Duration,
) -> Session {
    // Turns here end only by FinishTurn or Stop.
    let config = TurnConfig {
        silence_hold_ms: 600_000,
        max_listen_secs: 600,
        ..TurnConfig::default()
    };
    let runner = VoiceEffectRunner::new(
        Arc::new(microphone),
        speaker,
        Arc::new(SlowModel { generate_delay }),
        config,
        Arc::new(Mutex::new(MetricsCollector::new())),
    );

    let (tx, rx) = mpsc::channel(32);
    let (ui_tx, ui) = watch::channel(UiState::default());
    let state_loop = tokio::spawn(run_state_loop(rx, tx.clone(), runner, ui_tx));
    Session { tx, ui, state_loop }
}

impl Session {
    async fn send(&self, event: Event) {
        self.tx.send(event).await.unwrap();
    }

    async fn begin(&self) {
        self.send(Event::Start {
            initial_state: ConversationState::empty(),
            greeting: None,
        })
        .await;
    }

    async fn wait_for(&mut self, pred: impl Fn(&UiState) -> bool) -> UiState {
        let ui = &mut self.ui;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let current = ui.borrow_and_update();
                    if pred(&current) {
                        return current.clone();
                    }
                }
                ui.changed().await.unwrap();
            }
        })
        .await
        .expect("ui state never matched")
    }

    async fn exit(self) -> State {
        self.send(Event::Exit).await;
        self.state_loop.await.unwrap()
    }
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting until {}", what);
}

#[tokio::test]
async fn stop_while_the_microphone_opens_leaves_nothing_recording() {
    let microphone = SlowMicrophone {
        open_delay: Duration::from_millis(300),
        ..SlowMicrophone::default()
    };
    let open = microphone.open.clone();
    let peak = microphone.peak.clone();
    let mut session = start_session(microphone, Arc::default(), Duration::ZERO);

    session.begin().await;
    session
        .wait_for(|ui| matches!(ui.status, UiStatus::Listening { .. }))
        .await;
    session.send(Event::Stop).await;
    session.wait_for(|ui| ui.status == UiStatus::Idle).await;

    // The open finishes after Stop and must be closed straight away.
    tokio::time::sleep(Duration::from_millis(400)).await;
    wait_until("the stopped stream is closed", || {
        open.load(Ordering::SeqCst) == 0
    })
    .await;
    assert_eq!(session.ui.borrow().status, UiStatus::Idle);

    // A new session right away opens exactly one stream.
    session.begin().await;
    wait_until("the new stream is open", || open.load(Ordering::SeqCst) == 1).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    session.send(Event::Stop).await;
    session.wait_for(|ui| ui.status == UiStatus::Idle).await;
    assert_eq!(session.exit().await, State::Idle);
    wait_until("every stream is closed", || open.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn stop_while_the_reply_is_generated_never_plays_it() {
    let microphone = SlowMicrophone::default();
    let open = microphone.open.clone();
    let speaker = Arc::new(StuckSpeaker::default());
    let mut session = start_session(microphone, speaker.clone(), Duration::from_millis(300));

    session.begin().await;
    wait_until("the stream is open", || open.load(Ordering::SeqCst) == 1).await;
    session.send(Event::FinishTurn).await;
    session
        .wait_for(|ui| {
            ui.status
                == UiStatus::Processing {
                    stage: ProcessingStage::Generating,
                }
        })
        .await;

    session.send(Event::Stop).await;
    let idle = session.wait_for(|ui| ui.status == UiStatus::Idle).await;
    assert!(idle.reply.is_none());

    // Let the abandoned reply arrive; it belongs to a finished turn.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.ui.borrow().status, UiStatus::Idle);
    assert!(!speaker.calls().contains(&"play"));
    assert_eq!(open.load(Ordering::SeqCst), 0);
    assert_eq!(session.exit().await, State::Idle);
}

#[tokio::test]
async fn stop_while_the_reply_is_starting_silences_the_speaker() {
    let microphone = SlowMicrophone::default();
    let open = microphone.open.clone();
    let speaker = Arc::new(StuckSpeaker {
        hold_start: true,
        ..StuckSpeaker::default()
    });
    let mut session = start_session(microphone, speaker.clone(), Duration::ZERO);

    session.begin().await;
    wait_until("the stream is open", || open.load(Ordering::SeqCst) == 1).await;
    session.send(Event::FinishTurn).await;
    session
        .wait_for(|ui| ui.status == UiStatus::Speaking)
        .await;

    session.send(Event::Stop).await;
    session.wait_for(|ui| ui.status == UiStatus::Idle).await;
    assert_eq!(speaker.calls(), vec!["play", "stop"]);

    // The dropped start report is stale and raises no notice.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let ui = session.ui.borrow().clone();
    assert_eq!(ui.status, UiStatus::Idle);
    assert!(ui.notice.is_none());
    assert_eq!(open.load(Ordering::SeqCst), 0);
    assert_eq!(session.exit().await, State::Idle);
}

#[tokio::test]
async fn stop_while_speaking_stops_the_clip() {
    let speaker = Arc::new(StuckSpeaker::default());
    let mut session = start_session(SlowMicrophone::default(), speaker.clone(), Duration::ZERO);

    session.begin().await;
    session.send(Event::FinishTurn).await;
    let speaking = session
        .wait_for(|ui| ui.status == UiStatus::Speaking)
        .await;
    assert_eq!(speaking.reply.as_deref(), Some("Two masala dosas added."));

    session.send(Event::Stop).await;
    session.wait_for(|ui| ui.status == UiStatus::Idle).await;
    assert_eq!(speaker.calls().last(), Some(&"stop"));
    assert_eq!(session.exit().await, State::Idle);
}
