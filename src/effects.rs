//! Effect runner for the voice turn loop.
//!
//! Each effect produced by the reducer becomes a spawned task that reports
//! back through the event channel, tagged with the turn id so the reducer can
//! drop results from turns that are no longer current.
//!
//! Device work is ordered. Capture start, stop, discard and release go to a
//! single worker task in the order the reducer emitted them, so a stop that
//! arrives while the microphone is still opening waits for the open and then
//! closes it, and a new capture never opens while the previous one is still
//! being finished. Playback commands are queued on the sink synchronously, so a
//! stop always reaches the device after the play it follows.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::audio::{
    frame_channel, run_silence_monitor, ActiveCapture, AudioClip, CaptureSource, MonitorConfig,
    PlaybackSink,
};
use crate::metrics::MetricsCollector;
use crate::pipeline::{with_timeout, Leg, RemotePipeline};
use crate::settings::TurnConfig;
use crate::state_machine::{Effect, Event};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// The capture for the turn currently listening.
struct ActiveTurnCapture {
    id: Uuid,
    capture: Box<dyn ActiveCapture>,
    monitor_stop: Option<oneshot::Sender<()>>,
}

impl ActiveTurnCapture {
    fn stop_monitor(&mut self) {
        if let Some(stop) = self.monitor_stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Stop the device and collect the clip off the async runtime.
async fn finish_capture(mut turn: ActiveTurnCapture) -> Result<AudioClip, String> {
    turn.stop_monitor();
    let capture = turn.capture;
    match tokio::task::spawn_blocking(move || capture.finish()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("Capture task failed: {}", e)),
    }
}

enum CaptureOp {
    Start { id: Uuid, tx: mpsc::Sender<Event> },
    Stop { id: Uuid, tx: mpsc::Sender<Event> },
    Discard { id: Uuid },
    Release { session_id: Uuid },
}

/// Owns the capture device. Runs one op at a time.
struct CaptureWorker {
    source: Arc<dyn CaptureSource>,
    monitor_config: MonitorConfig,
    metrics: Arc<Mutex<MetricsCollector>>,
    current: Option<ActiveTurnCapture>,
}

impl CaptureWorker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<CaptureOp>) {
        while let Some(op) = ops.recv().await {
            match op {
                CaptureOp::Start { id, tx } => self.start(id, tx).await,
                CaptureOp::Stop { id, tx } => self.stop(id, tx).await,
                CaptureOp::Discard { id } => self.discard(Some(id)).await,
                CaptureOp::Release { session_id } => self.release(session_id).await,
            }
        }

        self.discard(None).await;
        log::debug!("Capture worker exiting");
    }

    async fn start(&mut self, id: Uuid, tx: mpsc::Sender<Event>) {
        // A leftover capture from an abandoned turn still holds the device.
        if let Some(stale) = self.current.take() {
            log::debug!("Releasing leftover capture for turn {}", stale.id);
            let _ = finish_capture(stale).await;
        }

        let source = self.source.clone();
        let (frames_tx, frames_rx) = frame_channel();
        let capture = match tokio::task::spawn_blocking(move || source.start(frames_tx)).await {
            Ok(Ok(capture)) => capture,
            Ok(Err(e)) => {
                log::error!("Failed to start capture: {}", e);
                self.metrics
                    .lock()
                    .await
                    .record_error("capture", e.to_string(), Some(id));
                let _ = tx
                    .send(Event::CaptureFailed {
                        id,
                        err: e.to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                let err = format!("Capture task failed: {}", e);
                log::error!("{}", err);
                let _ = tx.send(Event::CaptureFailed { id, err }).await;
                return;
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        self.current = Some(ActiveTurnCapture {
            id,
            capture,
            monitor_stop: Some(stop_tx),
        });

        self.metrics.lock().await.start_turn(id);
        log::info!("Listening for turn {}", id);
        let _ = tx.send(Event::CaptureStarted { id }).await;

        let monitor_config = self.monitor_config;
        tokio::spawn(async move {
            match run_silence_monitor(frames_rx, stop_rx, monitor_config).await {
                Ok(Some(reason)) => {
                    let _ = tx.send(Event::EndOfTurn { id, reason }).await;
                }
                Ok(None) => log::debug!("Silence monitor for turn {} stopped", id),
                Err(e) => {
                    log::error!("Silence monitor failed: {}", e);
                    let _ = tx
                        .send(Event::CaptureFailed {
                            id,
                            err: e.to_string(),
                        })
                        .await;
                }
            }
        });
    }

    /// Take the capture if it belongs to `id`, or any capture for `None`.
    fn take(&mut self, id: Option<Uuid>) -> Option<ActiveTurnCapture> {
        match (&self.current, id) {
            (Some(current), Some(id)) if current.id != id => None,
            _ => self.current.take(),
        }
    }

    async fn stop(&mut self, id: Uuid, tx: mpsc::Sender<Event>) {
        let Some(turn) = self.take(Some(id)) else {
            log::warn!("StopCapture: no active capture for turn {}", id);
            let clip = AudioClip::empty();
            let _ = tx.send(Event::CaptureFlushed { id, clip }).await;
            return;
        };

        match finish_capture(turn).await {
            Ok(clip) => {
                log::info!(
                    "Captured {:?} of audio ({} bytes)",
                    clip.duration(),
                    clip.bytes().len()
                );
                self.metrics
                    .lock()
                    .await
                    .listening_stopped(id, clip.bytes().len() as u64);
                let _ = tx.send(Event::CaptureFlushed { id, clip }).await;
            }
            Err(err) => {
                log::error!("Failed to stop capture: {}", err);
                self.metrics
                    .lock()
                    .await
                    .turn_failed(id, "capture", err.clone());
                let _ = tx.send(Event::CaptureFailed { id, err }).await;
            }
        }
    }

    async fn discard(&mut self, id: Option<Uuid>) {
        if let Some(turn) = self.take(id) {
            let turn_id = turn.id;
            if let Err(e) = finish_capture(turn).await {
                log::warn!("Discarding capture for turn {} failed: {}", turn_id, e);
            }
        }
    }

    async fn release(&mut self, session_id: Uuid) {
        self.discard(None).await;

        let summary = self.metrics.lock().await.finish_session();
        log::info!(
            "Session {} released: {} turns ({} replied, {} silent, {} failed), avg listen {}ms, transcribe {}ms, generate {}ms",
            session_id,
            summary.total_turns,
            summary.replied_turns,
            summary.silent_turns,
            summary.failed_turns,
            summary.avg_listening_ms,
            summary.avg_transcription_ms,
            summary.avg_generation_ms
        );
    }
}

/// Effect runner backed by real devices and a remote pipeline.
pub struct VoiceEffectRunner {
    capture_ops: mpsc::UnboundedSender<CaptureOp>,
    playback: Arc<dyn PlaybackSink>,
    pipeline: Arc<dyn RemotePipeline>,
    config: TurnConfig,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl VoiceEffectRunner {
    /// Spawns the capture worker, so this must be called inside a tokio runtime.
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        playback: Arc<dyn PlaybackSink>,
        pipeline: Arc<dyn RemotePipeline>,
        config: TurnConfig,
        metrics: Arc<Mutex<MetricsCollector>>,
    ) -> Arc<Self> {
        let (capture_ops, ops_rx) = mpsc::unbounded_channel();
        let worker = CaptureWorker {
            source: capture,
            monitor_config: config.monitor_config(),
            metrics: metrics.clone(),
            current: None,
        };
        tokio::spawn(worker.run(ops_rx));

        Arc::new(Self {
            capture_ops,
            playback,
            pipeline,
            config,
            metrics,
        })
    }

    fn capture_op(&self, op: CaptureOp) {
        if self.capture_ops.send(op).is_err() {
            log::error!("Capture worker is gone; dropping capture request");
        }
    }
}

impl EffectRunner for VoiceEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { id } => self.capture_op(CaptureOp::Start { id, tx }),
            Effect::StopCapture { id } => self.capture_op(CaptureOp::Stop { id, tx }),
            Effect::DiscardCapture { id } => self.capture_op(CaptureOp::Discard { id }),

            Effect::Transcribe { id, clip } => {
                let pipeline = self.pipeline.clone();
                let metrics = self.metrics.clone();
                let timeout = self.config.transcription_timeout();

                tokio::spawn(async move {
                    metrics.lock().await.transcription_started(id);

                    let result =
                        with_timeout(Leg::Transcription, timeout, pipeline.transcribe(clip)).await;
                    match result {
                        Ok(transcript) => {
                            log::info!("Transcript: {:?}", transcript);
                            {
                                let mut m = metrics.lock().await;
                                m.transcription_completed(id, transcript.len());
                                if transcript.trim().is_empty() {
                                    m.turn_silent(id);
                                }
                            }
                            let _ = tx.send(Event::Transcribed { id, transcript }).await;
                        }
                        Err(e) => {
                            log::error!("Transcription failed: {}", e);
                            metrics
                                .lock()
                                .await
                                .turn_failed(id, "transcription", e.to_string());
                            let _ = tx
                                .send(Event::PipelineFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::Generate {
                id,
                transcript,
                state,
            } => {
                let pipeline = self.pipeline.clone();
                let metrics = self.metrics.clone();
                let timeout = self.config.reply_timeout();

                tokio::spawn(async move {
                    metrics.lock().await.generation_started(id);

                    let result = with_timeout(
                        Leg::Generation,
                        timeout,
                        pipeline.generate(&transcript, &state),
                    )
                    .await;
                    match result {
                        Ok(reply) => {
                            log::info!("Reply: {:?}", reply.speech);
                            metrics
                                .lock()
                                .await
                                .generation_completed(id, reply.speech.len());
                            let _ = tx.send(Event::ReplyReady { id, reply }).await;
                        }
                        Err(e) => {
                            log::error!("Generation failed: {}", e);
                            metrics
                                .lock()
                                .await
                                .turn_failed(id, "generation", e.to_string());
                            let _ = tx
                                .send(Event::PipelineFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::Play { id, audio } => {
                // Queued now, so a StopPlayback emitted later reaches the sink after it.
                let mut handle = self.playback.play(audio);
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle.started().await {
                        log::error!("Playback failed to start: {}", e);
                        metrics
                            .lock()
                            .await
                            .record_error("playback", e.to_string(), Some(id));
                        let _ = tx
                            .send(Event::PlaybackFailed {
                                id,
                                err: e.to_string(),
                            })
                            .await;
                        return;
                    }

                    let _ = tx.send(Event::PlaybackStarted { id }).await;

                    match handle.finished().await {
                        Some(Ok(())) => {
                            let _ = tx.send(Event::PlaybackFinished { id }).await;
                        }
                        Some(Err(e)) => {
                            log::error!("Playback failed: {}", e);
                            let _ = tx
                                .send(Event::PlaybackFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                        None => log::debug!("Playback for turn {} was interrupted", id),
                    }
                });
            }

            Effect::StopPlayback => {
                self.playback.stop();
            }

            Effect::StartSettleTimer { id } => {
                let delay = self.config.settle_delay();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    log::debug!("Settle delay elapsed for turn {}", id);
                    let _ = tx.send(Event::SettleElapsed { id }).await;
                });
            }

            Effect::Release { session_id } => {
                self.capture_op(CaptureOp::Release { session_id });
            }

            Effect::Notify { .. } | Effect::EmitUi => {
                // Handled in the main loop, not here
                log::debug!("{:?} reached the effect runner; ignoring", effect);
            }
        }
    }
}
