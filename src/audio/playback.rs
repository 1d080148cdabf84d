//! Reply playback through the default output device.
//!
//! rodio's `OutputStream` is not `Send`, so a single long-lived thread owns it
//! and takes commands over a channel. `play` and `stop` only enqueue, so the
//! thread sees them in the order they were called. Each `play` returns a
//! [`PlaybackHandle`] that reports when the clip started and when it finished.
//! Clips that are stopped or replaced never finish; their handle yields `None`.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use tokio::sync::oneshot;

/// How often the playback thread checks whether the current clip has drained.
const DRAIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("Audio output unavailable: {0}")]
    OutputUnavailable(String),
    #[error("Failed to decode reply audio: {0}")]
    Decode(String),
    #[error("Playback thread is not running")]
    Closed,
}

type Completion = Result<(), PlaybackError>;

/// Tracks one queued clip.
#[derive(Debug)]
pub struct PlaybackHandle {
    started: oneshot::Receiver<Completion>,
    done: oneshot::Receiver<Completion>,
}

impl PlaybackHandle {
    pub fn new(started: oneshot::Receiver<Completion>, done: oneshot::Receiver<Completion>) -> Self {
        Self { started, done }
    }

    /// A clip that could not be queued at all.
    pub fn failed(err: PlaybackError) -> Self {
        let (started_tx, started) = oneshot::channel();
        let (_, done) = oneshot::channel();
        let _ = started_tx.send(Err(err));
        Self { started, done }
    }

    /// Wait until the output device accepted the clip.
    pub async fn started(&mut self) -> Completion {
        match (&mut self.started).await {
            Ok(result) => result,
            Err(_) => Err(PlaybackError::Closed),
        }
    }

    /// `Some(Ok)` when the clip played to the end, `Some(Err)` when it broke
    /// mid-way, `None` when it was stopped or replaced.
    pub async fn finished(self) -> Option<Completion> {
        self.done.await.ok()
    }
}

/// Both calls must return without waiting on the device.
pub trait PlaybackSink: Send + Sync + 'static {
    fn play(&self, audio: Vec<u8>) -> PlaybackHandle;
    fn stop(&self);
}

enum Command {
    Play {
        audio: Vec<u8>,
        started: oneshot::Sender<Completion>,
        done: oneshot::Sender<Completion>,
    },
    Stop,
}

pub struct RodioPlayback {
    tx: std_mpsc::Sender<Command>,
}

impl RodioPlayback {
    pub fn new() -> Result<Self, PlaybackError> {
        let (tx, rx) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || playback_thread(rx))
            .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;
        Ok(Self { tx })
    }
}

impl PlaybackSink for RodioPlayback {
    fn play(&self, audio: Vec<u8>) -> PlaybackHandle {
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let queued = self.tx.send(Command::Play {
            audio,
            started: started_tx,
            done: done_tx,
        });
        if queued.is_err() {
            return PlaybackHandle::failed(PlaybackError::Closed);
        }
        PlaybackHandle::new(started_rx, done_rx)
    }

    fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

fn playback_thread(rx: std_mpsc::Receiver<Command>) {
    // Opened once; a missing device is reported on every play attempt.
    let output = OutputStream::try_default().map_err(|e| e.to_string());
    if let Err(e) = &output {
        log::warn!("Playback: no output device: {}", e);
    }

    let mut current: Option<(Sink, oneshot::Sender<Completion>)> = None;

    loop {
        match rx.recv_timeout(DRAIN_POLL) {
            Ok(Command::Play {
                audio,
                started,
                done,
            }) => {
                if let Some((sink, _replaced)) = current.take() {
                    log::debug!("Playback: replacing clip still in progress");
                    sink.stop();
                }

                match start_sink(&output, audio) {
                    Ok(sink) => {
                        let _ = started.send(Ok(()));
                        current = Some((sink, done));
                    }
                    Err(e) => {
                        log::error!("Playback: {}", e);
                        let _ = started.send(Err(e));
                    }
                }
            }
            Ok(Command::Stop) => {
                if let Some((sink, _interrupted)) = current.take() {
                    sink.stop();
                    log::info!("Playback: stopped");
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                let drained = current.as_ref().is_some_and(|(sink, _)| sink.empty());
                if drained {
                    if let Some((_, done)) = current.take() {
                        log::debug!("Playback: clip finished");
                        let _ = done.send(Ok(()));
                    }
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("Playback thread exiting");
}

fn start_sink(
    output: &Result<(OutputStream, OutputStreamHandle), String>,
    audio: Vec<u8>,
) -> Result<Sink, PlaybackError> {
    let (_stream, handle) = output
        .as_ref()
        .map_err(|e| PlaybackError::OutputUnavailable(e.clone()))?;

    let source =
        Decoder::new(Cursor::new(audio)).map_err(|e| PlaybackError::Decode(e.to_string()))?;
    let sink = Sink::try_new(handle).map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;
    sink.append(source);
    sink.play();
    Ok(sink)
}
