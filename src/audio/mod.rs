//! Audio capture, end-of-turn detection and reply playback.
//!
//! Capture uses CPAL and encodes each turn with hound. The live frames feed a
//! rustfft-based analyser whose average energy drives the silence detector.
//! Playback uses rodio.

pub mod analyser;
pub mod playback;
pub mod recorder;
pub mod vad;
mod window;

use tokio::sync::mpsc;

pub use analyser::{AnalyserConfig, FrequencyAnalyser};
pub use playback::{PlaybackError, PlaybackHandle, PlaybackSink, RodioPlayback};
pub use recorder::{ActiveCapture, AudioClip, AudioError, CaptureSource, MicrophoneSource};
pub use vad::{run_silence_monitor, Activity, MonitorConfig, SilenceDetector, TurnEnd};

/// Mono frames from the capture callback to the silence monitor.
pub type FrameSender = mpsc::Sender<Vec<f32>>;
pub type FrameReceiver = mpsc::Receiver<Vec<f32>>;

/// Bounded so a stalled monitor cannot grow memory; the callback drops frames
/// when full.
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    mpsc::channel(FRAME_CHANNEL_CAPACITY)
}
