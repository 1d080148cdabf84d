//! Microphone capture using CPAL, encoded to an in-memory WAV clip with hound.
//!
//! A cpal `Stream` cannot move between threads on every platform, so each
//! capture owns a dedicated thread that builds the stream, keeps it alive until
//! asked to stop, and then hands back the encoded clip. While running, the
//! input callback forwards mono frames to the silence monitor.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use hound::{WavSpec, WavWriter};

use super::FrameSender;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to encode audio: {0}")]
    EncodeFailed(String),
    #[error("Audio capture thread exited unexpectedly")]
    CaptureThreadExited,
    #[error("Invalid analyser settings: {0}")]
    InvalidAnalyser(String),
}

/// One captured turn, encoded as 16-bit mono WAV.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioClip {
    bytes: Vec<u8>,
    sample_rate: u32,
    samples: usize,
}

impl AudioClip {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Encode mono samples. No samples produces an empty clip with no bytes.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Result<Self, AudioError> {
        if samples.is_empty() {
            return Ok(Self {
                bytes: Vec::new(),
                sample_rate,
                samples: 0,
            });
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
            for &sample in samples {
                writer
                    .write_sample(sample)
                    .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        }

        Ok(Self {
            bytes: cursor.into_inner(),
            sample_rate,
            samples: samples.len(),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0 || self.bytes.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples as f64 / f64::from(self.sample_rate))
    }
}

/// Something that can open a capture for one listening turn.
pub trait CaptureSource: Send + Sync + 'static {
    fn start(&self, frames: FrameSender) -> Result<Box<dyn ActiveCapture>, AudioError>;
}

/// A running capture. Finishing stops the device and returns everything heard.
pub trait ActiveCapture: Send {
    fn finish(self: Box<Self>) -> Result<AudioClip, AudioError>;
}

/// Captures from the default input device.
#[derive(Debug, Default)]
pub struct MicrophoneSource;

impl MicrophoneSource {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureSource for MicrophoneSource {
    fn start(&self, frames: FrameSender) -> Result<Box<dyn ActiveCapture>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (done_tx, done_rx) = std_mpsc::sync_channel::<Result<AudioClip, AudioError>>(1);

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_thread(frames, ready_tx, stop_rx, done_tx))
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(MicrophoneCapture {
                stop_tx,
                done_rx,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::CaptureThreadExited),
        }
    }
}

struct MicrophoneCapture {
    stop_tx: std_mpsc::Sender<()>,
    done_rx: std_mpsc::Receiver<Result<AudioClip, AudioError>>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveCapture for MicrophoneCapture {
    fn finish(mut self: Box<Self>) -> Result<AudioClip, AudioError> {
        let _ = self.stop_tx.send(());
        let result = self
            .done_rx
            .recv()
            .map_err(|_| AudioError::CaptureThreadExited)?;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        // Lets the capture thread release the device if finish() was never called.
        let _ = self.stop_tx.send(());
    }
}

fn capture_thread(
    frames: FrameSender,
    ready_tx: std_mpsc::SyncSender<Result<(), AudioError>>,
    stop_rx: std_mpsc::Receiver<()>,
    done_tx: std_mpsc::SyncSender<Result<AudioClip, AudioError>>,
) {
    let buffer: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));

    let (stream, sample_rate) = match open_stream(buffer.clone(), frames) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    log::info!("Capture started at {} Hz", sample_rate);
    let _ = ready_tx.send(Ok(()));

    // Either an explicit stop or the owner going away ends the capture.
    let _ = stop_rx.recv();
    drop(stream);

    let samples = buffer
        .lock()
        .map(|mut guard| std::mem::take(&mut *guard))
        .unwrap_or_default();

    let clip = AudioClip::from_samples(&samples, sample_rate);
    if let Ok(clip) = &clip {
        log::info!(
            "Capture stopped: {} samples ({:.2}s)",
            samples.len(),
            clip.duration().as_secs_f32()
        );
    }
    let _ = done_tx.send(clip);
}

fn open_stream(
    buffer: Arc<Mutex<Vec<i16>>>,
    frames: FrameSender,
) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, buffer, frames),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, buffer, frames),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, buffer, frames),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, sample_rate))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<Vec<i16>>>,
    frames: FrameSender,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);

                if let Ok(mut guard) = buffer.lock() {
                    guard.extend(mono.iter().map(|&s| f32_to_i16(s)));
                }

                // Analysis is best effort; a full channel just skips a frame.
                let _ = frames.try_send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Average interleaved channels into mono floats.
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
            sum / frame.len() as f32
        })
        .collect()
}

fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
