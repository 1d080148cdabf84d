//! Byte-scaled frequency analysis of the live capture.
//!
//! Reproduces the browser `AnalyserNode` pipeline the silence detector was
//! tuned against: Blackman window, forward FFT, magnitude normalised by the
//! FFT size, exponential smoothing over time, conversion to decibels, then a
//! linear map of `[min_decibels, max_decibels]` onto `0..=255`.
//!
//! The energy threshold in [`crate::settings::TurnConfig`] is expressed on
//! that 0-255 scale, so the constants here must stay in step with it.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::window::SampleWindow;
use super::AudioError;

pub const DEFAULT_FFT_SIZE: usize = 512;
pub const DEFAULT_MIN_DECIBELS: f32 = -90.0;
pub const DEFAULT_MAX_DECIBELS: f32 = -10.0;
pub const DEFAULT_SMOOTHING: f32 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyserConfig {
    pub fft_size: usize,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub smoothing: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            min_decibels: DEFAULT_MIN_DECIBELS,
            max_decibels: DEFAULT_MAX_DECIBELS,
            smoothing: DEFAULT_SMOOTHING,
        }
    }
}

pub struct FrequencyAnalyser {
    config: AnalyserConfig,
    fft: Arc<dyn Fft<f32>>,
    window: SampleWindow,
    blackman: Vec<f32>,
    frame: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    bytes: Vec<u8>,
}

impl FrequencyAnalyser {
    pub fn new(config: AnalyserConfig) -> Result<Self, AudioError> {
        let n = config.fft_size;
        if !n.is_power_of_two() || !(32..=32768).contains(&n) {
            return Err(AudioError::InvalidAnalyser(format!(
                "fft size {} must be a power of two between 32 and 32768",
                n
            )));
        }
        if config.max_decibels <= config.min_decibels {
            return Err(AudioError::InvalidAnalyser(format!(
                "max decibels {} must exceed min decibels {}",
                config.max_decibels, config.min_decibels
            )));
        }
        if !(0.0..=1.0).contains(&config.smoothing) {
            return Err(AudioError::InvalidAnalyser(format!(
                "smoothing {} must be within 0..=1",
                config.smoothing
            )));
        }

        let fft = FftPlanner::<f32>::new().plan_fft_forward(n);
        let bins = n / 2;

        Ok(Self {
            config,
            fft,
            window: SampleWindow::new(n),
            blackman: blackman_window(n),
            frame: vec![0.0; n],
            spectrum: vec![Complex::new(0.0, 0.0); n],
            smoothed: vec![0.0; bins],
            bytes: vec![0; bins],
        })
    }

    pub fn push_samples(&mut self, samples: &[f32]) {
        self.window.push_samples(samples);
    }

    /// Analyse the current window and return one byte per frequency bin.
    pub fn byte_frequency_data(&mut self) -> &[u8] {
        self.window.copy_to(&mut self.frame);
        for ((slot, &sample), &w) in self
            .spectrum
            .iter_mut()
            .zip(self.frame.iter())
            .zip(self.blackman.iter())
        {
            *slot = Complex::new(sample * w, 0.0);
        }

        self.fft.process(&mut self.spectrum);

        let n = self.config.fft_size as f32;
        let tau = self.config.smoothing;
        let min_db = self.config.min_decibels;
        let scale = 255.0 / (self.config.max_decibels - min_db);

        for k in 0..self.bytes.len() {
            let magnitude = self.spectrum[k].norm() / n;
            let mut smoothed = tau * self.smoothed[k] + (1.0 - tau) * magnitude;
            if !smoothed.is_finite() {
                smoothed = 0.0;
            }
            self.smoothed[k] = smoothed;

            // log10(0) is -inf, which clamps to 0 below.
            let db = 20.0 * smoothed.log10();
            let scaled = (scale * (db - min_db)).floor();
            self.bytes[k] = if scaled.is_nan() {
                0
            } else {
                scaled.clamp(0.0, 255.0) as u8
            };
        }

        &self.bytes
    }

    /// Mean of the byte-scaled bins for the current window.
    pub fn average_energy(&mut self) -> f32 {
        let bytes = self.byte_frequency_data();
        if bytes.is_empty() {
            return 0.0;
        }
        let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
        sum as f32 / bytes.len() as f32
    }
}

fn blackman_window(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}
