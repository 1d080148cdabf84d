//! Bounded sample window feeding the frequency analyser.
//!
//! Holds the most recent `capacity` mono samples. The analyser reads the whole
//! window on every tick, so the window is always exactly one FFT frame long.

use std::collections::VecDeque;

pub struct SampleWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add samples, dropping the oldest ones once at capacity.
    ///
    /// Uses bulk drain + extend rather than per-sample push/pop.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        // More than a full window arrived: keep only the tail.
        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// Copy the window into `out` (length == capacity), oldest first.
    /// A partially filled window is zero-padded at the front.
    pub fn copy_to(&self, out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.capacity);
        let pad = self.capacity.saturating_sub(self.samples.len());
        out[..pad].fill(0.0);
        for (dst, &src) in out[pad..].iter_mut().zip(self.samples.iter()) {
            *dst = src;
        }
    }

}
