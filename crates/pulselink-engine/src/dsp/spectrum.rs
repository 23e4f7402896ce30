//! Welch power spectral density estimation.
//!
//! Hann-windowed segments with 50 % overlap, averaged periodograms over
//! a preallocated `rustfft` plan. The planner, window, and scratch
//! buffers are built once per pipeline; `psd` does not allocate on the
//! hot path beyond its output vector.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Welch PSD estimator with fixed segment length.
pub struct WelchPsd {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Sum of squared window values, for density normalization.
    window_power: f32,
    segment_len: usize,
    scratch: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
}

impl WelchPsd {
    /// Build an estimator for `segment_len`-sample segments
    /// (rounded down to a power of two, minimum 16).
    #[must_use]
    pub fn new(segment_len: usize) -> Self {
        let mut rounded = segment_len.next_power_of_two();
        if rounded > segment_len {
            rounded /= 2;
        }
        let segment_len = rounded.max(16);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(segment_len);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let window: Vec<f32> = (0..segment_len)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * i as f64 / segment_len as f64;
                (0.5 * (1.0 - phase.cos())) as f32
            })
            .collect();
        let window_power = window.iter().map(|w| w * w).sum();
        let fft_scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        Self {
            fft,
            window,
            window_power,
            segment_len,
            scratch: vec![Complex::default(); segment_len],
            fft_scratch,
        }
    }

    /// Segment length actually used after rounding.
    #[must_use]
    pub fn segment_len(&self) -> usize {
        self.segment_len
    }

    /// One-sided PSD of `signal` sampled at `sample_rate` Hz.
    ///
    /// Returns `segment_len / 2 + 1` bins in units of power per Hz.
    /// Signals shorter than one segment are zero-padded into a single
    /// segment.
    pub fn psd(&mut self, signal: &[f32], sample_rate: f32) -> Vec<f32> {
        let n = self.segment_len;
        let half = n / 2;
        let mut accum = vec![0.0f32; half + 1];
        let mut segments = 0usize;

        let step = (n / 2).max(1);
        let mut start = 0usize;
        loop {
            let end = start + n;
            let segment: Vec<f32> = if end <= signal.len() {
                signal[start..end].to_vec()
            } else if start == 0 {
                // Too short for a full segment: zero-pad once.
                let mut padded = signal.to_vec();
                padded.resize(n, 0.0);
                padded
            } else {
                break;
            };

            // Remove the segment mean so DC leakage does not swamp the
            // low bands.
            #[allow(clippy::cast_precision_loss)]
            let mean = segment.iter().sum::<f32>() / n as f32;
            for (slot, (&x, &w)) in self
                .scratch
                .iter_mut()
                .zip(segment.iter().zip(self.window.iter()))
            {
                *slot = Complex::new((x - mean) * w, 0.0);
            }

            self.fft
                .process_with_scratch(&mut self.scratch, &mut self.fft_scratch);

            let norm = 1.0 / (self.window_power * sample_rate);
            for (bin, out) in self.scratch[..=half].iter().zip(accum.iter_mut()) {
                *out += bin.norm_sqr() * norm * 2.0;
            }
            // One-sided doubling applies to interior bins only.
            accum[0] -= self.scratch[0].norm_sqr() * norm;
            accum[half] -= self.scratch[half].norm_sqr() * norm;

            segments += 1;
            if end >= signal.len() {
                break;
            }
            start += step;
        }

        if segments > 1 {
            #[allow(clippy::cast_precision_loss)]
            let inv = 1.0 / segments as f32;
            for v in &mut accum {
                *v *= inv;
            }
        }
        accum
    }

    /// Integrate `psd` over `[lo_hz, hi_hz)`.
    #[must_use]
    pub fn band_power(&self, psd: &[f32], sample_rate: f32, lo_hz: f32, hi_hz: f32) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let bin_width = sample_rate / self.segment_len as f32;
        let mut total = 0.0;
        for (i, &p) in psd.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let freq = i as f32 * bin_width;
            if freq >= lo_hz && freq < hi_hz {
                total += p * bin_width;
            }
        }
        total
    }
}
