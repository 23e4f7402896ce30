//! IIR biquad filters for the per-sensor pipelines.
//!
//! Second-order sections with RBJ cookbook coefficients, evaluated in
//! Direct Form II transposed. The bandpass used by the EEG and PPG
//! pipelines is realized as a high-pass/low-pass cascade, which keeps
//! the passband flat at these wide ratios; notches use Q = 30.
//!
//! Filter state persists across ticks, so each pipeline owns one filter
//! instance per channel for the lifetime of a streaming session.

use std::f64::consts::PI;

/// Butterworth quality factor for a single second-order section.
const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Quality factor of the mains notches.
const NOTCH_Q: f64 = 30.0;

/// One second-order section, Direct Form II transposed.
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn from_normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Second-order low-pass at `cutoff_hz`.
    #[must_use]
    pub fn lowpass(sample_rate: f64, cutoff_hz: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * BUTTERWORTH_Q);
        Self::from_normalized(
            (1.0 - cos) / 2.0,
            1.0 - cos,
            (1.0 - cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    /// Second-order high-pass at `cutoff_hz`.
    #[must_use]
    pub fn highpass(sample_rate: f64, cutoff_hz: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * BUTTERWORTH_Q);
        Self::from_normalized(
            (1.0 + cos) / 2.0,
            -(1.0 + cos),
            (1.0 + cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    /// Narrow band-stop centered on `center_hz`.
    #[must_use]
    pub fn notch(sample_rate: f64, center_hz: f64) -> Self {
        let w0 = 2.0 * PI * center_hz / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * NOTCH_Q);
        Self::from_normalized(1.0, -2.0 * cos, 1.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    /// Process one sample.
    #[inline]
    pub fn step(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    /// Clear filter state.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// A cascade of biquads applied in sequence, one channel's filter chain.
#[derive(Debug, Clone)]
pub struct FilterChain {
    sections: Vec<Biquad>,
}

impl FilterChain {
    /// EEG chain: 0.5–50 Hz bandpass plus 50 Hz and 60 Hz mains notches.
    #[must_use]
    pub fn eeg(sample_rate: f64) -> Self {
        Self {
            sections: vec![
                Biquad::highpass(sample_rate, 0.5),
                Biquad::lowpass(sample_rate, 50.0),
                Biquad::notch(sample_rate, 50.0),
                Biquad::notch(sample_rate, 60.0),
            ],
        }
    }

    /// PPG chain: 0.5–8 Hz bandpass.
    #[must_use]
    pub fn ppg(sample_rate: f64) -> Self {
        Self {
            sections: vec![
                Biquad::highpass(sample_rate, 0.5),
                Biquad::lowpass(sample_rate, 8.0),
            ],
        }
    }

    /// Accelerometer chain: 0.3 Hz high-pass to remove gravity.
    #[must_use]
    pub fn acc(sample_rate: f64) -> Self {
        Self {
            sections: vec![Biquad::highpass(sample_rate, 0.3)],
        }
    }

    /// Filter one sample through the whole cascade.
    #[inline]
    pub fn step(&mut self, x: f64) -> f64 {
        self.sections.iter_mut().fold(x, |acc, s| s.step(acc))
    }

    /// Filter a slice into `out`, reusing `out`'s allocation.
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        out.reserve(input.len());
        for &x in input {
            #[allow(clippy::cast_possible_truncation)]
            out.push(self.step(f64::from(x)) as f32);
        }
    }

    /// Clear the state of every section.
    pub fn reset(&mut self) {
        for s in &mut self.sections {
            s.reset();
        }
    }
}
