//! EEG pipeline: bandpass + mains notches, per-sample SQI, Welch band
//! powers, and the derived cognitive indices.
//!
//! Band powers are estimated over a rolling two-second window of
//! filtered samples so the 500 ms tick cadence still gets a usable
//! spectral floor at 0.5 Hz.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::dsp::filters::FilterChain;
use crate::dsp::spectrum::WelchPsd;
use crate::dsp::{Pipeline, ProcessedWindow, SignalQuality};
use crate::error::{EngineError, EngineResult};
use crate::ring::RingConsumer;
use crate::sample::{EEG_RATE_HZ, EegSample, SensorKind, epoch_now};

/// Rolling spectral window, seconds.
const PSD_WINDOW_S: f64 = 2.0;

/// Amplitude above which a sample stops counting as clean scalp EEG, µV.
const AMPLITUDE_SOFT_LIMIT_UV: f32 = 100.0;

/// Minimum per-tick sample count below which the window is marked
/// insufficient.
const MIN_TICK_SAMPLES: usize = 32;

/// Per-channel band powers in µV²: δ, θ, α, β, γ.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BandPowers {
    pub delta: f32,
    pub theta: f32,
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
}

impl BandPowers {
    fn total(self) -> f32 {
        self.delta + self.theta + self.alpha + self.beta + self.gamma
    }
}

/// Derived cognitive indices computed from the two channels' band powers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EegIndices {
    pub focus: f32,
    pub relaxation: f32,
    pub stress: f32,
    pub hemispheric_balance: f32,
    pub cognitive_load: f32,
    pub emotional_stability: f32,
    pub total_power: f32,
}

/// One processed EEG window.
#[derive(Debug, Clone, Serialize)]
pub struct EegWindow {
    /// Emission time, seconds since epoch.
    pub ts: f64,
    pub ch1_filtered: Vec<f32>,
    pub ch2_filtered: Vec<f32>,
    pub ch1_sqi: Vec<f32>,
    pub ch2_sqi: Vec<f32>,
    pub signal_quality: SignalQuality,
    pub ch1_bands: Option<BandPowers>,
    pub ch2_bands: Option<BandPowers>,
    pub indices: Option<EegIndices>,
}

/// Stateful EEG processor consuming the EEG ring.
pub struct EegPipeline {
    consumer: RingConsumer<EegSample>,
    ch1_chain: FilterChain,
    ch2_chain: FilterChain,
    welch: WelchPsd,
    /// Rolling filtered history for spectral estimation, newest last.
    ch1_history: VecDeque<f32>,
    ch2_history: VecDeque<f32>,
    history_len: usize,
    scratch1: Vec<f32>,
    scratch2: Vec<f32>,
}

impl EegPipeline {
    #[must_use]
    pub fn new(consumer: RingConsumer<EegSample>) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let history_len = (EEG_RATE_HZ * PSD_WINDOW_S) as usize;
        Self {
            consumer,
            ch1_chain: FilterChain::eeg(EEG_RATE_HZ),
            ch2_chain: FilterChain::eeg(EEG_RATE_HZ),
            welch: WelchPsd::new(256),
            ch1_history: VecDeque::with_capacity(history_len),
            ch2_history: VecDeque::with_capacity(history_len),
            history_len,
            scratch1: Vec::new(),
            scratch2: Vec::new(),
        }
    }

    fn push_history(history: &mut VecDeque<f32>, values: &[f32], cap: usize) {
        for &v in values {
            if history.len() == cap {
                history.pop_front();
            }
            history.push_back(v);
        }
    }

    fn band_powers(&mut self, signal: &[f32]) -> Option<BandPowers> {
        if signal.len() < self.welch.segment_len() / 2 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let rate = EEG_RATE_HZ as f32;
        let psd = self.welch.psd(signal, rate);
        Some(BandPowers {
            delta: self.welch.band_power(&psd, rate, 0.5, 4.0),
            theta: self.welch.band_power(&psd, rate, 4.0, 8.0),
            alpha: self.welch.band_power(&psd, rate, 8.0, 13.0),
            beta: self.welch.band_power(&psd, rate, 13.0, 30.0),
            gamma: self.welch.band_power(&psd, rate, 30.0, 45.0),
        })
    }
}

/// Per-sample SQI: amplitude headroom shaded by the lead-off flag.
fn sample_sqi(filtered: f32, leadoff: bool) -> f32 {
    if leadoff {
        return 0.0;
    }
    let amp = filtered.abs();
    if amp <= AMPLITUDE_SOFT_LIMIT_UV {
        1.0
    } else {
        (1.0 - (amp - AMPLITUDE_SOFT_LIMIT_UV) / AMPLITUDE_SOFT_LIMIT_UV).max(0.0)
    }
}

/// Degrade a channel's SQI when its window variance is implausible for
/// scalp EEG (flat line or motion swamp).
fn variance_factor(filtered: &[f32]) -> f32 {
    if filtered.len() < 4 {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = filtered.len() as f32;
    let mean = filtered.iter().sum::<f32>() / n;
    let var = filtered.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    let std = var.sqrt();
    if std < 0.2 {
        0.2
    } else if std > 60.0 {
        (60.0 / std).max(0.1)
    } else {
        1.0
    }
}

/// Glossary index formulas over the two channels' band powers.
fn derive_indices(left: BandPowers, right: BandPowers) -> EegIndices {
    let theta = (left.theta + right.theta) / 2.0;
    let alpha = (left.alpha + right.alpha) / 2.0;
    let beta = (left.beta + right.beta) / 2.0;
    let gamma = (left.gamma + right.gamma) / 2.0;

    let guard = |d: f32| d.max(1e-6);
    EegIndices {
        focus: beta / guard(alpha + theta),
        relaxation: alpha / guard(alpha + beta),
        stress: (beta + gamma) / guard(alpha + theta),
        hemispheric_balance: (left.alpha - right.alpha) / guard(left.alpha + right.alpha),
        cognitive_load: theta / guard(alpha),
        emotional_stability: (alpha + theta) / guard(gamma),
        total_power: (left.total() + right.total()) / 2.0,
    }
}

impl Pipeline for EegPipeline {
    fn sensor(&self) -> SensorKind {
        SensorKind::Eeg
    }

    fn tick(&mut self) -> EngineResult<ProcessedWindow> {
        let (samples, _lost) = self.consumer.snapshot();

        let ch1_raw: Vec<f32> = samples.iter().map(|s| s.ch1).collect();
        let ch2_raw: Vec<f32> = samples.iter().map(|s| s.ch2).collect();
        let mut ch1 = std::mem::take(&mut self.scratch1);
        let mut ch2 = std::mem::take(&mut self.scratch2);
        self.ch1_chain.process_into(&ch1_raw, &mut ch1);
        self.ch2_chain.process_into(&ch2_raw, &mut ch2);

        Self::push_history(&mut self.ch1_history, &ch1, self.history_len);
        Self::push_history(&mut self.ch2_history, &ch2, self.history_len);

        let v1 = variance_factor(&ch1);
        let v2 = variance_factor(&ch2);
        let ch1_sqi: Vec<f32> = ch1
            .iter()
            .zip(samples.iter())
            .map(|(&f, s)| sample_sqi(f, s.ch1_leadoff) * v1)
            .collect();
        let ch2_sqi: Vec<f32> = ch2
            .iter()
            .zip(samples.iter())
            .map(|(&f, s)| sample_sqi(f, s.ch2_leadoff) * v2)
            .collect();

        let insufficient = samples.len() < MIN_TICK_SAMPLES;
        let ch1_bands = if insufficient {
            None
        } else {
            let signal: Vec<f32> = self.ch1_history.iter().copied().collect();
            self.band_powers(&signal)
        };
        let ch2_bands = if insufficient {
            None
        } else {
            let signal: Vec<f32> = self.ch2_history.iter().copied().collect();
            self.band_powers(&signal)
        };
        let indices = match (ch1_bands, ch2_bands) {
            (Some(l), Some(r)) => Some(derive_indices(l, r)),
            _ => None,
        };

        for window in [&ch1, &ch2] {
            if window.iter().any(|x| !x.is_finite()) {
                return Err(EngineError::Pipeline {
                    sensor: self.sensor().to_string(),
                    reason: "non-finite filter output".into(),
                });
            }
        }

        let mean_sqi = {
            let all = ch1_sqi.iter().chain(ch2_sqi.iter());
            let (sum, n) = all.fold((0.0f32, 0usize), |(s, n), &q| (s + q, n + 1));
            #[allow(clippy::cast_precision_loss)]
            let mean = if n == 0 { 0.0 } else { sum / n as f32 };
            mean
        };
        let signal_quality = if insufficient {
            SignalQuality::Insufficient
        } else if mean_sqi >= 0.6 {
            SignalQuality::Good
        } else {
            SignalQuality::Poor
        };

        let window = EegWindow {
            ts: epoch_now(),
            ch1_filtered: ch1.clone(),
            ch2_filtered: ch2.clone(),
            ch1_sqi,
            ch2_sqi,
            signal_quality,
            ch1_bands,
            ch2_bands,
            indices,
        };

        // Hand the scratch allocations back for the next tick.
        self.scratch1 = ch1;
        self.scratch2 = ch2;
        self.scratch1.clear();
        self.scratch2.clear();

        Ok(ProcessedWindow::Eeg(Arc::new(window)))
    }
}
