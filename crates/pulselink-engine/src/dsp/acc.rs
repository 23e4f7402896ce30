//! Accelerometer pipeline: gravity removal, movement magnitude, and
//! discrete activity classification.

use std::sync::Arc;

use serde::Serialize;

use crate::dsp::filters::FilterChain;
use crate::dsp::{Pipeline, ProcessedWindow, SignalQuality};
use crate::error::{EngineError, EngineResult};
use crate::ring::RingConsumer;
use crate::sample::{ACC_RATE_HZ, AccSample, SensorKind, epoch_now};

/// Movement-magnitude mean thresholds, milli-g.
const STATIONARY_BELOW: f32 = 200.0;
const SITTING_BELOW: f32 = 600.0;
const WALKING_BELOW: f32 = 1000.0;

/// Minimum per-tick sample count below which the window is marked
/// insufficient.
const MIN_TICK_SAMPLES: usize = 5;

/// Discrete activity states classified from movement magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Stationary,
    Sitting,
    Walking,
    Running,
}

impl ActivityState {
    /// Classify a movement-magnitude mean in milli-g.
    #[must_use]
    pub fn classify(magnitude_mean_mg: f32) -> Self {
        if magnitude_mean_mg < STATIONARY_BELOW {
            ActivityState::Stationary
        } else if magnitude_mean_mg < SITTING_BELOW {
            ActivityState::Sitting
        } else if magnitude_mean_mg < WALKING_BELOW {
            ActivityState::Walking
        } else {
            ActivityState::Running
        }
    }
}

/// One processed accelerometer window.
#[derive(Debug, Clone, Serialize)]
pub struct AccWindow {
    pub ts: f64,
    /// Gravity-removed per-axis deltas, g units.
    pub dx: Vec<f32>,
    pub dy: Vec<f32>,
    pub dz: Vec<f32>,
    pub sqi: Vec<f32>,
    pub signal_quality: SignalQuality,
    /// Movement magnitude statistics over the window, milli-g.
    pub avg_magnitude: f32,
    pub std_magnitude: f32,
    pub max_magnitude: f32,
    pub activity: ActivityState,
}

/// Stateful accelerometer processor consuming the ACC ring.
pub struct AccPipeline {
    consumer: RingConsumer<AccSample>,
    x_chain: FilterChain,
    y_chain: FilterChain,
    z_chain: FilterChain,
}

impl AccPipeline {
    #[must_use]
    pub fn new(consumer: RingConsumer<AccSample>) -> Self {
        Self {
            consumer,
            x_chain: FilterChain::acc(ACC_RATE_HZ),
            y_chain: FilterChain::acc(ACC_RATE_HZ),
            z_chain: FilterChain::acc(ACC_RATE_HZ),
        }
    }
}

impl Pipeline for AccPipeline {
    fn sensor(&self) -> SensorKind {
        SensorKind::Acc
    }

    fn tick(&mut self) -> EngineResult<ProcessedWindow> {
        let (samples, _lost) = self.consumer.snapshot();

        let mut dx = Vec::with_capacity(samples.len());
        let mut dy = Vec::with_capacity(samples.len());
        let mut dz = Vec::with_capacity(samples.len());
        self.x_chain
            .process_into(&samples.iter().map(|s| s.x).collect::<Vec<_>>(), &mut dx);
        self.y_chain
            .process_into(&samples.iter().map(|s| s.y).collect::<Vec<_>>(), &mut dy);
        self.z_chain
            .process_into(&samples.iter().map(|s| s.z).collect::<Vec<_>>(), &mut dz);

        // Per-sample movement magnitude in milli-g.
        let magnitudes: Vec<f32> = dx
            .iter()
            .zip(dy.iter())
            .zip(dz.iter())
            .map(|((&x, &y), &z)| (x * x + y * y + z * z).sqrt() * 1000.0)
            .collect();

        if magnitudes.iter().any(|m| !m.is_finite()) {
            return Err(EngineError::Pipeline {
                sensor: self.sensor().to_string(),
                reason: "non-finite magnitude".into(),
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let n = magnitudes.len().max(1) as f32;
        let avg = magnitudes.iter().sum::<f32>() / n;
        let var = magnitudes.iter().map(|m| (m - avg) * (m - avg)).sum::<f32>() / n;
        let std = var.sqrt();
        let max = magnitudes.iter().fold(0.0f32, |a, &b| a.max(b));

        // SQI: motion envelope; saturated readings (clipped at ±4 g)
        // score low.
        let sqi: Vec<f32> = samples
            .iter()
            .map(|s| {
                let peak = s.x.abs().max(s.y.abs()).max(s.z.abs());
                if peak >= 3.9 { 0.2 } else { 1.0 }
            })
            .collect();

        let insufficient = samples.len() < MIN_TICK_SAMPLES;
        let signal_quality = if insufficient {
            SignalQuality::Insufficient
        } else if sqi.iter().sum::<f32>() / n >= 0.6 {
            SignalQuality::Good
        } else {
            SignalQuality::Poor
        };

        let window = AccWindow {
            ts: epoch_now(),
            dx,
            dy,
            dz,
            sqi,
            signal_quality,
            avg_magnitude: avg,
            std_magnitude: std,
            max_magnitude: max,
            activity: ActivityState::classify(avg),
        };

        Ok(ProcessedWindow::Acc(Arc::new(window)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring;

    #[test]
    fn test_activity_thresholds() {
        assert_eq!(ActivityState::classify(0.0), ActivityState::Stationary);
        assert_eq!(ActivityState::classify(199.9), ActivityState::Stationary);
        assert_eq!(ActivityState::classify(200.0), ActivityState::Sitting);
        assert_eq!(ActivityState::classify(599.9), ActivityState::Sitting);
        assert_eq!(ActivityState::classify(600.0), ActivityState::Walking);
        assert_eq!(ActivityState::classify(999.9), ActivityState::Walking);
        assert_eq!(ActivityState::classify(1000.0), ActivityState::Running);
    }

    #[test]
    fn test_stationary_band_on_static_gravity() {
        let (tx, rx) = ring::ring(150);
        let mut pipeline = AccPipeline::new(rx);
        // Settle the high-pass: constant 1 g on z across a few ticks.
        for round in 0..20 {
            for i in 0..15 {
                #[allow(clippy::cast_precision_loss)]
                let t = f64::from(round) * 0.5 + i as f64 / ACC_RATE_HZ;
                tx.push(AccSample {
                    ts: t,
                    x: 0.0,
                    y: 0.0,
                    z: 1.0,
                });
            }
            let _ = pipeline.tick().unwrap();
        }
        for i in 0..15 {
            #[allow(clippy::cast_precision_loss)]
            tx.push(AccSample {
                ts: 10.0 + i as f64 / ACC_RATE_HZ,
                x: 0.0,
                y: 0.0,
                z: 1.0,
            });
        }
        let ProcessedWindow::Acc(window) = pipeline.tick().unwrap() else {
            panic!("wrong window kind");
        };
        assert_eq!(window.activity, ActivityState::Stationary);
        assert!(
            window.avg_magnitude < STATIONARY_BELOW,
            "gravity leaked into magnitude: {}",
            window.avg_magnitude
        );
    }

    #[test]
    fn test_vigorous_shake_classifies_high() {
        let (tx, rx) = ring::ring(150);
        let mut pipeline = AccPipeline::new(rx);
        for i in 0..60 {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f64 / ACC_RATE_HZ;
            // 6 Hz shake at 2 g amplitude.
            #[allow(clippy::cast_possible_truncation)]
            let v = (2.0 * (2.0 * std::f64::consts::PI * 6.0 * t).sin()) as f32;
            tx.push(AccSample {
                ts: t,
                x: v,
                y: -v,
                z: 1.0 + v,
            });
        }
        let ProcessedWindow::Acc(window) = pipeline.tick().unwrap() else {
            panic!("wrong window kind");
        };
        assert!(matches!(
            window.activity,
            ActivityState::Walking | ActivityState::Running
        ));
        assert!(window.max_magnitude > window.avg_magnitude);
    }

    #[test]
    fn test_empty_tick_is_insufficient() {
        let (_tx, rx) = ring::ring(150);
        let mut pipeline = AccPipeline::new(rx);
        let ProcessedWindow::Acc(window) = pipeline.tick().unwrap() else {
            panic!("wrong window kind");
        };
        assert_eq!(window.signal_quality, SignalQuality::Insufficient);
        assert!(window.dx.is_empty());
    }
}
