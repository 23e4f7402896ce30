//! # DSP Pipelines
//!
//! One stateful processor per sensor, each driven by its own task at a
//! wall-clock cadence. A tick snapshots the sensor's ring buffer,
//! filters, scores signal quality, derives indices, and emits one
//! processed window to the sinks (bus, and recorder when armed).
//!
//! ## Failure semantics
//!
//! A tick that returns an error is isolated: the error is logged, a
//! `pipeline_error` event goes out, and the next tick runs normally.
//! Three consecutive failures mark the pipeline degraded in the shared
//! telemetry (visible in engine status); the first successful tick
//! clears it. Pipelines never block on their sinks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::sample::{BatterySample, SensorKind, epoch_now};

pub mod acc;
pub mod eeg;
pub mod filters;
pub mod ppg;
pub mod spectrum;

pub use acc::{AccPipeline, AccWindow, ActivityState};
pub use eeg::{BandPowers, EegIndices, EegPipeline, EegWindow};
pub use ppg::{HrvIndices, PpgPipeline, PpgWindow};

/// Consecutive tick failures before a pipeline is marked degraded.
const DEGRADE_AFTER_FAILURES: u32 = 3;

/// Window-level signal quality verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    Good,
    Poor,
    /// The tick found too few samples to say anything.
    Insufficient,
}

/// One emitted processed window, shared immutably between sinks.
#[derive(Debug, Clone)]
pub enum ProcessedWindow {
    Eeg(Arc<EegWindow>),
    Ppg(Arc<PpgWindow>),
    Acc(Arc<AccWindow>),
    Battery(Arc<BatteryWindow>),
}

impl ProcessedWindow {
    /// Which sensor produced this window.
    #[must_use]
    pub fn sensor(&self) -> SensorKind {
        match self {
            ProcessedWindow::Eeg(_) => SensorKind::Eeg,
            ProcessedWindow::Ppg(_) => SensorKind::Ppg,
            ProcessedWindow::Acc(_) => SensorKind::Acc,
            ProcessedWindow::Battery(_) => SensorKind::Battery,
        }
    }

    /// Serialize the window payload.
    ///
    /// # Errors
    /// Propagates serde failures (practically unreachable for these
    /// types).
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            ProcessedWindow::Eeg(w) => serde_json::to_value(w),
            ProcessedWindow::Ppg(w) => serde_json::to_value(w),
            ProcessedWindow::Acc(w) => serde_json::to_value(w),
            ProcessedWindow::Battery(w) => serde_json::to_value(w),
        }
    }

    /// Mean SQI of the window, for telemetry. Battery reports 1.0.
    #[must_use]
    pub fn mean_sqi(&self) -> f32 {
        fn mean(values: &[f32]) -> f32 {
            if values.is_empty() {
                return 0.0;
            }
            #[allow(clippy::cast_precision_loss)]
            let n = values.len() as f32;
            values.iter().sum::<f32>() / n
        }
        match self {
            ProcessedWindow::Eeg(w) => (mean(&w.ch1_sqi) + mean(&w.ch2_sqi)) / 2.0,
            ProcessedWindow::Ppg(w) => mean(&w.sqi),
            ProcessedWindow::Acc(w) => mean(&w.sqi),
            ProcessedWindow::Battery(_) => 1.0,
        }
    }
}

/// A per-sensor processor: one call per tick.
pub trait Pipeline: Send {
    /// The sensor this pipeline consumes.
    fn sensor(&self) -> SensorKind;

    /// Run one processing tick over everything since the last one.
    ///
    /// # Errors
    /// Internal DSP faults; the runner isolates them.
    fn tick(&mut self) -> EngineResult<ProcessedWindow>;
}

/// Where processed windows and pipeline faults go. Implementations must
/// not block.
pub trait ProcessedSink: Send + Sync {
    /// Deliver one processed window.
    fn deliver(&self, window: &ProcessedWindow);

    /// Report an isolated pipeline fault.
    fn pipeline_error(&self, sensor: SensorKind, message: &str);
}

/// Shared pipeline counters read by the coordinator's monitoring tick.
#[derive(Debug, Default)]
pub struct PipelineTelemetry {
    pub ticks: AtomicU64,
    pub errors: AtomicU64,
    pub consecutive_failures: AtomicU32,
    pub degraded: AtomicBool,
    /// Mean SQI of the last window, scaled by 1000.
    pub last_sqi_milli: AtomicU32,
}

impl PipelineTelemetry {
    /// Mean SQI of the last emitted window, 0..1.
    #[must_use]
    pub fn last_sqi(&self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let milli = self.last_sqi_milli.load(Ordering::Relaxed) as f32;
        milli / 1000.0
    }
}

/// Drive a pipeline at `cadence` until cancelled.
///
/// The runner owns the tick interval, failure isolation, and the
/// degraded flag. Ticks that fire while a previous tick is still
/// running are coalesced by `MissedTickBehavior::Skip`.
pub fn spawn_pipeline(
    mut pipeline: Box<dyn Pipeline>,
    cadence: Duration,
    sink: Arc<dyn ProcessedSink>,
    telemetry: Arc<PipelineTelemetry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sensor = pipeline.sensor();
        let mut interval = tokio::time::interval(cadence);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::debug!(%sensor, cadence_ms = cadence.as_millis() as u64, "Pipeline started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            telemetry.ticks.fetch_add(1, Ordering::Relaxed);
            match pipeline.tick() {
                Ok(window) => {
                    let failures = telemetry.consecutive_failures.swap(0, Ordering::Relaxed);
                    if failures >= DEGRADE_AFTER_FAILURES {
                        tracing::info!(%sensor, "Pipeline recovered");
                    }
                    telemetry.degraded.store(false, Ordering::Relaxed);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    telemetry
                        .last_sqi_milli
                        .store((window.mean_sqi() * 1000.0) as u32, Ordering::Relaxed);
                    sink.deliver(&window);
                }
                Err(e) => {
                    telemetry.errors.fetch_add(1, Ordering::Relaxed);
                    let failures = telemetry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(%sensor, error = %e, failures, "Pipeline tick failed");
                    sink.pipeline_error(sensor, &e.to_string());
                    if failures >= DEGRADE_AFTER_FAILURES {
                        telemetry.degraded.store(true, Ordering::Relaxed);
                    }
                }
            }
        }
        tracing::debug!(%sensor, "Pipeline stopped");
    })
}

/// The latest battery report, shared between the adapter (writer) and
/// the battery pipeline (reader).
#[derive(Debug, Default)]
pub struct BatteryState {
    /// Bit pattern of the latest level, percent.
    level_bits: AtomicU32,
    /// Bit pattern of the latest timestamp, seconds since epoch.
    ts_bits: AtomicU64,
}

impl BatteryState {
    /// Record a new battery sample.
    pub fn update(&self, sample: BatterySample) {
        self.level_bits
            .store(sample.level.to_bits(), Ordering::Relaxed);
        self.ts_bits.store(sample.ts.to_bits(), Ordering::Relaxed);
    }

    /// The latest report, if one arrived yet.
    #[must_use]
    pub fn latest(&self) -> Option<BatterySample> {
        let ts = f64::from_bits(self.ts_bits.load(Ordering::Relaxed));
        if ts == 0.0 {
            return None;
        }
        Some(BatterySample {
            ts,
            level: f32::from_bits(self.level_bits.load(Ordering::Relaxed)),
        })
    }
}

/// One battery window: just the latest level at the battery cadence.
#[derive(Debug, Clone, Serialize)]
pub struct BatteryWindow {
    pub ts: f64,
    /// Charge level, percent. `None` before the first report.
    pub level: Option<f32>,
    pub signal_quality: SignalQuality,
}

/// Trivial battery pipeline: emits the most recent report per tick.
pub struct BatteryPipeline {
    state: Arc<BatteryState>,
}

impl BatteryPipeline {
    #[must_use]
    pub fn new(state: Arc<BatteryState>) -> Self {
        Self { state }
    }
}

impl Pipeline for BatteryPipeline {
    fn sensor(&self) -> SensorKind {
        SensorKind::Battery
    }

    fn tick(&mut self) -> EngineResult<ProcessedWindow> {
        let latest = self.state.latest();
        let window = BatteryWindow {
            ts: epoch_now(),
            level: latest.map(|s| s.level),
            signal_quality: if latest.is_some() {
                SignalQuality::Good
            } else {
                SignalQuality::Insufficient
            },
        };
        Ok(ProcessedWindow::Battery(Arc::new(window)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink {
        windows: Mutex<Vec<SensorKind>>,
        errors: Mutex<Vec<String>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                windows: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProcessedSink for CollectingSink {
        fn deliver(&self, window: &ProcessedWindow) {
            self.windows.lock().unwrap().push(window.sensor());
        }

        fn pipeline_error(&self, _sensor: SensorKind, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    /// A pipeline scripted to fail for the first `fail_first` ticks.
    struct FlakyPipeline {
        fail_first: u32,
        ticks: u32,
    }

    impl Pipeline for FlakyPipeline {
        fn sensor(&self) -> SensorKind {
            SensorKind::Eeg
        }

        fn tick(&mut self) -> EngineResult<ProcessedWindow> {
            self.ticks += 1;
            if self.ticks <= self.fail_first {
                Err(crate::error::EngineError::Pipeline {
                    sensor: "eeg".into(),
                    reason: "injected".into(),
                })
            } else {
                Ok(ProcessedWindow::Battery(Arc::new(BatteryWindow {
                    ts: 0.0,
                    level: Some(100.0),
                    signal_quality: SignalQuality::Good,
                })))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_isolates_failures_and_recovers() {
        let sink = CollectingSink::new();
        let telemetry = Arc::new(PipelineTelemetry::default());
        let cancel = CancellationToken::new();
        let handle = spawn_pipeline(
            Box::new(FlakyPipeline {
                fail_first: 2,
                ticks: 0,
            }),
            Duration::from_millis(100),
            Arc::clone(&sink) as Arc<dyn ProcessedSink>,
            Arc::clone(&telemetry),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.errors.lock().unwrap().len(), 2);
        assert!(!sink.windows.lock().unwrap().is_empty());
        assert!(!telemetry.degraded.load(Ordering::Relaxed));
        assert_eq!(telemetry.errors.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_marks_degraded_after_three_failures() {
        let sink = CollectingSink::new();
        let telemetry = Arc::new(PipelineTelemetry::default());
        let cancel = CancellationToken::new();
        let handle = spawn_pipeline(
            Box::new(FlakyPipeline {
                fail_first: u32::MAX,
                ticks: 0,
            }),
            Duration::from_millis(100),
            Arc::clone(&sink) as Arc<dyn ProcessedSink>,
            Arc::clone(&telemetry),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(telemetry.degraded.load(Ordering::Relaxed));
        assert!(telemetry.errors.load(Ordering::Relaxed) >= 3);
    }

    #[test]
    fn test_battery_pipeline_reports_latest() {
        let state = Arc::new(BatteryState::default());
        let mut pipeline = BatteryPipeline::new(Arc::clone(&state));

        let ProcessedWindow::Battery(empty) = pipeline.tick().unwrap() else {
            panic!("wrong window kind");
        };
        assert_eq!(empty.signal_quality, SignalQuality::Insufficient);
        assert!(empty.level.is_none());

        state.update(BatterySample {
            ts: 123.0,
            level: 87.0,
        });
        let ProcessedWindow::Battery(window) = pipeline.tick().unwrap() else {
            panic!("wrong window kind");
        };
        assert_eq!(window.level, Some(87.0));
        assert_eq!(window.signal_quality, SignalQuality::Good);
    }
}
