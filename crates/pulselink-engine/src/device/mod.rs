//! # Device Adapter
//!
//! Owns the wireless link to a single band: scanning, connecting,
//! decoding frames into physical-unit batches, and surfacing lifecycle
//! events to the coordinator.
//!
//! ## State machine
//!
//! `idle -> scanning -> idle` and
//! `idle -> connecting -> connected -> disconnecting -> idle`.
//! Unexpected link loss collapses `connected -> idle` and the
//! coordinator decides whether to reconnect.
//!
//! ## Decode task
//!
//! One task per connection consumes the link's frame stream. Decoded
//! batches go three ways: into the sensor ring buffers (when streaming
//! is active), to the raw sink (bus + recorder), and into the battery
//! state cell. Sequence gaps become telemetry events; decode errors are
//! counted and dropped, and a sustained error rate forces an
//! unexpected-disconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dsp::BatteryState;
use crate::error::{EngineError, EngineResult};
use crate::ring::RingProducer;
use crate::sample::{
    AccSample, BatterySample, DeviceDescriptor, EegSample, PpgSample, RawBatch, SensorKind,
    epoch_now,
};

pub mod frame;
pub mod link;
pub mod sim;

#[cfg(feature = "ble")]
pub mod ble;

use frame::{SensorClock, SeqAdvance, decode_frame, frame_samples};
use link::{Link, LinkEvent, LinkSession};

/// Decode-error watchdog window.
const DECODE_WATCHDOG_WINDOW: Duration = Duration::from_secs(5);

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

impl AdapterState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterState::Idle => "idle",
            AdapterState::Scanning => "scanning",
            AdapterState::Connecting => "connecting",
            AdapterState::Connected => "connected",
            AdapterState::Disconnecting => "disconnecting",
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The host asked for it.
    Requested,
    /// The link died on its own (out of range, battery, decode storm).
    Unexpected(String),
}

/// Lifecycle and telemetry events the adapter pushes to the coordinator.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected(DeviceDescriptor),
    Disconnected {
        reason: DisconnectReason,
    },
    BatteryChanged(f32),
    LeadoffChanged {
        ch1: bool,
        ch2: bool,
    },
    /// Frames were lost on the air; no synthetic samples are inserted.
    GapDetected {
        sensor: SensorKind,
        expected: u16,
        observed: u16,
    },
}

/// Where decoded raw batches go besides the ring buffers.
/// Implementations must not block.
pub trait RawSink: Send + Sync {
    fn deliver_raw(&self, batch: &Arc<RawBatch>);
}

/// Ring producers and the battery cell, attached while streaming is
/// active.
pub struct StreamingOutputs {
    pub eeg: RingProducer<EegSample>,
    pub ppg: RingProducer<PpgSample>,
    pub acc: RingProducer<AccSample>,
    pub battery: Arc<BatteryState>,
}

/// Monotonic per-sensor counters the monitoring tick reads.
#[derive(Debug, Default)]
pub struct AdapterCounters {
    pub eeg_samples: AtomicU64,
    pub ppg_samples: AtomicU64,
    pub acc_samples: AtomicU64,
    pub battery_samples: AtomicU64,
    pub decode_errors: AtomicU64,
    pub gaps: AtomicU64,
}

impl AdapterCounters {
    fn add_samples(&self, sensor: SensorKind, n: u64) {
        let counter = match sensor {
            SensorKind::Eeg => &self.eeg_samples,
            SensorKind::Ppg => &self.ppg_samples,
            SensorKind::Acc => &self.acc_samples,
            SensorKind::Battery => &self.battery_samples,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Samples seen so far for `sensor`.
    #[must_use]
    pub fn samples(&self, sensor: SensorKind) -> u64 {
        match sensor {
            SensorKind::Eeg => self.eeg_samples.load(Ordering::Relaxed),
            SensorKind::Ppg => self.ppg_samples.load(Ordering::Relaxed),
            SensorKind::Acc => self.acc_samples.load(Ordering::Relaxed),
            SensorKind::Battery => self.battery_samples.load(Ordering::Relaxed),
        }
    }
}

/// The adapter. Owned by the coordinator task; methods are called from
/// there, so state transitions are naturally serialized.
pub struct DeviceAdapter {
    link: Link,
    state: AdapterState,
    connected_device: Option<DeviceDescriptor>,
    session_stop: Option<CancellationToken>,
    decode_task: Option<JoinHandle<()>>,
    outputs: Arc<Mutex<Option<StreamingOutputs>>>,
    counters: Arc<AdapterCounters>,
    events_tx: mpsc::Sender<AdapterEvent>,
    raw_sink: Arc<dyn RawSink>,
    decode_error_threshold: u32,
}

impl DeviceAdapter {
    #[must_use]
    pub fn new(
        link: Link,
        events_tx: mpsc::Sender<AdapterEvent>,
        raw_sink: Arc<dyn RawSink>,
        decode_error_threshold: u32,
    ) -> Self {
        Self {
            link,
            state: AdapterState::Idle,
            connected_device: None,
            session_stop: None,
            decode_task: None,
            outputs: Arc::new(Mutex::new(None)),
            counters: Arc::new(AdapterCounters::default()),
            events_tx,
            raw_sink,
            decode_error_threshold,
        }
    }

    #[must_use]
    pub fn state(&self) -> AdapterState {
        self.state
    }

    #[must_use]
    pub fn connected_device(&self) -> Option<&DeviceDescriptor> {
        self.connected_device.as_ref()
    }

    #[must_use]
    pub fn counters(&self) -> Arc<AdapterCounters> {
        Arc::clone(&self.counters)
    }

    /// Scan for bands. Only legal from `idle`.
    ///
    /// # Errors
    /// `InvalidTransition` outside `idle`; transport errors from the
    /// backend.
    pub async fn scan(&mut self, duration: Duration) -> EngineResult<Vec<DeviceDescriptor>> {
        if self.state != AdapterState::Idle {
            return Err(EngineError::InvalidTransition {
                from: self.state.as_str().into(),
                to: "scanning".into(),
            });
        }
        self.state = AdapterState::Scanning;
        let result = self.link.scan(duration).await;
        self.state = AdapterState::Idle;
        result
    }

    /// Connect to `address` and start decoding.
    ///
    /// # Errors
    /// `InvalidTransition` when not `idle`; transport errors otherwise.
    pub async fn connect(
        &mut self,
        address: &str,
        timeout: Duration,
    ) -> EngineResult<DeviceDescriptor> {
        if self.state != AdapterState::Idle {
            return Err(EngineError::InvalidTransition {
                from: self.state.as_str().into(),
                to: "connecting".into(),
            });
        }
        self.state = AdapterState::Connecting;
        let session = match self.link.connect(address, timeout).await {
            Ok(session) => session,
            Err(e) => {
                self.state = AdapterState::Idle;
                return Err(e);
            }
        };

        let device = session.device.clone();
        self.session_stop = Some(session.stop_token());
        self.decode_task = Some(tokio::spawn(decode_task(
            session,
            Arc::clone(&self.outputs),
            Arc::clone(&self.counters),
            self.events_tx.clone(),
            Arc::clone(&self.raw_sink),
            self.decode_error_threshold,
        )));
        self.state = AdapterState::Connected;
        self.connected_device = Some(device.clone());
        let _ = self.events_tx.send(AdapterEvent::Connected(device.clone())).await;
        tracing::info!(address = %device.address, name = %device.name, "Device connected");
        Ok(device)
    }

    /// Disconnect. Idempotent; a disconnect while idle is a no-op.
    pub async fn disconnect(&mut self) {
        if self.state != AdapterState::Connected {
            return;
        }
        self.state = AdapterState::Disconnecting;
        if let Some(stop) = self.session_stop.take() {
            stop.cancel();
        }
        self.link.disconnect().await;
        if let Some(task) = self.decode_task.take() {
            // The decode task ends once the link channel drains.
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                tracing::warn!("Decode task did not stop within 2s, abandoning");
            }
        }
        self.connected_device = None;
        self.state = AdapterState::Idle;
        let _ = self
            .events_tx
            .send(AdapterEvent::Disconnected {
                reason: DisconnectReason::Requested,
            })
            .await;
        tracing::info!("Device disconnected");
    }

    /// Reset adapter state after the decode task reported link loss.
    /// Called by the coordinator in response to the event.
    pub fn mark_link_lost(&mut self) {
        self.session_stop = None;
        self.decode_task = None;
        self.connected_device = None;
        self.state = AdapterState::Idle;
    }

    /// Attach ring producers; decoded samples start flowing on the next
    /// frame.
    pub fn attach_outputs(&self, outputs: StreamingOutputs) {
        *self.outputs.lock().expect("outputs lock poisoned") = Some(outputs);
    }

    /// Detach ring producers; the rings can then be dropped safely.
    pub fn detach_outputs(&self) {
        *self.outputs.lock().expect("outputs lock poisoned") = None;
    }
}

/// Per-connection decode loop.
async fn decode_task(
    mut session: LinkSession,
    outputs: Arc<Mutex<Option<StreamingOutputs>>>,
    counters: Arc<AdapterCounters>,
    events_tx: mpsc::Sender<AdapterEvent>,
    raw_sink: Arc<dyn RawSink>,
    decode_error_threshold: u32,
) {
    let mut clocks = [
        SensorClock::new(SensorKind::Eeg.nominal_rate_hz()),
        SensorClock::new(SensorKind::Ppg.nominal_rate_hz()),
        SensorClock::new(SensorKind::Acc.nominal_rate_hz()),
        SensorClock::new(SensorKind::Battery.nominal_rate_hz()),
    ];
    let clock_index = |sensor: SensorKind| match sensor {
        SensorKind::Eeg => 0usize,
        SensorKind::Ppg => 1,
        SensorKind::Acc => 2,
        SensorKind::Battery => 3,
    };

    let mut window_start = tokio::time::Instant::now();
    let mut window_errors: u32 = 0;
    let mut last_leadoff: (bool, bool) = (false, false);
    let mut last_battery: Option<f32> = None;

    while let Some(event) = session.events.recv().await {
        let frame = match event {
            LinkEvent::Frame(frame) => frame,
            LinkEvent::Lost { reason } => {
                tracing::warn!(%reason, "Link lost");
                let _ = events_tx
                    .send(AdapterEvent::Disconnected {
                        reason: DisconnectReason::Unexpected(reason),
                    })
                    .await;
                return;
            }
        };

        let now = epoch_now();
        let clock = &mut clocks[clock_index(frame.sensor)];
        match clock.advance(frame.seq, frame_samples(frame.sensor), now) {
            SeqAdvance::InOrder => {}
            SeqAdvance::Gap {
                expected,
                observed,
                missed,
            } => {
                counters.gaps.fetch_add(u64::from(missed), Ordering::Relaxed);
                tracing::warn!(sensor = %frame.sensor, expected, observed, missed, "Frame gap");
                let _ = events_tx
                    .send(AdapterEvent::GapDetected {
                        sensor: frame.sensor,
                        expected,
                        observed,
                    })
                    .await;
            }
            SeqAdvance::Stale => {
                tracing::debug!(sensor = %frame.sensor, seq = frame.seq, "Dropping stale frame");
                continue;
            }
        }

        let batch = match decode_frame(&frame, clock) {
            Ok(batch) => batch,
            Err(e) => {
                counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                window_errors += 1;
                tracing::debug!(sensor = %frame.sensor, error = %e, "Dropped undecodable frame");
                if window_start.elapsed() > DECODE_WATCHDOG_WINDOW {
                    window_start = tokio::time::Instant::now();
                    window_errors = 1;
                } else if window_errors >= decode_error_threshold {
                    tracing::error!(
                        errors = window_errors,
                        "Decode error rate exceeded, dropping the link"
                    );
                    session.stop_token().cancel();
                    let _ = events_tx
                        .send(AdapterEvent::Disconnected {
                            reason: DisconnectReason::Unexpected(
                                "sustained decode errors".into(),
                            ),
                        })
                        .await;
                    return;
                }
                continue;
            }
        };

        counters.add_samples(batch.sensor(), batch.len() as u64);
        dispatch_batch(&batch, &outputs, &events_tx, &mut last_leadoff, &mut last_battery).await;
        raw_sink.deliver_raw(&Arc::new(batch));
    }
}

/// Route a decoded batch into the rings, the battery cell, and change
/// detection.
async fn dispatch_batch(
    batch: &RawBatch,
    outputs: &Arc<Mutex<Option<StreamingOutputs>>>,
    events_tx: &mpsc::Sender<AdapterEvent>,
    last_leadoff: &mut (bool, bool),
    last_battery: &mut Option<f32>,
) {
    // Change events detected regardless of streaming state.
    let mut leadoff_event = None;
    let mut battery_event = None;
    match batch {
        RawBatch::Eeg(samples) => {
            if let Some(last) = samples.last() {
                let flags = (last.ch1_leadoff, last.ch2_leadoff);
                if flags != *last_leadoff {
                    *last_leadoff = flags;
                    leadoff_event = Some(AdapterEvent::LeadoffChanged {
                        ch1: flags.0,
                        ch2: flags.1,
                    });
                }
            }
        }
        RawBatch::Battery(samples) => {
            if let Some(last) = samples.last() {
                let changed = last_battery.is_none_or(|prev| (prev - last.level).abs() >= 1.0);
                if changed {
                    *last_battery = Some(last.level);
                    battery_event = Some(AdapterEvent::BatteryChanged(last.level));
                }
            }
        }
        _ => {}
    }

    {
        let guard = outputs.lock().expect("outputs lock poisoned");
        if let Some(outputs) = guard.as_ref() {
            match batch {
                RawBatch::Eeg(samples) => outputs.eeg.push_all(samples),
                RawBatch::Ppg(samples) => outputs.ppg.push_all(samples),
                RawBatch::Acc(samples) => outputs.acc.push_all(samples),
                RawBatch::Battery(samples) => {
                    for sample in samples {
                        outputs.battery.update(BatterySample {
                            ts: sample.ts,
                            level: sample.level,
                        });
                    }
                }
            }
        }
    }

    if let Some(event) = leadoff_event {
        let _ = events_tx.send(event).await;
    }
    if let Some(event) = battery_event {
        let _ = events_tx.send(event).await;
    }
}
