//! # Engine Coordinator
//!
//! Composes the adapter, pipelines, bus, and recorder, and owns the
//! engine state machine. Every control-plane request becomes a typed
//! [`EngineCommand`] processed by one task, so transitions serialize
//! naturally and effects become visible in order. The same task
//! consumes adapter lifecycle events, recorder faults, and drives the
//! 1 Hz monitoring tick.
//!
//! ## Transitions (selected)
//!
//! - `start_streaming` requires a connected device: builds the ring
//!   buffers, attaches them to the adapter, and spawns the four
//!   pipeline tasks.
//! - `start_recording` requires active streaming.
//! - Unexpected device loss tears streaming down, seals any active
//!   recording as `failed`, and (by policy) retries the last registered
//!   device with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Channel, Envelope, WsBus};
use crate::config::EngineConfig;
use crate::device::{
    AdapterEvent, AdapterState, DeviceAdapter, DisconnectReason, RawSink, StreamingOutputs,
};
use crate::device::link::Link;
use crate::dsp::{
    AccPipeline, BatteryPipeline, BatteryState, EegPipeline, PipelineTelemetry, PpgPipeline,
    ProcessedSink, ProcessedWindow, spawn_pipeline,
};
use crate::error::{EngineError, EngineResult};
use crate::recorder::store::{SessionRow, SessionStore};
use crate::recorder::{SessionRecorder, SessionSummary, StartRecording};
use crate::ring::{self, RingStats};
use crate::sample::{DeviceDescriptor, RawBatch, SensorKind, epoch_now};

pub mod status;

pub use status::{EngineState, EngineStatus, MonitoringMetrics, PipelineStatus};

/// Commands the coordinator processes, with their reply channels.
#[derive(Debug)]
pub enum EngineCommand {
    Scan {
        duration: Option<Duration>,
        reply: oneshot::Sender<EngineResult<Vec<DeviceDescriptor>>>,
    },
    Connect {
        address: String,
        timeout: Option<Duration>,
        auto_reconnect: Option<bool>,
        reply: oneshot::Sender<EngineResult<DeviceDescriptor>>,
    },
    Disconnect {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    StartStreaming {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    StopStreaming {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    StartRecording {
        request: StartRecording,
        reply: oneshot::Sender<EngineResult<SessionRow>>,
    },
    StopRecording {
        session_id: Option<String>,
        reply: oneshot::Sender<EngineResult<SessionSummary>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Cheap handle for submitting commands to the coordinator.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> EngineCommand,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::InvalidTransition {
                from: "stopping".into(),
                to: "command".into(),
            })?;
        rx.await.map_err(|_| EngineError::InvalidTransition {
            from: "stopping".into(),
            to: "command".into(),
        })?
    }

    /// Scan for devices.
    ///
    /// # Errors
    /// Transport and transition errors from the adapter.
    pub async fn scan(&self, duration: Option<Duration>) -> EngineResult<Vec<DeviceDescriptor>> {
        self.submit(|reply| EngineCommand::Scan { duration, reply }).await
    }

    /// Connect to a device.
    ///
    /// # Errors
    /// Transport and transition errors from the adapter.
    pub async fn connect(
        &self,
        address: String,
        timeout: Option<Duration>,
        auto_reconnect: Option<bool>,
    ) -> EngineResult<DeviceDescriptor> {
        self.submit(|reply| EngineCommand::Connect {
            address,
            timeout,
            auto_reconnect,
            reply,
        })
        .await
    }

    /// Disconnect. No-op when already disconnected.
    ///
    /// # Errors
    /// Only coordinator-shutdown errors.
    pub async fn disconnect(&self) -> EngineResult<()> {
        self.submit(|reply| EngineCommand::Disconnect { reply }).await
    }

    /// Start the streaming pipelines.
    ///
    /// # Errors
    /// `NotConnected` without a device.
    pub async fn start_streaming(&self) -> EngineResult<()> {
        self.submit(|reply| EngineCommand::StartStreaming { reply }).await
    }

    /// Stop the streaming pipelines. Idempotent.
    ///
    /// # Errors
    /// Only coordinator-shutdown errors.
    pub async fn stop_streaming(&self) -> EngineResult<()> {
        self.submit(|reply| EngineCommand::StopStreaming { reply }).await
    }

    /// Start a recording session.
    ///
    /// # Errors
    /// `NotStreaming`, `AlreadyRecording`, `InsufficientSpace`, or
    /// storage failures.
    pub async fn start_recording(&self, request: StartRecording) -> EngineResult<SessionRow> {
        self.submit(|reply| EngineCommand::StartRecording { request, reply })
            .await
    }

    /// Stop a recording session (idempotent per session id).
    ///
    /// # Errors
    /// `SessionNotFound` for unknown ids.
    pub async fn stop_recording(&self, session_id: Option<String>) -> EngineResult<SessionSummary> {
        self.submit(|reply| EngineCommand::StopRecording { session_id, reply })
            .await
    }

    /// Current engine status snapshot.
    ///
    /// # Errors
    /// Only coordinator-shutdown errors.
    pub async fn status(&self) -> EngineResult<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Status { reply })
            .await
            .map_err(|_| EngineError::InvalidTransition {
                from: "stopping".into(),
                to: "status".into(),
            })?;
        rx.await.map_err(|_| EngineError::InvalidTransition {
            from: "stopping".into(),
            to: "status".into(),
        })
    }
}

/// Fan-out glue: pipelines and the adapter deliver here; the sink
/// forwards to the bus and, when armed, the recorder.
pub struct EngineSink {
    bus: WsBus,
    recorder: Arc<SessionRecorder>,
}

impl ProcessedSink for EngineSink {
    fn deliver(&self, window: &ProcessedWindow) {
        let channel = Channel::processed_for(window.sensor());
        if let Ok(data) = window.to_json() {
            self.bus.publish(channel, &Envelope::processed(channel, data));
        }
        self.recorder.append_processed(window);
    }

    fn pipeline_error(&self, sensor: SensorKind, message: &str) {
        self.bus.publish(
            Channel::Event,
            &Envelope::event(
                Channel::Event,
                serde_json::json!({
                    "event": "pipeline_error",
                    "sensor": sensor.as_str(),
                    "message": message,
                }),
            ),
        );
    }
}

impl RawSink for EngineSink {
    fn deliver_raw(&self, batch: &Arc<RawBatch>) {
        let channel = Channel::raw_for(batch.sensor());
        if let Ok(data) = serde_json::to_value(batch.as_ref()) {
            self.bus.publish(channel, &Envelope::raw(channel, data));
        }
        self.recorder.append_raw(batch);
    }
}

/// Everything that exists only while streaming is active.
struct StreamingState {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    ring_stats: Vec<Arc<dyn RingStats>>,
    telemetry: HashMap<SensorKind, Arc<PipelineTelemetry>>,
}

/// Sample-rate observation state for the monitoring tick.
#[derive(Default)]
struct RateObservations {
    last_counts: HashMap<SensorKind, u64>,
    last_bus_dropped: u64,
    last_published: u64,
    last_ring_dropped: u64,
}

/// The coordinator task's state. Built by [`Engine::spawn`].
pub struct Engine {
    config: EngineConfig,
    adapter: DeviceAdapter,
    recorder: Arc<SessionRecorder>,
    store: Arc<SessionStore>,
    bus: WsBus,
    sink: Arc<EngineSink>,
    state: EngineState,
    streaming: Option<StreamingState>,
    battery: Arc<BatteryState>,
    last_battery_percent: Option<f32>,
    auto_reconnect: bool,
    started_at: std::time::Instant,
    commands_rx: mpsc::Receiver<EngineCommand>,
    adapter_events_rx: mpsc::Receiver<AdapterEvent>,
    recorder_faults_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    rates: RateObservations,
    system: sysinfo::System,
}

impl Engine {
    /// Build the component graph and start the coordinator task.
    /// Returns the command handle, the recorder (shared with the HTTP
    /// layer for session CRUD), and the coordinator task handle.
    ///
    /// # Errors
    /// Store failures during crash recovery.
    pub fn spawn(
        config: EngineConfig,
        link: Link,
        store: Arc<SessionStore>,
        bus: WsBus,
        cancel: CancellationToken,
    ) -> EngineResult<(EngineHandle, Arc<SessionRecorder>, JoinHandle<()>)> {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (adapter_events_tx, adapter_events_rx) = mpsc::channel(64);
        let (recorder_faults_tx, recorder_faults_rx) = mpsc::channel(8);

        let recorder = Arc::new(SessionRecorder::new(
            Arc::clone(&store),
            &config,
            recorder_faults_tx,
        ));
        recorder.recover()?;

        let sink = Arc::new(EngineSink {
            bus: bus.clone(),
            recorder: Arc::clone(&recorder),
        });
        let adapter = DeviceAdapter::new(
            link,
            adapter_events_tx,
            Arc::clone(&sink) as Arc<dyn RawSink>,
            config.decode_error_threshold,
        );

        let auto_reconnect = config.auto_reconnect;
        let recorder_for_api = Arc::clone(&recorder);
        let engine = Engine {
            config,
            adapter,
            recorder,
            store,
            bus: bus.clone(),
            sink,
            state: EngineState::Initializing,
            streaming: None,
            battery: Arc::new(BatteryState::default()),
            last_battery_percent: None,
            auto_reconnect,
            started_at: std::time::Instant::now(),
            commands_rx,
            adapter_events_rx,
            recorder_faults_rx,
            cancel,
            rates: RateObservations::default(),
            system: sysinfo::System::new(),
        };

        let handle = EngineHandle { tx: commands_tx };
        bus.set_engine(handle.clone());
        let task = tokio::spawn(engine.run());
        Ok((handle, recorder_for_api, task))
    }

    async fn run(mut self) {
        self.state = EngineState::Running;
        tracing::info!("Engine running");
        let mut monitor = tokio::time::interval(Duration::from_secs(1));
        monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                Some(event) = self.adapter_events_rx.recv() => {
                    self.handle_adapter_event(event).await;
                }
                Some(reason) = self.recorder_faults_rx.recv() => {
                    self.handle_recorder_fault(&reason).await;
                }
                _ = monitor.tick() => {
                    self.monitor_tick();
                }
            }
        }
        tracing::info!("Engine stopped");
    }

    async fn shutdown(&mut self) {
        self.state = EngineState::Stopping;
        tracing::info!("Engine shutting down");
        // Pipelines first so their final windows land in the recorder,
        // then the recorder drains, then the adapter.
        self.stop_streaming_internal().await;
        if self.recorder.active_session().is_some() {
            let _ = self.recorder.stop(None).await.map_err(|e| {
                tracing::warn!(error = %e, "Recorder did not seal cleanly");
            });
        }
        self.adapter.disconnect().await;
        self.state = EngineState::Stopped;
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Scan { duration, reply } => {
                let duration = duration
                    .unwrap_or_else(|| Duration::from_secs(self.config.scan_default_duration_s));
                let _ = reply.send(self.adapter.scan(duration).await);
            }
            EngineCommand::Connect {
                address,
                timeout,
                auto_reconnect,
                reply,
            } => {
                if let Some(auto) = auto_reconnect {
                    self.auto_reconnect = auto;
                }
                let result = self.connect_internal(&address, timeout).await;
                let _ = reply.send(result);
            }
            EngineCommand::Disconnect { reply } => {
                // An orderly disconnect seals any recording first.
                if self.recorder.active_session().is_some() {
                    let _ = self.recorder.stop(None).await;
                    self.publish_event(serde_json::json!({ "event": "recording_stopped" }));
                }
                self.stop_streaming_internal().await;
                self.adapter.disconnect().await;
                self.publish_device_info("disconnected", None);
                let _ = reply.send(Ok(()));
            }
            EngineCommand::StartStreaming { reply } => {
                let _ = reply.send(self.start_streaming_internal());
            }
            EngineCommand::StopStreaming { reply } => {
                if self.recorder.active_session().is_some() {
                    let _ = self.recorder.stop(None).await;
                    self.publish_event(serde_json::json!({ "event": "recording_stopped" }));
                }
                self.stop_streaming_internal().await;
                let _ = reply.send(Ok(()));
            }
            EngineCommand::StartRecording { request, reply } => {
                let result = self.start_recording_internal(request).await;
                let _ = reply.send(result);
            }
            EngineCommand::StopRecording { session_id, reply } => {
                let result = self.recorder.stop(session_id.as_deref()).await;
                if result.is_ok() {
                    self.publish_event(serde_json::json!({ "event": "recording_stopped" }));
                }
                let _ = reply.send(result);
            }
            EngineCommand::Status { reply } => {
                let _ = reply.send(self.build_status());
            }
        }
    }

    async fn connect_internal(
        &mut self,
        address: &str,
        timeout: Option<Duration>,
    ) -> EngineResult<DeviceDescriptor> {
        if self.adapter.state() == AdapterState::Connected {
            return Err(EngineError::InvalidTransition {
                from: "connected".into(),
                to: "connecting".into(),
            });
        }
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.config.connect_timeout_s));
        let device = self.adapter.connect(address, timeout).await?;
        self.store.register_device(&device)?;
        self.publish_device_info("connected", None);
        Ok(device)
    }

    fn start_streaming_internal(&mut self) -> EngineResult<()> {
        if self.streaming.is_some() {
            return Ok(());
        }
        if self.adapter.state() != AdapterState::Connected {
            return Err(EngineError::NotConnected);
        }

        let (eeg_tx, eeg_rx) = ring::ring(self.config.ring_capacity_eeg);
        let (ppg_tx, ppg_rx) = ring::ring(self.config.ring_capacity_ppg);
        let (acc_tx, acc_rx) = ring::ring(self.config.ring_capacity_acc);
        let ring_stats = vec![eeg_tx.stats(), ppg_tx.stats(), acc_tx.stats()];

        self.battery = Arc::new(BatteryState::default());
        self.adapter.attach_outputs(StreamingOutputs {
            eeg: eeg_tx,
            ppg: ppg_tx,
            acc: acc_tx,
            battery: Arc::clone(&self.battery),
        });

        let cancel = self.cancel.child_token();
        let mut telemetry = HashMap::new();
        let mut tasks = Vec::new();
        let pipelines: Vec<(Box<dyn crate::dsp::Pipeline>, u64)> = vec![
            (Box::new(EegPipeline::new(eeg_rx)), self.config.tick_ms_eeg),
            (Box::new(PpgPipeline::new(ppg_rx)), self.config.tick_ms_ppg),
            (Box::new(AccPipeline::new(acc_rx)), self.config.tick_ms_acc),
            (
                Box::new(BatteryPipeline::new(Arc::clone(&self.battery))),
                self.config.tick_ms_bat,
            ),
        ];
        for (pipeline, tick_ms) in pipelines {
            let shared = Arc::new(PipelineTelemetry::default());
            telemetry.insert(pipeline.sensor(), Arc::clone(&shared));
            tasks.push(spawn_pipeline(
                pipeline,
                Duration::from_millis(tick_ms),
                Arc::clone(&self.sink) as Arc<dyn ProcessedSink>,
                shared,
                cancel.clone(),
            ));
        }

        self.streaming = Some(StreamingState {
            cancel,
            tasks,
            ring_stats,
            telemetry,
        });
        self.publish_event(serde_json::json!({ "event": "streaming_started" }));
        tracing::info!("Streaming started");
        Ok(())
    }

    async fn stop_streaming_internal(&mut self) {
        let Some(streaming) = self.streaming.take() else {
            return;
        };
        self.adapter.detach_outputs();
        streaming.cancel.cancel();
        for task in streaming.tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                tracing::warn!("Pipeline did not stop within 2s, abandoning");
            }
        }
        self.publish_event(serde_json::json!({ "event": "streaming_stopped" }));
        tracing::info!("Streaming stopped");
    }

    async fn start_recording_internal(
        &mut self,
        request: StartRecording,
    ) -> EngineResult<SessionRow> {
        if self.streaming.is_none() {
            return Err(EngineError::NotStreaming);
        }
        let device = self
            .adapter
            .connected_device()
            .cloned()
            .ok_or(EngineError::NotConnected)?;
        let row = self
            .recorder
            .start(request, &device, self.last_battery_percent)
            .await?;
        self.publish_event(serde_json::json!({
            "event": "recording_started",
            "session_id": row.id,
            "session_name": row.name,
        }));
        Ok(row)
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Connected(device) => {
                // device_info already went out from connect_internal.
                tracing::debug!(address = %device.address, "Adapter reports connected");
            }
            AdapterEvent::Disconnected { reason } => match reason {
                DisconnectReason::Requested => {}
                DisconnectReason::Unexpected(reason) => {
                    self.handle_unexpected_disconnect(&reason).await;
                }
            },
            AdapterEvent::BatteryChanged(level) => {
                self.last_battery_percent = Some(level);
                self.publish_event(serde_json::json!({
                    "event": "battery_changed",
                    "level": level,
                }));
            }
            AdapterEvent::LeadoffChanged { ch1, ch2 } => {
                self.publish_event(serde_json::json!({
                    "event": "leadoff_changed",
                    "ch1": ch1,
                    "ch2": ch2,
                }));
            }
            AdapterEvent::GapDetected {
                sensor,
                expected,
                observed,
            } => {
                self.publish_event(serde_json::json!({
                    "event": "gap_detected",
                    "sensor": sensor.as_str(),
                    "expected": expected,
                    "observed": observed,
                }));
            }
        }
    }

    async fn handle_unexpected_disconnect(&mut self, reason: &str) {
        tracing::warn!(reason, "Unexpected device disconnect");
        self.adapter.mark_link_lost();

        if self.recorder.active_session().is_some() {
            if let Some(summary) = self.recorder.fail_active(reason).await {
                self.publish_event(serde_json::json!({
                    "event": "recording_error",
                    "session_id": summary.session_id,
                    "message": format!("session sealed as failed: {reason}"),
                }));
            }
        }
        self.stop_streaming_internal().await;
        self.publish_device_info("disconnected", Some("unexpected_disconnect"));

        if self.auto_reconnect {
            self.try_reconnect().await;
        }
    }

    /// Exponential-backoff retry of the last registered device.
    async fn try_reconnect(&mut self) {
        let Ok(Some(device)) = self.store.last_registered_device() else {
            return;
        };
        let policy = self.config.reconnect.clone();
        let mut delay = Duration::from_secs(policy.base_delay_s.max(1));
        let max_delay = Duration::from_secs(policy.max_delay_s.max(1));
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if policy.max_attempts != 0 && attempt > policy.max_attempts {
                tracing::warn!(attempts = attempt - 1, "Reconnect attempts exhausted");
                self.publish_event(serde_json::json!({
                    "event": "reconnect_failed",
                    "address": device.address,
                    "attempts": attempt - 1,
                }));
                return;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            tracing::info!(attempt, address = %device.address, "Reconnecting");
            self.publish_event(serde_json::json!({
                "event": "reconnecting",
                "address": device.address,
                "attempt": attempt,
            }));
            match self.connect_internal(&device.address, None).await {
                Ok(_) => {
                    tracing::info!(attempt, "Reconnected");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    delay = (delay * 2).min(max_delay);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect aborted");
                    return;
                }
            }
        }
    }

    async fn handle_recorder_fault(&mut self, reason: &str) {
        tracing::error!(reason, "Recorder fault");
        if let Some(summary) = self.recorder.fail_active(reason).await {
            self.publish_event(serde_json::json!({
                "event": "recording_error",
                "session_id": summary.session_id,
                "message": reason,
            }));
        }
    }

    fn publish_event(&self, data: serde_json::Value) {
        self.bus
            .publish(Channel::Event, &Envelope::event(Channel::Event, data));
    }

    fn publish_device_info(&self, state: &str, reason: Option<&str>) {
        let mut data = serde_json::json!({
            "state": state,
            "device": self.adapter.connected_device(),
        });
        if let Some(reason) = reason {
            data["reason"] = serde_json::Value::String(reason.to_string());
        }
        self.bus.publish(
            Channel::DeviceInfo,
            &Envelope::event(Channel::DeviceInfo, data),
        );
    }

    fn build_status(&self) -> EngineStatus {
        let pipelines = self
            .streaming
            .as_ref()
            .map(|s| {
                s.telemetry
                    .iter()
                    .map(|(sensor, t)| {
                        (
                            sensor.as_str().to_string(),
                            PipelineStatus {
                                ticks: t.ticks.load(std::sync::atomic::Ordering::Relaxed),
                                errors: t.errors.load(std::sync::atomic::Ordering::Relaxed),
                                degraded: t.degraded.load(std::sync::atomic::Ordering::Relaxed),
                                last_sqi: t.last_sqi(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        EngineStatus {
            state: self.state,
            device_state: self.adapter.state(),
            device: self.adapter.connected_device().cloned(),
            battery_percent: self.last_battery_percent,
            streaming: self.streaming.is_some(),
            recording_session: self.recorder.active_session(),
            client_count: self.bus.client_count(),
            uptime_s: self.started_at.elapsed().as_secs_f64(),
            pipelines,
        }
    }

    fn monitor_tick(&mut self) {
        // Degradation is pipeline-driven while running.
        if self.state == EngineState::Running || self.state == EngineState::Degraded {
            let any_degraded = self.streaming.as_ref().is_some_and(|s| {
                s.telemetry
                    .values()
                    .any(|t| t.degraded.load(std::sync::atomic::Ordering::Relaxed))
            });
            self.state = if any_degraded {
                EngineState::Degraded
            } else {
                EngineState::Running
            };
        }

        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        let (cpu_percent, ram_mb) = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                self.system.refresh_processes(
                    sysinfo::ProcessesToUpdate::Some(&[pid]),
                    true,
                );
                self.system
                    .process(pid)
                    .map(|p| (p.cpu_usage(), p.memory() / (1024 * 1024)))
            })
            .unwrap_or((0.0, 0));

        // Observed per-sensor sample rates over the last second.
        let counters = self.adapter.counters();
        let mut sample_rates = HashMap::new();
        for sensor in SensorKind::all() {
            let total = counters.samples(sensor);
            let last = self.rates.last_counts.insert(sensor, total).unwrap_or(total);
            #[allow(clippy::cast_precision_loss)]
            sample_rates.insert(sensor.as_str().to_string(), (total - last) as f64);
        }

        let ring_dropped: u64 = self
            .streaming
            .as_ref()
            .map(|s| s.ring_stats.iter().map(|r| r.dropped()).sum())
            .unwrap_or(0);
        let bus_dropped = self.bus.dropped();
        let published = self.bus.published();

        // Health: signal quality blended with loss rates.
        let sqi = self
            .streaming
            .as_ref()
            .map_or(1.0, |s| {
                let values: Vec<f32> = s
                    .telemetry
                    .iter()
                    .filter(|(sensor, _)| **sensor != SensorKind::Battery)
                    .map(|(_, t)| t.last_sqi())
                    .collect();
                if values.is_empty() {
                    1.0
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    let n = values.len() as f32;
                    values.iter().sum::<f32>() / n
                }
            });
        // Ring counters restart with each streaming session.
        let drops_delta = ring_dropped.saturating_sub(self.rates.last_ring_dropped)
            + bus_dropped.saturating_sub(self.rates.last_bus_dropped);
        let published_delta = published.saturating_sub(self.rates.last_published);
        self.rates.last_ring_dropped = ring_dropped;
        self.rates.last_bus_dropped = bus_dropped;
        self.rates.last_published = published;
        #[allow(clippy::cast_precision_loss)]
        let drop_rate = if drops_delta == 0 {
            0.0
        } else {
            drops_delta as f32 / (drops_delta + published_delta).max(1) as f32
        };
        let health_score = (0.6 * sqi + 0.4 * (1.0 - drop_rate)).clamp(0.0, 1.0);

        let metrics = MonitoringMetrics {
            ts: epoch_now(),
            cpu_percent,
            ram_mb,
            disk_free_mb: None,
            sample_rates,
            client_count: self.bus.client_count(),
            ring_dropped,
            bus_dropped,
            health_score,
        };
        if let Ok(data) = serde_json::to_value(&metrics) {
            self.bus.publish(
                Channel::MonitoringMetrics,
                &Envelope::event(Channel::MonitoringMetrics, data),
            );
        }
    }
}
