//! Engine status snapshot and monitoring payloads.

use std::collections::HashMap;

use serde::Serialize;

use crate::device::AdapterState;
use crate::sample::DeviceDescriptor;

/// Top-level engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Initializing,
    Running,
    Degraded,
    Stopping,
}

/// Per-pipeline health as seen by the monitoring tick.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub ticks: u64,
    pub errors: u64,
    pub degraded: bool,
    /// Mean SQI of the last emitted window, 0..1.
    pub last_sqi: f32,
}

/// Snapshot answered to `health_check` commands and `GET /stream/status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub device_state: AdapterState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f32>,
    pub streaming: bool,
    /// Active recording session id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_session: Option<String>,
    pub client_count: usize,
    pub uptime_s: f64,
    /// Present while streaming.
    pub pipelines: HashMap<String, PipelineStatus>,
}

/// The 1 Hz `monitoring_metrics` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringMetrics {
    pub ts: f64,
    pub cpu_percent: f32,
    pub ram_mb: u64,
    pub disk_free_mb: Option<u64>,
    /// Observed samples per second over the last monitoring interval.
    pub sample_rates: HashMap<String, f64>,
    pub client_count: usize,
    /// Ring-buffer overwrites since streaming started.
    pub ring_dropped: u64,
    /// Bus frames dropped by the per-client overflow policy.
    pub bus_dropped: u64,
    /// 0..1 blend of signal quality and loss rates.
    pub health_score: f32,
}
