//! # Session Recorder
//!
//! Persists raw and processed streams during a recording. One dedicated
//! writer task per stream drains a bounded queue into a
//! newline-delimited JSON file, so producers never block on disk. The
//! session directory layout:
//!
//! ```text
//! session_YYYYMMDD_HHMMSS/
//!   meta.json
//!   <device>_eeg_raw.json
//!   <device>_eeg_processed.json
//!   <device>_ppg_raw.json
//!   <device>_ppg_processed.json
//!   <device>_acc_raw.json
//!   <device>_acc_processed.json
//!   <device>_bat.json
//! ```
//!
//! Queue overflow fails the running session: it is sealed as `failed`,
//! files are left in place, and a fault is pushed to the coordinator.
//! `stop` on an already-sealed session returns the same summary again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::dsp::ProcessedWindow;
use crate::error::{EngineError, EngineResult};
use crate::sample::{
    ACC_RATE_HZ, DeviceDescriptor, EEG_RATE_HZ, PPG_RATE_HZ, RawBatch, SensorKind, epoch_now,
};
use crate::recorder::store::{FileRow, SessionRow, SessionStatus, SessionStore};

pub mod export;
pub mod store;

/// What kind of data a stream file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Raw,
    Processed,
    Metadata,
    Battery,
}

impl DataType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Raw => "raw",
            DataType::Processed => "processed",
            DataType::Metadata => "metadata",
            DataType::Battery => "battery",
        }
    }
}

/// Start-recording parameters from the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRecording {
    pub session_name: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    /// Sensors to record; empty means all.
    #[serde(default)]
    pub sensors: Vec<SensorKind>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Summary returned by `stop` and by repeat stops on sealed sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub session_name: String,
    pub status: SessionStatus,
    pub duration_s: f64,
    pub file_count: usize,
    pub total_bytes: u64,
    /// Per-sensor raw sample counts.
    pub sample_counts: HashMap<String, u64>,
}

/// `meta.json`: the bit-exact compatibility surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub session_id: String,
    pub session_name: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub duration_s: Option<f64>,
    pub device: DeviceMeta,
    pub sensors: Vec<String>,
    pub sampling_rates: SamplingRates,
    pub files: Vec<MetaFileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<QualityMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceMeta {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[allow(non_snake_case)]
pub struct SamplingRates {
    pub EEG: f64,
    pub PPG: f64,
    pub ACC: f64,
}

impl Default for SamplingRates {
    fn default() -> Self {
        Self {
            EEG: EEG_RATE_HZ,
            PPG: PPG_RATE_HZ,
            ACC: ACC_RATE_HZ,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaFileEntry {
    pub filename: String,
    pub sensor: String,
    pub data_type: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<u64>,
}

/// Mean SQI per sensor over the recording, written at stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eeg_mean_sqi: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppg_mean_sqi: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acc_mean_sqi: Option<f32>,
}

#[derive(Debug, Default)]
struct WriterCounters {
    records: AtomicU64,
    samples: AtomicU64,
}

struct StreamWriter {
    filename: String,
    sensor: SensorKind,
    data_type: DataType,
    tx: Option<mpsc::Sender<String>>,
    counters: Arc<WriterCounters>,
    task: JoinHandle<std::io::Result<()>>,
}

struct SqiAccumulator {
    sum: f64,
    count: u64,
}

struct ActiveRecording {
    session_id: String,
    session_name: String,
    root: PathBuf,
    device: DeviceDescriptor,
    battery_level: Option<f32>,
    sensors: Vec<SensorKind>,
    start_time: f64,
    notes: Option<String>,
    tags: Vec<String>,
    writers: Vec<StreamWriter>,
    sqi: HashMap<SensorKind, SqiAccumulator>,
    failed: bool,
}

/// The recorder. Appends are synchronous and never block; lifecycle
/// calls are async and serialized by the coordinator.
pub struct SessionRecorder {
    store: Arc<SessionStore>,
    data_dir: PathBuf,
    queue_len: usize,
    min_free_disk_mb: u64,
    active: Mutex<Option<ActiveRecording>>,
    /// Faults pushed to the coordinator (queue overflow, write errors).
    fault_tx: mpsc::Sender<String>,
}

impl SessionRecorder {
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        config: &EngineConfig,
        fault_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            store,
            data_dir: config.data_dir.clone(),
            queue_len: config.recorder_queue_len,
            min_free_disk_mb: config.min_free_disk_mb,
            active: Mutex::new(None),
            fault_tx,
        }
    }

    /// Crash recovery: seal any session the store still thinks is
    /// recording. Returns how many were sealed.
    ///
    /// # Errors
    /// Propagates store failures.
    pub fn recover(&self) -> EngineResult<usize> {
        let sealed = self.store.fail_stale_recordings(epoch_now())?;
        if sealed > 0 {
            tracing::warn!(sealed, "Sealed stale recordings as failed after restart");
        }
        Ok(sealed)
    }

    /// The active session id, if a recording is running.
    #[must_use]
    pub fn active_session(&self) -> Option<String> {
        self.active
            .lock()
            .expect("recorder lock poisoned")
            .as_ref()
            .map(|a| a.session_id.clone())
    }

    /// Control-plane status snapshot.
    #[must_use]
    pub fn status(&self) -> serde_json::Value {
        let guard = self.active.lock().expect("recorder lock poisoned");
        match guard.as_ref() {
            Some(active) => serde_json::json!({
                "is_recording": true,
                "session_id": active.session_id,
                "session_name": active.session_name,
                "start_time": active.start_time,
                "elapsed_s": epoch_now() - active.start_time,
            }),
            None => serde_json::json!({ "is_recording": false }),
        }
    }

    /// Begin a recording session.
    ///
    /// # Errors
    /// `AlreadyRecording`, `InsufficientSpace`, or I/O and store
    /// failures. The caller (coordinator) has already verified that
    /// streaming is active.
    pub async fn start(
        &self,
        request: StartRecording,
        device: &DeviceDescriptor,
        battery_level: Option<f32>,
    ) -> EngineResult<SessionRow> {
        if self.active.lock().expect("recorder lock poisoned").is_some() {
            return Err(EngineError::AlreadyRecording);
        }

        if let Some(available_mb) = free_disk_mb(&self.data_dir) {
            if available_mb < self.min_free_disk_mb {
                return Err(EngineError::InsufficientSpace {
                    available_mb,
                    required_mb: self.min_free_disk_mb,
                });
            }
        }

        let sensors = if request.sensors.is_empty() {
            SensorKind::all().to_vec()
        } else {
            request.sensors.clone()
        };

        let start_time = epoch_now();
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir_name = format!(
            "session_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let root = self.data_dir.join(&dir_name);
        tokio::fs::create_dir_all(&root).await?;

        let device_tag = sanitize_device_id(&device.address);
        let mut writers = Vec::new();
        for &sensor in &sensors {
            for data_type in stream_kinds(sensor) {
                let filename = stream_filename(&device_tag, sensor, data_type);
                writers.push(self.spawn_writer(&root, filename, sensor, data_type).await?);
            }
        }

        let row = SessionRow {
            id: session_id.clone(),
            name: request.session_name.clone(),
            start_time,
            end_time: None,
            status: SessionStatus::Recording,
            device_id: device.address.clone(),
            root_dir: root.clone(),
            participant_id: request.participant_id.clone(),
            condition: request.condition.clone(),
            notes: request.notes.clone(),
            tags: request.tags.clone(),
        };
        self.store.insert_session(&row)?;

        let active = ActiveRecording {
            session_id: session_id.clone(),
            session_name: request.session_name,
            root: root.clone(),
            device: device.clone(),
            battery_level,
            sensors,
            start_time,
            notes: request.notes,
            tags: request.tags,
            writers,
            sqi: HashMap::new(),
            failed: false,
        };
        let meta = build_meta(&active, None, Vec::new(), None);
        tokio::fs::write(root.join("meta.json"), serde_json::to_vec_pretty(&meta)?).await?;

        *self.active.lock().expect("recorder lock poisoned") = Some(active);
        tracing::info!(session_id = %session_id, dir = %root.display(), "Recording started");
        Ok(row)
    }

    async fn spawn_writer(
        &self,
        root: &Path,
        filename: String,
        sensor: SensorKind,
        data_type: DataType,
    ) -> EngineResult<StreamWriter> {
        let path = root.join(&filename);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (tx, mut rx) = mpsc::channel::<String>(self.queue_len);
        let counters = Arc::new(WriterCounters::default());
        let task = tokio::spawn(async move {
            let mut writer = tokio::io::BufWriter::new(file);
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.flush().await?;
            Ok(())
        });
        Ok(StreamWriter {
            filename,
            sensor,
            data_type,
            tx: Some(tx),
            counters,
            task,
        })
    }

    /// Append one raw batch. Never blocks; overflow fails the session.
    pub fn append_raw(&self, batch: &Arc<RawBatch>) {
        let data_type = if batch.sensor() == SensorKind::Battery {
            DataType::Battery
        } else {
            DataType::Raw
        };
        self.append_line(batch.sensor(), data_type, || {
            serde_json::to_string(batch.as_ref()).ok()
        }, batch.len() as u64);
    }

    /// Append one processed window and fold its SQI into the session
    /// quality summary.
    pub fn append_processed(&self, window: &ProcessedWindow) {
        let sensor = window.sensor();
        if sensor == SensorKind::Battery {
            // Battery has a single raw stream file.
            return;
        }
        {
            let mut guard = self.active.lock().expect("recorder lock poisoned");
            if let Some(active) = guard.as_mut() {
                let accumulator = active.sqi.entry(sensor).or_insert(SqiAccumulator {
                    sum: 0.0,
                    count: 0,
                });
                accumulator.sum += f64::from(window.mean_sqi());
                accumulator.count += 1;
            }
        }
        self.append_line(sensor, DataType::Processed, || {
            window.to_json().ok().map(|v| v.to_string())
        }, 1);
    }

    fn append_line(
        &self,
        sensor: SensorKind,
        data_type: DataType,
        render: impl FnOnce() -> Option<String>,
        samples: u64,
    ) {
        let mut guard = self.active.lock().expect("recorder lock poisoned");
        let Some(active) = guard.as_mut() else {
            return;
        };
        if active.failed || !active.sensors.contains(&sensor) {
            return;
        }
        let Some(writer) = active
            .writers
            .iter()
            .find(|w| w.sensor == sensor && w.data_type == data_type)
        else {
            return;
        };
        let Some(tx) = writer.tx.as_ref() else {
            return;
        };
        let Some(line) = render() else {
            return;
        };
        match tx.try_send(line) {
            Ok(()) => {
                writer.counters.records.fetch_add(1, Ordering::Relaxed);
                writer.counters.samples.fetch_add(samples, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                active.failed = true;
                tracing::error!(
                    sensor = %sensor,
                    "Recorder queue overflow, failing the session"
                );
                let _ = self.fault_tx.try_send("recorder queue overflow".into());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Stop the active recording (or return the stored summary when the
    /// session is already sealed).
    ///
    /// # Errors
    /// `SessionNotFound` when the id matches nothing.
    pub async fn stop(&self, session_id: Option<&str>) -> EngineResult<SessionSummary> {
        let taken = {
            let mut guard = self.active.lock().expect("recorder lock poisoned");
            let is_active = match (guard.as_ref(), session_id) {
                (Some(active), Some(id)) => active.session_id == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if is_active { guard.take() } else { None }
        };

        match taken {
            Some(active) => {
                let status = if active.failed {
                    SessionStatus::Failed
                } else {
                    SessionStatus::Completed
                };
                self.seal(active, status).await
            }
            None => {
                // Idempotent stop: derive the summary from the store.
                let id = session_id.ok_or(EngineError::SessionNotFound {
                    session_id: "(none)".into(),
                })?;
                self.summary_from_store(id)
            }
        }
    }

    /// Fail the active recording (device loss, disk trouble). No-op
    /// when idle.
    pub async fn fail_active(&self, reason: &str) -> Option<SessionSummary> {
        let taken = self.active.lock().expect("recorder lock poisoned").take();
        let active = taken?;
        tracing::warn!(session_id = %active.session_id, reason, "Sealing session as failed");
        self.seal(active, SessionStatus::Failed).await.ok()
    }

    async fn seal(
        &self,
        mut active: ActiveRecording,
        status: SessionStatus,
    ) -> EngineResult<SessionSummary> {
        let end_time = epoch_now();

        // Closing the senders lets each writer drain and flush.
        for writer in &mut active.writers {
            writer.tx.take();
        }
        let mut files = Vec::new();
        let mut sample_counts: HashMap<String, u64> = HashMap::new();
        let mut total_bytes = 0u64;
        let created_at = chrono::Utc::now().to_rfc3339();

        for writer in active.writers.drain(..) {
            match tokio::time::timeout(Duration::from_secs(2), writer.task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::warn!(file = %writer.filename, error = %e, "Writer failed"),
                Ok(Err(join_error)) => {
                    tracing::warn!(file = %writer.filename, error = %join_error, "Writer panicked");
                }
                Err(_) => tracing::warn!(file = %writer.filename, "Writer did not drain within 2s"),
            }

            let path = active.root.join(&writer.filename);
            let size_bytes = tokio::fs::metadata(&path).await.map_or(0, |m| m.len());
            total_bytes += size_bytes;
            let samples = writer.counters.samples.load(Ordering::Relaxed);
            if writer.data_type == DataType::Raw || writer.data_type == DataType::Battery {
                *sample_counts
                    .entry(writer.sensor.as_str().to_string())
                    .or_insert(0) += samples;
            }
            let entry = MetaFileEntry {
                filename: writer.filename.clone(),
                sensor: writer.sensor.as_str().to_string(),
                data_type: writer.data_type.as_str().to_string(),
                size_bytes,
                sample_count: Some(samples),
            };
            self.store.insert_file(&FileRow {
                session_id: active.session_id.clone(),
                filename: writer.filename,
                sensor: entry.sensor.clone(),
                data_type: entry.data_type.clone(),
                size_bytes,
                sample_count: Some(samples),
                created_at: created_at.clone(),
            })?;
            files.push(entry);
        }

        let quality = quality_metrics(&active.sqi);
        let meta = build_meta(&active, Some(end_time), files.clone(), quality);
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let meta_len = meta_bytes.len() as u64;
        tokio::fs::write(active.root.join("meta.json"), meta_bytes).await?;
        self.store.insert_file(&FileRow {
            session_id: active.session_id.clone(),
            filename: "meta.json".into(),
            sensor: "all".into(),
            data_type: DataType::Metadata.as_str().into(),
            size_bytes: meta_len,
            sample_count: None,
            created_at,
        })?;
        total_bytes += meta_len;

        self.store
            .seal_session(&active.session_id, status, end_time)?;
        tracing::info!(
            session_id = %active.session_id,
            status = status.as_str(),
            duration_s = end_time - active.start_time,
            "Recording sealed"
        );

        Ok(SessionSummary {
            session_id: active.session_id,
            session_name: active.session_name,
            status,
            duration_s: end_time - active.start_time,
            file_count: files.len() + 1,
            total_bytes,
            sample_counts,
        })
    }

    fn summary_from_store(&self, session_id: &str) -> EngineResult<SessionSummary> {
        let session = self.store.get_session(session_id)?;
        if session.status == SessionStatus::Recording {
            // The store believes it is recording but the recorder holds
            // nothing: a crash artifact. Treat it as failed.
            self.store
                .seal_session(session_id, SessionStatus::Failed, epoch_now())?;
        }
        let session = self.store.get_session(session_id)?;
        let files = self.store.files_for(session_id)?;
        let mut sample_counts: HashMap<String, u64> = HashMap::new();
        let mut total_bytes = 0u64;
        for file in &files {
            total_bytes += file.size_bytes;
            if file.data_type == "raw" || file.data_type == "battery" {
                *sample_counts.entry(file.sensor.clone()).or_insert(0) +=
                    file.sample_count.unwrap_or(0);
            }
        }
        Ok(SessionSummary {
            session_id: session.id,
            session_name: session.name,
            status: session.status,
            duration_s: session
                .end_time
                .map_or(0.0, |end| (end - session.start_time).max(0.0)),
            file_count: files.len(),
            total_bytes,
            sample_counts,
        })
    }

    /// Delete a session's rows and directory.
    ///
    /// # Errors
    /// `RecordingInProgress` (via `AlreadyRecording`) for the active
    /// session; `SessionNotFound` when missing.
    pub async fn delete_session(&self, session_id: &str) -> EngineResult<()> {
        if self.active_session().as_deref() == Some(session_id) {
            return Err(EngineError::AlreadyRecording);
        }
        let session = self.store.delete_session(session_id)?;
        if session.root_dir.starts_with(&self.data_dir) {
            let _ = tokio::fs::remove_dir_all(&session.root_dir).await;
        }
        tracing::info!(session_id, "Session deleted");
        Ok(())
    }
}

fn stream_kinds(sensor: SensorKind) -> Vec<DataType> {
    match sensor {
        SensorKind::Battery => vec![DataType::Battery],
        _ => vec![DataType::Raw, DataType::Processed],
    }
}

fn stream_filename(device_tag: &str, sensor: SensorKind, data_type: DataType) -> String {
    match data_type {
        DataType::Battery => format!("{device_tag}_bat.json"),
        _ => format!("{device_tag}_{}_{}.json", sensor.as_str(), data_type.as_str()),
    }
}

fn sanitize_device_id(address: &str) -> String {
    let tag: String = address
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if tag.is_empty() { "device".into() } else { tag }
}

fn quality_metrics(sqi: &HashMap<SensorKind, SqiAccumulator>) -> Option<QualityMetrics> {
    if sqi.is_empty() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let mean = |sensor: SensorKind| {
        sqi.get(&sensor).and_then(|a| {
            if a.count == 0 {
                None
            } else {
                Some((a.sum / a.count as f64) as f32)
            }
        })
    };
    Some(QualityMetrics {
        eeg_mean_sqi: mean(SensorKind::Eeg),
        ppg_mean_sqi: mean(SensorKind::Ppg),
        acc_mean_sqi: mean(SensorKind::Acc),
    })
}

fn build_meta(
    active: &ActiveRecording,
    end_time: Option<f64>,
    files: Vec<MetaFileEntry>,
    quality: Option<QualityMetrics>,
) -> SessionMeta {
    SessionMeta {
        session_id: active.session_id.clone(),
        session_name: active.session_name.clone(),
        start_time: active.start_time,
        end_time,
        duration_s: end_time.map(|end| end - active.start_time),
        device: DeviceMeta {
            id: active.device.address.clone(),
            firmware: None,
            battery: active.battery_level,
        },
        sensors: active
            .sensors
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        sampling_rates: SamplingRates::default(),
        files,
        quality_metrics: quality,
        notes: active.notes.clone(),
        tags: active.tags.clone(),
    }
}

/// Free space on the volume holding `path`, MiB. `None` when the
/// volume cannot be identified.
fn free_disk_mb(path: &Path) -> Option<u64> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() / (1024 * 1024))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{BatterySample, EegSample};

    fn test_device() -> DeviceDescriptor {
        DeviceDescriptor {
            address: "AA:BB:CC:DD:EE:01".into(),
            name: "PulseBand S1".into(),
            last_seen: epoch_now(),
            rssi: Some(-60),
        }
    }

    fn recorder_in(dir: &Path) -> (SessionRecorder, mpsc::Receiver<String>) {
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let mut config = EngineConfig::default();
        config.data_dir = dir.to_path_buf();
        config.min_free_disk_mb = 0;
        let (fault_tx, fault_rx) = mpsc::channel(4);
        (SessionRecorder::new(store, &config, fault_tx), fault_rx)
    }

    fn eeg_batch(n: usize, t0: f64) -> Arc<RawBatch> {
        let samples = (0..n)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let ts = t0 + i as f64 / EEG_RATE_HZ;
                EegSample {
                    ts,
                    ch1: 1.0,
                    ch2: -1.0,
                    ch1_leadoff: false,
                    ch2_leadoff: false,
                }
            })
            .collect();
        Arc::new(RawBatch::Eeg(samples))
    }

    #[tokio::test]
    async fn test_start_append_stop_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _faults) = recorder_in(dir.path());

        let row = recorder
            .start(
                StartRecording {
                    session_name: "T1".into(),
                    participant_id: Some("p01".into()),
                    condition: None,
                    sensors: vec![],
                    notes: None,
                    tags: vec![],
                },
                &test_device(),
                Some(88.0),
            )
            .await
            .unwrap();
        assert!(recorder.active_session().is_some());

        recorder.append_raw(&eeg_batch(12, 100.0));
        recorder.append_raw(&eeg_batch(12, 100.048));
        recorder.append_raw(&Arc::new(RawBatch::Battery(vec![BatterySample {
            ts: 100.0,
            level: 88.0,
        }])));

        let summary = recorder.stop(Some(&row.id)).await.unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.sample_counts.get("eeg"), Some(&24));
        assert_eq!(summary.sample_counts.get("bat"), Some(&1));
        assert!(summary.file_count >= 8);

        // The EEG raw file holds two ndjson lines.
        let meta: SessionMeta = serde_json::from_slice(
            &std::fs::read(row.root_dir.join("meta.json")).unwrap(),
        )
        .unwrap();
        let eeg_raw = meta
            .files
            .iter()
            .find(|f| f.sensor == "eeg" && f.data_type == "raw")
            .unwrap();
        assert_eq!(eeg_raw.sample_count, Some(24));
        let content =
            std::fs::read_to_string(row.root_dir.join(&eeg_raw.filename)).unwrap();
        assert_eq!(content.lines().count(), 2);

        // Every file listed in meta.json exists with the listed size.
        for file in &meta.files {
            let size = std::fs::metadata(row.root_dir.join(&file.filename))
                .unwrap()
                .len();
            assert_eq!(size, file.size_bytes, "size mismatch for {}", file.filename);
        }
    }

    #[tokio::test]
    async fn test_double_start_is_already_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _faults) = recorder_in(dir.path());
        let request = StartRecording {
            session_name: "T1".into(),
            participant_id: None,
            condition: None,
            sensors: vec![],
            notes: None,
            tags: vec![],
        };
        recorder
            .start(request.clone(), &test_device(), None)
            .await
            .unwrap();
        let err = recorder
            .start(request, &test_device(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRecording));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _faults) = recorder_in(dir.path());
        let row = recorder
            .start(
                StartRecording {
                    session_name: "T1".into(),
                    participant_id: None,
                    condition: None,
                    sensors: vec![SensorKind::Eeg],
                    notes: None,
                    tags: vec![],
                },
                &test_device(),
                None,
            )
            .await
            .unwrap();
        recorder.append_raw(&eeg_batch(12, 1.0));
        let first = recorder.stop(Some(&row.id)).await.unwrap();
        let second = recorder.stop(Some(&row.id)).await.unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.status, second.status);
        assert_eq!(first.sample_counts, second.sample_counts);
        assert_eq!(first.total_bytes, second.total_bytes);
    }

    #[tokio::test]
    async fn test_unselected_sensor_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _faults) = recorder_in(dir.path());
        let row = recorder
            .start(
                StartRecording {
                    session_name: "eeg-only".into(),
                    participant_id: None,
                    condition: None,
                    sensors: vec![SensorKind::Eeg],
                    notes: None,
                    tags: vec![],
                },
                &test_device(),
                None,
            )
            .await
            .unwrap();
        recorder.append_raw(&Arc::new(RawBatch::Battery(vec![BatterySample {
            ts: 1.0,
            level: 50.0,
        }])));
        let summary = recorder.stop(Some(&row.id)).await.unwrap();
        assert!(!summary.sample_counts.contains_key("bat"));
    }

    #[tokio::test]
    async fn test_fail_active_seals_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _faults) = recorder_in(dir.path());
        let row = recorder
            .start(
                StartRecording {
                    session_name: "doomed".into(),
                    participant_id: None,
                    condition: None,
                    sensors: vec![],
                    notes: None,
                    tags: vec![],
                },
                &test_device(),
                None,
            )
            .await
            .unwrap();
        recorder.append_raw(&eeg_batch(12, 1.0));
        let summary = recorder.fail_active("device lost").await.unwrap();
        assert_eq!(summary.status, SessionStatus::Failed);
        // Files stay on disk for forensics.
        assert!(row.root_dir.join("meta.json").exists());

        // A later stop by id returns the same failed summary.
        let again = recorder.stop(Some(&row.id)).await.unwrap();
        assert_eq!(again.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_meta_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, _faults) = recorder_in(dir.path());
        let row = recorder
            .start(
                StartRecording {
                    session_name: "rt".into(),
                    participant_id: None,
                    condition: Some("rest".into()),
                    sensors: vec![],
                    notes: Some("eyes closed".into()),
                    tags: vec!["baseline".into()],
                },
                &test_device(),
                Some(77.0),
            )
            .await
            .unwrap();
        recorder.stop(Some(&row.id)).await.unwrap();

        let bytes = std::fs::read(row.root_dir.join("meta.json")).unwrap();
        let meta: SessionMeta = serde_json::from_slice(&bytes).unwrap();
        let reserialized = serde_json::to_vec_pretty(&meta).unwrap();
        let reparsed: SessionMeta = serde_json::from_slice(&reserialized).unwrap();
        assert_eq!(meta, reparsed);
        assert_eq!(meta.device.battery, Some(77.0));
        assert!((meta.sampling_rates.EEG - 250.0).abs() < f64::EPSILON);
    }
}
