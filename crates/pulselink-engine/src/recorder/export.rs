//! Asynchronous session export.
//!
//! An export job reads a sealed session's ndjson stream files, filters
//! by sensor, data type, and time range, and repackages into one of the
//! four artifact formats. Jobs run on their own task and report
//! progress through the `exports` table; clients poll
//! `GET /data/exports/{id}`.
//!
//! Format notes:
//! - `json`: one file holding every selected stream.
//! - `csv`: one file per stream; raw EEG columns are
//!   `timestamp,CH1,CH2`.
//! - `mat`: MAT-file level 5, one f64 matrix per stream.
//! - `edf`: EDF with one signal per waveform column, 16-bit records.
//!
//! `csv`, `mat`, and `edf` cover raw and battery streams only;
//! processed windows are irregular documents and export as `json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::recorder::DataType;
use crate::recorder::store::{ExportRow, ExportStatus, SessionStatus, SessionStore};
use crate::sample::SensorKind;

/// Supported artifact formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Mat,
    Edf,
}

impl ExportFormat {
    /// Parse the wire name.
    ///
    /// # Errors
    /// [`EngineError::InvalidFormat`] for anything outside the set.
    pub fn parse(name: &str) -> EngineResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "mat" => Ok(ExportFormat::Mat),
            "edf" => Ok(ExportFormat::Edf),
            other => Err(EngineError::InvalidFormat {
                format: other.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Mat => "mat",
            ExportFormat::Edf => "edf",
        }
    }
}

/// Export request parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportRequest {
    pub format: String,
    /// Sensors to include; empty means every recorded sensor.
    #[serde(default)]
    pub sensors: Vec<SensorKind>,
    /// Data types to include; empty means the format's natural set.
    #[serde(default)]
    pub data_types: Vec<DataType>,
    /// `[start, end]` in seconds since epoch.
    #[serde(default)]
    pub time_range: Option<[f64; 2]>,
    /// Accepted for compatibility; artifacts are never compressed.
    #[serde(default)]
    pub compression: Option<String>,
}

/// One stream loaded from disk, columnar.
struct StreamTable {
    name: String,
    sensor: SensorKind,
    /// Column headers, timestamp first.
    columns: Vec<&'static str>,
    /// Rows in timestamp order.
    rows: Vec<Vec<f64>>,
}

/// Validate the request and enqueue the job. Returns the pending row.
///
/// # Errors
/// `SessionNotFound`, `InvalidFormat`, or store failures. A session
/// still recording cannot be exported.
pub fn start_export(
    store: Arc<SessionStore>,
    session_id: &str,
    request: ExportRequest,
) -> EngineResult<ExportRow> {
    let session = store.get_session(session_id)?;
    if session.status == SessionStatus::Recording {
        return Err(EngineError::AlreadyRecording);
    }
    let format = ExportFormat::parse(&request.format)?;
    if format != ExportFormat::Json && request.data_types.contains(&DataType::Processed) {
        return Err(EngineError::InvalidFormat {
            format: format!("{} cannot carry processed windows", format.as_str()),
        });
    }
    if request.compression.is_some() {
        tracing::debug!("Ignoring compression option; artifacts are uncompressed");
    }

    let export_id = uuid::Uuid::new_v4().to_string();
    let row = ExportRow {
        id: export_id.clone(),
        session_id: session_id.to_string(),
        status: ExportStatus::Pending,
        format: format.as_str().to_string(),
        file_path: None,
        created_at: chrono::Utc::now().to_rfc3339(),
        completed_at: None,
        error: None,
    };
    store.create_export(&row)?;

    tokio::spawn({
        let store = Arc::clone(&store);
        let session_root = session.root_dir.clone();
        async move {
            let _ = store.update_export(&export_id, ExportStatus::Running, None, None, None);
            let result = run_export(&store, &export_id, &session_root, format, &request).await;
            let completed_at = chrono::Utc::now().to_rfc3339();
            match result {
                Ok(path) => {
                    let _ = store.update_export(
                        &export_id,
                        ExportStatus::Completed,
                        Some(&path),
                        Some(&completed_at),
                        None,
                    );
                    tracing::info!(export_id, path = %path.display(), "Export completed");
                }
                Err(e) => {
                    let _ = store.update_export(
                        &export_id,
                        ExportStatus::Failed,
                        None,
                        Some(&completed_at),
                        Some(&e.to_string()),
                    );
                    tracing::warn!(export_id, error = %e, "Export failed");
                }
            }
        }
    });

    Ok(row)
}

async fn run_export(
    store: &SessionStore,
    export_id: &str,
    session_root: &Path,
    format: ExportFormat,
    request: &ExportRequest,
) -> EngineResult<PathBuf> {
    let export = store.get_export(export_id)?;
    let files = store.files_for(&export.session_id)?;

    let sensors: Vec<SensorKind> = if request.sensors.is_empty() {
        SensorKind::all().to_vec()
    } else {
        request.sensors.clone()
    };
    let data_types: Vec<DataType> = if request.data_types.is_empty() {
        match format {
            ExportFormat::Json => vec![DataType::Raw, DataType::Processed, DataType::Battery],
            _ => vec![DataType::Raw, DataType::Battery],
        }
    } else {
        request.data_types.clone()
    };

    let out_dir = session_root.join("exports");
    tokio::fs::create_dir_all(&out_dir).await?;

    // JSON keeps everything in one artifact, including processed
    // windows verbatim.
    if format == ExportFormat::Json {
        return export_json(
            &export, &files, session_root, &out_dir, &sensors, &data_types, request,
        )
        .await;
    }

    // Columnar formats: load each selected raw stream as a table.
    let mut tables = Vec::new();
    for file in &files {
        let Ok(sensor) = file.sensor.parse::<SensorKind>() else {
            continue;
        };
        let selected = sensors.contains(&sensor)
            && data_types.iter().any(|dt| dt.as_str() == file.data_type)
            && (file.data_type == "raw" || file.data_type == "battery");
        if !selected {
            continue;
        }
        let table = load_stream(session_root, &file.filename, sensor, request.time_range).await?;
        tables.push(table);
    }
    if tables.is_empty() {
        return Err(EngineError::ExportFailed {
            reason: "no streams match the requested filters".into(),
        });
    }

    let short_id = &export.id[..8.min(export.id.len())];
    if tables.len() == 1 {
        let table = &tables[0];
        let path = out_dir.join(format!(
            "export_{short_id}_{}.{}",
            table.name,
            format.as_str()
        ));
        write_table(&path, table, format).await?;
        Ok(path)
    } else {
        let dir = out_dir.join(format!("export_{short_id}"));
        tokio::fs::create_dir_all(&dir).await?;
        for table in &tables {
            let path = dir.join(format!("{}.{}", table.name, format.as_str()));
            write_table(&path, table, format).await?;
        }
        Ok(dir)
    }
}

async fn export_json(
    export: &ExportRow,
    files: &[crate::recorder::store::FileRow],
    session_root: &Path,
    out_dir: &Path,
    sensors: &[SensorKind],
    data_types: &[DataType],
    request: &ExportRequest,
) -> EngineResult<PathBuf> {
    let mut streams = serde_json::Map::new();
    for file in files {
        let Ok(sensor) = file.sensor.parse::<SensorKind>() else {
            continue;
        };
        if !sensors.contains(&sensor)
            || !data_types.iter().any(|dt| dt.as_str() == file.data_type)
        {
            continue;
        }
        let text = tokio::fs::read_to_string(session_root.join(&file.filename)).await?;
        let mut records = Vec::new();
        for line in text.lines() {
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if let Some([start, end]) = request.time_range {
                if let Some(ts) = record_ts(&value) {
                    if ts < start || ts > end {
                        continue;
                    }
                }
            }
            records.push(value);
        }
        let key = format!("{}_{}", file.sensor, file.data_type);
        streams.insert(key, Value::Array(records));
    }

    let short_id = &export.id[..8.min(export.id.len())];
    let path = out_dir.join(format!("export_{short_id}.json"));
    let document = serde_json::json!({
        "session_id": export.session_id,
        "exported_at": export.created_at,
        "streams": streams,
    });
    tokio::fs::write(&path, serde_json::to_vec_pretty(&document)?).await?;
    Ok(path)
}

/// First timestamp of an ndjson record (raw batch or processed window).
fn record_ts(value: &Value) -> Option<f64> {
    if let Some(ts) = value.get("ts").and_then(Value::as_f64) {
        return Some(ts);
    }
    value
        .get("samples")?
        .as_array()?
        .first()?
        .get("ts")
        .and_then(Value::as_f64)
}

fn raw_columns(sensor: SensorKind) -> Vec<&'static str> {
    match sensor {
        SensorKind::Eeg => vec!["timestamp", "CH1", "CH2"],
        SensorKind::Ppg => vec!["timestamp", "red", "ir"],
        SensorKind::Acc => vec!["timestamp", "x", "y", "z"],
        SensorKind::Battery => vec!["timestamp", "level_percent"],
    }
}

async fn load_stream(
    session_root: &Path,
    filename: &str,
    sensor: SensorKind,
    time_range: Option<[f64; 2]>,
) -> EngineResult<StreamTable> {
    let text = tokio::fs::read_to_string(session_root.join(filename)).await?;
    let mut rows = Vec::new();
    for line in text.lines() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(samples) = value.get("samples").and_then(Value::as_array) else {
            continue;
        };
        for sample in samples {
            let Some(ts) = sample.get("ts").and_then(Value::as_f64) else {
                continue;
            };
            if let Some([start, end]) = time_range {
                if ts < start || ts > end {
                    continue;
                }
            }
            let field = |key: &str| sample.get(key).and_then(Value::as_f64).unwrap_or(0.0);
            let row = match sensor {
                SensorKind::Eeg => vec![ts, field("ch1"), field("ch2")],
                SensorKind::Ppg => vec![ts, field("red"), field("ir")],
                SensorKind::Acc => vec![ts, field("x"), field("y"), field("z")],
                SensorKind::Battery => vec![ts, field("level_percent")],
            };
            rows.push(row);
        }
    }
    let name = if sensor == SensorKind::Battery {
        "bat_raw".to_string()
    } else {
        format!("{}_raw", sensor.as_str())
    };
    Ok(StreamTable {
        name,
        sensor,
        columns: raw_columns(sensor),
        rows,
    })
}

async fn write_table(path: &Path, table: &StreamTable, format: ExportFormat) -> EngineResult<()> {
    let bytes = match format {
        ExportFormat::Csv => render_csv(table).into_bytes(),
        ExportFormat::Mat => render_mat(table),
        ExportFormat::Edf => render_edf(table),
        ExportFormat::Json => unreachable!("json handled separately"),
    };
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

fn render_csv(table: &StreamTable) -> String {
    let mut out = String::new();
    out.push_str(&table.columns.join(","));
    out.push('\n');
    for row in &table.rows {
        let mut first = true;
        for value in row {
            if !first {
                out.push(',');
            }
            first = false;
            // Timestamps keep full precision; samples don't need it.
            out.push_str(&format!("{value}"));
        }
        out.push('\n');
    }
    out
}

// ─── MAT-file level 5 ───────────────────────────────────────────────

const MI_MATRIX: u32 = 14;
const MI_UINT32: u32 = 6;
const MI_INT8: u32 = 1;
const MI_DOUBLE: u32 = 9;
const MX_DOUBLE_CLASS: u32 = 6;

fn mat_element(kind: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len() + 7);
    out.extend_from_slice(&kind.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    while out.len() % 8 != 0 {
        out.push(0);
    }
    out
}

/// Minimal MAT-file 5 writer: one real f64 matrix per stream, rows are
/// samples, columns as in the CSV layout, column-major as MATLAB
/// expects.
fn render_mat(table: &StreamTable) -> Vec<u8> {
    let rows = table.rows.len();
    let cols = table.columns.len();

    let mut header = vec![0u8; 128];
    let text = format!(
        "MATLAB 5.0 MAT-file, created by pulselink-engine, stream {}",
        table.name
    );
    let text_bytes = text.as_bytes();
    header[..text_bytes.len().min(116)].copy_from_slice(&text_bytes[..text_bytes.len().min(116)]);
    header[124] = 0x00;
    header[125] = 0x01; // version 0x0100
    header[126] = b'I';
    header[127] = b'M';

    // Array flags: double class, no complex part.
    let mut flags = Vec::new();
    flags.extend_from_slice(&MX_DOUBLE_CLASS.to_le_bytes());
    flags.extend_from_slice(&0u32.to_le_bytes());
    let flags_element = mat_element(MI_UINT32, &flags);

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let dims: Vec<u8> = [(rows as i32), (cols as i32)]
        .iter()
        .flat_map(|d| d.to_le_bytes())
        .collect();
    let dims_element = mat_element(MI_UINT32, &dims);
    let name_element = mat_element(MI_INT8, table.name.as_bytes());

    // Column-major data.
    let mut data = Vec::with_capacity(rows * cols * 8);
    for col in 0..cols {
        for row in &table.rows {
            data.extend_from_slice(&row[col].to_le_bytes());
        }
    }
    let data_element = mat_element(MI_DOUBLE, &data);

    let body_len = flags_element.len() + dims_element.len() + name_element.len() + data_element.len();
    let mut out = header;
    out.extend_from_slice(&MI_MATRIX.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.extend_from_slice(&flags_element);
    out.extend_from_slice(&dims_element);
    out.extend_from_slice(&name_element);
    out.extend_from_slice(&data_element);
    out
}

// ─── EDF ────────────────────────────────────────────────────────────

fn edf_field(value: &str, width: usize) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.truncate(width);
    bytes.resize(width, b' ');
    bytes
}

/// Minimal EDF writer: one signal per waveform column (timestamp
/// excluded), one-second data records at the sensor's nominal rate,
/// 16-bit samples scaled into the observed physical range.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn render_edf(table: &StreamTable) -> Vec<u8> {
    let signal_count = table.columns.len() - 1;
    let rate = table.sensor.nominal_rate_hz().round() as usize;
    let samples_per_record = rate.max(1);
    let record_count = table.rows.len().div_ceil(samples_per_record);
    let start = table.rows.first().map_or(0.0, |r| r[0]);

    // Physical range per signal.
    let mut minimums = vec![f64::INFINITY; signal_count];
    let mut maximums = vec![f64::NEG_INFINITY; signal_count];
    for row in &table.rows {
        for (i, &value) in row[1..].iter().enumerate() {
            minimums[i] = minimums[i].min(value);
            maximums[i] = maximums[i].max(value);
        }
    }
    for i in 0..signal_count {
        if !minimums[i].is_finite() || minimums[i] >= maximums[i] {
            minimums[i] = -1.0;
            maximums[i] = 1.0;
        }
    }

    let header_bytes = 256 + 256 * signal_count;
    let mut out = Vec::new();
    out.extend(edf_field("0", 8));
    out.extend(edf_field("X X X X", 80));
    out.extend(edf_field(&format!("Startdate pulselink {}", table.name), 80));
    let start_date = chrono::DateTime::from_timestamp(start as i64, 0)
        .unwrap_or(chrono::DateTime::UNIX_EPOCH);
    out.extend(edf_field(&start_date.format("%d.%m.%y").to_string(), 8));
    out.extend(edf_field(&start_date.format("%H.%M.%S").to_string(), 8));
    out.extend(edf_field(&header_bytes.to_string(), 8));
    out.extend(edf_field("", 44));
    out.extend(edf_field(&record_count.to_string(), 8));
    out.extend(edf_field("1", 8));
    out.extend(edf_field(&signal_count.to_string(), 4));

    let unit = match table.sensor {
        SensorKind::Eeg => "uV",
        SensorKind::Ppg => "count",
        SensorKind::Acc => "g",
        SensorKind::Battery => "%",
    };
    for column in &table.columns[1..] {
        out.extend(edf_field(column, 16));
    }
    for _ in 0..signal_count {
        out.extend(edf_field("", 80));
    }
    for _ in 0..signal_count {
        out.extend(edf_field(unit, 8));
    }
    for minimum in &minimums {
        out.extend(edf_field(&format!("{minimum:.3}"), 8));
    }
    for maximum in &maximums {
        out.extend(edf_field(&format!("{maximum:.3}"), 8));
    }
    for _ in 0..signal_count {
        out.extend(edf_field("-32768", 8));
    }
    for _ in 0..signal_count {
        out.extend(edf_field("32767", 8));
    }
    for _ in 0..signal_count {
        out.extend(edf_field("", 80));
    }
    for _ in 0..signal_count {
        out.extend(edf_field(&samples_per_record.to_string(), 8));
    }
    for _ in 0..signal_count {
        out.extend(edf_field("", 32));
    }

    for record in 0..record_count {
        for signal in 0..signal_count {
            for i in 0..samples_per_record {
                let index = record * samples_per_record + i;
                let digital = table.rows.get(index).map_or(0i16, |row| {
                    let value = row[signal + 1];
                    let span = maximums[signal] - minimums[signal];
                    let normalized = (value - minimums[signal]) / span;
                    ((normalized * 65535.0) - 32768.0).clamp(-32768.0, 32767.0) as i16
                });
                out.extend_from_slice(&digital.to_le_bytes());
            }
        }
    }
    out
}
