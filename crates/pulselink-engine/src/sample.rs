//! Core sensor data model: sensor kinds, raw samples, and batches.
//!
//! Raw samples are small `Copy` structs in physical units, produced by
//! the device adapter at decode time. A [`RawBatch`] groups the samples
//! of one decoded frame and is wrapped in `Arc` before fan-out so the
//! bus and the recorder share it by reference.

use serde::{Deserialize, Serialize};

/// Nominal EEG sampling rate, Hz.
pub const EEG_RATE_HZ: f64 = 250.0;
/// Nominal PPG sampling rate, Hz.
pub const PPG_RATE_HZ: f64 = 50.0;
/// Nominal accelerometer sampling rate, Hz.
pub const ACC_RATE_HZ: f64 = 30.0;
/// Nominal battery report rate, Hz.
pub const BAT_RATE_HZ: f64 = 10.0;

/// The sensors a band exposes. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorKind {
    Eeg,
    Ppg,
    Acc,
    Battery,
}

impl SensorKind {
    /// Lowercase wire/file name (`"eeg"`, `"ppg"`, `"acc"`, `"bat"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Eeg => "eeg",
            SensorKind::Ppg => "ppg",
            SensorKind::Acc => "acc",
            SensorKind::Battery => "bat",
        }
    }

    /// Nominal sampling rate for this sensor, Hz.
    #[must_use]
    pub fn nominal_rate_hz(self) -> f64 {
        match self {
            SensorKind::Eeg => EEG_RATE_HZ,
            SensorKind::Ppg => PPG_RATE_HZ,
            SensorKind::Acc => ACC_RATE_HZ,
            SensorKind::Battery => BAT_RATE_HZ,
        }
    }

    /// All sensor kinds, in fan-out order.
    #[must_use]
    pub fn all() -> [SensorKind; 4] {
        [
            SensorKind::Eeg,
            SensorKind::Ppg,
            SensorKind::Acc,
            SensorKind::Battery,
        ]
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eeg" => Ok(SensorKind::Eeg),
            "ppg" => Ok(SensorKind::Ppg),
            "acc" => Ok(SensorKind::Acc),
            "bat" | "battery" => Ok(SensorKind::Battery),
            _ => Err(()),
        }
    }
}

/// One EEG sample: two channels in microvolts plus lead-off flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EegSample {
    /// Seconds since epoch, strictly monotonic within the sensor.
    pub ts: f64,
    /// Channel 1 potential, µV.
    pub ch1: f32,
    /// Channel 2 potential, µV.
    pub ch2: f32,
    /// Electrode 1 is off the skin.
    pub ch1_leadoff: bool,
    /// Electrode 2 is off the skin.
    pub ch2_leadoff: bool,
}

/// One PPG sample: raw red and infrared photodiode counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PpgSample {
    pub ts: f64,
    pub red: f32,
    pub ir: f32,
}

/// One accelerometer sample in g units per axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccSample {
    pub ts: f64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One battery report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatterySample {
    pub ts: f64,
    /// Charge level, percent.
    #[serde(rename = "level_percent")]
    pub level: f32,
}

/// A decoded frame's worth of samples for one sensor.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "sensor", content = "samples", rename_all = "lowercase")]
pub enum RawBatch {
    Eeg(Vec<EegSample>),
    Ppg(Vec<PpgSample>),
    Acc(Vec<AccSample>),
    #[serde(rename = "bat")]
    Battery(Vec<BatterySample>),
}

impl RawBatch {
    /// Which sensor produced this batch.
    #[must_use]
    pub fn sensor(&self) -> SensorKind {
        match self {
            RawBatch::Eeg(_) => SensorKind::Eeg,
            RawBatch::Ppg(_) => SensorKind::Ppg,
            RawBatch::Acc(_) => SensorKind::Acc,
            RawBatch::Battery(_) => SensorKind::Battery,
        }
    }

    /// Number of samples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            RawBatch::Eeg(v) => v.len(),
            RawBatch::Ppg(v) => v.len(),
            RawBatch::Acc(v) => v.len(),
            RawBatch::Battery(v) => v.len(),
        }
    }

    /// `true` when the batch holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the first sample, if any.
    #[must_use]
    pub fn first_ts(&self) -> Option<f64> {
        match self {
            RawBatch::Eeg(v) => v.first().map(|s| s.ts),
            RawBatch::Ppg(v) => v.first().map(|s| s.ts),
            RawBatch::Acc(v) => v.first().map(|s| s.ts),
            RawBatch::Battery(v) => v.first().map(|s| s.ts),
        }
    }
}

/// A device seen during a scan, or the one currently connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable address of the band (BLE address or simulator id).
    pub address: String,
    /// Advertised human name.
    pub name: String,
    /// When the device was last seen, seconds since epoch.
    pub last_seen: f64,
    /// Best-effort RSSI hint, dBm. Never used for liveness decisions.
    pub rssi: Option<i16>,
}

/// Wall-clock now as fractional seconds since the Unix epoch.
#[must_use]
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_kind_round_trip() {
        for kind in SensorKind::all() {
            let parsed: SensorKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("thermal".parse::<SensorKind>().is_err());
    }

    #[test]
    fn test_raw_batch_serializes_with_sensor_tag() {
        let batch = RawBatch::Ppg(vec![PpgSample {
            ts: 1.0,
            red: 120_000.0,
            ir: 98_000.0,
        }]);
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["sensor"], "ppg");
        assert_eq!(json["samples"][0]["red"], 120_000.0);
    }

    #[test]
    fn test_batch_len_and_first_ts() {
        let batch = RawBatch::Eeg(vec![
            EegSample {
                ts: 10.0,
                ch1: 1.0,
                ch2: -1.0,
                ch1_leadoff: false,
                ch2_leadoff: false,
            },
            EegSample {
                ts: 10.004,
                ch1: 2.0,
                ch2: -2.0,
                ch1_leadoff: false,
                ch2_leadoff: false,
            },
        ]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert!((batch.first_ts().unwrap() - 10.0).abs() < f64::EPSILON);
    }
}
