//! # Configuration
//!
//! [`EngineConfig`] holds everything needed to bring the engine up.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. Environment variables (`PULSELINK_DATA_DIR`, `PULSELINK_WS_PORT`, ...)
//! 3. TOML config file at an explicit path
//! 4. `./pulselink.toml` in the current directory
//! 5. `~/.config/pulselink/pulselink.toml`
//!
//! Individual fields can always be overridden by environment variables,
//! even when loading from a file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Default WebSocket bus port.
pub const DEFAULT_WS_PORT: u16 = 18765;

/// Default HTTP control-plane port.
pub const DEFAULT_HTTP_PORT: u16 = 8121;

const DEFAULT_SCAN_DURATION_S: u64 = 15;
const DEFAULT_CONNECT_TIMEOUT_S: u64 = 30;

const DEFAULT_RING_CAPACITY_EEG: usize = 2000;
const DEFAULT_RING_CAPACITY_PPG: usize = 400;
const DEFAULT_RING_CAPACITY_ACC: usize = 150;

const DEFAULT_TICK_MS_EEG: u64 = 500;
const DEFAULT_TICK_MS_PPG: u64 = 500;
const DEFAULT_TICK_MS_ACC: u64 = 500;
const DEFAULT_TICK_MS_BAT: u64 = 1000;

const DEFAULT_CLIENT_SEND_QUEUE_LEN: usize = 128;
const DEFAULT_RECORDER_QUEUE_LEN: usize = 256;
const DEFAULT_SLOW_CONSUMER_LAG_THRESHOLD: u32 = 50;

const DEFAULT_MIN_FREE_DISK_MB: u64 = 512;
const DEFAULT_DECODE_ERROR_THRESHOLD: u32 = 20;

const DEFAULT_RECONNECT_BASE_DELAY_S: u64 = 1;
const DEFAULT_RECONNECT_MAX_DELAY_S: u64 = 60;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Configuration for the PulseLink engine.
///
/// # Examples
///
/// ## From a TOML file
///
/// ```no_run
/// use pulselink_engine::config::EngineConfig;
///
/// let config = EngineConfig::from_file("pulselink.toml").expect("Bad config");
/// ```
///
/// ## Programmatic
///
/// ```
/// use pulselink_engine::config::EngineConfig;
///
/// let mut config = EngineConfig::default();
/// config.ws_port = 19000;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for session data.
    pub data_dir: PathBuf,

    /// Port for the standalone WebSocket bus endpoint.
    pub ws_port: u16,

    /// Port for the HTTP control plane (which also mounts `/ws`).
    pub http_port: u16,

    /// Default scan duration when a request does not specify one, seconds.
    pub scan_default_duration_s: u64,

    /// Device connect timeout, seconds.
    pub connect_timeout_s: u64,

    /// Reconnect the last registered device after unexpected link loss.
    pub auto_reconnect: bool,

    /// Ring buffer capacity for EEG samples.
    pub ring_capacity_eeg: usize,

    /// Ring buffer capacity for PPG samples.
    pub ring_capacity_ppg: usize,

    /// Ring buffer capacity for accelerometer samples.
    pub ring_capacity_acc: usize,

    /// EEG pipeline tick cadence, milliseconds.
    pub tick_ms_eeg: u64,

    /// PPG pipeline tick cadence, milliseconds.
    pub tick_ms_ppg: u64,

    /// Accelerometer pipeline tick cadence, milliseconds.
    pub tick_ms_acc: u64,

    /// Battery pipeline tick cadence, milliseconds.
    pub tick_ms_bat: u64,

    /// Bound of each WebSocket client's send queue, messages.
    pub client_send_queue_len: usize,

    /// Bound of each recorded stream's writer queue, records.
    pub recorder_queue_len: usize,

    /// Dropped-message count that gets a client disconnected as a
    /// slow consumer.
    pub slow_consumer_lag_threshold: u32,

    /// Minimum free space on the recording volume before `start` is
    /// refused, MiB.
    pub min_free_disk_mb: u64,

    /// Decode errors within a 5 s window that force a disconnect.
    pub decode_error_threshold: u32,

    /// Auto-reconnect backoff behavior.
    pub reconnect: ReconnectConfig,
}

/// Backoff behavior when the device link drops unexpectedly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnect attempt, seconds.
    pub base_delay_s: u64,

    /// Maximum delay between attempts (exponential backoff cap), seconds.
    pub max_delay_s: u64,

    /// Maximum number of attempts. 0 means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_s: DEFAULT_RECONNECT_BASE_DELAY_S,
            max_delay_s: DEFAULT_RECONNECT_MAX_DELAY_S,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pulselink-data"),
            ws_port: DEFAULT_WS_PORT,
            http_port: DEFAULT_HTTP_PORT,
            scan_default_duration_s: DEFAULT_SCAN_DURATION_S,
            connect_timeout_s: DEFAULT_CONNECT_TIMEOUT_S,
            auto_reconnect: true,
            ring_capacity_eeg: DEFAULT_RING_CAPACITY_EEG,
            ring_capacity_ppg: DEFAULT_RING_CAPACITY_PPG,
            ring_capacity_acc: DEFAULT_RING_CAPACITY_ACC,
            tick_ms_eeg: DEFAULT_TICK_MS_EEG,
            tick_ms_ppg: DEFAULT_TICK_MS_PPG,
            tick_ms_acc: DEFAULT_TICK_MS_ACC,
            tick_ms_bat: DEFAULT_TICK_MS_BAT,
            client_send_queue_len: DEFAULT_CLIENT_SEND_QUEUE_LEN,
            recorder_queue_len: DEFAULT_RECORDER_QUEUE_LEN,
            slow_consumer_lag_threshold: DEFAULT_SLOW_CONSUMER_LAG_THRESHOLD,
            min_free_disk_mb: DEFAULT_MIN_FREE_DISK_MB,
            decode_error_threshold: DEFAULT_DECODE_ERROR_THRESHOLD,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] if the file is missing or malformed.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Discover configuration: explicit path, `./pulselink.toml`, the
    /// user config directory, then built-in defaults. Environment
    /// variables override whatever was loaded.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] only when an explicitly provided
    /// path fails to load; missing fallback files are not an error.
    pub fn discover(explicit: Option<&Path>) -> EngineResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = Path::new("pulselink.toml");
        if local.exists() {
            return Self::from_file(local);
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user = PathBuf::from(home).join(".config/pulselink/pulselink.toml");
            if user.exists() {
                return Self::from_file(user);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `PULSELINK_*` environment variable overrides in place.
    /// Unparseable values are ignored with a warning rather than failing
    /// startup.
    pub fn apply_env_overrides(&mut self) {
        fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
            let raw = std::env::var(key).ok()?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, raw, "Ignoring unparseable env override");
                    None
                }
            }
        }

        if let Ok(dir) = std::env::var("PULSELINK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_env("PULSELINK_WS_PORT") {
            self.ws_port = v;
        }
        if let Some(v) = parse_env("PULSELINK_HTTP_PORT") {
            self.http_port = v;
        }
        if let Some(v) = parse_env("PULSELINK_AUTO_RECONNECT") {
            self.auto_reconnect = v;
        }
        if let Some(v) = parse_env("PULSELINK_CONNECT_TIMEOUT_S") {
            self.connect_timeout_s = v;
        }
        if let Some(v) = parse_env("PULSELINK_MIN_FREE_DISK_MB") {
            self.min_free_disk_mb = v;
        }
    }

    /// Path of the session store database inside the data directory.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("pulselink.db")
    }
}
