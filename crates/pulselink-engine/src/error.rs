//! # Error Types
//!
//! Semantic error types for the engine. Every variant carries enough
//! context to diagnose the problem without digging through logs.
//!
//! The taxonomy is closed and grouped the way failures actually occur:
//! transport (the wireless link), lifecycle (illegal transitions),
//! storage (recorder and store), protocol (bus commands), and pipeline
//! (DSP faults that never escape the pipeline task).
//!
//! [`EngineError::code`] maps every variant to the closed wire-level
//! error code set used by the HTTP envelope and bus error messages.

use thiserror::Error;

/// Convenient Result alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Closed set of wire-level error codes surfaced to clients.
///
/// These are the only codes that cross the HTTP/WebSocket boundary;
/// internal error detail stays in the `message` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BluetoothError,
    DeviceNotFound,
    ConnectionFailed,
    ConnectionTimeout,
    DeviceBusy,
    InvalidSettings,
    PermissionDenied,
    SessionNotFound,
    RecordingInProgress,
    InvalidFormat,
    InsufficientSpace,
    FileNotFound,
    ExportFailed,
    InvalidParameters,
    RateLimitExceeded,
}

impl ErrorCode {
    /// The wire representation, e.g. `"CONNECTION_TIMEOUT"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BluetoothError => "BLUETOOTH_ERROR",
            ErrorCode::DeviceNotFound => "DEVICE_NOT_FOUND",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::DeviceBusy => "DEVICE_BUSY",
            ErrorCode::InvalidSettings => "INVALID_SETTINGS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::RecordingInProgress => "RECORDING_IN_PROGRESS",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::InsufficientSpace => "INSUFFICIENT_SPACE",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::ExportFailed => "EXPORT_FAILED",
            ErrorCode::InvalidParameters => "INVALID_PARAMETERS",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors that can occur inside the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    // ─── Transport ──────────────────────────────────────────────────

    /// The host has no usable wireless adapter.
    #[error("No Bluetooth adapter available on this host")]
    BluetoothUnavailable,

    /// Establishing the link to the sensor band failed.
    #[error("Failed to connect to device {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// The connect attempt did not complete within the deadline.
    #[error("Connection attempt timed out after {seconds}s")]
    ConnectionTimeout { seconds: u64 },

    /// The link dropped after being established.
    #[error("Device link lost unexpectedly: {reason}")]
    UnexpectedDisconnect { reason: String },

    /// No device with the given address was seen during the scan.
    #[error("Device {address} not found")]
    DeviceNotFound { address: String },

    /// The device refused the connection because another host owns it.
    #[error("Device is busy (already paired to another host)")]
    DeviceBusy,

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// A recording session is already active.
    #[error("A recording session is already in progress")]
    AlreadyRecording,

    /// The requested operation needs an active stream.
    #[error("Streaming is not active")]
    NotStreaming,

    /// The requested operation needs a connected device.
    #[error("No device is connected")]
    NotConnected,

    /// The requested transition is not legal from the current state.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ─── Storage ────────────────────────────────────────────────────

    /// Not enough free space on the recording volume.
    #[error("Insufficient disk space: {available_mb} MiB free, {required_mb} MiB required")]
    InsufficientSpace {
        available_mb: u64,
        required_mb: u64,
    },

    /// A file referenced by a session row is missing on disk.
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Writing to a session stream failed.
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    /// Session files and store row disagree beyond repair.
    #[error("Session {session_id} is corrupt: {reason}")]
    CorruptSession { session_id: String, reason: String },

    /// No session with the given id exists.
    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    /// No export job with the given id exists.
    #[error("Export {export_id} not found")]
    ExportNotFound { export_id: String },

    /// An export job failed.
    #[error("Export failed: {reason}")]
    ExportFailed { reason: String },

    /// The requested export format is not recognized or not applicable.
    #[error("Invalid export format: {format}")]
    InvalidFormat { format: String },

    // ─── Protocol ───────────────────────────────────────────────────

    /// A client sent a frame that does not parse as a known command.
    #[error("Malformed command: {reason}")]
    MalformedCommand { reason: String },

    /// A client referenced a channel outside the closed channel set.
    #[error("Unknown channel: {channel}")]
    UnknownChannel { channel: String },

    /// The subscription was refused by policy.
    #[error("Subscription denied for channel {channel}: {reason}")]
    SubscriptionDenied { channel: String, reason: String },

    /// A request carried parameters that fail validation.
    #[error("Invalid parameters: {reason}")]
    InvalidParameters { reason: String },

    // ─── Pipeline ───────────────────────────────────────────────────

    /// Internal DSP fault. Isolated to the pipeline task; never fatal
    /// to the engine.
    #[error("Pipeline error in {sensor}: {reason}")]
    Pipeline { sensor: String, reason: String },

    // ─── I/O and serialization ──────────────────────────────────────

    /// Filesystem or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session store error.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Configuration file error.
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

impl EngineError {
    /// Map this error onto the closed wire-level code set.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::BluetoothUnavailable => ErrorCode::BluetoothError,
            EngineError::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            EngineError::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            EngineError::UnexpectedDisconnect { .. } => ErrorCode::ConnectionFailed,
            EngineError::DeviceNotFound { .. } => ErrorCode::DeviceNotFound,
            EngineError::DeviceBusy => ErrorCode::DeviceBusy,
            EngineError::AlreadyRecording => ErrorCode::RecordingInProgress,
            EngineError::NotStreaming
            | EngineError::NotConnected
            | EngineError::InvalidTransition { .. } => ErrorCode::InvalidSettings,
            EngineError::InsufficientSpace { .. } => ErrorCode::InsufficientSpace,
            EngineError::FileNotFound { .. } => ErrorCode::FileNotFound,
            EngineError::WriteFailed { .. }
            | EngineError::CorruptSession { .. }
            | EngineError::Io(_)
            | EngineError::Store(_) => ErrorCode::ExportFailed,
            EngineError::SessionNotFound { .. } | EngineError::ExportNotFound { .. } => {
                ErrorCode::SessionNotFound
            }
            EngineError::ExportFailed { .. } => ErrorCode::ExportFailed,
            EngineError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            EngineError::MalformedCommand { .. }
            | EngineError::InvalidParameters { .. }
            | EngineError::Json(_)
            | EngineError::Config { .. } => ErrorCode::InvalidParameters,
            EngineError::UnknownChannel { .. } => ErrorCode::InvalidParameters,
            EngineError::SubscriptionDenied { .. } => ErrorCode::PermissionDenied,
            EngineError::Pipeline { .. } => ErrorCode::InvalidSettings,
        }
    }

    /// Returns `true` if this error is transient and a reconnect attempt
    /// makes sense.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectionFailed { .. }
                | EngineError::ConnectionTimeout { .. }
                | EngineError::UnexpectedDisconnect { .. }
        )
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config {
            reason: err.to_string(),
        }
    }
}
