//! Bus wire protocol: channels, envelopes, and client commands.
//!
//! Channel membership is closed; anything outside the table is an
//! `UnknownChannel` protocol error, never a silently created topic.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::sample::{SensorKind, epoch_now};

/// Server version reported in the greeting.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The closed set of publish/subscribe topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    RawEeg,
    RawPpg,
    RawAcc,
    ProcessedEeg,
    ProcessedPpg,
    ProcessedAcc,
    Battery,
    DeviceInfo,
    MonitoringMetrics,
    Event,
}

impl Channel {
    /// Wire name of the channel.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::RawEeg => "raw_eeg",
            Channel::RawPpg => "raw_ppg",
            Channel::RawAcc => "raw_acc",
            Channel::ProcessedEeg => "processed_eeg",
            Channel::ProcessedPpg => "processed_ppg",
            Channel::ProcessedAcc => "processed_acc",
            Channel::Battery => "battery",
            Channel::DeviceInfo => "device_info",
            Channel::MonitoringMetrics => "monitoring_metrics",
            Channel::Event => "event",
        }
    }

    /// Parse a channel name.
    ///
    /// # Errors
    /// [`EngineError::UnknownChannel`] for anything outside the table.
    pub fn parse(name: &str) -> EngineResult<Self> {
        match name {
            "raw_eeg" => Ok(Channel::RawEeg),
            "raw_ppg" => Ok(Channel::RawPpg),
            "raw_acc" => Ok(Channel::RawAcc),
            "processed_eeg" => Ok(Channel::ProcessedEeg),
            "processed_ppg" => Ok(Channel::ProcessedPpg),
            "processed_acc" => Ok(Channel::ProcessedAcc),
            "battery" => Ok(Channel::Battery),
            "device_info" => Ok(Channel::DeviceInfo),
            "monitoring_metrics" => Ok(Channel::MonitoringMetrics),
            "event" => Ok(Channel::Event),
            other => Err(EngineError::UnknownChannel {
                channel: other.to_string(),
            }),
        }
    }

    /// The raw-data channel for a sensor.
    #[must_use]
    pub fn raw_for(sensor: SensorKind) -> Self {
        match sensor {
            SensorKind::Eeg => Channel::RawEeg,
            SensorKind::Ppg => Channel::RawPpg,
            SensorKind::Acc => Channel::RawAcc,
            SensorKind::Battery => Channel::Battery,
        }
    }

    /// The processed-data channel for a sensor. Battery has a single
    /// combined channel.
    #[must_use]
    pub fn processed_for(sensor: SensorKind) -> Self {
        match sensor {
            SensorKind::Eeg => Channel::ProcessedEeg,
            SensorKind::Ppg => Channel::ProcessedPpg,
            SensorKind::Acc => Channel::ProcessedAcc,
            SensorKind::Battery => Channel::Battery,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kinds of server-to-client envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    RawData,
    ProcessedData,
    SensorData,
    Event,
    Pong,
    HealthCheckResponse,
    SubscriptionConfirmed,
    Error,
}

/// Server-to-client message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    /// Seconds since epoch at emit time.
    pub timestamp: f64,
    pub data: serde_json::Value,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: MessageType, channel: Option<Channel>, data: serde_json::Value) -> Self {
        Self {
            kind,
            channel,
            timestamp: epoch_now(),
            data,
        }
    }

    /// Raw sensor data on its channel. Battery rides the `sensor_data`
    /// kind, waveform sensors the `raw_data` kind.
    #[must_use]
    pub fn raw(channel: Channel, data: serde_json::Value) -> Self {
        let kind = if channel == Channel::Battery {
            MessageType::SensorData
        } else {
            MessageType::RawData
        };
        Self::new(kind, Some(channel), data)
    }

    /// Processed window on its channel.
    #[must_use]
    pub fn processed(channel: Channel, data: serde_json::Value) -> Self {
        let kind = if channel == Channel::Battery {
            MessageType::SensorData
        } else {
            MessageType::ProcessedData
        };
        Self::new(kind, Some(channel), data)
    }

    /// Engine lifecycle or telemetry event.
    #[must_use]
    pub fn event(channel: Channel, data: serde_json::Value) -> Self {
        Self::new(MessageType::Event, Some(channel), data)
    }

    /// Reply to `ping`.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(MessageType::Pong, None, serde_json::Value::Null)
    }

    /// Reply to `health_check`.
    #[must_use]
    pub fn health(data: serde_json::Value) -> Self {
        Self::new(MessageType::HealthCheckResponse, None, data)
    }

    /// Reply to `subscribe` / `unsubscribe`.
    #[must_use]
    pub fn subscription(channel: Channel, subscribed: bool) -> Self {
        Self::new(
            MessageType::SubscriptionConfirmed,
            Some(channel),
            serde_json::json!({ "channel": channel.as_str(), "subscribed": subscribed }),
        )
    }

    /// Error reply carrying a closed code and a human-readable message.
    #[must_use]
    pub fn error(code: ErrorCode, message: &str) -> Self {
        Self::new(
            MessageType::Error,
            None,
            serde_json::json!({ "code": code.as_str(), "message": message }),
        )
    }

    /// Greeting sent when a client registers.
    #[must_use]
    pub fn greeting(client_id: u64) -> Self {
        Self::new(
            MessageType::Event,
            None,
            serde_json::json!({
                "event": "connected",
                "client_id": client_id,
                "server_version": SERVER_VERSION,
            }),
        )
    }

    /// Serialize to the wire form. Infallible for these types.
    #[must_use]
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Device commands a client may issue over the socket; forwarded to the
/// coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    ScanDevices,
    ConnectDevice,
    DisconnectDevice,
    StartStreaming,
    StopStreaming,
    HealthCheck,
}

/// Client-to-server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Ping,
    HealthCheck,
    Command {
        command: DeviceCommand,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        duration_s: Option<u64>,
    },
}

impl ClientRequest {
    /// Parse one incoming text frame.
    ///
    /// # Errors
    /// [`EngineError::MalformedCommand`] when the frame is not a known
    /// request shape.
    pub fn parse(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text).map_err(|e| EngineError::MalformedCommand {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_round_trip() {
        for channel in [
            Channel::RawEeg,
            Channel::RawPpg,
            Channel::RawAcc,
            Channel::ProcessedEeg,
            Channel::ProcessedPpg,
            Channel::ProcessedAcc,
            Channel::Battery,
            Channel::DeviceInfo,
            Channel::MonitoringMetrics,
            Channel::Event,
        ] {
            assert_eq!(Channel::parse(channel.as_str()).unwrap(), channel);
        }
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let err = Channel::parse("raw_emg").unwrap_err();
        assert!(matches!(err, EngineError::UnknownChannel { .. }));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::processed(Channel::ProcessedEeg, serde_json::json!({"x": 1}));
        let value: serde_json::Value = serde_json::from_str(&envelope.to_wire()).unwrap();
        assert_eq!(value["type"], "processed_data");
        assert_eq!(value["channel"], "processed_eeg");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
        assert_eq!(value["data"]["x"], 1);
    }

    #[test]
    fn test_pong_has_no_channel() {
        let value: serde_json::Value = serde_json::from_str(&Envelope::pong().to_wire()).unwrap();
        assert_eq!(value["type"], "pong");
        assert!(value.get("channel").is_none());
    }

    #[test]
    fn test_parse_subscribe() {
        let request = ClientRequest::parse(r#"{"type":"subscribe","channel":"raw_eeg"}"#).unwrap();
        assert!(matches!(request, ClientRequest::Subscribe { channel } if channel == "raw_eeg"));
    }

    #[test]
    fn test_parse_device_command() {
        let request = ClientRequest::parse(
            r#"{"type":"command","command":"connect_device","address":"AA:BB:CC:DD:EE:01"}"#,
        )
        .unwrap();
        let ClientRequest::Command {
            command, address, ..
        } = request
        else {
            panic!("wrong request kind");
        };
        assert_eq!(command, DeviceCommand::ConnectDevice);
        assert_eq!(address.as_deref(), Some("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = ClientRequest::parse("{not json").unwrap_err();
        assert!(matches!(err, EngineError::MalformedCommand { .. }));
        let err = ClientRequest::parse(r#"{"type":"warp"}"#).unwrap_err();
        assert!(matches!(err, EngineError::MalformedCommand { .. }));
    }

    #[test]
    fn test_battery_rides_sensor_data() {
        let envelope = Envelope::raw(Channel::Battery, serde_json::json!({"level": 90}));
        assert_eq!(envelope.kind, MessageType::SensorData);
    }
}
