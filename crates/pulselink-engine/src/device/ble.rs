//! Bluetooth LE transport backend over `btleplug`.
//!
//! The band exposes one primary service with a notify characteristic
//! per sensor. Scanning filters on the service UUID; connecting
//! discovers services, subscribes to the sensor characteristics, and
//! pumps notifications into [`LinkEvent`]s.
//!
//! Notification payloads are the wire frames described in
//! [`crate::device::frame`]: two sequence bytes followed by the sample
//! records.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::{Uuid, uuid};

use crate::device::frame::RawFrame;
use crate::device::link::{LINK_CHANNEL_DEPTH, LinkEvent, LinkSession};
use crate::error::{EngineError, EngineResult};
use crate::sample::{DeviceDescriptor, SensorKind, epoch_now};

/// Primary service advertised by the band.
pub const BAND_SERVICE_UUID: Uuid = uuid!("6e400001-b5a3-f393-e0a9-50e24dcca9e0");

/// EEG frame notifications.
const EEG_CHAR_UUID: Uuid = uuid!("6e400002-b5a3-f393-e0a9-50e24dcca9e0");
/// PPG frame notifications.
const PPG_CHAR_UUID: Uuid = uuid!("6e400003-b5a3-f393-e0a9-50e24dcca9e0");
/// Accelerometer frame notifications.
const ACC_CHAR_UUID: Uuid = uuid!("6e400004-b5a3-f393-e0a9-50e24dcca9e0");
/// Battery report notifications.
const BAT_CHAR_UUID: Uuid = uuid!("6e400005-b5a3-f393-e0a9-50e24dcca9e0");

fn sensor_for_char(uuid: Uuid) -> Option<SensorKind> {
    match uuid {
        EEG_CHAR_UUID => Some(SensorKind::Eeg),
        PPG_CHAR_UUID => Some(SensorKind::Ppg),
        ACC_CHAR_UUID => Some(SensorKind::Acc),
        BAT_CHAR_UUID => Some(SensorKind::Battery),
        _ => None,
    }
}

/// The real band over Bluetooth LE.
pub struct BleLink {
    adapter: Option<Adapter>,
    connected: Option<Peripheral>,
}

impl BleLink {
    /// Grab the first host adapter.
    ///
    /// # Errors
    /// [`EngineError::BluetoothUnavailable`] when the host has no
    /// usable radio.
    pub async fn new() -> EngineResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_| EngineError::BluetoothUnavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| EngineError::BluetoothUnavailable)?
            .into_iter()
            .next()
            .ok_or(EngineError::BluetoothUnavailable)?;
        Ok(Self {
            adapter: Some(adapter),
            connected: None,
        })
    }

    fn adapter(&self) -> EngineResult<&Adapter> {
        self.adapter.as_ref().ok_or(EngineError::BluetoothUnavailable)
    }

    async fn descriptor_of(peripheral: &Peripheral) -> Option<DeviceDescriptor> {
        let props = peripheral.properties().await.ok()??;
        Some(DeviceDescriptor {
            address: props.address.to_string(),
            name: props.local_name.unwrap_or_else(|| "PulseBand".to_string()),
            last_seen: epoch_now(),
            rssi: props.rssi,
        })
    }

    pub(crate) async fn scan(&mut self, duration: Duration) -> EngineResult<Vec<DeviceDescriptor>> {
        let adapter = self.adapter()?;
        let filter = ScanFilter {
            services: vec![BAND_SERVICE_UUID],
        };
        adapter
            .start_scan(filter)
            .await
            .map_err(|e| EngineError::ConnectionFailed {
                address: String::new(),
                reason: format!("scan failed: {e}"),
            })?;
        tokio::time::sleep(duration).await;
        let peripherals = adapter.peripherals().await.unwrap_or_default();
        let _ = adapter.stop_scan().await;

        let mut found = Vec::new();
        for peripheral in peripherals {
            if let Some(descriptor) = Self::descriptor_of(&peripheral).await {
                found.push(descriptor);
            }
        }
        Ok(found)
    }

    pub(crate) async fn connect(
        &mut self,
        address: &str,
        timeout: Duration,
    ) -> EngineResult<LinkSession> {
        let adapter = self.adapter()?;
        let peripherals = adapter.peripherals().await.unwrap_or_default();
        let mut target = None;
        for peripheral in peripherals {
            if let Some(descriptor) = Self::descriptor_of(&peripheral).await {
                if descriptor.address.eq_ignore_ascii_case(address) {
                    target = Some((peripheral, descriptor));
                    break;
                }
            }
        }
        let Some((peripheral, descriptor)) = target else {
            return Err(EngineError::DeviceNotFound {
                address: address.to_string(),
            });
        };

        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| EngineError::ConnectionTimeout {
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| EngineError::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| EngineError::ConnectionFailed {
                address: address.to_string(),
                reason: format!("service discovery failed: {e}"),
            })?;

        // Subscribe to every sensor characteristic the band exposes.
        let mut subscribed = 0usize;
        for characteristic in peripheral.characteristics() {
            if sensor_for_char(characteristic.uuid).is_some() {
                peripheral
                    .subscribe(&characteristic)
                    .await
                    .map_err(|e| EngineError::ConnectionFailed {
                        address: address.to_string(),
                        reason: format!("subscribe failed: {e}"),
                    })?;
                subscribed += 1;
            }
        }
        if subscribed == 0 {
            let _ = peripheral.disconnect().await;
            return Err(EngineError::ConnectionFailed {
                address: address.to_string(),
                reason: "band exposes no sensor characteristics".into(),
            });
        }

        let notifications =
            peripheral
                .notifications()
                .await
                .map_err(|e| EngineError::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;

        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
        tokio::spawn(pump(notifications, tx, stop.clone()));
        self.connected = Some(peripheral);

        Ok(LinkSession::new(descriptor, rx, stop))
    }

    pub(crate) async fn disconnect(&mut self) {
        if let Some(peripheral) = self.connected.take() {
            let _ = peripheral.disconnect().await;
        }
    }
}

/// Forward notifications until the stream ends or the session stops.
async fn pump(
    mut notifications: std::pin::Pin<
        Box<dyn futures_core::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    tx: mpsc::Sender<LinkEvent>,
    stop: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            () = stop.cancelled() => break,
            n = notifications.next() => n,
        };
        let Some(notification) = notification else {
            // Stream ended underneath us: the band went away.
            let _ = tx
                .send(LinkEvent::Lost {
                    reason: "unexpected_disconnect".into(),
                })
                .await;
            break;
        };
        let Some(sensor) = sensor_for_char(notification.uuid) else {
            continue;
        };
        let data = notification.value;
        if data.len() < 2 {
            continue;
        }
        let frame = RawFrame {
            sensor,
            seq: u16::from_be_bytes([data[0], data[1]]),
            payload: data[2..].to_vec(),
        };
        if tx.send(LinkEvent::Frame(frame)).await.is_err() {
            break;
        }
    }
}
