//! The wireless link abstraction.
//!
//! [`Link`] fronts the two transport backends: the real BLE band
//! (feature `ble`) and the deterministic simulator used by tests and
//! the daemon's `--simulate` mode. Backend selection is an enum rather
//! than a trait object so the async methods stay plain.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::device::frame::RawFrame;
use crate::device::sim::SimLink;
use crate::error::EngineResult;
use crate::sample::DeviceDescriptor;

#[cfg(feature = "ble")]
use crate::device::ble::BleLink;

/// Buffer depth of the frame channel between a link backend and the
/// adapter's decode task.
pub const LINK_CHANNEL_DEPTH: usize = 256;

/// What a connected link can deliver.
#[derive(Debug)]
pub enum LinkEvent {
    /// One raw frame from the band.
    Frame(RawFrame),
    /// The link dropped. Terminal; no more events follow.
    Lost { reason: String },
}

/// A live connection to one band.
///
/// Dropping the session (or cancelling its stop token) tears the
/// transport down; the event channel then closes after a final
/// [`LinkEvent::Lost`] if the loss was not requested.
#[derive(Debug)]
pub struct LinkSession {
    /// Descriptor of the connected device.
    pub device: DeviceDescriptor,
    /// Frame and lifecycle events, in arrival order.
    pub events: mpsc::Receiver<LinkEvent>,
    stop: CancellationToken,
}

impl LinkSession {
    #[must_use]
    pub fn new(
        device: DeviceDescriptor,
        events: mpsc::Receiver<LinkEvent>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            device,
            events,
            stop,
        }
    }

    /// Token that stops the backend's pump task when cancelled.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// One of the supported transport backends.
pub enum Link {
    /// Real band over Bluetooth LE.
    #[cfg(feature = "ble")]
    Ble(BleLink),
    /// Deterministic synthetic band.
    Sim(SimLink),
}

impl Link {
    /// Scan for nearby bands for `duration`. A zero duration returns
    /// immediately with an empty list.
    ///
    /// # Errors
    /// [`crate::error::EngineError::BluetoothUnavailable`] when the host
    /// radio stack is missing.
    pub async fn scan(&mut self, duration: Duration) -> EngineResult<Vec<DeviceDescriptor>> {
        if duration.is_zero() {
            return Ok(Vec::new());
        }
        match self {
            #[cfg(feature = "ble")]
            Link::Ble(ble) => ble.scan(duration).await,
            Link::Sim(sim) => sim.scan(duration).await,
        }
    }

    /// Connect to `address` and start the frame pump.
    ///
    /// # Errors
    /// `ConnectionFailed`, `DeviceBusy`, `DeviceNotFound`, or
    /// `ConnectionTimeout`.
    pub async fn connect(&mut self, address: &str, timeout: Duration) -> EngineResult<LinkSession> {
        match self {
            #[cfg(feature = "ble")]
            Link::Ble(ble) => ble.connect(address, timeout).await,
            Link::Sim(sim) => sim.connect(address, timeout).await,
        }
    }

    /// Tear down any live connection. Idempotent.
    pub async fn disconnect(&mut self) {
        match self {
            #[cfg(feature = "ble")]
            Link::Ble(ble) => ble.disconnect().await,
            Link::Sim(sim) => sim.disconnect().await,
        }
    }
}
