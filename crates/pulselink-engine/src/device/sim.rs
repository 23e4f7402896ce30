//! Deterministic simulated band.
//!
//! Drives the whole engine without hardware: realistic-enough EEG, PPG,
//! accelerometer, and battery frames at nominal rates, plus scripting
//! hooks for the failure paths (refused connect, busy device, malformed
//! frames, unexpected link loss). Used by tests and by the daemon's
//! `--simulate` flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::device::frame::{
    ACC_FRAME_SAMPLES, EEG_FRAME_SAMPLES, PPG_FRAME_SAMPLES, RawFrame, encode_acc_payload,
    encode_eeg_payload, encode_ppg_payload,
};
use crate::device::link::{LINK_CHANNEL_DEPTH, LinkEvent, LinkSession};
use crate::error::{EngineError, EngineResult};
use crate::sample::{DeviceDescriptor, SensorKind, epoch_now};

/// Address the simulated band advertises.
pub const SIM_ADDRESS: &str = "AA:BB:CC:DD:EE:01";

/// Name the simulated band advertises.
pub const SIM_NAME: &str = "PulseBand S1";

/// Scripting hooks controlling the simulated band's behavior.
#[derive(Debug, Default)]
pub struct SimScript {
    /// Refuse the next connect with `ConnectionFailed`.
    pub refuse_connect: AtomicBool,
    /// Report the band as owned by another host.
    pub busy: AtomicBool,
    /// Emit this many malformed EEG frames before returning to normal.
    pub garbage_frames: AtomicU32,
    /// Skip this many EEG sequence numbers at the next opportunity.
    pub skip_eeg_frames: AtomicU32,
    kill: Notify,
}

impl SimScript {
    /// Sever the live link as if the band walked out of range.
    pub fn kill_link(&self) {
        self.kill.notify_waiters();
    }
}

/// The simulated transport backend.
pub struct SimLink {
    script: Arc<SimScript>,
    active: Option<CancellationToken>,
}

impl SimLink {
    #[must_use]
    pub fn new(script: Arc<SimScript>) -> Self {
        Self {
            script,
            active: None,
        }
    }

    /// The script handle shared with this link.
    #[must_use]
    pub fn script(&self) -> Arc<SimScript> {
        Arc::clone(&self.script)
    }

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            address: SIM_ADDRESS.to_string(),
            name: SIM_NAME.to_string(),
            last_seen: epoch_now(),
            rssi: Some(-58),
        }
    }

    pub(crate) async fn scan(&mut self, duration: Duration) -> EngineResult<Vec<DeviceDescriptor>> {
        tokio::time::sleep(duration).await;
        Ok(vec![Self::descriptor()])
    }

    pub(crate) async fn connect(
        &mut self,
        address: &str,
        timeout: Duration,
    ) -> EngineResult<LinkSession> {
        if address != SIM_ADDRESS {
            return Err(EngineError::DeviceNotFound {
                address: address.to_string(),
            });
        }
        if self.script.busy.load(Ordering::Relaxed) {
            return Err(EngineError::DeviceBusy);
        }
        if self.script.refuse_connect.load(Ordering::Relaxed) {
            return Err(EngineError::ConnectionFailed {
                address: address.to_string(),
                reason: "band refused the pairing request".into(),
            });
        }

        // Handshake takes a moment; honor the caller's deadline.
        let handshake = tokio::time::sleep(Duration::from_millis(20));
        if tokio::time::timeout(timeout, handshake).await.is_err() {
            return Err(EngineError::ConnectionTimeout {
                seconds: timeout.as_secs(),
            });
        }

        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
        tokio::spawn(pump(Arc::clone(&self.script), tx, stop.clone()));
        self.active = Some(stop.clone());

        Ok(LinkSession::new(Self::descriptor(), rx, stop))
    }

    pub(crate) async fn disconnect(&mut self) {
        if let Some(stop) = self.active.take() {
            stop.cancel();
        }
    }
}

/// Cheap deterministic noise source.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 16
    }

    /// Uniform value in `[-range, range]`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn jitter(&mut self, range: i32) -> i32 {
        let span = u64::from(range.unsigned_abs()) * 2 + 1;
        (self.next() % span) as i32 - range
    }
}

/// Frame generation loop for one connection.
#[allow(clippy::too_many_lines)]
async fn pump(
    script: Arc<SimScript>,
    tx: mpsc::Sender<LinkEvent>,
    stop: CancellationToken,
) {
    let mut eeg_interval = tokio::time::interval(Duration::from_millis(48));
    let mut ppg_interval = tokio::time::interval(Duration::from_millis(120));
    let mut acc_interval = tokio::time::interval(Duration::from_millis(100));
    let mut bat_interval = tokio::time::interval(Duration::from_millis(100));

    let mut eeg_seq: u16 = 0;
    let mut ppg_seq: u16 = 0;
    let mut acc_seq: u16 = 0;
    let mut bat_seq: u16 = 0;
    let mut eeg_sample_n: u64 = 0;
    let mut ppg_sample_n: u64 = 0;
    let mut noise = Lcg(0x5EED_CAFE);

    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => break,
            () = script.kill.notified() => {
                let _ = tx
                    .send(LinkEvent::Lost {
                        reason: "unexpected_disconnect".into(),
                    })
                    .await;
                break;
            }
            _ = eeg_interval.tick() => {
                if script.skip_eeg_frames.load(Ordering::Relaxed) > 0 {
                    let skip = script.skip_eeg_frames.swap(0, Ordering::Relaxed);
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        eeg_seq = eeg_seq.wrapping_add(skip as u16);
                    }
                    eeg_sample_n += u64::from(skip) * EEG_FRAME_SAMPLES as u64;
                }
                let payload = if script.garbage_frames.load(Ordering::Relaxed) > 0 {
                    script.garbage_frames.fetch_sub(1, Ordering::Relaxed);
                    vec![0xFF; 3]
                } else {
                    // 10 Hz alpha at ~30 µV on both channels plus noise.
                    let records: Vec<(i32, i32, u8)> = (0..EEG_FRAME_SAMPLES)
                        .map(|i| {
                            #[allow(clippy::cast_precision_loss)]
                            let t = (eeg_sample_n + i as u64) as f64 / 250.0;
                            let alpha = 1_342.0
                                * (2.0 * std::f64::consts::PI * 10.0 * t).sin();
                            #[allow(clippy::cast_possible_truncation)]
                            let base = alpha as i32;
                            (base + noise.jitter(90), base + noise.jitter(90), 0u8)
                        })
                        .collect();
                    eeg_sample_n += EEG_FRAME_SAMPLES as u64;
                    encode_eeg_payload(&records)
                };
                let frame = RawFrame { sensor: SensorKind::Eeg, seq: eeg_seq, payload };
                eeg_seq = eeg_seq.wrapping_add(1);
                frame
            }
            _ = ppg_interval.tick() => {
                // 72 bpm pulse train on both photodiodes.
                let records: Vec<(u32, u32)> = (0..PPG_FRAME_SAMPLES)
                    .map(|i| {
                        #[allow(clippy::cast_precision_loss)]
                        let t = (ppg_sample_n + i as u64) as f64 / 50.0;
                        let phase = (t * 1.2).fract();
                        let bump = (-((phase - 0.15) / 0.05).powi(2)).exp();
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        let ir = (92_000.0 + 5_500.0 * bump) as u32;
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        let red = (88_000.0 + 4_200.0 * bump) as u32;
                        (red, ir)
                    })
                    .collect();
                ppg_sample_n += PPG_FRAME_SAMPLES as u64;
                let frame = RawFrame {
                    sensor: SensorKind::Ppg,
                    seq: ppg_seq,
                    payload: encode_ppg_payload(&records),
                };
                ppg_seq = ppg_seq.wrapping_add(1);
                frame
            }
            _ = acc_interval.tick() => {
                // Wrist at rest: gravity on z, small tremor on x/y.
                let records: Vec<(i16, i16, i16)> = (0..ACC_FRAME_SAMPLES)
                    .map(|_| {
                        #[allow(clippy::cast_possible_truncation)]
                        let wobble = noise.jitter(60) as i16;
                        (wobble, -wobble, 8_192 + wobble / 2)
                    })
                    .collect();
                let frame = RawFrame {
                    sensor: SensorKind::Acc,
                    seq: acc_seq,
                    payload: encode_acc_payload(&records),
                };
                acc_seq = acc_seq.wrapping_add(1);
                frame
            }
            _ = bat_interval.tick() => {
                // Drains about one percent per five minutes.
                let level = 95u8.saturating_sub((u64::from(bat_seq) / 3000) as u8);
                let frame = RawFrame {
                    sensor: SensorKind::Battery,
                    seq: bat_seq,
                    payload: vec![level],
                };
                bat_seq = bat_seq.wrapping_add(1);
                frame
            }
        };

        if tx.send(LinkEvent::Frame(frame)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::link::Link;

    #[tokio::test]
    async fn test_scan_finds_the_band() {
        let mut link = Link::Sim(SimLink::new(Arc::new(SimScript::default())));
        let found = link.scan(Duration::from_millis(10)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, SIM_ADDRESS);
        assert!(found[0].rssi.is_some());
    }

    #[tokio::test]
    async fn test_zero_duration_scan_is_empty() {
        let mut link = Link::Sim(SimLink::new(Arc::new(SimScript::default())));
        let found = link.scan(Duration::ZERO).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_connect_unknown_address_fails() {
        let mut link = Link::Sim(SimLink::new(Arc::new(SimScript::default())));
        let err = link
            .connect("11:22:33:44:55:66", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_busy_band_reports_busy() {
        let script = Arc::new(SimScript::default());
        script.busy.store(true, Ordering::Relaxed);
        let mut link = Link::Sim(SimLink::new(script));
        let err = link
            .connect(SIM_ADDRESS, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DeviceBusy));
    }

    #[tokio::test]
    async fn test_connected_band_streams_frames() {
        let mut link = Link::Sim(SimLink::new(Arc::new(SimScript::default())));
        let mut session = link
            .connect(SIM_ADDRESS, Duration::from_secs(1))
            .await
            .unwrap();
        let mut saw_eeg = false;
        let mut saw_ppg = false;
        for _ in 0..40 {
            match session.events.recv().await {
                Some(LinkEvent::Frame(frame)) => match frame.sensor {
                    SensorKind::Eeg => saw_eeg = true,
                    SensorKind::Ppg => saw_ppg = true,
                    _ => {}
                },
                other => panic!("unexpected event {other:?}"),
            }
            if saw_eeg && saw_ppg {
                break;
            }
        }
        assert!(saw_eeg && saw_ppg);
        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_kill_link_emits_lost() {
        let script = Arc::new(SimScript::default());
        let mut link = Link::Sim(SimLink::new(Arc::clone(&script)));
        let mut session = link
            .connect(SIM_ADDRESS, Duration::from_secs(1))
            .await
            .unwrap();
        script.kill_link();
        let lost = loop {
            match session.events.recv().await {
                Some(LinkEvent::Lost { reason }) => break reason,
                Some(LinkEvent::Frame(_)) => continue,
                None => panic!("channel closed without Lost"),
            }
        };
        assert_eq!(lost, "unexpected_disconnect");
    }
}
