//! End-to-end engine scenarios over the simulated band: full lifecycle
//! recording, device loss mid-recording, decode-fault tolerance,
//! subscription isolation, and the export round trip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use pulselink_engine::bus::{WsBus, client as bus_client};
use pulselink_engine::config::EngineConfig;
use pulselink_engine::device::link::Link;
use pulselink_engine::device::sim::{SIM_ADDRESS, SimLink, SimScript};
use pulselink_engine::engine::{Engine, EngineHandle};
use pulselink_engine::recorder::store::{ExportStatus, SessionStatus, SessionStore};
use pulselink_engine::recorder::{SessionRecorder, StartRecording};
use pulselink_engine::recorder::export::{ExportRequest, start_export};
use pulselink_engine::sample::SensorKind;

struct TestEngine {
    engine: EngineHandle,
    recorder: Arc<SessionRecorder>,
    store: Arc<SessionStore>,
    script: Arc<SimScript>,
    ws_url: String,
    cancel: CancellationToken,
    _data_dir: tempfile::TempDir,
}

async fn start_engine() -> TestEngine {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.data_dir = data_dir.path().to_path_buf();
    config.min_free_disk_mb = 0;
    config.auto_reconnect = false;

    let script = Arc::new(SimScript::default());
    let link = Link::Sim(SimLink::new(Arc::clone(&script)));
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let bus = WsBus::new(
        config.client_send_queue_len,
        config.slow_consumer_lag_threshold,
    );
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(bus_client::serve(
        bus.clone(),
        listener,
        cancel.child_token(),
    ));

    let (engine, recorder, _task) = Engine::spawn(
        config,
        link,
        Arc::clone(&store),
        bus,
        cancel.child_token(),
    )
    .unwrap();

    TestEngine {
        engine,
        recorder,
        store,
        script,
        ws_url: format!("ws://{addr}"),
        cancel,
        _data_dir: data_dir,
    }
}

/// Subscribe a client and collect everything it receives.
async fn subscribe_collecting(
    ws_url: &str,
    channel: &str,
) -> Arc<Mutex<Vec<serde_json::Value>>> {
    let (mut ws, _) = connect_async(ws_url).await.unwrap();
    let _ = ws.next().await; // greeting
    ws.send(Message::Text(
        format!(r#"{{"type":"subscribe","channel":"{channel}"}}"#).into(),
    ))
    .await
    .unwrap();
    let _ = ws.next().await; // confirmation

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    tokio::spawn(async move {
        while let Some(Ok(message)) = ws.next().await {
            if let Ok(text) = message.to_text() {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                    sink.lock().unwrap().push(value);
                }
            }
        }
    });
    received
}

#[tokio::test]
async fn test_happy_path_recording() {
    let rig = start_engine().await;

    let found = rig
        .engine
        .scan(Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(found[0].address, SIM_ADDRESS);

    rig.engine
        .connect(SIM_ADDRESS.to_string(), None, None)
        .await
        .unwrap();
    rig.engine.start_streaming().await.unwrap();

    let client_a = subscribe_collecting(&rig.ws_url, "processed_eeg").await;
    let client_b = subscribe_collecting(&rig.ws_url, "processed_eeg").await;

    let row = rig
        .engine
        .start_recording(StartRecording {
            session_name: "T1".into(),
            participant_id: None,
            condition: None,
            sensors: vec![],
            notes: None,
            tags: vec![],
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3200)).await;

    let summary = rig
        .engine
        .stop_recording(Some(row.id.clone()))
        .await
        .unwrap();
    rig.engine.stop_streaming().await.unwrap();
    rig.engine.disconnect().await.unwrap();

    assert_eq!(summary.status, SessionStatus::Completed);
    assert!(
        (2.5..5.0).contains(&summary.duration_s),
        "duration {}",
        summary.duration_s
    );
    assert!(summary.sample_counts.get("eeg").copied().unwrap_or(0) > 0);

    // Both subscribers saw the 2 Hz processed EEG cadence.
    for client in [&client_a, &client_b] {
        let count = client
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m["channel"] == "processed_eeg")
            .count();
        assert!(count >= 6, "subscriber saw only {count} processed windows");
    }

    // The raw EEG file is non-empty and listed in the store.
    let session = rig.store.get_session(&row.id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let files = rig.store.files_for(&row.id).unwrap();
    let eeg_raw = files
        .iter()
        .find(|f| f.sensor == "eeg" && f.data_type == "raw")
        .expect("eeg raw file row");
    assert!(eeg_raw.size_bytes > 0);
    assert!(session.root_dir.join(&eeg_raw.filename).exists());

    rig.cancel.cancel();
}

#[tokio::test]
async fn test_device_loss_mid_recording_fails_session() {
    let rig = start_engine().await;
    rig.engine
        .connect(SIM_ADDRESS.to_string(), None, None)
        .await
        .unwrap();
    rig.engine.start_streaming().await.unwrap();

    let events = subscribe_collecting(&rig.ws_url, "device_info").await;

    let row = rig
        .engine
        .start_recording(StartRecording {
            session_name: "doomed".into(),
            participant_id: None,
            condition: None,
            sensors: vec![],
            notes: None,
            tags: vec![],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    rig.script.kill_link();

    // The coordinator seals the session and broadcasts device_info.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never sealed"
        );
        let session = rig.store.get_session(&row.id).unwrap();
        if session.status == SessionStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let saw_unexpected = events.lock().unwrap().iter().any(|m| {
        m["channel"] == "device_info" && m["data"]["reason"] == "unexpected_disconnect"
    });
    assert!(saw_unexpected, "no unexpected_disconnect device_info event");

    // Streaming tore down cleanly; the engine still answers.
    let status = rig.engine.status().await.unwrap();
    assert!(!status.streaming);

    // Files exist for forensics.
    let session = rig.store.get_session(&row.id).unwrap();
    assert!(session.root_dir.join("meta.json").exists());

    rig.cancel.cancel();
}

#[tokio::test]
async fn test_decode_faults_do_not_stop_the_engine() {
    let rig = start_engine().await;
    rig.engine
        .connect(SIM_ADDRESS.to_string(), None, None)
        .await
        .unwrap();
    rig.engine.start_streaming().await.unwrap();

    // A handful of malformed frames: counted, dropped, link survives.
    rig.script
        .garbage_frames
        .store(5, std::sync::atomic::Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(800)).await;

    let status = rig.engine.status().await.unwrap();
    assert!(status.streaming);
    assert_eq!(status.device_state.as_str(), "connected");

    rig.cancel.cancel();
}

#[tokio::test]
async fn test_subscription_isolation() {
    let rig = start_engine().await;
    rig.engine
        .connect(SIM_ADDRESS.to_string(), None, None)
        .await
        .unwrap();
    rig.engine.start_streaming().await.unwrap();

    let eeg_client = subscribe_collecting(&rig.ws_url, "processed_eeg").await;
    let ppg_client = subscribe_collecting(&rig.ws_url, "processed_ppg").await;

    tokio::time::sleep(Duration::from_millis(1600)).await;

    let eeg_messages = eeg_client.lock().unwrap().clone();
    let ppg_messages = ppg_client.lock().unwrap().clone();
    assert!(!eeg_messages.is_empty());
    assert!(!ppg_messages.is_empty());
    assert!(
        eeg_messages.iter().all(|m| m["channel"] == "processed_eeg"),
        "eeg subscriber saw foreign channels"
    );
    assert!(
        ppg_messages.iter().all(|m| m["channel"] == "processed_ppg"),
        "ppg subscriber saw foreign channels"
    );

    rig.cancel.cancel();
}

#[tokio::test]
async fn test_export_round_trip_csv() {
    let rig = start_engine().await;
    rig.engine
        .connect(SIM_ADDRESS.to_string(), None, None)
        .await
        .unwrap();
    rig.engine.start_streaming().await.unwrap();

    let row = rig
        .engine
        .start_recording(StartRecording {
            session_name: "export-me".into(),
            participant_id: None,
            condition: None,
            sensors: vec![SensorKind::Eeg],
            notes: None,
            tags: vec![],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let summary = rig.engine.stop_recording(Some(row.id.clone())).await.unwrap();
    let eeg_samples = summary.sample_counts.get("eeg").copied().unwrap();
    assert!(eeg_samples > 0);

    let export = start_export(
        Arc::clone(&rig.store),
        &row.id,
        ExportRequest {
            format: "csv".into(),
            sensors: vec![SensorKind::Eeg],
            data_types: vec![pulselink_engine::recorder::DataType::Raw],
            time_range: None,
            compression: None,
        },
    )
    .unwrap();

    let finished = {
        let mut last = None;
        for _ in 0..100 {
            let current = rig.store.get_export(&export.id).unwrap();
            if matches!(
                current.status,
                ExportStatus::Completed | ExportStatus::Failed
            ) {
                last = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        last.expect("export never finished")
    };
    assert_eq!(finished.status, ExportStatus::Completed);

    let content = std::fs::read_to_string(finished.file_path.unwrap()).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some("timestamp,CH1,CH2"));
    assert_eq!(lines.count() as u64, eeg_samples);

    rig.cancel.cancel();
}

#[tokio::test]
async fn test_stop_recording_is_idempotent_across_the_engine() {
    let rig = start_engine().await;
    rig.engine
        .connect(SIM_ADDRESS.to_string(), None, None)
        .await
        .unwrap();
    rig.engine.start_streaming().await.unwrap();
    let row = rig
        .engine
        .start_recording(StartRecording {
            session_name: "twice".into(),
            participant_id: None,
            condition: None,
            sensors: vec![],
            notes: None,
            tags: vec![],
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let first = rig.engine.stop_recording(Some(row.id.clone())).await.unwrap();
    let second = rig.engine.stop_recording(Some(row.id)).await.unwrap();
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(first.status, second.status);
    assert_eq!(first.total_bytes, second.total_bytes);

    rig.cancel.cancel();
}

#[tokio::test]
async fn test_recording_requires_streaming() {
    let rig = start_engine().await;
    rig.engine
        .connect(SIM_ADDRESS.to_string(), None, None)
        .await
        .unwrap();

    let err = rig
        .engine
        .start_recording(StartRecording {
            session_name: "early".into(),
            participant_id: None,
            condition: None,
            sensors: vec![],
            notes: None,
            tags: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        pulselink_engine::EngineError::NotStreaming
    ));
    assert!(rig.recorder.active_session().is_none());

    rig.cancel.cancel();
}

#[tokio::test]
async fn test_disconnect_when_disconnected_is_noop_success() {
    let rig = start_engine().await;
    rig.engine.disconnect().await.unwrap();
    rig.engine.disconnect().await.unwrap();
    let status = rig.engine.status().await.unwrap();
    assert_eq!(status.device_state.as_str(), "idle");
    rig.cancel.cancel();
}
