//! # HTTP Control Plane
//!
//! Thin axum surface over the coordinator, recorder, and store. All
//! handlers delegate; nothing here holds engine state. The `/ws` route
//! is a second view onto the WebSocket bus.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineHandle;
use crate::bus::WsBus;
use crate::error::EngineResult;
use crate::recorder::export::{ExportRequest, start_export};
use crate::recorder::store::{SessionFilter, SessionStore};
use crate::recorder::{SessionRecorder, StartRecording};
use crate::sample::epoch_now;

pub mod response;
pub mod ws;

use response::{api_message, api_ok};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub store: Arc<SessionStore>,
    pub recorder: Arc<SessionRecorder>,
    pub bus: WsBus,
}

/// Build the control-plane router.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/device/scan", get(device_scan))
        .route("/device/connect", post(device_connect))
        .route("/device/disconnect", delete(device_disconnect))
        .route("/device/status", get(device_status))
        .route("/stream/start", post(stream_start))
        .route("/stream/stop", post(stream_stop))
        .route("/stream/status", get(stream_status))
        .route("/data/start-recording", post(start_recording))
        .route("/data/stop-recording", post(stop_recording))
        .route("/data/recording-status", get(recording_status))
        .route("/data/sessions", get(list_sessions))
        .route(
            "/data/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/data/sessions/{id}/export", post(export_session))
        .route("/data/exports/{id}", get(get_export))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve the router until cancelled.
///
/// # Errors
/// Propagates bind/serve failures.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP control plane listening");
    }
    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

// ─── Device ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ScanQuery {
    #[serde(default, alias = "duration")]
    duration_s: Option<u64>,
}

async fn device_scan(
    State(state): State<AppState>,
    Query(query): Query<ScanQuery>,
) -> EngineResult<Response> {
    let devices = state
        .engine
        .scan(query.duration_s.map(Duration::from_secs))
        .await?;
    Ok(api_ok(devices))
}

#[derive(Deserialize)]
struct ConnectBody {
    address: String,
    #[serde(default, alias = "timeout")]
    timeout_s: Option<u64>,
    #[serde(default)]
    auto_reconnect: Option<bool>,
}

async fn device_connect(
    State(state): State<AppState>,
    Json(body): Json<ConnectBody>,
) -> EngineResult<Response> {
    let device = state
        .engine
        .connect(
            body.address,
            body.timeout_s.map(Duration::from_secs),
            body.auto_reconnect,
        )
        .await?;
    Ok(api_ok(device))
}

async fn device_disconnect(State(state): State<AppState>) -> EngineResult<Response> {
    state.engine.disconnect().await?;
    Ok(api_message("disconnected"))
}

async fn device_status(State(state): State<AppState>) -> EngineResult<Response> {
    Ok(api_ok(state.engine.status().await?))
}

// ─── Streaming ──────────────────────────────────────────────────────

async fn stream_start(State(state): State<AppState>) -> EngineResult<Response> {
    state.engine.start_streaming().await?;
    Ok(api_message("streaming started"))
}

async fn stream_stop(State(state): State<AppState>) -> EngineResult<Response> {
    state.engine.stop_streaming().await?;
    Ok(api_message("streaming stopped"))
}

async fn stream_status(State(state): State<AppState>) -> EngineResult<Response> {
    Ok(api_ok(state.engine.status().await?))
}

// ─── Recording ──────────────────────────────────────────────────────

async fn start_recording(
    State(state): State<AppState>,
    Json(request): Json<StartRecording>,
) -> EngineResult<Response> {
    let row = state.engine.start_recording(request).await?;
    Ok(api_ok(row))
}

#[derive(Deserialize)]
struct StopRecordingBody {
    #[serde(default)]
    session_id: Option<String>,
}

async fn stop_recording(
    State(state): State<AppState>,
    Json(body): Json<StopRecordingBody>,
) -> EngineResult<Response> {
    let summary = state.engine.stop_recording(body.session_id).await?;
    Ok(api_ok(summary))
}

async fn recording_status(State(state): State<AppState>) -> EngineResult<Response> {
    Ok(api_ok(state.recorder.status()))
}

// ─── Sessions ───────────────────────────────────────────────────────

async fn list_sessions(
    State(state): State<AppState>,
    Query(filter): Query<SessionFilter>,
) -> EngineResult<Response> {
    Ok(api_ok(state.store.list_sessions(&filter)?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Response> {
    let session = state.store.get_session(&id)?;
    let files = state.store.files_for(&id)?;
    Ok(api_ok(serde_json::json!({
        "session": session,
        "files": files,
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Response> {
    state.recorder.delete_session(&id).await?;
    Ok(api_message("session deleted"))
}

async fn export_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExportRequest>,
) -> EngineResult<Response> {
    let row = start_export(Arc::clone(&state.store), &id, request)?;
    Ok(api_ok(row))
}

async fn get_export(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Response> {
    Ok(api_ok(state.store.get_export(&id)?))
}

// ─── Host metrics ───────────────────────────────────────────────────

async fn metrics() -> Response {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.refresh_cpu_usage();
    let (cpu, ram_mb) = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| {
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            system
                .process(pid)
                .map(|p| (p.cpu_usage(), p.memory() / (1024 * 1024)))
        })
        .unwrap_or((0.0, 0));
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let disk_mb = disks
        .iter()
        .map(|d| d.available_space() / (1024 * 1024))
        .max()
        .unwrap_or(0);
    api_ok(serde_json::json!({
        "cpu": cpu,
        "ram_mb": ram_mb,
        "disk_mb": disk_mb,
        "ts": epoch_now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::link::Link;
    use crate::device::sim::{SimLink, SimScript};
    use crate::engine::Engine;

    async fn test_state(dir: &std::path::Path) -> AppState {
        let mut config = EngineConfig::default();
        config.data_dir = dir.to_path_buf();
        config.min_free_disk_mb = 0;
        config.auto_reconnect = false;
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let bus = WsBus::new(config.client_send_queue_len, config.slow_consumer_lag_threshold);
        let link = Link::Sim(SimLink::new(Arc::new(SimScript::default())));
        let (engine, recorder, _task) = Engine::spawn(
            config,
            link,
            Arc::clone(&store),
            bus.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        AppState {
            engine,
            store,
            recorder,
            bus,
        }
    }

    async fn get_json(addr: std::net::SocketAddr, path: &str) -> serde_json::Value {
        let body = plain_request(addr, "GET", path, None).await;
        serde_json::from_str(&body).unwrap()
    }

    /// Tiny HTTP/1.1 client; enough for handler smoke tests without
    /// another dev dependency.
    async fn plain_request(
        addr: std::net::SocketAddr,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let payload = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nhost: {addr}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
            payload.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_device_status_and_scan_routes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(state, listener, cancel.clone()));

        let status = get_json(addr, "/device/status").await;
        assert_eq!(status["success"], true);
        assert_eq!(status["data"]["device_state"], "idle");

        let scanned = get_json(addr, "/device/scan?duration_s=1").await;
        assert_eq!(scanned["success"], true);
        assert_eq!(scanned["data"][0]["address"], "AA:BB:CC:DD:EE:01");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stream_start_without_device_is_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(state, listener, cancel.clone()));

        let body = plain_request(addr, "POST", "/stream/start", Some("{}")).await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "INVALID_SETTINGS");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_metrics_route_shape() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(state, listener, cancel.clone()));

        let value = get_json(addr, "/metrics").await;
        assert_eq!(value["success"], true);
        assert!(value["data"]["ts"].as_f64().unwrap() > 0.0);
        assert!(value["data"]["ram_mb"].is_u64());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_session_is_404_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(state, listener, cancel.clone()));

        let value = get_json(addr, "/data/sessions/not-a-session").await;
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "SESSION_NOT_FOUND");
        cancel.cancel();
    }
}
