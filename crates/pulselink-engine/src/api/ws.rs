//! `/ws`: a second view onto the same bus, mounted on the HTTP server.
//!
//! Registers clients into the identical subscriber registry as the
//! standalone endpoint, so subscriptions, fan-out, and the slow-consumer
//! policy behave the same on both.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use crate::api::AppState;
use crate::bus::{SLOW_CONSUMER_REASON, WsBus};

/// Upgrade handler for `GET /ws`.
pub async fn ws_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let bus = state.bus.clone();
    upgrade.on_upgrade(move |socket| run_socket(bus, socket))
}

async fn run_socket(bus: WsBus, socket: WebSocket) {
    let (mut sink, mut source) = socket.split();
    let client = bus.register();

    let writer = {
        let client = Arc::clone(&client);
        let bus = bus.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = client.closed.cancelled() => break,
                    frame = client.next_frame() => frame,
                };
                let Some(text) = frame else { break };
                let message = Message::Text(text.as_str().into());
                let delivered = tokio::select! {
                    () = client.closed.cancelled() => false,
                    result = sink.send(message) => result.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            if client.is_kicked() {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: SLOW_CONSUMER_REASON.into(),
                }));
                let _ = tokio::time::timeout(
                    std::time::Duration::from_millis(100),
                    sink.send(close),
                )
                .await;
                bus.unregister(client.id);
            }
        })
    };

    loop {
        let message = tokio::select! {
            () = client.closed.cancelled() => break,
            message = source.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => bus.handle_text(&client, text.as_str()).await,
            Some(Ok(Message::Close(_)) | Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    bus.unregister(client.id);
    writer.abort();
}
