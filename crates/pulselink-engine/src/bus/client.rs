//! Standalone WebSocket endpoint: acceptor plus per-client reader and
//! writer tasks over `tokio-tungstenite`.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use crate::bus::{SLOW_CONSUMER_REASON, WsBus};

/// Accept connections until cancelled. One reader and one writer task
/// per client.
pub async fn serve(bus: WsBus, listener: TcpListener, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "WebSocket bus listening");
    }
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Incoming WebSocket connection");
                let bus = bus.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_connection(bus, stream, cancel).await {
                        tracing::debug!(error = %e, "WebSocket connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
            }
        }
    }
    tracing::info!("WebSocket bus acceptor stopped");
}

async fn run_connection(
    bus: WsBus,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let client = bus.register();

    // Writer: drains the client's send queue onto the socket. A send
    // stalled on a full socket is raced against the client's lifecycle
    // token, so a slow-consumer kick always gets through.
    let writer = {
        let client = Arc::clone(&client);
        let bus = bus.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break,
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
                // Best effort; the socket may already be jammed.
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
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

    // Reader: parses frames and feeds the command handler.
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Channel, Envelope};
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn start_bus() -> (WsBus, String, CancellationToken) {
        let bus = WsBus::new(16, 8);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(bus.clone(), listener, cancel.clone()));
        (bus, format!("ws://{addr}"), cancel)
    }

    #[tokio::test]
    async fn test_client_gets_greeting_then_pong() {
        let (_bus, url, cancel) = start_bus().await;
        let (mut ws, _) = connect_async(&url).await.unwrap();

        let greeting = ws.next().await.unwrap().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(greeting.to_text().unwrap()).unwrap();
        assert_eq!(value["data"]["event"], "connected");
        assert!(value["data"]["server_version"].is_string());

        ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert!(reply.to_text().unwrap().contains("pong"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_subscription_isolation_between_clients() {
        let (bus, url, cancel) = start_bus().await;
        let (mut a, _) = connect_async(&url).await.unwrap();
        let (mut b, _) = connect_async(&url).await.unwrap();

        // Drain greetings.
        let _ = a.next().await;
        let _ = b.next().await;

        a.send(Message::Text(
            r#"{"type":"subscribe","channel":"processed_eeg"}"#.into(),
        ))
        .await
        .unwrap();
        b.send(Message::Text(
            r#"{"type":"subscribe","channel":"processed_ppg"}"#.into(),
        ))
        .await
        .unwrap();
        let _ = a.next().await; // confirmation
        let _ = b.next().await; // confirmation

        bus.publish(
            Channel::ProcessedEeg,
            &Envelope::processed(Channel::ProcessedEeg, serde_json::json!({"n": 1})),
        );
        bus.publish(
            Channel::ProcessedPpg,
            &Envelope::processed(Channel::ProcessedPpg, serde_json::json!({"n": 2})),
        );

        let got_a = a.next().await.unwrap().unwrap();
        let value_a: serde_json::Value =
            serde_json::from_str(got_a.to_text().unwrap()).unwrap();
        assert_eq!(value_a["channel"], "processed_eeg");

        let got_b = b.next().await.unwrap().unwrap();
        let value_b: serde_json::Value =
            serde_json::from_str(got_b.to_text().unwrap()).unwrap();
        assert_eq!(value_b["channel"], "processed_ppg");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_slow_consumer_is_disconnected() {
        let (bus, url, cancel) = start_bus().await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        let _ = ws.next().await; // greeting

        ws.send(Message::Text(
            r#"{"type":"subscribe","channel":"battery"}"#.into(),
        ))
        .await
        .unwrap();
        let _ = ws.next().await; // confirmation

        // Stop reading entirely. Large frames jam the socket buffers,
        // the writer stalls, the queue overflows past the lag
        // threshold, and the client must be dropped from the registry.
        let padding = "x".repeat(32 * 1024);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "slow consumer still connected"
            );
            bus.publish(
                Channel::Battery,
                &Envelope::raw(
                    Channel::Battery,
                    serde_json::json!({"pad": padding.as_str()}),
                ),
            );
            if bus.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    }
}
