//! WebSocket push transport: one broadcaster subscriber per connection.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use imf_runtime::EventBroadcaster;
use imf_runtime::events::ChannelTransport;

use super::AppState;

/// Buffer between the subscriber's delivery task and the socket writer.
/// Backpressure beyond this is absorbed by the subscriber queue.
const SOCKET_BUFFER: usize = 16;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let broadcaster = state.orchestrator().broadcaster().clone();
    ws.on_upgrade(move |socket| serve(socket, broadcaster))
}

async fn serve(socket: WebSocket, broadcaster: EventBroadcaster) {
    let (transport, mut events) = ChannelTransport::pair(SOCKET_BUFFER);
    let subscription = broadcaster.subscribe(Arc::new(transport));
    let subscriber = subscription.id();
    tracing::info!(subscriber, "websocket client connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Broadcaster detached us (shutdown or delivery failure).
                    if sink.send(Message::Close(None)).await.is_err() {
                        tracing::debug!(subscriber, "close frame not delivered");
                    }
                    break;
                };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(subscriber, kind = %event.kind(), error = %e, "failed to encode event");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!(subscriber, error = %e, "websocket send failed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(subscriber, error = %e, "websocket receive failed");
                    break;
                }
            },
        }
    }

    subscription.unsubscribe();
    tracing::info!(subscriber, "websocket client disconnected");
}
