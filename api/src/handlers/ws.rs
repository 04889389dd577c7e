use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use common::broadcast::{ConnectionRegistry, ConnectionSink};
use common::errors::BroadcastError;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::handlers::ErrorResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Control frames a client may send
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

/// Registry-side handle of one socket: its outbound queue plus a replacement signal
struct SocketSink {
    outbound: mpsc::Sender<String>,
    replaced: Arc<Notify>,
}

impl ConnectionSink for SocketSink {
    fn send(&self, message: &str) -> Result<(), BroadcastError> {
        ConnectionSink::send(&self.outbound, message)
    }

    fn close(&self) {
        self.replaced.notify_one();
    }
}

/// WebSocket endpoint: `GET /ws?token=<jwt>`
///
/// The token's subject becomes the connection identity. Invalid tokens are
/// rejected before the upgrade.
#[tracing::instrument(skip(ws, state, query))]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, ErrorResponse> {
    let token = query
        .token
        .ok_or_else(|| ErrorResponse::new("unauthorized", "Missing token query parameter"))?;
    let claims = state.jwt.decode_token(&token)?;

    tracing::info!(identity = %claims.sub, "WebSocket upgrade accepted");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, claims.sub, state)))
}

/// Drive one connection until either side goes away
#[tracing::instrument(skip(socket, state))]
async fn handle_socket(socket: WebSocket, identity: String, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.config.broadcast.outbound_buffer);
    let replaced = Arc::new(Notify::new());
    let socket_sink = SocketSink {
        outbound: tx.clone(),
        replaced: replaced.clone(),
    };
    let generation = state.connections.register(&identity, Arc::new(socket_sink)).await;

    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connections = state.connections.clone();
    let reader_identity = identity.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let reply =
                        handle_frame(&connections, &reader_identity, generation, &text).await;
                    if tx.try_send(reply.to_string()).is_err() {
                        tracing::warn!(identity = %reader_identity, "Outbound queue unavailable, reply dropped");
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(identity = %reader_identity, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    });

    let replaced_by_newer = tokio::select! {
        _ = &mut writer => {
            reader.abort();
            false
        }
        _ = &mut reader => {
            writer.abort();
            false
        }
        _ = replaced.notified() => true,
    };

    if replaced_by_newer {
        // Dropping the reader's sender drains and closes the writer
        tracing::info!("Connection replaced by a newer one for the same identity");
        reader.abort();
        let _ = writer.await;
    }

    state.connections.release(&identity, generation).await;
    tracing::info!("WebSocket connection closed");
}

/// Apply one client control frame for the connection `generation` and build the reply
pub(crate) async fn handle_frame(
    connections: &ConnectionRegistry,
    identity: &str,
    generation: u64,
    text: &str,
) -> Value {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return json!({ "type": "error", "message": format!("Invalid frame: {}", e) });
        }
    };

    match frame {
        ClientFrame::Subscribe { channel } if channel.trim().is_empty() => {
            json!({ "type": "error", "message": "channel must not be empty" })
        }
        ClientFrame::Subscribe { channel } => {
            if connections
                .subscribe_connection(identity, generation, &channel)
                .await
            {
                json!({ "type": "subscribed", "channel": channel })
            } else {
                json!({ "type": "error", "message": "connection is not registered" })
            }
        }
        ClientFrame::Unsubscribe { channel } => {
            match connections
                .unsubscribe_connection(identity, generation, &channel)
                .await
            {
                Some(was_subscribed) => json!({
                    "type": "unsubscribed",
                    "channel": channel,
                    "was_subscribed": was_subscribed
                }),
                None => json!({ "type": "error", "message": "connection is not registered" }),
            }
        }
        ClientFrame::Ping => json!({ "type": "pong" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registered(identity: &str) -> (ConnectionRegistry, u64, mpsc::Receiver<String>) {
        let connections = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let generation = connections.register(identity, Arc::new(tx)).await;
        (connections, generation, rx)
    }

    #[tokio::test]
    async fn test_subscribe_then_deliver() {
        let (connections, generation, mut rx) = registered("u1").await;

        let reply = handle_frame(&connections, "u1", generation, r#"{"type":"subscribe","channel":"home"}"#).await;
        assert_eq!(reply, json!({ "type": "subscribed", "channel": "home" }));
        assert_eq!(connections.deliver_to_channel("home", "hi").await, 1);
        assert_eq!(rx.recv().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (connections, generation, _rx) = registered("u1").await;
        handle_frame(&connections, "u1", generation, r#"{"type":"subscribe","channel":"home"}"#).await;

        let reply = handle_frame(&connections, "u1", generation, r#"{"type":"unsubscribe","channel":"home"}"#).await;
        assert_eq!(reply["type"], "unsubscribed");
        assert_eq!(reply["was_subscribed"], true);
        assert_eq!(connections.deliver_to_channel("home", "hi").await, 0);
    }

    #[tokio::test]
    async fn test_ping_and_invalid_frames() {
        let (connections, generation, _rx) = registered("u1").await;

        let reply = handle_frame(&connections, "u1", generation, r#"{"type":"ping"}"#).await;
        assert_eq!(reply, json!({ "type": "pong" }));

        let reply = handle_frame(&connections, "u1", generation, "not json").await;
        assert_eq!(reply["type"], "error");

        let reply = handle_frame(&connections, "u1", generation, r#"{"type":"subscribe","channel":"  "}"#).await;
        assert_eq!(reply["type"], "error");
    }

    #[tokio::test]
    async fn test_subscribe_without_registration_is_an_error() {
        let connections = ConnectionRegistry::new();
        let reply = handle_frame(&connections, "ghost", 1, r#"{"type":"subscribe","channel":"home"}"#).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(connections.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_frames_from_replaced_connection_are_rejected() {
        let connections = ConnectionRegistry::new();
        let (old_tx, _old_rx) = mpsc::channel(8);
        let old_replaced = Arc::new(Notify::new());
        let old = connections
            .register(
                "u1",
                Arc::new(SocketSink {
                    outbound: old_tx,
                    replaced: old_replaced.clone(),
                }),
            )
            .await;
        let (new_tx, mut new_rx) = mpsc::channel(8);
        let new = connections.register("u1", Arc::new(new_tx)).await;

        // the replaced socket was told to shut down
        tokio::time::timeout(std::time::Duration::from_secs(1), old_replaced.notified())
            .await
            .unwrap();

        let reply = handle_frame(&connections, "u1", old, r#"{"type":"subscribe","channel":"home"}"#).await;
        assert_eq!(reply["type"], "error");
        assert!(connections.channel_subscribers("home").await.is_empty());

        handle_frame(&connections, "u1", new, r#"{"type":"subscribe","channel":"news"}"#).await;
        let reply = handle_frame(&connections, "u1", old, r#"{"type":"unsubscribe","channel":"news"}"#).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(connections.subscriptions_of("u1").await, vec!["news".to_string()]);

        assert_eq!(connections.deliver_to_channel("news", "hi").await, 1);
        assert_eq!(new_rx.recv().await.unwrap(), "hi");
    }
}
