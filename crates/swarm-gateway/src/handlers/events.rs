//! The bidirectional event stream.
//!
//! The client opens a WebSocket, sends `{"subscribe": [room, ...]}`, and
//! receives `{room, seq, event}` frames plus periodic `{ping}` frames. A
//! client that neither pongs nor sends anything within the pong window is
//! disconnected; a client whose buffer stalls is dropped by the bus, which
//! closes the stream.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use swarm_bus::{EventBus, Room};
use tokio::time::Instant;

use crate::state::AppState;

/// Messages a client may send.
#[derive(Debug, Default, Deserialize)]
struct ClientMessage {
    /// Replace the subscription with these rooms.
    #[serde(default)]
    subscribe: Option<Vec<String>>,
    /// Keepalive answer.
    #[serde(default)]
    pong: Option<bool>,
}

/// `GET /v1/events/ws` — upgrade to the event stream.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let bus = state.bus.clone();
    let pong_window = state.config.pong_window();
    ws.on_upgrade(move |socket| run_stream(socket, bus, pong_window))
}

fn parse_rooms(raw: &[String]) -> Vec<Room> {
    raw.iter()
        .filter_map(|name| match name.parse() {
            Ok(room) => Some(room),
            Err(_) => {
                tracing::debug!(room = %name, "Ignoring unparsable room");
                None
            }
        })
        .collect()
}

async fn run_stream(mut socket: WebSocket, bus: EventBus, pong_window: std::time::Duration) {
    // The first message must subscribe; nothing is delivered before that.
    let rooms = loop {
        match tokio::time::timeout(pong_window, socket.recv()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Ok(message) = serde_json::from_str::<ClientMessage>(text.as_str()) {
                    if let Some(raw) = message.subscribe {
                        break parse_rooms(&raw);
                    }
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => return,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) => return,
        }
    };

    let mut subscription = bus.subscribe(&rooms);
    let token = subscription.token;
    let mut last_activity = Instant::now();
    let mut pong_check = tokio::time::interval(pong_window);
    pong_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    pong_check.reset();

    tracing::info!(rooms = rooms.len(), "Event stream subscribed");

    loop {
        tokio::select! {
            frame = subscription.receiver.recv() => {
                match frame {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Dropped by the bus (stalled buffer or shutdown).
                    None => {
                        tracing::debug!("Bus closed the subscription");
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        if let Ok(message) = serde_json::from_str::<ClientMessage>(text.as_str()) {
                            if let Some(raw) = message.subscribe {
                                // Replace the subscription in place.
                                bus.unsubscribe(subscription.token);
                                subscription = bus.subscribe(&parse_rooms(&raw));
                            } else if message.pong.is_some() {
                                // Already counted as activity.
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = pong_check.tick() => {
                if last_activity.elapsed() > pong_window {
                    tracing::debug!("Client missed the pong window; disconnecting");
                    break;
                }
            }
        }
    }

    bus.unsubscribe(subscription.token);
    // The token may have been replaced; the original is idempotent to
    // unsubscribe again.
    bus.unsubscribe(token);
    let _ = socket.send(Message::Close(None)).await;
}
