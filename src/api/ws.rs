//! WebSocket event stream: `/ws/stream`.
//!
//! On connect the server pushes a snapshot of the aggregate status, then
//! streams orchestrator events. A client may narrow the stream with an
//! initial `{"subscribe": ["task-completed", ...]}` frame; without one,
//! every event kind is delivered. Overflow notices (`events-dropped`)
//! always pass the filter.

use crate::api::routes::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    subscribe: Vec<String>,
}

pub async fn stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.orchestrator.events().subscribe();

    let status = state.orchestrator.status().await;
    let snapshot = serde_json::json!({ "event": "snapshot", "status": status });
    if socket
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut filter: Option<HashSet<String>> = None;
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(request) = serde_json::from_str::<SubscribeRequest>(text.as_str()) {
                            filter = Some(request.subscribe.into_iter().collect());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(kinds) = &filter {
                    if !kinds.contains(event.kind()) && event.kind() != "events-dropped" {
                        continue;
                    }
                }
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
