use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::api::{ApiError, SharedState};
use crate::pipeline::board::{BoardSnapshot, BoardUpdate, PipelineBoard};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

/// Server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    Snapshot { snapshot: BoardSnapshot },
    Update { update: BoardUpdate },
    Error { message: String },
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    SwitchView { view: String },
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub view: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> Response {
    if state.view(&params.view).is_none() {
        return ApiError::NotFound(format!("Board view '{}' not found", params.view))
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.view))
}

async fn handle_socket(socket: WebSocket, state: SharedState, view: String) {
    let (mut sender, receiver) = socket.split();
    let mut board = state.services.board();
    if !open_view(&mut sender, &mut board, &state, &view).await {
        let _ = sender.send(Message::Close(None)).await;
        return;
    }
    tracing::debug!(view = %view, "Board connection opened");
    run_socket_loop(sender, receiver, board, state).await;
}

/// Open `name` on the board and push its snapshot. `false` when the socket
/// should be dropped.
async fn open_view(
    sender: &mut SplitSink<WebSocket, Message>,
    board: &mut PipelineBoard,
    state: &SharedState,
    name: &str,
) -> bool {
    let Some(view) = state.view(name).cloned() else {
        return send(
            sender,
            &WsMessage::Error {
                message: format!("Board view '{}' not found", name),
            },
        )
        .await;
    };
    match board.open(view).await {
        Ok(snapshot) => send(sender, &WsMessage::Snapshot { snapshot }).await,
        Err(err) => {
            tracing::warn!(view = %name, error = %err, "Failed to open board view");
            send(
                sender,
                &WsMessage::Error {
                    message: err.to_string(),
                },
            )
            .await
        }
    }
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            tracing::error!(error = %err, "Failed to serialize board message");
            true
        }
    }
}

/// Board feed plus client messages plus ping/pong keepalive in one select
/// loop. A connection with no Pong within [`PONG_TIMEOUT`] of a Ping is
/// dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut board: PipelineBoard,
    state: SharedState,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Board feed (parked while no feed is attached) ──────
            event = board.next_event(), if board.is_live() => {
                let Some(event) = event else { break };
                let outgoing = match board.apply(event).await {
                    Ok(Some(update)) => WsMessage::Update { update },
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "Board update failed");
                        WsMessage::Error { message: err.to_string() }
                    }
                };
                if !send(&mut sender, &outgoing).await {
                    break;
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let keep = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::SwitchView { view }) => {
                                open_view(&mut sender, &mut board, &state, &view).await
                            }
                            Err(err) => {
                                send(&mut sender, &WsMessage::Error {
                                    message: format!("Invalid message: {}", err),
                                }).await
                            }
                        };
                        if !keep {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    board.close();
    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::board::{BoardView, ColumnCounts};
    use trilha_common::StageKey;

    #[test]
    fn test_switch_view_deserialization() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"SwitchView","view":"encerramento"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SwitchView {
                view: "encerramento".into()
            }
        );
    }

    #[test]
    fn test_unknown_client_message_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"Subscribe"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_update_serialization() {
        let mut counts = ColumnCounts::new();
        counts.insert(StageKey::IntakeDocuments, 0);
        let msg = WsMessage::Update {
            update: BoardUpdate::CardRemoved {
                column: StageKey::IntakeDocuments,
                case_id: "c1".into(),
                counts,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Update");
        assert_eq!(json["data"]["update"]["type"], "CardRemoved");
        assert_eq!(json["data"]["update"]["data"]["case_id"], "c1");
        assert_eq!(
            json["data"]["update"]["data"]["counts"]["intake-documents"],
            0
        );
    }

    #[test]
    fn test_snapshot_serialization() {
        let view = BoardView::presets().remove(0);
        let msg = WsMessage::Snapshot {
            snapshot: BoardSnapshot {
                view,
                columns: Vec::new(),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Snapshot");
        assert_eq!(json["data"]["snapshot"]["view"]["name"], "entrada");
    }

    #[test]
    fn test_error_serialization() {
        let msg = WsMessage::Error {
            message: "boom".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Error","data":{"message":"boom"}}"#);
    }
}
