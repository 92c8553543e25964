use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, timeout, Duration};

use crate::{
    api::AppState,
    constants::{WS_CLIENT_TIMEOUT_SECS, WS_HEARTBEAT_INTERVAL_SECS},
    game::SessionEvent,
    models::{ChatEvent, RoundRecord},
    services::BlockMined,
};

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum StreamMessage {
    Connected { message: String },
    Session(SessionEvent),
    Round(RoundRecord),
    Chat(ChatEvent),
    Block(BlockMined),
}

enum Forward {
    Send(String),
    Skip,
    Stop,
}

fn connected_payload() -> String {
    serde_json::to_string(&StreamMessage::Connected {
        message: "Connected to event stream".to_string(),
    })
    .unwrap_or_default()
}

// Internal helper that turns one broadcast receive into a frame decision.
fn forward<T>(
    result: Result<T, RecvError>,
    kind: &str,
    wrap: impl FnOnce(T) -> StreamMessage,
) -> Forward {
    match result {
        Ok(item) => match serde_json::to_string(&wrap(item)) {
            Ok(json) => Forward::Send(json),
            Err(e) => {
                tracing::warn!("Failed to encode {} event: {}", kind, e);
                Forward::Skip
            }
        },
        Err(RecvError::Lagged(missed)) => {
            tracing::warn!("WebSocket client lagged; {} {} events dropped", missed, kind);
            Forward::Skip
        }
        Err(RecvError::Closed) => Forward::Stop,
    }
}

/// WebSocket stream of session, round, chat and block notifications
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let mut session_rx = state.session.subscribe_events();
    let mut block_rx = state.session.subscribe_blocks();
    let mut round_rx = state.rounds.read().await.subscribe();
    let mut chat_rx = state.chat.read().await.subscribe();

    if sender
        .send(Message::Text(connected_payload().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS));

        loop {
            let next = tokio::select! {
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
                result = session_rx.recv() => forward(result, "session", StreamMessage::Session),
                result = round_rx.recv() => forward(result, "round", StreamMessage::Round),
                result = chat_rx.recv() => forward(result, "chat", StreamMessage::Chat),
                result = block_rx.recv() => forward(result, "block", StreamMessage::Block),
            };
            match next {
                Forward::Send(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Forward::Skip => {}
                Forward::Stop => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        loop {
            let next_msg =
                timeout(Duration::from_secs(WS_CLIENT_TIMEOUT_SECS), receiver.next()).await;
            let msg = match next_msg {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {
                    tracing::info!("WebSocket client timeout");
                    break;
                }
            };

            match msg {
                Message::Close(_) => {
                    tracing::info!("Client disconnected");
                    break;
                }
                Message::Text(text) => tracing::debug!("Ignoring client message: {}", text),
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!("Event stream closed");
}
