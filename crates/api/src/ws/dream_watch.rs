use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use fusion_core::types::DreamId;
use fusion_engine::DreamStream;

use crate::error::AppResult;
use crate::handlers::dreams::{parse_dream_id, DreamDto};
use crate::state::AppState;

/// GET /dreams/{id}/watch -- upgrade and stream snapshots of one dream.
///
/// Unknown ids are rejected before the upgrade, so clients get a plain 404.
pub async fn watch_dream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = parse_dream_id(&id)?;
    let snapshots = state.manager.watch(id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, id, snapshots)))
}

/// Send every snapshot as a JSON text frame and close after the terminal one.
///
/// Inbound frames are ignored apart from close; a client that goes away
/// ends the watch early.
async fn handle_socket(socket: WebSocket, state: AppState, id: DreamId, mut snapshots: DreamStream) {
    tracing::debug!(dream_id = %id, "Dream watch connected");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                let dto = DreamDto::from_dream(&state.manager, &snapshot);
                let text = match serde_json::to_string(&dto) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(dream_id = %id, error = %e, "Failed to encode dream snapshot");
                        break;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    tracing::debug!(dream_id = %id, "Dream watch sink closed");
                    return;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(dream_id = %id, "Dream watch closed by client");
                    return;
                }
                Some(Err(e)) => {
                    tracing::debug!(dream_id = %id, error = %e, "Dream watch receive error");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "dream ended".into(),
    }));
    if let Err(e) = sink.send(close).await {
        tracing::debug!(dream_id = %id, error = %e, "Failed to close dream watch");
    }
    tracing::debug!(dream_id = %id, "Dream watch finished");
}
