use crate::api::ApiError;
use crate::config::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use testflow_core::types::RunId;

/// Upgrade `GET /api/v2/workflows/runs/{run_id}/stream` to a WebSocket
/// carrying the run's events as JSON text frames
pub async fn stream_run(
    ws: WebSocketUpgrade,
    Path(run_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let run_id: RunId = run_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid run id '{run_id}'")))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, run_id)))
}

/// Forward hub events to the socket until either side goes away.
/// Incoming client frames are drained and ignored. If this consumer
/// falls behind, the hub evicts it and the event stream simply ends.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, run_id: RunId) {
    let subscription = state.hub.subscribe(&run_id).await;
    let subscription_id = subscription.id;
    let mut events = subscription.receiver;

    tracing::info!("websocket subscribed to run {}", run_id);

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unsubscribe(&run_id, subscription_id).await;
    tracing::info!("websocket stream closed for run {}", run_id);
}
