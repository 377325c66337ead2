// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
use crate::handlers;
use crate::relay::RelayHandler;
use crate::store::Store;
use crate::{metric_keys, AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parley_common::{ClientFrame, ServerFrame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

/// Create the full application router: REST API plus the relay endpoint.
pub fn create_router<S: Store + Clone>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .merge(handlers::api_routes::<S>())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for WebSocket connections
pub async fn ws_handler<S: Store + Clone>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection<S: Store + Clone>(socket: WebSocket, state: Arc<AppState<S>>) {
    counter!(metric_keys::RELAY_CONNECTION).increment(1);
    gauge!(metric_keys::RELAY_ACTIVE).increment(1.0);

    let (mut sink, mut stream) = socket.split();

    // Outbound frames funnel through one channel so the relay can hand
    // the sender to the registry for broadcasts and unicasts alike.
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(32);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable frame");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut handler = RelayHandler::new(state, tx.clone());

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handler.handle_frame(frame).await,
                Err(e) => {
                    let malformed = ServerFrame::Malformed {
                        err_msg: e.to_string(),
                    };
                    if tx.send(malformed).await.is_err() {
                        break;
                    }
                },
            },
            Message::Close(_) => break,
            _ => {}, // Ignore ping/pong/binary
        }
    }

    // Transport gone: same semantics as an explicit leave
    handler.handle_disconnect().await;

    gauge!(metric_keys::RELAY_ACTIVE).decrement(1.0);
    send_task.abort();
}
