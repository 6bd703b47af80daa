//! Preview WebSocket endpoint and the state-broadcast sink.

use std::sync::{Arc, OnceLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use framecast_stream::manager::{StateBroadcast, StreamState};
use framecast_stream::preview::{parse_control, ControlMessage, PreviewDistributor, Quality};
use framecast_stream::StreamManager;

/// State sink that forwards stream-state snapshots to preview clients
/// as out-of-band updates. The distributor is attached after manager
/// initialization (it is created inside the manager).
pub struct PreviewStateBroadcast {
    preview: OnceLock<Arc<PreviewDistributor>>,
}

impl Default for PreviewStateBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewStateBroadcast {
    #[must_use]
    pub fn new() -> Self {
        Self {
            preview: OnceLock::new(),
        }
    }

    pub fn attach(&self, preview: Arc<PreviewDistributor>) {
        let _ = self.preview.set(preview);
    }
}

impl StateBroadcast for PreviewStateBroadcast {
    fn publish_state(&self, state: &StreamState) {
        info!(live = state.live, stream = %state.stream_id, "stream state");
        if let Some(preview) = self.preview.get() {
            match serde_json::to_value(state) {
                Ok(value) => preview.push_state_update(&serde_json::json!({
                    "type": "stream-state",
                    "data": value,
                })),
                Err(e) => warn!("state snapshot serialization failed: {e}"),
            }
        }
    }
}

struct AppState {
    manager: Arc<StreamManager>,
}

/// Serve the preview WebSocket endpoint until SIGINT/SIGTERM.
pub async fn serve_preview(address: String, manager: Arc<StreamManager>) -> anyhow::Result<()> {
    let state = Arc::new(AppState { manager });
    let app = Router::new()
        .route("/preview/ws", get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("preview websocket listening on ws://{address}/preview/ws");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

/// One task pushes batched binary messages out; the handler loop reads
/// control messages (quality selection) until the socket closes.
async fn handle_client(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4().to_string();
    let preview = state.manager.preview();
    let (mut sink, mut source) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    preview.add_client(&client_id, Arc::new(tx), Quality::Medium);
    info!(client = %client_id, "preview client connected");

    let forward = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            if sink.send(Message::Binary(batch)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => match parse_control(text.as_str()) {
                Ok(ControlMessage::Quality { data }) => {
                    preview.set_quality(&client_id, data.quality);
                }
                Err(e) => debug!(client = %client_id, "ignoring control message: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    preview.remove_client(&client_id);
    forward.abort();
    info!(client = %client_id, "preview client disconnected");
}
