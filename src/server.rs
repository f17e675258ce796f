//! HTTP surface: health endpoints plus the WebSocket upgrade that turns a
//! connection into a [`Session`].

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::language::Language;
use crate::registry::SessionRegistry;
use crate::session::{ClientEvent, Session};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/ws/{interview_id}", get(ws_upgrade))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "connections": state.registry.count(),
    }))
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "java".to_owned()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(interview_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(language) = Language::from_tag(&query.language) else {
        return (
            StatusCode::BAD_REQUEST,
            format!("unsupported language: {}", query.language),
        )
            .into_response();
    };
    // The id names a directory under the workspace root; refuse anything
    // that could resolve elsewhere.
    if interview_id.is_empty()
        || interview_id == "."
        || interview_id == ".."
        || interview_id.contains(['/', '\\'])
    {
        return (StatusCode::BAD_REQUEST, "invalid interview id").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, interview_id, language, state))
}

async fn handle_socket(socket: WebSocket, interview_id: String, language: Language, state: AppState) {
    info!(session = %interview_id, %language, "websocket connected");
    metrics::counter!("gateway_connections_total").increment(1);

    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientEvent>();
    let workspace_dir = state.config.workspace_root.join(&interview_id);
    let session = Arc::new(Session::new(
        interview_id.clone(),
        language,
        workspace_dir,
        Arc::clone(&state.config),
        client_tx,
        Arc::downgrade(&state.registry),
    ));

    if let Err(e) = state.registry.register(Arc::clone(&session)) {
        warn!(session = %interview_id, error = %e, "connection refused");
        drop(socket);
        return;
    }

    // Initialization failure already ran cleanup (which deregisters); the
    // client sees the transport close.
    if session.initialize().await.is_err() {
        drop(socket);
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = client_rx.recv() => match outbound {
                Some(ClientEvent::Message(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ClientEvent::Close) | None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    session.handle_client_message(text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session = %interview_id, "websocket disconnected");
                    break;
                }
                // Only UTF-8 text frames carry protocol traffic.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %interview_id, error = %e, "websocket error");
                    break;
                }
            },
        }
    }

    session.cleanup().await;
    info!(session = %interview_id, "websocket closed");
}
