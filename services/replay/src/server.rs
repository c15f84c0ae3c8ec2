//! HTTP and websocket front door for sessions.

use crate::config::ServerConfig;
use crate::container::ContainerSummary;
use crate::session::{SessionError, SessionRegistry};
use crate::streaming::{ClientMessage, ServerMessage, StreamDispatcher};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
}

/// Body of `POST /sessions/:id/source`
#[derive(Debug, Deserialize)]
pub struct OpenSourceRequest {
    pub path: String,
    #[serde(default)]
    pub temporary: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e.to_string(), "NOT_FOUND"),
            SessionError::Container(_) => {
                api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string(), "CONTAINER_ERROR")
            }
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sessions/:session_id/source", post(open_source))
        .route("/sessions/:session_id", delete(close_session))
        .route("/sessions/:session_id/stream", get(stream_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "replay-engine",
        "sessions": state.sessions.session_ids().len(),
    }))
}

#[instrument(skip(state, request))]
async fn open_source(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<OpenSourceRequest>,
) -> Result<Json<ContainerSummary>, ApiError> {
    let sessions = state.sessions.clone();
    let id = session_id.clone();

    // opening replaces and joins the previous producer
    let opened = tokio::task::spawn_blocking(move || {
        sessions
            .open_source(&id, &request.path, request.temporary)
            .map(|player| player.summary().clone())
    })
    .await
    .map_err(|e| {
        error!(error = %e, "Open task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to open source", "INTERNAL")
    })?;

    Ok(Json(opened?))
}

#[instrument(skip(state))]
async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let sessions = state.sessions.clone();
    let id = session_id.clone();
    let existed = tokio::task::spawn_blocking(move || sessions.teardown(&id))
        .await
        .map_err(|e| {
            error!(error = %e, "Teardown task failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to close session", "INTERNAL")
        })?;

    if existed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(SessionError::NotFound(session_id).into())
    }
}

async fn stream_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let outbound_queue = state.sessions.config().streaming.outbound_queue.max(1);
    let (tx, rx) = mpsc::channel(outbound_queue);

    match state.sessions.dispatcher(&session_id, tx) {
        Ok(dispatcher) => ws
            .on_upgrade(move |socket| handle_stream_socket(socket, session_id, dispatcher, rx))
            .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn handle_stream_socket(
    socket: WebSocket,
    session_id: String,
    mut dispatcher: StreamDispatcher,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();
    info!(session_id = %session_id, connection_id = %connection_id, "Stream client connected");

    // replies to malformed control messages
    let (reply_tx, mut replies) = mpsc::channel::<ServerMessage>(8);

    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(message) = outbound.recv() => message,
                Some(message) = replies.recv() => message,
                else => break,
            };

            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialise stream message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                debug!("Stream client gone");
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match ClientMessage::parse(&text) {
                Ok(message) => dispatcher.handle(message).await,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "Malformed control message");
                    if reply_tx.send(ServerMessage::error(None, e.to_string())).await.is_err() {
                        break;
                    }
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Stream socket error");
                break;
            }
        }

        if writer.is_finished() {
            break;
        }
    }

    dispatcher.shutdown().await;
    drop(reply_tx);
    drop(dispatcher);
    if let Err(e) = writer.await {
        error!(error = %e, "Stream writer panicked");
    }
    info!(
        session_id = %session_id,
        connection_id = %connection_id,
        "Stream client disconnected"
    );
}

/// Serve until `shutdown` resolves.
pub async fn start_server(
    state: AppState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting replay server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Replay server error")?;

    Ok(())
}
