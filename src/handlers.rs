// handlers.rs

use crate::{
    docs,
    error::AppError,
    models::{HealthReport, StateView, WsMessage},
    relay::Relay,
    utils,
};
use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderValue, Method},
    response::{IntoResponse, Redirect},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct ViewerQuery {
    /// Last sequence the viewer applied before reconnecting.
    pub resume_from: Option<u64>,
}

pub fn build_router(relay: Arc<Relay>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::permanent("/docs") }))
        .route("/ws", get(handle_viewer_ws_upgrade))
        .route("/api/state", get(get_state))
        .route("/health", get(health))
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", docs::ApiDoc::openapi()))
        .layer(cors)
        .with_state(relay)
}

/// `"*"` allows any origin; anything else must be a single origin.
pub fn cors_layer(origin: &str) -> Result<CorsLayer, AppError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);
    if origin.trim() == "*" {
        return Ok(layer.allow_origin(Any));
    }
    let origin = HeaderValue::from_str(origin.trim())
        .map_err(|e| anyhow::anyhow!("Invalid CORS origin {origin:?}: {e}"))?;
    Ok(layer.allow_origin(origin))
}

pub async fn handle_viewer_ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<ViewerQuery>,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    info!(resume_from = ?query.resume_from, "Viewer connection attempt");
    ws.on_upgrade(move |socket| handle_viewer(socket, relay, query.resume_from))
}

async fn handle_viewer(socket: WebSocket, relay: Arc<Relay>, resume_from: Option<u64>) {
    let (mut sender, mut receiver) = socket.split();
    let session_id = Uuid::new_v4();
    let mut rx = relay.register_viewer(session_id, resume_from).await;
    info!(%session_id, "Viewer connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!(%session_id, "Failed to encode viewer message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        // Queue closed: the registry dropped this session.
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_task = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Text(text) => {
                        handle_viewer_text(&relay, session_id, text.as_str()).await
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    });

    tokio::pin!(send_task, recv_task);
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    utils::cleanup_viewer_connection(session_id, &relay).await;
}

async fn handle_viewer_text(relay: &Relay, session_id: Uuid, text: &str) {
    let result = match serde_json::from_str::<WsMessage>(text) {
        Ok(WsMessage::SendCommand { action, payload }) => relay
            .issue_command(session_id, &action, &payload)
            .await
            .map(|_| ()),
        Ok(other) => Err(AppError::InvalidCommand(format!(
            "viewers may only send send_command, got {}",
            message_type(&other)
        ))),
        Err(e) => Err(AppError::from(e)),
    };

    if let Err(e) = result {
        debug!(%session_id, code = e.code(), "Viewer message rejected: {}", e);
        relay.sessions().notify(
            session_id,
            WsMessage::Error {
                message: e.to_string(),
                code: e.code().to_string(),
            },
        );
    }
}

fn message_type(msg: &WsMessage) -> &'static str {
    match msg {
        WsMessage::StateSnapshot { .. } => "state_snapshot",
        WsMessage::StateUpdate { .. } => "state_update",
        WsMessage::CommandAccepted { .. } => "command_accepted",
        WsMessage::CommandResult { .. } => "command_result",
        WsMessage::TransportStatus { .. } => "transport_status",
        WsMessage::SendCommand { .. } => "send_command",
        WsMessage::Error { .. } => "error",
    }
}

#[utoipa::path(
    get,
    path = "/api/state",
    responses(
        (status = 200, description = "Current device state and relay sequence", body = StateView)
    )
)]
pub async fn get_state(State(relay): State<Arc<Relay>>) -> Json<StateView> {
    Json(relay.snapshot().await)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Relay liveness and broker connectivity", body = HealthReport)
    )
)]
pub async fn health(State(relay): State<Arc<Relay>>) -> Json<HealthReport> {
    let view = relay.snapshot().await;
    Json(HealthReport {
        status: "ok".to_string(),
        transport_connected: view.transport_connected,
        sequence: view.sequence,
        sessions: relay.sessions().len(),
        pending_commands: relay.dispatcher().pending_count(),
    })
}
