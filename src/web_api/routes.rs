//! API Routes

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::device_probe::ScanOptions;
use crate::models::ApiResponse;
use crate::state::AppState;
use crate::stream_relay::StreamEvent;
use crate::task_orchestrator::CreateTaskRequest;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/system/status", get(system_status))
        // Device discovery
        .route("/scan", get(run_scan))
        // Tasks
        .route("/tasks", get(list_tasks))
        .route("/tasks", post(create_task))
        .route("/tasks/:id/start", post(start_task))
        .route("/tasks/:id/stop", post(stop_task))
        .route("/tasks/:id", delete(delete_task))
        // Detection events
        .route("/api/events", get(list_events))
        // Camera streams
        .route("/cameras/:index/preview", get(camera_preview))
        .route("/cameras/:index/stream", get(camera_stream))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Scan Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct ScanQuery {
    max_index: Option<u32>,
    warmup_frames: Option<u32>,
    force_probe: Option<bool>,
    retries: Option<u32>,
}

async fn run_scan(
    State(state): State<AppState>,
    Query(query): Query<ScanQuery>,
) -> impl IntoResponse {
    let defaults = ScanOptions::default();
    let opts = ScanOptions {
        max_index: query.max_index.unwrap_or(defaults.max_index),
        warmup_frames: query.warmup_frames.unwrap_or(defaults.warmup_frames),
        force_probe: query.force_probe.unwrap_or(defaults.force_probe),
        retries: query.retries.unwrap_or(defaults.retries),
    };

    match state.probe.scan(opts).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}

// ========================================
// Task Handlers
// ========================================

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let tasks = state.orchestrator.list_tasks().await;
    Json(ApiResponse::success(tasks))
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    match state.orchestrator.create_task(req).await {
        Ok(task) => (StatusCode::CREATED, Json(ApiResponse::success(task))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.start_task(&id).await {
        Ok(task) => Json(ApiResponse::success(task)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.stop_task(&id).await {
        Ok(task) => Json(ApiResponse::success(task)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.delete_task(&id).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => e.into_response(),
    }
}

// ========================================
// Event Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct EventQuery {
    source: Option<String>,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100);
    let events = match query.source {
        Some(source) => state.event_log.get_by_source(&source, limit).await,
        None => state.event_log.get_latest(limit).await,
    };
    Json(ApiResponse::success(events))
}

// ========================================
// Stream Handlers
// ========================================

async fn camera_preview(
    State(state): State<AppState>,
    Path(index): Path<u32>,
) -> impl IntoResponse {
    match state.relay.preview(index).await {
        Ok(frame) => (
            [(header::CONTENT_TYPE, "image/jpeg")],
            frame.data,
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Continuous MJPEG stream; the viewer handle detaches when the client
/// drops the response body
async fn camera_stream(
    State(state): State<AppState>,
    Path(index): Path<u32>,
) -> impl IntoResponse {
    let viewer = match state.relay.attach(index).await {
        Ok(viewer) => viewer,
        Err(e) => return e.into_response(),
    };

    let stream = futures::stream::unfold(viewer, |mut viewer| async move {
        match viewer.next_event().await {
            Ok(StreamEvent::Frame(frame)) => {
                let mut part = Vec::with_capacity(frame.data.len() + 96);
                part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
                part.extend_from_slice(
                    format!("Content-Length: {}\r\n\r\n", frame.data.len()).as_bytes(),
                );
                part.extend_from_slice(&frame.data);
                part.extend_from_slice(b"\r\n");
                Some((Ok::<_, std::convert::Infallible>(part), viewer))
            }
            Ok(StreamEvent::Failed(_)) | Err(_) => None,
        }
    });

    (
        [(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(stream),
    )
        .into_response()
}

// ========================================
// System Status
// ========================================

async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.system_health.read().await.clone();
    let channel = state.channel.state().await;
    let sessions = state.relay.list_sessions().await;
    let active_streams = sessions.iter().filter(|s| s.active).count();

    Json(json!({
        "healthy": !health.overloaded,
        "cpu_percent": health.cpu_percent,
        "memory_percent": health.memory_percent,
        "channel": {
            "phase": channel.phase.as_str(),
            "reconnect_attempts": channel.reconnect_attempts,
            "last_error": channel.last_error,
        },
        "active_streams": active_streams,
        "stream_sessions": sessions,
        "dashboard_clients": state.realtime.connection_count(),
    }))
}

// ========================================
// WebSocket Handler
// ========================================

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Register with RealtimeHub
    let (conn_id, mut rx) = state.realtime.register().await;

    // Forward hub messages to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages (ping/pong, close)
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Ping(data)) => {
                    // Pong is handled automatically by axum
                    tracing::trace!("Received ping: {:?}", data);
                }
                Ok(Message::Close(_)) => {
                    tracing::info!(connection_id = %conn_id, "WebSocket client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
        conn_id
    });

    // Wait for either task to complete
    let conn_id = tokio::select! {
        _ = send_task => conn_id,
        result = recv_task => result.unwrap_or(conn_id),
    };

    // Unregister from hub
    state.realtime.unregister(&conn_id).await;
}
