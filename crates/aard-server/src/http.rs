use std::net::SocketAddr;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use aard_core::RequestOptions;
use aard_types::ErrorKind;

use crate::{build_id, AppState};

#[derive(Debug, Deserialize, Default)]
struct RequestOptionsInput {
    autonomy_level: Option<u8>,
    model_ref: Option<String>,
    server_ref: Option<String>,
    task_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateRequestInput {
    text: String,
    session_id: Option<String>,
    #[serde(default)]
    options: Option<RequestOptionsInput>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    after_id: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DecideInput {
    decision: String,
    actor: String,
    note: Option<String>,
}

fn status_for(err: &ErrorKind) -> StatusCode {
    match err {
        ErrorKind::InvalidRequest(_) | ErrorKind::ValidationFailed(_) => StatusCode::BAD_REQUEST,
        ErrorKind::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: ErrorKind) -> axum::response::Response {
    let status = status_for(&err);
    // internal failures keep their detail in the event trail, not the
    // client response
    let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(target: "aard.server", %correlation_id, error = %err, "internal error");
        json!({"error": err.reason_code(), "correlation_id": correlation_id})
    } else {
        json!({"error": err.reason_code(), "detail": err.to_string()})
    };
    (status, Json(body)).into_response()
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/health", get(health))
        .route("/request", post(create_request))
        .route("/workflow/{id}", get(get_workflow))
        .route("/workflow/{id}/events", get(get_events))
        .route("/workflow/{id}/stream", get(stream_events))
        .route("/workflow/{id}/cancel", post(cancel_workflow))
        .route("/workflow/{id}/pause", post(pause_workflow))
        .route("/workflow/{id}/resume", post(resume_workflow))
        .route("/approval/{request_id}/decide", post(decide_approval))
        .route("/plan/{id}", get(get_plan))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "aard.server", %addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "build": build_id()}))
}

async fn create_request(
    State(state): State<AppState>,
    Json(input): Json<CreateRequestInput>,
) -> axum::response::Response {
    let options = input.options.unwrap_or_default();
    let options = RequestOptions {
        autonomy_level: options.autonomy_level,
        model_ref: options.model_ref,
        server_ref: options.server_ref,
        task_type: options.task_type,
    };
    match state
        .service
        .start(&input.text, input.session_id, options)
        .await
    {
        Ok(workflow) => {
            let service = state.service.clone();
            let workflow_id = workflow.workflow_id.clone();
            tokio::spawn(async move {
                service.run(&workflow_id).await;
            });
            Json(json!({
                "workflow_id": workflow.workflow_id,
                "status": workflow.current_state,
            }))
            .into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let workflow = state.service.get(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "workflow_id": workflow.workflow_id,
        "session_id": workflow.session_id,
        "current_stage": workflow.current_stage,
        "current_state": workflow.current_state,
        "started_at": workflow.created_at,
        "terminated_at": workflow.terminated_at,
        "reason_code": workflow.last_reason_code,
        "summary": workflow.summary,
    })))
}

async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, StatusCode> {
    if state.service.get(&id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let events = state
        .service
        .handles()
        .journal
        .by_workflow(&id, query.after_id, query.limit)
        .await;
    Ok(Json(json!({"events": events})))
}

async fn stream_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if state.service.get(&id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| stream_events_socket(socket, state, id))
}

/// Live feed: replays the stored trail, then forwards the broadcast in
/// order. Frames are the canonical ExecutionEvent JSON.
async fn stream_events_socket(mut socket: WebSocket, state: AppState, workflow_id: String) {
    let journal = &state.service.handles().journal;
    let mut rx = journal.subscribe();
    let backlog = journal.by_workflow(&workflow_id, None, None).await;
    let mut last_sequence = 0u64;
    for event in backlog {
        last_sequence = event.sequence;
        let Ok(frame) = serde_json::to_string(&event) else {
            continue;
        };
        if socket.send(WsMessage::Text(frame.into())).await.is_err() {
            return;
        }
    }

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // backfill from the journal so the subscriber sees no gap
                let missed = journal
                    .by_workflow(&workflow_id, Some(last_sequence), None)
                    .await;
                for event in missed {
                    last_sequence = event.sequence;
                    let Ok(frame) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if event.workflow_id != workflow_id || event.sequence <= last_sequence {
            continue;
        }
        last_sequence = event.sequence;
        let Ok(frame) = serde_json::to_string(&event) else {
            continue;
        };
        if socket.send(WsMessage::Text(frame.into())).await.is_err() {
            return;
        }
    }
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match state.service.cancel(&id).await {
        Ok(workflow) => Json(json!({
            "workflow_id": workflow.workflow_id,
            "status": workflow.current_state,
        }))
        .into_response(),
        Err(ErrorKind::InvalidRequest(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

async fn pause_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match state.service.pause(&id).await {
        Ok(()) => Json(json!({"workflow_id": id, "status": "pausing"})).into_response(),
        Err(ErrorKind::InvalidRequest(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

async fn resume_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match state.service.resume(&id).await {
        Ok(()) => Json(json!({"workflow_id": id, "status": "resuming"})).into_response(),
        Err(ErrorKind::InvalidRequest(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

async fn decide_approval(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(input): Json<DecideInput>,
) -> axum::response::Response {
    let approve = match input.decision.as_str() {
        "approved" => true,
        "rejected" => false,
        other => {
            return error_response(ErrorKind::InvalidRequest(format!(
                "unknown decision `{other}`"
            )));
        }
    };
    match state
        .service
        .decide_approval(&request_id, approve, &input.actor, input.note)
        .await
    {
        Ok(request) => Json(json!({
            "request_id": request.request_id,
            "status": request.status,
        }))
        .into_response(),
        Err(ErrorKind::InvalidRequest(detail)) if detail.starts_with("unknown approval") => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let plan = state
        .service
        .get_plan(&id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!(plan)))
}
