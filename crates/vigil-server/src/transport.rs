//! HTTP and WebSocket front end.
//!
//! `/session` upgrades to a WebSocket and binds it to a
//! [`SessionController`]. The REST routes store scripts and run them
//! non-interactively.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;
use vigil_sandbox::{EvaluationError, EvaluationOptions, ExecutionContext, ScriptGateway, ScriptSource};

use crate::protocol::{Outbound, Response};
use crate::session::{SessionConfig, SessionController};
use crate::store::ScriptStore;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Evaluates scripts.
    pub gateway: Arc<ScriptGateway>,
    /// Where scripts are looked up.
    pub store: Arc<dyn ScriptStore>,
    /// Limits applied to each interactive session.
    pub session: SessionConfig,
}

/// Error body plus status for REST handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "code": code, "message": message.into() }),
        }
    }

    fn evaluation(err: &EvaluationError) -> Self {
        let status = if err.is_script_fault() {
            StatusCode::UNPROCESSABLE_ENTITY
        } else if matches!(err, EvaluationError::ConcurrencyLimit { .. }) {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            body: err.to_structured_error(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        (self.status, Json(self.body)).into_response()
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scripts", post(create_script))
        .route("/scripts/:id/audit", post(run_audit))
        .route("/session", get(open_session))
        .with_state(state)
}

/// Bind `addr` and serve until ctrl-c.
pub async fn serve(addr: &str, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "vigil server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateScript {
    source: String,
    #[serde(default)]
    ipfs_directory: Option<String>,
}

async fn create_script(
    State(state): State<AppState>,
    Json(request): Json<CreateScript>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if request.source.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "script source is empty",
        ));
    }
    let stored = state
        .store
        .store(ScriptSource::from(request.source), request.ipfs_directory)
        .await;
    tracing::info!(script_id = %stored.id, "script stored");
    Ok((StatusCode::CREATED, Json(json!({ "id": stored.id }))))
}

async fn run_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Response>, ApiError> {
    let script = match Uuid::parse_str(&id) {
        Ok(id) => state.store.load(&id).await,
        Err(_) => None,
    };
    let Some(script) = script else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("no script with id {id}"),
        ));
    };

    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "SERIALIZATION",
                format!("payload is not valid JSON: {e}"),
            )
        })?)
    };

    let options = EvaluationOptions {
        payload,
        ipfs_directory: script.ipfs_directory.clone(),
        ..Default::default()
    };
    let outcome = state
        .gateway
        .evaluate_with_options(&script.source, ExecutionContext::noop(), options)
        .await;
    match outcome {
        Ok(result) => Ok(Json(Response::AuditResultResponse { result })),
        Err(e) => Err(ApiError::evaluation(&e)),
    }
}

async fn open_session(ws: WebSocketUpgrade, State(state): State<AppState>) -> HttpResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

/// Pump frames between one WebSocket and its controller.
async fn run_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (mut controller, mut outbound) =
        SessionController::new(state.store, state.gateway, state.session);

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => controller.handle_frame(&text).await,
                Some(Ok(Message::Close(_))) | None => {
                    controller.handle_close();
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(session_id = %controller.session_id(), error = %e, "websocket error");
                    controller.handle_close();
                    break;
                }
                Some(Ok(_)) => {}
            },
            next = outbound.recv() => match next {
                Some(Outbound::Frame(frame)) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        controller.handle_close();
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    controller.wait().await;
    tracing::info!(session_id = %controller.session_id(), "session closed");
}
