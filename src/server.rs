//! HTTP request surface.
//!
//! A thin JSON API over the engine, external to the core:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ask` | Answer one question, optionally within a session |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Error responses use the envelope
//! `{ "error": { "code": "...", "message": "..." } }`. Collaborator
//! failures map to `503 unavailable` — the engine never papers over a
//! failed embedding or generation call with a fabricated answer.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::router::{Answer, QaEngine};

#[derive(Clone)]
struct AppState {
    engine: Arc<QaEngine>,
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(engine: QaEngine) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let state = AppState {
        engine: Arc::new(engine),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "listening");
    println!("corpus-qa server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "unavailable".to_string(),
        message: message.into(),
    }
}

/// Map engine failures onto HTTP statuses: validation problems are the
/// caller's fault, anything else means a collaborator let us down.
fn classify_ask_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("must not be empty") {
        bad_request(msg)
    } else {
        unavailable(format!("temporarily unavailable: {}", msg))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct AskResponse {
    session_id: String,
    #[serde(flatten)]
    answer: Answer,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    let session_id = request
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let answer = state
        .engine
        .ask(&request.question, &session_id)
        .await
        .map_err(classify_ask_error)?;

    Ok(Json(AskResponse { session_id, answer }))
}
