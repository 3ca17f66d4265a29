use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::bail_runner;
use crate::error::{RunnerError, RunnerResult};
use crate::extractors::JsonBody;
use crate::inference::task::classify::{ClassifyHandler, ClassifyRequest, ClassifyResponse};
use crate::AppState;

#[derive(Serialize, Debug)]
pub(crate) struct HealthResponse {
    status: &'static str,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_health).head(handle_head))
        .route("/echo", post(handle_echo))
        .route("/inference", post(handle_inference))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[axum_macros::debug_handler]
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

// axum would otherwise answer HEAD through the GET handler
#[axum_macros::debug_handler]
async fn handle_head() -> (StatusCode, [(header::HeaderName, &'static str); 1]) {
    (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET")])
}

#[axum_macros::debug_handler]
async fn handle_echo(JsonBody(request): JsonBody<ClassifyRequest>) -> Json<ClassifyResponse> {
    debug!("Echoing {} features", request.input_data.len());
    Json(ClassifyResponse::echo(request))
}

#[axum_macros::debug_handler]
async fn handle_inference(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<ClassifyRequest>,
) -> RunnerResult<Json<ClassifyResponse>> {
    let arity = state.slot.input_arity();
    if request.input_data.len() != arity {
        bail_runner!(
            StatusCode::BAD_REQUEST,
            "Input data must be an array of {} float32 values",
            arity
        );
    }

    // The run blocks, keep it off the async workers
    let slot = state.slot.clone();
    let response = tokio::task::spawn_blocking(move || slot.run_classify(request))
        .await?
        .map_err(RunnerError::from_inference)?;

    Ok(Json(response))
}
