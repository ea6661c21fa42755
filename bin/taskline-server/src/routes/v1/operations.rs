//! Operation submission.
//!
//! A submitted operation is answered inline, as a task handle, or as a
//! handle plus the first streamed fragments, depending on the negotiated
//! response mode.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use taskline_types::CreateResponse;
use tracing::info;
use utoipa::OpenApi;

use super::Session;
use crate::error::ServerError;
use crate::schemas::v1::operation::CreateOperationRequest;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(create_operation, list_operations),
    components(schemas(CreateOperationRequest, CreateResponse))
)]
pub struct OperationsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/operations", post(create_operation))
        .route("/operations", get(list_operations))
}

/// Submit an operation (`POST /v1/operations`).
#[utoipa::path(
    post,
    path = "/v1/operations",
    tag = "operations",
    params(("x-session-id" = Option<String>, Header, description = "Caller session; defaults to the anonymous session")),
    request_body = CreateOperationRequest,
    responses(
        (status = 200, description = "Inline result or task handle", body = CreateResponse),
        (status = 400, description = "Unknown method or bad params"),
        (status = 503, description = "Runtime is shutting down"),
    )
)]
pub async fn create_operation(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    Json(body): Json<CreateOperationRequest>,
) -> Result<Json<CreateResponse>, ServerError> {
    let method = body.method.clone();
    let response = state.runtime.submit(body.into_request(session)).await?;
    info!(method = %method, task_id = ?response.task_id(), "operation accepted");
    Ok(Json(response))
}

/// Methods this server can run.
#[utoipa::path(
    get,
    path = "/v1/operations",
    tag = "operations",
    responses((status = 200, description = "Registered method names", body = Vec<String>))
)]
pub async fn list_operations(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let mut methods = state.runtime.registry().methods();
    methods.sort();
    Json(methods)
}
