pub mod notifications;
pub mod operations;
pub mod tasks;

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use taskline_core::TaskError;
use taskline_types::{SessionId, TaskId};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::state::AppState;

/// Header naming the caller's session. Absent means the default session.
pub const X_SESSION_ID: &str = "x-session-id";

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(operations::router())
        .merge(tasks::router())
        .merge(notifications::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut docs = V1Api::openapi();
    docs.merge(operations::OperationsApi::openapi());
    docs.merge(tasks::TasksApi::openapi());
    docs.merge(notifications::NotificationsApi::openapi());
    docs
}

/// The session a request acts in, taken from [`X_SESSION_ID`].
#[derive(Debug, Clone, Default)]
pub struct Session(pub SessionId);

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let session = parts
            .headers
            .get(X_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(SessionId::new)
            .unwrap_or_default();
        Ok(Session(session))
    }
}

pub(crate) fn parse_task_id(raw: &str) -> Result<TaskId, ServerError> {
    raw.parse::<TaskId>()
        .map_err(|e| ServerError::Task(TaskError::from(e)))
}
