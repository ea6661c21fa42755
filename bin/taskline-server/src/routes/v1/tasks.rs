//! Per-task routes under `/v1/tasks`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use taskline_core::{DeliveryCursor, parse_last_seq_nr};
use taskline_types::{ListPage, StreamEvent, TaskResult, TaskSnapshot};
use tracing::{info, warn};
use utoipa::OpenApi;

use super::{Session, parse_task_id};
use crate::error::ServerError;
use crate::schemas::v1::task::{ListQuery, ResultQuery, StreamQuery};
use crate::state::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(OpenApi)]
#[openapi(
    paths(list_tasks, get_task, get_task_result, cancel_task, stream_task),
    components(schemas(ListPage, TaskSnapshot, TaskResult))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/result", get(get_task_result))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/stream", get(stream_task))
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "tasks",
    params(("x-session-id" = Option<String>, Header, description = "Caller session; defaults to the anonymous session"), ListQuery),
    responses(
        (status = 200, description = "One page of the session's tasks", body = ListPage),
        (status = 400, description = "Malformed filter or cursor"),
    )
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListPage>, ServerError> {
    let filter = q.into_filter()?;
    Ok(Json(state.runtime.list(&session, &filter).await?))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id"), ("x-session-id" = Option<String>, Header, description = "Caller session; defaults to the anonymous session")),
    responses(
        (status = 200, description = "Task snapshot", body = TaskSnapshot),
        (status = 400, description = "Malformed task id"),
        (status = 404, description = "Unknown, expired or foreign task"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, ServerError> {
    let task_id = parse_task_id(&id)?;
    Ok(Json(state.runtime.get(&session, task_id).await?))
}

/// Merged final result, or with `lastSeqNr` the fragments after it.
#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/result",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id"), ("x-session-id" = Option<String>, Header, description = "Caller session; defaults to the anonymous session"), ResultQuery),
    responses(
        (status = 200, description = "Final result or resumption page", body = TaskResult),
        (status = 400, description = "Invalid lastSeqNr"),
        (status = 404, description = "Unknown, expired or foreign task"),
        (status = 408, description = "Task still running after waitMs"),
    )
)]
pub async fn get_task_result(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    Path(id): Path<String>,
    Query(q): Query<ResultQuery>,
) -> Result<Json<TaskResult>, ServerError> {
    let task_id = parse_task_id(&id)?;
    let result = state
        .runtime
        .result(&session, task_id, q.last_seq_nr.as_deref(), q.wait())
        .await?;
    Ok(Json(result))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/cancel",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id"), ("x-session-id" = Option<String>, Header, description = "Caller session; defaults to the anonymous session")),
    responses(
        (status = 200, description = "Snapshot after the cancel request", body = TaskSnapshot),
        (status = 404, description = "Unknown, expired or foreign task"),
        (status = 409, description = "Task already terminal"),
    )
)]
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, ServerError> {
    let task_id = parse_task_id(&id)?;
    let snapshot = state.runtime.cancel(&session, task_id).await?;
    info!(task_id = %task_id, status = %snapshot.status, "cancel requested over http");
    Ok(Json(snapshot))
}

/// Server-sent events for one task: `fragment` events carrying the
/// fragment's `seqNr` as event id, then one `complete` event.
///
/// Resumes after `?after=N` or, failing that, the `Last-Event-ID` header.
#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/stream",
    tag = "tasks",
    params(
        ("id" = String, Path, description = "Task id"),
        ("x-session-id" = Option<String>, Header, description = "Caller session; defaults to the anonymous session"),
        ("last-event-id" = Option<String>, Header, description = "Resume after this seqNr"),
        StreamQuery,
    ),
    responses(
        (status = 200, description = "Server-sent fragment events", body = String, content_type = "text/event-stream"),
        (status = 400, description = "Invalid resumption point"),
        (status = 404, description = "Unknown, expired or foreign task"),
    )
)]
pub async fn stream_task(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
    Path(id): Path<String>,
    Query(q): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let task_id = parse_task_id(&id)?;
    let after = match q.after {
        Some(after) => Some(after),
        None => last_event_id(&headers)?,
    };
    let cursor = after.map_or_else(DeliveryCursor::new, DeliveryCursor::starting_at);
    let events = state
        .runtime
        .subscribe(&session, task_id, cursor)
        .await?
        .map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<u64>, ServerError> {
    let Some(value) = headers.get(LAST_EVENT_ID) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| ServerError::BadRequest("Last-Event-ID is not valid text".into()))?;
    Ok(Some(parse_last_seq_nr(raw)?))
}

fn sse_event(event: &StreamEvent) -> Event {
    let mut sse = match event {
        StreamEvent::Fragment(fragment) => Event::default()
            .event("fragment")
            .id(fragment.seq_nr.to_string()),
        StreamEvent::Complete { .. } => Event::default().event("complete"),
    };
    sse = match sse.json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(error = %e, "stream event could not be serialized");
            Event::default().event("error").data("unserializable event")
        }
    };
    sse
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::operations;
    use axum::http::{HeaderValue, StatusCode};
    use axum::response::IntoResponse;
    use serde_json::json;
    use taskline_core::{OperationRequest, TaskError};
    use taskline_types::{CreateResponse, ResponseMode, SessionId, TaskId, TaskStatus};

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()))
    }

    async fn submit(state: &AppState, method: &str, params: serde_json::Value) -> TaskId {
        let response = state
            .runtime
            .submit(OperationRequest::new(method, params).with_modes([ResponseMode::Task]))
            .await
            .unwrap();
        let CreateResponse::Task { task } = response else {
            panic!("expected a task handle");
        };
        task.task_id
    }

    async fn finished_echo(state: &AppState, text: &str) -> TaskId {
        let id = submit(state, operations::ECHO, json!({ "text": text, "delayMs": 0 })).await;
        state
            .runtime
            .final_result(&SessionId::default(), id, None)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn get_task_validates_the_id() {
        let err = get_task(State(state()), Session::default(), Path("bogus".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = get_task(
            State(state()),
            Session::default(),
            Path(TaskId::new().to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn result_pages_after_last_seq_nr() {
        let state = state();
        let id = finished_echo(&state, "a b c").await;

        let Json(result) = get_task_result(
            State(Arc::clone(&state)),
            Session::default(),
            Path(id.to_string()),
            Query(ResultQuery {
                last_seq_nr: Some("1".into()),
                wait_ms: None,
            }),
        )
        .await
        .unwrap();
        let TaskResult::Page(page) = result else {
            panic!("expected a page");
        };
        let seqs: Vec<_> = page.fragments.iter().map(|f| f.seq_nr).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(page.complete);

        let err = get_task_result(
            State(state),
            Session::default(),
            Path(id.to_string()),
            Query(ResultQuery {
                last_seq_nr: Some("0".into()),
                wait_ms: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::Task(TaskError::InvalidSeqNr(_))));
    }

    #[tokio::test]
    async fn cancel_then_list_by_status() {
        let state = state();
        let id = submit(&state, operations::ASK, json!({ "waitMs": 60000 })).await;

        let Json(snapshot) = cancel_task(
            State(Arc::clone(&state)),
            Session::default(),
            Path(id.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);

        let Json(page) = list_tasks(
            State(Arc::clone(&state)),
            Session::default(),
            Query(ListQuery {
                status: Some("cancelled".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(page.tasks.len(), 1);
        assert_eq!(page.tasks[0].task_id, id);

        let err = cancel_task(State(state), Session::default(), Path(id.to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn other_sessions_get_not_found() {
        let state = state();
        let id = finished_echo(&state, "x").await;
        let err = get_task(
            State(state),
            Session(SessionId::new("intruder")),
            Path(id.to_string()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_replays_fragments_then_completes() {
        let state = state();
        let id = finished_echo(&state, "one two").await;

        let sse = stream_task(
            State(state),
            Session::default(),
            Path(id.to_string()),
            Query(StreamQuery { after: Some(1) }),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        let body = axum::body::to_bytes(sse.into_response().into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap().replace(": ", ":");

        assert!(text.contains("event:fragment"));
        assert!(text.contains("id:2"));
        assert!(text.contains("\"two\""));
        assert!(!text.contains("\"one\""));
        assert!(text.contains("event:complete"));
    }

    #[test]
    fn last_event_id_must_be_a_positive_seq_nr() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers).unwrap(), None);

        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("4"));
        assert_eq!(last_event_id(&headers).unwrap(), Some(4));

        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("0"));
        assert_eq!(
            last_event_id(&headers).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
