//! Session-scoped change notifications as server-sent events.
//!
//! Notifications are advisory. A consumer that falls behind gets a single
//! `lagged` event with the number of signals it missed and should re-list.
//! The stream ends when the server starts draining.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures::{Stream, StreamExt};
use taskline_core::TaskRuntime;
use taskline_types::{SessionId, TaskNotification};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};
use utoipa::OpenApi;

use super::Session;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(stream_notifications))]
pub struct NotificationsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/notifications", get(stream_notifications))
}

#[utoipa::path(
    get,
    path = "/v1/notifications",
    tag = "notifications",
    params(("x-session-id" = Option<String>, Header, description = "Caller session; defaults to the anonymous session")),
    responses(
        (status = 200, description = "Server-sent change notifications", body = String, content_type = "text/event-stream"),
    )
)]
pub async fn stream_notifications(
    State(state): State<Arc<AppState>>,
    Session(session): Session,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let runtime = Arc::clone(&state.runtime);
    let draining = state.draining();
    let events = BroadcastStream::new(runtime.notifications()).filter_map(move |item| {
        let runtime = Arc::clone(&runtime);
        let session = session.clone();
        async move {
            let event = match item {
                Ok(notification) => {
                    if !visible(&runtime, &session, &notification).await {
                        return None;
                    }
                    notification_event(&notification)
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    debug!(session = %session, missed, "notification consumer lagged");
                    Event::default().event("lagged").data(missed.to_string())
                }
            };
            Some(Ok::<_, Infallible>(event))
        }
    })
    .take_until(draining);
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn visible(runtime: &TaskRuntime, session: &SessionId, notification: &TaskNotification) -> bool {
    match notification {
        TaskNotification::TaskListChanged { session: changed } => changed == session,
        other => match other.task_id() {
            Some(task_id) => runtime.is_visible(session, task_id).await,
            None => false,
        },
    }
}

fn notification_event(notification: &TaskNotification) -> Event {
    let name = match notification {
        TaskNotification::TaskListChanged { .. } => "taskListChanged",
        TaskNotification::ChildrenChanged { .. } => "childrenChanged",
        TaskNotification::StatusChanged { .. } => "statusChanged",
    };
    match Event::default().event(name).json_data(notification) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "notification could not be serialized");
            Event::default().event("error").data("unserializable notification")
        }
    }
}
