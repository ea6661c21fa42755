use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use utoipa::ToSchema;

use crate::fragment::{FinalResult, Fragment};
use crate::id::TaskId;
use crate::status::TaskStatus;
use crate::task::TaskSnapshot;

/// How a requestor would like the response to a task-augmentable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResponseMode {
    /// Wait for the result and return it in the response.
    Inline,
    /// Return a task handle immediately.
    Task,
    /// Return a task handle together with the first fragments.
    Stream,
}

/// The handle returned when a request becomes a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Milliseconds.
    pub ttl: u64,
    /// Milliseconds.
    pub poll_interval: u64,
}

impl From<&TaskSnapshot> for TaskHandle {
    fn from(snapshot: &TaskSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id,
            status: snapshot.status,
            created_at: snapshot.created_at,
            ttl: snapshot.ttl,
            poll_interval: snapshot.poll_interval,
        }
    }
}

/// Response to a task-augmentable request.
///
/// Callers must handle all three shapes; which one arrives depends on mode
/// negotiation and on how quickly the operation finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreateResponse {
    Inline {
        result: FinalResult,
        /// The retained completed record, when the receiver keeps one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskHandle>,
    },
    Task {
        task: TaskHandle,
    },
    Stream {
        task: TaskHandle,
        fragments: Vec<Fragment>,
        complete: bool,
    },
}

impl CreateResponse {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            CreateResponse::Inline { task, .. } => task.as_ref().map(|t| t.task_id),
            CreateResponse::Task { task } | CreateResponse::Stream { task, .. } => Some(task.task_id),
        }
    }
}
