use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::id::{SessionId, TaskId};
use crate::status::TaskStatus;

/// Advisory change signal. Receivers re-fetch rather than trusting payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskNotification {
    /// A task was created in, or removed from, the session's listing.
    #[serde(rename_all = "camelCase")]
    TaskListChanged { session: SessionId },
    /// A task gained a child.
    #[serde(rename_all = "camelCase")]
    ChildrenChanged { task_id: TaskId, child_task_id: TaskId },
    #[serde(rename_all = "camelCase")]
    StatusChanged { task_id: TaskId, status: TaskStatus },
}

impl TaskNotification {
    /// The task this signal is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            TaskNotification::TaskListChanged { .. } => None,
            TaskNotification::ChildrenChanged { task_id, .. }
            | TaskNotification::StatusChanged { task_id, .. } => Some(*task_id),
        }
    }
}
