use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ErrorPayload;
use crate::fragment::SeqNr;
use crate::id::TaskId;
use crate::status::TaskStatus;

/// Point-in-time view of a task, as returned by `get` and `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    /// Operation kind the task wraps, e.g. `tools/call`.
    pub method: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Milliseconds after `created_at` at which the task may be deleted.
    pub ttl: u64,
    /// Advisory poll cadence in milliseconds.
    pub poll_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default)]
    pub child_task_ids: Vec<TaskId>,
    /// Highest `seqNr` assigned so far; `None` until the first fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq_nr: Option<SeqNr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}
