use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter};
use utoipa::ToSchema;

use crate::error::ParseError;

/// Task lifecycle status.
///
/// ```text
/// working ──► completed | failed | cancelled
///    ▲ │
///    │ ▼
/// input_required ──► completed | failed | cancelled
/// ```
///
/// `working` is the initial state. Terminal states have no outgoing edges.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema, Display, AsRefStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Working,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine has an edge from `self` to `to`.
    ///
    /// Self-loops are not transitions.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Working, InputRequired)
                | (InputRequired, Working)
                | (Working | InputRequired, Completed | Failed | Cancelled)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "working" => Ok(TaskStatus::Working),
            "input_required" => Ok(TaskStatus::InputRequired),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(ParseError::Status(other.to_owned())),
        }
    }
}
