use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Errors produced while parsing wire values from strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The value is not a well-formed task id.
    #[error("invalid task id: {0}")]
    TaskId(String),

    /// The value is not one of the known task statuses.
    #[error("unknown task status: {0}")]
    Status(String),

    /// The value is not a known sort key or direction.
    #[error("invalid sort option: {0}")]
    Sort(String),
}

/// Well-known error codes attached to failed tasks.
///
/// The range mirrors JSON-RPC's implementation-defined server errors.
pub mod codes {
    /// The wrapped operation reported a failure.
    pub const OPERATION_FAILED: i32 = -32000;
    /// The task outlived its TTL without a usable result.
    pub const TTL_EXPIRED: i32 = -32001;
    /// The producer panicked or disappeared without finishing the task.
    pub const PRODUCER_CRASHED: i32 = -32002;
    /// The runtime shut down while the task was in flight.
    pub const SHUTDOWN: i32 = -32003;
    /// Internal error.
    pub const INTERNAL: i32 = -32603;
}

/// Diagnostic payload carried by a `failed` task and by error-marked
/// fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
