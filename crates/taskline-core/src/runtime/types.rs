use serde_json::Value;
use taskline_types::error::codes;
use taskline_types::{ErrorPayload, SeqNr, TaskId, TaskStatus};
use thiserror::Error;

/// Errors produced by the task runtime.
///
/// Validation and lifecycle errors are returned before any state changes;
/// a caller that receives one can retry with corrected input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// The value is not a well-formed task id.
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),

    /// `lastSeqNr` was non-positive or not a number.
    #[error("invalid lastSeqNr: {0}")]
    InvalidSeqNr(String),

    /// A listing filter or cursor could not be interpreted.
    #[error("malformed filter: {0}")]
    MalformedFilter(String),

    /// The referenced task does not exist in the caller's session.
    #[error("task not found: {task_id}")]
    NotFound { task_id: TaskId },

    /// The task existed but its record was reaped after its TTL.
    #[error("task {task_id} expired and was deleted")]
    Expired { task_id: TaskId },

    #[error("task {task_id} is already {status}")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A terminal write was attempted while children are still running.
    #[error("task {task_id} has {} unfinished children", pending.len())]
    ChildrenPending {
        task_id: TaskId,
        pending: Vec<TaskId>,
    },

    /// A task's parent is fixed at creation.
    #[error("task {task_id} cannot be attached under {parent}: parent is write-once")]
    Reparent { task_id: TaskId, parent: TaskId },

    #[error("attaching {child} under {parent} would create a cycle")]
    Cycle { parent: TaskId, child: TaskId },

    #[error("task {child} is already registered under {parent}")]
    DuplicateChild { parent: TaskId, child: TaskId },

    #[error("task {task_id} cannot be its own child")]
    SelfReference { task_id: TaskId },

    /// The parent is terminal or being cancelled and accepts no children.
    #[error("task {parent} no longer accepts subtasks")]
    ParentClosed { parent: TaskId },

    #[error("subtask of {parent} would exceed the maximum tree depth of {max_depth}")]
    DepthExceeded { parent: TaskId, max_depth: usize },

    #[error("task {task_id} already holds a different fragment at seqNr {seq_nr}")]
    DuplicateSeqNr { task_id: TaskId, seq_nr: SeqNr },

    #[error("task {task_id}: seqNr {seq_nr} is not after {last}")]
    SeqNrRegression {
        task_id: TaskId,
        seq_nr: SeqNr,
        last: SeqNr,
    },

    /// No `seqNr` is left for another producer emission.
    #[error("seqNr space exhausted after {last}")]
    SeqNrExhausted { last: SeqNr },

    /// Cancellation was requested; the producer may not emit or finish.
    #[error("task {task_id} has a pending cancellation")]
    CancelPending { task_id: TaskId },

    /// A timed wait exceeded its deadline.
    #[error("timed out waiting for task {task_id}")]
    Timeout { task_id: TaskId },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("task runtime is shut down")]
    Shutdown,
}

impl TaskError {
    /// `true` for errors caused by malformed caller input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TaskError::InvalidTaskId(_)
                | TaskError::InvalidSeqNr(_)
                | TaskError::MalformedFilter(_)
                | TaskError::UnknownMethod(_)
        )
    }

    /// `true` when the target task cannot be found (never existed, other
    /// session, or reaped).
    pub fn is_not_found(&self) -> bool {
        matches!(self, TaskError::NotFound { .. } | TaskError::Expired { .. })
    }
}

impl From<taskline_types::ParseError> for TaskError {
    fn from(err: taskline_types::ParseError) -> Self {
        match err {
            taskline_types::ParseError::TaskId(raw) => TaskError::InvalidTaskId(raw),
            other => TaskError::MalformedFilter(other.to_string()),
        }
    }
}

/// Failure reported by an operation's producer.
///
/// Converted to the [`ErrorPayload`] attached to the `failed` task.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct OperationError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: codes::OPERATION_FAILED,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn into_payload(self) -> ErrorPayload {
        ErrorPayload {
            code: self.code,
            message: self.message,
            data: self.data,
        }
    }
}

/// Lets producers use `?` on [`TaskContext`](crate::TaskContext) calls.
impl From<TaskError> for OperationError {
    fn from(err: TaskError) -> Self {
        OperationError::new(err.to_string()).with_code(codes::INTERNAL)
    }
}
