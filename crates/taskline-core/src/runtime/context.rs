use std::sync::Arc;

use serde_json::Value;
use taskline_types::{FinalResult, SeqNr, SessionId, TaskId, TaskStatus};
use tokio::sync::watch;
use tracing::debug;

use crate::runtime::dispatcher::final_result_of;
use crate::runtime::lifecycle::{self, LifecycleManager};
use crate::runtime::operation::OperationRequest;
use crate::runtime::storage::TaskCell;
use crate::runtime::tree;
use crate::runtime::types::TaskError;

/// Handle given to a running operation.
///
/// Everything a producer does to its task goes through here: emitting
/// fragments, asking for input, spawning subtasks and watching for
/// cancellation. Once the task is terminal every write is rejected.
#[derive(Clone)]
pub struct TaskContext {
    manager: LifecycleManager,
    cell: Arc<TaskCell>,
    cancel: watch::Receiver<bool>,
}

impl TaskContext {
    pub(crate) fn new(manager: LifecycleManager, cell: Arc<TaskCell>) -> Self {
        let cancel = cell.cancel_signal();
        Self {
            manager,
            cell,
            cancel,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.cell.id
    }

    pub fn parent_task_id(&self) -> Option<TaskId> {
        self.cell.parent
    }

    pub fn session(&self) -> &SessionId {
        &self.cell.session
    }

    pub fn method(&self) -> &str {
        &self.cell.method
    }

    pub fn status(&self) -> TaskStatus {
        self.cell.status()
    }

    /// Append a fragment at the next `seqNr`.
    pub fn emit(&self, content: impl Into<Value>) -> Result<SeqNr, TaskError> {
        lifecycle::emit(&self.cell, None, content.into())
    }

    /// Append a fragment at an explicit `seqNr`. Skipping ahead leaves a
    /// gap; repeating an identical fragment is a no-op.
    pub fn emit_at(&self, seq_nr: SeqNr, content: impl Into<Value>) -> Result<SeqNr, TaskError> {
        lifecycle::emit(&self.cell, Some(seq_nr), content.into())
    }

    /// Enter `input_required`. Only this task changes; parents are untouched.
    pub fn require_input(&self, message: impl Into<String>) -> Result<(), TaskError> {
        lifecycle::set_active_status(
            self.manager.store(),
            &self.cell,
            TaskStatus::InputRequired,
            Some(message.into()),
        )
        .map(drop)
    }

    /// Return to `working`.
    pub fn resume_working(&self) -> Result<(), TaskError> {
        lifecycle::set_active_status(self.manager.store(), &self.cell, TaskStatus::Working, None)
            .map(drop)
    }

    /// Start a subtask under this task. It inherits this task's session;
    /// its TTL and poll interval are its own.
    pub async fn spawn_subtask(&self, request: OperationRequest) -> Result<TaskId, TaskError> {
        let child = self.manager.create(request, Some(&self.cell)).await?;
        Ok(child.id)
    }

    /// Wait for one of this task's subtasks and return its merged result.
    pub async fn subtask_result(&self, child: TaskId) -> Result<FinalResult, TaskError> {
        let known = self.cell.lock().children.contains(&child);
        if !known {
            return Err(TaskError::NotFound { task_id: child });
        }
        let cell = self.manager.store().get(&child).await?;
        cell.wait_terminal(None).await?;
        Ok(final_result_of(&cell))
    }

    /// Cancel every unfinished subtask of this task.
    pub async fn cancel_subtasks(&self) {
        let children = self.cell.lock().children.clone();
        for id in children {
            if let Some(child) = self.manager.store().try_get(&id).await {
                if child.is_terminal() {
                    continue;
                }
                match tree::cancel(self.manager.store(), &child).await {
                    Ok(snapshot) => {
                        debug!(task_id = %self.cell.id, child = %id, status = %snapshot.status, "subtask cancel requested");
                    }
                    Err(err) => {
                        debug!(task_id = %self.cell.id, child = %id, error = %err, "subtask cancel skipped");
                    }
                }
            }
        }
    }

    pub fn children(&self) -> Vec<TaskId> {
        self.cell.lock().children.clone()
    }

    /// `true` once cancellation was requested or the task was forced
    /// terminal.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when [`is_cancelled`](Self::is_cancelled) becomes true.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.cell.id)
            .field("method", &self.cell.method)
            .finish()
    }
}
