use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use taskline_types::error::codes;
use taskline_types::{
    ErrorPayload, ResponseMode, SeqNr, TaskId, TaskNotification, TaskSnapshot, TaskStatus,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::runtime::config::RuntimeConfig;
use crate::runtime::context::TaskContext;
use crate::runtime::operation::{Operation, OperationRegistry, OperationRequest};
use crate::runtime::storage::{TaskCell, TaskStore, duration_ms};
use crate::runtime::tree;
use crate::runtime::types::TaskError;

/// Pick the response mode for a request.
///
/// The requestor's list is scanned in its own preference order and the
/// first mode this receiver supports wins. No overlap means `task`.
pub fn negotiate(requested: &[ResponseMode], supported: &[ResponseMode]) -> ResponseMode {
    requested
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        .unwrap_or(ResponseMode::Task)
}

/// Who is driving a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// The operation's own outcome. Refused once cancellation is pending.
    Producer,
    Cancellation,
    Expiry,
    Shutdown,
}

/// Everything written by one terminal transition.
///
/// The optional final fragment, the status and the merged result are
/// committed under a single acquisition of the task's lock.
#[derive(Debug, Clone)]
pub struct TerminalWrite {
    pub status: TaskStatus,
    pub message: Option<String>,
    pub error: Option<ErrorPayload>,
    /// Final fragment appended just before the transition.
    pub output: Option<Value>,
    pub origin: WriteOrigin,
}

impl TerminalWrite {
    pub fn completed(output: Option<Value>) -> Self {
        Self {
            status: TaskStatus::Completed,
            message: None,
            error: None,
            output,
            origin: WriteOrigin::Producer,
        }
    }

    pub fn failed(error: ErrorPayload) -> Self {
        Self {
            status: TaskStatus::Failed,
            message: Some(error.message.clone()),
            error: Some(error),
            output: None,
            origin: WriteOrigin::Producer,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            message: Some("cancelled by request".into()),
            error: None,
            output: None,
            origin: WriteOrigin::Cancellation,
        }
    }

    pub fn by(mut self, origin: WriteOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Commit a terminal transition, then finish any ancestor whose pending
/// cancellation was only waiting on this task.
pub async fn commit_terminal(
    store: &TaskStore,
    cell: &Arc<TaskCell>,
    write: TerminalWrite,
) -> Result<TaskSnapshot, TaskError> {
    let snapshot = commit_once(store, cell, &write).await?;
    settle_ancestors(store, cell.parent).await;
    Ok(snapshot)
}

async fn commit_once(
    store: &TaskStore,
    cell: &Arc<TaskCell>,
    write: &TerminalWrite,
) -> Result<TaskSnapshot, TaskError> {
    loop {
        let child_ids = cell.lock().children.clone();
        let mut children = Vec::with_capacity(child_ids.len());
        for id in &child_ids {
            children.push(store.try_get(id).await);
        }

        let snapshot = {
            let mut state = cell.lock();
            if state.status.is_terminal() {
                return Err(TaskError::AlreadyTerminal {
                    task_id: cell.id,
                    status: state.status,
                });
            }
            if state.children.len() != child_ids.len() {
                // A subtask was attached while children were being resolved.
                continue;
            }
            if write.origin == WriteOrigin::Producer && state.cancel_requested {
                return Err(TaskError::CancelPending { task_id: cell.id });
            }

            let mut pending = Vec::new();
            let mut merged = Vec::new();
            for (id, child) in child_ids.iter().zip(&children) {
                let Some(child) = child else { continue };
                let child_state = child.lock();
                if !child_state.status.is_terminal() {
                    pending.push(*id);
                } else if let Some(content) = &child_state.final_content {
                    merged.extend(content.iter().cloned());
                }
            }
            if !pending.is_empty() {
                return Err(TaskError::ChildrenPending {
                    task_id: cell.id,
                    pending,
                });
            }

            if let Some(output) = &write.output {
                state.log.append_final(output.clone());
            }
            if let Some(error) = &write.error {
                state.log.append_error(error.clone());
            }
            merged.extend(state.log.contents().cloned());

            state.status = write.status;
            state.status_message = write.message.clone();
            state.error = write.error.clone();
            state.terminal_at = Some(Instant::now());
            state.final_content = Some(Arc::new(merged));
            state.touch();
            cell.snapshot_of(&state)
        };

        cell.publish();
        cell.signal_cancel();
        store.notify(TaskNotification::StatusChanged {
            task_id: cell.id,
            status: write.status,
        });
        match write.origin {
            WriteOrigin::Expiry | WriteOrigin::Shutdown => warn!(
                task_id = %cell.id,
                status = %write.status,
                origin = ?write.origin,
                "task forced terminal"
            ),
            _ => info!(
                task_id = %cell.id,
                status = %write.status,
                fragments = snapshot.last_seq_nr.unwrap_or(0),
                "task finished"
            ),
        }
        return Ok(snapshot);
    }
}

/// Walk up from `next`, finalizing ancestors that were asked to cancel and
/// have now seen their last child finish.
async fn settle_ancestors(store: &TaskStore, mut next: Option<TaskId>) {
    while let Some(id) = next {
        let Some(parent) = store.try_get(&id).await else {
            break;
        };
        let waiting = {
            let state = parent.lock();
            state.cancel_requested && !state.status.is_terminal()
        };
        if !waiting {
            break;
        }
        match commit_once(store, &parent, &TerminalWrite::cancelled()).await {
            Ok(_) => next = parent.parent,
            Err(_) => break,
        }
    }
}

/// Move between the two non-terminal states.
pub fn set_active_status(
    store: &TaskStore,
    cell: &TaskCell,
    to: TaskStatus,
    message: Option<String>,
) -> Result<TaskSnapshot, TaskError> {
    let (snapshot, changed) = {
        let mut state = cell.lock();
        let from = state.status;
        if from.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: cell.id,
                status: from,
            });
        }
        if to.is_terminal() || (from != to && !from.can_transition_to(to)) {
            return Err(TaskError::InvalidTransition {
                task_id: cell.id,
                from,
                to,
            });
        }
        if state.cancel_requested {
            return Err(TaskError::CancelPending { task_id: cell.id });
        }
        state.status = to;
        state.status_message = message;
        state.touch();
        (cell.snapshot_of(&state), from != to)
    };

    cell.publish();
    if changed {
        store.notify(TaskNotification::StatusChanged {
            task_id: cell.id,
            status: to,
        });
        info!(task_id = %cell.id, status = %to, "task status changed");
    }
    Ok(snapshot)
}

/// Append a fragment, stamping it with the next `seq_nr` unless the
/// producer picks one.
pub fn emit(cell: &TaskCell, seq_nr: Option<SeqNr>, content: Value) -> Result<SeqNr, TaskError> {
    let appended = {
        let mut state = cell.lock();
        if state.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: cell.id,
                status: state.status,
            });
        }
        if state.cancel_requested {
            return Err(TaskError::CancelPending { task_id: cell.id });
        }
        let appended = match seq_nr {
            None => Some(state.log.append(content)?),
            Some(seq_nr) => state.log.append_at(cell.id, seq_nr, content)?,
        };
        if appended.is_some() {
            state.touch();
        }
        appended
    };

    match appended {
        Some(fragment) => {
            cell.publish();
            debug!(task_id = %cell.id, seq_nr = fragment.seq_nr, "fragment appended");
            Ok(fragment.seq_nr)
        }
        None => Ok(seq_nr.unwrap_or_default()),
    }
}

/// Creates tasks and supervises their producers.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    store: TaskStore,
    registry: OperationRegistry,
    config: Arc<RuntimeConfig>,
    closed: Arc<AtomicBool>,
}

impl LifecycleManager {
    pub fn new(store: TaskStore, registry: OperationRegistry, config: Arc<RuntimeConfig>) -> Self {
        Self {
            store,
            registry,
            config,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Refuse every later `create`, including subtasks.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a task, optionally under `parent`, and start its producer.
    ///
    /// The record is in the store before this returns.
    pub async fn create(
        &self,
        request: OperationRequest,
        parent: Option<&Arc<TaskCell>>,
    ) -> Result<Arc<TaskCell>, TaskError> {
        if self.is_closed() {
            return Err(TaskError::Shutdown);
        }
        let operation = self
            .registry
            .get(&request.method)
            .ok_or_else(|| TaskError::UnknownMethod(request.method.clone()))?;
        let ttl = self.config.clamp_ttl(request.ttl);
        let poll_interval = request
            .poll_interval
            .unwrap_or(self.config.default_poll_interval);

        let cell = Arc::new(TaskCell::new(
            parent.map(|p| &**p),
            request.session,
            request.method,
            ttl,
            poll_interval,
        ));
        match parent {
            Some(parent) => {
                tree::attach(&self.store, parent, Arc::clone(&cell), self.config.max_tree_depth)
                    .await?
            }
            None => self.store.insert(Arc::clone(&cell)).await,
        }
        info!(
            task_id = %cell.id,
            parent_task_id = ?cell.parent,
            method = %cell.method,
            ttl_ms = duration_ms(ttl),
            "task created"
        );

        tokio::spawn(
            self.clone()
                .execute_task(Arc::clone(&cell), operation, request.params),
        );
        Ok(cell)
    }

    /// Run the producer in its own task and turn its outcome into exactly
    /// one terminal write.
    async fn execute_task(self, cell: Arc<TaskCell>, operation: Arc<dyn Operation>, params: Value) {
        let task_id = cell.id;
        let ctx = TaskContext::new(self.clone(), Arc::clone(&cell));
        let outcome = tokio::spawn(async move { operation.run(ctx, params).await }).await;

        let write = match outcome {
            Ok(Ok(output)) => TerminalWrite::completed(output),
            Ok(Err(err)) => {
                warn!(task_id = %task_id, code = err.code, error = %err, "operation failed");
                TerminalWrite::failed(err.into_payload())
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "producer panicked"
                } else {
                    "producer aborted"
                };
                error!(task_id = %task_id, reason, "producer crashed");
                TerminalWrite::failed(ErrorPayload::new(codes::PRODUCER_CRASHED, reason))
            }
        };
        self.finish(&cell, write).await;
    }

    /// Commit `write`, first waiting for every child to finish.
    pub async fn finish(&self, cell: &Arc<TaskCell>, write: TerminalWrite) -> Option<TaskSnapshot> {
        loop {
            match commit_terminal(&self.store, cell, write.clone()).await {
                Ok(snapshot) => return Some(snapshot),
                Err(TaskError::ChildrenPending { pending, .. }) => {
                    debug!(
                        task_id = %cell.id,
                        pending = pending.len(),
                        "waiting for subtasks before finishing"
                    );
                    self.await_children(&pending).await;
                }
                Err(err) => {
                    warn!(task_id = %cell.id, error = %err, "late producer outcome rejected");
                    return None;
                }
            }
        }
    }

    async fn await_children(&self, pending: &[TaskId]) {
        for id in pending {
            if let Some(child) = self.store.try_get(id).await {
                // Every child is eventually forced terminal by the reaper.
                let _ = child.wait_terminal(None).await;
            }
        }
    }
}
