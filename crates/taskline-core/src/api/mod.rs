//! Public-facing facade for taskline-core.
//!
//! A [`TaskRuntime`] owns one task store and everything that operates on
//! it. Transports hold it behind an `Arc` and call the methods below; the
//! store, sequencer, tree coordinator and reaper are never exposed.
//!
//! # Quick-start
//!
//! ```rust,no_run
//! use serde_json::{Value, json};
//! use taskline_core::{
//!     OperationError, OperationRequest, RuntimeConfig, TaskContext, TaskRuntime, operation_fn,
//! };
//! use taskline_types::{CreateResponse, ResponseMode};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let runtime = TaskRuntime::new(RuntimeConfig::default());
//! runtime.register(
//!     "demo/echo",
//!     operation_fn(|ctx: TaskContext, params: Value| async move {
//!         ctx.emit(params)?;
//!         Ok::<_, OperationError>(None)
//!     }),
//! );
//!
//! let response = runtime
//!     .submit(OperationRequest::new("demo/echo", json!("hi")).with_modes([ResponseMode::Inline]))
//!     .await
//!     .unwrap();
//! if let CreateResponse::Inline { result, .. } = response {
//!     assert_eq!(result.content, vec![json!("hi")]);
//! }
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use taskline_types::{
    CreateResponse, FinalResult, ListFilter, ListPage, ResponseMode, ResultPage, SessionId,
    StreamEvent, TaskHandle, TaskId, TaskNotification, TaskResult, TaskSnapshot,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::runtime::config::RuntimeConfig;
use crate::runtime::dispatcher::{
    Dispatcher, final_result_of, parse_last_seq_nr, validate_last_seq_nr,
};
use crate::runtime::lifecycle::{LifecycleManager, negotiate};
use crate::runtime::operation::{Operation, OperationRegistry, OperationRequest};
use crate::runtime::query::QueryEngine;
use crate::runtime::reaper::{Reaper, ReaperHandle, SweepReport};
use crate::runtime::sequencer::DeliveryCursor;
use crate::runtime::storage::{TaskCell, TaskStore};
use crate::runtime::tree;
use crate::runtime::types::TaskError;

/// The task subsystem behind one receiver.
pub struct TaskRuntime {
    manager: LifecycleManager,
    dispatcher: Dispatcher,
    query: QueryEngine,
    reaper: Reaper,
    reaper_handle: Mutex<Option<ReaperHandle>>,
    config: Arc<RuntimeConfig>,
}

impl TaskRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_registry(config, OperationRegistry::new())
    }

    pub fn with_registry(config: RuntimeConfig, registry: OperationRegistry) -> Self {
        let config = Arc::new(config);
        let store = TaskStore::new(config.notification_capacity);
        Self {
            manager: LifecycleManager::new(store.clone(), registry, Arc::clone(&config)),
            dispatcher: Dispatcher::new(config.result_wait, config.stream_first_wait),
            query: QueryEngine::new(config.filter_support, config.page_size, config.max_page_size),
            reaper: Reaper::new(store, Arc::clone(&config)),
            reaper_handle: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        self.manager.registry()
    }

    /// Serve `method` with `operation`.
    pub fn register(&self, method: impl Into<String>, operation: impl Operation + 'static) {
        self.manager.registry().register(method, operation);
    }

    /// Create a task for `request` and answer in the negotiated mode.
    pub async fn submit(&self, request: OperationRequest) -> Result<CreateResponse, TaskError> {
        self.submit_with_cursor(request, &DeliveryCursor::new()).await
    }

    /// Like [`submit`](Self::submit), recording every fragment handed out
    /// inline or in the first stream batch on `cursor`, so later polls and
    /// subscriptions on the same cursor skip them.
    pub async fn submit_with_cursor(
        &self,
        request: OperationRequest,
        cursor: &DeliveryCursor,
    ) -> Result<CreateResponse, TaskError> {
        self.ensure_reaper()?;
        let mode = negotiate(&request.response_modes, &self.config.supported_modes);
        let cell = self.manager.create(request, None).await?;
        debug!(task_id = %cell.id, mode = %mode, "response mode negotiated");

        match mode {
            ResponseMode::Task => Ok(CreateResponse::Task {
                task: TaskHandle::from(&cell.snapshot()),
            }),
            ResponseMode::Stream => {
                let (fragments, complete) = self.dispatcher.first_fragments(&cell, cursor).await;
                Ok(CreateResponse::Stream {
                    task: TaskHandle::from(&cell.snapshot()),
                    fragments,
                    complete,
                })
            }
            ResponseMode::Inline => self.answer_inline(cell, cursor).await,
        }
    }

    async fn answer_inline(
        &self,
        cell: Arc<TaskCell>,
        cursor: &DeliveryCursor,
    ) -> Result<CreateResponse, TaskError> {
        let deadline = Instant::now() + self.config.inline_wait;
        match cell.wait_terminal(Some(deadline)).await {
            Ok(()) => {}
            Err(TaskError::Timeout { .. }) => {
                debug!(task_id = %cell.id, "inline wait elapsed, answering with a task handle");
                return Ok(CreateResponse::Task {
                    task: TaskHandle::from(&cell.snapshot()),
                });
            }
            Err(err) => return Err(err),
        }

        let result = final_result_of(&cell);
        // Everything in `result` now counts as delivered on this cursor.
        self.dispatcher.poll(&cell, cursor);
        let snapshot = cell.snapshot();
        let task = if self.config.retain_inline_results || !snapshot.child_task_ids.is_empty() {
            Some(TaskHandle::from(&snapshot))
        } else {
            self.manager.store().remove(&cell.id).await;
            None
        };
        Ok(CreateResponse::Inline { result, task })
    }

    /// Current state of a task. Never blocks on the producer.
    pub async fn get(&self, session: &SessionId, task_id: TaskId) -> Result<TaskSnapshot, TaskError> {
        Ok(self.lookup(session, task_id).await?.snapshot())
    }

    /// Without `last_seq_nr`, block until the task is terminal and return
    /// the merged result. With it, return the fragments after it at once.
    ///
    /// `last_seq_nr` is the raw wire value; anything but a positive integer
    /// is rejected before the task is looked up.
    pub async fn result(
        &self,
        session: &SessionId,
        task_id: TaskId,
        last_seq_nr: Option<&str>,
        wait: Option<Duration>,
    ) -> Result<TaskResult, TaskError> {
        match last_seq_nr {
            Some(raw) => {
                let after = parse_last_seq_nr(raw)?;
                let cell = self.lookup(session, task_id).await?;
                Ok(TaskResult::Page(self.dispatcher.resume(&cell, after)))
            }
            None => self
                .final_result(session, task_id, wait)
                .await
                .map(TaskResult::Final),
        }
    }

    /// Fragments after `last_seq_nr`, which must be a positive integer.
    pub async fn resume(
        &self,
        session: &SessionId,
        task_id: TaskId,
        last_seq_nr: i64,
    ) -> Result<ResultPage, TaskError> {
        let after = validate_last_seq_nr(last_seq_nr)?;
        let cell = self.lookup(session, task_id).await?;
        Ok(self.dispatcher.resume(&cell, after))
    }

    /// Block until terminal, at most `wait` (default `result_wait`).
    pub async fn final_result(
        &self,
        session: &SessionId,
        task_id: TaskId,
        wait: Option<Duration>,
    ) -> Result<FinalResult, TaskError> {
        let cell = self.lookup(session, task_id).await?;
        self.dispatcher.final_result(&cell, wait).await
    }

    /// Fragments not yet delivered on `cursor`.
    pub async fn poll(
        &self,
        session: &SessionId,
        task_id: TaskId,
        cursor: &DeliveryCursor,
    ) -> Result<ResultPage, TaskError> {
        let cell = self.lookup(session, task_id).await?;
        Ok(self.dispatcher.poll(&cell, cursor))
    }

    /// Push every fragment not yet delivered on `cursor`, ending with a
    /// single completion event.
    pub async fn subscribe(
        &self,
        session: &SessionId,
        task_id: TaskId,
        cursor: DeliveryCursor,
    ) -> Result<BoxStream<'static, StreamEvent>, TaskError> {
        let cell = self.lookup(session, task_id).await?;
        Ok(self.dispatcher.subscribe(cell, cursor))
    }

    /// Cancel a task and all its unfinished descendants.
    pub async fn cancel(&self, session: &SessionId, task_id: TaskId) -> Result<TaskSnapshot, TaskError> {
        let cell = self.lookup(session, task_id).await?;
        tree::cancel(self.manager.store(), &cell).await
    }

    /// Whether `task_id` exists and belongs to `session`. No expiry side effects.
    pub async fn is_visible(&self, session: &SessionId, task_id: TaskId) -> bool {
        self.manager
            .store()
            .try_get(&task_id)
            .await
            .is_some_and(|cell| &cell.session == session)
    }

    pub async fn list(&self, session: &SessionId, filter: &ListFilter) -> Result<ListPage, TaskError> {
        self.query.list(self.manager.store(), session, filter).await
    }

    /// Advisory change signals. Lagging receivers lose the oldest entries.
    pub fn notifications(&self) -> broadcast::Receiver<TaskNotification> {
        self.manager.store().subscribe()
    }

    /// Run one reaper pass now.
    pub async fn sweep(&self) -> SweepReport {
        self.reaper.sweep().await
    }

    /// Refuse new tasks, stop the reaper and fail everything unfinished.
    ///
    /// Returns how many tasks were failed.
    pub async fn shutdown(&self) -> usize {
        self.manager.close();
        let handle = self
            .reaper_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        let failed = self.reaper.fail_all("task runtime shut down").await;
        info!(failed, "task runtime shut down");
        failed
    }

    /// Start the reaper on first use.
    fn ensure_reaper(&self) -> Result<(), TaskError> {
        if self.manager.is_closed() {
            return Err(TaskError::Shutdown);
        }
        let mut handle = self
            .reaper_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle.is_none() {
            *handle = Some(self.reaper.spawn());
        }
        Ok(())
    }

    /// Resolve `task_id` within `session`, applying any TTL expiry the
    /// reaper has not got to yet.
    async fn lookup(&self, session: &SessionId, task_id: TaskId) -> Result<Arc<TaskCell>, TaskError> {
        let store = self.manager.store();
        let cell = store.get(&task_id).await?;
        if &cell.session != session {
            return Err(TaskError::NotFound { task_id });
        }

        // The topmost overdue ancestor forces the whole branch below it.
        let now = Instant::now();
        let mut overdue = None;
        let mut next = Some(Arc::clone(&cell));
        while let Some(node) = next {
            if !node.is_terminal() && node.is_expired(now) {
                overdue = Some(Arc::clone(&node));
            }
            next = match node.parent {
                Some(parent) => store.try_get(&parent).await,
                None => None,
            };
        }
        if let Some(root) = overdue {
            self.reaper.expire(&root).await;
        }
        Ok(cell)
    }
}

impl Drop for TaskRuntime {
    fn drop(&mut self) {
        let handle = self
            .reaper_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("methods", &self.manager.registry().methods())
            .finish_non_exhaustive()
    }
}
