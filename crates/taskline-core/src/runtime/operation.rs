use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use taskline_types::{ResponseMode, SessionId};

use crate::runtime::context::TaskContext;
use crate::runtime::types::OperationError;

/// The underlying work a task wraps.
///
/// The runtime treats it as a black box: it only sees fragments emitted
/// through the [`TaskContext`] and the returned outcome. `Ok(Some(v))`
/// appends `v` as the final fragment and completes the task, `Ok(None)`
/// completes it as is, `Err` fails it.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(&self, ctx: TaskContext, params: Value) -> Result<Option<Value>, OperationError>;
}

/// Adapter that turns an async closure into an [`Operation`].
pub struct FnOperation<F>(F);

/// Wrap `f` so it can be registered as an operation.
pub fn operation_fn<F, Fut>(f: F) -> FnOperation<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, OperationError>> + Send + 'static,
{
    FnOperation(f)
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, OperationError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, params: Value) -> Result<Option<Value>, OperationError> {
        (self.0)(ctx, params).await
    }
}

/// Operations by method name. Cheap to clone; all clones share one table.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: Arc<RwLock<HashMap<String, Arc<dyn Operation>>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the operation served under `method`.
    pub fn register(&self, method: impl Into<String>, operation: impl Operation + 'static) {
        self.operations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), Arc::new(operation));
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Operation>> {
        self.operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

/// An inbound request that may be turned into a task.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub method: String,
    pub params: Value,
    pub ttl: Option<Duration>,
    pub poll_interval: Option<Duration>,
    /// Acceptable response modes, most preferred first.
    pub response_modes: Vec<ResponseMode>,
    /// Ignored for subtasks, which inherit their parent's session.
    pub session: SessionId,
}

impl OperationRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            ttl: None,
            poll_interval: None,
            response_modes: Vec::new(),
            session: SessionId::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = ResponseMode>) -> Self {
        self.response_modes = modes.into_iter().collect();
        self
    }

    pub fn in_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }
}
