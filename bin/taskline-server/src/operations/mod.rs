//! Built-in demonstration operations.
//!
//! Each one exercises a different part of the task lifecycle so the server
//! is useful without any real backend wired in.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use taskline_core::{Operation, OperationError, OperationRequest, TaskContext, TaskRuntime};
use taskline_types::TaskStatus;
use tracing::debug;

pub const ECHO: &str = "demo/echo";
pub const FANOUT: &str = "demo/fanout";
pub const FAIL: &str = "demo/fail";
pub const ASK: &str = "demo/ask";

const DEFAULT_DELAY_MS: u64 = 100;
const MAX_FANOUT: u64 = 16;

pub fn register_all(runtime: &TaskRuntime) {
    runtime.register(ECHO, Echo);
    runtime.register(FANOUT, Fanout);
    runtime.register(FAIL, Fail);
    runtime.register(ASK, Ask);
}

/// Emits one fragment per word of `text`.
pub struct Echo;

#[async_trait]
impl Operation for Echo {
    async fn run(&self, ctx: TaskContext, params: Value) -> Result<Option<Value>, OperationError> {
        let delay = delay_param(&params);
        for word in text_param(&params).split_whitespace() {
            if pause(&ctx, delay).await {
                return Ok(None);
            }
            ctx.emit(word)?;
        }
        Ok(None)
    }
}

/// Spawns `count` echo subtasks, waits for them, then reports a summary.
pub struct Fanout;

#[async_trait]
impl Operation for Fanout {
    async fn run(&self, ctx: TaskContext, params: Value) -> Result<Option<Value>, OperationError> {
        let count = params
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(3)
            .min(MAX_FANOUT);
        let child_params = json!({
            "text": text_param(&params),
            "delayMs": delay_ms(&params),
        });

        let mut children = Vec::new();
        for _ in 0..count {
            let request = OperationRequest::new(ECHO, child_params.clone());
            children.push(ctx.spawn_subtask(request).await?);
        }
        debug!(task_id = %ctx.task_id(), children = children.len(), "fanout spawned");

        let mut completed = 0;
        for child in children {
            if ctx.subtask_result(child).await?.status == TaskStatus::Completed {
                completed += 1;
            }
        }
        Ok(Some(json!({ "children": count, "completed": completed })))
    }
}

/// Emits a partial fragment, then fails.
pub struct Fail;

#[async_trait]
impl Operation for Fail {
    async fn run(&self, ctx: TaskContext, params: Value) -> Result<Option<Value>, OperationError> {
        ctx.emit(json!({ "partial": true }))?;
        pause(&ctx, delay_param(&params)).await;
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("demo failure");
        Err(OperationError::new(message).with_data(json!({ "method": FAIL })))
    }
}

/// Sits in `input_required` for `waitMs`, then resumes and completes.
pub struct Ask;

#[async_trait]
impl Operation for Ask {
    async fn run(&self, ctx: TaskContext, params: Value) -> Result<Option<Value>, OperationError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or("waiting for input");
        let wait = params
            .get("waitMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));

        ctx.require_input(prompt)?;
        if pause(&ctx, wait).await {
            return Ok(None);
        }
        ctx.resume_working()?;
        Ok(Some(json!("resumed")))
    }
}

fn text_param(params: &Value) -> &str {
    params
        .as_str()
        .or_else(|| params.get("text").and_then(Value::as_str))
        .unwrap_or_default()
}

fn delay_ms(params: &Value) -> u64 {
    params
        .get("delayMs")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_DELAY_MS)
}

fn delay_param(params: &Value) -> Duration {
    Duration::from_millis(delay_ms(params))
}

/// Sleep for `delay`; `true` if the task was cancelled meanwhile.
async fn pause(ctx: &TaskContext, delay: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
