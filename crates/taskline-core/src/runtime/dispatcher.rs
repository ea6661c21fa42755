use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use taskline_types::{FinalResult, Fragment, ResultPage, SeqNr, StreamEvent};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::runtime::sequencer::DeliveryCursor;
use crate::runtime::storage::TaskCell;
use crate::runtime::types::TaskError;

/// Everything after `after`, plus whether the consumer is done.
///
/// `complete` is set when the task is terminal (this page holds every
/// remaining fragment) or when `after` lies past anything ever assigned.
pub fn page_after(cell: &TaskCell, after: SeqNr) -> ResultPage {
    let state = cell.lock();
    let highest = state.log.last_assigned().unwrap_or(0);
    let cursor_mismatch = after > highest;
    let fragments = if cursor_mismatch {
        Vec::new()
    } else {
        state.log.after(after)
    };
    ResultPage {
        task_id: cell.id,
        status: state.status,
        fragments,
        complete: cursor_mismatch || state.status.is_terminal(),
        cursor_mismatch,
        error: state.error.clone(),
    }
}

/// The merged result of a terminal task.
///
/// Called on a task that is not yet terminal it returns what has been
/// produced so far, with the current status.
pub fn final_result_of(cell: &TaskCell) -> FinalResult {
    let state = cell.lock();
    let content = match &state.final_content {
        Some(content) => content.as_ref().clone(),
        None => state.log.contents().cloned().collect(),
    };
    FinalResult {
        task_id: cell.id,
        status: state.status,
        content,
        error: state.error.clone(),
    }
}

/// Parse a wire `lastSeqNr`: it must be a positive integer.
pub fn parse_last_seq_nr(raw: &str) -> Result<SeqNr, TaskError> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| TaskError::InvalidSeqNr(raw.to_owned()))?;
    validate_last_seq_nr(value)
}

pub fn validate_last_seq_nr(value: i64) -> Result<SeqNr, TaskError> {
    if value <= 0 {
        return Err(TaskError::InvalidSeqNr(value.to_string()));
    }
    SeqNr::try_from(value).map_err(|_| TaskError::InvalidSeqNr(value.to_string()))
}

/// Serves fragments and results to consumers.
///
/// Poll and push are two readers of the same per-task log; neither holds
/// state of its own beyond the consumer's [`DeliveryCursor`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    result_wait: Duration,
    stream_first_wait: Duration,
}

impl Dispatcher {
    pub fn new(result_wait: Duration, stream_first_wait: Duration) -> Self {
        Self {
            result_wait,
            stream_first_wait,
        }
    }

    /// Resume after `last_seq_nr` (already validated).
    pub fn resume(&self, cell: &TaskCell, last_seq_nr: SeqNr) -> ResultPage {
        page_after(cell, last_seq_nr)
    }

    /// Resume and claim the page on `cursor`, so fragments already pushed
    /// to this consumer are not delivered again.
    pub fn poll(&self, cell: &TaskCell, cursor: &DeliveryCursor) -> ResultPage {
        let mut page = page_after(cell, cursor.position());
        page.fragments = cursor.claim(page.fragments);
        page
    }

    /// Block until the task is terminal, then return its merged result.
    pub async fn final_result(
        &self,
        cell: &TaskCell,
        wait: Option<Duration>,
    ) -> Result<FinalResult, TaskError> {
        let deadline = Instant::now() + wait.unwrap_or(self.result_wait);
        cell.wait_terminal(Some(deadline)).await?;
        Ok(final_result_of(cell))
    }

    /// Wait briefly for the first fragment, then claim whatever is there.
    ///
    /// Returns the claimed fragments and whether the task already finished.
    pub async fn first_fragments(
        &self,
        cell: &TaskCell,
        cursor: &DeliveryCursor,
    ) -> (Vec<Fragment>, bool) {
        let deadline = Instant::now() + self.stream_first_wait;
        let _ = cell
            .wait_for(Some(deadline), |s| !s.log.is_empty() || s.status.is_terminal())
            .await;
        let page = self.poll(cell, cursor);
        (page.fragments, page.status.is_terminal())
    }

    /// Push every fragment after the cursor as it is appended, then a single
    /// `Complete` event.
    pub fn subscribe(&self, cell: Arc<TaskCell>, cursor: DeliveryCursor) -> BoxStream<'static, StreamEvent> {
        let changes = cell.subscribe();
        let subscription = Subscription {
            cell,
            changes,
            cursor,
            pending: VecDeque::new(),
            done: false,
        };
        stream::unfold(subscription, |mut sub| async move {
            loop {
                if let Some(fragment) = sub.pending.pop_front() {
                    return Some((StreamEvent::Fragment(fragment), sub));
                }
                if sub.done {
                    return None;
                }
                let page = page_after(&sub.cell, sub.cursor.position());
                let claimed = sub.cursor.claim(page.fragments);
                if !claimed.is_empty() {
                    sub.pending.extend(claimed);
                    continue;
                }
                if page.complete {
                    sub.done = true;
                    let event = StreamEvent::Complete {
                        task_id: page.task_id,
                        status: page.status,
                        error: page.error,
                    };
                    return Some((event, sub));
                }
                if sub.changes.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}

struct Subscription {
    cell: Arc<TaskCell>,
    changes: watch::Receiver<u64>,
    cursor: DeliveryCursor,
    pending: VecDeque<Fragment>,
    done: bool,
}
