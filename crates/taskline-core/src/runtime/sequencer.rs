use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use taskline_types::{ErrorPayload, Fragment, SeqNr, TaskId};

use crate::runtime::types::TaskError;

/// Highest `seq_nr` a producer emission may take. The two values above it
/// are kept for the output and error fragments of the terminal write, so a
/// task can always finish.
pub const MAX_EMITTED_SEQ_NR: SeqNr = SeqNr::MAX - 2;

/// Append-only, per-task log of sequenced fragments.
///
/// Fragments are stored in strictly increasing `seq_nr` order and never
/// removed, so any fragment ever assigned can be replayed for the life of
/// the task.
#[derive(Debug, Default)]
pub struct FragmentLog {
    fragments: Vec<Fragment>,
    last_assigned: SeqNr,
}

impl FragmentLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest `seq_nr` assigned so far.
    pub fn last_assigned(&self) -> Option<SeqNr> {
        (self.last_assigned > 0).then_some(self.last_assigned)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Stamp `content` with the next `seq_nr`.
    pub fn append(&mut self, content: Value) -> Result<Fragment, TaskError> {
        if self.last_assigned >= MAX_EMITTED_SEQ_NR {
            return Err(TaskError::SeqNrExhausted {
                last: self.last_assigned,
            });
        }
        Ok(self.push(self.last_assigned + 1, content, None))
    }

    /// Append the output fragment of a terminal write.
    pub fn append_final(&mut self, content: Value) -> Fragment {
        self.push(self.last_assigned.saturating_add(1), content, None)
    }

    /// Append the error-marked final fragment of a failing task.
    pub fn append_error(&mut self, error: ErrorPayload) -> Fragment {
        self.push(self.last_assigned.saturating_add(1), Value::Null, Some(error))
    }

    /// Append at a producer-chosen `seq_nr`, leaving a gap if it skips ahead.
    ///
    /// Re-emitting an existing `seq_nr` with identical content returns
    /// `Ok(None)`.
    pub fn append_at(
        &mut self,
        task_id: TaskId,
        seq_nr: SeqNr,
        content: Value,
    ) -> Result<Option<Fragment>, TaskError> {
        if seq_nr == 0 {
            return Err(TaskError::InvalidSeqNr("seqNr must be positive".into()));
        }
        if seq_nr > MAX_EMITTED_SEQ_NR {
            return Err(TaskError::SeqNrExhausted {
                last: self.last_assigned,
            });
        }
        if seq_nr > self.last_assigned {
            return Ok(Some(self.push(seq_nr, content, None)));
        }
        match self.get(seq_nr) {
            Some(existing) if existing.content == content && existing.error.is_none() => Ok(None),
            Some(_) => Err(TaskError::DuplicateSeqNr { task_id, seq_nr }),
            None => Err(TaskError::SeqNrRegression {
                task_id,
                seq_nr,
                last: self.last_assigned,
            }),
        }
    }

    pub fn get(&self, seq_nr: SeqNr) -> Option<&Fragment> {
        self.fragments
            .binary_search_by_key(&seq_nr, |f| f.seq_nr)
            .ok()
            .map(|idx| &self.fragments[idx])
    }

    /// All fragments with `seq_nr > after`, in order.
    pub fn after(&self, after: SeqNr) -> Vec<Fragment> {
        let start = self.fragments.partition_point(|f| f.seq_nr <= after);
        self.fragments[start..].to_vec()
    }

    pub fn last_error(&self) -> Option<&ErrorPayload> {
        self.fragments.last().and_then(|f| f.error.as_ref())
    }

    /// At least one fragment and none of them error-marked.
    pub fn has_usable_partial(&self) -> bool {
        !self.fragments.is_empty() && self.fragments.iter().all(|f| !f.is_error())
    }

    /// Fragment payloads in order, sequence metadata and error markers
    /// stripped.
    pub fn contents(&self) -> impl Iterator<Item = &Value> {
        self.fragments
            .iter()
            .filter(|f| !f.is_error())
            .map(|f| &f.content)
    }

    fn push(&mut self, seq_nr: SeqNr, content: Value, error: Option<ErrorPayload>) -> Fragment {
        let fragment = Fragment {
            seq_nr,
            content,
            error,
        };
        self.last_assigned = seq_nr;
        self.fragments.push(fragment.clone());
        fragment
    }
}

/// Delivery position shared by every channel of one consumer.
///
/// Inline, push and poll delivery for the same consumer all claim
/// fragments through one cursor, so each `seq_nr` leaves through at most one
/// of them.
#[derive(Debug, Clone, Default)]
pub struct DeliveryCursor(Arc<AtomicU64>);

impl DeliveryCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cursor that treats everything up to `seq_nr` as already delivered.
    pub fn starting_at(seq_nr: SeqNr) -> Self {
        Self(Arc::new(AtomicU64::new(seq_nr)))
    }

    /// Highest `seq_nr` delivered so far (`0` before the first).
    pub fn position(&self) -> SeqNr {
        self.0.load(Ordering::Acquire)
    }

    /// Keep only fragments not yet delivered and advance past them.
    ///
    /// `fragments` must be in increasing `seq_nr` order. Concurrent callers
    /// racing on the same cursor never both receive the same fragment.
    pub fn claim(&self, fragments: Vec<Fragment>) -> Vec<Fragment> {
        let mut current = self.position();
        loop {
            let fresh: Vec<Fragment> = fragments
                .iter()
                .filter(|f| f.seq_nr > current)
                .cloned()
                .collect();
            let Some(high) = fresh.last().map(|f| f.seq_nr) else {
                return fresh;
            };
            match self
                .0
                .compare_exchange(current, high, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return fresh,
                Err(actual) => current = actual,
            }
        }
    }
}
