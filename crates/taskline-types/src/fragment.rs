use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ErrorPayload;
use crate::id::TaskId;
use crate::status::TaskStatus;

/// Per-task fragment ordering key. Starts at 1; `0` never appears on a
/// fragment.
pub type SeqNr = u64;

/// One sequenced unit of partial result content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub seq_nr: SeqNr,
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
    /// Present on the final fragment of a task that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Fragment {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Fragments after a resumption point.
///
/// `complete == false` means more fragments may follow; poll again or keep
/// the stream open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultPage {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub fragments: Vec<Fragment>,
    pub complete: bool,
    /// Set when the caller's `lastSeqNr` is past anything this task ever
    /// assigned.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cursor_mismatch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResultPage {
    /// The `seqNr` to resume from after consuming this page.
    pub fn resume_from(&self, previous: SeqNr) -> SeqNr {
        self.fragments.last().map_or(previous, |f| f.seq_nr)
    }
}

/// The merged, de-sequenced result of a terminal task.
///
/// `content` holds every child's final content in `childTaskIds` order,
/// followed by this task's own fragments in `seqNr` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[schema(value_type = Vec<Object>)]
    pub content: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Answer to a `result` call: a resumption page when `lastSeqNr` was given,
/// the merged final result otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum TaskResult {
    Final(FinalResult),
    Page(ResultPage),
}

/// One event on a push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Fragment(Fragment),
    /// Last event of a stream. No fragments follow.
    #[serde(rename_all = "camelCase")]
    Complete {
        task_id: TaskId,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
}

impl StreamEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. })
    }
}

/// What a [`SequenceTracker`] concluded about one delivered fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Exactly the next expected `seqNr`.
    InOrder,
    /// One or more `seqNr`s were skipped: `missing_from..=missing_to`.
    Gap { missing_from: SeqNr, missing_to: SeqNr },
    /// Already seen; drop it.
    Duplicate,
}

/// Consumer-side bookkeeping for detecting gaps and duplicates.
///
/// After a [`Observation::Gap`] a consumer re-requests from
/// [`last_contiguous`](Self::last_contiguous). If the replay shows the same
/// jump the gap is real and [`confirm_gaps`](Self::confirm_gaps) moves the
/// resumption point forward.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last_seen: SeqNr,
    last_contiguous: SeqNr,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already-consumed position.
    pub fn resume_at(seq_nr: SeqNr) -> Self {
        Self {
            last_seen: seq_nr,
            last_contiguous: seq_nr,
        }
    }

    pub fn observe(&mut self, seq_nr: SeqNr) -> Observation {
        if seq_nr <= self.last_seen {
            return Observation::Duplicate;
        }
        let expected = self.last_seen + 1;
        let observation = if seq_nr == expected {
            if self.last_contiguous == self.last_seen {
                self.last_contiguous = seq_nr;
            }
            Observation::InOrder
        } else {
            Observation::Gap {
                missing_from: expected,
                missing_to: seq_nr - 1,
            }
        };
        self.last_seen = seq_nr;
        observation
    }

    pub fn last_seen(&self) -> SeqNr {
        self.last_seen
    }

    pub fn last_contiguous(&self) -> SeqNr {
        self.last_contiguous
    }

    pub fn has_gap(&self) -> bool {
        self.last_contiguous < self.last_seen
    }

    /// Accept every gap observed so far as permanent.
    pub fn confirm_gaps(&mut self) {
        self.last_contiguous = self.last_seen;
    }
}
