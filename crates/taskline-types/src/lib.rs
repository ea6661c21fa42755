//! Shared wire types for taskline.
//!
//! Everything in this crate is transport-agnostic and serializes with
//! camelCase field names so the same values can travel over JSON-RPC,
//! HTTP or SSE unchanged.

pub mod error;
pub mod filter;
pub mod fragment;
pub mod id;
pub mod mode;
pub mod notification;
pub mod status;
pub mod task;

pub use error::{ErrorPayload, ParseError, codes};
pub use filter::{FilterCriterion, ListFilter, ListPage, SortDirection, SortKey};
pub use fragment::{
    FinalResult, Fragment, Observation, ResultPage, SeqNr, SequenceTracker, StreamEvent, TaskResult,
};
pub use id::{SessionId, TaskId};
pub use mode::{CreateResponse, ResponseMode, TaskHandle};
pub use notification::TaskNotification;
pub use status::TaskStatus;
pub use task::TaskSnapshot;
