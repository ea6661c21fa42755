//! Asynchronous task execution with sequenced, resumable result delivery.
//!
//! Everything a caller needs goes through [`api::TaskRuntime`]; the store,
//! sequencer, tree coordinator and reaper behind it stay private.

mod runtime;

pub mod api;

pub use api::TaskRuntime;
pub use runtime::config::{FilterSupport, RuntimeConfig};
pub use runtime::context::TaskContext;
pub use runtime::dispatcher::{parse_last_seq_nr, validate_last_seq_nr};
pub use runtime::operation::{FnOperation, Operation, OperationRegistry, OperationRequest, operation_fn};
pub use runtime::reaper::SweepReport;
pub use runtime::sequencer::{DeliveryCursor, MAX_EMITTED_SEQ_NR};
pub use runtime::types::{OperationError, TaskError};
