pub mod operation;
pub mod task;
