pub mod config;
pub mod context;
pub mod dispatcher;
pub mod lifecycle;
pub mod operation;
pub mod query;
pub mod reaper;
pub mod sequencer;
pub mod storage;
pub mod tree;
pub mod types;

#[cfg(test)]
mod tests;
