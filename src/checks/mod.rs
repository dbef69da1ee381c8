//! Check dispatch, execution and result collection.

pub mod broker;
pub mod check_result;
pub mod checker;
pub mod command;
pub mod execution;
#[cfg(unix)]
pub mod process;
pub mod result_queue;
