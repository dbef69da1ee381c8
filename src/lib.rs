#![forbid(unsafe_code)]

//! vigil: active check scheduling for host and service monitoring.
//!
//! The engine keeps two timed-event queues (high priority for housekeeping,
//! low priority for checks), runs due checks through a pluggable command
//! backend, reaps finished results, and re-plans the schedule when the
//! system clock jumps or checks bunch up.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use vigil::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use vigil::core::config::Config;
//! use vigil::events::queue::EventQueue;
//! ```

pub mod prelude;

pub mod checks;
pub mod core;
pub mod daemon;
pub mod events;
pub mod logger;
pub mod objects;
