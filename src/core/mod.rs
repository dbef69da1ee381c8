//! Core types: errors, configuration, wall-clock timestamps.

pub mod clock;
pub mod config;
pub mod errors;
