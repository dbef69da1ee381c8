//! Activity logging: a JSONL writer fed by a non-blocking logger thread.

pub mod activity;
pub mod jsonl;
