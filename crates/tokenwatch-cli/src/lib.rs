//! tokenwatch-cli crate
//!
//! Pipeline configuration and the scheduler driving fetch, persist and score
//! cycles. The `tokenwatch` binary wraps these behind subcommands.

pub mod config;
pub mod scheduler;
