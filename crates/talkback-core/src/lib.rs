//! Core types, config, errors, and metrics for Talkback.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;
