//! Upload latency and throughput benchmark for eventually-consistent object
//! stores.
//!
//! A run copies a directory tree into a staging location under a run-scoped
//! namespace, polls the remote store until each file is visible, and writes a
//! per-file latency report.

pub mod config;
pub mod context;
pub mod core;
pub mod logging;
