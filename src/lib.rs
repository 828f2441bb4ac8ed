//! Tollgate - per-user quota enforcement
//!
//! This crate throttles expensive per-user operations (AI chat turns, quiz
//! generation) with fixed-window quotas. Counters live in a shared store,
//! privileged callers bypass accounting, and a retention sweeper removes
//! counters once their window is long past.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
