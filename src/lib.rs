//! invoker: a contest-style execution engine
//!
//! Runs untrusted programs as isolated process groups with per-process and
//! group-wide resource limits, accurate termination results, and lifecycle
//! events streamed to observers.

pub mod cgroup;
pub mod cli;
pub mod config;
pub mod container;
pub mod ctl;
pub mod exec;
pub mod notifier;
pub mod result;
pub mod task;
pub mod types;
