//! The asynchronous process-group executor
//!
//! Stream resolution, child startup, outcome classification, and the
//! supervision loop that drives a whole group.

pub mod group;
pub mod monitor;
pub mod starter;
pub mod streams;
