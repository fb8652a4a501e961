//! Filesystem and process side of environment orchestration.

pub mod config;
pub mod environment;
pub mod executor;
pub mod liveness;
pub mod lock;
pub mod markers;
pub mod process;
