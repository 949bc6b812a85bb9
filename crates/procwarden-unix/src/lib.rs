//! Unix process backend for procwarden
//!
//! Spawns shell commands in their own process group with piped stdio and
//! implements signal-based graceful/forced termination, including process
//! tree teardown for children the shell forked along the way.

mod unix_process_manager;

pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};
