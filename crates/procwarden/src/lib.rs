//! Process supervision for interactive CLI agents.
//!
//! A session-scoped supervisor for the child processes an agent spawns:
//! a [`ProcessRegistry`] as the sole authority over their lifecycle, a
//! [`StreamingExecutor`] running commands with foreground, interactive, and
//! background strategies, heuristic output classifiers, port probing, and a
//! [`DevServerManager`] facade for local development servers.
//!
//! Everything is explicit and injectable: build a registry over a platform
//! backend, pass clones to the components that need process control, and
//! install [`CleanupHooks`] once if the host does not own signal handling.

pub mod dev_server;
pub mod executor;
pub mod hooks;
pub mod ports;
pub mod registry;

pub use dev_server::{DevServerManager, ServerInfo};
pub use executor::{ExecOutcome, InputProvider, StreamingExecutor, TerminalInput};
pub use hooks::{CleanupHooks, InstallOutcome};
pub use ports::{extract_port_from_command, find_available_port, is_port_in_use};
pub use registry::{ManagedProcess, OutputCallback, ProcessRegistry};

pub use procwarden_core::{
    DevServerRequest, DevServerRequestBuilder, ExecRequest, ExecRequestBuilder,
    OutputChunk, OutputClassification, OutputClassifier, PatternConfig, ProcessBackend,
    ProcessExit, ProcessHandle, ProcessId, ProcessSpawner, ProcessStatus, ProcessTermination,
    StartRequest, StartRequestBuilder, SupervisorConfig, SupervisorError, TerminationResult,
};

#[cfg(unix)]
pub use procwarden_unix::UnixProcessManager;
