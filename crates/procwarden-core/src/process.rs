use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Lifecycle status of a managed process.
///
/// Transitions are monotonic: Starting -> Running -> {Healthy | Unhealthy |
/// Failed} -> Stopped. Stopped is terminal; Healthy and Unhealthy may
/// alternate as health probes come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Stopped,
    Failed,
}

impl ProcessStatus {
    fn rank(self) -> u8 {
        match self {
            ProcessStatus::Starting => 0,
            ProcessStatus::Running => 1,
            ProcessStatus::Healthy | ProcessStatus::Unhealthy => 2,
            ProcessStatus::Failed => 3,
            ProcessStatus::Stopped => 4,
        }
    }

    /// Whether no further transitions are permitted from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::Stopped)
    }

    /// Whether moving to `next` preserves the monotonic lifecycle order.
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            ProcessStatus::Stopped => false,
            ProcessStatus::Failed => next == ProcessStatus::Stopped,
            _ => next.rank() >= self.rank(),
        }
    }
}

/// Exit information for a terminated child.
///
/// `code` is None when the child was terminated by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// One poll-bounded read from a child's output pipes.
#[derive(Debug)]
pub enum OutputChunk {
    /// Bytes read from stdout.
    Stdout(Vec<u8>),
    /// Bytes read from stderr.
    Stderr(Vec<u8>),
    /// The poll timeout elapsed with no data available.
    Idle,
    /// All output pipes reached end of stream.
    Eof,
}

/// Trait representing a handle to a running child process.
///
/// Platform backends implement this once; everything above it (registry,
/// executor) is platform independent.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if the process has exited)
    fn pid(&self) -> Option<ProcessId>;

    /// Get the command line that started this process
    fn command(&self) -> &str;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Try to get exit information without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessExit>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessExit>;

    /// Read up to `max_bytes` from the output pipes, waiting at most `timeout`
    async fn read_chunk(&mut self, max_bytes: usize, timeout: Duration) -> Result<OutputChunk>;

    /// Write one line plus a trailing newline to the child's stdin
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Release the child's stdin handle; idempotent
    fn close_stdin(&mut self);

    /// Kill the process (platform-specific implementation)
    async fn kill(&mut self) -> Result<()>;
}

/// Trait for spawning shell commands as managed children
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawn `command` through the OS shell in `working_dir`, with
    /// `env` merged onto the inherited environment.
    async fn spawn_shell(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Box<dyn ProcessHandle>, std::io::Error>;
}

/// Trait for process termination with graceful-then-forced escalation
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Terminate a single process gracefully (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a single process (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all child processes of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Terminate a process group (Unix only)
    async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult;

    /// Graceful terminate, bounded wait for exit, then escalate to a hard kill.
    async fn terminate_with_timeout(
        &self,
        handle: &mut dyn ProcessHandle,
        timeout: Duration,
        force: bool,
    ) -> TerminationResult {
        if !force {
            match self.terminate_gracefully(handle).await {
                TerminationResult::Success => {
                    let deadline = tokio::time::Instant::now() + timeout;
                    loop {
                        if let Ok(Some(_)) = handle.try_wait().await {
                            return TerminationResult::Success;
                        }
                        if tokio::time::Instant::now() >= deadline {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                TerminationResult::ProcessNotFound => return TerminationResult::Success,
                _ => {}
            }
        }
        match self.force_kill(handle).await {
            TerminationResult::ProcessNotFound => TerminationResult::Success,
            result => result,
        }
    }
}

/// Combined backend surface consumed by the registry and executor
pub trait ProcessBackend: ProcessSpawner + ProcessTermination {}

impl<T: ProcessSpawner + ProcessTermination> ProcessBackend for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use ProcessStatus::*;

        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Healthy));
        assert!(Running.can_transition_to(Unhealthy));
        assert!(Healthy.can_transition_to(Stopped));
        assert!(Failed.can_transition_to(Stopped));

        // Health may flap while the process lives
        assert!(Healthy.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Healthy));

        // No going backwards
        assert!(!Running.can_transition_to(Starting));
        assert!(!Healthy.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));

        // Stopped is terminal
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn test_process_exit_success() {
        assert!(ProcessExit { code: Some(0) }.success());
        assert!(!ProcessExit { code: Some(1) }.success());
        assert!(!ProcessExit { code: None }.success());
    }
}
