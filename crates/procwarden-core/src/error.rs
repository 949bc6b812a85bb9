use std::path::PathBuf;
use thiserror::Error;

/// Core error types for supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn `{command}` in {}: {source}", working_dir.display())]
    SpawnFailed {
        command: String,
        working_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` timed out after {timeout_secs:.1}s")]
    Timeout {
        command: String,
        timeout_secs: f64,
        output: String,
    },

    #[error("process `{command}` exited prematurely with code {exit_code:?}")]
    PrematureExit {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no available port found after {attempts} attempts starting at {start}")]
    NoAvailablePort { start: u16, attempts: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Output captured before the failure, when the variant carries any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            SupervisorError::Timeout { output, .. }
            | SupervisorError::PrematureExit { output, .. } => Some(output),
            _ => None,
        }
    }

    /// The command that failed, when the variant carries one.
    pub fn command(&self) -> Option<&str> {
        match self {
            SupervisorError::SpawnFailed { command, .. }
            | SupervisorError::Timeout { command, .. }
            | SupervisorError::PrematureExit { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Check if this error was rejected before any process was spawned
    pub fn is_validation(&self) -> bool {
        matches!(self, SupervisorError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SupervisorError::Timeout {
            command: "sleep 100".to_string(),
            timeout_secs: 2.0,
            output: "partial".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("sleep 100"));
        assert!(display.contains("timed out"));

        let error = SupervisorError::NoAvailablePort {
            start: 3000,
            attempts: 100,
        };
        let display = format!("{error}");
        assert!(display.contains("3000"));
        assert!(display.contains("100"));
    }

    #[test]
    fn test_captured_output() {
        let error = SupervisorError::PrematureExit {
            command: "npm run dev".to_string(),
            exit_code: Some(1),
            output: "module not found".to_string(),
        };
        assert_eq!(error.captured_output(), Some("module not found"));
        assert_eq!(error.command(), Some("npm run dev"));

        let error = SupervisorError::Validation("empty command".to_string());
        assert!(error.captured_output().is_none());
        assert!(error.is_validation());
    }

    #[test]
    fn test_spawn_failed_carries_context() {
        let error = SupervisorError::SpawnFailed {
            command: "does-not-exist".to_string(),
            working_dir: PathBuf::from("/tmp"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let display = format!("{error}");
        assert!(display.contains("does-not-exist"));
        assert!(display.contains("/tmp"));
    }
}
