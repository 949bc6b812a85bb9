#[cfg(unix)]
mod unix_impl {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use procwarden_core::{
        OutputChunk, ProcessExit, ProcessHandle, ProcessId, ProcessSpawner, ProcessTermination,
        TerminationResult,
    };
    use std::collections::HashMap;
    use std::path::Path;
    use std::process::Stdio;
    use std::time::Duration;
    use sysinfo::System;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle with piped stdio.
    ///
    /// stdout and stderr are read as merged, tagged chunks; stdin stays
    /// writable until `close_stdin` releases it.
    pub struct UnixProcessHandle {
        child: Child,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        command: String,
        exit: Option<ProcessExit>,
    }

    impl UnixProcessHandle {
        fn new(mut child: Child, command: String) -> Self {
            let stdin = child.stdin.take();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            Self {
                child,
                stdin,
                stdout,
                stderr,
                command,
                exit: None,
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn pid(&self) -> Option<ProcessId> {
            self.child.id()
        }

        fn command(&self) -> &str {
            &self.command
        }

        async fn is_running(&self) -> bool {
            if self.exit.is_some() {
                return false;
            }
            let Some(pid) = self.pid() else {
                return false;
            };
            // Signal 0 probes existence without delivering anything
            signal::kill(NixPid::from_raw(pid as i32), None).is_ok()
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessExit>> {
            if let Some(exit) = self.exit {
                return Ok(Some(exit));
            }
            match self.child.try_wait()? {
                Some(status) => {
                    let exit = ProcessExit {
                        code: status.code(),
                    };
                    self.exit = Some(exit);
                    Ok(Some(exit))
                }
                None => Ok(None),
            }
        }

        async fn wait(&mut self) -> Result<ProcessExit> {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            let status = self.child.wait().await?;
            let exit = ProcessExit {
                code: status.code(),
            };
            self.exit = Some(exit);
            Ok(exit)
        }

        async fn read_chunk(&mut self, max_bytes: usize, timeout: Duration) -> Result<OutputChunk> {
            if self.stdout.is_none() && self.stderr.is_none() {
                return Ok(OutputChunk::Eof);
            }

            let mut out_buf = vec![0u8; max_bytes];
            let mut err_buf = vec![0u8; max_bytes];

            let read = tokio::time::timeout(timeout, async {
                match (self.stdout.as_mut(), self.stderr.as_mut()) {
                    (Some(out), Some(err)) => {
                        tokio::select! {
                            r = out.read(&mut out_buf) => (r, true),
                            r = err.read(&mut err_buf) => (r, false),
                        }
                    }
                    (Some(out), None) => (out.read(&mut out_buf).await, true),
                    (None, Some(err)) => (err.read(&mut err_buf).await, false),
                    (None, None) => unreachable!("checked above"),
                }
            })
            .await;

            match read {
                Err(_) => Ok(OutputChunk::Idle),
                Ok((Ok(0), from_stdout)) => {
                    // That pipe hit end of stream; the other may still have data
                    if from_stdout {
                        self.stdout = None;
                    } else {
                        self.stderr = None;
                    }
                    if self.stdout.is_none() && self.stderr.is_none() {
                        Ok(OutputChunk::Eof)
                    } else {
                        Ok(OutputChunk::Idle)
                    }
                }
                Ok((Ok(n), true)) => {
                    out_buf.truncate(n);
                    Ok(OutputChunk::Stdout(out_buf))
                }
                Ok((Ok(n), false)) => {
                    err_buf.truncate(n);
                    Ok(OutputChunk::Stderr(err_buf))
                }
                Ok((Err(e), _)) => Err(e.into()),
            }
        }

        async fn write_line(&mut self, line: &str) -> Result<()> {
            let stdin = self
                .stdin
                .as_mut()
                .context("child stdin already released")?;
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok(())
        }

        fn close_stdin(&mut self) {
            // Dropping the handle closes the pipe; safe to call repeatedly
            self.stdin.take();
        }

        async fn kill(&mut self) -> Result<()> {
            if self.exit.is_some() {
                return Ok(());
            }
            self.child
                .kill()
                .await
                .map_err(|e| anyhow::anyhow!("failed to kill process: {e}"))
        }
    }

    /// Unix process backend: shell spawn plus signal-based termination
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl UnixProcessManager {
        pub fn new() -> Self {
            info!("initializing Unix process backend");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }

        /// Recursively find all descendants of `parent_pid`, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                #[allow(clippy::collapsible_if)]
                if let Some(ppid) = process.parent() {
                    if ppid.as_u32() == parent_pid {
                        let child_pid = pid.as_u32();
                        Self::find_children_recursive(system, child_pid, result);
                        result.push(child_pid);
                    }
                }
            }
        }

        fn send_signal(pid: ProcessId, sig: Signal) -> TerminationResult {
            match signal::kill(NixPid::from_raw(pid as i32), sig) {
                Ok(()) => {
                    debug!("sent {} to process {}", sig, pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    debug!("process {} not found (already terminated)", pid);
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!("permission denied signalling process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("failed to send {} to process {}: {}", sig, pid, e);
                    TerminationResult::Failed(format!("{sig} failed: {e}"))
                }
            }
        }
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessSpawner for UnixProcessManager {
        async fn spawn_shell(
            &self,
            command: &str,
            working_dir: &Path,
            env: &HashMap<String, String>,
        ) -> Result<Box<dyn ProcessHandle>, std::io::Error> {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .current_dir(working_dir)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // Own process group so teardown can reach the whole shell job
                .process_group(0);

            // Overrides merge onto the inherited environment
            for (key, value) in env {
                cmd.env(key, value);
            }

            let child = cmd.spawn()?;

            if let Some(pid) = child.id() {
                info!("spawned shell process: `{}` (PID: {})", command, pid);
            }

            Ok(Box::new(UnixProcessHandle::new(child, command.to_string())))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            match handle.pid() {
                Some(pid) => Self::send_signal(pid, Signal::SIGTERM),
                None => TerminationResult::ProcessNotFound,
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.pid() else {
                return TerminationResult::ProcessNotFound;
            };
            let result = Self::send_signal(pid, Signal::SIGKILL);
            if matches!(
                result,
                TerminationResult::Success | TerminationResult::ProcessNotFound
            ) {
                // Reap through the handle so no zombie lingers
                if let Err(e) = handle.kill().await {
                    debug!("handle kill cleanup failed: {}", e);
                }
            }
            result
        }

        async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self.system.lock().unwrap();
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, pid, &mut children);
            Ok(children)
        }

        async fn terminate_process_group(&self, pid: ProcessId) -> TerminationResult {
            let pgid = NixPid::from_raw(pid as i32);

            match signal::killpg(pgid, Signal::SIGTERM) {
                Ok(()) => {
                    debug!("sent SIGTERM to process group {}", pid);
                    tokio::time::sleep(Duration::from_millis(500)).await;

                    match signal::killpg(pgid, Signal::SIGKILL) {
                        Ok(()) | Err(nix::errno::Errno::ESRCH) => TerminationResult::Success,
                        Err(e) => {
                            warn!("failed to SIGKILL process group {}: {}", pid, e);
                            TerminationResult::Failed(format!("SIGKILL to group failed: {e}"))
                        }
                    }
                }
                Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(nix::errno::Errno::EPERM) => TerminationResult::AccessDenied,
                Err(e) => {
                    warn!("failed to SIGTERM process group {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGTERM to group failed: {e}"))
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn no_env() -> HashMap<String, String> {
            HashMap::new()
        }

        #[tokio::test]
        async fn test_spawn_and_wait() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_shell("exit 0", Path::new("."), &no_env())
                .await
                .unwrap();
            assert!(handle.pid().is_some());
            let exit = handle.wait().await.unwrap();
            assert!(exit.success());
        }

        #[tokio::test]
        async fn test_read_chunk_collects_output() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_shell("echo hello", Path::new("."), &no_env())
                .await
                .unwrap();

            let mut collected = Vec::new();
            loop {
                match handle
                    .read_chunk(1024, Duration::from_millis(500))
                    .await
                    .unwrap()
                {
                    OutputChunk::Stdout(bytes) | OutputChunk::Stderr(bytes) => {
                        collected.extend_from_slice(&bytes);
                    }
                    OutputChunk::Idle => continue,
                    OutputChunk::Eof => break,
                }
            }
            assert_eq!(String::from_utf8_lossy(&collected).trim(), "hello");
        }

        #[tokio::test]
        async fn test_stderr_is_tagged() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_shell("echo oops 1>&2", Path::new("."), &no_env())
                .await
                .unwrap();

            let mut saw_stderr = false;
            loop {
                match handle
                    .read_chunk(1024, Duration::from_millis(500))
                    .await
                    .unwrap()
                {
                    OutputChunk::Stderr(bytes) => {
                        assert_eq!(String::from_utf8_lossy(&bytes).trim(), "oops");
                        saw_stderr = true;
                    }
                    OutputChunk::Eof => break,
                    _ => continue,
                }
            }
            assert!(saw_stderr);
        }

        #[tokio::test]
        async fn test_write_line_reaches_child() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_shell("read answer; echo \"got $answer\"", Path::new("."), &no_env())
                .await
                .unwrap();

            handle.write_line("yes").await.unwrap();
            handle.close_stdin();

            let mut collected = Vec::new();
            loop {
                match handle
                    .read_chunk(1024, Duration::from_millis(500))
                    .await
                    .unwrap()
                {
                    OutputChunk::Stdout(bytes) | OutputChunk::Stderr(bytes) => {
                        collected.extend_from_slice(&bytes);
                    }
                    OutputChunk::Idle => continue,
                    OutputChunk::Eof => break,
                }
            }
            assert_eq!(String::from_utf8_lossy(&collected).trim(), "got yes");
        }

        #[tokio::test]
        async fn test_env_override_is_visible() {
            let manager = UnixProcessManager::new();
            let mut env = HashMap::new();
            env.insert("WARDEN_TEST_VAR".to_string(), "42".to_string());
            let mut handle = manager
                .spawn_shell("echo $WARDEN_TEST_VAR", Path::new("."), &env)
                .await
                .unwrap();

            let mut collected = Vec::new();
            loop {
                match handle
                    .read_chunk(1024, Duration::from_millis(500))
                    .await
                    .unwrap()
                {
                    OutputChunk::Stdout(bytes) => collected.extend_from_slice(&bytes),
                    OutputChunk::Eof => break,
                    _ => continue,
                }
            }
            assert_eq!(String::from_utf8_lossy(&collected).trim(), "42");
        }

        #[tokio::test]
        async fn test_graceful_termination_with_escalation() {
            let manager = UnixProcessManager::new();
            let mut handle = manager
                .spawn_shell("sleep 60", Path::new("."), &no_env())
                .await
                .unwrap();

            let result = manager
                .terminate_with_timeout(&mut *handle, Duration::from_secs(2), false)
                .await;
            assert_eq!(result, TerminationResult::Success);
            assert!(handle.try_wait().await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_spawn_failure_surfaces() {
            let manager = UnixProcessManager::new();
            let result = manager
                .spawn_shell("true", Path::new("/nonexistent/dir"), &no_env())
                .await;
            assert!(result.is_err());
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

// Stubs so dependents still compile on non-Unix targets
#[cfg(not(unix))]
pub struct UnixProcessHandle;

#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
