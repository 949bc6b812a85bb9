use anyhow::Result;
use procwarden_core::{
    OutputChunk, ProcessBackend, ProcessHandle, ProcessId, ProcessStatus, StartRequest,
    SupervisorConfig, SupervisorError, TerminationResult,
};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked with each decoded, newline-stripped output line
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Snapshot of a managed process, safe to hand to callers
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub pid: ProcessId,
    pub name: String,
    pub command: String,
    pub working_dir: PathBuf,
    pub port: Option<u16>,
    pub status: ProcessStatus,
    pub started_at: SystemTime,
    pub health_check_url: Option<String>,
}

struct ProcessEntry {
    info: Mutex<ManagedProcess>,
    handle: tokio::sync::Mutex<Box<dyn ProcessHandle>>,
    output: Mutex<VecDeque<String>>,
    reader: CancellationToken,
}

impl ProcessEntry {
    fn snapshot(&self) -> ManagedProcess {
        self.info.lock().unwrap().clone()
    }

    fn set_status(&self, next: ProcessStatus) {
        let mut info = self.info.lock().unwrap();
        if info.status.can_transition_to(next) {
            info.status = next;
        } else {
            debug!(
                "ignoring status transition {:?} -> {:?} for pid {}",
                info.status, next, info.pid
            );
        }
    }

    fn push_line(&self, line: &str, cap: usize) {
        let mut lines = self.output.lock().unwrap();
        if lines.len() >= cap {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }
}

#[derive(Default)]
struct Tables {
    by_pid: HashMap<ProcessId, Arc<ProcessEntry>>,
    by_name: HashMap<String, ProcessId>,
}

struct RegistryInner {
    backend: Arc<dyn ProcessBackend>,
    config: SupervisorConfig,
    http: reqwest::Client,
    /// Single structural lock; held only for map mutation, never across
    /// handle operations or health probes.
    tables: Mutex<Tables>,
    hooks_installed: AtomicBool,
}

/// Sole authority over which child processes exist and their termination.
///
/// An explicit, injectable service: the composition root constructs one and
/// passes clones to every component that needs process control. Tests build
/// isolated instances instead of resetting shared global state.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new(backend: Arc<dyn ProcessBackend>, config: SupervisorConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.health_probe_timeout())
            .build()?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                backend,
                config,
                http,
                tables: Mutex::new(Tables::default()),
                hooks_installed: AtomicBool::new(false),
            }),
        })
    }

    /// Registry over the platform backend with default limits
    #[cfg(unix)]
    pub fn with_platform_defaults() -> Result<Self> {
        Self::new(
            Arc::new(procwarden_unix::UnixProcessManager::new()),
            SupervisorConfig::default(),
        )
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub(crate) fn backend(&self) -> Arc<dyn ProcessBackend> {
        self.inner.backend.clone()
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Flip the hooks-installed flag, returning whether it was already set
    pub(crate) fn mark_hooks_installed(&self) -> bool {
        self.inner.hooks_installed.swap(true, Ordering::SeqCst)
    }

    /// Start a managed subprocess.
    ///
    /// Registers the child under its pid and name (last start wins for the
    /// name lookup) and spawns one dedicated reader task that buffers
    /// decoded lines for the life of the pipe, streaming them to the
    /// callback when one is given.
    pub async fn start(
        &self,
        request: StartRequest,
        output_callback: Option<OutputCallback>,
    ) -> Result<ManagedProcess, SupervisorError> {
        if request.command.trim().is_empty() {
            return Err(SupervisorError::Validation(
                "command must not be empty".to_string(),
            ));
        }

        let handle = self
            .inner
            .backend
            .spawn_shell(&request.command, &request.working_dir, &request.env)
            .await
            .map_err(|source| SupervisorError::SpawnFailed {
                command: request.command.clone(),
                working_dir: request.working_dir.clone(),
                source,
            })?;

        let pid = handle
            .pid()
            .ok_or_else(|| anyhow::anyhow!("spawned child exited before it could be tracked"))?;

        let info = ManagedProcess {
            pid,
            name: request.name.clone(),
            command: request.command.clone(),
            working_dir: request.working_dir.clone(),
            port: request.port,
            status: ProcessStatus::Running,
            started_at: SystemTime::now(),
            health_check_url: request.health_check_url.clone(),
        };
        let entry = self.insert(info.clone(), handle);
        info!("tracking process `{}` (PID: {})", request.name, pid);

        self.spawn_reader(entry, output_callback);
        Ok(info)
    }

    /// Register an already-spawned child so it outlives the call that
    /// created it. Used by the background executor once a server is ready.
    ///
    /// A drain reader always runs for adopted processes so the output pipe
    /// cannot fill up after adoption.
    pub async fn adopt(
        &self,
        handle: Box<dyn ProcessHandle>,
        name: String,
        working_dir: PathBuf,
        port: Option<u16>,
        output_callback: Option<OutputCallback>,
    ) -> Result<ManagedProcess, SupervisorError> {
        let pid = handle
            .pid()
            .ok_or_else(|| anyhow::anyhow!("cannot adopt a process that already exited"))?;

        let info = ManagedProcess {
            pid,
            name: name.clone(),
            command: handle.command().to_string(),
            working_dir,
            port,
            status: ProcessStatus::Running,
            started_at: SystemTime::now(),
            health_check_url: None,
        };
        let entry = self.insert(info.clone(), handle);
        info!("adopted background process `{}` (PID: {})", name, pid);

        self.spawn_reader(entry, output_callback);
        Ok(info)
    }

    fn insert(&self, info: ManagedProcess, handle: Box<dyn ProcessHandle>) -> Arc<ProcessEntry> {
        let entry = Arc::new(ProcessEntry {
            info: Mutex::new(info.clone()),
            handle: tokio::sync::Mutex::new(handle),
            output: Mutex::new(VecDeque::new()),
            reader: CancellationToken::new(),
        });
        let mut tables = self.inner.tables.lock().unwrap();
        tables.by_pid.insert(info.pid, entry.clone());
        tables.by_name.insert(info.name, info.pid);
        entry
    }

    fn spawn_reader(&self, entry: Arc<ProcessEntry>, callback: Option<OutputCallback>) {
        let cap = self.inner.config.max_buffered_lines;
        let poll = self.inner.config.poll_interval();
        let cancel = entry.reader.clone();

        tokio::spawn(async move {
            let mut pending = String::new();
            loop {
                let chunk = {
                    let mut handle = entry.handle.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        chunk = handle.read_chunk(4096, poll) => chunk,
                    }
                };
                match chunk {
                    Ok(OutputChunk::Stdout(bytes)) | Ok(OutputChunk::Stderr(bytes)) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(idx) = pending.find('\n') {
                            let raw: String = pending.drain(..=idx).collect();
                            let line = raw.trim_end_matches(['\n', '\r']);
                            entry.push_line(line, cap);
                            if let Some(cb) = &callback {
                                invoke_callback(cb, line);
                            }
                        }
                    }
                    Ok(OutputChunk::Idle) => continue,
                    Ok(OutputChunk::Eof) => {
                        if !pending.is_empty() {
                            entry.push_line(&pending, cap);
                            if let Some(cb) = &callback {
                                invoke_callback(cb, &pending);
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        // Buffered output is preserved; liveness is judged
                        // independently of a failed read
                        debug!("output read failed, abandoning stream: {e}");
                        break;
                    }
                }
            }

            // Self-exit detection once the stream is done
            let mut handle = entry.handle.lock().await;
            if let Ok(Some(exit)) = handle.try_wait().await {
                entry.set_status(if exit.success() {
                    ProcessStatus::Stopped
                } else {
                    ProcessStatus::Failed
                });
            }
        });
    }

    /// Stop a managed process.
    ///
    /// Idempotent: an unknown pid reports false (no action needed) rather
    /// than erroring; an already-dead entry is marked Stopped and reports
    /// true. The stdin handle is released on every exit path.
    pub async fn stop(&self, pid: ProcessId, timeout: Duration, force: bool) -> bool {
        let entry = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.get(&pid).cloned()
        };
        let Some(entry) = entry else {
            debug!("stop requested for untracked pid {}, no action needed", pid);
            return false;
        };

        entry.reader.cancel();
        let mut handle = entry.handle.lock().await;

        if matches!(handle.try_wait().await, Ok(Some(_))) {
            handle.close_stdin();
            entry.set_status(ProcessStatus::Stopped);
            return true;
        }

        let result = self
            .inner
            .backend
            .terminate_with_timeout(&mut **handle, timeout, force)
            .await;
        handle.close_stdin();

        match result {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {
                info!("stopped process {}", pid);
                entry.set_status(ProcessStatus::Stopped);
                true
            }
            other => {
                warn!("failed to stop process {}: {:?}", pid, other);
                entry.set_status(ProcessStatus::Failed);
                false
            }
        }
    }

    /// Resolve a name through the name map and delegate to [`Self::stop`]
    pub async fn stop_by_name(&self, name: &str) -> bool {
        let pid = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_name.get(name).copied()
        };
        match pid {
            Some(pid) => self.stop(pid, self.inner.config.stop_timeout(), false).await,
            None => false,
        }
    }

    /// Stop every tracked process, returning the count actually stopped
    pub async fn stop_all(&self, timeout: Duration) -> usize {
        let pids: Vec<ProcessId> = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.keys().copied().collect()
        };
        let mut stopped = 0;
        for pid in pids {
            if self.stop(pid, timeout, false).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// List managed processes, optionally restricted to live ones
    pub async fn list(&self, alive_only: bool) -> Vec<ManagedProcess> {
        let entries: Vec<Arc<ProcessEntry>> = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.values().cloned().collect()
        };
        let mut result = Vec::new();
        for entry in entries {
            if alive_only && !self.refresh_liveness(&entry).await {
                continue;
            }
            result.push(entry.snapshot());
        }
        result
    }

    pub fn get(&self, pid: ProcessId) -> Option<ManagedProcess> {
        let tables = self.inner.tables.lock().unwrap();
        tables.by_pid.get(&pid).map(|entry| entry.snapshot())
    }

    pub fn get_by_name(&self, name: &str) -> Option<ManagedProcess> {
        let tables = self.inner.tables.lock().unwrap();
        let pid = tables.by_name.get(name)?;
        tables.by_pid.get(pid).map(|entry| entry.snapshot())
    }

    /// Captured output for a tracked process, newline-joined
    pub fn output(&self, pid: ProcessId) -> Option<String> {
        let entry = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.get(&pid).cloned()
        }?;
        let lines = entry.output.lock().unwrap();
        Some(lines.iter().cloned().collect::<Vec<_>>().join("\n"))
    }

    /// Exit code of a tracked process, if it has terminated
    pub async fn exit_code(&self, pid: ProcessId) -> Option<i32> {
        let entry = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.get(&pid).cloned()
        }?;
        let mut handle = entry.handle.lock().await;
        handle.try_wait().await.ok().flatten().and_then(|exit| exit.code)
    }

    pub(crate) fn update_status(&self, pid: ProcessId, status: ProcessStatus) {
        let entry = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.get(&pid).cloned()
        };
        if let Some(entry) = entry {
            entry.set_status(status);
        }
    }

    /// Check health of a tracked process.
    ///
    /// With a health-check URL set this is a bounded HTTP probe (anything
    /// below 500 counts as healthy); without one, alive means Running. The
    /// probe runs without holding the structural lock, so a slow endpoint
    /// never blocks a concurrent start or stop.
    pub async fn check_health(&self, pid: ProcessId) -> ProcessStatus {
        let entry = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.get(&pid).cloned()
        };
        let Some(entry) = entry else {
            return ProcessStatus::Stopped;
        };

        if !self.refresh_liveness(&entry).await {
            return ProcessStatus::Stopped;
        }

        let health_check_url = entry.info.lock().unwrap().health_check_url.clone();
        let status = match health_check_url {
            Some(url) => match self.inner.http.get(&url).send().await {
                Ok(response) if response.status().as_u16() < 500 => ProcessStatus::Healthy,
                Ok(response) => {
                    debug!("health probe for pid {} returned {}", pid, response.status());
                    ProcessStatus::Unhealthy
                }
                Err(e) => {
                    debug!("health probe for pid {} failed: {}", pid, e);
                    ProcessStatus::Unhealthy
                }
            },
            None => ProcessStatus::Running,
        };
        entry.set_status(status);
        status
    }

    async fn refresh_liveness(&self, entry: &Arc<ProcessEntry>) -> bool {
        let mut handle = entry.handle.lock().await;
        match handle.try_wait().await {
            Ok(Some(exit)) => {
                entry.set_status(if exit.success() {
                    ProcessStatus::Stopped
                } else {
                    ProcessStatus::Failed
                });
                false
            }
            Ok(None) => true,
            // A failed poll does not imply process death
            Err(_) => handle.is_running().await,
        }
    }

    /// Session-teardown sweep: terminate everything with a short grace
    /// window, escalating to a hard kill, then clear the tracking tables.
    ///
    /// Called by the signal hooks and by the host's graceful-exit path.
    pub async fn shutdown_all(&self) -> usize {
        let count = {
            let tables = self.inner.tables.lock().unwrap();
            tables.by_pid.len()
        };
        if count > 0 {
            warn!("sweeping {} tracked processes at shutdown", count);
        }
        let stopped = self.stop_all(Duration::from_millis(250)).await;
        let mut tables = self.inner.tables.lock().unwrap();
        tables.by_pid.clear();
        tables.by_name.clear();
        stopped
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let pids: Vec<ProcessId> = {
            let tables = self.tables.lock().unwrap();
            tables.by_pid.keys().copied().collect()
        };
        if pids.is_empty() {
            return;
        }
        warn!(
            "registry dropped with {} tracked processes, attempting emergency cleanup",
            pids.len()
        );
        // No async in Drop; best-effort synchronous termination
        #[cfg(unix)]
        for pid in pids {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid as NixPid;

            if let Err(e) = signal::kill(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("emergency cleanup failed for process {}: {}", pid, e);
            }
        }
    }
}

fn invoke_callback(callback: &OutputCallback, line: &str) {
    // A misbehaving callback must not kill the reader
    if catch_unwind(AssertUnwindSafe(|| callback(line))).is_err() {
        warn!("output callback panicked, line dropped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn registry() -> ProcessRegistry {
        ProcessRegistry::with_platform_defaults().unwrap()
    }

    fn request(command: &str, name: &str) -> StartRequest {
        StartRequest::builder()
            .command(command)
            .name(name)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let registry = registry();
        let info = registry
            .start(request("sleep 100", "probe"), None)
            .await
            .unwrap();
        assert_eq!(info.status, ProcessStatus::Running);

        let stopped = registry.stop(info.pid, Duration::from_secs(2), false).await;
        assert!(stopped);
        assert_eq!(registry.get(info.pid).unwrap().status, ProcessStatus::Stopped);
        assert!(registry.list(true).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_pid_is_noop() {
        let registry = registry();
        assert!(!registry.stop(999_999, Duration::from_secs(1), false).await);
    }

    #[tokio::test]
    async fn test_stop_by_name_idempotent() {
        let registry = registry();
        registry
            .start(request("sleep 100", "n"), None)
            .await
            .unwrap();

        assert!(registry.stop_by_name("n").await);
        assert!(registry.list(true).await.is_empty());
        // Second stop of an already-stopped process is still not an error
        assert!(registry.stop_by_name("n").await);
        assert!(!registry.stop_by_name("missing").await);
    }

    #[tokio::test]
    async fn test_stop_all_counts() {
        let registry = registry();
        for i in 0..3 {
            registry
                .start(request("sleep 100", &format!("sleeper-{i}")), None)
                .await
                .unwrap();
        }
        let stopped = registry.stop_all(Duration::from_secs(2)).await;
        assert_eq!(stopped, 3);
        assert!(registry.list(true).await.is_empty());
    }

    #[tokio::test]
    async fn test_last_start_wins_for_name() {
        let registry = registry();
        let first = registry
            .start(request("sleep 100", "svc"), None)
            .await
            .unwrap();
        let second = registry
            .start(request("sleep 100", "svc"), None)
            .await
            .unwrap();

        assert_ne!(first.pid, second.pid);
        assert_eq!(registry.get_by_name("svc").unwrap().pid, second.pid);
        // Both pids remain individually queryable
        assert!(registry.get(first.pid).is_some());
        assert!(registry.get(second.pid).is_some());

        registry.stop_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let registry = registry();
        let bad = StartRequest::builder()
            .command("true")
            .name("bad")
            .working_dir("/nonexistent/dir")
            .build()
            .unwrap();
        let result = registry.start(bad, None).await;
        assert!(matches!(result, Err(SupervisorError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let registry = registry();
        let result = registry.start(request("   ", "empty"), None).await;
        assert!(matches!(result, Err(SupervisorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_output_callback_receives_lines() {
        let registry = registry();
        let collected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let callback: OutputCallback = Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        });

        let info = registry
            .start(
                request("echo one; echo two", "echoer"),
                Some(callback),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        let lines = collected.lock().unwrap().clone();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(registry.output(info.pid).unwrap(), "one\ntwo");
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_kill_reader() {
        let registry = registry();
        let callback: OutputCallback = Arc::new(|_line: &str| panic!("misbehaving callback"));

        let info = registry
            .start(
                request("echo first; echo second", "panicky"),
                Some(callback),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        // Both lines were still buffered despite the callback panicking
        assert_eq!(registry.output(info.pid).unwrap(), "first\nsecond");
    }

    #[tokio::test]
    async fn test_self_exit_detection() {
        let registry = registry();
        let callback: OutputCallback = Arc::new(|_line: &str| {});
        let info = registry
            .start(request("exit 3", "short-lived"), Some(callback))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(registry.get(info.pid).unwrap().status, ProcessStatus::Failed);
        assert_eq!(registry.exit_code(info.pid).await, Some(3));
    }

    #[tokio::test]
    async fn test_check_health_without_url() {
        let registry = registry();
        let info = registry
            .start(request("sleep 100", "plain"), None)
            .await
            .unwrap();

        assert_eq!(registry.check_health(info.pid).await, ProcessStatus::Running);
        registry.stop(info.pid, Duration::from_secs(2), false).await;
        assert_eq!(registry.check_health(info.pid).await, ProcessStatus::Stopped);
        assert_eq!(registry.check_health(999_999).await, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_all_clears_tables() {
        let registry = registry();
        registry
            .start(request("sleep 100", "a"), None)
            .await
            .unwrap();
        registry
            .start(request("sleep 100", "b"), None)
            .await
            .unwrap();

        let swept = registry.shutdown_all().await;
        assert_eq!(swept, 2);
        assert!(registry.list(false).await.is_empty());
        assert!(registry.get_by_name("a").is_none());
    }
}
