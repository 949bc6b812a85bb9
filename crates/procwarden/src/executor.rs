//! Streaming command execution with foreground, interactive, and background
//! strategies.
//!
//! All three share the same chunked poll loop over a [`ProcessHandle`]; they
//! differ in what they watch for. Foreground watches the clock, interactive
//! additionally watches for prompts to relay, background watches for a
//! server-ready signal and hands the surviving child to the registry.

use crate::registry::{OutputCallback, ProcessRegistry};
use procwarden_core::{
    ExecRequest, OutputChunk, OutputClassifier, ProcessHandle, ProcessId, SupervisorError,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one executed command
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Captured output, annotated with `[stderr]` prefixes, truncation
    /// notices, and a non-zero exit code line
    pub output: String,
    /// Pid of the still-running child, for background runs
    pub pid: Option<ProcessId>,
    /// Whether a server-ready signal was observed
    pub server_ready: bool,
}

/// Source of operator answers for relayed interactive prompts
pub trait InputProvider: Send + Sync {
    fn read_line(&self, prompt: &str) -> String;
}

/// Reads answers from the controlling terminal
pub struct TerminalInput;

impl InputProvider for TerminalInput {
    fn read_line(&self, prompt: &str) -> String {
        print!("{prompt} ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return String::new();
        }
        answer.trim_end_matches(['\n', '\r']).to_string()
    }
}

/// Executes shell commands against a registry's backend, streaming output
/// through the heuristic classifiers.
pub struct StreamingExecutor {
    registry: ProcessRegistry,
    classifier: Arc<OutputClassifier>,
    input: Arc<dyn InputProvider>,
    echo: Option<OutputCallback>,
}

impl StreamingExecutor {
    pub fn new(registry: ProcessRegistry, classifier: OutputClassifier) -> Self {
        Self {
            registry,
            classifier: Arc::new(classifier),
            input: Arc::new(TerminalInput),
            echo: None,
        }
    }

    /// Replace the prompt-answer source (tests use a scripted provider)
    pub fn with_input(mut self, input: Arc<dyn InputProvider>) -> Self {
        self.input = input;
        self
    }

    /// Stream annotated output lines to `callback` as they arrive
    pub fn with_echo(mut self, callback: OutputCallback) -> Self {
        self.echo = Some(callback);
        self
    }

    /// Run one command, routing it to the right strategy.
    ///
    /// Commands matching the long-running table are forced to the background
    /// strategy even without the explicit flag; running a dev server in the
    /// foreground would otherwise hang until the timeout.
    pub async fn run(&self, request: ExecRequest) -> Result<ExecOutcome, SupervisorError> {
        if request.command.trim().is_empty() {
            return Err(SupervisorError::Validation(
                "command must not be empty".to_string(),
            ));
        }
        if !request.working_dir.is_dir() {
            return Err(SupervisorError::Validation(format!(
                "working directory does not exist: {}",
                request.working_dir.display()
            )));
        }

        if request.background || self.classifier.is_long_running_command(&request.command) {
            if !request.background {
                info!(
                    "`{}` looks long-running, forcing background execution",
                    request.command
                );
            }
            self.run_background(&request).await
        } else if request.interactive {
            self.run_interactive(&request).await
        } else {
            self.run_foreground(&request).await
        }
    }

    /// Run to completion or timeout, capturing output.
    async fn run_foreground(&self, request: &ExecRequest) -> Result<ExecOutcome, SupervisorError> {
        let config = self.registry.config();
        let mut handle = self.spawn(request).await?;
        let mut collector = OutputCollector::new(config.max_output_bytes);
        let deadline = Instant::now() + config.foreground_timeout();
        let mut server_ready = false;

        loop {
            if Instant::now() >= deadline {
                warn!("`{}` timed out, killing", request.command);
                let _ = handle.kill().await;
                return Err(SupervisorError::Timeout {
                    command: request.command.clone(),
                    timeout_secs: config.foreground_timeout_secs,
                    output: collector.finish(None),
                });
            }

            match handle.read_chunk(4096, config.poll_interval()).await {
                Ok(OutputChunk::Stdout(bytes)) => {
                    server_ready |= self.collect(&mut collector, &bytes, false);
                }
                Ok(OutputChunk::Stderr(bytes)) => {
                    server_ready |= self.collect(&mut collector, &bytes, true);
                }
                Ok(OutputChunk::Idle) => {
                    if let Some(exit) = handle.try_wait().await? {
                        return Ok(ExecOutcome {
                            success: exit.success(),
                            exit_code: exit.code,
                            output: collector.finish(exit.code),
                            pid: None,
                            server_ready,
                        });
                    }
                }
                Ok(OutputChunk::Eof) => {
                    let exit = handle.wait().await?;
                    return Ok(ExecOutcome {
                        success: exit.success(),
                        exit_code: exit.code,
                        output: collector.finish(exit.code),
                        pid: None,
                        server_ready,
                    });
                }
                Err(e) => return Err(SupervisorError::Other(e)),
            }
        }
    }

    /// Foreground loop that additionally relays detected prompts to the
    /// input provider and writes answers back to the child's stdin.
    async fn run_interactive(&self, request: &ExecRequest) -> Result<ExecOutcome, SupervisorError> {
        let config = self.registry.config();
        let mut handle = self.spawn(request).await?;
        let mut collector = OutputCollector::new(config.max_output_bytes);
        let deadline = Instant::now() + config.foreground_timeout();
        let mut last_prompt_check = 0usize;
        let mut server_ready = false;

        loop {
            if Instant::now() >= deadline {
                let _ = handle.kill().await;
                return Err(SupervisorError::Timeout {
                    command: request.command.clone(),
                    timeout_secs: config.foreground_timeout_secs,
                    output: collector.finish(None),
                });
            }

            match handle.read_chunk(4096, config.poll_interval()).await {
                Ok(OutputChunk::Stdout(bytes)) => {
                    server_ready |= self.collect(&mut collector, &bytes, false);
                    self.maybe_relay(&mut *handle, &collector, &mut last_prompt_check)
                        .await?;
                }
                Ok(OutputChunk::Stderr(bytes)) => {
                    server_ready |= self.collect(&mut collector, &bytes, true);
                    self.maybe_relay(&mut *handle, &collector, &mut last_prompt_check)
                        .await?;
                }
                Ok(OutputChunk::Idle) => {
                    self.maybe_relay(&mut *handle, &collector, &mut last_prompt_check)
                        .await?;
                    if let Some(exit) = handle.try_wait().await? {
                        return Ok(ExecOutcome {
                            success: exit.success(),
                            exit_code: exit.code,
                            output: collector.finish(exit.code),
                            pid: None,
                            server_ready,
                        });
                    }
                }
                Ok(OutputChunk::Eof) => {
                    let exit = handle.wait().await?;
                    return Ok(ExecOutcome {
                        success: exit.success(),
                        exit_code: exit.code,
                        output: collector.finish(exit.code),
                        pid: None,
                        server_ready,
                    });
                }
                Err(e) => return Err(SupervisorError::Other(e)),
            }
        }
    }

    /// Test the unterminated remainder against the prompt classifier and
    /// relay it when it matches.
    ///
    /// Only output not yet seen by a previous check is considered, so an
    /// already-answered prompt is never relayed twice; only the partial
    /// line is tested, because a prompt waiting for input is by nature
    /// unterminated.
    async fn maybe_relay(
        &self,
        handle: &mut dyn ProcessHandle,
        collector: &OutputCollector,
        last_prompt_check: &mut usize,
    ) -> Result<(), SupervisorError> {
        if collector.seen_bytes() <= *last_prompt_check {
            return Ok(());
        }
        *last_prompt_check = collector.seen_bytes();
        let tail = collector.tail();
        if self.classifier.is_interactive_prompt(&tail) {
            self.relay_prompt(handle, &tail).await?;
        }
        Ok(())
    }

    async fn relay_prompt(
        &self,
        handle: &mut dyn ProcessHandle,
        prompt: &str,
    ) -> Result<(), SupervisorError> {
        debug!("relaying prompt: {prompt}");
        let provider = self.input.clone();
        let prompt_text = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || provider.read_line(&prompt_text))
            .await
            .map_err(|e| anyhow::anyhow!("input task failed: {e}"))?;
        handle.write_line(&answer).await?;
        if let Some(echo) = &self.echo {
            echo(&format!("> {answer}"));
        }
        Ok(())
    }

    /// Watch startup output for a ready signal, then hand the child to the
    /// registry and return while it keeps running.
    async fn run_background(&self, request: &ExecRequest) -> Result<ExecOutcome, SupervisorError> {
        let config = self.registry.config();
        let mut handle = self.spawn(request).await?;
        let mut collector = OutputCollector::new(config.max_output_bytes);
        let deadline = Instant::now() + config.startup_timeout();
        let mut ready = false;

        while !ready && Instant::now() < deadline {
            match handle.read_chunk(4096, Duration::from_secs(1)).await {
                Ok(OutputChunk::Stdout(bytes)) => {
                    ready |= self.collect(&mut collector, &bytes, false);
                }
                Ok(OutputChunk::Stderr(bytes)) => {
                    ready |= self.collect(&mut collector, &bytes, true);
                }
                Ok(OutputChunk::Idle) => {
                    if let Some(exit) = handle.try_wait().await? {
                        return Err(SupervisorError::PrematureExit {
                            command: request.command.clone(),
                            exit_code: exit.code,
                            output: collector.finish(None),
                        });
                    }
                }
                Ok(OutputChunk::Eof) => {
                    let exit = handle.wait().await?;
                    return Err(SupervisorError::PrematureExit {
                        command: request.command.clone(),
                        exit_code: exit.code,
                        output: collector.finish(None),
                    });
                }
                Err(e) => return Err(SupervisorError::Other(e)),
            }
        }

        if ready {
            // Give the burst that follows the banner a moment to flush
            match handle.read_chunk(4096, Duration::from_millis(500)).await {
                Ok(OutputChunk::Stdout(bytes)) => {
                    self.collect(&mut collector, &bytes, false);
                }
                Ok(OutputChunk::Stderr(bytes)) => {
                    self.collect(&mut collector, &bytes, true);
                }
                _ => {}
            }
            return self.adopt_running(handle, request, collector, true).await;
        }

        match handle.try_wait().await? {
            // Died right at the deadline: still a startup failure, with the
            // exit code preserved
            Some(exit) => Err(SupervisorError::PrematureExit {
                command: request.command.clone(),
                exit_code: exit.code,
                output: collector.finish(None),
            }),
            None if config.optimistic_startup => {
                // No recognizable banner, but the process survived the
                // window; the product default is to let it keep running
                info!(
                    "`{}` produced no ready signal within {:.0}s, assuming started",
                    request.command, config.startup_timeout_secs
                );
                self.adopt_running(handle, request, collector, false).await
            }
            None => {
                let _ = handle.kill().await;
                Err(SupervisorError::Timeout {
                    command: request.command.clone(),
                    timeout_secs: config.startup_timeout_secs,
                    output: collector.finish(None),
                })
            }
        }
    }

    async fn adopt_running(
        &self,
        handle: Box<dyn ProcessHandle>,
        request: &ExecRequest,
        collector: OutputCollector,
        server_ready: bool,
    ) -> Result<ExecOutcome, SupervisorError> {
        let pid = handle
            .pid()
            .ok_or_else(|| anyhow::anyhow!("background process exited during adoption"))?;
        self.registry
            .adopt(
                handle,
                format!("bg-{pid}"),
                request.working_dir.clone(),
                None,
                self.echo.clone(),
            )
            .await?;
        Ok(ExecOutcome {
            success: true,
            exit_code: None,
            output: collector.finish(None),
            pid: Some(pid),
            server_ready,
        })
    }

    async fn spawn(&self, request: &ExecRequest) -> Result<Box<dyn ProcessHandle>, SupervisorError> {
        self.registry
            .backend()
            .spawn_shell(&request.command, &request.working_dir, &request.env)
            .await
            .map_err(|source| SupervisorError::SpawnFailed {
                command: request.command.clone(),
                working_dir: request.working_dir.clone(),
                source,
            })
    }

    /// Feed a chunk into the collector; returns whether any completed line
    /// was a server-ready signal.
    fn collect(&self, collector: &mut OutputCollector, bytes: &[u8], stderr: bool) -> bool {
        let mut ready = false;
        for line in collector.push(bytes, stderr) {
            if self.classifier.is_server_ready(&line) {
                ready = true;
            }
            if let Some(echo) = &self.echo {
                if stderr {
                    echo(&format!("[stderr] {line}"));
                } else {
                    echo(&line);
                }
            }
        }
        ready
    }
}

/// Accumulates annotated output under a byte cap.
struct OutputCollector {
    text: String,
    pending_out: String,
    pending_err: String,
    seen_bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl OutputCollector {
    fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            pending_out: String::new(),
            pending_err: String::new(),
            seen_bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    /// Absorb raw bytes from one stream, returning the lines they completed.
    fn push(&mut self, bytes: &[u8], stderr: bool) -> Vec<String> {
        self.seen_bytes += bytes.len();
        let mut pending = std::mem::take(if stderr {
            &mut self.pending_err
        } else {
            &mut self.pending_out
        });
        pending.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(idx) = pending.find('\n') {
            let raw: String = pending.drain(..=idx).collect();
            let line = raw.trim_end_matches(['\n', '\r']).to_string();
            self.append_line(&line, stderr);
            lines.push(line);
        }

        *(if stderr {
            &mut self.pending_err
        } else {
            &mut self.pending_out
        }) = pending;
        lines
    }

    fn append_line(&mut self, line: &str, stderr: bool) {
        if self.truncated {
            return;
        }
        if self.text.len() >= self.max_bytes {
            self.truncated = true;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        if stderr {
            self.text.push_str("[stderr] ");
        }
        self.text.push_str(line);
    }

    /// Total bytes observed, including pending partial lines
    fn seen_bytes(&self) -> usize {
        self.seen_bytes
    }

    /// The unterminated remainder, for prompt detection. Empty when every
    /// received line was newline-terminated.
    fn tail(&self) -> String {
        if !self.pending_out.is_empty() {
            return self.pending_out.clone();
        }
        self.pending_err.clone()
    }

    /// Flush pending partial lines and render the final annotated output.
    fn finish(mut self, exit_code: Option<i32>) -> String {
        let pending_out = std::mem::take(&mut self.pending_out);
        if !pending_out.is_empty() {
            self.append_line(&pending_out, false);
        }
        let pending_err = std::mem::take(&mut self.pending_err);
        if !pending_err.is_empty() {
            self.append_line(&pending_err, true);
        }

        let mut output = self.text;
        if self.truncated {
            output.push_str(&format!(
                "\n... Output truncated at {} bytes.",
                self.max_bytes
            ));
        }
        if output.is_empty() {
            output.push_str("<no output>");
        }
        if let Some(code) = exit_code {
            if code != 0 {
                output.push_str(&format!("\n\nExit code: {code}"));
            }
        }
        output
    }
}
