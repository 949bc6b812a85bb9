//! Dev-server facade over the registry: command vetting, port resolution,
//! readiness polling, and browser launch.

use crate::ports::{extract_port_from_command, find_available_port, is_port_in_use};
use crate::registry::{OutputCallback, ProcessRegistry};
use backon::{ConstantBuilder, Retryable};
use procwarden_core::{
    DevServerRequest, PatternConfig, ProcessId, ProcessStatus, StartRequest, SupervisorError,
};
use regex::RegexBuilder;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 3000;
const READINESS_POLL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A managed dev server as reported to the caller
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub pid: ProcessId,
    pub name: String,
    pub url: String,
    pub port: u16,
    pub status: ProcessStatus,
    pub command: String,
}

/// Starts and tracks local development servers.
pub struct DevServerManager {
    registry: ProcessRegistry,
    patterns: PatternConfig,
    blocked: Vec<regex::Regex>,
}

impl DevServerManager {
    pub fn new(registry: ProcessRegistry, patterns: PatternConfig) -> anyhow::Result<Self> {
        let blocked = patterns
            .blocked_server_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| anyhow::anyhow!("invalid blocked-command pattern {pattern}: {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            registry,
            patterns,
            blocked,
        })
    }

    /// Reject commands that must never run as a dev server.
    ///
    /// A denylist, not a sandbox: it catches obvious destructive commands
    /// handed over by mistake, nothing more.
    pub fn validate_server_command(&self, command: &str) -> Result<(), SupervisorError> {
        if command.trim().is_empty() {
            return Err(SupervisorError::Validation(
                "server command must not be empty".to_string(),
            ));
        }
        for pattern in &self.blocked {
            if pattern.is_match(command) {
                return Err(SupervisorError::Validation(format!(
                    "command not allowed as a dev server: `{command}`"
                )));
            }
        }
        Ok(())
    }

    /// Start a dev server and wait for it to accept HTTP traffic.
    ///
    /// An unreachable server that is still running is reported as Unhealthy
    /// rather than torn down; plenty of servers are slow to bind or serve
    /// something a GET cannot see.
    pub async fn start_dev_server(
        &self,
        request: DevServerRequest,
        output_callback: Option<OutputCallback>,
    ) -> Result<ServerInfo, SupervisorError> {
        self.validate_server_command(&request.command)?;

        let requested = request.port.unwrap_or_else(|| {
            extract_port_from_command(&request.command, &self.patterns, DEFAULT_PORT)
        });
        let mut env = request.env.clone();
        let port = if is_port_in_use(requested) {
            let rerouted = find_available_port(requested, 100)?;
            warn!("port {requested} is busy, rerouting to {rerouted}");
            // Most dev servers honor PORT; ones that don't will still come
            // up on their configured port and be reported Unhealthy here
            env.insert("PORT".to_string(), rerouted.to_string());
            rerouted
        } else {
            requested
        };
        let url = format!("http://localhost:{port}");

        let start = StartRequest {
            command: request.command.clone(),
            name: request.name.clone(),
            port: Some(port),
            working_dir: request.working_dir.clone(),
            env,
            health_check_url: Some(url.clone()),
        };
        let info = self.registry.start(start, output_callback).await?;
        info!("dev server `{}` starting on {} (PID: {})", info.name, url, info.pid);

        let config = self.registry.config();
        let attempts = (config.startup_timeout().as_millis() / READINESS_POLL.as_millis())
            .max(1) as usize;
        // Startup means the port accepts a TCP connection; whether the
        // server speaks HTTP is a health-check question, not a startup one
        let reachable = (|| async {
            if self.wait_for_port(port).await {
                Ok(())
            } else {
                Err(anyhow::anyhow!("port {port} not accepting connections yet"))
            }
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(READINESS_POLL)
                .with_max_times(attempts),
        )
        .await
        .is_ok();

        if reachable {
            self.registry.update_status(info.pid, ProcessStatus::Healthy);
            info!("dev server `{}` is up at {}", info.name, url);
            if request.auto_open_browser {
                open_browser(&url);
            }
            return Ok(ServerInfo {
                pid: info.pid,
                name: info.name,
                url,
                port,
                status: ProcessStatus::Healthy,
                command: request.command,
            });
        }

        // Never reachable: distinguish a slow server from a dead one
        if self.registry.check_health(info.pid).await == ProcessStatus::Stopped {
            let exit_code = self.registry.exit_code(info.pid).await;
            let output = self.registry.output(info.pid).unwrap_or_default();
            return Err(SupervisorError::PrematureExit {
                command: request.command,
                exit_code,
                output,
            });
        }

        warn!(
            "dev server `{}` is running but {} is not responding",
            info.name, url
        );
        self.registry
            .update_status(info.pid, ProcessStatus::Unhealthy);
        Ok(ServerInfo {
            pid: info.pid,
            name: info.name,
            url,
            port,
            status: ProcessStatus::Unhealthy,
            command: request.command,
        })
    }

    /// Stop a server by pid or by name; true when a stop actually happened
    pub async fn stop_server(&self, pid: Option<ProcessId>, name: Option<&str>) -> bool {
        let timeout = self.registry.config().stop_timeout();
        match (pid, name) {
            (Some(pid), _) => self.registry.stop(pid, timeout, false).await,
            (None, Some(name)) => self.registry.stop_by_name(name).await,
            (None, None) => false,
        }
    }

    /// Live tracked processes that carry a port
    pub async fn list_servers(&self) -> Vec<ServerInfo> {
        self.registry
            .list(true)
            .await
            .into_iter()
            .filter_map(|info| {
                let port = info.port?;
                Some(ServerInfo {
                    pid: info.pid,
                    name: info.name,
                    url: format!("http://localhost:{port}"),
                    port,
                    status: info.status,
                    command: info.command,
                })
            })
            .collect()
    }

    /// One bounded TCP-connect probe against the loopback interface
    pub async fn wait_for_port(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio::net::TcpStream::connect(("127.0.0.1", port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// One bounded HTTP reachability probe; any response below 500 counts
    pub async fn wait_for_server(&self, url: &str) -> bool {
        match self.registry.http().get(url).send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(e) => {
                debug!("readiness probe for {url} failed: {e}");
                false
            }
        }
    }
}

/// Open `url` in the default browser, fire and forget.
fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let mut command = {
        let mut c = std::process::Command::new("open");
        c.arg(url);
        c
    };
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", "", url]);
        c
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut command = {
        let mut c = std::process::Command::new("xdg-open");
        c.arg(url);
        c
    };

    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    match command.spawn() {
        Ok(_) => info!("opened {url} in the default browser"),
        Err(e) => debug!("could not open browser for {url}: {e}"),
    }
}
