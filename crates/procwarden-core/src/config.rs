use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Timeouts and limits governing the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Wall-clock limit for foreground and interactive runs (in seconds)
    #[serde(default = "default_foreground_timeout_secs")]
    pub foreground_timeout_secs: f64,

    /// Maximum time to wait for a background process's ready signal (in seconds)
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: f64,

    /// Graceful-termination window before escalating to a hard kill (in seconds)
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: f64,

    /// Short poll timeout for chunk reads (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Byte cap on captured output; a truncation notice is appended past it
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Line cap on each tracked process's retained output buffer
    #[serde(default = "default_max_buffered_lines")]
    pub max_buffered_lines: usize,

    /// Bounded timeout for HTTP health probes (in seconds)
    #[serde(default = "default_health_probe_timeout_secs")]
    pub health_probe_timeout_secs: f64,

    /// Treat "startup timed out but process still alive" as success.
    ///
    /// Many valid servers emit no recognizable banner; this is a product
    /// policy default, not a correctness guarantee.
    #[serde(default = "default_optimistic_startup")]
    pub optimistic_startup: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            foreground_timeout_secs: default_foreground_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_buffered_lines: default_max_buffered_lines(),
            health_probe_timeout_secs: default_health_probe_timeout_secs(),
            optimistic_startup: default_optimistic_startup(),
        }
    }
}

impl SupervisorConfig {
    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.foreground_timeout_secs <= 0.0 {
            return Err(anyhow::anyhow!("foreground_timeout_secs must be positive"));
        }
        if self.startup_timeout_secs <= 0.0 {
            return Err(anyhow::anyhow!("startup_timeout_secs must be positive"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("poll_interval_ms must be positive"));
        }
        if self.max_output_bytes == 0 {
            return Err(anyhow::anyhow!("max_output_bytes must be positive"));
        }
        if self.max_buffered_lines == 0 {
            return Err(anyhow::anyhow!("max_buffered_lines must be positive"));
        }
        Ok(())
    }

    pub fn foreground_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.foreground_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.startup_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.health_probe_timeout_secs)
    }
}

/// Request to start a tracked process through the registry
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct StartRequest {
    pub command: String,
    pub name: String,
    #[builder(default)]
    pub port: Option<u16>,
    #[builder(default = "PathBuf::from(\".\")")]
    pub working_dir: PathBuf,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub health_check_url: Option<String>,
}

impl StartRequest {
    pub fn builder() -> StartRequestBuilder {
        StartRequestBuilder::default()
    }
}

impl StartRequestBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

/// One command invocation handed to the streaming executor
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct ExecRequest {
    pub command: String,
    #[builder(default = "PathBuf::from(\".\")")]
    pub working_dir: PathBuf,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    /// Run in interactive mode, relaying detected prompts to the operator
    #[builder(default)]
    pub interactive: bool,
    /// Run detached, returning once a ready signal appears
    #[builder(default)]
    pub background: bool,
}

impl ExecRequest {
    pub fn builder() -> ExecRequestBuilder {
        ExecRequestBuilder::default()
    }
}

impl ExecRequestBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Request handed to the dev-server facade
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct DevServerRequest {
    pub command: String,
    #[builder(default = "String::from(\"dev-server\")")]
    pub name: String,
    #[builder(default)]
    pub port: Option<u16>,
    #[builder(default = "PathBuf::from(\".\")")]
    pub working_dir: PathBuf,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default = "true")]
    pub auto_open_browser: bool,
}

impl DevServerRequest {
    pub fn builder() -> DevServerRequestBuilder {
        DevServerRequestBuilder::default()
    }
}

impl DevServerRequestBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Pattern tables driving the output classifiers, command routing, and
/// default port lookup.
///
/// Passed in as configuration rather than hard-coded so new frameworks'
/// banners can be added without touching the execution loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternConfig {
    /// Regexes marking a line as an interactive prompt requiring input
    pub prompt_patterns: Vec<String>,
    /// Regexes marking a line as a server-ready signal
    pub ready_patterns: Vec<String>,
    /// Substrings identifying known long-running dev-server invocations
    pub long_running_commands: Vec<String>,
    /// Regexes for commands that must never run as dev servers
    pub blocked_server_patterns: Vec<String>,
    /// Known commands and their conventional ports, checked in order
    pub default_ports: Vec<(String, u16)>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            prompt_patterns: [
                r"\(y/n\)",
                r"\(yes/no\)",
                r"\[y/n\]",
                r"\[yes/no\]",
                r"proceed\?",
                r"continue\?",
                r"overwrite\?",
                r"ok to proceed",
                r"would you like to",
                r"do you want to",
                r"enter .*:",
                r"password:",
                r"username:",
                r"select.*:",
                r"choose.*:",
                r"pick.*:",
            ]
            .map(String::from)
            .to_vec(),
            ready_patterns: [
                r"listening on",
                r"listening at",
                r"server running",
                r"server started",
                r"server is running",
                r"ready on",
                r"ready in",
                r"started server",
                r"started at",
                r"started on",
                r"local:\s*http",
                r"➜\s*local:",
                r"ready -",
                r"▲ next",
                r"vite.*ready",
                r"dev server running",
                r"running on http",
                r"uvicorn running",
                r"starting.*server",
                r"serving at",
                r"serving on",
                r"serving http",
                r"running on all addresses",
                r"debugger is active",
                r"starting development server",
                r"quit the server",
                r"app listening",
                r"express.*listening",
                r"port \d+",
                r":\d{4,5}/?$",
            ]
            .map(String::from)
            .to_vec(),
            long_running_commands: [
                "npm run dev",
                "npm start",
                "npm run start",
                "yarn dev",
                "yarn start",
                "pnpm dev",
                "pnpm start",
                "next dev",
                "next start",
                "vite",
                "nuxt dev",
                "flask run",
                "uvicorn",
                "gunicorn",
                "python -m http.server",
                "python3 -m http.server",
                "django runserver",
                "manage.py runserver",
                "nodemon",
                "ts-node-dev",
                "tsx watch",
                "docker compose up",
                "docker-compose up",
                "cargo run",
                "go run",
            ]
            .map(String::from)
            .to_vec(),
            blocked_server_patterns: [
                r"\bsudo\b",
                r"\brm\s",
                r"\bkill\b",
                r">\s*/dev/",
                r"\bformat\b",
                r"\bdel\s+/",
                r"\brmdir\b",
            ]
            .map(String::from)
            .to_vec(),
            default_ports: [
                ("npm run dev", 3000),
                ("npm start", 3000),
                ("yarn dev", 3000),
                ("yarn start", 3000),
                ("pnpm dev", 3000),
                ("vite", 5173),
                ("next dev", 3000),
                ("nuxt dev", 3000),
                ("flask run", 5000),
                ("uvicorn", 8000),
                ("gunicorn", 8000),
                ("python -m http.server", 8000),
                ("python3 -m http.server", 8000),
                ("php -S", 8000),
                ("cargo run", 8080),
                ("go run", 8080),
            ]
            .map(|(cmd, port)| (cmd.to_string(), port))
            .to_vec(),
        }
    }
}

// Default value functions for serde
fn default_foreground_timeout_secs() -> f64 {
    120.0
}
fn default_startup_timeout_secs() -> f64 {
    60.0
}
fn default_stop_timeout_secs() -> f64 {
    10.0
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_output_bytes() -> usize {
    100_000
}
fn default_max_buffered_lines() -> usize {
    1_000
}
fn default_health_probe_timeout_secs() -> f64 {
    5.0
}
fn default_optimistic_startup() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.optimistic_startup);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_config() {
        let config = SupervisorConfig {
            foreground_timeout_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SupervisorConfig {
            max_output_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = SupervisorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: SupervisorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_start_request_builder() {
        let request = StartRequest::builder()
            .command("npm run dev")
            .name("frontend")
            .port(3000u16)
            .env("NODE_ENV", "development")
            .health_check_url("http://localhost:3000")
            .build()
            .unwrap();

        assert_eq!(request.command, "npm run dev");
        assert_eq!(request.port, Some(3000));
        assert_eq!(request.working_dir, PathBuf::from("."));
        assert_eq!(
            request.env.get("NODE_ENV").map(String::as_str),
            Some("development")
        );
    }

    #[test]
    fn test_exec_request_defaults() {
        let request = ExecRequest::builder().command("echo hi").build().unwrap();
        assert!(!request.interactive);
        assert!(!request.background);
        assert!(request.env.is_empty());
    }

    #[test]
    fn test_dev_server_request_defaults() {
        let request = DevServerRequest::builder()
            .command("npm run dev")
            .build()
            .unwrap();
        assert_eq!(request.name, "dev-server");
        assert!(request.auto_open_browser);
        assert_eq!(request.port, None);
    }

    #[test]
    fn test_pattern_config_tables_populated() {
        let patterns = PatternConfig::default();
        assert!(!patterns.prompt_patterns.is_empty());
        assert!(!patterns.ready_patterns.is_empty());
        assert!(!patterns.long_running_commands.is_empty());
        assert!(!patterns.blocked_server_patterns.is_empty());
        assert!(patterns.default_ports.iter().any(|(c, p)| c == "vite" && *p == 5173));
    }
}
