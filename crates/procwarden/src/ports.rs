//! Port probing and extraction of port numbers from shell commands.

use procwarden_core::{PatternConfig, SupervisorError};
use regex::Regex;
use std::net::TcpListener;
use std::sync::LazyLock;
use tracing::debug;

/// Whether something is already bound to `port` on the loopback interface.
///
/// Bind-probe: attempting to bind is the only portable answer, and it is
/// inherently racy. Treat the result as advisory.
pub fn is_port_in_use(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Scan upward from `start` for a bindable port.
pub fn find_available_port(start: u16, max_attempts: u16) -> Result<u16, SupervisorError> {
    for offset in 0..max_attempts {
        let Some(candidate) = start.checked_add(offset) else {
            break;
        };
        if !is_port_in_use(candidate) {
            return Ok(candidate);
        }
    }
    Err(SupervisorError::NoAvailablePort {
        start,
        attempts: max_attempts,
    })
}

// Explicit flags first, then host:port forms, then a bare :NNNN as a last
// resort. Order matters: `npm run dev -- --port 4000` must not fall through
// to the bare pattern.
static PORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"--port[=\s]+(\d+)",
        r"-p[=\s]+(\d+)",
        r"\bPORT=(\d+)",
        r"localhost:(\d+)",
        r"127\.0\.0\.1:(\d+)",
        r"0\.0\.0\.0:(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static BARE_PORT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":(\d{4,5})\b").unwrap());

/// Determine which port `command` will serve on.
///
/// Checks explicit flags and host:port forms in the command text, then the
/// known-command table in `patterns`, then falls back to `default`.
pub fn extract_port_from_command(command: &str, patterns: &PatternConfig, default: u16) -> u16 {
    for pattern in PORT_PATTERNS.iter() {
        if let Some(port) = first_port(pattern, command) {
            return port;
        }
    }

    // Bare :NNNN, but not when a file path follows (as in `node app.js:1234`
    // style typos or URLs with extensions)
    if let Some(captures) = BARE_PORT.captures(command) {
        if let Some(m) = captures.get(1) {
            let tail = &command[m.end()..];
            if !tail.contains('.') {
                if let Ok(port) = m.as_str().parse::<u16>() {
                    return port;
                }
            }
        }
    }

    let lower = command.to_lowercase();
    for (known, port) in &patterns.default_ports {
        if lower.contains(known.as_str()) {
            debug!("inferred port {} for `{}` from command table", port, command);
            return *port;
        }
    }

    default
}

fn first_port(pattern: &Regex, command: &str) -> Option<u16> {
    pattern
        .captures(command)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(command: &str) -> u16 {
        extract_port_from_command(command, &PatternConfig::default(), 3000)
    }

    #[test]
    fn test_extracts_explicit_flags() {
        assert_eq!(extract("npm run dev -- --port 4000"), 4000);
        assert_eq!(extract("vite --port=5174"), 5174);
        assert_eq!(extract("flask run -p 5001"), 5001);
        assert_eq!(extract("PORT=9000 npm start"), 9000);
    }

    #[test]
    fn test_extracts_host_forms() {
        assert_eq!(extract("serve -l localhost:8080"), 8080);
        assert_eq!(extract("uvicorn main:app --host 0.0.0.0:8001"), 8001);
        assert_eq!(extract("curl 127.0.0.1:9090"), 9090);
    }

    #[test]
    fn test_bare_port_last_resort() {
        assert_eq!(extract("some-server :8123"), 8123);
        // A file extension after the match disqualifies the bare form
        assert_eq!(extract("deploy :8123 to prod.example"), 3000);
    }

    #[test]
    fn test_known_command_table() {
        assert_eq!(extract("npm run dev"), 3000);
        assert_eq!(
            extract_port_from_command("vite", &PatternConfig::default(), 3000),
            5173
        );
        assert_eq!(extract("uvicorn main:app --reload"), 8000);
        assert_eq!(extract("python3 -m http.server"), 8000);
    }

    #[test]
    fn test_falls_back_to_default() {
        assert_eq!(extract("./run-my-thing"), 3000);
        assert_eq!(
            extract_port_from_command("./run-my-thing", &PatternConfig::default(), 8888),
            8888
        );
    }

    #[test]
    fn test_find_available_port() {
        let port = find_available_port(20_000, 100).unwrap();
        assert!(!is_port_in_use(port));
        assert!(port >= 20_000);
    }

    #[test]
    fn test_find_available_port_skips_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(bound));

        let port = find_available_port(bound, 100).unwrap();
        assert_ne!(port, bound);
    }

    #[test]
    fn test_no_available_port_reports_range() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();

        let err = find_available_port(bound, 1).unwrap_err();
        match err {
            SupervisorError::NoAvailablePort { start, attempts } => {
                assert_eq!(start, bound);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
