//! Session-teardown signal hooks.
//!
//! A host that owns its own signal handling should skip installation and
//! call [`crate::ProcessRegistry::shutdown_all`] from its handler instead;
//! nothing here installs itself implicitly.

use crate::ProcessRegistry;
use tracing::{info, warn};

/// Result of a [`CleanupHooks::install`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Hooks were installed by this call
    Installed,
    /// A previous call already installed hooks for this registry
    AlreadyInstalled,
}

/// Signal-driven cleanup for a process registry.
pub struct CleanupHooks;

impl CleanupHooks {
    /// Install SIGINT/SIGTERM/SIGHUP listeners that sweep the registry's
    /// tracked processes before the host dies.
    ///
    /// Idempotent per registry: repeated calls report
    /// [`InstallOutcome::AlreadyInstalled`] without spawning more listeners.
    /// After the sweep the default disposition is restored and the signal
    /// re-raised, so the process still dies with the conventional status.
    pub fn install(registry: &ProcessRegistry) -> InstallOutcome {
        if registry.mark_hooks_installed() {
            return InstallOutcome::AlreadyInstalled;
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::SignalKind;

            for kind in [
                SignalKind::interrupt(),
                SignalKind::terminate(),
                SignalKind::hangup(),
            ] {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let mut stream = match tokio::signal::unix::signal(kind) {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("failed to register signal listener: {e}");
                            return;
                        }
                    };
                    stream.recv().await;
                    info!("termination signal received, sweeping tracked processes");
                    registry.shutdown_all().await;
                    reraise(kind);
                });
            }
        }

        info!("cleanup hooks installed");
        InstallOutcome::Installed
    }
}

/// Restore the default disposition and re-deliver the signal.
#[cfg(unix)]
fn reraise(kind: tokio::signal::unix::SignalKind) {
    use nix::sys::signal::{self, SigHandler, Signal};

    let Ok(sig) = Signal::try_from(kind.as_raw_value()) else {
        return;
    };
    unsafe {
        if signal::signal(sig, SigHandler::SigDfl).is_err() {
            return;
        }
    }
    if let Err(e) = signal::raise(sig) {
        warn!("failed to re-raise {sig}: {e}");
    }
}
