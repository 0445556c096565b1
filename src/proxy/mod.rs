//! Helper process supervision
//!
//! Both helpers (the redsocks redirector and the Tor relay) follow the same
//! pattern: render a configuration file from typed settings, launch the
//! binary pointed at that file, and later kill it and delete the file.
//! `ProxyProcess` implements that pattern once; `ProcessTemplate`
//! describes what differs between helpers.
//!
//! # Lifecycle
//!
//! ```text
//! stopped --start()--> running --stop()--> stopped
//! ```
//!
//! `start()` on a running instance is a no-op, so concurrent starts collapse
//! into a single launch. `stop()` does not wait for the process to exit; a
//! background thread reaps it.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub mod redsocks;
pub mod tor;

pub use redsocks::RedsocksConfig;
pub use tor::TorConfig;

/// Errors raised while supervising a helper process
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid value for {field}: {value:?}")]
    Render { field: &'static str, value: String },

    #[error("failed to write {name} configuration: {source}")]
    ConfigFile {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill {name} (pid {pid}): {source}")]
    Kill {
        name: &'static str,
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("failed to remove {name} configuration {path:?}: {source}")]
    RemoveConfig {
        name: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} is not running")]
    NotRunning { name: &'static str },
}

impl ProcessError {
    pub fn is_not_running(&self) -> bool {
        matches!(self, ProcessError::NotRunning { .. })
    }
}

/// Per-helper configuration rendering
pub trait ProcessTemplate: Send + Sync {
    /// Helper name (e.g., "redsocks", "tor"), also used as temp file prefix
    fn name(&self) -> &'static str;

    /// Render the configuration file contents
    fn render(&self) -> Result<String, ProcessError>;

    /// Command-line arguments pointing the binary at its configuration
    fn args(&self, config_path: &Path) -> Vec<OsString>;
}

/// Reject values that would break out of a config directive
pub(crate) fn check_directive(field: &'static str, value: &str) -> Result<(), ProcessError> {
    if value
        .chars()
        .any(|c| matches!(c, ';' | '{' | '}' | '"' | '\n' | '\r'))
    {
        return Err(ProcessError::Render {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

struct Running {
    child: Child,
    config_path: PathBuf,
}

/// A supervised helper process
pub struct ProxyProcess<T: ProcessTemplate> {
    binary: PathBuf,
    runtime_dir: PathBuf,
    template: T,
    rendered: String,
    state: Mutex<Option<Running>>,
}

impl<T: ProcessTemplate> ProxyProcess<T> {
    /// Build a supervisor; the configuration is rendered (and validated) now
    pub fn new(
        binary: impl Into<PathBuf>,
        runtime_dir: impl Into<PathBuf>,
        template: T,
    ) -> Result<Self, ProcessError> {
        let rendered = template.render()?;
        Ok(Self {
            binary: binary.into(),
            runtime_dir: runtime_dir.into(),
            template,
            rendered,
            state: Mutex::new(None),
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn template(&self) -> &T {
        &self.template
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// PID of the running helper
    pub fn pid(&self) -> Option<u32> {
        self.running().as_ref().map(|r| r.child.id())
    }

    /// Path of the configuration file in use
    pub fn config_path(&self) -> Option<PathBuf> {
        self.running().as_ref().map(|r| r.config_path.clone())
    }

    /// Launch the helper unless it is already running
    pub fn start(&self) -> Result<(), ProcessError> {
        let name = self.template.name();
        let mut state = self.running();

        if state.is_some() {
            log::debug!("{} already running, not starting again", name);
            return Ok(());
        }

        let config_path = self.write_config()?;

        let spawned = Command::new(&self.binary)
            .args(self.template.args(&config_path))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                let _ = fs::remove_file(&config_path);
                return Err(ProcessError::Spawn { name, source });
            }
        };

        log::info!(
            "Started {} (pid {}) with configuration {:?}",
            name,
            child.id(),
            config_path
        );

        *state = Some(Running { child, config_path });
        Ok(())
    }

    /// Kill the helper and delete its configuration
    ///
    /// Both steps are attempted; the last failure is reported.
    pub fn stop(&self) -> Result<(), ProcessError> {
        let name = self.template.name();
        let running = self.running().take().ok_or(ProcessError::NotRunning { name })?;

        let Running {
            mut child,
            config_path,
        } = running;
        let pid = child.id();
        let mut result = Ok(());

        if let Err(source) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            log::error!("Failed to kill {} (pid {}): {}", name, pid, source);
            result = Err(ProcessError::Kill { name, pid, source });
        }

        // Reap in the background so the kernel can drop the process entry
        std::thread::spawn(move || match child.wait() {
            Ok(status) => log::debug!("{} (pid {}) exited: {}", name, pid, status),
            Err(e) => log::warn!("Failed to reap {} (pid {}): {}", name, pid, e),
        });

        if let Err(source) = fs::remove_file(&config_path) {
            log::error!("Failed to remove {:?}: {}", config_path, source);
            result = Err(ProcessError::RemoveConfig {
                name,
                path: config_path,
                source,
            });
        }

        if result.is_ok() {
            log::info!("Stopped {} (pid {})", name, pid);
        }
        result
    }

    fn write_config(&self) -> Result<PathBuf, ProcessError> {
        let name = self.template.name();
        let to_error = |source| ProcessError::ConfigFile { name, source };

        let mut file = tempfile::Builder::new()
            .prefix(name)
            .tempfile_in(&self.runtime_dir)
            .map_err(to_error)?;
        file.write_all(self.rendered.as_bytes()).map_err(to_error)?;

        let (_, path) = file.keep().map_err(|e| to_error(e.error))?;
        log::debug!("Wrote {} configuration to {:?}", name, path);
        Ok(path)
    }
}
