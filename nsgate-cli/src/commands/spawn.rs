//! Container start through an external runtime

use anyhow::{Context, Result};
use nix::unistd::setsid;
use nsgate_core::{Error, ExitOutcome};
use std::ffi::OsStr;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// What to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container<'a> {
    pub name: &'a str,
    pub lxcpath: &'a Path,
    pub config: &'a Path,
}

/// Starts a container in the foreground and reports how it ended
pub trait ContainerRuntime {
    fn start(&self, container: &Container<'_>) -> nsgate_core::Result<ExitOutcome>;
}

/// Runtime backed by `lxc-start --foreground`
#[derive(Debug, Clone)]
pub struct LxcStart {
    binary: PathBuf,
}

impl LxcStart {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args<'a>(container: &Container<'a>) -> Vec<&'a OsStr> {
        vec![
            OsStr::new("--name"),
            OsStr::new(container.name),
            OsStr::new("--lxcpath"),
            container.lxcpath.as_os_str(),
            OsStr::new("--rcfile"),
            container.config.as_os_str(),
            OsStr::new("--foreground"),
        ]
    }
}

impl ContainerRuntime for LxcStart {
    fn start(&self, container: &Container<'_>) -> nsgate_core::Result<ExitOutcome> {
        debug!(binary = %self.binary.display(), name = container.name, "Starting container");

        let status = Command::new(&self.binary)
            .args(Self::args(container))
            .status()
            .map_err(|e| Error::Runtime {
                message: format!("failed to run {}: {e}", self.binary.display()),
            })?;

        ExitOutcome::try_from(status)
    }
}

/// Start a new session unless stdin is a terminal.
///
/// Returns whether the process detached.
pub fn detach_if_noninteractive(stdin_is_terminal: bool) -> bool {
    if stdin_is_terminal {
        debug!("stdin is a terminal, keeping session");
        return false;
    }

    match setsid() {
        Ok(sid) => {
            debug!(sid = %sid, "Started new session");
            true
        }
        Err(e) => {
            // Already a session or group leader; carry on in the current one
            warn!(error = %e, "setsid failed, keeping session");
            false
        }
    }
}

/// Start a container through `runtime`
pub fn start_with<R: ContainerRuntime>(runtime: &R, container: &Container<'_>) -> Result<ExitOutcome> {
    let outcome = runtime
        .start(container)
        .with_context(|| format!("Failed to start container {}", container.name))?;

    info!(name = container.name, %outcome, "Container finished");
    Ok(outcome)
}

pub fn execute(name: &str, lxcpath: &Path, config: &Path, lxc_start: PathBuf) -> Result<ExitOutcome> {
    detach_if_noninteractive(std::io::stdin().is_terminal());

    let container = Container {
        name,
        lxcpath,
        config,
    };
    start_with(&LxcStart::new(lxc_start), &container)
}
