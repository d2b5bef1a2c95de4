//! UID/GID mapping through external setuid helpers

use nsgate_core::{Error, IdKind, IdMapRange, ProcessId, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error};

/// Writes the ID maps of a process that just entered a user namespace
///
/// This allows for different implementations:
/// - [`ShadowIdMapper`] - Production, via `newuidmap`/`newgidmap`
/// - Test doubles that record invocations or fail on demand
pub trait IdMapper {
    /// Map `ranges` of `kind` for the user namespace of `target`
    ///
    /// # Errors
    /// Returns [`Error::Mapping`] if the mapping could not be applied
    fn map(&self, kind: IdKind, target: ProcessId, ranges: &[IdMapRange]) -> Result<()>;
}

impl<T: IdMapper + ?Sized> IdMapper for &T {
    fn map(&self, kind: IdKind, target: ProcessId, ranges: &[IdMapRange]) -> Result<()> {
        (**self).map(kind, target, ranges)
    }
}

/// Runs the shadow-utils `newuidmap` / `newgidmap` tools.
///
/// The tools carry their own privilege (setuid root or file capabilities) and check the
/// ranges against `/etc/subuid` and `/etc/subgid`; this side never escalates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowIdMapper {
    newuidmap: PathBuf,
    newgidmap: PathBuf,
}

impl Default for ShadowIdMapper {
    fn default() -> Self {
        Self {
            newuidmap: PathBuf::from("newuidmap"),
            newgidmap: PathBuf::from("newgidmap"),
        }
    }
}

impl ShadowIdMapper {
    /// Mapper using `newuidmap` and `newgidmap` from `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the UID mapping tool
    #[must_use]
    pub fn with_newuidmap(mut self, path: impl Into<PathBuf>) -> Self {
        self.newuidmap = path.into();
        self
    }

    /// Override the GID mapping tool
    #[must_use]
    pub fn with_newgidmap(mut self, path: impl Into<PathBuf>) -> Self {
        self.newgidmap = path.into();
        self
    }

    /// Tool used for one kind of range
    #[must_use]
    pub fn tool(&self, kind: IdKind) -> &Path {
        match kind {
            IdKind::Uid => &self.newuidmap,
            IdKind::Gid => &self.newgidmap,
        }
    }
}

/// Arguments for a mapping tool: the target pid followed by one
/// `<ns start> <host start> <count>` triple per range, in order
#[must_use]
pub fn mapping_args(target: ProcessId, ranges: &[IdMapRange]) -> Vec<String> {
    let mut args = Vec::with_capacity(1 + ranges.len() * 3);
    args.push(target.to_string());
    args.extend(ranges.iter().flat_map(IdMapRange::to_args));
    args
}

impl IdMapper for ShadowIdMapper {
    fn map(&self, kind: IdKind, target: ProcessId, ranges: &[IdMapRange]) -> Result<()> {
        let tool = self.tool(kind);
        let args = mapping_args(target, ranges);

        debug!(tool = %tool.display(), args = ?args, "Writing {kind} map");

        let status = Command::new(tool).args(&args).status().map_err(|e| {
            error!(tool = %tool.display(), error = %e, "Failed to launch mapping tool");
            Error::Mapping {
                kind,
                message: format!("failed to run {}: {e}", tool.display()),
            }
        })?;

        if status.success() {
            debug!(tool = %tool.display(), pid = %target, "{kind} map written");
            return Ok(());
        }

        let message = match status.code() {
            Some(code) => format!("{} exited with status {code}", tool.display()),
            None => format!("{} terminated abnormally: {status}", tool.display()),
        };
        error!(tool = %tool.display(), pid = %target, %status, "Mapping tool failed");

        Err(Error::Mapping { kind, message })
    }
}
