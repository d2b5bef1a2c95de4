//! Namespace configuration

use nix::sched::CloneFlags;
use nsgate_core::{Error, IdKind, IdMapRange, Result};
use serde::{Deserialize, Serialize};
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;

/// Set of namespaces the child is cloned into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRequest {
    /// Enable mount namespace
    pub mount: bool,

    /// Enable PID namespace
    pub pid: bool,

    /// Enable user namespace
    pub user: bool,
}

impl Default for NamespaceRequest {
    fn default() -> Self {
        Self {
            mount: true,
            pid: true,
            user: false,
        }
    }
}

impl NamespaceRequest {
    /// Mount and PID namespaces, no user namespace
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request appropriate for an isolation mode
    #[must_use]
    pub fn for_mode(mode: &IsolationMode) -> Self {
        Self::new().with_user(mode.id_mapping().is_some())
    }

    /// Enable mount namespace
    #[must_use]
    pub fn with_mount(mut self, enable: bool) -> Self {
        self.mount = enable;
        self
    }

    /// Enable PID namespace
    #[must_use]
    pub fn with_pid(mut self, enable: bool) -> Self {
        self.pid = enable;
        self
    }

    /// Enable user namespace
    #[must_use]
    pub fn with_user(mut self, enable: bool) -> Self {
        self.user = enable;
        self
    }

    /// Convert to clone flags for clone(2)
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        flags
    }

    /// Get list of enabled namespace names
    #[must_use]
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = Vec::new();

        if self.mount {
            namespaces.push("mnt");
        }
        if self.pid {
            namespaces.push("pid");
        }
        if self.user {
            namespaces.push("user");
        }

        namespaces
    }
}

/// UID and GID ranges for a user namespace
///
/// At least one UID range is always present; GID ranges are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawIdMapping")]
pub struct IdMapping {
    uids: Vec<IdMapRange>,
    gids: Vec<IdMapRange>,
}

#[derive(Deserialize)]
struct RawIdMapping {
    uids: Vec<IdMapRange>,
    #[serde(default)]
    gids: Vec<IdMapRange>,
}

impl TryFrom<RawIdMapping> for IdMapping {
    type Error = Error;

    fn try_from(raw: RawIdMapping) -> Result<Self> {
        Self::new(raw.uids, raw.gids)
    }
}

impl IdMapping {
    /// Create a mapping from ordered UID and GID ranges
    ///
    /// # Errors
    /// Returns error if no UID range is given or a range sits in the wrong list
    pub fn new(uids: Vec<IdMapRange>, gids: Vec<IdMapRange>) -> Result<Self> {
        if uids.is_empty() {
            return Err(Error::invalid_config(
                "a user namespace needs at least one uid range",
            ));
        }

        if let Some(stray) = uids.iter().find(|r| r.kind() != IdKind::Uid) {
            return Err(Error::invalid_config(format!("{stray} listed as a uid range")));
        }
        if let Some(stray) = gids.iter().find(|r| r.kind() != IdKind::Gid) {
            return Err(Error::invalid_config(format!("{stray} listed as a gid range")));
        }

        Ok(Self { uids, gids })
    }

    /// Parse the range tokens of `usernsexec`:
    /// `u <ns> <host> <count> [...] [g <ns> <host> <count> [...]]`
    ///
    /// # Errors
    /// Returns error if the tokens do not form a `u` section of one or more triples,
    /// optionally followed by a `g` section of one or more triples
    pub fn parse_args<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let mut uids = Vec::new();
        let mut gids = Vec::new();
        let mut section: Option<IdKind> = None;
        let mut pending: Vec<&str> = Vec::with_capacity(3);

        for token in tokens {
            let token: &str = token.as_ref();
            if let Ok(kind) = token.parse::<IdKind>() {
                close_section(section, &pending, &uids, &gids)?;
                section = Some(open_section(section, kind)?);
                continue;
            }

            let Some(kind) = section else {
                return Err(Error::invalid_config(format!(
                    "unexpected '{token}' before the 'u' section"
                )));
            };

            pending.push(token);
            if pending.len() == 3 {
                let range = IdMapRange::parse(kind, pending[0], pending[1], pending[2])?;
                match kind {
                    IdKind::Uid => uids.push(range),
                    IdKind::Gid => gids.push(range),
                }
                pending.clear();
            }
        }

        close_section(section, &pending, &uids, &gids)?;

        if uids.is_empty() {
            return Err(Error::invalid_config(
                "usernsexec requires a 'u' section with at least one uid range",
            ));
        }

        Self::new(uids, gids)
    }

    /// UID ranges, in caller order
    #[must_use]
    pub fn uids(&self) -> &[IdMapRange] {
        &self.uids
    }

    /// GID ranges, in caller order (may be empty)
    #[must_use]
    pub fn gids(&self) -> &[IdMapRange] {
        &self.gids
    }

    /// Ranges of one kind
    #[must_use]
    pub fn ranges(&self, kind: IdKind) -> &[IdMapRange] {
        match kind {
            IdKind::Uid => &self.uids,
            IdKind::Gid => &self.gids,
        }
    }
}

fn open_section(current: Option<IdKind>, next: IdKind) -> Result<IdKind> {
    match (current, next) {
        (None, IdKind::Uid) | (Some(IdKind::Uid), IdKind::Gid) => Ok(next),
        (None, IdKind::Gid) => Err(Error::invalid_config(
            "gid ranges given without uid ranges ('u' must come first)",
        )),
        (Some(IdKind::Gid), IdKind::Uid) => Err(Error::invalid_config(
            "'u' section must come before the 'g' section",
        )),
        (Some(_), _) => Err(Error::invalid_config(format!(
            "duplicate '{}' section",
            next.marker()
        ))),
    }
}

fn close_section(
    current: Option<IdKind>,
    pending: &[&str],
    uids: &[IdMapRange],
    gids: &[IdMapRange],
) -> Result<()> {
    let Some(kind) = current else {
        return Ok(());
    };

    if !pending.is_empty() {
        return Err(Error::invalid_config(format!(
            "incomplete {kind} range '{}' (expected <ns start> <host start> <count>)",
            pending.join(" ")
        )));
    }

    let ranges = match kind {
        IdKind::Uid => uids,
        IdKind::Gid => gids,
    };
    if ranges.is_empty() {
        return Err(Error::invalid_config(format!(
            "'{}' section has no ranges",
            kind.marker()
        )));
    }

    Ok(())
}

/// How the child is isolated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationMode {
    /// Mount and PID namespaces only, no ID mapping
    Namespaces,
    /// Mount, PID and user namespaces, with ID mapping before exec
    UserNamespace(IdMapping),
}

impl IsolationMode {
    /// ID mapping to apply, if any
    #[must_use]
    pub const fn id_mapping(&self) -> Option<&IdMapping> {
        match self {
            Self::Namespaces => None,
            Self::UserNamespace(mapping) => Some(mapping),
        }
    }

    /// Subcommand name of this mode
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Namespaces => "nsexec",
            Self::UserNamespace(_) => "usernsexec",
        }
    }
}

/// Command executed inside the namespaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: CString,
    argv: Vec<CString>,
}

impl CommandSpec {
    /// Build from an argument vector whose first element is the program.
    ///
    /// Arguments are passed to exec as raw bytes and need not be UTF-8.
    ///
    /// # Errors
    /// Returns error if the vector is empty or an argument contains a NUL byte
    pub fn new<S: AsRef<OsStr>>(argv: &[S]) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::invalid_config("Command cannot be empty"));
        }

        let argv = argv
            .iter()
            .map(|arg| {
                let arg: &OsStr = arg.as_ref();
                CString::new(arg.as_bytes())
                    .map_err(|e| Error::invalid_config(format!("Invalid argument {arg:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        if argv[0].as_bytes().is_empty() {
            return Err(Error::invalid_config("Command cannot be empty"));
        }

        Ok(Self {
            program: argv[0].clone(),
            argv,
        })
    }

    /// Program looked up on `PATH` by execvp
    #[must_use]
    pub fn program(&self) -> &CString {
        &self.program
    }

    /// Full argument vector, program first
    #[must_use]
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// Printable form for logs
    #[must_use]
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
