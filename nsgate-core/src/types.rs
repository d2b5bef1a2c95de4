//! Core type definitions with strong typing and validation

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::str::FromStr;

use crate::{Error, Result};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        nix::unistd::Pid::from_raw(pid.0)
    }
}

/// How a reaped process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with the given status code
    Exited(u8),
    /// Killed by a signal
    Signaled(Signal),
}

impl ExitOutcome {
    /// Build an outcome from a `waitpid` result.
    ///
    /// Returns `None` for statuses that are not terminations (stopped, continued, ...).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            // The kernel only reports the low 8 bits of the exit code.
            WaitStatus::Exited(_, code) => Some(Self::Exited(code as u8)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Signaled(signal)),
            _ => None,
        }
    }
}

impl TryFrom<std::process::ExitStatus> for ExitOutcome {
    type Error = Error;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn try_from(status: std::process::ExitStatus) -> Result<Self> {
        if let Some(code) = status.code() {
            return Ok(Self::Exited(code as u8));
        }

        let raw = status.signal().ok_or_else(|| Error::Wait {
            message: format!("process neither exited nor was signaled: {status}"),
        })?;

        Signal::try_from(raw)
            .map(Self::Signaled)
            .map_err(|e| Error::Wait {
                message: format!("unknown termination signal {raw}: {e}"),
            })
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by {}", signal.as_str()),
        }
    }
}

/// Which ID space a mapping range applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    /// User IDs
    Uid,
    /// Group IDs
    Gid,
}

impl IdKind {
    /// Section marker used on the command line (`u` / `g`)
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Uid => "u",
            Self::Gid => "g",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uid => write!(f, "uid"),
            Self::Gid => write!(f, "gid"),
        }
    }
}

impl FromStr for IdKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "u" => Ok(Self::Uid),
            "g" => Ok(Self::Gid),
            other => Err(Error::invalid_config(format!("unknown id kind '{other}'"))),
        }
    }
}

/// A contiguous range of IDs mapped from the namespace onto the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawIdMapRange")]
pub struct IdMapRange {
    kind: IdKind,
    namespace_start: u32,
    host_start: u32,
    count: u32,
}

#[derive(Deserialize)]
struct RawIdMapRange {
    kind: IdKind,
    namespace_start: u32,
    host_start: u32,
    count: u32,
}

impl TryFrom<RawIdMapRange> for IdMapRange {
    type Error = Error;

    fn try_from(raw: RawIdMapRange) -> Result<Self> {
        Self::new(raw.kind, raw.namespace_start, raw.host_start, raw.count)
    }
}

impl IdMapRange {
    /// Create a new range with validation
    ///
    /// # Errors
    /// Returns error if `count` is zero or either side of the range overflows `u32`
    pub fn new(kind: IdKind, namespace_start: u32, host_start: u32, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(Error::invalid_config(format!(
                "{kind} range {namespace_start}:{host_start} has zero length"
            )));
        }

        if namespace_start.checked_add(count).is_none() || host_start.checked_add(count).is_none()
        {
            return Err(Error::invalid_config(format!(
                "{kind} range {namespace_start}:{host_start}:{count} overflows the id space"
            )));
        }

        Ok(Self {
            kind,
            namespace_start,
            host_start,
            count,
        })
    }

    /// Parse a range from its three command-line fields
    ///
    /// # Errors
    /// Returns error if a field is not a decimal `u32` or the range is invalid
    pub fn parse(kind: IdKind, namespace_start: &str, host_start: &str, count: &str) -> Result<Self> {
        let field = |name: &str, value: &str| {
            value.parse::<u32>().map_err(|e| {
                Error::invalid_config(format!("invalid {kind} {name} '{value}': {e}"))
            })
        };

        Self::new(
            kind,
            field("namespace start", namespace_start)?,
            field("host start", host_start)?,
            field("count", count)?,
        )
    }

    /// ID space of this range
    #[must_use]
    pub const fn kind(&self) -> IdKind {
        self.kind
    }

    /// First ID inside the namespace
    #[must_use]
    pub const fn namespace_start(&self) -> u32 {
        self.namespace_start
    }

    /// First ID on the host
    #[must_use]
    pub const fn host_start(&self) -> u32 {
        self.host_start
    }

    /// Number of IDs in the range
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// The `(namespace_start, host_start, count)` triple as mapping-tool arguments
    #[must_use]
    pub fn to_args(&self) -> [String; 3] {
        [
            self.namespace_start.to_string(),
            self.host_start.to_string(),
            self.count.to_string(),
        ]
    }
}

impl fmt::Display for IdMapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}:{}",
            self.kind, self.namespace_start, self.host_start, self.count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_process_id() {
        let pid = ProcessId::from_raw(123);
        assert_eq!(pid.as_raw(), 123);

        let nix_pid = pid.as_nix_pid();
        assert_eq!(nix_pid.as_raw(), 123);
    }

    #[test]
    fn test_exit_outcome_from_wait_status() {
        let pid = Pid::from_raw(42);

        assert_eq!(
            ExitOutcome::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some(ExitOutcome::Exited(3))
        );
        assert_eq!(
            ExitOutcome::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(ExitOutcome::Signaled(Signal::SIGTERM))
        );
        assert_eq!(
            ExitOutcome::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
    }

    #[test]
    fn test_exit_outcome_from_exit_status() {
        use std::process::ExitStatus;

        // Raw wait statuses: exit code lives in bits 8..16, signal in the low 7 bits.
        let exited = ExitOutcome::try_from(ExitStatus::from_raw(7 << 8)).unwrap();
        assert_eq!(exited, ExitOutcome::Exited(7));

        let killed = ExitOutcome::try_from(ExitStatus::from_raw(Signal::SIGKILL as i32)).unwrap();
        assert_eq!(killed, ExitOutcome::Signaled(Signal::SIGKILL));
    }

    #[test]
    fn test_exit_outcome_display() {
        assert_eq!(ExitOutcome::Exited(1).to_string(), "exited with code 1");
        assert_eq!(
            ExitOutcome::Signaled(Signal::SIGTERM).to_string(),
            "killed by SIGTERM"
        );
    }

    #[test]
    fn test_id_range_validation() {
        assert!(IdMapRange::new(IdKind::Uid, 0, 100_000, 65536).is_ok());
        assert!(IdMapRange::new(IdKind::Uid, 0, 100_000, 0).is_err());
        assert!(IdMapRange::new(IdKind::Gid, u32::MAX, 0, 1).is_err());
        assert!(IdMapRange::new(IdKind::Gid, 0, u32::MAX - 1, 2).is_err());
    }

    #[test]
    fn test_id_range_upper_boundary() {
        // 0..u32::MAX stops at 4294967294; 4294967295 itself is never covered
        assert!(IdMapRange::new(IdKind::Uid, 0, 0, u32::MAX).is_ok());
        assert!(IdMapRange::new(IdKind::Uid, 1, 0, u32::MAX).is_err());
        assert!(IdMapRange::new(IdKind::Uid, 0, 1, u32::MAX).is_err());
        assert!(IdMapRange::new(IdKind::Gid, u32::MAX - 1, u32::MAX - 1, 1).is_ok());
    }

    #[test]
    fn test_id_range_parse() {
        let range = IdMapRange::parse(IdKind::Uid, "0", "100000", "65536").unwrap();
        assert_eq!(range.namespace_start(), 0);
        assert_eq!(range.host_start(), 100_000);
        assert_eq!(range.count(), 65536);
        assert_eq!(range.to_args(), ["0", "100000", "65536"]);

        let err = IdMapRange::parse(IdKind::Gid, "0", "-5", "1").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("host start"));
    }

    #[test]
    fn test_id_range_deserialize_validates() {
        let ok: IdMapRange = serde_json::from_str(
            r#"{"kind":"uid","namespace_start":0,"host_start":1000,"count":1}"#,
        )
        .unwrap();
        assert_eq!(ok.kind(), IdKind::Uid);

        let zero = serde_json::from_str::<IdMapRange>(
            r#"{"kind":"gid","namespace_start":0,"host_start":1000,"count":0}"#,
        );
        assert!(zero.is_err());
    }

    #[test]
    fn test_id_kind_parse() {
        assert_eq!("u".parse::<IdKind>().unwrap(), IdKind::Uid);
        assert_eq!("g".parse::<IdKind>().unwrap(), IdKind::Gid);
        assert!("x".parse::<IdKind>().is_err());
        assert!("uid".parse::<IdKind>().is_err());
        assert!("0".parse::<IdKind>().is_err());
        assert_eq!(IdKind::Gid.marker(), "g");
    }
}
