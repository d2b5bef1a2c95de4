//! Command execution in freshly cloned namespaces
//!
//! This module uses `unsafe` for clone(2), which is inherently unsafe
//! but necessary to create the PID namespace for the child itself.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::wait::waitpid;
use nsgate_core::{Error, ExitOutcome, IdKind, ProcessId, Result};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::child;
use crate::config::{CommandSpec, IdMapping, IsolationMode, NamespaceRequest};
use crate::idmap::{IdMapper, ShadowIdMapper};
use crate::sync::{self, ChildEnd};

const STACK_SIZE: usize = 1024 * 1024;

/// A namespace child that has been cloned and not yet reaped
#[derive(Debug)]
pub struct ChildHandle {
    pid: ProcessId,
    started_at: Instant,
}

impl ChildHandle {
    /// PID of the child, as seen from the parent's PID namespace
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Wait for the child to terminate
    ///
    /// # Errors
    /// Returns [`Error::Wait`] if the child cannot be reaped
    pub fn wait(self) -> Result<ExitOutcome> {
        let pid = self.pid.as_nix_pid();

        loop {
            match waitpid(pid, None) {
                Ok(status) if status.pid() != Some(pid) => {
                    return Err(Error::Wait {
                        message: format!("waited for {}, got {status:?}", self.pid),
                    });
                }
                Ok(status) => {
                    if let Some(outcome) = ExitOutcome::from_wait_status(status) {
                        debug!(
                            pid = %self.pid,
                            %outcome,
                            elapsed = ?self.started_at.elapsed(),
                            "Namespace child reaped"
                        );
                        return Ok(outcome);
                    }
                    debug!(pid = %self.pid, ?status, "Child changed state, still waiting");
                }
                Err(Errno::EINTR) => {
                    debug!("Wait interrupted by signal, continuing...");
                }
                Err(e) => {
                    return Err(Error::Wait {
                        message: format!("waitpid({}) failed: {e}", self.pid),
                    });
                }
            }
        }
    }
}

/// Runs commands in new mount and PID namespaces, optionally inside a mapped user namespace
#[derive(Debug)]
pub struct NamespaceExecutor<M = ShadowIdMapper> {
    mode: IsolationMode,
    request: NamespaceRequest,
    proc_mount: PathBuf,
    mapper: M,
}

impl NamespaceExecutor<ShadowIdMapper> {
    /// Executor for `mode`, mapping ids with `newuidmap`/`newgidmap` from `PATH`
    #[must_use]
    pub fn new(mode: IsolationMode) -> Self {
        Self {
            request: NamespaceRequest::for_mode(&mode),
            mode,
            proc_mount: PathBuf::from("/proc"),
            mapper: ShadowIdMapper::new(),
        }
    }
}

impl<M: IdMapper> NamespaceExecutor<M> {
    /// Use a different ID mapper
    #[must_use]
    pub fn with_mapper<N: IdMapper>(self, mapper: N) -> NamespaceExecutor<N> {
        NamespaceExecutor {
            mode: self.mode,
            request: self.request,
            proc_mount: self.proc_mount,
            mapper,
        }
    }

    /// Override the namespace set derived from the mode.
    ///
    /// The request is used as given; ID mapping still follows the mode.
    #[must_use]
    pub fn with_request(mut self, request: NamespaceRequest) -> Self {
        self.request = request;
        self
    }

    /// Mount the new PID namespace's proc somewhere other than `/proc`
    #[must_use]
    pub fn with_proc_mount(mut self, target: impl Into<PathBuf>) -> Self {
        self.proc_mount = target.into();
        self
    }

    /// Namespaces the child will be cloned into
    #[must_use]
    pub const fn request(&self) -> &NamespaceRequest {
        &self.request
    }

    /// Validate `argv` and run it; see [`NamespaceExecutor::run`]
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty or malformed command, otherwise as `run`
    pub fn execute<S: AsRef<std::ffi::OsStr>>(&self, argv: &[S]) -> Result<ExitOutcome> {
        let command = CommandSpec::new(argv)?;
        self.run(&command)
    }

    /// Run `command` in new namespaces and wait for it.
    ///
    /// The child is only released to exec after every requested ID map has been written.
    /// Any failure before that point abandons the child, reaps it, and returns the error.
    /// With a PID namespace the outcome is the one reported by the namespace init; otherwise
    /// it is the child's own wait status.
    ///
    /// # Errors
    /// Returns error if the child cannot be created, fails its setup, the ID mapping fails,
    /// or the child cannot be reaped
    pub fn run(&self, command: &CommandSpec) -> Result<ExitOutcome> {
        let namespaces = self.request.enabled_namespaces();
        info!(
            mode = self.mode.name(),
            namespaces = ?namespaces,
            command = %command.display(),
            "Entering namespaces"
        );

        let (parent_end, child_end) = sync::channel()?;
        let child = self.spawn_child(child_end, parent_end.as_raw_fd(), command)?;

        debug!(pid = %child.pid(), "Waiting for namespace child to become ready");
        if let Err(e) = parent_end.wait_ready() {
            parent_end.abandon();
            let cause = match e {
                Error::ChannelClosed => {
                    Error::protocol("namespace child exited before signaling readiness")
                }
                other => other,
            };
            return Err(abort(child, cause));
        }

        if let Some(mapping) = self.mode.id_mapping() {
            if let Err(e) = self.map_ids(child.pid(), mapping) {
                parent_end.abandon();
                return Err(abort(child, e));
            }
        }

        debug!(pid = %child.pid(), "Releasing namespace child");
        if let Err(e) = parent_end.send_go() {
            parent_end.abandon();
            return Err(abort(child, e));
        }

        let reported = match parent_end.wait_exit() {
            Ok(reported) => reported,
            Err(e) => return Err(abort(child, e)),
        };

        let status = child.wait()?;
        // Under a namespace init the child's own status is the init's, not the command's.
        let outcome = reported.unwrap_or(status);
        info!(%outcome, "Command finished");

        Ok(outcome)
    }

    /// Write the uid map, then the gid map if any gid ranges were given
    fn map_ids(&self, pid: ProcessId, mapping: &IdMapping) -> Result<()> {
        for kind in [IdKind::Uid, IdKind::Gid] {
            let ranges = mapping.ranges(kind);
            if ranges.is_empty() {
                continue;
            }
            self.mapper.map(kind, pid, ranges)?;
        }

        Ok(())
    }

    fn spawn_child(
        &self,
        child_end: ChildEnd,
        parent_fd: RawFd,
        command: &CommandSpec,
    ) -> Result<ChildHandle> {
        let request = self.request;
        let proc_mount = self.proc_mount.as_path();
        let flags = request.to_clone_flags();
        let mut stack = vec![0u8; STACK_SIZE];
        let mut child_end = Some(child_end);

        let child_main = Box::new(|| {
            // The parent end belongs to the parent; drop our inherited copy right away.
            // SAFETY: `parent_fd` is a valid descriptor in this freshly cloned process.
            let _ = unsafe { libc::close(parent_fd) };

            match child_end.take() {
                Some(end) => child::run(end, request, proc_mount, command),
                None => child::EXIT_SETUP_FAILED as isize,
            }
        });

        // SAFETY: the child gets its own copy of the address space (no CLONE_VM) and either
        // execs or exits from `child_main` without returning into this stack frame.
        let result = unsafe { clone(child_main, &mut stack, flags, Some(libc::SIGCHLD)) };

        // Our copy of the child end is still here; close it so the only holder is the child.
        drop(child_end);

        let pid = result.map_err(|e| {
            error!(
                error = %e,
                namespaces = ?request.enabled_namespaces(),
                "Failed to create namespace child"
            );
            Error::Resource {
                message: format!("clone failed: {e}"),
            }
        })?;

        debug!(pid = %pid, "Namespace child created");

        Ok(ChildHandle {
            pid: pid.into(),
            started_at: Instant::now(),
        })
    }
}

/// Reap an abandoned child and hand back the error that caused the abort
fn abort(child: ChildHandle, cause: Error) -> Error {
    let pid = child.pid();

    match child.wait() {
        Ok(outcome) => {
            warn!(pid = %pid, %outcome, error = %cause, "Run aborted, namespace child reaped");
            cause
        }
        Err(wait_err) => {
            error!(pid = %pid, error = %wait_err, cause = %cause, "Failed to reap aborted child");
            Error::Wait {
                message: format!("{wait_err} (while aborting after: {cause})"),
            }
        }
    }
}
