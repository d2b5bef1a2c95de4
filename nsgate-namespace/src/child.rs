//! Code that runs inside the freshly cloned namespaces
//!
//! Everything here executes in the clone(2) child before exec. Failures are reported on
//! stderr and turned into an exit code; nothing returns to the caller's stack.

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::unistd::execvp;
use nsgate_core::{Error, Result};
use tracing::debug;

use std::path::Path;

use crate::config::{CommandSpec, NamespaceRequest};
use crate::init;
use crate::sync::ChildEnd;

/// Exit code when namespace setup or the handshake failed before exec
pub const EXIT_SETUP_FAILED: i32 = 125;

/// Exit code when the command exists but could not be executed
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// Exit code when the command was not found
pub const EXIT_NOT_FOUND: i32 = 127;

/// Child entry point: set up mounts, handshake, then run the command.
///
/// With a PID namespace the command runs under [`init`]; otherwise this process execs it
/// and only returns (with an exit code for clone(2)) if that failed.
pub(crate) fn run(
    end: ChildEnd,
    request: NamespaceRequest,
    proc_target: &Path,
    command: &CommandSpec,
) -> isize {
    if let Err(e) = setup_mounts(request, proc_target) {
        eprintln!("nsgate: {e}");
        // Dropping `end` without signaling ready makes the parent see the channel close.
        return EXIT_SETUP_FAILED as isize;
    }

    if let Err(e) = end.signal_ready() {
        eprintln!("nsgate: failed to signal readiness: {e}");
        return EXIT_SETUP_FAILED as isize;
    }

    // Block until the parent has mapped our ids. A closed channel means it gave up.
    if let Err(e) = end.wait_go() {
        eprintln!("nsgate: not released to run {}: {e}", command.display());
        return EXIT_SETUP_FAILED as isize;
    }

    if request.pid {
        return init::run(end, command);
    }

    // The end is close-on-exec, so the parent sees it close once the command is running.
    exec(command) as isize
}

/// Make the mount tree private and give the new PID namespace its own proc at `proc_target`
fn setup_mounts(request: NamespaceRequest, proc_target: &Path) -> Result<()> {
    if !request.mount {
        debug!("No mount namespace requested, leaving mounts alone");
        return Ok(());
    }

    // Without a user namespace the new mount namespace inherits shared propagation;
    // make it private in both cases so behavior is consistent.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::Resource {
        message: format!("entering private mount namespace failed: {e}"),
    })?;

    debug!("Mount tree is now private");

    if request.pid {
        let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        mount(Some("proc"), proc_target, Some("proc"), flags, None::<&str>).map_err(|e| {
            Error::Resource {
                message: format!("mounting proc on {} failed: {e}", proc_target.display()),
            }
        })?;

        debug!(target = %proc_target.display(), "Mounted new proc");
    }

    Ok(())
}

/// Replace this process with the command; returns the exit code to use if that fails
pub(crate) fn exec(command: &CommandSpec) -> i32 {
    debug!(command = %command.display(), "Executing");

    let Err(errno) = execvp(command.program(), command.argv());

    eprintln!(
        "nsgate: failed to execute {}: {errno}",
        command.program().to_string_lossy()
    );
    exec_failure_code(errno)
}

fn exec_failure_code(errno: Errno) -> i32 {
    match errno {
        Errno::ENOENT | Errno::ENOTDIR => EXIT_NOT_FOUND,
        _ => EXIT_CANNOT_EXECUTE,
    }
}
