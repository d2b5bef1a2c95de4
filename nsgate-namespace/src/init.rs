//! Minimal init for a new PID namespace
//!
//! PID 1 of a namespace never dies from a signal it has no handler for, even when the signal
//! comes from an ancestor namespace. The command therefore runs as PID 2 under this process,
//! which forwards termination signals to it, reaps every child, and reports the command's
//! outcome to the parent over the sync channel.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::sys::signal::{kill, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use nsgate_core::{ExitOutcome, Result};
use tracing::debug;

use crate::child;
use crate::config::CommandSpec;
use crate::sync::ChildEnd;

/// Signals relayed to the command
const FORWARDED: [Signal; 8] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGALRM,
    Signal::SIGWINCH,
];

/// Run `command` as PID 2 and report its termination.
///
/// Returns the exit code for clone(2); the parent uses the report, not this code.
pub(crate) fn run(end: ChildEnd, command: &CommandSpec) -> isize {
    let outcome = match supervise(command) {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("nsgate: namespace init failed: {e}");
            return child::EXIT_SETUP_FAILED as isize;
        }
    };

    if let Err(e) = end.report_exit(outcome) {
        eprintln!("nsgate: failed to report {outcome}: {e}");
    }

    exit_code(outcome) as isize
}

/// Shell convention for the init's own status: the code, or 128 + signal number
fn exit_code(outcome: ExitOutcome) -> i32 {
    match outcome {
        ExitOutcome::Exited(code) => i32::from(code),
        ExitOutcome::Signaled(signal) => 128 + signal as i32,
    }
}

fn watched_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in FORWARDED {
        set.add(signal);
    }
    set.add(Signal::SIGCHLD);
    set
}

fn supervise(command: &CommandSpec) -> Result<ExitOutcome> {
    let watched = watched_signals();

    // Block before forking so nothing slips past sigwait; the command gets the old mask back.
    let previous = watched.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;

    // SAFETY: the clone child is single-threaded; the forked side only restores its signal
    // mask and execs or exits.
    match unsafe { fork() }? {
        ForkResult::Child => {
            if let Err(e) = previous.thread_set_mask() {
                eprintln!("nsgate: failed to restore signal mask: {e}");
                std::process::exit(child::EXIT_SETUP_FAILED);
            }
            std::process::exit(child::exec(command))
        }
        ForkResult::Parent { child } => {
            debug!(pid = %child, "Command started under namespace init");
            wait_for(child, &watched)
        }
    }
}

fn wait_for(command: Pid, watched: &SigSet) -> Result<ExitOutcome> {
    loop {
        let signal = watched.wait()?;

        if signal == Signal::SIGCHLD {
            if let Some(outcome) = reap(command)? {
                return Ok(outcome);
            }
            continue;
        }

        debug!(signal = signal.as_str(), "Forwarding signal to command");
        match kill(command, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reap every exited child; returns the command's outcome once it is among them
fn reap(command: Pid) -> Result<Option<ExitOutcome>> {
    let mut outcome = None;

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(outcome),
            Ok(status) if status.pid() == Some(command) => {
                outcome = ExitOutcome::from_wait_status(status).or(outcome);
            }
            Ok(status) => debug!(?status, "Reaped orphan"),
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }
}
