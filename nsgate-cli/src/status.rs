//! Mirror a command's termination onto this process

#![allow(unsafe_code)]

use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nsgate_core::ExitOutcome;
use std::process;
use tracing::debug;

/// Exit code for failures of nsgate itself (bad ranges, setup, mapping, runtime launch)
pub const EXIT_INTERNAL_FAILURE: i32 = 125;

/// How this process should end to look like the command it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Exit(i32),
    Raise(Signal),
}

impl From<ExitOutcome> for ExitAction {
    fn from(outcome: ExitOutcome) -> Self {
        match outcome {
            ExitOutcome::Exited(code) => Self::Exit(i32::from(code)),
            ExitOutcome::Signaled(signal) => Self::Raise(signal),
        }
    }
}

/// Exit with the command's code, or die by the command's signal
pub fn propagate(outcome: ExitOutcome) -> ! {
    match ExitAction::from(outcome) {
        ExitAction::Exit(code) => process::exit(code),
        ExitAction::Raise(sig) => {
            if let Err(e) = raise_default(sig) {
                debug!(signal = sig.as_str(), error = %e, "Failed to re-raise signal");
            }
            // Still alive: the signal's default action does not terminate
            debug!(signal = sig.as_str(), "Signal did not terminate, exiting");
            process::exit(EXIT_INTERNAL_FAILURE)
        }
    }
}

/// Raise `sig` at this process with its default disposition, unblocked
fn raise_default(sig: Signal) -> nix::Result<()> {
    // SIGKILL and SIGSTOP reject a disposition change; they are default already.
    // SAFETY: installing SIG_DFL runs no handler code.
    if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
        debug!(signal = sig.as_str(), error = %e, "Could not reset disposition");
    }

    let mut mask = SigSet::empty();
    mask.add(sig);
    mask.thread_unblock()?;

    signal::raise(sig)
}
