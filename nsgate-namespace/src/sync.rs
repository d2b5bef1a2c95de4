//! Parent/child handshake channel
//!
//! A `SOCK_SEQPACKET` Unix socket pair carries three messages over its lifetime:
//! [`Handshake::Ready`] from the child once its mounts are set up, [`Handshake::Go`] from
//! the parent once ID mapping is done, and finally an exit report from the namespace init
//! describing how the command terminated. The role-typed ends only expose the direction each
//! side is allowed to use, and the last message consumes the end so the descriptor is closed
//! as part of the success path.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::socket::{recv, send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType};
use nsgate_core::{Error, ExitOutcome, Result};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Exit report tag for a normal exit; the second byte is the exit code
const EXITED: u8 = b'X';

/// Exit report tag for a signal death; the second byte is the signal number
const SIGNALED: u8 = b'S';

/// Handshake messages, one byte each on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Handshake {
    /// Child has entered its namespaces and finished mount setup
    Ready = b'R',
    /// Parent has finished ID mapping; the child may exec
    Go = b'G',
}

impl Handshake {
    const fn as_byte(self) -> u8 {
        self as u8
    }

    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'R' => Some(Self::Ready),
            b'G' => Some(Self::Go),
            _ => None,
        }
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Go => write!(f, "go"),
        }
    }
}

/// One end of the socket pair
#[derive(Debug)]
pub struct Endpoint {
    fd: OwnedFd,
}

impl Endpoint {
    /// Send one datagram, whole
    fn send(&self, buf: &[u8], what: &dyn fmt::Display) -> Result<()> {
        loop {
            match send(self.fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => {
                    return Err(Error::protocol(format!(
                        "short write sending {what}: {n} bytes"
                    )));
                }
                Err(Errno::EINTR) => {}
                Err(Errno::EPIPE | Errno::ECONNRESET) => return Err(Error::ChannelClosed),
                Err(e) => {
                    return Err(Error::protocol(format!("failed to send {what}: {e}")));
                }
            }
        }
    }

    /// Receive one datagram; `Ok(0)` means the peer closed its end
    fn recv(&self, buf: &mut [u8], what: &dyn fmt::Display) -> Result<usize> {
        loop {
            match recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => {}
                Err(Errno::ECONNRESET) => return Ok(0),
                Err(e) => {
                    return Err(Error::protocol(format!("failed waiting for {what}: {e}")));
                }
            }
        }
    }

    /// Send exactly one handshake message
    ///
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the peer is gone, or a protocol error if the
    /// message could not be sent whole
    pub fn signal(&self, message: Handshake) -> Result<()> {
        self.send(&[message.as_byte()], &message)
    }

    /// Block until exactly one message arrives and check it is `expected`
    ///
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the peer closed its end first, or a protocol
    /// error on a malformed or unexpected message
    pub fn await_signal(&self, expected: Handshake) -> Result<()> {
        // Larger than one byte so an oversized datagram is detected rather than truncated.
        let mut buf = [0u8; 8];
        let received = self.recv(&mut buf, &expected)?;

        match (received, Handshake::from_byte(buf[0])) {
            (0, _) => Err(Error::ChannelClosed),
            (1, Some(message)) if message == expected => Ok(()),
            (1, Some(message)) => Err(Error::protocol(format!(
                "expected {expected}, got {message}"
            ))),
            (n, _) => Err(Error::protocol(format!(
                "malformed handshake while waiting for {expected} ({n} bytes)"
            ))),
        }
    }
}

// Signal numbers on Linux all fit in a byte.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_outcome(outcome: ExitOutcome) -> [u8; 2] {
    match outcome {
        ExitOutcome::Exited(code) => [EXITED, code],
        ExitOutcome::Signaled(signal) => [SIGNALED, signal as i32 as u8],
    }
}

fn decode_outcome(buf: &[u8]) -> Result<ExitOutcome> {
    match *buf {
        [EXITED, code] => Ok(ExitOutcome::Exited(code)),
        [SIGNALED, signo] => Signal::try_from(i32::from(signo))
            .map(ExitOutcome::Signaled)
            .map_err(|e| Error::protocol(format!("exit report names unknown signal {signo}: {e}"))),
        _ => Err(Error::protocol(format!(
            "malformed exit report ({} bytes)",
            buf.len()
        ))),
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Controlling side of the channel
#[derive(Debug)]
pub struct ParentEnd(Endpoint);

impl ParentEnd {
    /// Wait for the child to report that its namespaces are set up
    ///
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the child exited before signaling
    pub fn wait_ready(&self) -> Result<()> {
        self.0.await_signal(Handshake::Ready)
    }

    /// Release the child to exec
    ///
    /// # Errors
    /// Returns error if the message could not be delivered
    pub fn send_go(&self) -> Result<()> {
        self.0.signal(Handshake::Go)
    }

    /// Wait for the namespace init to report how the command ended, closing this end.
    ///
    /// Returns `None` if the child closed its end without a report, which is what happens
    /// when the command was exec'd directly (the descriptor is close-on-exec) or the init
    /// died; the child's wait status is authoritative then.
    ///
    /// # Errors
    /// Returns a protocol error on a malformed report
    pub fn wait_exit(self) -> Result<Option<ExitOutcome>> {
        let mut buf = [0u8; 8];
        match self.0.recv(&mut buf, &"exit report")? {
            0 => Ok(None),
            n => decode_outcome(&buf[..n]).map(Some),
        }
    }

    /// Close this end without releasing the child.
    ///
    /// The child observes [`Error::ChannelClosed`] and exits without running its command.
    pub fn abandon(self) {
        tracing::debug!(fd = self.0.as_raw_fd(), "Abandoning sync channel");
    }
}

impl AsRawFd for ParentEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Isolated side of the channel
#[derive(Debug)]
pub struct ChildEnd(Endpoint);

impl ChildEnd {
    /// Tell the parent that setup inside the namespaces is complete
    ///
    /// # Errors
    /// Returns error if the parent is gone
    pub fn signal_ready(&self) -> Result<()> {
        self.0.signal(Handshake::Ready)
    }

    /// Wait for permission to exec
    ///
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the parent abandoned the run
    pub fn wait_go(&self) -> Result<()> {
        self.0.await_signal(Handshake::Go)
    }

    /// Report the command's termination to the parent, closing this end
    ///
    /// # Errors
    /// Returns error if the parent is gone
    pub fn report_exit(self, outcome: ExitOutcome) -> Result<()> {
        self.0.send(&encode_outcome(outcome), &outcome)
    }
}

impl AsRawFd for ChildEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Create a connected channel.
///
/// Both descriptors are close-on-exec, so neither leaks into the target command.
///
/// # Errors
/// Returns error if the socket pair cannot be created
pub fn channel() -> Result<(ParentEnd, ChildEnd)> {
    let (parent, child) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| Error::Resource {
        message: format!("Failed to create sync channel: {e}"),
    })?;

    Ok((
        ParentEnd(Endpoint { fd: parent }),
        ChildEnd(Endpoint { fd: child }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_exchange() {
        let (parent, child) = channel().unwrap();

        child.signal_ready().unwrap();
        parent.wait_ready().unwrap();

        parent.send_go().unwrap();
        child.wait_go().unwrap();

        child.report_exit(ExitOutcome::Exited(3)).unwrap();
        assert_eq!(parent.wait_exit().unwrap(), Some(ExitOutcome::Exited(3)));
    }

    #[test]
    fn test_signal_death_report() {
        let (parent, child) = channel().unwrap();

        child
            .report_exit(ExitOutcome::Signaled(Signal::SIGTERM))
            .unwrap();
        assert_eq!(
            parent.wait_exit().unwrap(),
            Some(ExitOutcome::Signaled(Signal::SIGTERM))
        );
    }

    #[test]
    fn test_no_report_when_child_closes() {
        let (parent, child) = channel().unwrap();
        drop(child);

        assert_eq!(parent.wait_exit().unwrap(), None);
    }

    #[test]
    fn test_malformed_exit_report() {
        assert!(matches!(decode_outcome(&[b'X']), Err(Error::Protocol { .. })));
        assert!(matches!(decode_outcome(&[b'Q', 1]), Err(Error::Protocol { .. })));
        assert!(matches!(decode_outcome(&[SIGNALED, 0]), Err(Error::Protocol { .. })));
        assert_eq!(
            decode_outcome(&encode_outcome(ExitOutcome::Signaled(Signal::SIGKILL))).unwrap(),
            ExitOutcome::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_closed_peer_before_ready() {
        let (parent, child) = channel().unwrap();
        drop(child);

        assert!(matches!(parent.wait_ready(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_abandon_is_observed_by_child() {
        let (parent, child) = channel().unwrap();

        child.signal_ready().unwrap();
        parent.wait_ready().unwrap();
        parent.abandon();

        assert!(matches!(child.wait_go(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_messages_are_not_coalesced() {
        let (parent, child) = channel().unwrap();

        // Two back-to-back messages arrive as two separate one-byte datagrams.
        child.signal_ready().unwrap();
        child.signal_ready().unwrap();
        parent.wait_ready().unwrap();
        parent.wait_ready().unwrap();
    }

    #[test]
    fn test_wrong_message_is_protocol_error() {
        let (parent, child) = channel().unwrap();

        child.0.signal(Handshake::Go).unwrap();
        let err = parent.wait_ready().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert!(err.to_string().contains("expected ready, got go"));
    }

    #[test]
    fn test_signal_to_closed_peer() {
        let (parent, child) = channel().unwrap();
        drop(parent);

        assert!(matches!(child.signal_ready(), Err(Error::ChannelClosed)));
    }
}
