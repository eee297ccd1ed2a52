//! Self-pipe wakeup for the event loop.
//!
//! The event loop parks in `poll(2)`; code running outside the loop's tick
//! (signal handlers today, worker threads if they ever appear) cannot touch
//! loop state directly. Instead they write one byte into this pipe, whose
//! read end sits in every poll set, and the loop wakes.
//!
//! Both ends are non-blocking. The pipe never carries data of meaning: any
//! pending byte means "wake up and look around".

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;

/// A non-blocking self-pipe.
///
/// `signal()` is async-signal-safe in practice (a single `write(2)`), so the
/// write end may also be handed to `signal_hook::low_level::pipe`.
#[derive(Debug)]
pub struct NotifyPipe {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl NotifyPipe {
    /// Create the pipe with both ends set `O_NONBLOCK`.
    pub fn new() -> io::Result<Self> {
        let (read_end, write_end) = unistd::pipe()?;
        set_nonblocking(read_end.as_raw_fd())?;
        set_nonblocking(write_end.as_raw_fd())?;
        Ok(Self { read_end, write_end })
    }

    /// Wake the event loop.
    ///
    /// A full pipe already carries a pending wake, so `WouldBlock` is
    /// success. Any other error is surfaced.
    pub fn signal(&self) -> io::Result<()> {
        match unistd::write(&self.write_end, &[1u8]) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consume all pending wake bytes.
    ///
    /// Called once per tick when the read end polls readable; tolerates any
    /// number of `signal()` calls since the last drain.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.read_end.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    /// Read end, for inclusion in poll sets.
    pub fn fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// Write end, for registration with signal handlers.
    pub fn write_fd(&self) -> RawFd {
        self.write_end.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain() {
        let pipe = NotifyPipe::new().expect("pipe");
        pipe.signal().expect("signal");
        pipe.signal().expect("signal");
        pipe.drain();
        // Drained pipe reads WouldBlock, i.e. drain() returns immediately.
        pipe.drain();
    }

    #[test]
    fn many_signals_do_not_error() {
        let pipe = NotifyPipe::new().expect("pipe");
        // Far more than the pipe buffer holds; WouldBlock must be swallowed.
        for _ in 0..100_000 {
            pipe.signal().expect("signal");
        }
        pipe.drain();
    }

    #[test]
    fn fds_are_distinct() {
        let pipe = NotifyPipe::new().expect("pipe");
        assert_ne!(pipe.fd(), pipe.write_fd());
    }
}
