//! PTY allocation and shell child management.
//!
//! `openpty` gives a master/slave pair; the child gets a new session with
//! the slave as its controlling tty and execs the detected shell as a
//! login shell. The parent keeps the master, set non-blocking, for the
//! event loop's poll set.
//!
//! Termination primitives (`signal`, `try_reap`) are deliberately dumb;
//! the pane lifecycle owns the SIGTERM → grace → SIGKILL timing.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

/// Terminate the forked child without running atexit handlers or
/// unwinding; only `_exit` is safe after fork in a threaded parent.
fn child_die(code: i32) -> ! {
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(code) }
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// A PTY master plus the shell child running on its slave side.
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    child: Pid,
}

impl Pty {
    /// Fork a shell child inside a fresh PTY.
    ///
    /// The child: new session, controlling tty from the slave, stdio wired
    /// to the slave, signal dispositions reset, `exec` of `[shell, -l]`
    /// with the inherited environment. The parent: non-blocking master.
    pub fn spawn(shell: &str, cols: u16, rows: u16) -> Result<Self> {
        let ends = openpty(Some(&winsize(cols, rows)), None).context("openpty failed")?;
        let master = ends.master;
        let slave = ends.slave;

        // Everything the child needs must be allocated before fork.
        let shell_c = CString::new(shell).context("shell path contains NUL")?;
        let arg0 = shell_c.clone();
        let login_flag = CString::new("-l").expect("static string");

        // SAFETY: the child branch calls only async-signal-safe functions
        // (setsid, ioctl, dup2, execvp, _exit) and pre-allocated CStrings.
        match unsafe { unistd::fork() }.context("fork failed")? {
            ForkResult::Parent { child } => {
                drop(slave);
                set_nonblocking(master.as_raw_fd())?;
                log::info!("spawned shell {shell} as pid {child}");
                Ok(Self { master, child })
            }
            ForkResult::Child => {
                drop(master);
                let slave_fd = slave.as_raw_fd();

                // New session; the slave becomes the controlling tty.
                if unistd::setsid().is_err() {
                    child_die(1);
                }
                // SAFETY: TIOCSCTTY on a fresh session leader with a pty
                // slave fd; the generic cast covers platform ioctl types.
                #[allow(clippy::cast_lossless)]
                let rc = unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) };
                if rc < 0 {
                    child_die(1);
                }

                for target in 0..=2 {
                    if unistd::dup2(slave_fd, target).is_err() {
                        child_die(1);
                    }
                }
                if slave_fd > 2 {
                    drop(slave);
                }

                // Restore default signal dispositions the parent altered.
                // SAFETY: plain signal(2) calls with SIG_DFL.
                unsafe {
                    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                    libc::signal(libc::SIGINT, libc::SIG_DFL);
                    libc::signal(libc::SIGTERM, libc::SIG_DFL);
                    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
                }

                let _ = unistd::execvp(&shell_c, &[&arg0, &login_flag]);
                // exec only returns on failure.
                child_die(127);
            }
        }
    }

    /// Master fd for the poll set.
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Shell child pid.
    pub fn child_pid(&self) -> Pid {
        self.child
    }

    /// Non-blocking read from the master.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match unistd::read(self.master.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(io::ErrorKind::WouldBlock.into()),
                // Linux reports EIO on a master whose child side is gone;
                // surface it as EOF so the pane terminates cleanly.
                Err(Errno::EIO) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Non-blocking write into the master.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match unistd::write(&self.master, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Propagate new dimensions to the kernel (`TIOCSWINSZ`); the child
    /// receives SIGWINCH.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let size = winsize(cols, rows);
        // SAFETY: TIOCSWINSZ with a valid winsize on an open pty master.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send a signal to the child, ignoring ESRCH (already gone).
    pub fn signal(&self, sig: Signal) {
        match kill(self.child, sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("kill({}, {sig}) failed: {e}", self.child),
        }
    }

    /// Non-blocking reap attempt. Returns true once the child is collected.
    pub fn try_reap(&self) -> bool {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) => {
                log::debug!("reaped pid {}: {status:?}", self.child);
                true
            }
            // ECHILD: someone else (the loop's SIGCHLD sweep) got it first.
            Err(_) => true,
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("F_GETFL failed")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("F_SETFL failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Spawn a real shell, observe output, terminate it.
    #[test]
    fn spawn_echo_and_reap() {
        let pty = Pty::spawn("/bin/sh", 80, 24).expect("spawn");
        assert!(pty.master_fd() >= 0);

        // The shell may need a moment to start and print a prompt.
        let deadline = Instant::now() + Duration::from_secs(5);
        pty.write(b"echo dullahan-test\n").expect("write");

        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            match pty.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.windows(13).any(|w| w == b"dullahan-test") {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert!(
            collected.windows(13).any(|w| w == b"dullahan-test"),
            "echo output never arrived"
        );

        pty.signal(Signal::SIGTERM);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pty.try_reap() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn resize_succeeds_on_live_pty() {
        let pty = Pty::spawn("/bin/sh", 80, 24).expect("spawn");
        pty.resize(120, 40).expect("resize");
        pty.signal(Signal::SIGKILL);
        std::thread::sleep(Duration::from_millis(50));
        pty.try_reap();
    }
}
