//! Unix-socket control IPC.
//!
//! A line-oriented socket at `/tmp/dullahan-<uid>/dullahan.sock` serving
//! exactly three commands: `ping` (liveness), `status` (one-line
//! summary), `quit` (orderly shutdown). Serviced inside the poll loop
//! like everything else; connections are non-blocking and short-lived.
//!
//! A stale socket from a crashed instance is detected by attempting to
//! connect: a refused connection means nobody is listening and the path
//! can be reclaimed. A live listener makes startup fail — one server per
//! uid.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Commands the IPC surface can inject into the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCommand {
    /// Orderly shutdown was requested.
    Quit,
}

#[derive(Debug)]
struct IpcConn {
    stream: UnixStream,
    buf: Vec<u8>,
}

/// Non-blocking control-socket server.
#[derive(Debug)]
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    conns: Vec<IpcConn>,
}

impl IpcServer {
    /// Bind the control socket, reclaiming a stale path if its previous
    /// owner is gone. A live listener on the path is process-fatal.
    pub fn bind(path: &Path) -> Result<Self> {
        match UnixListener::bind(path) {
            Ok(listener) => Self::finish(listener, path),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if UnixStream::connect(path).is_ok() {
                    bail!("another dullahan instance is listening on {}", path.display());
                }
                std::fs::remove_file(path)
                    .with_context(|| format!("cannot remove stale socket {}", path.display()))?;
                log::info!("reclaimed stale control socket {}", path.display());
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("cannot bind {}", path.display()))?;
                Self::finish(listener, path)
            }
            Err(e) => Err(e).with_context(|| format!("cannot bind {}", path.display())),
        }
    }

    fn finish(listener: UnixListener, path: &Path) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .context("cannot set control socket non-blocking")?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            conns: Vec::new(),
        })
    }

    /// Listener fd for the poll set.
    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Connection fds for the poll set.
    pub fn conn_fds(&self) -> Vec<RawFd> {
        self.conns.iter().map(|c| c.stream.as_raw_fd()).collect()
    }

    /// Accept and service everything that is ready.
    ///
    /// `status` is the current one-line status summary. Returns any
    /// commands that must reach the event loop.
    pub fn service(&mut self, status: &str) -> Vec<IpcCommand> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(true).is_ok() {
                        self.conns.push(IpcConn { stream, buf: Vec::new() });
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("control socket accept failed: {e}");
                    break;
                }
            }
        }

        let mut commands = Vec::new();
        self.conns.retain_mut(|conn| {
            match service_conn(conn, status, &mut commands) {
                ConnState::Keep => true,
                ConnState::Done => false,
            }
        });
        commands
    }

    /// Close the listener and unlink the socket path.
    pub fn close(&mut self) {
        self.conns.clear();
        let _ = std::fs::remove_file(&self.path);
    }
}

enum ConnState {
    Keep,
    Done,
}

fn service_conn(conn: &mut IpcConn, status: &str, commands: &mut Vec<IpcCommand>) -> ConnState {
    let mut chunk = [0u8; 1024];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => return ConnState::Done,
            Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => return ConnState::Done,
        }
        // Commands are tiny; cap runaway senders.
        if conn.buf.len() > 4096 {
            return ConnState::Done;
        }
    }

    while let Some(newline) = conn.buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = conn.buf.drain(..=newline).collect();
        let command = String::from_utf8_lossy(&line);
        let command = command.trim();
        let reply = match command {
            "ping" => "pong\n".to_string(),
            "status" => format!("{status}\n"),
            "quit" => {
                commands.push(IpcCommand::Quit);
                "bye\n".to_string()
            }
            other => {
                log::warn!("unknown control command {other:?}");
                "error: unknown command\n".to_string()
            }
        };
        // Replies are a handful of bytes; a peer that cannot take them
        // is not worth keeping.
        if conn.stream.write_all(reply.as_bytes()).is_err() {
            return ConnState::Done;
        }
    }
    ConnState::Keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_in_tempdir() -> (IpcServer, PathBuf, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("control.sock");
        let server = IpcServer::bind(&path).expect("bind");
        (server, path, tmp)
    }

    #[test]
    fn ping_pong() {
        let (mut server, path, _tmp) = bind_in_tempdir();
        let mut peer = UnixStream::connect(&path).expect("connect");
        peer.write_all(b"ping\n").expect("write");

        // Accept + service; the reply lands synchronously.
        let commands = server.service("idle");
        assert!(commands.is_empty());

        let mut reply = [0u8; 16];
        let n = peer.read(&mut reply).expect("read");
        assert_eq!(&reply[..n], b"pong\n");
    }

    #[test]
    fn status_reports_summary() {
        let (mut server, path, _tmp) = bind_in_tempdir();
        let mut peer = UnixStream::connect(&path).expect("connect");
        peer.write_all(b"status\n").expect("write");
        server.service("3 panes, 2 clients");

        let mut reply = [0u8; 64];
        let n = peer.read(&mut reply).expect("read");
        assert_eq!(&reply[..n], b"3 panes, 2 clients\n");
    }

    #[test]
    fn quit_surfaces_command() {
        let (mut server, path, _tmp) = bind_in_tempdir();
        let mut peer = UnixStream::connect(&path).expect("connect");
        peer.write_all(b"quit\n").expect("write");
        let commands = server.service("idle");
        assert_eq!(commands, vec![IpcCommand::Quit]);
    }

    #[test]
    fn stale_socket_is_reclaimed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("control.sock");
        {
            let first = IpcServer::bind(&path).expect("bind");
            // Drop without close(): the path stays behind like a crash.
            drop(first);
        }
        assert!(path.exists());
        let second = IpcServer::bind(&path).expect("rebind over stale socket");
        drop(second);
    }

    #[test]
    fn live_socket_refuses_second_bind() {
        let (server, path, _tmp) = bind_in_tempdir();
        assert!(IpcServer::bind(&path).is_err());
        drop(server);
    }
}
