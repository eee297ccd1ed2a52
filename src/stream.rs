//! Uniform non-blocking byte stream over plain TCP or TLS.
//!
//! A tagged variant rather than a trait object: there are exactly two
//! transports, both known at compile time, and the event loop needs
//! concrete access to `as_raw_fd` and the TLS-only pending-plaintext
//! probe.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

use crate::tls::TlsStream;

/// Either a plain TCP stream or an established TLS stream.
#[derive(Debug)]
pub enum Stream {
    /// Cleartext TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(TlsStream),
}

impl Stream {
    /// Raw fd for poll registration.
    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Plain(s) => s.as_raw_fd(),
            Stream::Tls(s) => s.socket().as_raw_fd(),
        }
    }

    /// Whether the transport holds decrypted bytes poll cannot see.
    ///
    /// Always false for plain TCP; for TLS, rustls may have buffered
    /// plaintext from an earlier record.
    pub fn has_pending_data(&mut self) -> bool {
        match self {
            Stream::Plain(_) => false,
            Stream::Tls(s) => s.has_pending_data(),
        }
    }

    /// Whether the transport itself has queued outgoing bytes (TLS records).
    pub fn wants_write(&self) -> bool {
        match self {
            Stream::Plain(_) => false,
            Stream::Tls(s) => s.wants_write(),
        }
    }

    /// Orderly shutdown: close_notify for TLS, FIN for plain TCP.
    pub fn shutdown(&mut self) {
        match self {
            Stream::Plain(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Stream::Tls(s) => s.shutdown(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}
