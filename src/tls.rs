//! Non-blocking TLS transport over a TCP stream.
//!
//! Two states, two types:
//!
//! - [`TlsHandshake`] — a connection still negotiating. [`TlsHandshake::advance`]
//!   drives one non-blocking step and reports whether the socket must become
//!   readable or writable before progress can resume.
//! - [`TlsStream`] — an established connection with non-blocking `read`/`write`.
//!
//! The crucial subtlety is [`TlsStream::has_pending_data`]: rustls may hold
//! decrypted plaintext that arrived in an earlier record, invisible to
//! `poll(2)`. The event loop must re-service such connections even when their
//! socket is quiet.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};
use thiserror::Error;

/// TLS setup and handshake failures.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Certificate or key file could not be read or parsed.
    #[error("cannot load TLS material from {path}: {reason}")]
    BadMaterial {
        /// Offending file path.
        path: String,
        /// Parse or I/O failure description.
        reason: String,
    },
    /// rustls rejected the certificate/key combination.
    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// Load a PEM certificate chain and private key into a rustls server config.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = {
        let file = File::open(cert_path).map_err(|e| TlsError::BadMaterial {
            path: cert_path.to_string(),
            reason: e.to_string(),
        })?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::BadMaterial {
                path: cert_path.to_string(),
                reason: e.to_string(),
            })?
    };

    let key = {
        let file = File::open(key_path).map_err(|e| TlsError::BadMaterial {
            path: key_path.to_string(),
            reason: e.to_string(),
        })?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| TlsError::BadMaterial {
                path: key_path.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| TlsError::BadMaterial {
                path: key_path.to_string(),
                reason: "no private key found".to_string(),
            })?
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Result of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake complete; call [`TlsHandshake::into_stream`].
    Done,
    /// Blocked until the socket is readable.
    WantRead,
    /// Blocked until the socket is writable.
    WantWrite,
    /// Unrecoverable; close the socket.
    Fatal,
}

/// A TLS connection mid-handshake, bound to its TCP socket.
#[derive(Debug)]
pub struct TlsHandshake {
    conn: ServerConnection,
    sock: TcpStream,
}

impl TlsHandshake {
    /// Begin a server-side handshake on an accepted socket.
    ///
    /// The socket must already be non-blocking; TCP_NODELAY is applied here
    /// so handshake flights are not delayed by Nagle.
    pub fn new(sock: TcpStream, config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let _ = sock.set_nodelay(true);
        let conn = ServerConnection::new(config)?;
        Ok(Self { conn, sock })
    }

    /// Drive the handshake as far as it will go without blocking.
    pub fn advance(&mut self) -> HandshakeStatus {
        loop {
            // Flush any queued handshake flights first.
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut self.sock) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStatus::WantWrite;
                    }
                    Err(_) => return HandshakeStatus::Fatal,
                }
            }

            if !self.conn.is_handshaking() {
                return HandshakeStatus::Done;
            }

            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => return HandshakeStatus::Fatal,
                Ok(_) => {
                    if self.conn.process_new_packets().is_err() {
                        // A fatal alert may be queued; push it out best-effort.
                        let _ = self.conn.write_tls(&mut self.sock);
                        return HandshakeStatus::Fatal;
                    }
                    // Loop: processing may have queued a response flight.
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::WantRead;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return HandshakeStatus::Fatal,
            }
        }
    }

    /// Whether the handshake currently needs the socket writable.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Borrow the underlying socket (poll registration).
    pub fn socket(&self) -> &TcpStream {
        &self.sock
    }

    /// Convert a completed handshake into an established stream.
    pub fn into_stream(self) -> TlsStream {
        debug_assert!(!self.conn.is_handshaking());
        TlsStream { conn: self.conn, sock: self.sock }
    }
}

/// An established TLS connection with non-blocking record I/O.
#[derive(Debug)]
pub struct TlsStream {
    conn: ServerConnection,
    sock: TcpStream,
}

impl TlsStream {
    /// Decrypted plaintext buffered inside rustls, invisible to poll.
    ///
    /// When true, the owner must be serviced again this tick even though
    /// the socket itself reports no readable data.
    pub fn has_pending_data(&mut self) -> bool {
        match self.conn.process_new_packets() {
            Ok(state) => state.plaintext_bytes_to_read() > 0,
            Err(_) => false,
        }
    }

    /// Encrypted records queued for the socket; poll for OUT and `flush`.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Borrow the underlying socket (poll registration).
    pub fn socket(&self) -> &TcpStream {
        &self.sock
    }

    /// Push queued TLS records to the socket until drained or `WouldBlock`.
    pub fn flush_records(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send a best-effort close_notify. The socket closes on drop.
    pub fn shutdown(&mut self) {
        self.conn.send_close_notify();
        let _ = self.flush_records();
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Serve buffered plaintext first.
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            // No plaintext; pull records from the socket.
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    // Post-handshake traffic (key updates) may queue
                    // responses; push them out opportunistically.
                    if self.conn.wants_write() {
                        let _ = self.flush_records();
                    }
                    // Loop: serve plaintext if any was decrypted, else
                    // keep pulling records until the socket is dry.
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for TlsStream {
    /// Non-blocking write with genuine backpressure.
    ///
    /// rustls buffers plaintext without limit, which would defeat the
    /// per-connection write cap. So: if encrypted records are already
    /// queued and the socket will not take them, refuse new plaintext
    /// with `WouldBlock` and let the caller's write buffer absorb it.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_records()?;
        if self.conn.wants_write() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = self.conn.writer().write(buf)?;
        self.flush_records()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_bad_material() {
        let err = load_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .expect_err("should fail");
        match err {
            TlsError::BadMaterial { path, .. } => assert!(path.contains("cert.pem")),
            TlsError::Config(_) => panic!("expected BadMaterial"),
        }
    }

    #[test]
    fn key_without_material_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cert = tmp.path().join("cert.pem");
        let key = tmp.path().join("key.pem");
        // A cert file with no PEM blocks parses to an empty chain; the key
        // file is empty too, so key loading must report the missing key.
        std::fs::write(&cert, b"").expect("write");
        std::fs::write(&key, b"").expect("write");
        let err = load_server_config(
            cert.to_str().expect("utf8"),
            key.to_str().expect("utf8"),
        )
        .expect_err("should fail");
        assert!(matches!(err, TlsError::BadMaterial { .. } | TlsError::Config(_)));
    }
}
