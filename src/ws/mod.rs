//! WebSocket connection state over a [`Stream`].
//!
//! [`WsConnection`] owns the read buffer (frames may straddle socket
//! reads), the bounded write buffer, and fragmented-message reassembly.
//! Writes try the transport first and spill into the write buffer on
//! `WouldBlock`; the event loop flushes the buffer when poll reports the
//! socket writable. A connection whose write buffer would exceed
//! [`MAX_WRITE_BUFFER`](crate::constants::MAX_WRITE_BUFFER) is torn down.

pub mod frame;

use std::collections::VecDeque;
use std::io::{Read, Write};

pub use frame::{accept_key, build_close, build_frame, Frame, OpCode, WsError};

use crate::constants::MAX_WRITE_BUFFER;
use crate::stream::Stream;

/// A complete, reassembled incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text payload.
    Text(Vec<u8>),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Peer ping (a pong has already been queued).
    Ping(Vec<u8>),
    /// Peer pong.
    Pong(Vec<u8>),
    /// Peer close.
    Close,
}

/// Per-connection WebSocket state bound to its transport.
#[derive(Debug)]
pub struct WsConnection {
    stream: Stream,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
    /// Opcode of an in-flight fragmented message, if any.
    fragment_opcode: Option<OpCode>,
    /// Accumulated fragment payload.
    fragment_buf: Vec<u8>,
}

impl WsConnection {
    /// Wrap an upgraded stream. Any bytes the HTTP layer over-read past the
    /// request headers are seeded into the read buffer.
    pub fn new(stream: Stream, leftover: Vec<u8>) -> Self {
        Self {
            stream,
            read_buf: leftover,
            write_buf: VecDeque::new(),
            fragment_opcode: None,
            fragment_buf: Vec::new(),
        }
    }

    /// Raw fd for poll registration.
    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }

    /// Whether the transport holds buffered decrypted bytes (TLS).
    pub fn has_pending_data(&mut self) -> bool {
        self.stream.has_pending_data() || !self.read_buf.is_empty()
    }

    /// Whether any outgoing bytes are queued (our buffer or TLS records).
    pub fn has_queued_writes(&self) -> bool {
        !self.write_buf.is_empty() || self.stream.wants_write()
    }

    /// Read and reassemble the next complete message.
    ///
    /// Returns `None` when no complete message is available without
    /// blocking. Pings are answered inline and still surfaced so the
    /// caller can refresh liveness bookkeeping.
    pub fn read_message(&mut self) -> Result<Option<WsMessage>, WsError> {
        loop {
            if let Some(msg) = self.try_parse_buffered()? {
                return Ok(Some(msg));
            }
            if !self.fill_read_buf()? {
                return Ok(None);
            }
        }
    }

    /// Parse as many buffered frames as needed to produce one message.
    fn try_parse_buffered(&mut self) -> Result<Option<WsMessage>, WsError> {
        loop {
            let Some((frame, consumed)) = frame::parse_frame(&self.read_buf)? else {
                return Ok(None);
            };
            self.read_buf.drain(..consumed);

            match frame.opcode {
                OpCode::Close => return Ok(Some(WsMessage::Close)),
                OpCode::Ping => {
                    // Answer inline; surfacing it lets the loop refresh
                    // the last-received timestamp.
                    self.send_frame(OpCode::Pong, &frame.payload)?;
                    return Ok(Some(WsMessage::Ping(frame.payload)));
                }
                OpCode::Pong => return Ok(Some(WsMessage::Pong(frame.payload))),
                OpCode::Text | OpCode::Binary => {
                    if frame.fin {
                        let msg = match frame.opcode {
                            OpCode::Text => WsMessage::Text(frame.payload),
                            _ => WsMessage::Binary(frame.payload),
                        };
                        return Ok(Some(msg));
                    }
                    // First fragment of a fragmented message.
                    self.fragment_opcode = Some(frame.opcode);
                    self.fragment_buf = frame.payload;
                }
                OpCode::Continuation => {
                    let Some(opcode) = self.fragment_opcode else {
                        return Err(WsError::BadControlFrame);
                    };
                    self.fragment_buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        self.fragment_opcode = None;
                        let payload = std::mem::take(&mut self.fragment_buf);
                        let msg = match opcode {
                            OpCode::Text => WsMessage::Text(payload),
                            _ => WsMessage::Binary(payload),
                        };
                        return Ok(Some(msg));
                    }
                }
            }
        }
    }

    /// Pull transport bytes into the read buffer.
    ///
    /// Returns whether any bytes arrived. Zero-byte reads mean the peer
    /// closed.
    fn fill_read_buf(&mut self) -> Result<bool, WsError> {
        let mut chunk = [0u8; 16 * 1024];
        let mut any = false;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(WsError::PeerClosed),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    any = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WsError::Io(e)),
            }
        }
        Ok(any)
    }

    /// Send a binary message.
    pub fn send_binary(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame(OpCode::Binary, payload)
    }

    /// Send a text message.
    pub fn send_text(&mut self, payload: &str) -> Result<(), WsError> {
        self.send_frame(OpCode::Text, payload.as_bytes())
    }

    /// Send a protocol-level ping.
    pub fn send_ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame(OpCode::Ping, payload)
    }

    /// Send a close frame (normal closure).
    pub fn send_close(&mut self) -> Result<(), WsError> {
        let bytes = build_close(1000);
        self.queue_bytes(&bytes)
    }

    fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        let bytes = frame::build_frame(opcode, payload);
        self.queue_bytes(&bytes)
    }

    /// Write bytes to the transport, spilling the unwritten tail into the
    /// bounded write buffer.
    ///
    /// Frame bytes must never interleave, so while the buffer is non-empty
    /// all new frames append behind it.
    fn queue_bytes(&mut self, bytes: &[u8]) -> Result<(), WsError> {
        if self.write_buf.is_empty() {
            match self.write_some(bytes) {
                Ok(n) if n == bytes.len() => return Ok(()),
                Ok(n) => return self.buffer_tail(&bytes[n..]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return self.buffer_tail(bytes);
                }
                Err(e) => return Err(WsError::Io(e)),
            }
        }
        self.buffer_tail(bytes)
    }

    fn buffer_tail(&mut self, bytes: &[u8]) -> Result<(), WsError> {
        if self.write_buf.len() + bytes.len() > MAX_WRITE_BUFFER {
            return Err(WsError::WriteBufferFull);
        }
        self.write_buf.extend(bytes);
        Ok(())
    }

    fn write_some(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Drain the write buffer into the transport.
    ///
    /// Returns `true` when fully drained (congestion cleared).
    pub fn flush_write_buffer(&mut self) -> Result<bool, WsError> {
        // TLS records queued inside rustls flush first.
        self.stream.flush().map_err(WsError::Io)?;

        while !self.write_buf.is_empty() {
            let (front, _) = self.write_buf.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Err(WsError::PeerClosed),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WsError::Io(e)),
            }
        }
        Ok(!self.stream.wants_write())
    }

    /// Orderly transport shutdown.
    pub fn shutdown(&mut self) {
        let _ = self.flush_write_buffer();
        self.stream.shutdown();
    }
}
