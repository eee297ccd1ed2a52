//! Server → client binary wire frames.
//!
//! Every frame is `[u8 type] [u8 flags] [payload]`, integers little-endian.
//! Flag bit 0 marks a gzip-compressed payload; anything at or above
//! [`COMPRESS_THRESHOLD`](crate::constants::COMPRESS_THRESHOLD) bytes is
//! compressed before it leaves the process.
//!
//! Frame types:
//! - `0x01` full snapshot — dims, cursor, modes, scrollback metadata, every
//!   visible row
//! - `0x02` delta — `{from_gen, to_gen, changed_rows[], cursor, modes,
//!   scroll window}`
//! - `0x03` title, `0x04` bell, `0x05` ping, `0x06` pong, `0x07` error,
//!   `0x08` role change
//!
//! Row payloads are ANSI-encoded cell runs produced by the term module;
//! a row is `[u64 row_id] [u32 len] [bytes]`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::constants::{COMPRESS_THRESHOLD, MAX_SNAPSHOT_BYTES};

/// Frame type discriminators.
pub mod frame_type {
    /// Full pane snapshot.
    pub const SNAPSHOT: u8 = 0x01;
    /// Generation-ranged delta.
    pub const DELTA: u8 = 0x02;
    /// Terminal title change.
    pub const TITLE: u8 = 0x03;
    /// Bell.
    pub const BELL: u8 = 0x04;
    /// Server liveness ping.
    pub const PING: u8 = 0x05;
    /// Reply to a client ping.
    pub const PONG: u8 = 0x06;
    /// Human-readable error.
    pub const ERROR: u8 = 0x07;
    /// Role assignment/change notification.
    pub const ROLE: u8 = 0x08;
}

/// Flag bit: payload is gzip-compressed.
const FLAG_GZIP: u8 = 0x01;

/// Wire decode failures (used by tests and tooling; the server only
/// encodes).
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame shorter than the two-byte header.
    #[error("frame too short")]
    Truncated,
    /// Unknown type discriminator.
    #[error("unknown frame type {0:#x}")]
    UnknownType(u8),
    /// Payload decompression failed.
    #[error("payload decompression failed: {0}")]
    Decompress(String),
    /// Structured payload ended early.
    #[error("malformed payload")]
    Malformed,
}

// ============================================================================
// Views (borrowed input to the encoders)
// ============================================================================

/// Borrowed state for a full snapshot frame.
#[derive(Debug)]
pub struct SnapshotView<'a> {
    /// Pane id.
    pub pane: u16,
    /// Viewport width.
    pub cols: u16,
    /// Viewport height.
    pub rows: u16,
    /// Cursor row within the viewport.
    pub cursor_row: u16,
    /// Cursor column.
    pub cursor_col: u16,
    /// Packed mode bits (cursor visible, DECCKM, bracketed paste, mouse).
    pub modes: u8,
    /// Pane generation this snapshot represents.
    pub generation: u64,
    /// Oldest retained row id.
    pub min_row_id: u64,
    /// Newest row id.
    pub max_row_id: u64,
    /// Rows per scrollback page.
    pub page_size: u32,
    /// Row id of the top visible line.
    pub viewport_start: u64,
    /// `(row_id, ansi bytes)` for every visible row.
    pub row_data: &'a [(u64, Vec<u8>)],
}

/// Borrowed state for a delta frame.
#[derive(Debug)]
pub struct DeltaView<'a> {
    /// Pane id.
    pub pane: u16,
    /// Generation the receiver must be at for this delta to apply.
    pub from_gen: u64,
    /// Generation after applying.
    pub to_gen: u64,
    /// Viewport width (captures resizes).
    pub cols: u16,
    /// Viewport height.
    pub rows: u16,
    /// Cursor row.
    pub cursor_row: u16,
    /// Cursor column.
    pub cursor_col: u16,
    /// Packed mode bits.
    pub modes: u8,
    /// Oldest retained row id.
    pub min_row_id: u64,
    /// Newest row id.
    pub max_row_id: u64,
    /// Row id of the top visible line (scroll window).
    pub viewport_start: u64,
    /// `(row_id, ansi bytes)` for each changed row.
    pub row_data: &'a [(u64, Vec<u8>)],
}

// ============================================================================
// Encoding
// ============================================================================

fn put_rows(out: &mut Vec<u8>, rows: &[(u64, Vec<u8>)]) {
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    for (id, bytes) in rows {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
}

/// Wrap a payload into a typed frame, compressing when large.
fn seal(frame_type: u8, payload: Vec<u8>) -> Vec<u8> {
    if payload.len() >= COMPRESS_THRESHOLD {
        if let Some(compressed) = gzip(&payload) {
            // Only ship compressed when it actually won.
            if compressed.len() < payload.len() {
                let mut out = Vec::with_capacity(2 + compressed.len());
                out.push(frame_type);
                out.push(FLAG_GZIP);
                out.extend_from_slice(&compressed);
                return out;
            }
        }
    }
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(frame_type);
    out.push(0);
    out.extend_from_slice(&payload);
    out
}

fn gzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| WireError::Decompress(e.to_string()))?;
    Ok(out)
}

/// Encode a full snapshot frame.
pub fn encode_snapshot(view: &SnapshotView<'_>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + view.row_data.len() * 32);
    payload.extend_from_slice(&view.pane.to_le_bytes());
    payload.extend_from_slice(&view.cols.to_le_bytes());
    payload.extend_from_slice(&view.rows.to_le_bytes());
    payload.extend_from_slice(&view.cursor_row.to_le_bytes());
    payload.extend_from_slice(&view.cursor_col.to_le_bytes());
    payload.push(view.modes);
    payload.extend_from_slice(&view.generation.to_le_bytes());
    payload.extend_from_slice(&view.min_row_id.to_le_bytes());
    payload.extend_from_slice(&view.max_row_id.to_le_bytes());
    payload.extend_from_slice(&view.page_size.to_le_bytes());
    payload.extend_from_slice(&view.viewport_start.to_le_bytes());
    put_rows(&mut payload, view.row_data);

    if payload.len() > MAX_SNAPSHOT_BYTES {
        // A 500x500 grid fits comfortably; hitting this means a bug
        // upstream, not oversized terminal content.
        log::error!(
            "snapshot for pane {} is {} bytes, over the {} cap",
            view.pane,
            payload.len(),
            MAX_SNAPSHOT_BYTES
        );
    }

    seal(frame_type::SNAPSHOT, payload)
}

/// Encode a delta frame.
pub fn encode_delta(view: &DeltaView<'_>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + view.row_data.len() * 32);
    payload.extend_from_slice(&view.pane.to_le_bytes());
    payload.extend_from_slice(&view.from_gen.to_le_bytes());
    payload.extend_from_slice(&view.to_gen.to_le_bytes());
    payload.extend_from_slice(&view.cols.to_le_bytes());
    payload.extend_from_slice(&view.rows.to_le_bytes());
    payload.extend_from_slice(&view.cursor_row.to_le_bytes());
    payload.extend_from_slice(&view.cursor_col.to_le_bytes());
    payload.push(view.modes);
    payload.extend_from_slice(&view.min_row_id.to_le_bytes());
    payload.extend_from_slice(&view.max_row_id.to_le_bytes());
    payload.extend_from_slice(&view.viewport_start.to_le_bytes());
    put_rows(&mut payload, view.row_data);
    seal(frame_type::DELTA, payload)
}

/// Encode a title frame.
pub fn encode_title(pane: u16, title: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + title.len());
    payload.extend_from_slice(&pane.to_le_bytes());
    payload.extend_from_slice(title.as_bytes());
    seal(frame_type::TITLE, payload)
}

/// Encode a bell frame.
pub fn encode_bell(pane: u16) -> Vec<u8> {
    seal(frame_type::BELL, pane.to_le_bytes().to_vec())
}

/// Encode a server liveness ping.
pub fn encode_ping() -> Vec<u8> {
    seal(frame_type::PING, Vec::new())
}

/// Encode a pong answering a client protocol ping.
pub fn encode_pong() -> Vec<u8> {
    seal(frame_type::PONG, Vec::new())
}

/// Encode an error frame with a human-readable message.
pub fn encode_error(message: &str) -> Vec<u8> {
    seal(frame_type::ERROR, message.as_bytes().to_vec())
}

/// Encode a role notification (0 = none, 1 = view, 2 = master).
pub fn encode_role(role: u8) -> Vec<u8> {
    seal(frame_type::ROLE, vec![role])
}

// ============================================================================
// Decoding (tests, tooling, and the browser client's reference)
// ============================================================================

/// Decoded snapshot frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Pane id.
    pub pane: u16,
    /// Viewport width.
    pub cols: u16,
    /// Viewport height.
    pub rows: u16,
    /// Cursor position.
    pub cursor: (u16, u16),
    /// Packed modes byte.
    pub modes: u8,
    /// Pane generation.
    pub generation: u64,
    /// Oldest retained row id.
    pub min_row_id: u64,
    /// Newest row id.
    pub max_row_id: u64,
    /// Rows per page.
    pub page_size: u32,
    /// Top visible row id.
    pub viewport_start: u64,
    /// Visible rows.
    pub rows_data: Vec<(u64, Vec<u8>)>,
}

/// Decoded delta frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Pane id.
    pub pane: u16,
    /// Required starting generation.
    pub from_gen: u64,
    /// Resulting generation.
    pub to_gen: u64,
    /// Viewport width.
    pub cols: u16,
    /// Viewport height.
    pub rows_dim: u16,
    /// Cursor position.
    pub cursor: (u16, u16),
    /// Packed modes byte.
    pub modes: u8,
    /// Oldest retained row id.
    pub min_row_id: u64,
    /// Newest row id.
    pub max_row_id: u64,
    /// Top visible row id.
    pub viewport_start: u64,
    /// Changed rows.
    pub rows: Vec<(u64, Vec<u8>)>,
}

/// Any server → client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Full snapshot.
    Snapshot(Snapshot),
    /// Delta.
    Delta(Delta),
    /// Title change.
    Title {
        /// Pane id.
        pane: u16,
        /// New title bytes.
        title: Vec<u8>,
    },
    /// Bell.
    Bell {
        /// Pane id.
        pane: u16,
    },
    /// Liveness ping.
    Ping,
    /// Ping reply.
    Pong,
    /// Error message.
    Error(String),
    /// Role notification.
    Role(u8),
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Malformed);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn rows(&mut self) -> Result<Vec<(u64, Vec<u8>)>, WireError> {
        let count = self.u32()? as usize;
        let mut rows = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let id = self.u64()?;
            let len = self.u32()? as usize;
            rows.push((id, self.take(len)?.to_vec()));
        }
        Ok(rows)
    }
}

/// Decode a server frame, transparently decompressing.
pub fn decode_frame(frame: &[u8]) -> Result<ServerFrame, WireError> {
    if frame.len() < 2 {
        return Err(WireError::Truncated);
    }
    let frame_type = frame[0];
    let flags = frame[1];
    let decompressed;
    let payload = if flags & FLAG_GZIP != 0 {
        decompressed = gunzip(&frame[2..])?;
        decompressed.as_slice()
    } else {
        &frame[2..]
    };

    let mut c = Cursor { data: payload, pos: 0 };
    match frame_type {
        frame_type::SNAPSHOT => {
            let pane = c.u16()?;
            let cols = c.u16()?;
            let rows = c.u16()?;
            let cursor = (c.u16()?, c.u16()?);
            let modes = c.u8()?;
            let generation = c.u64()?;
            let min_row_id = c.u64()?;
            let max_row_id = c.u64()?;
            let page_size = c.u32()?;
            let viewport_start = c.u64()?;
            let rows_data = c.rows()?;
            Ok(ServerFrame::Snapshot(Snapshot {
                pane,
                cols,
                rows,
                cursor,
                modes,
                generation,
                min_row_id,
                max_row_id,
                page_size,
                viewport_start,
                rows_data,
            }))
        }
        frame_type::DELTA => {
            let pane = c.u16()?;
            let from_gen = c.u64()?;
            let to_gen = c.u64()?;
            let cols = c.u16()?;
            let rows_dim = c.u16()?;
            let cursor = (c.u16()?, c.u16()?);
            let modes = c.u8()?;
            let min_row_id = c.u64()?;
            let max_row_id = c.u64()?;
            let viewport_start = c.u64()?;
            let rows = c.rows()?;
            Ok(ServerFrame::Delta(Delta {
                pane,
                from_gen,
                to_gen,
                cols,
                rows_dim,
                cursor,
                modes,
                min_row_id,
                max_row_id,
                viewport_start,
                rows,
            }))
        }
        frame_type::TITLE => {
            let pane = c.u16()?;
            let title = payload[c.pos..].to_vec();
            Ok(ServerFrame::Title { pane, title })
        }
        frame_type::BELL => Ok(ServerFrame::Bell { pane: c.u16()? }),
        frame_type::PING => Ok(ServerFrame::Ping),
        frame_type::PONG => Ok(ServerFrame::Pong),
        frame_type::ERROR => Ok(ServerFrame::Error(
            String::from_utf8_lossy(payload).into_owned(),
        )),
        frame_type::ROLE => Ok(ServerFrame::Role(c.u8()?)),
        other => Err(WireError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<(u64, Vec<u8>)> {
        vec![(0, b"row zero".to_vec()), (3, b"row three".to_vec())]
    }

    #[test]
    fn snapshot_roundtrip() {
        let rows = sample_rows();
        let frame = encode_snapshot(&SnapshotView {
            pane: 4,
            cols: 80,
            rows: 24,
            cursor_row: 5,
            cursor_col: 10,
            modes: 0x03,
            generation: 42,
            min_row_id: 0,
            max_row_id: 23,
            page_size: 1000,
            viewport_start: 0,
            row_data: &rows,
        });

        match decode_frame(&frame).expect("decode") {
            ServerFrame::Snapshot(s) => {
                assert_eq!(s.pane, 4);
                assert_eq!(s.cols, 80);
                assert_eq!(s.rows, 24);
                assert_eq!(s.cursor, (5, 10));
                assert_eq!(s.generation, 42);
                assert_eq!(s.page_size, 1000);
                assert_eq!(s.rows_data, rows);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn delta_roundtrip() {
        let rows = sample_rows();
        let frame = encode_delta(&DeltaView {
            pane: 2,
            from_gen: 10,
            to_gen: 17,
            cols: 120,
            rows: 40,
            cursor_row: 1,
            cursor_col: 2,
            modes: 0,
            min_row_id: 5,
            max_row_id: 44,
            viewport_start: 5,
            row_data: &rows,
        });

        match decode_frame(&frame).expect("decode") {
            ServerFrame::Delta(d) => {
                assert_eq!(d.from_gen, 10);
                assert_eq!(d.to_gen, 17);
                assert_eq!(d.cols, 120);
                assert_eq!(d.rows, rows);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn large_payload_is_compressed() {
        // Highly compressible content well over the threshold.
        let rows = vec![(0u64, vec![b'a'; 8192])];
        let frame = encode_snapshot(&SnapshotView {
            pane: 0,
            cols: 80,
            rows: 24,
            cursor_row: 0,
            cursor_col: 0,
            modes: 0,
            generation: 1,
            min_row_id: 0,
            max_row_id: 23,
            page_size: 1000,
            viewport_start: 0,
            row_data: &rows,
        });

        assert_eq!(frame[1] & FLAG_GZIP, FLAG_GZIP);
        assert!(frame.len() < 8192);

        // And it still decodes.
        match decode_frame(&frame).expect("decode") {
            ServerFrame::Snapshot(s) => assert_eq!(s.rows_data[0].1.len(), 8192),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn small_payload_stays_uncompressed() {
        let frame = encode_bell(9);
        assert_eq!(frame[1], 0);
        assert_eq!(decode_frame(&frame).expect("decode"), ServerFrame::Bell { pane: 9 });
    }

    #[test]
    fn auxiliary_frames_roundtrip() {
        assert_eq!(decode_frame(&encode_ping()).expect("d"), ServerFrame::Ping);
        assert_eq!(decode_frame(&encode_pong()).expect("d"), ServerFrame::Pong);
        assert_eq!(
            decode_frame(&encode_role(2)).expect("d"),
            ServerFrame::Role(2)
        );
        match decode_frame(&encode_title(3, "vim")).expect("d") {
            ServerFrame::Title { pane, title } => {
                assert_eq!(pane, 3);
                assert_eq!(title, b"vim");
            }
            other => panic!("wrong frame: {other:?}"),
        }
        match decode_frame(&encode_error("nope")).expect("d") {
            ServerFrame::Error(msg) => assert_eq!(msg, "nope"),
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn truncated_and_unknown_frames_error() {
        assert!(matches!(decode_frame(&[]), Err(WireError::Truncated)));
        assert!(matches!(
            decode_frame(&[0xEE, 0x00]),
            Err(WireError::UnknownType(0xEE))
        ));
    }
}
