//! Application-wide constants for dullahan.
//!
//! This module centralizes magic numbers so the event loop, transports,
//! and pane lifecycle all agree on the same values. Constants are grouped
//! by domain with documentation explaining their purpose.

use std::time::Duration;

// ============================================================================
// Network / listener
// ============================================================================

/// Default HTTP/WebSocket listening port.
pub const DEFAULT_PORT: u16 = 7681;

/// Poll timeout ceiling per event-loop tick.
///
/// Bounds worst-case shutdown latency: a signal arriving between ticks is
/// observed within one second even if the notify pipe write was lost.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

// ============================================================================
// Pending-connection stage deadlines
// ============================================================================

/// Maximum time for the TLS handshake to complete after accept.
pub const TLS_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

/// Maximum wait for the first request byte after the handshake (or after
/// accept on plain connections). Browsers send the request immediately;
/// anything slower is a port scanner or a stalled peer.
pub const FIRST_BYTE_DEADLINE: Duration = Duration::from_millis(250);

/// Maximum time from the first request byte to complete headers.
pub const HEADER_DEADLINE: Duration = Duration::from_secs(2);

/// Maximum accepted HTTP header bytes; exceeding this yields `431`.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

// ============================================================================
// WebSocket
// ============================================================================

/// Per-connection write buffer cap. A client that falls this far behind
/// is closed rather than allowed to consume unbounded memory.
pub const MAX_WRITE_BUFFER: usize = 8 * 1024 * 1024;

/// Idle interval before the server sends a protocol-level ping.
pub const IDLE_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period after an idle ping before the connection is closed.
pub const PONG_DEADLINE: Duration = Duration::from_secs(30);

// ============================================================================
// Pane / PTY
// ============================================================================

/// Minimum pane dimension (columns or rows).
pub const MIN_PANE_DIM: u16 = 1;

/// Maximum pane dimension (columns or rows).
pub const MAX_PANE_DIM: u16 = 500;

/// Default width for new panes.
pub const DEFAULT_COLS: u16 = 80;

/// Default height for new panes.
pub const DEFAULT_ROWS: u16 = 24;

/// Scrollback line limit per pane.
pub const SCROLLBACK_LINES: usize = 5_000;

/// Rows per scrollback page; row ids are `page_serial * PAGE_SIZE + index`.
pub const PAGE_SIZE: u64 = 1000;

/// Grace period between SIGTERM and SIGKILL when tearing down a pane child.
pub const CHILD_TERM_GRACE: Duration = Duration::from_millis(500);

/// Time after SIGKILL before the pane is declared gone even if unreaped.
pub const CHILD_KILL_GRACE: Duration = Duration::from_secs(1);

/// Scratch buffer size for PTY master reads.
pub const PTY_READ_CHUNK: usize = 64 * 1024;

// ============================================================================
// Wire frames
// ============================================================================

/// Payloads at or above this size are gzip-compressed on the wire.
pub const COMPRESS_THRESHOLD: usize = 256;

/// Maximum serialized snapshot size (a 500x500 grid plus metadata fits).
pub const MAX_SNAPSHOT_BYTES: usize = 4 * 1024 * 1024;
