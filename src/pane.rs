//! Panes: one VT emulator plus (usually) one PTY child.
//!
//! The pane is where delta-sync lives. Every observable mutation — PTY
//! bytes, resize, scroll, title, bell, selection — bumps a 64-bit
//! `generation`. Dirty rows accumulate between broadcasts keyed by stable
//! row ids, and the broadcast delta for a tick is computed exactly once
//! and cached, no matter how many clients need it.
//!
//! # Row ids
//!
//! Rows are identified across scrollback by a page scheme:
//! `(page_serial × PAGE_SIZE) + row_index`. A logical line keeps its id
//! from the moment it appears until it is evicted from scrollback, so
//! clients can anchor their own scrollback buffers to server ids.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──► Terminating ──► Gone
//!    │  (child exit / EOF)      ▲
//!    └──────────────────────────┘
//! ```
//!
//! `Terminating` sends SIGTERM; 500 ms later SIGKILL; 1 s after that the
//! pane is `Gone` even if the child was never reaped.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::time::Instant;

use nix::sys::signal::Signal;

use crate::constants::{
    CHILD_KILL_GRACE, CHILD_TERM_GRACE, MAX_PANE_DIM, MIN_PANE_DIM, PAGE_SIZE, SCROLLBACK_LINES,
};
use crate::pty::Pty;
use crate::term::{Damage, Emulator, MouseEncoding, TermEvent};
use crate::wire::{self, DeltaView, SnapshotView};

/// Pane identifier, unique within the process.
pub type PaneId = u16;

/// Compute a stable row id from a linear line index.
///
/// With the current page size this is numerically the identity, but the
/// page split is part of the wire contract, so it is computed explicitly.
pub fn row_id(linear: u64) -> u64 {
    let page_serial = linear / PAGE_SIZE;
    let row_index = linear % PAGE_SIZE;
    page_serial * PAGE_SIZE + row_index
}

/// Pane lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    /// Child alive (or no child at all for the debug pane).
    Running,
    /// SIGTERM sent; counting down to SIGKILL and then to Gone.
    Terminating,
    /// Finished; the registry will drop the pane.
    Gone,
}

/// One-slot memoization of the delta computed for the current tick.
#[derive(Debug, Clone)]
pub struct CachedDelta {
    /// Generation the delta starts from.
    pub from_gen: u64,
    /// Generation the delta ends at.
    pub to_gen: u64,
    /// Encoded wire frame.
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Terminating {
    term_sent_at: Instant,
    kill_sent_at: Option<Instant>,
}

/// A pane: emulator, optional PTY, delta tracking, broadcast cache.
#[derive(Debug)]
pub struct Pane {
    id: PaneId,
    emulator: Emulator,
    pty: Option<Pty>,
    state: PaneState,
    terminating: Option<Terminating>,

    generation: u64,
    /// Dirty row ids accumulated since the last broadcast.
    dirty_rows: BTreeSet<u64>,
    /// Cumulative lines displaced from the viewport into history.
    displaced: u64,
    last_history_size: usize,

    title: String,
    title_changed: bool,
    bell: bool,

    /// Input bytes the PTY refused (partial write); retried each tick.
    pending_input: VecDeque<u8>,
    /// OSC 52 clipboard stores awaiting pickup by the session.
    clipboard_stores: Vec<Vec<u8>>,

    last_broadcast_gen: u64,
    cached_delta: Option<CachedDelta>,
}

impl Pane {
    /// Create a pane around an already-spawned PTY, or none for the
    /// debug pane.
    pub fn new(id: PaneId, cols: u16, rows: u16, pty: Option<Pty>) -> Self {
        Self {
            id,
            emulator: Emulator::new(cols, rows, SCROLLBACK_LINES),
            pty,
            state: PaneState::Running,
            terminating: None,
            generation: 0,
            dirty_rows: BTreeSet::new(),
            displaced: 0,
            last_history_size: 0,
            title: String::new(),
            title_changed: false,
            bell: false,
            pending_input: VecDeque::new(),
            clipboard_stores: Vec::new(),
            last_broadcast_gen: 0,
            cached_delta: None,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    /// Pane id.
    pub fn id(&self) -> PaneId {
        self.id
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lifecycle state.
    pub fn state(&self) -> PaneState {
        self.state
    }

    /// Whether this pane owns a PTY (false for the debug pane).
    pub fn has_pty(&self) -> bool {
        self.pty.is_some()
    }

    /// PTY master fd for the poll set, if any.
    pub fn master_fd(&self) -> Option<std::os::fd::RawFd> {
        self.pty.as_ref().map(Pty::master_fd)
    }

    /// Current dimensions (cols, rows).
    pub fn dims(&self) -> (u16, u16) {
        (self.emulator.cols(), self.emulator.rows())
    }

    /// Current terminal title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Take the title-changed flag.
    pub fn take_title_changed(&mut self) -> bool {
        std::mem::take(&mut self.title_changed)
    }

    /// Take the bell flag.
    pub fn take_bell(&mut self) -> bool {
        std::mem::take(&mut self.bell)
    }

    /// Take any OSC 52 clipboard stores captured since the last call.
    pub fn take_clipboard_stores(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.clipboard_stores)
    }

    /// DECCKM state, for arrow-key encoding.
    pub fn cursor_key_application(&self) -> bool {
        self.emulator.cursor_key_application()
    }

    /// Active mouse encoding, for mouse-event encoding.
    pub fn mouse_encoding(&self) -> MouseEncoding {
        self.emulator.mouse_encoding()
    }

    /// Whether the application enabled mouse reporting at all.
    pub fn mouse_reporting(&self) -> bool {
        self.emulator.mouse_reporting()
    }

    /// Whether bracketed paste is active (paste wrapping).
    pub fn bracketed_paste(&self) -> bool {
        self.emulator.bracketed_paste()
    }

    /// Borrow the emulator (read-only inspection, tests).
    pub fn emulator(&self) -> &Emulator {
        &self.emulator
    }

    // ── Row-id bookkeeping ────────────────────────────────────────────────

    /// Row id of the top visible line (accounting for display offset).
    fn viewport_start_id(&self) -> u64 {
        let offset = self.emulator.display_offset() as u64;
        row_id(self.displaced.saturating_sub(offset))
    }

    /// Oldest row id still retained in scrollback.
    fn min_row_id(&self) -> u64 {
        row_id(self.displaced.saturating_sub(self.emulator.history_size() as u64))
    }

    /// Newest row id (bottom visible line of the live screen).
    fn max_row_id(&self) -> u64 {
        row_id(self.displaced + u64::from(self.emulator.rows()).saturating_sub(1))
    }

    fn mark_viewport_dirty(&mut self) {
        let base = self.displaced;
        for line in 0..u64::from(self.emulator.rows()) {
            self.dirty_rows.insert(row_id(base + line));
        }
    }

    fn bump(&mut self) {
        self.generation += 1;
    }

    /// Fold emulator damage into the dirty row set using current ids.
    fn absorb_damage(&mut self) {
        match self.emulator.take_damage() {
            Damage::Full => self.mark_viewport_dirty(),
            Damage::Lines(lines) => {
                for line in lines {
                    self.dirty_rows.insert(row_id(self.displaced + line as u64));
                }
            }
        }
    }

    // ── Operations ────────────────────────────────────────────────────────

    /// Push PTY output into the emulator; marks rows dirty and bumps the
    /// generation.
    pub fn feed(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        self.emulator.feed(bytes);

        // Lines that scrolled off during this feed displace the row-id
        // window. History growth is the observable proxy; once scrollback
        // saturates the oldest ids are reused (the browser resyncs from
        // min_row_id, so staleness is bounded by the retention window).
        let history = self.emulator.history_size();
        if history > self.last_history_size {
            self.displaced += (history - self.last_history_size) as u64;
        }
        self.last_history_size = history;

        self.absorb_damage();

        for event in self.emulator.drain_events() {
            match event {
                TermEvent::Title(title) => {
                    if title != self.title {
                        self.title = title;
                        self.title_changed = true;
                    }
                }
                TermEvent::ResetTitle => {
                    if !self.title.is_empty() {
                        self.title.clear();
                        self.title_changed = true;
                    }
                }
                TermEvent::Bell => self.bell = true,
                TermEvent::PtyWrite(bytes) => {
                    // Emulator responses (DA/DSR) go straight back to the
                    // child, queued like user input.
                    let _ = self.write_input(&bytes);
                }
                TermEvent::ClipboardStore(data) => self.clipboard_stores.push(data),
            }
        }

        self.bump();
    }

    /// Write bytes into the PTY master; partial writes are queued and
    /// retried on the next tick.
    pub fn write_input(&mut self, bytes: &[u8]) -> io::Result<()> {
        let Some(pty) = self.pty.as_ref() else {
            // The debug pane swallows input.
            return Ok(());
        };

        if !self.pending_input.is_empty() {
            self.pending_input.extend(bytes);
            return Ok(());
        }

        let mut written = 0;
        while written < bytes.len() {
            match pty.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending_input.extend(&bytes[written..]);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Retry queued input. Called once per tick.
    pub fn flush_input(&mut self) {
        let Some(pty) = self.pty.as_ref() else { return };
        while !self.pending_input.is_empty() {
            let (front, _) = self.pending_input.as_slices();
            match pty.write(front) {
                Ok(n) => {
                    self.pending_input.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("pane {}: input flush failed: {e}", self.id);
                    self.pending_input.clear();
                    break;
                }
            }
        }
    }

    /// Resize the pane. Dimensions outside `[1,500]` are rejected
    /// silently (logged); valid resizes propagate to emulator and PTY
    /// and bump the generation.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let valid = (MIN_PANE_DIM..=MAX_PANE_DIM).contains(&cols)
            && (MIN_PANE_DIM..=MAX_PANE_DIM).contains(&rows);
        if !valid {
            log::warn!("pane {}: rejected resize to {cols}x{rows}", self.id);
            return;
        }
        if (cols, rows) == self.dims() {
            return;
        }

        self.emulator.resize(cols, rows);
        if let Some(pty) = self.pty.as_ref() {
            if let Err(e) = pty.resize(cols, rows) {
                log::warn!("pane {}: TIOCSWINSZ failed: {e}", self.id);
            }
        }

        let history = self.emulator.history_size();
        if history > self.last_history_size {
            self.displaced += (history - self.last_history_size) as u64;
        }
        self.last_history_size = history;

        self.absorb_damage();
        self.mark_viewport_dirty();
        self.bump();
    }

    /// Pan the viewport over scrollback and bump the generation.
    pub fn scroll(&mut self, delta: i32) {
        self.emulator.scroll_display(delta);
        self.mark_viewport_dirty();
        self.bump();
    }

    /// Select the whole grid; observable, so the generation bumps.
    pub fn select_all(&mut self) {
        self.emulator.select_all();
        self.bump();
    }

    /// Clear the selection; observable, so the generation bumps.
    pub fn clear_selection(&mut self) {
        if self.emulator.has_selection() {
            self.emulator.clear_selection();
            self.bump();
        }
    }

    /// Text of the active selection, if any.
    pub fn selection_text(&self) -> Option<String> {
        self.emulator.selection_text()
    }

    // ── Wire frames ───────────────────────────────────────────────────────

    fn modes_byte(&self) -> u8 {
        let mut modes = 0u8;
        if self.emulator.cursor_visible() {
            modes |= 0x01;
        }
        if self.emulator.cursor_key_application() {
            modes |= 0x02;
        }
        if self.emulator.bracketed_paste() {
            modes |= 0x04;
        }
        let encoding = match self.emulator.mouse_encoding() {
            MouseEncoding::X10 => 0u8,
            MouseEncoding::Sgr => 1,
            MouseEncoding::SgrPixels => 2,
            MouseEncoding::Urxvt => 3,
            MouseEncoding::Utf8 => 4,
        };
        modes | (encoding << 4)
    }

    /// Encode one retained row by id; `None` if evicted or out of range.
    fn encode_row_by_id(&self, id: u64) -> Option<Vec<u8>> {
        let min = self.displaced.saturating_sub(self.emulator.history_size() as u64);
        let max = self.displaced + u64::from(self.emulator.rows());
        if id < min || id >= max {
            return None;
        }
        // Viewport-relative line index; negative reaches history.
        let line = id as i64 - self.displaced as i64;
        Some(self.emulator.encode_row_at(line as i32))
    }

    /// Build a full snapshot frame of the current state.
    pub fn snapshot(&self) -> Vec<u8> {
        let (cursor_row, cursor_col) = self.emulator.cursor();
        let start = self.viewport_start_id();
        let rows: Vec<(u64, Vec<u8>)> = (0..u64::from(self.emulator.rows()))
            .filter_map(|i| {
                let id = start + i;
                self.encode_row_by_id(id).map(|bytes| (id, bytes))
            })
            .collect();

        wire::encode_snapshot(&SnapshotView {
            pane: self.id,
            cols: self.emulator.cols(),
            rows: self.emulator.rows(),
            cursor_row,
            cursor_col,
            modes: self.modes_byte(),
            generation: self.generation,
            min_row_id: self.min_row_id(),
            max_row_id: self.max_row_id(),
            page_size: PAGE_SIZE as u32,
            viewport_start: start,
            row_data: &rows,
        })
    }

    /// Broadcast delta for this tick, computed once and cached.
    ///
    /// The cache is keyed on the target generation: any later mutation
    /// bumps `generation` and naturally invalidates it. Clients whose
    /// last-known generation differs from `from_gen` take the snapshot
    /// path instead.
    pub fn get_broadcast_delta(&mut self) -> CachedDelta {
        if let Some(cached) = &self.cached_delta {
            if cached.to_gen == self.generation {
                return cached.clone();
            }
        }

        let from_gen = self.last_broadcast_gen;
        let (cursor_row, cursor_col) = self.emulator.cursor();
        let rows: Vec<(u64, Vec<u8>)> = self
            .dirty_rows
            .iter()
            .filter_map(|&id| self.encode_row_by_id(id).map(|bytes| (id, bytes)))
            .collect();

        let bytes = wire::encode_delta(&DeltaView {
            pane: self.id,
            from_gen,
            to_gen: self.generation,
            cols: self.emulator.cols(),
            rows: self.emulator.rows(),
            cursor_row,
            cursor_col,
            modes: self.modes_byte(),
            min_row_id: self.min_row_id(),
            max_row_id: self.max_row_id(),
            viewport_start: self.viewport_start_id(),
            row_data: &rows,
        });

        let cached = CachedDelta { from_gen, to_gen: self.generation, bytes };
        self.cached_delta = Some(cached.clone());
        self.last_broadcast_gen = self.generation;
        self.dirty_rows.clear();
        cached
    }

    // ── PTY I/O ───────────────────────────────────────────────────────────

    /// Read from the PTY master into `buf`.
    pub fn read_pty(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.pty.as_ref() {
            Some(pty) => pty.read(buf),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Begin teardown: SIGTERM now, SIGKILL after the grace period.
    pub fn begin_terminate(&mut self) {
        match self.state {
            PaneState::Running => {
                if let Some(pty) = self.pty.as_ref() {
                    pty.signal(Signal::SIGTERM);
                    self.state = PaneState::Terminating;
                    self.terminating = Some(Terminating {
                        term_sent_at: Instant::now(),
                        kill_sent_at: None,
                    });
                } else {
                    self.state = PaneState::Gone;
                }
            }
            PaneState::Terminating | PaneState::Gone => {}
        }
    }

    /// Advance the termination countdown. Called once per tick.
    pub fn poll_lifecycle(&mut self, now: Instant) {
        if self.state != PaneState::Terminating {
            return;
        }
        let Some(pty) = self.pty.as_ref() else {
            self.state = PaneState::Gone;
            return;
        };

        if pty.try_reap() {
            self.state = PaneState::Gone;
            return;
        }

        let Some(t) = self.terminating.as_mut() else { return };
        match t.kill_sent_at {
            None if now.duration_since(t.term_sent_at) >= CHILD_TERM_GRACE => {
                pty.signal(Signal::SIGKILL);
                t.kill_sent_at = Some(now);
            }
            Some(killed_at) if now.duration_since(killed_at) >= CHILD_KILL_GRACE => {
                // Declared gone even if the child was never reaped.
                log::warn!("pane {}: child unreaped after SIGKILL grace", self.id);
                self.state = PaneState::Gone;
            }
            _ => {}
        }
    }

    /// Handle PTY EOF or child-exit observation.
    pub fn on_pty_eof(&mut self) {
        log::info!("pane {}: PTY EOF", self.id);
        self.begin_terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane() -> Pane {
        // No PTY: exercises the emulator/delta paths deterministically.
        Pane::new(7, 80, 24, None)
    }

    #[test]
    fn generation_strictly_increases_on_feed() {
        let mut p = pane();
        let mut last = p.generation();
        for chunk in [&b"a"[..], b"bb", b"\x1b[31mred"] {
            p.feed(chunk);
            assert!(p.generation() > last);
            last = p.generation();
        }
    }

    #[test]
    fn resize_bounds() {
        let mut p = pane();
        let before = p.generation();

        p.resize(0, 24);
        assert_eq!(p.dims(), (80, 24));
        assert_eq!(p.generation(), before, "rejected resize must not bump");

        p.resize(501, 24);
        assert_eq!(p.dims(), (80, 24));

        p.resize(1, 1);
        assert_eq!(p.dims(), (1, 1));

        p.resize(500, 500);
        assert_eq!(p.dims(), (500, 500));
        assert!(p.generation() > before);
    }

    #[test]
    fn title_and_bell_flags() {
        let mut p = pane();
        p.feed(b"\x1b]0;work\x07");
        assert_eq!(p.title(), "work");
        assert!(p.take_title_changed());
        assert!(!p.take_title_changed());

        p.feed(b"\x07");
        assert!(p.take_bell());
        assert!(!p.take_bell());
    }

    #[test]
    fn delta_cache_is_computed_once_per_tick() {
        let mut p = pane();
        p.feed(b"hello");
        let first = p.get_broadcast_delta();
        let second = p.get_broadcast_delta();
        assert_eq!(first.from_gen, second.from_gen);
        assert_eq!(first.to_gen, second.to_gen);
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn mutation_invalidates_delta_cache() {
        let mut p = pane();
        p.feed(b"one");
        let first = p.get_broadcast_delta();
        p.feed(b"two");
        let second = p.get_broadcast_delta();
        assert!(second.to_gen > first.to_gen);
        assert_eq!(second.from_gen, first.to_gen);
    }

    #[test]
    fn snapshot_decodes_to_current_dims() {
        let mut p = pane();
        p.feed(b"content");
        let snap = p.snapshot();
        let decoded = wire::decode_frame(&snap).expect("decode");
        match decoded {
            wire::ServerFrame::Snapshot(s) => {
                assert_eq!(s.cols, 80);
                assert_eq!(s.rows, 24);
                assert_eq!(s.generation, p.generation());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn delta_rows_carry_fed_glyph() {
        let mut p = pane();
        p.feed(b"ignored-baseline");
        p.get_broadcast_delta();

        p.feed(b"Z");
        let delta = p.get_broadcast_delta();
        let decoded = wire::decode_frame(&delta.bytes).expect("decode");
        match decoded {
            wire::ServerFrame::Delta(d) => {
                assert!(d.to_gen > d.from_gen);
                let all: Vec<u8> = d.rows.iter().flat_map(|(_, b)| b.clone()).collect();
                let text = String::from_utf8_lossy(&all);
                assert!(text.contains('Z'), "delta rows missing glyph: {text:?}");
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn scroll_bumps_generation() {
        let mut p = Pane::new(1, 10, 4, None);
        for i in 0..30 {
            p.feed(format!("l{i}\r\n").as_bytes());
        }
        let before = p.generation();
        p.scroll(3);
        assert!(p.generation() > before);
    }

    #[test]
    fn selection_bumps_generation() {
        let mut p = pane();
        p.feed(b"select me");
        let before = p.generation();
        p.select_all();
        assert!(p.generation() > before);
        assert!(p.selection_text().expect("text").contains("select me"));
        p.clear_selection();
        assert!(p.generation() > before + 1);
    }

    #[test]
    fn clearing_no_selection_is_silent() {
        let mut p = pane();
        let before = p.generation();
        p.clear_selection();
        assert_eq!(p.generation(), before);
    }

    #[test]
    fn debug_pane_terminates_immediately() {
        let mut p = pane();
        p.begin_terminate();
        assert_eq!(p.state(), PaneState::Gone);
    }

    #[test]
    fn row_ids_track_scrollback() {
        let mut p = Pane::new(2, 10, 4, None);
        for i in 0..10 {
            p.feed(format!("line-{i}\r\n").as_bytes());
        }
        // Ten newlines on a 4-row screen push lines into history.
        assert!(p.min_row_id() < p.max_row_id());
        assert!(p.max_row_id() >= 9);
    }

    #[test]
    fn page_scheme_is_stable() {
        assert_eq!(row_id(0), 0);
        assert_eq!(row_id(999), 999);
        assert_eq!(row_id(1000), 1000);
        assert_eq!(row_id(123_456), 123_456);
    }
}
