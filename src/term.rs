//! Terminal emulator abstraction wrapping [`alacritty_terminal`].
//!
//! Provides [`Emulator`] — a wrapper around [`Term`] and [`Processor`]
//! presenting the narrow interface the pane layer needs: `feed(bytes)`,
//! `resize`, damage consumption, mode queries, title/bell/selection
//! handling, and per-row ANSI serialization for the wire.
//!
//! # Architecture
//!
//! ```text
//! Emulator
//!  ├── term: Term<EventProxy>   (grid, cursor, modes)
//!  ├── processor: Processor     (VTE state machine feeding the term)
//!  └── events: Rc<RefCell<..>>  (title / bell / pty-echo events captured
//!                                during feed, drained by the pane)
//! ```
//!
//! The emulator is confined to the event loop thread; events are captured
//! through an `Rc<RefCell<_>>` proxy rather than a channel.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::{Dimensions, Scroll};
use alacritty_terminal::index::{Column, Line, Point, Side};
use alacritty_terminal::selection::{Selection, SelectionType};
use alacritty_terminal::term::cell::{Cell, Flags};
use alacritty_terminal::term::{Config, Term, TermMode};
use alacritty_terminal::vte::ansi::{Color, NamedColor, Processor};

/// Mouse reporting encodings a pane can be in.
///
/// Which one is active follows the DEC private modes the application set;
/// the protocol layer encodes browser mouse events accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseEncoding {
    /// Legacy single-byte X10 encoding (`ESC [ M ...`), 222-cell limit.
    #[default]
    X10,
    /// SGR encoding (`ESC [ < b;x;y M|m`), 1-indexed cells.
    Sgr,
    /// SGR with 0-indexed pixel coordinates.
    SgrPixels,
    /// URXVT decimal encoding (`ESC [ b+32;x;y M`).
    Urxvt,
    /// X10 layout with multi-byte UTF-8 coordinates.
    Utf8,
}

/// Events the emulator surfaces to the pane after a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermEvent {
    /// OSC title change.
    Title(String),
    /// Title reset to default.
    ResetTitle,
    /// BEL.
    Bell,
    /// Bytes the emulator must write back to the PTY (DA/DSR responses).
    PtyWrite(Vec<u8>),
    /// OSC 52 clipboard store from the application.
    ClipboardStore(Vec<u8>),
}

/// Captures [`Event`]s raised while the processor advances.
#[derive(Debug, Clone)]
struct EventProxy {
    queue: Rc<RefCell<VecDeque<TermEvent>>>,
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        let mapped = match event {
            Event::Title(title) => Some(TermEvent::Title(title)),
            Event::ResetTitle => Some(TermEvent::ResetTitle),
            Event::Bell => Some(TermEvent::Bell),
            Event::PtyWrite(text) => Some(TermEvent::PtyWrite(text.into_bytes())),
            Event::ClipboardStore(_, data) => {
                Some(TermEvent::ClipboardStore(data.into_bytes()))
            }
            _ => None,
        };
        if let Some(e) = mapped {
            self.queue.borrow_mut().push_back(e);
        }
    }
}

/// Minimal [`Dimensions`] implementor for constructing and resizing a
/// [`Term`] without alacritty's full `SizeInfo`.
#[derive(Debug, Clone, Copy)]
struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl Dimensions for TermSize {
    fn columns(&self) -> usize {
        self.columns
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn total_lines(&self) -> usize {
        // Viewport height suffices; scrollback grows via scrolling_history.
        self.screen_lines
    }
}

/// Damaged viewport lines since the last reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Damage {
    /// Everything changed (resize, full clear).
    Full,
    /// Specific viewport line indices changed.
    Lines(Vec<usize>),
}

/// Terminal emulator bundled with its VTE state machine.
pub struct Emulator {
    term: Term<EventProxy>,
    processor: Processor,
    events: Rc<RefCell<VecDeque<TermEvent>>>,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("cols", &self.term.grid().columns())
            .field("rows", &self.term.grid().screen_lines())
            .field("history", &self.term.grid().history_size())
            .finish_non_exhaustive()
    }
}

impl Emulator {
    /// Create an emulator with the given viewport and scrollback depth.
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        let size = TermSize {
            columns: cols.max(1) as usize,
            screen_lines: rows.max(1) as usize,
        };
        let config = Config {
            scrolling_history: scrollback,
            ..Config::default()
        };
        let events = Rc::new(RefCell::new(VecDeque::new()));
        let term = Term::new(config, &size, EventProxy { queue: Rc::clone(&events) });
        Self { term, processor: Processor::new(), events }
    }

    /// Feed raw PTY bytes. Hot path.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.processor.advance(&mut self.term, bytes);
    }

    /// Resize the grid; handles reflow and cursor clamping.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let size = TermSize {
            columns: cols.max(1) as usize,
            screen_lines: rows.max(1) as usize,
        };
        self.term.resize(size);
    }

    /// Pan the viewport over scrollback. Positive deltas scroll up
    /// (into history), negative back toward the live screen.
    pub fn scroll_display(&mut self, delta: i32) {
        self.term.scroll_display(Scroll::Delta(delta));
    }

    /// Current display offset into scrollback (0 = live screen).
    pub fn display_offset(&self) -> usize {
        self.term.grid().display_offset()
    }

    /// Drain events captured since the last call.
    pub fn drain_events(&mut self) -> Vec<TermEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// Consume accumulated damage, resetting it.
    pub fn take_damage(&mut self) -> Damage {
        use alacritty_terminal::term::TermDamage;
        let damage = match self.term.damage() {
            TermDamage::Full => Damage::Full,
            TermDamage::Partial(lines) => {
                Damage::Lines(lines.map(|bounds| bounds.line).collect())
            }
        };
        self.term.reset_damage();
        damage
    }

    /// Viewport width in columns.
    pub fn cols(&self) -> u16 {
        self.term.grid().columns() as u16
    }

    /// Viewport height in rows.
    pub fn rows(&self) -> u16 {
        self.term.grid().screen_lines() as u16
    }

    /// Lines currently held in scrollback history.
    pub fn history_size(&self) -> usize {
        self.term.grid().history_size()
    }

    /// Cursor position as (viewport row, column).
    pub fn cursor(&self) -> (u16, u16) {
        let point = self.term.grid().cursor.point;
        (point.line.0.max(0) as u16, point.column.0 as u16)
    }

    /// Whether the cursor is visible (`DECTCEM`).
    pub fn cursor_visible(&self) -> bool {
        self.term.mode().contains(TermMode::SHOW_CURSOR)
    }

    /// Whether DECCKM (application cursor keys) is active.
    ///
    /// When set, unmodified arrows must be encoded as SS3 sequences
    /// (`ESC O A`) instead of CSI (`ESC [ A`).
    pub fn cursor_key_application(&self) -> bool {
        self.term.mode().contains(TermMode::APP_CURSOR)
    }

    /// Whether bracketed paste is active (`ESC [ ? 2004 h`).
    pub fn bracketed_paste(&self) -> bool {
        self.term.mode().contains(TermMode::BRACKETED_PASTE)
    }

    /// Whether any mouse reporting mode is enabled.
    pub fn mouse_reporting(&self) -> bool {
        self.term.mode().intersects(
            TermMode::MOUSE_REPORT_CLICK | TermMode::MOUSE_DRAG | TermMode::MOUSE_MOTION,
        )
    }

    /// The active mouse encoding derived from DEC private modes.
    pub fn mouse_encoding(&self) -> MouseEncoding {
        let mode = self.term.mode();
        if mode.contains(TermMode::SGR_MOUSE) {
            MouseEncoding::Sgr
        } else if mode.contains(TermMode::UTF8_MOUSE) {
            MouseEncoding::Utf8
        } else {
            MouseEncoding::X10
        }
    }

    // ── Selection ─────────────────────────────────────────────────────────

    /// Select the entire grid including scrollback.
    pub fn select_all(&mut self) {
        let grid = self.term.grid();
        let history = grid.history_size() as i32;
        let last_line = grid.screen_lines() as i32 - 1;
        let last_col = grid.columns().saturating_sub(1);

        let mut selection = Selection::new(
            SelectionType::Simple,
            Point::new(Line(-history), Column(0)),
            Side::Left,
        );
        selection.update(Point::new(Line(last_line), Column(last_col)), Side::Right);
        self.term.selection = Some(selection);
    }

    /// Clear any active selection.
    pub fn clear_selection(&mut self) {
        self.term.selection = None;
    }

    /// Whether a selection is active.
    pub fn has_selection(&self) -> bool {
        self.term.selection.is_some()
    }

    /// Extract the selected text, if any.
    pub fn selection_text(&self) -> Option<String> {
        self.term.selection_to_string()
    }

    // ── Row serialization ─────────────────────────────────────────────────

    /// Serialize one viewport row as ANSI bytes with diff-emitted SGR.
    ///
    /// `line` is a viewport index (0 = top). The encoding is identical for
    /// every recipient, which is what makes broadcast deltas shareable.
    pub fn encode_row(&self, line: usize) -> Vec<u8> {
        self.encode_row_at(line as i32)
    }

    /// Serialize any retained row; negative indices reach into history
    /// (`-1` is the most recent scrollback line).
    ///
    /// Each row is encoded independently: the pen starts from the default
    /// state, and SGR parameters are emitted incrementally at attribute
    /// boundaries. Wide-character spacer cells contribute nothing (their
    /// glyph was already written by the wide cell to their left); combining
    /// characters ride along behind their base glyph.
    pub fn encode_row_at(&self, line: i32) -> Vec<u8> {
        let grid = self.term.grid();
        let cols = grid.columns();
        let mut out = Vec::with_capacity(cols * 4);
        let mut pen = Pen::default();
        let mut utf8 = [0u8; 4];

        let mut col = 0;
        while col < cols {
            let cell = &grid[Point::new(Line(line), Column(col))];
            col += 1;
            if cell.flags.contains(Flags::WIDE_CHAR_SPACER) {
                continue;
            }

            pen.shift_to(cell, &mut out);

            out.extend_from_slice(cell.c.encode_utf8(&mut utf8).as_bytes());
            for &combining in cell.zerowidth().into_iter().flatten() {
                out.extend_from_slice(combining.encode_utf8(&mut utf8).as_bytes());
            }
        }
        out
    }

    /// Plain-text viewport contents; rows separated by newlines. Tests.
    pub fn contents(&self) -> String {
        let grid = self.term.grid();
        let lines = grid.screen_lines();
        let cols = grid.columns();
        let mut out = String::new();
        for row in 0..lines {
            if row > 0 {
                out.push('\n');
            }
            for col in 0..cols {
                let cell = &grid[Point::new(Line(row as i32), Column(col))];
                out.push(cell.c);
            }
        }
        out
    }
}

/// Style flags a pen tracks. Layout flags (wide chars, wrap markers) are
/// not rendition attributes and never reach the wire.
const PEN_STYLES: Flags = Flags::BOLD
    .union(Flags::DIM)
    .union(Flags::ITALIC)
    .union(Flags::UNDERLINE)
    .union(Flags::INVERSE)
    .union(Flags::HIDDEN)
    .union(Flags::STRIKEOUT);

/// Enable/disable SGR code pairs for the independently togglable styles.
/// Bold and dim are absent: they share disable code 22 and need the
/// coupled handling in [`Pen::style_params`].
const STYLE_TOGGLES: [(Flags, u8, u8); 5] = [
    (Flags::ITALIC, 3, 23),
    (Flags::UNDERLINE, 4, 24),
    (Flags::INVERSE, 7, 27),
    (Flags::HIDDEN, 8, 28),
    (Flags::STRIKEOUT, 9, 29),
];

/// Rendition state carried across one row while encoding.
///
/// Transitions are emitted incrementally: only the attributes that differ
/// between consecutive cells produce SGR parameters, and a cell run with
/// stable attributes produces none at all. Rows always begin from the
/// default pen, so every row is self-contained and rows can be shipped to
/// clients out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pen {
    fg: Color,
    bg: Color,
    style: Flags,
}

impl Default for Pen {
    fn default() -> Self {
        Self {
            fg: Color::Named(NamedColor::Foreground),
            bg: Color::Named(NamedColor::Background),
            style: Flags::empty(),
        }
    }
}

impl Pen {
    fn of(cell: &Cell) -> Self {
        Self {
            fg: cell.fg,
            bg: cell.bg,
            style: cell.flags & PEN_STYLES,
        }
    }

    /// Move this pen to the cell's rendition, writing one `CSI … m`
    /// sequence with the minimal parameter list (nothing when the cell
    /// matches the current state).
    fn shift_to(&mut self, cell: &Cell, out: &mut Vec<u8>) {
        let next = Pen::of(cell);
        if next == *self {
            return;
        }

        let mut params: Vec<String> = Vec::new();
        self.style_params(next.style, &mut params);
        if next.fg != self.fg {
            color_params(next.fg, Layer::Fg, &mut params);
        }
        if next.bg != self.bg {
            color_params(next.bg, Layer::Bg, &mut params);
        }

        if !params.is_empty() {
            out.extend_from_slice(b"\x1b[");
            out.extend_from_slice(params.join(";").as_bytes());
            out.push(b'm');
        }
        *self = next;
    }

    /// Parameters that take the style flags from `self.style` to `next`.
    fn style_params(&self, next: Flags, params: &mut Vec<String>) {
        let gained = next - self.style;
        let lost = self.style - next;

        // Disable code 22 clears bold AND dim together, so losing either
        // one means re-asserting whichever survives.
        if lost.intersects(Flags::BOLD | Flags::DIM) {
            params.push("22".to_string());
            if next.contains(Flags::BOLD) {
                params.push("1".to_string());
            }
            if next.contains(Flags::DIM) {
                params.push("2".to_string());
            }
        } else {
            if gained.contains(Flags::BOLD) {
                params.push("1".to_string());
            }
            if gained.contains(Flags::DIM) {
                params.push("2".to_string());
            }
        }

        for (flag, enable, disable) in STYLE_TOGGLES {
            if gained.contains(flag) {
                params.push(enable.to_string());
            } else if lost.contains(flag) {
                params.push(disable.to_string());
            }
        }
    }
}

/// Which side of the cell a color applies to.
#[derive(Debug, Clone, Copy)]
enum Layer {
    Fg,
    Bg,
}

impl Layer {
    /// (base for colors 0-7, base for colors 8-15, palette selector,
    /// explicit default code). Background codes are the foreground ones
    /// shifted by ten, except the bright range which jumps to 100.
    fn codes(self) -> (u8, u8, &'static str, &'static str) {
        match self {
            Layer::Fg => (30, 90, "38", "39"),
            Layer::Bg => (40, 100, "48", "49"),
        }
    }
}

/// Append the SGR parameters selecting `color` on the given layer.
fn color_params(color: Color, layer: Layer, params: &mut Vec<String>) {
    let (simple, bright, palette, default_code) = layer.codes();
    match color {
        Color::Named(name) => match ansi_index(name) {
            Some(idx @ 0..=7) => params.push((simple + idx).to_string()),
            Some(idx) => params.push((bright + idx - 8).to_string()),
            // Anything without a palette slot renders as the layer default.
            None => params.push(default_code.to_string()),
        },
        Color::Indexed(idx) => {
            params.push(palette.to_string());
            params.push("5".to_string());
            params.push(idx.to_string());
        }
        Color::Spec(rgb) => {
            params.push(palette.to_string());
            params.push("2".to_string());
            for channel in [rgb.r, rgb.g, rgb.b] {
                params.push(channel.to_string());
            }
        }
    }
}

/// Slot of a named color in the 16-color palette; layer bases are applied
/// arithmetically on top, so one table serves foreground and background.
fn ansi_index(name: NamedColor) -> Option<u8> {
    use NamedColor::*;
    let idx = match name {
        Black => 0,
        Red => 1,
        Green => 2,
        Yellow => 3,
        Blue => 4,
        Magenta => 5,
        Cyan => 6,
        White => 7,
        BrightBlack => 8,
        BrightRed => 9,
        BrightGreen => 10,
        BrightYellow => 11,
        BrightBlue => 12,
        BrightMagenta => 13,
        BrightCyan => 14,
        BrightWhite => 15,
        // Dim variants degrade to their standard palette slot.
        DimBlack => 0,
        DimRed => 1,
        DimGreen => 2,
        DimYellow => 3,
        DimBlue => 4,
        DimMagenta => 5,
        DimCyan => 6,
        DimWhite => 7,
        // Defaults and the cursor pseudo-color have no palette slot.
        Foreground | Background | Cursor | BrightForeground | DimForeground => return None,
    };
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_places_text() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.feed(b"Hello");
        assert!(emu.contents().starts_with("Hello"));
    }

    #[test]
    fn resize_updates_dimensions() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.resize(120, 40);
        assert_eq!(emu.cols(), 120);
        assert_eq!(emu.rows(), 40);
    }

    #[test]
    fn title_event_is_captured() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.feed(b"\x1b]0;my title\x07");
        let events = emu.drain_events();
        assert!(events.contains(&TermEvent::Title("my title".to_string())));
    }

    #[test]
    fn bell_event_is_captured() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.feed(b"\x07");
        assert!(emu.drain_events().contains(&TermEvent::Bell));
    }

    #[test]
    fn decckm_tracks_mode() {
        let mut emu = Emulator::new(80, 24, 100);
        assert!(!emu.cursor_key_application());
        emu.feed(b"\x1b[?1h");
        assert!(emu.cursor_key_application());
        emu.feed(b"\x1b[?1l");
        assert!(!emu.cursor_key_application());
    }

    #[test]
    fn sgr_mouse_mode_detected() {
        let mut emu = Emulator::new(80, 24, 100);
        assert_eq!(emu.mouse_encoding(), MouseEncoding::X10);
        emu.feed(b"\x1b[?1000h\x1b[?1006h");
        assert!(emu.mouse_reporting());
        assert_eq!(emu.mouse_encoding(), MouseEncoding::Sgr);
    }

    #[test]
    fn damage_reports_fed_line() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.take_damage(); // clear construction damage
        emu.feed(b"x");
        match emu.take_damage() {
            Damage::Full => {}
            Damage::Lines(lines) => assert!(lines.contains(&0)),
        }
    }

    #[test]
    fn damage_resets_after_take() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.feed(b"x");
        emu.take_damage();
        match emu.take_damage() {
            Damage::Full => panic!("damage did not reset"),
            Damage::Lines(lines) => assert!(lines.is_empty()),
        }
    }

    #[test]
    fn select_all_extracts_text() {
        let mut emu = Emulator::new(80, 4, 100);
        emu.feed(b"alpha\r\nbeta");
        emu.select_all();
        let text = emu.selection_text().expect("selection text");
        assert!(text.contains("alpha"));
        assert!(text.contains("beta"));
        emu.clear_selection();
        assert!(!emu.has_selection());
    }

    #[test]
    fn encode_row_carries_glyphs() {
        let mut emu = Emulator::new(20, 4, 100);
        emu.feed(b"abc");
        let row = emu.encode_row(0);
        let text = String::from_utf8_lossy(&row);
        assert!(text.contains("abc"));
    }

    #[test]
    fn encode_row_emits_color_transitions() {
        let mut emu = Emulator::new(20, 4, 100);
        emu.feed(b"\x1b[31mred\x1b[0m plain");
        let row = emu.encode_row(0);
        let text = String::from_utf8_lossy(&row);
        // Entering red emits 31; returning to plain emits the explicit
        // foreground default.
        assert!(text.contains("\x1b[31m"), "missing red SGR in {text:?}");
        assert!(text.contains("\x1b[39m"), "missing fg reset in {text:?}");
    }

    #[test]
    fn encode_row_transitions_are_incremental() {
        let mut emu = Emulator::new(40, 4, 100);
        // bold+red, then just red: only bold should be retracted.
        emu.feed(b"\x1b[1;31mAB\x1b[22mCD");
        let row = emu.encode_row(0);
        let text = String::from_utf8_lossy(&row);
        assert!(text.contains("\x1b[1;31m"), "enter sequence wrong: {text:?}");
        assert!(text.contains("\x1b[22m"), "bold retract missing: {text:?}");
        // The red run must not be re-announced when only bold changed.
        assert_eq!(text.matches("31").count(), 1, "fg re-emitted: {text:?}");
    }

    #[test]
    fn encode_row_is_silent_for_stable_runs() {
        let mut emu = Emulator::new(20, 4, 100);
        emu.feed(b"plain text");
        let row = emu.encode_row(0);
        // No attribute ever changes, so no escape sequence is emitted.
        assert!(!row.contains(&0x1b), "unexpected SGR in plain row");
    }

    #[test]
    fn losing_bold_keeps_dim_alive() {
        let pen = Pen { style: Flags::BOLD | Flags::DIM, ..Pen::default() };
        let mut params = Vec::new();
        pen.style_params(Flags::DIM, &mut params);
        // 22 clears both; dim must be re-asserted afterwards.
        assert_eq!(params, vec!["22".to_string(), "2".to_string()]);
    }

    #[test]
    fn color_params_cover_all_forms() {
        let mut params = Vec::new();
        color_params(Color::Named(NamedColor::BrightCyan), Layer::Fg, &mut params);
        assert_eq!(params, vec!["96".to_string()]);

        params.clear();
        color_params(Color::Named(NamedColor::Yellow), Layer::Bg, &mut params);
        assert_eq!(params, vec!["43".to_string()]);

        params.clear();
        color_params(Color::Indexed(208), Layer::Bg, &mut params);
        assert_eq!(params.join(";"), "48;5;208");

        params.clear();
        let rgb = alacritty_terminal::vte::ansi::Rgb { r: 1, g: 2, b: 3 };
        color_params(Color::Spec(rgb), Layer::Fg, &mut params);
        assert_eq!(params.join(";"), "38;2;1;2;3");
    }

    #[test]
    fn pty_write_event_for_da_request() {
        let mut emu = Emulator::new(80, 24, 100);
        // Device attributes request: the emulator must answer via the PTY.
        emu.feed(b"\x1b[c");
        let events = emu.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, TermEvent::PtyWrite(_))));
    }

    #[test]
    fn scrollback_accumulates_history() {
        let mut emu = Emulator::new(10, 4, 100);
        for i in 0..20 {
            emu.feed(format!("line{i}\r\n").as_bytes());
        }
        assert!(emu.history_size() > 0);
        emu.scroll_display(5);
        assert!(emu.display_offset() > 0);
        emu.scroll_display(-100);
        assert_eq!(emu.display_offset(), 0);
    }
}
