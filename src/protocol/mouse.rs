//! Browser mouse events → terminal mouse reports.
//!
//! The pane's VT state selects one of five encodings; the same logical
//! event produces different byte sequences in each:
//!
//! - **SGR** — `ESC [ < b ; x ; y M|m`, 1-indexed cells, `m` on release.
//! - **SGR-Pixels** — same shape, 0-indexed pixel coordinates.
//! - **X10** — `ESC [ M b' x' y'` single bytes with +32/+33 offsets,
//!   hard 222-cell limit.
//! - **URXVT** — `ESC [ b+32 ; x ; y M` decimal.
//! - **UTF-8** — X10 layout with multi-byte UTF-8 coordinate characters.
//!
//! Modifier bits: shift +4, alt +8, ctrl +16. Motion adds +32 to the
//! button. Release reports button 3 in the X10-family encodings and the
//! `m` terminator in the SGR family.

use crate::protocol::{MouseMods, MousePhase};
use crate::term::MouseEncoding;

/// Release pseudo-button in X10-family encodings.
const RELEASE_BUTTON: u8 = 3;

/// Highest 0-based cell coordinate X10 can carry (`x + 33 ≤ 255`).
const X10_MAX_CELL: u16 = 222;

/// Highest coordinate the UTF-8 encoding carries (two-byte UTF-8 range).
const UTF8_MAX_COORD: u32 = 2015;

/// A normalized mouse event ready for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    /// Button index (0 left, 1 middle, 2 right, 64/65 wheel).
    pub button: u8,
    /// Cell column, 0-based.
    pub x: u16,
    /// Cell row, 0-based.
    pub y: u16,
    /// Pixel column, if the client provided one.
    pub px: Option<u32>,
    /// Pixel row, if the client provided one.
    pub py: Option<u32>,
    /// Press / release / motion.
    pub phase: MousePhase,
    /// Modifier keys held.
    pub mods: MouseMods,
}

impl MouseEvent {
    /// Button value with modifier and motion bits folded in.
    fn report_button(&self, release_as_three: bool) -> u8 {
        let base = if release_as_three && self.phase == MousePhase::Up {
            RELEASE_BUTTON
        } else {
            self.button
        };
        let mut b = base;
        if self.mods.shift {
            b += 4;
        }
        if self.mods.alt {
            b += 8;
        }
        if self.mods.ctrl {
            b += 16;
        }
        if self.phase == MousePhase::Move {
            b += 32;
        }
        b
    }
}

/// Encode a mouse event in the pane's active format.
///
/// Returns `None` when the event cannot be represented (coordinates out
/// of range, missing pixel data for a pixel encoding).
pub fn encode_mouse(event: &MouseEvent, encoding: MouseEncoding) -> Option<Vec<u8>> {
    match encoding {
        MouseEncoding::Sgr => Some(encode_sgr(event, u32::from(event.x) + 1, u32::from(event.y) + 1)),
        MouseEncoding::SgrPixels => {
            // Pixel coordinates are 0-indexed and mandatory.
            let (px, py) = (event.px?, event.py?);
            Some(encode_sgr(event, px, py))
        }
        MouseEncoding::X10 => encode_x10(event),
        MouseEncoding::Urxvt => Some(encode_urxvt(event)),
        MouseEncoding::Utf8 => encode_utf8(event),
    }
}

fn encode_sgr(event: &MouseEvent, x: u32, y: u32) -> Vec<u8> {
    let terminator = if event.phase == MousePhase::Up { 'm' } else { 'M' };
    let button = event.report_button(false);
    format!("\x1b[<{button};{x};{y}{terminator}").into_bytes()
}

fn encode_x10(event: &MouseEvent) -> Option<Vec<u8>> {
    if event.x > X10_MAX_CELL || event.y > X10_MAX_CELL {
        return None;
    }
    let button = event.report_button(true);
    Some(vec![
        0x1b,
        b'[',
        b'M',
        32 + button,
        33 + event.x as u8,
        33 + event.y as u8,
    ])
}

fn encode_urxvt(event: &MouseEvent) -> Vec<u8> {
    let button = u16::from(event.report_button(true)) + 32;
    let x = event.x + 1;
    let y = event.y + 1;
    format!("\x1b[{button};{x};{y}M").into_bytes()
}

fn encode_utf8(event: &MouseEvent) -> Option<Vec<u8>> {
    let x = u32::from(event.x) + 1;
    let y = u32::from(event.y) + 1;
    if x > UTF8_MAX_COORD || y > UTF8_MAX_COORD {
        return None;
    }
    let button = u32::from(event.report_button(true)) + 32;

    let mut out = vec![0x1b, b'[', b'M'];
    for value in [button, x + 32, y + 32] {
        let ch = char::from_u32(value)?;
        let mut buf = [0u8; 4];
        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
    }
    Some(out)
}
