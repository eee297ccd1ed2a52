//! Browser key events → legacy VT byte sequences.
//!
//! The browser sends DOM `KeyboardEvent`-style names; the PTY wants the
//! bytes a physical terminal would produce. Arrow encoding depends on the
//! pane's DECCKM state: application mode emits SS3 (`ESC O A`), normal
//! mode CSI (`ESC [ A`), and any modifier forces the CSI-with-modifier
//! form regardless of DECCKM.

const ESC: u8 = 0x1b;

/// Modifier state for a key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyMods {
    /// Ctrl held.
    pub ctrl: bool,
    /// Alt held.
    pub alt: bool,
    /// Shift held.
    pub shift: bool,
    /// Meta held (ignored for VT encoding).
    pub meta: bool,
}

impl KeyMods {
    /// xterm modifier parameter: `1 + shift + 2·alt + 4·ctrl`.
    fn xterm_code(self) -> u8 {
        1 + u8::from(self.shift) + 2 * u8::from(self.alt) + 4 * u8::from(self.ctrl)
    }

    fn any_for_arrows(self) -> bool {
        self.shift || self.alt || self.ctrl
    }
}

/// Translate a key-down event into PTY bytes.
///
/// Returns `None` for events that produce nothing: key releases are
/// filtered by the caller, pure modifier keys are filtered here.
pub fn translate_key(key: &str, mods: KeyMods, cursor_key_application: bool) -> Option<Vec<u8>> {
    // Pure modifier key events carry no payload.
    if matches!(
        key,
        "Shift" | "Control" | "Alt" | "Meta" | "CapsLock" | "NumLock" | "ScrollLock"
    ) {
        return None;
    }

    // Named keys first; anything left over is literal text.
    match key {
        "Enter" => return Some(b"\r".to_vec()),
        "Backspace" => return Some(vec![0x7f]),
        "Tab" => {
            return Some(if mods.shift {
                vec![ESC, b'[', b'Z']
            } else {
                b"\t".to_vec()
            });
        }
        "Escape" => return Some(vec![ESC]),
        "Delete" => return Some(vec![ESC, b'[', b'3', b'~']),
        "Insert" => return Some(vec![ESC, b'[', b'2', b'~']),
        "Home" => return Some(vec![ESC, b'[', b'H']),
        "End" => return Some(vec![ESC, b'[', b'F']),
        "PageUp" => return Some(vec![ESC, b'[', b'5', b'~']),
        "PageDown" => return Some(vec![ESC, b'[', b'6', b'~']),
        "ArrowUp" => return Some(arrow(b'A', mods, cursor_key_application)),
        "ArrowDown" => return Some(arrow(b'B', mods, cursor_key_application)),
        "ArrowRight" => return Some(arrow(b'C', mods, cursor_key_application)),
        "ArrowLeft" => return Some(arrow(b'D', mods, cursor_key_application)),
        "F1" => return Some(vec![ESC, b'O', b'P']),
        "F2" => return Some(vec![ESC, b'O', b'Q']),
        "F3" => return Some(vec![ESC, b'O', b'R']),
        "F4" => return Some(vec![ESC, b'O', b'S']),
        "F5" => return Some(fkey_tilde(15)),
        "F6" => return Some(fkey_tilde(17)),
        "F7" => return Some(fkey_tilde(18)),
        "F8" => return Some(fkey_tilde(19)),
        "F9" => return Some(fkey_tilde(20)),
        "F10" => return Some(fkey_tilde(21)),
        "F11" => return Some(fkey_tilde(23)),
        "F12" => return Some(fkey_tilde(24)),
        _ => {}
    }

    // Single characters: control and alt transforms, else literal UTF-8.
    let mut chars = key.chars();
    let (Some(ch), None) = (chars.next(), chars.next()) else {
        // Multi-char name we do not recognize.
        log::debug!("unhandled key name {key:?}");
        return None;
    };

    let base: Vec<u8> = if mods.ctrl {
        match ctrl_byte(ch) {
            Some(b) => vec![b],
            None => ch.to_string().into_bytes(),
        }
    } else {
        ch.to_string().into_bytes()
    };

    if mods.alt {
        let mut out = Vec::with_capacity(base.len() + 1);
        out.push(ESC);
        out.extend_from_slice(&base);
        Some(out)
    } else {
        Some(base)
    }
}

/// Arrow encoding: SS3 in application mode, CSI otherwise; any modifier
/// forces `ESC [ 1 ; <mod> <dir>`.
fn arrow(dir: u8, mods: KeyMods, cursor_key_application: bool) -> Vec<u8> {
    if mods.any_for_arrows() {
        return vec![ESC, b'[', b'1', b';', b'0' + mods.xterm_code(), dir];
    }
    if cursor_key_application {
        vec![ESC, b'O', dir]
    } else {
        vec![ESC, b'[', dir]
    }
}

fn fkey_tilde(code: u8) -> Vec<u8> {
    format!("\x1b[{code}~").into_bytes()
}

/// Control-key transform for a single character.
fn ctrl_byte(ch: char) -> Option<u8> {
    match ch {
        'a'..='z' => Some(ch as u8 & 0x1f),
        'A'..='Z' => Some(ch.to_ascii_lowercase() as u8 & 0x1f),
        '@' => Some(0x00),
        '[' => Some(0x1b),
        '\\' => Some(0x1c),
        ']' => Some(0x1d),
        '^' => Some(0x1e),
        '_' => Some(0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none() -> KeyMods {
        KeyMods::default()
    }

    fn ctrl() -> KeyMods {
        KeyMods { ctrl: true, ..KeyMods::default() }
    }

    #[test]
    fn plain_character() {
        assert_eq!(translate_key("a", none(), false), Some(b"a".to_vec()));
        assert_eq!(translate_key("Z", none(), false), Some(b"Z".to_vec()));
    }

    #[test]
    fn ctrl_c_is_etx() {
        assert_eq!(translate_key("c", ctrl(), false), Some(vec![0x03]));
        assert_eq!(translate_key("C", ctrl(), false), Some(vec![0x03]));
    }

    #[test]
    fn ctrl_named_forms() {
        assert_eq!(translate_key("@", ctrl(), false), Some(vec![0x00]));
        assert_eq!(translate_key("[", ctrl(), false), Some(vec![0x1b]));
        assert_eq!(translate_key("\\", ctrl(), false), Some(vec![0x1c]));
        assert_eq!(translate_key("]", ctrl(), false), Some(vec![0x1d]));
        assert_eq!(translate_key("^", ctrl(), false), Some(vec![0x1e]));
        assert_eq!(translate_key("_", ctrl(), false), Some(vec![0x1f]));
        assert_eq!(translate_key("?", ctrl(), false), Some(vec![0x7f]));
    }

    #[test]
    fn alt_prefixes_escape() {
        assert_eq!(translate_key("x", KeyMods { alt: true, ..none() }, false),
            Some(vec![0x1b, b'x']));
    }

    #[test]
    fn ctrl_alt_compose() {
        // Ctrl+Alt+a = ESC then 0x01.
        assert_eq!(
            translate_key("a", KeyMods { ctrl: true, alt: true, ..none() }, false),
            Some(vec![0x1b, 0x01])
        );
    }

    #[test]
    fn named_keys() {
        assert_eq!(translate_key("Enter", none(), false), Some(b"\r".to_vec()));
        assert_eq!(translate_key("Backspace", none(), false), Some(vec![0x7f]));
        assert_eq!(translate_key("Tab", none(), false), Some(b"\t".to_vec()));
        assert_eq!(
            translate_key("Tab", KeyMods { shift: true, ..none() }, false),
            Some(b"\x1b[Z".to_vec())
        );
        assert_eq!(translate_key("Escape", none(), false), Some(vec![0x1b]));
        assert_eq!(translate_key("Delete", none(), false), Some(b"\x1b[3~".to_vec()));
        assert_eq!(translate_key("Home", none(), false), Some(b"\x1b[H".to_vec()));
        assert_eq!(translate_key("End", none(), false), Some(b"\x1b[F".to_vec()));
        assert_eq!(translate_key("PageUp", none(), false), Some(b"\x1b[5~".to_vec()));
        assert_eq!(translate_key("PageDown", none(), false), Some(b"\x1b[6~".to_vec()));
        assert_eq!(translate_key("Insert", none(), false), Some(b"\x1b[2~".to_vec()));
    }

    #[test]
    fn arrows_respect_decckm() {
        // Application mode: SS3.
        assert_eq!(translate_key("ArrowUp", none(), true), Some(b"\x1bOA".to_vec()));
        // Normal mode: CSI.
        assert_eq!(translate_key("ArrowUp", none(), false), Some(b"\x1b[A".to_vec()));
        assert_eq!(translate_key("ArrowDown", none(), false), Some(b"\x1b[B".to_vec()));
        assert_eq!(translate_key("ArrowRight", none(), false), Some(b"\x1b[C".to_vec()));
        assert_eq!(translate_key("ArrowLeft", none(), false), Some(b"\x1b[D".to_vec()));
    }

    #[test]
    fn modified_arrow_ignores_decckm() {
        // Ctrl+Shift = 1 + 1 + 4 = 6, CSI form even in application mode.
        let mods = KeyMods { ctrl: true, shift: true, ..none() };
        assert_eq!(translate_key("ArrowUp", mods, true), Some(b"\x1b[1;6A".to_vec()));
        // Alt alone = 3.
        let mods = KeyMods { alt: true, ..none() };
        assert_eq!(translate_key("ArrowLeft", mods, false), Some(b"\x1b[1;3D".to_vec()));
    }

    #[test]
    fn function_keys() {
        assert_eq!(translate_key("F1", none(), false), Some(b"\x1bOP".to_vec()));
        assert_eq!(translate_key("F4", none(), false), Some(b"\x1bOS".to_vec()));
        assert_eq!(translate_key("F5", none(), false), Some(b"\x1b[15~".to_vec()));
        assert_eq!(translate_key("F6", none(), false), Some(b"\x1b[17~".to_vec()));
        assert_eq!(translate_key("F10", none(), false), Some(b"\x1b[21~".to_vec()));
        assert_eq!(translate_key("F11", none(), false), Some(b"\x1b[23~".to_vec()));
        assert_eq!(translate_key("F12", none(), false), Some(b"\x1b[24~".to_vec()));
    }

    #[test]
    fn pure_modifiers_produce_nothing() {
        for key in ["Shift", "Control", "Alt", "Meta", "CapsLock"] {
            assert_eq!(translate_key(key, none(), false), None);
        }
    }

    #[test]
    fn unicode_character_passes_through() {
        assert_eq!(translate_key("é", none(), false), Some("é".as_bytes().to_vec()));
    }
}
