//! Client → server wire protocol.
//!
//! Messages arrive as JSON text frames or MessagePack binary maps; both
//! decode into the same [`ClientMessage`] tagged union. Unknown types and
//! malformed payloads are never fatal — the frame is dropped with a
//! warning and the connection stays up.
//!
//! Key translation ([`keys`]) and mouse encoding ([`mouse`]) turn
//! browser-side input events into the byte sequences a legacy VT
//! application expects.

pub mod keys;
pub mod mouse;

use serde::Deserialize;

use crate::pane::PaneId;
use crate::session::WindowId;

/// Key event phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyPhase {
    /// Key pressed.
    #[default]
    Down,
    /// Key released (never produces PTY bytes).
    Up,
}

/// Mouse event phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MousePhase {
    /// Button pressed.
    Down,
    /// Button released.
    Up,
    /// Pointer moved (with or without a held button).
    Move,
}

/// Modifier state attached to a mouse event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct MouseMods {
    /// Shift held.
    #[serde(default)]
    pub shift: bool,
    /// Alt held.
    #[serde(default)]
    pub alt: bool,
    /// Ctrl held.
    #[serde(default)]
    pub ctrl: bool,
}

/// One pane weight from a `resize_layout` request.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LayoutNodeMsg {
    /// Target pane.
    pub pane: PaneId,
    /// Relative share.
    pub weight: f32,
}

/// Every message a client can send, as one tagged union.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keyboard input.
    #[serde(rename_all = "camelCase")]
    Key {
        /// DOM-style key name (`"a"`, `"Enter"`, `"ArrowUp"`, …).
        key: String,
        /// Press or release.
        #[serde(default)]
        state: KeyPhase,
        /// Ctrl held.
        #[serde(default)]
        ctrl: bool,
        /// Alt held.
        #[serde(default)]
        alt: bool,
        /// Shift held.
        #[serde(default)]
        shift: bool,
        /// Meta held.
        #[serde(default)]
        meta: bool,
        /// Target pane; the active pane when absent.
        #[serde(default)]
        pane_id: Option<PaneId>,
    },

    /// Literal text (IME input, paste fallback).
    #[serde(rename_all = "camelCase")]
    Text {
        /// UTF-8 text to deliver.
        text: String,
        /// Target pane; the active pane when absent.
        #[serde(default)]
        pane_id: Option<PaneId>,
    },

    /// Resize a pane.
    #[serde(rename_all = "camelCase")]
    Resize {
        /// Target pane.
        pane_id: PaneId,
        /// New width.
        cols: u16,
        /// New height.
        rows: u16,
    },

    /// Pan the viewport over scrollback.
    #[serde(rename_all = "camelCase")]
    Scroll {
        /// Lines to scroll (positive = into history).
        delta: i32,
        /// Target pane; the active pane when absent.
        #[serde(default)]
        pane_id: Option<PaneId>,
    },

    /// Liveness probe; answered with a pong frame.
    Ping,

    /// Request resynchronization from an explicit generation.
    #[serde(rename_all = "camelCase")]
    Sync {
        /// Generation the client believes it has.
        gen: u64,
        /// Oldest row id the client retains.
        #[serde(default)]
        min_row_id: u64,
        /// Target pane; the active pane when absent.
        #[serde(default)]
        pane_id: Option<PaneId>,
    },

    /// Request a full snapshot (client-side state is unusable).
    #[serde(rename_all = "camelCase")]
    Resync {
        /// Target pane.
        pane_id: PaneId,
        /// Free-form diagnostic reason.
        #[serde(default)]
        reason: Option<String>,
    },

    /// Focus a pane.
    #[serde(rename_all = "camelCase")]
    Focus {
        /// Pane to focus.
        pane_id: PaneId,
    },

    /// Authentication / identity announcement. The only pre-auth message.
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Client UUID.
        client_id: String,
        /// Foreground theme color hint.
        #[serde(default)]
        theme_fg: Option<String>,
        /// Background theme color hint.
        #[serde(default)]
        theme_bg: Option<String>,
        /// Optional shared-secret token.
        #[serde(default)]
        token: Option<String>,
    },

    /// Ask to take over the master role.
    RequestMaster,

    /// Create a window, optionally from a layout template.
    #[serde(rename_all = "camelCase")]
    NewWindow {
        /// Template name from `layouts.json`.
        #[serde(default)]
        template: Option<String>,
    },

    /// Close a window and its panes.
    CloseWindow {
        /// Window to close.
        id: WindowId,
    },

    /// Close a single pane.
    ClosePane {
        /// Pane to close.
        id: PaneId,
    },

    /// Apply a layout template to a window.
    SetLayout {
        /// Target window.
        window: WindowId,
        /// Template name.
        template: String,
    },

    /// Swap two panes within a window.
    SwapPanes {
        /// Target window.
        window: WindowId,
        /// First pane.
        a: PaneId,
        /// Second pane.
        b: PaneId,
    },

    /// Adjust per-pane layout weights.
    ResizeLayout {
        /// Target window.
        window: WindowId,
        /// New weights.
        nodes: Vec<LayoutNodeMsg>,
    },

    /// Mouse input.
    #[serde(rename_all = "camelCase")]
    Mouse {
        /// Target pane.
        pane_id: PaneId,
        /// Button index (0 left, 1 middle, 2 right, 64/65 wheel).
        button: u8,
        /// Cell column, 0-based.
        x: u16,
        /// Cell row, 0-based.
        y: u16,
        /// Pixel column for SGR-Pixels encodings.
        #[serde(default)]
        px: Option<u32>,
        /// Pixel row for SGR-Pixels encodings.
        #[serde(default)]
        py: Option<u32>,
        /// Press / release / motion.
        state: MousePhase,
        /// Modifier keys held.
        #[serde(default)]
        mods: MouseMods,
        /// Client timestamp (ms), opaque to the server.
        #[serde(default)]
        ts: u64,
    },

    /// Select the entire pane contents.
    #[serde(rename_all = "camelCase")]
    SelectAll {
        /// Target pane.
        pane_id: PaneId,
    },

    /// Clear the active selection.
    #[serde(rename_all = "camelCase")]
    ClearSelection {
        /// Target pane.
        pane_id: PaneId,
    },

    /// Browser's answer to a server clipboard fetch.
    #[serde(rename_all = "camelCase")]
    ClipboardResponse {
        /// Clipboard payload (UTF-8).
        data: String,
        /// Payload kind.
        #[serde(default)]
        kind: Option<String>,
    },

    /// Set the server-side clipboard slot.
    ClipboardSet {
        /// Payload kind (`"text"`).
        kind: String,
        /// Clipboard payload.
        data: String,
    },

    /// Copy the pane selection into the server clipboard.
    #[serde(rename_all = "camelCase")]
    Copy {
        /// Target pane.
        pane_id: PaneId,
    },

    /// Paste the server clipboard into a pane's PTY.
    #[serde(rename_all = "camelCase")]
    ClipboardPaste {
        /// Target pane.
        pane_id: PaneId,
        /// Requested payload kind.
        #[serde(default)]
        kind: Option<String>,
    },

    /// Anything this build does not understand.
    #[serde(other)]
    Unknown,
}

/// Decode a JSON text frame.
pub fn decode_json(payload: &[u8]) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Decode a MessagePack binary map frame.
pub fn decode_binary(payload: &[u8]) -> Result<ClientMessage, rmp_serde::decode::Error> {
    rmp_serde::from_slice(payload)
}
