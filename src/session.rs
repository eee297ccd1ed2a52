//! Ownership tree: registry → panes, session → windows → pane ids.
//!
//! The [`PaneRegistry`] exclusively owns pane storage and issues fresh
//! 16-bit ids monotonically. [`Window`]s reference panes by id only, and
//! the [`Session`] owns the windows, the notify pipe, the default pane
//! dimensions, and the server-side clipboard slot. No cycles anywhere.
//!
//! Bootstrap shape: window 0 holds pane 0 (the debug pane, no PTY) plus
//! two shell panes, with the first shell pane active.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};

use crate::config::LayoutTemplate;
use crate::notify::NotifyPipe;
use crate::pane::{Pane, PaneId, PaneState};
use crate::pty::Pty;

/// Window identifier.
pub type WindowId = u16;

/// Pane storage plus monotonic id issuance.
#[derive(Debug)]
pub struct PaneRegistry {
    panes: BTreeMap<PaneId, Pane>,
    next_id: PaneId,
    default_dims: (u16, u16),
    shell: String,
}

impl PaneRegistry {
    /// Create an empty registry.
    pub fn new(default_dims: (u16, u16), shell: String) -> Self {
        Self {
            panes: BTreeMap::new(),
            next_id: 0,
            default_dims,
            shell,
        }
    }

    fn issue_id(&mut self) -> PaneId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Create a pane with no PTY; it receives formatted traffic logs.
    pub fn create_debug_pane(&mut self) -> PaneId {
        let id = self.issue_id();
        let (cols, rows) = self.default_dims;
        self.panes.insert(id, Pane::new(id, cols, rows, None));
        id
    }

    /// Create a pane and spawn a shell into it.
    pub fn create_shell_pane(&mut self, dims: Option<(u16, u16)>) -> Result<PaneId> {
        let (cols, rows) = dims.unwrap_or(self.default_dims);
        let pty = Pty::spawn(&self.shell, cols, rows)
            .with_context(|| format!("cannot spawn shell {}", self.shell))?;
        let id = self.issue_id();
        self.panes.insert(id, Pane::new(id, cols, rows, Some(pty)));
        Ok(id)
    }

    /// Borrow a pane.
    pub fn get(&self, id: PaneId) -> Option<&Pane> {
        self.panes.get(&id)
    }

    /// Mutably borrow a pane.
    pub fn get_mut(&mut self, id: PaneId) -> Option<&mut Pane> {
        self.panes.get_mut(&id)
    }

    /// Remove a pane from storage.
    pub fn remove(&mut self, id: PaneId) -> Option<Pane> {
        self.panes.remove(&id)
    }

    /// Iterate panes.
    pub fn iter(&self) -> impl Iterator<Item = &Pane> {
        self.panes.values()
    }

    /// Iterate panes mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pane> {
        self.panes.values_mut()
    }

    /// Resize every pane to shared dimensions.
    ///
    /// Panes already at the target size no-op, so repeated identical
    /// calls are free.
    pub fn resize_all(&mut self, cols: u16, rows: u16) {
        for pane in self.panes.values_mut() {
            pane.resize(cols, rows);
        }
    }

    /// Ids of panes that reached `Gone` this tick.
    pub fn gone_panes(&self) -> Vec<PaneId> {
        self.panes
            .values()
            .filter(|p| p.state() == PaneState::Gone)
            .map(Pane::id)
            .collect()
    }

    /// Number of live panes.
    pub fn len(&self) -> usize {
        self.panes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.panes.is_empty()
    }
}

/// Weight assigned to one pane by a `resize_layout` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutNode {
    /// Pane the weight applies to.
    pub pane: PaneId,
    /// Relative share of the window.
    pub weight: f32,
}

/// A window: ordered pane ids, an active pane, and a layout descriptor.
#[derive(Debug)]
pub struct Window {
    id: WindowId,
    pane_ids: Vec<PaneId>,
    active_pane_id: PaneId,
    layout: String,
    nodes: Vec<LayoutNode>,
}

impl Window {
    fn new(id: WindowId, pane_ids: Vec<PaneId>, active: PaneId) -> Self {
        Self {
            id,
            pane_ids,
            active_pane_id: active,
            layout: String::new(),
            nodes: Vec::new(),
        }
    }

    /// Window id.
    pub fn id(&self) -> WindowId {
        self.id
    }

    /// Pane ids in layout order.
    pub fn pane_ids(&self) -> &[PaneId] {
        &self.pane_ids
    }

    /// Currently focused pane.
    pub fn active_pane_id(&self) -> PaneId {
        self.active_pane_id
    }

    /// Whether the window contains a pane.
    pub fn contains(&self, pane: PaneId) -> bool {
        self.pane_ids.contains(&pane)
    }

    /// Current layout template name.
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Swap two panes' positions in the layout order.
    pub fn swap_panes(&mut self, a: PaneId, b: PaneId) -> bool {
        let (Some(ia), Some(ib)) = (
            self.pane_ids.iter().position(|&p| p == a),
            self.pane_ids.iter().position(|&p| p == b),
        ) else {
            return false;
        };
        self.pane_ids.swap(ia, ib);
        true
    }
}

/// The one process-wide session: all windows, the notify pipe, defaults.
#[derive(Debug)]
pub struct Session {
    registry: PaneRegistry,
    windows: BTreeMap<WindowId, Window>,
    next_window_id: WindowId,
    notify: NotifyPipe,
    layouts: HashMap<String, LayoutTemplate>,
    /// Server-side clipboard slot: (kind, data).
    clipboard: Option<(String, Vec<u8>)>,
}

impl Session {
    /// Bootstrap the session: window 0 with the debug pane and two shells.
    pub fn bootstrap(
        default_dims: (u16, u16),
        shell: String,
        layouts: HashMap<String, LayoutTemplate>,
    ) -> Result<Self> {
        let notify = NotifyPipe::new().context("cannot create notify pipe")?;
        let mut registry = PaneRegistry::new(default_dims, shell);

        let debug_id = registry.create_debug_pane();
        debug_assert_eq!(debug_id, 0, "debug pane must be pane 0");
        let shell_a = registry.create_shell_pane(None)?;
        let shell_b = registry.create_shell_pane(None)?;

        let window = Window::new(0, vec![debug_id, shell_a, shell_b], shell_a);
        let mut windows = BTreeMap::new();
        windows.insert(0, window);

        Ok(Self {
            registry,
            windows,
            next_window_id: 1,
            notify,
            layouts,
            clipboard: None,
        })
    }

    /// Registry access.
    pub fn registry(&self) -> &PaneRegistry {
        &self.registry
    }

    /// Mutable registry access.
    pub fn registry_mut(&mut self) -> &mut PaneRegistry {
        &mut self.registry
    }

    /// The notify pipe.
    pub fn notify(&self) -> &NotifyPipe {
        &self.notify
    }

    /// 2-D lookup: the pane must belong to the window.
    pub fn lookup(&self, window: WindowId, pane: PaneId) -> Option<&Pane> {
        let w = self.windows.get(&window)?;
        if !w.contains(pane) {
            return None;
        }
        self.registry.get(pane)
    }

    /// Borrow a window.
    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id)
    }

    /// Mutably borrow a window.
    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.get_mut(&id)
    }

    /// Iterate windows.
    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.values()
    }

    /// The pane a fresh client should see first.
    pub fn active_pane_id(&self) -> PaneId {
        self.windows
            .values()
            .next()
            .map_or(1, Window::active_pane_id)
    }

    /// Focus a pane within whatever window holds it.
    pub fn focus(&mut self, pane: PaneId) -> bool {
        for window in self.windows.values_mut() {
            if window.contains(pane) {
                window.active_pane_id = pane;
                return true;
            }
        }
        false
    }

    /// Create a window from a layout template name (or the default single
    /// shell when the template is unknown or unnamed).
    pub fn new_window(&mut self, template: Option<&str>) -> Result<WindowId> {
        let tpl = template
            .and_then(|name| self.layouts.get(name).cloned())
            .unwrap_or_default();

        let pane_count = tpl.panes.max(1);
        let mut pane_ids = Vec::with_capacity(pane_count as usize);
        for _ in 0..pane_count {
            pane_ids.push(self.registry.create_shell_pane(None)?);
        }

        let id = self.next_window_id;
        self.next_window_id = self.next_window_id.wrapping_add(1);
        let active = pane_ids[0];
        let mut window = Window::new(id, pane_ids, active);
        if let Some(name) = template {
            window.layout = name.to_string();
        }
        self.windows.insert(id, window);
        log::info!("created window {id} with {pane_count} pane(s)");
        Ok(id)
    }

    /// Tear down a window: terminate its panes and drop it.
    ///
    /// Window 0 cannot be closed; it anchors the debug pane.
    pub fn close_window(&mut self, id: WindowId) -> bool {
        if id == 0 {
            log::warn!("refusing to close window 0");
            return false;
        }
        let Some(window) = self.windows.remove(&id) else {
            return false;
        };
        for pane_id in window.pane_ids {
            if let Some(pane) = self.registry.get_mut(pane_id) {
                pane.begin_terminate();
            }
        }
        true
    }

    /// Close one pane: terminate its child and unlink it from its window.
    ///
    /// Pane 0 (the debug pane) is not closable.
    pub fn close_pane(&mut self, id: PaneId) -> bool {
        if id == 0 {
            log::warn!("refusing to close the debug pane");
            return false;
        }
        let Some(pane) = self.registry.get_mut(id) else {
            return false;
        };
        pane.begin_terminate();
        for window in self.windows.values_mut() {
            window.pane_ids.retain(|&p| p != id);
            if window.active_pane_id == id {
                window.active_pane_id = window.pane_ids.first().copied().unwrap_or(0);
            }
        }
        true
    }

    /// Drop panes that reached `Gone` and unlink them everywhere.
    pub fn sweep_gone_panes(&mut self) -> Vec<PaneId> {
        let gone = self.registry.gone_panes();
        for &id in &gone {
            self.registry.remove(id);
            for window in self.windows.values_mut() {
                window.pane_ids.retain(|&p| p != id);
                if window.active_pane_id == id {
                    window.active_pane_id = window.pane_ids.first().copied().unwrap_or(0);
                }
            }
        }
        gone
    }

    /// Apply a layout template name to a window.
    pub fn set_layout(&mut self, window: WindowId, template: &str) -> bool {
        let Some(w) = self.windows.get_mut(&window) else {
            return false;
        };
        w.layout = template.to_string();
        w.nodes.clear();
        true
    }

    /// Store per-pane layout weights for a window.
    pub fn resize_layout(&mut self, window: WindowId, nodes: Vec<LayoutNode>) -> bool {
        let Some(w) = self.windows.get_mut(&window) else {
            return false;
        };
        w.nodes = nodes;
        true
    }

    /// Resize every pane in a window to shared dimensions.
    ///
    /// Panes already at the target size no-op individually.
    pub fn resize_window(&mut self, window: WindowId, cols: u16, rows: u16) {
        let Some(w) = self.windows.get(&window) else { return };
        let ids: Vec<PaneId> = w.pane_ids.clone();
        for id in ids {
            if let Some(pane) = self.registry.get_mut(id) {
                pane.resize(cols, rows);
            }
        }
    }

    /// Set the server-side clipboard slot.
    pub fn set_clipboard(&mut self, kind: String, data: Vec<u8>) {
        self.clipboard = Some((kind, data));
    }

    /// Borrow the clipboard slot.
    pub fn clipboard(&self) -> Option<&(String, Vec<u8>)> {
        self.clipboard.as_ref()
    }

    /// Terminate every pane (shutdown path).
    pub fn terminate_all(&mut self) {
        for pane in self.registry.iter_mut() {
            pane.begin_terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A registry that never spawns real shells.
    fn debug_only_registry() -> PaneRegistry {
        PaneRegistry::new((80, 24), "/bin/sh".to_string())
    }

    #[test]
    fn ids_are_issued_monotonically() {
        let mut reg = debug_only_registry();
        let a = reg.create_debug_pane();
        let b = reg.create_debug_pane();
        let c = reg.create_debug_pane();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn resize_all_skips_unchanged_dims() {
        let mut reg = debug_only_registry();
        let id = reg.create_debug_pane();
        reg.resize_all(100, 30);
        let gen_after_first = reg.get(id).expect("pane").generation();
        // Same dimensions again: per-pane no-op, generation untouched.
        reg.resize_all(100, 30);
        assert_eq!(reg.get(id).expect("pane").generation(), gen_after_first);
    }

    #[test]
    fn removed_pane_ids_are_not_reissued() {
        let mut reg = debug_only_registry();
        let a = reg.create_debug_pane();
        reg.remove(a);
        let b = reg.create_debug_pane();
        assert_ne!(a, b);
    }

    fn session_without_shells() -> Session {
        // Hand-built session mirroring bootstrap but with PTY-less panes,
        // so tests stay hermetic.
        let notify = NotifyPipe::new().expect("pipe");
        let mut registry = debug_only_registry();
        let debug_id = registry.create_debug_pane();
        let a = registry.create_debug_pane();
        let b = registry.create_debug_pane();
        let window = Window::new(0, vec![debug_id, a, b], a);
        let mut windows = BTreeMap::new();
        windows.insert(0, window);
        Session {
            registry,
            windows,
            next_window_id: 1,
            notify,
            layouts: HashMap::new(),
            clipboard: None,
        }
    }

    #[test]
    fn bootstrap_shape() {
        let s = session_without_shells();
        let w = s.window(0).expect("window 0");
        assert_eq!(w.pane_ids(), &[0, 1, 2]);
        assert_eq!(w.active_pane_id(), 1);
        assert!(!s.registry().get(0).expect("debug pane").has_pty());
    }

    #[test]
    fn two_d_lookup_requires_membership() {
        let s = session_without_shells();
        assert!(s.lookup(0, 1).is_some());
        assert!(s.lookup(0, 99).is_none());
        assert!(s.lookup(5, 1).is_none());
    }

    #[test]
    fn focus_moves_active_pane() {
        let mut s = session_without_shells();
        assert!(s.focus(2));
        assert_eq!(s.window(0).expect("w").active_pane_id(), 2);
        assert!(!s.focus(42));
    }

    #[test]
    fn close_pane_unlinks_and_refocuses() {
        let mut s = session_without_shells();
        s.focus(1);
        assert!(s.close_pane(1));
        let gone = s.sweep_gone_panes();
        assert_eq!(gone, vec![1]);
        let w = s.window(0).expect("w");
        assert!(!w.contains(1));
        assert_ne!(w.active_pane_id(), 1);
    }

    #[test]
    fn debug_pane_is_not_closable() {
        let mut s = session_without_shells();
        assert!(!s.close_pane(0));
        assert!(s.registry().get(0).is_some());
    }

    #[test]
    fn window_zero_is_not_closable() {
        let mut s = session_without_shells();
        assert!(!s.close_window(0));
    }

    #[test]
    fn swap_panes_within_window() {
        let mut s = session_without_shells();
        let w = s.window_mut(0).expect("w");
        assert!(w.swap_panes(1, 2));
        assert_eq!(w.pane_ids(), &[0, 2, 1]);
        assert!(!w.swap_panes(1, 99));
    }

    #[test]
    fn layout_and_nodes() {
        let mut s = session_without_shells();
        assert!(s.set_layout(0, "main-vertical"));
        assert_eq!(s.window(0).expect("w").layout(), "main-vertical");
        assert!(s.resize_layout(
            0,
            vec![LayoutNode { pane: 1, weight: 0.7 }, LayoutNode { pane: 2, weight: 0.3 }]
        ));
        assert!(!s.set_layout(9, "x"));
    }

    #[test]
    fn clipboard_slot() {
        let mut s = session_without_shells();
        assert!(s.clipboard().is_none());
        s.set_clipboard("text".into(), b"copied".to_vec());
        let (kind, data) = s.clipboard().expect("slot");
        assert_eq!(kind, "text");
        assert_eq!(data, b"copied");
    }
}
