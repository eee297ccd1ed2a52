//! Per-connection client state.
//!
//! Each accepted WebSocket is owned by exactly one [`ClientState`]: the
//! transport, the per-pane generation map used for delta applicability,
//! identity and role from the `hello` message, and liveness/backpressure
//! bookkeeping.

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use crate::pane::PaneId;
use crate::ws::WsConnection;

/// Authorization role. At most one `Master` exists per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Not yet authenticated (pre-`hello`).
    #[default]
    None,
    /// Read-only observer.
    View,
    /// The unique client whose input reaches PTYs.
    Master,
}

impl Role {
    /// Wire encoding for role frames.
    pub fn wire_code(self) -> u8 {
        match self {
            Role::None => 0,
            Role::View => 1,
            Role::Master => 2,
        }
    }
}

/// One accepted WebSocket client.
#[derive(Debug)]
pub struct ClientState {
    /// Loop-local handle, stable for the connection's lifetime.
    token: u64,
    /// The transport with its buffers.
    pub conn: WsConnection,
    /// Identity from `hello`.
    identity: Option<Uuid>,
    /// Current role.
    role: Role,
    /// Set once a `hello` was accepted.
    authenticated: bool,
    /// The poll layer reported the socket unwritable; skip broadcasts
    /// until it drains.
    write_congested: bool,
    /// Last acknowledged generation per pane (absent = 0).
    pane_gens: HashMap<PaneId, u64>,
    /// Last frame received, for idle detection.
    last_received: Instant,
    /// When the last idle ping went out.
    last_ping_sent: Option<Instant>,
    /// An idle ping is outstanding.
    awaiting_pong: bool,
    /// Theme hints from `hello`, relayed to late-joining tooling.
    theme: Option<(String, String)>,
}

impl ClientState {
    /// Wrap an upgraded connection.
    pub fn new(token: u64, conn: WsConnection) -> Self {
        Self {
            token,
            conn,
            identity: None,
            role: Role::None,
            authenticated: false,
            write_congested: false,
            pane_gens: HashMap::new(),
            last_received: Instant::now(),
            last_ping_sent: None,
            awaiting_pong: false,
            theme: None,
        }
    }

    /// Loop-local handle.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Identity claimed in `hello`, if authenticated.
    pub fn identity(&self) -> Option<Uuid> {
        self.identity
    }

    /// Current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this client passed the `hello` gate.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether this client holds input authority.
    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Mark authenticated with an identity and role.
    pub fn authenticate(&mut self, identity: Uuid, role: Role, theme: Option<(String, String)>) {
        self.identity = Some(identity);
        self.role = role;
        self.authenticated = true;
        self.theme = theme;
    }

    /// Change role (master promotion/demotion).
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Theme hints from `hello`.
    pub fn theme(&self) -> Option<&(String, String)> {
        self.theme.as_ref()
    }

    // ── Generation map ────────────────────────────────────────────────────

    /// Last generation this client acknowledged for a pane (0 if never).
    pub fn pane_gen(&self, pane: PaneId) -> u64 {
        self.pane_gens.get(&pane).copied().unwrap_or(0)
    }

    /// Record the generation just shipped to this client.
    pub fn set_pane_gen(&mut self, pane: PaneId, generation: u64) {
        self.pane_gens.insert(pane, generation);
    }

    /// Forget a pane (it was destroyed).
    pub fn forget_pane(&mut self, pane: PaneId) {
        self.pane_gens.remove(&pane);
    }

    // ── Backpressure ──────────────────────────────────────────────────────

    /// Whether broadcasts should skip this client right now.
    pub fn is_congested(&self) -> bool {
        self.write_congested
    }

    /// Set or clear the congestion flag.
    pub fn set_congested(&mut self, congested: bool) {
        self.write_congested = congested;
    }

    // ── Liveness ──────────────────────────────────────────────────────────

    /// Note that a frame arrived.
    pub fn mark_received(&mut self) {
        self.last_received = Instant::now();
        self.awaiting_pong = false;
    }

    /// Instant of the last received frame.
    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Record that an idle ping was sent.
    pub fn mark_ping_sent(&mut self, at: Instant) {
        self.last_ping_sent = Some(at);
        self.awaiting_pong = true;
    }

    /// Whether a ping is outstanding, and since when.
    pub fn awaiting_pong_since(&self) -> Option<Instant> {
        if self.awaiting_pong {
            self.last_ping_sent
        } else {
            None
        }
    }
}
