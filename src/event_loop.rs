//! The poll-driven multiplexer wiring everything together.
//!
//! One thread. Each tick:
//!
//! 1. Collect poll fds: listener, control socket, pending connections
//!    (OUT during TLS handshake), clients (OUT when congested), PTY
//!    masters, the notify pipe.
//! 2. `poll(2)` with a 1 s ceiling (bounds shutdown latency).
//! 3. Accept until `WouldBlock`.
//! 4. Advance pending connections; re-step any whose TLS layer holds
//!    buffered plaintext poll cannot see; expire stage deadlines.
//! 5. Drain readable PTY masters into their panes; mirror traffic into
//!    the debug pane.
//! 6. Decode and dispatch client frames through the auth gate.
//! 7. Flush congested clients that became writable.
//! 8. For each pane that advanced: compute the broadcast delta once,
//!    dispatch it to matching clients, snapshot the rest; emit title and
//!    bell frames.
//! 9. Idle-ping silent clients; close the ones that never pong.
//!
//! The only blocking call anywhere is `poll` itself. The only other
//! thread in the process is the signal handler, which writes one byte to
//! the notify pipe and flips an atomic.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::client::ClientState;
use crate::config::{RuntimeDir, ServerConfig};
use crate::constants::{POLL_TIMEOUT, PTY_READ_CHUNK};
use crate::http::{PendingConn, PendingOutcome};
use crate::ipc::{IpcCommand, IpcServer};
use crate::pane::PaneId;
use crate::protocol::{self, keys, mouse, ClientMessage, KeyPhase};
use crate::proxy::{SendResult, WsProxy};
use crate::session::Session;
use crate::wire;
use crate::ws::{WsError, WsMessage};

/// What each poll slot maps back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdKind {
    Listener,
    IpcListener,
    IpcConn,
    Notify,
    Pending(usize),
    Client(usize),
    Pty(PaneId),
}

/// The server: listener, session, clients, and the loop state.
pub struct EventLoop {
    config: ServerConfig,
    runtime: RuntimeDir,
    listener: TcpListener,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    static_root: Option<PathBuf>,
    session: Session,
    pending: Vec<PendingConn>,
    clients: Vec<ClientState>,
    next_client_token: u64,
    ipc: IpcServer,
    shutdown: Arc<AtomicBool>,
    started_at: Instant,
    /// PTY traffic log (`dullahan-dlog.log`); mirrors the debug pane.
    dlog: Option<std::fs::File>,
    /// Clients condemned mid-dispatch; reaped at the end of the tick so
    /// client-list indices stay stable while handlers run.
    doomed: Vec<u64>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("clients", &self.clients.len())
            .field("pending", &self.pending.len())
            .field("panes", &self.session.registry().len())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Bind sockets, load TLS material, and wire up signal handling.
    ///
    /// Failures here are process-fatal by design: a port or control
    /// socket in use means another instance owns this uid.
    pub fn new(
        config: ServerConfig,
        runtime: RuntimeDir,
        session: Session,
        static_root: Option<PathBuf>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.port);
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("cannot bind {addr} (port already in use?)"))?;
        listener
            .set_nonblocking(true)
            .context("cannot set listener non-blocking")?;
        log::info!("listening on {addr}");

        let tls_config = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => {
                let loaded = crate::tls::load_server_config(
                    cert.to_str().context("non-utf8 cert path")?,
                    key.to_str().context("non-utf8 key path")?,
                )?;
                log::info!("TLS enabled");
                Some(loaded)
            }
            _ => None,
        };

        let ipc = IpcServer::bind(&runtime.socket_path())?;

        // Signal handlers: flip the atomic and poke the notify pipe. All
        // real work happens on the loop thread afterwards.
        let wake_fd = session.notify().write_fd();
        for sig in [libc::SIGINT, libc::SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&shutdown))
                .context("cannot register shutdown signal")?;
            signal_hook::low_level::pipe::register_raw(sig, wake_fd)
                .context("cannot register signal wakeup")?;
        }
        signal_hook::low_level::pipe::register_raw(libc::SIGCHLD, wake_fd)
            .context("cannot register SIGCHLD wakeup")?;
        // SAFETY: ignoring SIGPIPE process-wide; writes report EPIPE
        // instead of killing the process.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let dlog = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(runtime.dlog_path())
            .map_err(|e| log::warn!("cannot open dlog: {e}"))
            .ok();

        Ok(Self {
            config,
            runtime,
            listener,
            tls_config,
            static_root,
            session,
            pending: Vec::new(),
            clients: Vec::new(),
            next_client_token: 1,
            ipc,
            shutdown,
            started_at: Instant::now(),
            dlog,
            doomed: Vec::new(),
        })
    }

    /// Run until shutdown is requested, then tear everything down.
    pub fn run(&mut self) -> Result<()> {
        log::info!("event loop running");
        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick()?;
        }
        log::info!("shutdown requested");
        self.teardown();
        Ok(())
    }

    /// Force-exit flag, shared with signal handlers and IPC `quit`.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.session.notify().signal();
    }

    // ── One tick ──────────────────────────────────────────────────────────

    fn tick(&mut self) -> Result<()> {
        let (kinds, revents) = self.poll_once()?;

        let mut listener_ready = false;
        let mut ipc_ready = false;
        let mut ready_pending = Vec::new();
        let mut readable_clients = Vec::new();
        let mut writable_clients = Vec::new();
        let mut readable_ptys = Vec::new();

        for (kind, events) in kinds.iter().zip(revents.iter()) {
            if events.is_empty() {
                continue;
            }
            match kind {
                FdKind::Listener => listener_ready = true,
                FdKind::IpcListener | FdKind::IpcConn => ipc_ready = true,
                FdKind::Notify => self.session.notify().drain(),
                FdKind::Pending(idx) => ready_pending.push(*idx),
                FdKind::Client(idx) => {
                    if events.intersects(
                        PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                    ) {
                        readable_clients.push(*idx);
                    }
                    if events.contains(PollFlags::POLLOUT) {
                        writable_clients.push(*idx);
                    }
                }
                FdKind::Pty(pane_id) => readable_ptys.push(*pane_id),
            }
        }

        if listener_ready {
            self.accept_connections();
        }
        if ipc_ready {
            self.service_ipc();
        }

        self.advance_pending(&ready_pending);
        self.expire_pending();

        self.drain_ptys(&readable_ptys);

        let mut dead = Vec::new();
        for idx in readable_clients {
            if let Err(reason) = self.service_client_reads(idx) {
                log::info!(
                    "client {}: closing ({reason})",
                    self.clients[idx].token()
                );
                dead.push(self.clients[idx].token());
            }
        }
        // Clients whose transport holds buffered plaintext (TLS records
        // decrypted but unread, or bytes over-read during the upgrade)
        // must be serviced even though their socket polled quiet.
        for idx in 0..self.clients.len() {
            if dead.contains(&self.clients[idx].token()) {
                continue;
            }
            if self.clients[idx].conn.has_pending_data() {
                if let Err(reason) = self.service_client_reads(idx) {
                    log::info!(
                        "client {}: closing ({reason})",
                        self.clients[idx].token()
                    );
                    dead.push(self.clients[idx].token());
                }
            }
        }
        for idx in writable_clients {
            if dead.contains(&self.clients[idx].token()) {
                continue;
            }
            match self.clients[idx].conn.flush_write_buffer() {
                Ok(true) => self.clients[idx].set_congested(false),
                Ok(false) => {}
                Err(e) => {
                    log::info!("client {}: flush failed: {e}", self.clients[idx].token());
                    dead.push(self.clients[idx].token());
                }
            }
        }
        self.remove_clients(&dead);

        self.flush_pane_inputs();
        self.broadcast_pane_updates();
        self.ping_idle_clients();
        self.advance_pane_lifecycles();

        let doomed = std::mem::take(&mut self.doomed);
        self.remove_clients(&doomed);

        Ok(())
    }

    /// Build the poll set, poll once, and return slot kinds + revents.
    fn poll_once(&mut self) -> Result<(Vec<FdKind>, Vec<PollFlags>)> {
        let mut slots: Vec<(RawFd, FdKind, PollFlags)> = Vec::with_capacity(
            4 + self.pending.len() + self.clients.len() + self.session.registry().len(),
        );

        slots.push((self.listener.as_raw_fd(), FdKind::Listener, PollFlags::POLLIN));
        slots.push((self.ipc.listener_fd(), FdKind::IpcListener, PollFlags::POLLIN));
        for fd in self.ipc.conn_fds() {
            slots.push((fd, FdKind::IpcConn, PollFlags::POLLIN));
        }
        slots.push((self.session.notify().fd(), FdKind::Notify, PollFlags::POLLIN));

        for (idx, pending) in self.pending.iter().enumerate() {
            let (fd, want_out) = pending.poll_interest();
            if fd < 0 {
                continue;
            }
            let mut flags = PollFlags::POLLIN;
            if want_out {
                flags |= PollFlags::POLLOUT;
            }
            slots.push((fd, FdKind::Pending(idx), flags));
        }

        for (idx, client) in self.clients.iter().enumerate() {
            let mut flags = PollFlags::POLLIN;
            if client.is_congested() || client.conn.has_queued_writes() {
                flags |= PollFlags::POLLOUT;
            }
            slots.push((client.conn.as_raw_fd(), FdKind::Client(idx), flags));
        }

        for pane in self.session.registry().iter() {
            if let Some(fd) = pane.master_fd() {
                if pane.state() == crate::pane::PaneState::Running {
                    slots.push((fd, FdKind::Pty(pane.id()), PollFlags::POLLIN));
                }
            }
        }

        let mut pollfds: Vec<PollFd> = slots
            .iter()
            .map(|(fd, _, flags)| {
                // SAFETY: every fd in the slot list is owned by a field of
                // self and outlives this call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *flags)
            })
            .collect();

        let timeout = PollTimeout::from(POLL_TIMEOUT.as_millis() as u16);
        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {
                // Signal delivery; the flag/notify pipe carry the intent.
            }
            Err(e) => return Err(e).context("poll failed"),
        }

        let revents: Vec<PollFlags> = pollfds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        let kinds: Vec<FdKind> = slots.iter().map(|(_, kind, _)| *kind).collect();
        Ok((kinds, revents))
    }

    // ── Accept / pending ──────────────────────────────────────────────────

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((sock, peer)) => {
                    if sock.set_nonblocking(true).is_err() {
                        continue;
                    }
                    log::debug!("accepted {peer}");
                    match &self.tls_config {
                        Some(tls) => match PendingConn::new_tls(sock, peer, Arc::clone(tls)) {
                            Ok(pending) => self.pending.push(pending),
                            Err(e) => log::warn!("TLS setup for {peer} failed: {e}"),
                        },
                        None => self.pending.push(PendingConn::new_plain(sock, peer)),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient_accept_error(&e) => {
                    log::warn!("transient accept failure: {e}");
                    break;
                }
                Err(e) => {
                    // Process-fatal per the error model; surface through
                    // shutdown so teardown still runs.
                    log::error!("listener accept failed: {e}");
                    self.request_shutdown();
                    break;
                }
            }
        }
    }

    fn advance_pending(&mut self, ready: &[usize]) {
        let mut finished: Vec<usize> = Vec::new();
        let mut upgraded = Vec::new();

        for &idx in ready {
            let Some(pending) = self.pending.get_mut(idx) else { continue };
            match pending.advance(self.static_root.as_deref()) {
                PendingOutcome::Pending => {}
                PendingOutcome::Closed => finished.push(idx),
                PendingOutcome::Upgraded(conn) => {
                    upgraded.push(*conn);
                    finished.push(idx);
                }
            }
        }

        // TLS may hold decrypted request bytes poll cannot see; re-step
        // those connections until they genuinely stall.
        for _ in 0..8 {
            let mut progressed = false;
            for idx in 0..self.pending.len() {
                if finished.contains(&idx) {
                    continue;
                }
                if self.pending[idx].has_buffered_plaintext() {
                    progressed = true;
                    match self.pending[idx].advance(self.static_root.as_deref()) {
                        PendingOutcome::Pending => {}
                        PendingOutcome::Closed => finished.push(idx),
                        PendingOutcome::Upgraded(conn) => {
                            upgraded.push(*conn);
                            finished.push(idx);
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        finished.sort_unstable();
        finished.dedup();
        for idx in finished.into_iter().rev() {
            self.pending.remove(idx);
        }

        for conn in upgraded {
            let token = self.next_client_token;
            self.next_client_token += 1;
            log::info!("client {token}: websocket established");
            self.clients.push(ClientState::new(token, conn));
        }
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        self.pending.retain(|pending| {
            let expired = pending.expired(now);
            if expired {
                log::info!("pending connection from {} timed out", pending.peer());
            }
            !expired
        });
    }

    fn service_ipc(&mut self) {
        let status = format!(
            "panes={} clients={} uptime={}s",
            self.session.registry().len(),
            self.clients.len(),
            self.started_at.elapsed().as_secs()
        );
        for command in self.ipc.service(&status) {
            match command {
                IpcCommand::Quit => {
                    log::info!("quit via control socket");
                    self.request_shutdown();
                }
            }
        }
    }

    // ── PTY side ──────────────────────────────────────────────────────────

    fn drain_ptys(&mut self, pane_ids: &[PaneId]) {
        let mut debug_lines: Vec<String> = Vec::new();
        let mut buf = vec![0u8; PTY_READ_CHUNK];

        for &pane_id in pane_ids {
            let Some(pane) = self.session.registry_mut().get_mut(pane_id) else { continue };
            loop {
                match pane.read_pty(&mut buf) {
                    Ok(0) => {
                        pane.on_pty_eof();
                        break;
                    }
                    Ok(n) => {
                        pane.feed(&buf[..n]);
                        if pane_id != 0 {
                            debug_lines.push(format!(
                                "{} pane {pane_id}: {n} bytes\r\n",
                                chrono::Local::now().format("%H:%M:%S%.3f")
                            ));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("pane {pane_id}: PTY read failed: {e}");
                        pane.on_pty_eof();
                        break;
                    }
                }
            }
        }

        if !debug_lines.is_empty() {
            if let Some(dlog) = self.dlog.as_mut() {
                use std::io::Write;
                for line in &debug_lines {
                    let _ = dlog.write_all(line.as_bytes());
                }
            }
            if let Some(debug_pane) = self.session.registry_mut().get_mut(0) {
                for line in debug_lines {
                    debug_pane.feed(line.as_bytes());
                }
            }
        }
    }

    fn flush_pane_inputs(&mut self) {
        for pane in self.session.registry_mut().iter_mut() {
            pane.flush_input();
        }
    }

    fn advance_pane_lifecycles(&mut self) {
        let now = Instant::now();
        for pane in self.session.registry_mut().iter_mut() {
            pane.poll_lifecycle(now);
        }
        let gone = self.session.sweep_gone_panes();
        for pane_id in gone {
            log::info!("pane {pane_id} gone");
            for client in &mut self.clients {
                client.forget_pane(pane_id);
            }
        }
    }

    // ── Client side ───────────────────────────────────────────────────────

    /// Read and dispatch every complete frame from one client.
    fn service_client_reads(&mut self, idx: usize) -> Result<(), WsError> {
        loop {
            let message = self.clients[idx].conn.read_message()?;
            let Some(message) = message else { return Ok(()) };
            self.clients[idx].mark_received();

            match message {
                WsMessage::Close => return Err(WsError::PeerClosed),
                WsMessage::Ping(_) | WsMessage::Pong(_) => {
                    // Transport-level liveness only; mark_received above
                    // is the whole effect.
                }
                WsMessage::Text(payload) => match protocol::decode_json(&payload) {
                    Ok(msg) => self.dispatch(idx, msg),
                    Err(e) => log::warn!(
                        "client {}: undecodable JSON frame: {e}",
                        self.clients[idx].token()
                    ),
                },
                WsMessage::Binary(payload) => match protocol::decode_binary(&payload) {
                    Ok(msg) => self.dispatch(idx, msg),
                    Err(e) => log::warn!(
                        "client {}: undecodable binary frame: {e}",
                        self.clients[idx].token()
                    ),
                },
            }
        }
    }

    /// Resolve an optional pane target to a concrete id.
    fn target_pane(&self, pane_id: Option<PaneId>) -> PaneId {
        pane_id.unwrap_or_else(|| self.session.active_pane_id())
    }

    fn dispatch(&mut self, idx: usize, msg: ClientMessage) {
        let token = self.clients[idx].token();

        // The auth gate: only hello passes before authentication.
        if !WsProxy::require_auth(&self.clients[idx])
            && !matches!(msg, ClientMessage::Hello { .. })
        {
            log::warn!("client {token}: message before hello dropped");
            return;
        }

        match msg {
            ClientMessage::Hello { client_id, theme_fg, theme_bg, token: _ } => {
                let identity = match client_id.parse() {
                    Ok(uuid) => uuid,
                    Err(_) => {
                        // Not every client ships a UUID; derive a stable one.
                        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, client_id.as_bytes())
                    }
                };
                let theme = theme_fg.zip(theme_bg);
                WsProxy::handle_hello(&mut self.clients, token, identity, theme);

                // Fresh clients receive the active pane immediately.
                let pane_id = self.session.active_pane_id();
                self.send_snapshot(idx, pane_id);
            }

            ClientMessage::RequestMaster => {
                WsProxy::handle_request_master(&mut self.clients, token);
            }

            ClientMessage::Ping => {
                let frame = wire::encode_pong();
                if WsProxy::send(&mut self.clients[idx], &frame) == SendResult::Dead {
                    self.doomed.push(token);
                }
            }

            ClientMessage::Sync { gen, min_row_id: _, pane_id } => {
                let pane_id = self.target_pane(pane_id);
                self.clients[idx].set_pane_gen(pane_id, gen);
                let current = self
                    .session
                    .registry()
                    .get(pane_id)
                    .map(|p| p.generation());
                if current.is_some_and(|current| current > gen) {
                    self.send_snapshot(idx, pane_id);
                }
            }

            ClientMessage::Resync { pane_id, reason } => {
                log::debug!(
                    "client {token}: resync pane {pane_id} ({})",
                    reason.as_deref().unwrap_or("unspecified")
                );
                self.send_snapshot(idx, pane_id);
            }

            // Everything below mutates shared state: master only.
            other if !self.clients[idx].is_master() => {
                log::debug!("client {token}: non-master message {other:?} ignored");
            }

            ClientMessage::Key { key, state, ctrl, alt, shift, meta, pane_id } => {
                if state != KeyPhase::Down {
                    return;
                }
                let pane_id = self.target_pane(pane_id);
                let mods = keys::KeyMods { ctrl, alt, shift, meta };
                let app_mode = self
                    .session
                    .registry()
                    .get(pane_id)
                    .is_some_and(|p| p.cursor_key_application());
                if let Some(bytes) = keys::translate_key(&key, mods, app_mode) {
                    self.write_pane_input(pane_id, &bytes);
                }
            }

            ClientMessage::Text { text, pane_id } => {
                let pane_id = self.target_pane(pane_id);
                self.write_pane_input(pane_id, text.as_bytes());
            }

            ClientMessage::Resize { pane_id, cols, rows } => {
                if let Some(pane) = self.session.registry_mut().get_mut(pane_id) {
                    pane.resize(cols, rows);
                }
            }

            ClientMessage::Scroll { delta, pane_id } => {
                let pane_id = self.target_pane(pane_id);
                if let Some(pane) = self.session.registry_mut().get_mut(pane_id) {
                    pane.scroll(delta);
                }
            }

            ClientMessage::Focus { pane_id } => {
                if !self.session.focus(pane_id) {
                    log::warn!("client {token}: focus on unknown pane {pane_id}");
                }
            }

            ClientMessage::NewWindow { template } => {
                if let Err(e) = self.session.new_window(template.as_deref()) {
                    log::error!("new_window failed: {e}");
                }
            }

            ClientMessage::CloseWindow { id } => {
                self.session.close_window(id);
            }

            ClientMessage::ClosePane { id } => {
                self.session.close_pane(id);
            }

            ClientMessage::SetLayout { window, template } => {
                self.session.set_layout(window, &template);
            }

            ClientMessage::SwapPanes { window, a, b } => {
                if let Some(w) = self.session.window_mut(window) {
                    w.swap_panes(a, b);
                }
            }

            ClientMessage::ResizeLayout { window, nodes } => {
                let nodes = nodes
                    .into_iter()
                    .map(|n| crate::session::LayoutNode { pane: n.pane, weight: n.weight })
                    .collect();
                self.session.resize_layout(window, nodes);
            }

            ClientMessage::Mouse { pane_id, button, x, y, px, py, state, mods, ts: _ } => {
                let Some(pane) = self.session.registry().get(pane_id) else { return };
                if !pane.mouse_reporting() {
                    return;
                }
                let event = mouse::MouseEvent {
                    button,
                    x,
                    y,
                    px,
                    py,
                    phase: state,
                    mods,
                };
                if let Some(bytes) = mouse::encode_mouse(&event, pane.mouse_encoding()) {
                    self.write_pane_input(pane_id, &bytes);
                }
            }

            ClientMessage::SelectAll { pane_id } => {
                if let Some(pane) = self.session.registry_mut().get_mut(pane_id) {
                    pane.select_all();
                }
            }

            ClientMessage::ClearSelection { pane_id } => {
                if let Some(pane) = self.session.registry_mut().get_mut(pane_id) {
                    pane.clear_selection();
                }
            }

            ClientMessage::Copy { pane_id } => {
                let text = self
                    .session
                    .registry()
                    .get(pane_id)
                    .and_then(|p| p.selection_text());
                if let Some(text) = text {
                    self.session.set_clipboard("text".to_string(), text.into_bytes());
                }
            }

            ClientMessage::ClipboardSet { kind, data } => {
                self.session.set_clipboard(kind, data.into_bytes());
            }

            ClientMessage::ClipboardResponse { data, kind } => {
                self.session
                    .set_clipboard(kind.unwrap_or_else(|| "text".to_string()), data.into_bytes());
            }

            ClientMessage::ClipboardPaste { pane_id, kind: _ } => {
                let Some(data) = self.session.clipboard().map(|(_, d)| d.clone()) else {
                    return;
                };
                let bracketed = self
                    .session
                    .registry()
                    .get(pane_id)
                    .is_some_and(|p| p.bracketed_paste());
                if bracketed {
                    let mut wrapped = Vec::with_capacity(data.len() + 12);
                    wrapped.extend_from_slice(b"\x1b[200~");
                    wrapped.extend_from_slice(&data);
                    wrapped.extend_from_slice(b"\x1b[201~");
                    self.write_pane_input(pane_id, &wrapped);
                } else {
                    self.write_pane_input(pane_id, &data);
                }
            }

            ClientMessage::Unknown => {
                log::warn!("client {token}: unknown message type dropped");
            }
        }
    }

    fn write_pane_input(&mut self, pane_id: PaneId, bytes: &[u8]) {
        if let Some(pane) = self.session.registry_mut().get_mut(pane_id) {
            if let Err(e) = pane.write_input(bytes) {
                log::warn!("pane {pane_id}: input write failed: {e}");
            }
        }
    }

    /// Send a full snapshot of one pane to one client.
    fn send_snapshot(&mut self, idx: usize, pane_id: PaneId) {
        let Some(pane) = self.session.registry().get(pane_id) else { return };
        let generation = pane.generation();
        let frame = pane.snapshot();
        let client = &mut self.clients[idx];
        match WsProxy::send_unchecked(client, &frame) {
            SendResult::Ok => client.set_pane_gen(pane_id, generation),
            SendResult::Skipped => {}
            SendResult::Dead => {
                let token = client.token();
                self.doomed.push(token);
            }
        }
    }

    // ── Broadcast phase ───────────────────────────────────────────────────

    /// Once-per-tick delta dispatch plus title/bell frames.
    fn broadcast_pane_updates(&mut self) {
        let pane_ids: Vec<PaneId> = self.session.registry().iter().map(|p| p.id()).collect();
        let mut dead: Vec<u64> = Vec::new();

        for pane_id in pane_ids {
            // Phase 1: decide who needs anything, compute frames once.
            let (delta, snapshot, title, bell) = {
                let Some(pane) = self.session.registry_mut().get_mut(pane_id) else {
                    continue;
                };
                let generation = pane.generation();
                let anyone_behind = self.clients.iter().any(|c| {
                    c.is_authenticated()
                        && !c.is_congested()
                        && c.pane_gen(pane_id) < generation
                });
                let title = pane
                    .take_title_changed()
                    .then(|| wire::encode_title(pane_id, &pane.title().to_string()));
                let bell = pane.take_bell().then(|| wire::encode_bell(pane_id));

                if !anyone_behind {
                    (None, None, title, bell)
                } else {
                    let delta = pane.get_broadcast_delta();
                    let snapshot_needed = self.clients.iter().any(|c| {
                        c.is_authenticated()
                            && !c.is_congested()
                            && c.pane_gen(pane_id) < delta.to_gen
                            && c.pane_gen(pane_id) != delta.from_gen
                    });
                    let snapshot = snapshot_needed.then(|| pane.snapshot());
                    (Some(delta), snapshot, title, bell)
                }
            };

            // Phase 2: dispatch. Every recipient of the delta sees
            // byte-identical frames.
            if let Some(delta) = delta {
                for client in &mut self.clients {
                    if !client.is_authenticated() || client.is_congested() {
                        continue;
                    }
                    let have = client.pane_gen(pane_id);
                    if have >= delta.to_gen {
                        continue;
                    }
                    let frame = if have == delta.from_gen {
                        &delta.bytes
                    } else if let Some(snap) = &snapshot {
                        snap
                    } else {
                        continue;
                    };
                    match WsProxy::send_unchecked(client, frame) {
                        SendResult::Ok => client.set_pane_gen(pane_id, delta.to_gen),
                        SendResult::Skipped => {}
                        SendResult::Dead => dead.push(client.token()),
                    }
                }
            }

            if let Some(frame) = title {
                dead.extend(WsProxy::broadcast(&mut self.clients, &frame));
            }
            if let Some(frame) = bell {
                dead.extend(WsProxy::broadcast(&mut self.clients, &frame));
            }
        }

        self.remove_clients(&dead);
    }

    // ── Liveness ──────────────────────────────────────────────────────────

    fn ping_idle_clients(&mut self) {
        let now = Instant::now();
        let mut dead = Vec::new();

        for client in &mut self.clients {
            if !client.is_authenticated() {
                continue;
            }
            if let Some(since) = client.awaiting_pong_since() {
                if now.duration_since(since) > self.config.pong_deadline {
                    log::info!("client {}: pong deadline missed", client.token());
                    dead.push(client.token());
                }
                continue;
            }
            if now.duration_since(client.last_received()) >= self.config.idle_ping {
                let frame = wire::encode_ping();
                match WsProxy::send(client, &frame) {
                    SendResult::Dead => dead.push(client.token()),
                    _ => client.mark_ping_sent(now),
                }
            }
        }

        self.remove_clients(&dead);
    }

    fn remove_clients(&mut self, tokens: &[u64]) {
        if tokens.is_empty() {
            return;
        }
        self.clients.retain_mut(|client| {
            if !tokens.contains(&client.token()) {
                return true;
            }
            let _ = client.conn.send_close();
            client.conn.shutdown();
            log::info!("client {} disconnected", client.token());
            false
        });
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    fn teardown(&mut self) {
        // Panes first: SIGTERM everyone, then wait out the grace windows.
        self.session.terminate_all();
        let deadline = Instant::now() + crate::constants::CHILD_TERM_GRACE
            + crate::constants::CHILD_KILL_GRACE
            + std::time::Duration::from_millis(100);
        loop {
            let now = Instant::now();
            for pane in self.session.registry_mut().iter_mut() {
                pane.poll_lifecycle(now);
            }
            self.session.sweep_gone_panes();
            if self.session.registry().is_empty() || now >= deadline {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        for client in &mut self.clients {
            let _ = client.conn.send_close();
            client.conn.shutdown();
        }
        self.clients.clear();
        self.pending.clear();

        self.ipc.close();
        self.runtime.cleanup();
        log::info!("teardown complete");
    }
}

/// Accept errors that do not condemn the listener.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ECONNABORTED | libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
