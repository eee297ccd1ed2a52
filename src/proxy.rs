//! Routing and the authentication gate.
//!
//! [`WsProxy`] mediates every server → client send. Three disciplines:
//!
//! - `send` — single client, auth-checked; a transport that cannot take
//!   the frame enqueues it and flags the client congested.
//! - `broadcast` — every authenticated, non-congested client. Never
//!   blocks the loop on a slow client; congested clients are simply
//!   skipped (they resync when they drain).
//! - `send_to_master` — responses that must originate from the master.
//!
//! Master arbitration also lives here: the first `hello` wins mastership,
//! later clients observe, and `request_master` transfers authority with
//! an explicit role frame to both sides.

use uuid::Uuid;

use crate::client::{ClientState, Role};
use crate::wire;
use crate::ws::WsError;

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Frame written or queued.
    Ok,
    /// Skipped (unauthenticated or congested).
    Skipped,
    /// The connection is beyond saving; the loop must close it.
    Dead,
}

/// Stateless routing façade over the loop's client list.
#[derive(Debug, Default)]
pub struct WsProxy;

impl WsProxy {
    /// Auth-checked single-client send.
    pub fn send(client: &mut ClientState, frame: &[u8]) -> SendResult {
        if !client.is_authenticated() {
            return SendResult::Skipped;
        }
        Self::send_unchecked(client, frame)
    }

    /// Send without the auth gate (role frames during hello itself).
    pub fn send_unchecked(client: &mut ClientState, frame: &[u8]) -> SendResult {
        match client.conn.send_binary(frame) {
            Ok(()) => {
                if client.conn.has_queued_writes() {
                    client.set_congested(true);
                }
                SendResult::Ok
            }
            Err(WsError::WriteBufferFull) => {
                log::warn!(
                    "client {}: write buffer overflow, closing",
                    client.token()
                );
                SendResult::Dead
            }
            Err(e) => {
                log::debug!("client {}: send failed: {e}", client.token());
                SendResult::Dead
            }
        }
    }

    /// Broadcast to all authenticated, non-congested clients.
    ///
    /// Returns tokens of clients whose connections died mid-send.
    pub fn broadcast(clients: &mut [ClientState], frame: &[u8]) -> Vec<u64> {
        let mut dead = Vec::new();
        for client in clients.iter_mut() {
            if !client.is_authenticated() || client.is_congested() {
                continue;
            }
            if Self::send_unchecked(client, frame) == SendResult::Dead {
                dead.push(client.token());
            }
        }
        dead
    }

    /// Send to the unique master, if one exists.
    pub fn send_to_master(clients: &mut [ClientState], frame: &[u8]) -> SendResult {
        match clients.iter_mut().find(|c| c.is_master()) {
            Some(master) => Self::send(master, frame),
            None => SendResult::Skipped,
        }
    }

    /// The auth gate: everything except `hello` requires this.
    pub fn require_auth(client: &ClientState) -> bool {
        client.is_authenticated()
    }

    /// Process a `hello`: the first client in becomes master, later ones
    /// observe. Re-hello on an authenticated client only refreshes
    /// identity. A role frame is pushed to the new client either way.
    pub fn handle_hello(
        clients: &mut [ClientState],
        token: u64,
        identity: Uuid,
        theme: Option<(String, String)>,
    ) {
        let master_exists = clients.iter().any(ClientState::is_master);
        let Some(client) = clients.iter_mut().find(|c| c.token() == token) else {
            return;
        };

        if client.is_authenticated() {
            log::debug!("client {token}: repeated hello, refreshing identity");
            client.authenticate(identity, client.role(), theme);
        } else {
            let role = if master_exists { Role::View } else { Role::Master };
            log::info!("client {token} ({identity}) joins as {role:?}");
            client.authenticate(identity, role, theme);
        }

        let role_frame = wire::encode_role(client.role().wire_code());
        let _ = Self::send_unchecked(client, &role_frame);
    }

    /// Transfer mastership to the requesting client.
    ///
    /// The previous master is demoted to view (with a role frame, so the
    /// UI can downgrade immediately); the requester is promoted. A
    /// request from the current master is a no-op.
    pub fn handle_request_master(clients: &mut [ClientState], token: u64) {
        let requester_ok = clients
            .iter()
            .any(|c| c.token() == token && c.is_authenticated());
        if !requester_ok {
            return;
        }

        for client in clients.iter_mut() {
            if client.is_master() {
                if client.token() == token {
                    return;
                }
                log::info!("client {}: demoted from master", client.token());
                client.set_role(Role::View);
                let frame = wire::encode_role(Role::View.wire_code());
                let _ = Self::send_unchecked(client, &frame);
            }
        }

        if let Some(client) = clients.iter_mut().find(|c| c.token() == token) {
            log::info!("client {token}: promoted to master");
            client.set_role(Role::Master);
            let frame = wire::encode_role(Role::Master.wire_code());
            let _ = Self::send_unchecked(client, &frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use crate::ws::WsConnection;
    use std::net::{TcpListener, TcpStream};

    /// A client over a real localhost socket pair (never read from).
    fn test_client(token: u64) -> (ClientState, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let peer = TcpStream::connect(addr).expect("connect");
        let (sock, _) = listener.accept().expect("accept");
        sock.set_nonblocking(true).expect("nonblocking");
        let conn = WsConnection::new(Stream::Plain(sock), Vec::new());
        (ClientState::new(token, conn), peer)
    }

    fn hello(clients: &mut [ClientState], token: u64) {
        WsProxy::handle_hello(clients, token, Uuid::new_v4(), None);
    }

    #[test]
    fn first_hello_wins_master() {
        let (a, _ka) = test_client(1);
        let (b, _kb) = test_client(2);
        let mut clients = vec![a, b];

        hello(&mut clients, 1);
        hello(&mut clients, 2);

        assert_eq!(clients[0].role(), Role::Master);
        assert_eq!(clients[1].role(), Role::View);
    }

    #[test]
    fn at_most_one_master_after_transfer() {
        let (a, _ka) = test_client(1);
        let (b, _kb) = test_client(2);
        let (c, _kc) = test_client(3);
        let mut clients = vec![a, b, c];
        hello(&mut clients, 1);
        hello(&mut clients, 2);
        hello(&mut clients, 3);

        WsProxy::handle_request_master(&mut clients, 3);
        let masters: Vec<u64> = clients
            .iter()
            .filter(|c| c.is_master())
            .map(ClientState::token)
            .collect();
        assert_eq!(masters, vec![3]);

        // Repeated transfers keep the invariant.
        WsProxy::handle_request_master(&mut clients, 2);
        WsProxy::handle_request_master(&mut clients, 2);
        assert_eq!(clients.iter().filter(|c| c.is_master()).count(), 1);
        assert!(clients[1].is_master());
    }

    #[test]
    fn unauthenticated_request_master_is_ignored() {
        let (a, _ka) = test_client(1);
        let (b, _kb) = test_client(2);
        let mut clients = vec![a, b];
        hello(&mut clients, 1);

        WsProxy::handle_request_master(&mut clients, 2);
        assert!(clients[0].is_master());
        assert_eq!(clients[1].role(), Role::None);
    }

    #[test]
    fn send_skips_unauthenticated() {
        let (mut a, _ka) = test_client(1);
        assert_eq!(WsProxy::send(&mut a, b"frame"), SendResult::Skipped);
    }

    #[test]
    fn broadcast_skips_congested() {
        let (a, _ka) = test_client(1);
        let (b, _kb) = test_client(2);
        let mut clients = vec![a, b];
        hello(&mut clients, 1);
        hello(&mut clients, 2);
        clients[1].set_congested(true);

        let dead = WsProxy::broadcast(&mut clients, b"data");
        assert!(dead.is_empty());
        // The congested client saw nothing queued beyond its prior state.
        assert!(clients[1].is_congested());
    }

    #[test]
    fn send_to_master_with_no_master_skips() {
        let (a, _ka) = test_client(1);
        let mut clients = vec![a];
        assert_eq!(
            WsProxy::send_to_master(&mut clients, b"x"),
            SendResult::Skipped
        );
    }
}
