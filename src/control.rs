//! Built-in handler used by the `ctlframed` binary.
//!
//! It understands the three framework commands and nothing else; real
//! deployments implement [`Handler`] themselves.

use std::net::SocketAddr;

use crate::framing::Packet;
use crate::pool::{ConnectionId, WsClientId};
use crate::server::{Handler, ServerState};
use crate::ws::{Opcode, WsFrame};

/// Hand over descriptors with the next hand-over word.
pub const CMD_PASS_FD: i16 = 1;
/// Stop the server.
pub const CMD_STOP: i16 = 2;
/// Restart the server.
pub const CMD_RESTART: i16 = 3;

/// Per-connection bookkeeping of [`ControlHandler`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControlSession {
    /// Packets handled on this connection.
    pub packets: u64,
    /// Descriptors received and released on this connection.
    pub descriptors: usize,
}

/// Minimal handler: answers the framework commands with `{magic, 0}`
/// and echoes WebSocket text and binary messages.
#[derive(Debug, Default)]
pub struct ControlHandler {
    connections_seen: u64,
    packets_handled: u64,
}

impl ControlHandler {
    /// Create a handler with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections accepted so far.
    pub fn connections_seen(&self) -> u64 {
        self.connections_seen
    }

    /// Packets handled so far.
    pub fn packets_handled(&self) -> u64 {
        self.packets_handled
    }
}

impl Handler for ControlHandler {
    type ConnData = ControlSession;
    type WsData = ();

    fn alloc_connection(&mut self, _id: ConnectionId) -> ControlSession {
        self.connections_seen += 1;
        ControlSession::default()
    }

    fn accepts_command(&self, command: i16) -> bool {
        matches!(command, CMD_PASS_FD | CMD_STOP | CMD_RESTART)
    }

    fn handle_packet(
        &mut self,
        state: &mut ServerState<Self>,
        conn: ConnectionId,
        packet: Packet<'_>,
    ) {
        self.packets_handled += 1;
        let Some(c) = state.connection_mut(conn) else {
            return;
        };
        c.data_mut().packets += 1;
        let held = c.take_passed_fds().len();
        if held > 0 {
            log::info!("[ctl] {}: releasing {} passed descriptor(s)", conn, held);
            c.data_mut().descriptors += held;
        }

        match packet.command() {
            CMD_PASS_FD => {
                c.send_reply(0);
                c.expect_descriptors();
            }
            CMD_STOP => {
                log::info!("[ctl] {}: stop requested (peer {:?})", conn, c.peer());
                c.send_reply(0);
                state.request_shutdown();
            }
            CMD_RESTART => {
                log::info!("[ctl] {}: restart requested (peer {:?})", conn, c.peer());
                c.send_reply(0);
                state.request_restart();
            }
            other => {
                state.err_invalid_command(conn, other);
            }
        }
    }

    fn alloc_ws_client(&mut self, id: WsClientId, peer: SocketAddr) {
        log::info!("[ws] {} connected from {}", id, peer);
    }

    fn handle_ws_packet(
        &mut self,
        state: &mut ServerState<Self>,
        client: WsClientId,
        frame: WsFrame,
    ) {
        if !matches!(frame.opcode, Opcode::Text | Opcode::Binary) {
            return;
        }
        if let Err(e) = state.ws_append_reply_frame(client, frame.opcode, &frame.payload) {
            log::debug!("[ws] {}: echo dropped: {}", client, e);
        }
    }
}
