//! WebSocket clients accepted on the optional TCP listener.
//!
//! [`session`] holds the protocol state machine, [`frame`] and
//! [`handshake`] the wire codecs. [`WsClient`] ties a session to its
//! socket and the application data.

pub mod frame;
pub mod handshake;
pub mod session;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;

use crate::pool::WsClientId;
use crate::sys;

pub use frame::Opcode;
pub use session::{CloseState, WsFrame, WsSession, WsState};

const READ_CHUNK: usize = 16 * 1024;

/// A browser client on the WebSocket listener.
pub struct WsClient<D> {
    id: WsClientId,
    stream: TcpStream,
    peer: SocketAddr,
    tls: bool,
    session: WsSession,
    last_read_us: i64,
    last_write_us: i64,
    data: D,
}

impl<D> fmt::Debug for WsClient<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClient")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("tls", &self.tls)
            .field("session", &self.session)
            .field("last_read_us", &self.last_read_us)
            .field("last_write_us", &self.last_write_us)
            .finish_non_exhaustive()
    }
}

impl<D> WsClient<D> {
    pub(crate) fn configure(stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)
    }

    pub(crate) fn new(
        id: WsClientId,
        stream: TcpStream,
        peer: SocketAddr,
        data: D,
        max_payload: usize,
    ) -> Self {
        let now = sys::now_micros();
        Self {
            id,
            stream,
            peer,
            tls: false,
            session: WsSession::new(max_payload),
            last_read_us: now,
            last_write_us: now,
            data,
        }
    }

    /// Client id.
    pub fn id(&self) -> WsClientId {
        self.id
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the client reached us through a TLS terminator.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Mark the client as TLS-terminated upstream.
    pub fn set_tls(&mut self, tls: bool) {
        self.tls = tls;
    }

    /// Protocol state.
    pub fn session(&self) -> &WsSession {
        &self.session
    }

    /// Mutable protocol state, for queueing frames.
    pub fn session_mut(&mut self) -> &mut WsSession {
        &mut self.session
    }

    /// Time of the last successful read, in microseconds since the epoch.
    pub fn last_read_us(&self) -> i64 {
        self.last_read_us
    }

    /// Time of the last successful write, in microseconds since the epoch.
    pub fn last_write_us(&self) -> i64 {
        self.last_write_us
    }

    /// Application session value.
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Mutable application session value.
    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub(crate) fn raw_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }

    pub(crate) fn into_data(self) -> D {
        self.data
    }

    pub(crate) fn on_readable(&mut self) {
        let mut buf = [0u8; READ_CHUNK];
        while self.session.wants_read() {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("[ws] {} ({}): EOF", self.id, self.peer);
                    self.session.on_eof();
                    return;
                }
                Ok(n) => {
                    self.last_read_us = sys::now_micros();
                    self.session.feed(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[ws] {} ({}): read failed: {}", self.id, self.peer, e);
                    self.session.force_disconnect();
                    return;
                }
            }
        }
    }

    pub(crate) fn on_writable(&mut self) {
        while self.session.wants_write() {
            match self.stream.write(self.session.pending_output()) {
                Ok(0) => {
                    log::warn!("[ws] {} ({}): write returned 0", self.id, self.peer);
                    self.session.force_disconnect();
                    return;
                }
                Ok(n) => {
                    self.last_write_us = sys::now_micros();
                    self.session.consume_output(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[ws] {} ({}): write failed: {}", self.id, self.peer, e);
                    self.session.force_disconnect();
                    return;
                }
            }
        }
    }
}
