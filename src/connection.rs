//! Control-channel connection and its packet framing state machine.
//!
//! ```text
//! ReadCredentials ──► ReadLength ──► ReadData ──► ReadReady ──dispatch──┐
//!        ▲                 ▲                                            │
//!        │                 └──────────────── Write ◄────────────────────┤
//! (accept)     ReadDescriptors ◄── Write (after expect_descriptors) ◄───┘
//!
//! any state ──fault──► WriteClose ──flushed──► Disconnect
//! any state ──EOF / I/O error / close──────────► Disconnect
//! ```
//!
//! The connection never reads past the packet boundary: length bytes are
//! read into a 4-byte buffer and body reads are capped at the remaining
//! count, so the next packet's bytes stay in the kernel until the current
//! one is dispatched.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use crate::error::ProtocolFault;
use crate::framing::{self, HANDOVER_WORD_LEN, LENGTH_PREFIX_LEN};
use crate::pool::ConnectionId;
use crate::sys::{self, PeerCredentials, MAX_PASSED_FDS};

/// Where a connection is in the packet protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the credential hand-over word.
    ReadCredentials,
    /// Waiting for the descriptor hand-over word.
    ReadDescriptors,
    /// Accumulating the 4-byte length prefix.
    ReadLength,
    /// Accumulating the packet body.
    ReadData,
    /// A complete packet is buffered and awaiting dispatch.
    ReadReady,
    /// Draining queued replies; reading is paused.
    Write,
    /// Draining replies, then disconnecting.
    WriteClose,
    /// Terminal; reaped after the current dispatch pass.
    Disconnect,
}

impl ConnState {
    fn is_reading(self) -> bool {
        matches!(
            self,
            Self::ReadCredentials | Self::ReadDescriptors | Self::ReadLength | Self::ReadData
        )
    }
}

/// Outcome of servicing a readable connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// Nothing more to do until the next readiness event.
    Pending,
    /// A full packet is buffered (`ConnState::ReadReady`).
    PacketReady,
}

#[derive(Debug)]
struct Reply {
    bytes: Vec<u8>,
    written: usize,
    close_after: bool,
}

type DestroyCallback<D> = Box<dyn FnOnce(ConnectionId, &mut D)>;

/// A control-channel client.
///
/// `D` is the application session value produced by the handler's
/// `alloc_connection` hook.
pub struct Connection<D> {
    id: ConnectionId,
    stream: UnixStream,
    state: ConnState,
    peer: Option<PeerCredentials>,
    max_packet_len: usize,

    len_buf: [u8; LENGTH_PREFIX_LEN],
    len_have: usize,
    body: Vec<u8>,
    body_have: usize,

    replies: VecDeque<Reply>,
    after_write: ConnState,
    passed_fds: Vec<OwnedFd>,

    contest_id: i32,
    on_destroy: Option<DestroyCallback<D>>,
    data: D,
}

impl<D> fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.stream.as_raw_fd())
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("queued_replies", &self.replies.len())
            .field("passed_fds", &self.passed_fds.len())
            .field("contest_id", &self.contest_id)
            .finish_non_exhaustive()
    }
}

impl<D> Connection<D> {
    /// Switch an accepted stream to non-blocking mode and ask for credentials.
    pub(crate) fn configure(stream: &UnixStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        sys::enable_passcred(stream.as_raw_fd())
    }

    /// Wrap a stream prepared by [`Connection::configure`].
    pub(crate) fn new(
        id: ConnectionId,
        stream: UnixStream,
        data: D,
        max_packet_len: usize,
    ) -> Self {
        Self {
            id,
            stream,
            state: ConnState::ReadCredentials,
            peer: None,
            max_packet_len,
            len_buf: [0; LENGTH_PREFIX_LEN],
            len_have: 0,
            body: Vec::new(),
            body_have: 0,
            replies: VecDeque::new(),
            after_write: ConnState::ReadLength,
            passed_fds: Vec::new(),
            contest_id: 0,
            on_destroy: None,
            data,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Credentials of the peer, once the hand-over word has been read.
    pub fn peer(&self) -> Option<PeerCredentials> {
        self.peer
    }

    /// Contest this connection is bound to (0 = none).
    pub fn contest_id(&self) -> i32 {
        self.contest_id
    }

    /// Bind the connection to a contest.
    pub fn set_contest_id(&mut self, contest_id: i32) {
        self.contest_id = contest_id;
    }

    /// Application session value.
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Mutable application session value.
    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    /// Descriptors received with the last descriptor hand-over.
    pub fn passed_fds(&self) -> &[OwnedFd] {
        &self.passed_fds
    }

    /// Take ownership of the received descriptors.
    pub fn take_passed_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.passed_fds)
    }

    /// Close every received descriptor still held by the connection.
    pub fn close_passed_descriptors(&mut self) {
        self.passed_fds.clear();
    }

    /// Run `callback` when the connection is reaped, after the handler's
    /// cleanup hook.
    pub fn set_destroy_callback(&mut self, callback: impl FnOnce(ConnectionId, &mut D) + 'static) {
        self.on_destroy = Some(Box::new(callback));
    }

    /// Read a descriptor hand-over word once the pending replies are written.
    ///
    /// Called from the packet handler for commands that pass descriptors.
    pub fn expect_descriptors(&mut self) {
        self.after_write = ConnState::ReadDescriptors;
    }

    /// Queue a reply body; the length prefix is added here.
    pub fn enqueue_reply(&mut self, body: &[u8]) {
        self.push_reply(framing::encode_frame(body), false);
    }

    /// Queue a reply body and disconnect once it has been written.
    pub fn enqueue_autoclose(&mut self, body: &[u8]) {
        self.push_reply(framing::encode_frame(body), true);
    }

    /// Queue a bare `{magic, code}` status reply.
    pub fn send_reply(&mut self, code: i16) {
        self.push_reply(framing::encode_status(code), false);
    }

    /// Force the connection into `Disconnect`, releasing its buffers now.
    pub fn close(&mut self) {
        self.state = ConnState::Disconnect;
        self.body = Vec::new();
        self.body_have = 0;
        self.replies.clear();
        self.passed_fds.clear();
    }

    /// Whether the connection has reached its terminal state.
    pub fn is_disconnected(&self) -> bool {
        self.state == ConnState::Disconnect
    }

    pub(crate) fn raw_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }

    pub(crate) fn wants_read(&self) -> bool {
        self.state.is_reading()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.state != ConnState::Disconnect && !self.replies.is_empty()
    }

    /// Take the buffered packet for dispatch.
    pub(crate) fn take_packet(&mut self) -> Option<Vec<u8>> {
        if self.state != ConnState::ReadReady {
            return None;
        }
        self.body_have = 0;
        Some(std::mem::take(&mut self.body))
    }

    /// Leave `ReadReady` after the handler returned without replying.
    pub(crate) fn finish_dispatch(&mut self) {
        if self.state == ConnState::ReadReady {
            self.enter_idle();
        }
    }

    pub(crate) fn take_destroy_callback(&mut self) -> Option<DestroyCallback<D>> {
        self.on_destroy.take()
    }

    pub(crate) fn into_data(self) -> D {
        self.data
    }

    /// Queue a typed error reply for `fault` and drop the connection once
    /// it is written.
    pub(crate) fn fault(&mut self, fault: &ProtocolFault) {
        log::warn!("[ctl] {}: {}", self.id, fault);
        if self.state == ConnState::Disconnect {
            return;
        }
        // A reply already on the wire must finish before the fault frame.
        let in_flight = self.replies.front().is_some_and(|r| r.written > 0);
        self.replies.truncate(usize::from(in_flight));
        if let Some(front) = self.replies.front_mut() {
            front.close_after = false;
        }
        self.replies.push_back(Reply {
            bytes: framing::encode_status(fault.reply_code()),
            written: 0,
            close_after: true,
        });
        self.state = ConnState::WriteClose;
        self.on_writable();
    }

    fn push_reply(&mut self, bytes: Vec<u8>, close_after: bool) {
        match self.state {
            ConnState::Disconnect | ConnState::WriteClose => {
                log::debug!("[ctl] {}: reply dropped, connection closing", self.id);
                return;
            }
            _ => {}
        }
        self.replies.push_back(Reply {
            bytes,
            written: 0,
            close_after,
        });
        if close_after {
            self.state = ConnState::WriteClose;
        } else if self.state == ConnState::ReadReady
            || (self.state == ConnState::ReadLength && self.len_have == 0)
        {
            self.state = ConnState::Write;
        }
    }

    fn enter_idle(&mut self) {
        self.state = self.after_write;
        self.after_write = ConnState::ReadLength;
    }

    fn eof_mid_packet(&mut self) {
        log::warn!("[ctl] {}: unexpected EOF in {:?}", self.id, self.state);
        self.close();
    }

    fn io_failed(&mut self, op: &str, err: &io::Error) {
        log::warn!("[ctl] {}: {} failed: {}", self.id, op, err);
        self.close();
    }

    /// Service a readable socket.
    ///
    /// Loops until the socket would block, a full packet is buffered, or the
    /// connection leaves the read states.
    pub(crate) fn on_readable(&mut self) -> ReadStatus {
        loop {
            let step = match self.state {
                ConnState::ReadCredentials => self.read_credentials(),
                ConnState::ReadDescriptors => self.read_descriptors(),
                ConnState::ReadLength => self.read_length(),
                ConnState::ReadData => self.read_data(),
                ConnState::ReadReady => return ReadStatus::PacketReady,
                _ => return ReadStatus::Pending,
            };
            match step {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadStatus::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.io_failed("read", &e);
                    return ReadStatus::Pending;
                }
            }
        }
    }

    fn recv_handover_word(&mut self) -> io::Result<Option<sys::Received>> {
        let mut word = [0u8; HANDOVER_WORD_LEN];
        let got = sys::recv_with_ancillary(self.stream.as_raw_fd(), &mut word)?;
        if got.len == 0 {
            return Ok(None);
        }
        if got.len != HANDOVER_WORD_LEN {
            self.fault(&ProtocolFault::TooSmall {
                len: got.len,
                min: HANDOVER_WORD_LEN,
            });
            return Ok(None);
        }
        if word != [0; HANDOVER_WORD_LEN] {
            self.fault(&ProtocolFault::Protocol("non-zero hand-over word"));
            return Ok(None);
        }
        if got.truncated {
            self.fault(&ProtocolFault::Protocol("ancillary data truncated"));
            return Ok(None);
        }
        Ok(Some(got))
    }

    fn read_credentials(&mut self) -> io::Result<()> {
        let Some(got) = self.recv_handover_word()? else {
            if self.state == ConnState::ReadCredentials {
                log::debug!("[ctl] {}: closed before credentials", self.id);
                self.close();
            }
            return Ok(());
        };
        let creds = match got.credentials {
            Some(c) => c,
            None => sys::peer_credentials(self.stream.as_raw_fd())?,
        };
        log::debug!(
            "[ctl] {}: peer pid={} uid={} gid={}",
            self.id,
            creds.pid,
            creds.uid,
            creds.gid
        );
        self.peer = Some(creds);
        self.state = ConnState::ReadLength;
        Ok(())
    }

    fn read_descriptors(&mut self) -> io::Result<()> {
        let Some(got) = self.recv_handover_word()? else {
            if self.state == ConnState::ReadDescriptors {
                self.eof_mid_packet();
            }
            return Ok(());
        };
        if got.fds.is_empty() {
            self.fault(&ProtocolFault::Protocol("descriptors expected"));
            return Ok(());
        }
        if got.fds.len() + self.passed_fds.len() > MAX_PASSED_FDS {
            self.fault(&ProtocolFault::Protocol("too many descriptors"));
            return Ok(());
        }
        log::debug!("[ctl] {}: received {} descriptor(s)", self.id, got.fds.len());
        self.passed_fds.extend(got.fds);
        self.state = ConnState::ReadLength;
        Ok(())
    }

    fn read_length(&mut self) -> io::Result<()> {
        let n = (&self.stream).read(&mut self.len_buf[self.len_have..])?;
        if n == 0 {
            if self.len_have == 0 {
                log::debug!("[ctl] {}: peer closed", self.id);
                self.close();
            } else {
                self.eof_mid_packet();
            }
            return Ok(());
        }
        self.len_have += n;
        if self.len_have < LENGTH_PREFIX_LEN {
            return Ok(());
        }
        self.len_have = 0;
        let len = u32::from_le_bytes(self.len_buf) as usize;
        if let Err(fault) = framing::check_length(len, self.max_packet_len) {
            self.fault(&fault);
            return Ok(());
        }
        self.body = vec![0; len];
        self.body_have = 0;
        self.state = ConnState::ReadData;
        Ok(())
    }

    fn read_data(&mut self) -> io::Result<()> {
        let n = (&self.stream).read(&mut self.body[self.body_have..])?;
        if n == 0 {
            self.eof_mid_packet();
            return Ok(());
        }
        self.body_have += n;
        if self.body_have == self.body.len() {
            self.state = ConnState::ReadReady;
        }
        Ok(())
    }

    /// Drain queued replies in order until the socket would block.
    pub(crate) fn on_writable(&mut self) {
        while let Some(reply) = self.replies.front_mut() {
            match (&self.stream).write(&reply.bytes[reply.written..]) {
                Ok(0) => {
                    self.io_failed("write", &io::ErrorKind::WriteZero.into());
                    return;
                }
                Ok(n) => reply.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.io_failed("write", &e);
                    return;
                }
            }
            if reply.written < reply.bytes.len() {
                continue;
            }
            let close_after = reply.close_after;
            self.replies.pop_front();
            if close_after {
                log::debug!("[ctl] {}: closing after reply", self.id);
                self.close();
                return;
            }
        }
        if self.state == ConnState::Write {
            self.enter_idle();
        }
    }
}
