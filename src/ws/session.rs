//! Sans-IO WebSocket session: handshake, frame assembly, close tracking.
//!
//! The session never touches a socket. The server feeds it received bytes
//! with [`WsSession::feed`], drains [`WsSession::pending_output`] to the
//! socket and reports progress with [`WsSession::consume_output`]; complete
//! frames are taken with [`WsSession::pop_frame`].
//!
//! Each direction has its own close state (see [`CloseState`]); the session
//! is finished once both have reached [`CloseState::Done`].

use std::collections::VecDeque;

use crate::error::{WsSendError, WsViolation};
use crate::ws::frame::{
    self, FrameHeader, HeaderParser, Opcode, CLOSE_NORMAL, MAX_CONTROL_PAYLOAD,
};
use crate::ws::handshake::{self, RequestInfo, MAX_REQUEST_HEAD};

/// Handshake and lifetime state of a WebSocket client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// Buffering the HTTP request head.
    Initial,
    /// `101` queued; frames are already accepted.
    InitialReply,
    /// HTTP error response queued; disconnect once written.
    HttpError,
    /// Exchanging frames.
    Active,
    /// Terminal.
    Disconnect,
}

/// Close progress of one direction. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CloseState {
    /// Open.
    Open,
    /// Inbound: close frame received. Outbound: close frame queued.
    Closing,
    /// Inbound: close delivered or EOF. Outbound: close frame on the wire.
    Done,
}

impl CloseState {
    fn advance(&mut self, to: CloseState) {
        if *self < to {
            *self = to;
        }
    }
}

/// A reassembled message or control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    /// Opcode of the first fragment.
    pub opcode: Opcode,
    /// Unmasked payload, all fragments concatenated.
    pub payload: Vec<u8>,
    /// Number of frames the message arrived in.
    pub fragments: u32,
    /// First two header bytes of the first fragment.
    pub raw_header: [u8; 2],
}

#[derive(Debug)]
struct InFrame {
    header: FrameHeader,
    opcode: Opcode,
    have: u64,
}

/// Protocol state of one WebSocket client.
#[derive(Debug)]
pub struct WsSession {
    state: WsState,
    in_close: CloseState,
    out_close: CloseState,
    max_payload: usize,

    head: Vec<u8>,
    info: RequestInfo,

    parser: HeaderParser,
    current: Option<InFrame>,
    frame_buf: Vec<u8>,
    assembling: Option<WsFrame>,
    frames: VecDeque<WsFrame>,
    peer_close_code: Option<u16>,

    out: Vec<u8>,
    out_pos: usize,
}

impl WsSession {
    /// New session awaiting the upgrade request.
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: WsState::Initial,
            in_close: CloseState::Open,
            out_close: CloseState::Open,
            max_payload,
            head: Vec::with_capacity(1024),
            info: RequestInfo::default(),
            parser: HeaderParser::default(),
            current: None,
            frame_buf: Vec::new(),
            assembling: None,
            frames: VecDeque::new(),
            peer_close_code: None,
            out: Vec::new(),
            out_pos: 0,
        }
    }

    /// Current handshake/lifetime state.
    pub fn state(&self) -> WsState {
        self.state
    }

    /// Inbound close state.
    pub fn in_close(&self) -> CloseState {
        self.in_close
    }

    /// Outbound close state.
    pub fn out_close(&self) -> CloseState {
        self.out_close
    }

    /// Request metadata from the upgrade.
    pub fn request(&self) -> &RequestInfo {
        &self.info
    }

    /// Status code of the peer's close frame.
    pub fn peer_close_code(&self) -> Option<u16> {
        self.peer_close_code
    }

    /// Whether the socket should be polled for input.
    pub fn wants_read(&self) -> bool {
        matches!(
            self.state,
            WsState::Initial | WsState::InitialReply | WsState::Active
        ) && self.in_close == CloseState::Open
    }

    /// Whether output is waiting to be written.
    pub fn wants_write(&self) -> bool {
        self.state != WsState::Disconnect && self.out_pos < self.out.len()
    }

    /// Whether the client can be reaped.
    pub fn is_finished(&self) -> bool {
        match self.state {
            WsState::Disconnect => true,
            WsState::Initial => self.in_close == CloseState::Done,
            WsState::HttpError => false,
            WsState::InitialReply | WsState::Active => {
                self.in_close == CloseState::Done && self.out_close == CloseState::Done
            }
        }
    }

    /// Bytes waiting for the socket.
    pub fn pending_output(&self) -> &[u8] {
        &self.out[self.out_pos..]
    }

    /// Record that `n` bytes of [`pending_output`](Self::pending_output)
    /// were written.
    pub fn consume_output(&mut self, n: usize) {
        self.out_pos = (self.out_pos + n).min(self.out.len());
        if self.out_pos < self.out.len() {
            return;
        }
        self.out.clear();
        self.out_pos = 0;
        match self.state {
            WsState::InitialReply => self.state = WsState::Active,
            WsState::HttpError => self.force_disconnect(),
            _ => {}
        }
        if self.out_close == CloseState::Closing {
            self.out_close.advance(CloseState::Done);
        }
        if self.is_finished() {
            self.state = WsState::Disconnect;
        }
    }

    /// Take the next complete frame. Delivering a close frame completes
    /// the inbound close.
    pub fn pop_frame(&mut self) -> Option<WsFrame> {
        let frame = self.frames.pop_front()?;
        if frame.opcode == Opcode::Close {
            self.in_close.advance(CloseState::Done);
        }
        Some(frame)
    }

    /// Number of frames waiting for delivery.
    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    /// Peer closed its end of the TCP stream.
    pub fn on_eof(&mut self) {
        self.in_close.advance(CloseState::Done);
        self.assembling = None;
        self.current = None;
        match self.state {
            WsState::Initial => self.force_disconnect(),
            WsState::InitialReply | WsState::Active if self.out_close == CloseState::Open => {
                self.push_close(CLOSE_NORMAL, "");
            }
            _ => {}
        }
    }

    /// Drop everything and enter `Disconnect`.
    pub fn force_disconnect(&mut self) {
        self.state = WsState::Disconnect;
        self.in_close = CloseState::Done;
        self.out_close = CloseState::Done;
        self.head = Vec::new();
        self.frame_buf = Vec::new();
        self.assembling = None;
        self.current = None;
        self.frames.clear();
        self.out = Vec::new();
        self.out_pos = 0;
    }

    /// Queue a server frame.
    pub fn append_reply_frame(
        &mut self,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), WsSendError> {
        self.check_can_send()?;
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsSendError::ControlTooLarge(payload.len()));
        }
        if opcode == Opcode::Close {
            self.out_close.advance(CloseState::Closing);
        }
        frame::encode_server_frame(opcode, payload, &mut self.out);
        Ok(())
    }

    /// Queue a close frame with `code` and `reason`.
    pub fn queue_close(&mut self, code: u16, reason: &str) -> Result<(), WsSendError> {
        self.check_can_send()?;
        self.push_close(code, reason);
        Ok(())
    }

    fn check_can_send(&self) -> Result<(), WsSendError> {
        if !matches!(self.state, WsState::InitialReply | WsState::Active) {
            return Err(WsSendError::NotActive);
        }
        if self.out_close != CloseState::Open {
            return Err(WsSendError::OutputClosed);
        }
        Ok(())
    }

    fn push_close(&mut self, code: u16, reason: &str) {
        let payload = frame::close_payload(code, reason);
        frame::encode_server_frame(Opcode::Close, &payload, &mut self.out);
        self.out_close.advance(CloseState::Closing);
    }

    /// Feed bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        match self.state {
            WsState::Initial => self.feed_head(data),
            WsState::InitialReply | WsState::Active => self.feed_frames(data),
            WsState::HttpError | WsState::Disconnect => {}
        }
    }

    fn feed_head(&mut self, data: &[u8]) {
        let searched_from = self.head.len().saturating_sub(3);
        self.head.extend_from_slice(data);
        let found = handshake::find_head_end(&self.head[searched_from..]);
        let Some(end) = found.map(|e| e + searched_from) else {
            if self.head.len() > MAX_REQUEST_HEAD {
                log::warn!("[ws] request head exceeds {} bytes", MAX_REQUEST_HEAD);
                self.http_error(handshake::HttpError::bad_request());
            }
            return;
        };
        if end > MAX_REQUEST_HEAD {
            log::warn!("[ws] request head exceeds {} bytes", MAX_REQUEST_HEAD);
            self.http_error(handshake::HttpError::bad_request());
            return;
        }

        let head = std::mem::take(&mut self.head);
        match handshake::parse_request(&head[..end]) {
            Ok(upgrade) => {
                log::debug!("[ws] upgrade {} from {:?}", upgrade.info.uri, upgrade.info.origin);
                self.info = upgrade.info;
                self.out.extend_from_slice(&handshake::switching_protocols(&upgrade.key));
                self.state = WsState::InitialReply;
                if end < head.len() {
                    self.feed_frames(&head[end..]);
                }
            }
            Err((err, info)) => {
                log::info!("[ws] rejecting {}: {} {}", info.uri, err.status, err.reason);
                self.info = info;
                self.http_error(err);
            }
        }
    }

    fn http_error(&mut self, err: handshake::HttpError) {
        self.head = Vec::new();
        self.out.extend_from_slice(&handshake::error_response(err));
        self.state = WsState::HttpError;
        self.in_close.advance(CloseState::Done);
    }

    fn violation(&mut self, v: WsViolation) {
        log::warn!("[ws] protocol violation: {}", v);
        if self.out_close == CloseState::Open {
            self.push_close(v.close_code(), &v.to_string());
        }
        self.in_close.advance(CloseState::Closing);
        self.in_close.advance(CloseState::Done);
        self.current = None;
        self.assembling = None;
        self.frame_buf = Vec::new();
    }

    fn feed_frames(&mut self, mut data: &[u8]) {
        while !data.is_empty() && self.in_close == CloseState::Open {
            let Some(cur) = self.current.as_mut() else {
                let (used, header) = self.parser.feed(data);
                data = &data[used..];
                if let Some(header) = header {
                    if let Err(v) = self.begin_frame(header) {
                        self.violation(v);
                        return;
                    }
                }
                continue;
            };
            let remaining = cur.header.payload_len - cur.have;
            let take = remaining.min(data.len() as u64) as usize;
            let start = self.frame_buf.len();
            self.frame_buf.extend_from_slice(&data[..take]);
            frame::apply_mask(&mut self.frame_buf[start..], cur.header.mask, cur.have as usize);
            cur.have += take as u64;
            data = &data[take..];
            if cur.have == cur.header.payload_len {
                self.complete_frame();
            }
        }
    }

    fn begin_frame(&mut self, header: FrameHeader) -> Result<(), WsViolation> {
        let opcode = header.validate()?;
        match opcode {
            Opcode::Continuation if self.assembling.is_none() => {
                return Err(WsViolation::BadContinuation)
            }
            Opcode::Text | Opcode::Binary if self.assembling.is_some() => {
                return Err(WsViolation::BadContinuation)
            }
            _ => {}
        }
        if !opcode.is_control() {
            let already = self.assembling.as_ref().map_or(0, |a| a.payload.len() as u64);
            let size = already.saturating_add(header.payload_len);
            if size > self.max_payload as u64 {
                return Err(WsViolation::TooBig {
                    size,
                    max: self.max_payload,
                });
            }
        }
        self.frame_buf = Vec::with_capacity(header.payload_len as usize);
        self.current = Some(InFrame {
            header,
            opcode,
            have: 0,
        });
        if header.payload_len == 0 {
            self.complete_frame();
        }
        Ok(())
    }

    fn complete_frame(&mut self) {
        let Some(cur) = self.current.take() else {
            return;
        };
        let payload = std::mem::take(&mut self.frame_buf);

        if cur.opcode.is_control() {
            match cur.opcode {
                Opcode::Ping if self.out_close == CloseState::Open => {
                    frame::encode_server_frame(Opcode::Pong, &payload, &mut self.out);
                }
                Opcode::Close => {
                    self.peer_close_code = frame::close_code(&payload);
                    self.in_close.advance(CloseState::Closing);
                    if self.out_close == CloseState::Open {
                        let code = self.peer_close_code.unwrap_or(CLOSE_NORMAL);
                        self.push_close(code, "");
                    }
                }
                _ => {}
            }
            self.frames.push_back(WsFrame {
                opcode: cur.opcode,
                payload,
                fragments: 1,
                raw_header: cur.header.raw,
            });
            return;
        }

        let message = match self.assembling.take() {
            None => WsFrame {
                opcode: cur.opcode,
                payload,
                fragments: 1,
                raw_header: cur.header.raw,
            },
            Some(mut partial) => {
                partial.payload.extend_from_slice(&payload);
                partial.fragments += 1;
                partial
            }
        };
        if cur.header.fin {
            self.frames.push_back(message);
        } else {
            self.assembling = Some(message);
        }
    }
}
