//! The event loop and the context handed to application hooks.
//!
//! # One iteration
//!
//! ```text
//! loop_start ─► build poll set ─► poll ─► dispatch ready fds ─► reap ─► post_select ─► job tick
//!    │                                                                                      │
//!   Stop                                                                              check flags
//!
//! An interrupted poll counts as an iteration with nothing ready.
//! ```
//!
//! Everything runs on one thread. The application sees the server through
//! [`Handler`] hooks, each of which receives `&mut ServerState<H>` to queue
//! replies, register watches, schedule jobs or request a restart. Removal of
//! connections and WebSocket clients is deferred to the reap phase so ids
//! stay valid for the whole dispatch pass.

use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::ServerConfig;
use crate::connection::{Connection, ReadStatus};
use crate::daemon;
use crate::error::{ProtocolFault, WsSendError};
use crate::framing::{Envelope, Packet};
use crate::job::{Job, JobId, JobInfo, JobQueue, JobSpec};
use crate::pool::{ConnectionId, Pool, WatchId, WsClientId};
use crate::sys;
use crate::watch::{Interest, WatchCallback, WatchRegistry};
use crate::ws::{Opcode, WsClient, WsFrame, WsState};

/// Returned by [`Handler::loop_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// Run this iteration.
    Continue,
    /// Leave the loop.
    Stop,
}

/// Why [`Server::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A restart was requested; the caller should re-exec.
    Restart,
    /// A shutdown was requested.
    Shutdown,
    /// [`Handler::loop_start`] returned [`LoopStatus::Stop`].
    Stopped,
}

/// Application callbacks.
///
/// Only packet handling, connection allocation and WebSocket allocation are
/// mandatory; the remaining hooks default to doing nothing.
pub trait Handler: Sized + 'static {
    /// Per-connection application state.
    type ConnData;
    /// Per-WebSocket-client application state.
    type WsData;

    /// Produce the session value for a freshly accepted connection.
    fn alloc_connection(&mut self, id: ConnectionId) -> Self::ConnData;

    /// Handle one complete, envelope-checked packet.
    fn handle_packet(
        &mut self,
        state: &mut ServerState<Self>,
        conn: ConnectionId,
        packet: Packet<'_>,
    );

    /// Whether `command` is known. Unknown commands get an invalid-command
    /// reply and the connection is dropped without calling `handle_packet`.
    fn accepts_command(&self, _command: i16) -> bool {
        true
    }

    /// Called after a connection left the pool, before its destroy callback.
    fn cleanup_connection(
        &mut self,
        _state: &mut ServerState<Self>,
        _conn: &mut Connection<Self::ConnData>,
    ) {
    }

    /// Called when the server cannot start.
    fn startup_error(&mut self, err: &anyhow::Error) {
        log::error!("[server] start-up failed: {:#}", err);
    }

    /// Called at the top of every iteration.
    fn loop_start(&mut self, _state: &mut ServerState<Self>) -> LoopStatus {
        LoopStatus::Continue
    }

    /// Called after ready descriptors were dispatched.
    fn post_select(&mut self, _state: &mut ServerState<Self>) {}

    /// Produce the session value for a new WebSocket client.
    fn alloc_ws_client(&mut self, id: WsClientId, peer: SocketAddr) -> Self::WsData;

    /// Handle one reassembled WebSocket message or control frame.
    fn handle_ws_packet(
        &mut self,
        _state: &mut ServerState<Self>,
        _client: WsClientId,
        _frame: WsFrame,
    ) {
    }

    /// Called after a WebSocket client left the pool.
    fn cleanup_ws_client(
        &mut self,
        _state: &mut ServerState<Self>,
        _client: &mut WsClient<Self::WsData>,
    ) {
    }
}

/// Server-owned state, passed to every hook.
pub struct ServerState<H: Handler> {
    config: ServerConfig,
    listener: UnixListener,
    ws_listener: Option<TcpListener>,
    connections: Pool<Connection<H::ConnData>>,
    ws_clients: Pool<WsClient<H::WsData>>,
    watches: WatchRegistry<H>,
    jobs: JobQueue,
    start_time: SystemTime,
    restart: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl<H: Handler> fmt::Debug for ServerState<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("socket_path", &self.config.socket_path)
            .field("connections", &self.connections.len())
            .field("ws_clients", &self.ws_clients.len())
            .field("watches", &self.watches)
            .field("jobs", &self.jobs)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

macro_rules! with_conn {
    ($self:ident, $id:expr, |$c:ident| $body:expr) => {
        match $self.connections.get_mut($id.0) {
            Some($c) => {
                $body;
                true
            }
            None => false,
        }
    };
}

impl<H: Handler> ServerState<H> {
    /// Effective configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// When the server was created.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Address of the WebSocket listener, if enabled.
    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.ws_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// Look up a connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection<H::ConnData>> {
        self.connections.get(id.0)
    }

    /// Look up a connection mutably.
    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<H::ConnData>> {
        self.connections.get_mut(id.0)
    }

    /// Live connection ids, oldest first.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.handles().into_iter().map(ConnectionId).collect()
    }

    /// Number of connections, including ones awaiting reaping.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a framed reply. Returns `false` for unknown ids.
    pub fn enqueue_reply(&mut self, id: ConnectionId, body: &[u8]) -> bool {
        with_conn!(self, id, |c| c.enqueue_reply(body))
    }

    /// Queue a framed reply and close the connection once it is written.
    pub fn enqueue_autoclose(&mut self, id: ConnectionId, body: &[u8]) -> bool {
        with_conn!(self, id, |c| c.enqueue_autoclose(body))
    }

    /// Queue a bare status reply.
    pub fn send_reply(&mut self, id: ConnectionId, code: i16) -> bool {
        with_conn!(self, id, |c| c.send_reply(code))
    }

    /// Close the descriptors received on a connection.
    pub fn close_passed_descriptors(&mut self, id: ConnectionId) -> bool {
        with_conn!(self, id, |c| c.close_passed_descriptors())
    }

    /// Read a descriptor hand-over after the current replies are written.
    pub fn expect_descriptors(&mut self, id: ConnectionId) -> bool {
        with_conn!(self, id, |c| c.expect_descriptors())
    }

    /// Force a connection to disconnect. It is reaped after the current pass.
    pub fn close_connection(&mut self, id: ConnectionId) -> bool {
        with_conn!(self, id, |c| c.close())
    }

    /// Reply with a bad-length error and disconnect.
    pub fn err_bad_packet_length(&mut self, id: ConnectionId, len: usize, max: usize) -> bool {
        with_conn!(self, id, |c| c.fault(&ProtocolFault::BadLength { len, max }))
    }

    /// Reply with an invalid-command error and disconnect.
    pub fn err_invalid_command(&mut self, id: ConnectionId, command: i16) -> bool {
        with_conn!(self, id, |c| c.fault(&ProtocolFault::InvalidCommand(command)))
    }

    /// Reply with a too-small error and disconnect.
    pub fn err_packet_too_small(&mut self, id: ConnectionId, len: usize, min: usize) -> bool {
        with_conn!(self, id, |c| c.fault(&ProtocolFault::TooSmall { len, min }))
    }

    /// Reply with a generic protocol error and disconnect.
    pub fn err_protocol_error(&mut self, id: ConnectionId, what: &'static str) -> bool {
        with_conn!(self, id, |c| c.fault(&ProtocolFault::Protocol(what)))
    }

    // ── WebSocket clients ───────────────────────────────────────────────

    /// Look up a WebSocket client.
    pub fn ws_client(&self, id: WsClientId) -> Option<&WsClient<H::WsData>> {
        self.ws_clients.get(id.0)
    }

    /// Look up a WebSocket client mutably.
    pub fn ws_client_mut(&mut self, id: WsClientId) -> Option<&mut WsClient<H::WsData>> {
        self.ws_clients.get_mut(id.0)
    }

    /// Live WebSocket client ids, oldest first.
    pub fn ws_client_ids(&self) -> Vec<WsClientId> {
        self.ws_clients.handles().into_iter().map(WsClientId).collect()
    }

    /// Queue a frame to a WebSocket client.
    pub fn ws_append_reply_frame(
        &mut self,
        id: WsClientId,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), WsSendError> {
        self.ws_clients
            .get_mut(id.0)
            .ok_or(WsSendError::UnknownClient)?
            .session_mut()
            .append_reply_frame(opcode, payload)
    }

    /// Start closing a WebSocket client: queue a close frame if the
    /// handshake completed and output is open, otherwise drop it.
    pub fn close_ws(&mut self, id: WsClientId, code: u16, reason: &str) -> bool {
        let Some(client) = self.ws_clients.get_mut(id.0) else {
            return false;
        };
        let session = client.session_mut();
        if session.queue_close(code, reason).is_err()
            && !matches!(session.state(), WsState::InitialReply | WsState::Active)
        {
            session.force_disconnect();
        }
        true
    }

    // ── Watches ─────────────────────────────────────────────────────────

    /// Poll `fd` with the given interest and run `callback` when it is ready.
    pub fn add_watch(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(&mut H, &mut ServerState<H>, WatchId, Interest) + 'static,
    ) -> WatchId {
        let callback: WatchCallback<H> = Box::new(callback);
        self.watches.add(fd, interest, callback)
    }

    /// Stop polling a watch. Safe to call from inside any callback.
    pub fn remove_watch(&mut self, id: WatchId) -> bool {
        self.watches.remove(id)
    }

    /// Whether a watch is registered.
    pub fn has_watch(&self, id: WatchId) -> bool {
        self.watches.is_active(id)
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    /// Queue a background job.
    pub fn add_job(&mut self, spec: JobSpec, job: impl Job + 'static) -> JobId {
        self.jobs.add(spec, Box::new(job))
    }

    /// Remove and destroy a job. Unknown ids are ignored.
    pub fn remove_job(&mut self, id: JobId) -> bool {
        self.jobs.remove(id)
    }

    /// Remove and destroy every job of a contest.
    pub fn cancel_contest_jobs(&mut self, contest_id: i32) -> usize {
        self.jobs.cancel_contest(contest_id)
    }

    /// Snapshots of all jobs in run order.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs.iter().collect()
    }

    /// Number of queued jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// The job that runs next.
    pub fn first_job(&self) -> Option<JobInfo> {
        self.jobs.first()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Leave the loop after this iteration and ask the caller to re-exec.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    /// Whether a restart was requested.
    pub fn is_restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// Leave the loop after this iteration.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether a shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Flag set by [`request_restart`](Self::request_restart), for signal
    /// registration.
    pub fn restart_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.restart)
    }

    /// Flag set by [`request_shutdown`](Self::request_shutdown), for signal
    /// registration.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn exit_requested(&self) -> Option<ExitReason> {
        if self.is_shutdown_requested() {
            Some(ExitReason::Shutdown)
        } else if self.is_restart_requested() {
            Some(ExitReason::Restart)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PollTarget {
    Listener,
    WsListener,
    Connection(ConnectionId),
    WsClient(WsClientId),
    Watch(WatchId),
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Readiness derived from `revents`, restricted to what was asked for.
#[derive(Debug, Clone, Copy)]
struct Ready {
    readable: bool,
    writable: bool,
    invalid: bool,
}

impl Ready {
    fn from_pollfd(p: &libc::pollfd) -> Self {
        let failed = p.revents & (libc::POLLHUP | libc::POLLERR) != 0;
        Self {
            readable: p.events & libc::POLLIN != 0 && (p.revents & libc::POLLIN != 0 || failed),
            writable: p.events & libc::POLLOUT != 0 && (p.revents & libc::POLLOUT != 0 || failed),
            invalid: p.revents & libc::POLLNVAL != 0,
        }
    }
}

/// The socket server: state plus the application handler.
pub struct Server<H: Handler> {
    state: ServerState<H>,
    handler: H,
}

impl<H: Handler + fmt::Debug> fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("handler", &self.handler)
            .finish()
    }
}

impl<H: Handler> Server<H> {
    /// Bind the control socket (and the WebSocket listener when `ws_port`
    /// is set). Failures are reported through [`Handler::startup_error`].
    pub fn bind(config: ServerConfig, mut handler: H) -> Result<Self> {
        match Self::bind_listeners(&config) {
            Ok((listener, ws_listener)) => Ok(Self::from_listeners(
                config,
                listener,
                ws_listener,
                handler,
            )),
            Err(e) => {
                handler.startup_error(&e);
                Err(e)
            }
        }
    }

    fn bind_listeners(config: &ServerConfig) -> Result<(UnixListener, Option<TcpListener>)> {
        config.validate()?;
        let listener = daemon::bind_control_socket(config)?;
        let ws_listener = if config.ws_port == 0 {
            None
        } else {
            let addr = SocketAddr::new(config.ws_bind, config.ws_port);
            let l = TcpListener::bind(addr)
                .with_context(|| format!("bind websocket listener {addr}"))?;
            l.set_nonblocking(true)
                .context("set websocket listener non-blocking")?;
            log::info!("[ws] listening on {}", addr);
            Some(l)
        };
        Ok((listener, ws_listener))
    }

    /// Build a server around already bound listeners. Both are switched to
    /// non-blocking mode.
    pub fn from_listeners(
        config: ServerConfig,
        listener: UnixListener,
        ws_listener: Option<TcpListener>,
        handler: H,
    ) -> Self {
        for result in [
            listener.set_nonblocking(true),
            ws_listener.as_ref().map_or(Ok(()), |l| l.set_nonblocking(true)),
            sys::enable_passcred(listener.as_raw_fd()),
        ] {
            if let Err(e) = result {
                log::warn!("[server] listener setup: {}", e);
            }
        }
        Self {
            state: ServerState {
                config,
                listener,
                ws_listener,
                connections: Pool::new(),
                ws_clients: Pool::new(),
                watches: WatchRegistry::default(),
                jobs: JobQueue::new(),
                start_time: SystemTime::now(),
                restart: Arc::new(AtomicBool::new(false)),
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            handler,
        }
    }

    /// Server state.
    pub fn state(&self) -> &ServerState<H> {
        &self.state
    }

    /// Mutable server state.
    pub fn state_mut(&mut self) -> &mut ServerState<H> {
        &mut self.state
    }

    /// The application handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The application handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Run until a restart or shutdown is requested or `loop_start` stops
    /// the loop. All clients are closed before returning.
    pub fn run(&mut self) -> Result<ExitReason> {
        log::info!(
            "[server] {} running on {}",
            self.state.config.program_name,
            self.state.config.socket_path.display()
        );
        let reason = loop {
            if let Some(reason) = self.run_once()? {
                break reason;
            }
        };
        log::info!("[server] leaving event loop: {:?}", reason);
        self.close_all();
        Ok(reason)
    }

    /// One loop iteration. `Some` when the loop should end.
    pub fn run_once(&mut self) -> Result<Option<ExitReason>> {
        if self.handler.loop_start(&mut self.state) == LoopStatus::Stop {
            return Ok(Some(ExitReason::Stopped));
        }

        let (mut fds, targets) = self.build_poll_set();
        let timeout = if self.state.jobs.is_empty() {
            Duration::from_millis(self.state.config.select_timeout_ms)
        } else {
            Duration::ZERO
        };
        match sys::poll(&mut fds, Some(timeout)) {
            Ok(_) => {}
            // revents stay zero, so dispatch below sees nothing ready
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                log::trace!("[server] poll interrupted");
            }
            Err(e) => return Err(e).context("poll"),
        }

        self.dispatch(&fds, &targets);
        self.reap();
        self.handler.post_select(&mut self.state);
        self.state.jobs.tick(self.state.config.job_tick_budget);
        Ok(self.state.exit_requested())
    }

    /// Force every client closed and run the cleanup hooks.
    pub fn close_all(&mut self) {
        for h in self.state.connections.handles() {
            if let Some(c) = self.state.connections.get_mut(h) {
                c.close();
            }
        }
        for h in self.state.ws_clients.handles() {
            if let Some(c) = self.state.ws_clients.get_mut(h) {
                c.session_mut().force_disconnect();
            }
        }
        self.reap();
    }

    fn build_poll_set(&self) -> (Vec<libc::pollfd>, Vec<PollTarget>) {
        let s = &self.state;
        let cap = 2 + s.connections.len() + s.ws_clients.len() + s.watches.len();
        let mut fds = Vec::with_capacity(cap);
        let mut targets = Vec::with_capacity(cap);

        fds.push(pollfd(s.listener.as_raw_fd(), libc::POLLIN));
        targets.push(PollTarget::Listener);
        if let Some(l) = &s.ws_listener {
            fds.push(pollfd(l.as_raw_fd(), libc::POLLIN));
            targets.push(PollTarget::WsListener);
        }

        for (h, conn) in s.connections.iter() {
            let interest = Interest::from_flags(conn.wants_read(), conn.wants_write());
            if let Some(interest) = interest {
                fds.push(pollfd(conn.raw_fd(), interest.poll_events()));
                targets.push(PollTarget::Connection(ConnectionId(h)));
            }
        }
        for (h, client) in s.ws_clients.iter() {
            let session = client.session();
            let interest = Interest::from_flags(session.wants_read(), session.wants_write());
            if let Some(interest) = interest {
                fds.push(pollfd(client.raw_fd(), interest.poll_events()));
                targets.push(PollTarget::WsClient(WsClientId(h)));
            }
        }
        for (id, fd, interest) in s.watches.poll_entries() {
            fds.push(pollfd(fd, interest.poll_events()));
            targets.push(PollTarget::Watch(id));
        }
        (fds, targets)
    }

    fn dispatch(&mut self, fds: &[libc::pollfd], targets: &[PollTarget]) {
        self.state.watches.begin_dispatch();
        for (p, target) in fds.iter().zip(targets) {
            if p.revents == 0 {
                continue;
            }
            let ready = Ready::from_pollfd(p);
            match *target {
                PollTarget::Listener => self.accept_connections(),
                PollTarget::WsListener => self.accept_ws_clients(),
                PollTarget::Connection(id) => self.service_connection(id, ready),
                PollTarget::WsClient(id) => self.service_ws_client(id, ready),
                PollTarget::Watch(id) => self.fire_watch(id, ready),
            }
        }
        self.state.watches.end_dispatch();
    }

    fn accept_connections(&mut self) {
        loop {
            match self.state.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = Connection::<H::ConnData>::configure(&stream) {
                        log::warn!("[ctl] dropping new connection: {}", e);
                        continue;
                    }
                    let max = self.state.config.max_packet_len;
                    let handler = &mut self.handler;
                    let h = self.state.connections.insert_with(|h| {
                        let id = ConnectionId(h);
                        Connection::new(id, stream, handler.alloc_connection(id), max)
                    });
                    log::debug!("[ctl] {} accepted", ConnectionId(h));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("[ctl] accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn accept_ws_clients(&mut self) {
        let Some(listener) = self.state.ws_listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = WsClient::<H::WsData>::configure(&stream) {
                        log::warn!("[ws] dropping client {}: {}", peer, e);
                        continue;
                    }
                    let max = self.state.config.ws_max_payload;
                    let handler = &mut self.handler;
                    let h = self.state.ws_clients.insert_with(|h| {
                        let id = WsClientId(h);
                        WsClient::new(id, stream, peer, handler.alloc_ws_client(id, peer), max)
                    });
                    log::debug!("[ws] {} accepted from {}", WsClientId(h), peer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("[ws] accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn service_connection(&mut self, id: ConnectionId, ready: Ready) {
        let Some(conn) = self.state.connections.get_mut(id.0) else {
            return;
        };
        if ready.invalid {
            log::warn!("[ctl] {}: invalid descriptor", id);
            conn.close();
            return;
        }
        if ready.writable {
            conn.on_writable();
        }
        if ready.readable && conn.wants_read() && conn.on_readable() == ReadStatus::PacketReady {
            self.dispatch_packet(id);
        }
    }

    fn dispatch_packet(&mut self, id: ConnectionId) {
        let Some(conn) = self.state.connections.get_mut(id.0) else {
            return;
        };
        let Some(body) = conn.take_packet() else {
            return;
        };
        let envelope = match Envelope::parse(&body) {
            Ok(e) => e,
            Err(fault) => {
                conn.fault(&fault);
                return;
            }
        };
        if !self.handler.accepts_command(envelope.id) {
            conn.fault(&ProtocolFault::InvalidCommand(envelope.id));
            return;
        }
        log::trace!("[ctl] {}: command {} ({} bytes)", id, envelope.id, body.len());

        self.handler
            .handle_packet(&mut self.state, id, Packet::new(envelope, &body));

        if let Some(conn) = self.state.connections.get_mut(id.0) {
            conn.finish_dispatch();
            if conn.wants_write() {
                conn.on_writable();
            }
        }
    }

    fn service_ws_client(&mut self, id: WsClientId, ready: Ready) {
        let Some(client) = self.state.ws_clients.get_mut(id.0) else {
            return;
        };
        if ready.invalid {
            log::warn!("[ws] {}: invalid descriptor", id);
            client.session_mut().force_disconnect();
            return;
        }
        if ready.readable {
            client.on_readable();
        }
        self.deliver_ws_frames(id);
        if let Some(client) = self.state.ws_clients.get_mut(id.0) {
            if ready.writable || client.session().wants_write() {
                client.on_writable();
            }
        }
    }

    fn deliver_ws_frames(&mut self, id: WsClientId) {
        loop {
            let Some(frame) = self
                .state
                .ws_clients
                .get_mut(id.0)
                .and_then(|c| c.session_mut().pop_frame())
            else {
                return;
            };
            log::trace!(
                "[ws] {}: {:?} frame, {} bytes in {} fragment(s)",
                id,
                frame.opcode,
                frame.payload.len(),
                frame.fragments
            );
            self.handler.handle_ws_packet(&mut self.state, id, frame);
        }
    }

    fn fire_watch(&mut self, id: WatchId, ready: Ready) {
        if ready.invalid {
            log::warn!("[watch] {}: invalid descriptor, removing", id);
            self.state.watches.remove(id);
            return;
        }
        let Some(observed) = Interest::from_flags(ready.readable, ready.writable) else {
            return;
        };
        let Some(mut callback) = self.state.watches.take_callback(id) else {
            return;
        };
        callback(&mut self.handler, &mut self.state, id, observed);
        self.state.watches.restore_callback(id, callback);
    }

    fn reap(&mut self) {
        let dead: Vec<_> = self
            .state
            .connections
            .iter()
            .filter(|(_, c)| c.is_disconnected())
            .map(|(h, _)| h)
            .collect();
        for h in dead {
            let Some(mut conn) = self.state.connections.remove(h) else {
                continue;
            };
            let id = ConnectionId(h);
            self.handler.cleanup_connection(&mut self.state, &mut conn);
            if let Some(callback) = conn.take_destroy_callback() {
                callback(id, conn.data_mut());
            }
            log::debug!("[ctl] {} reaped", id);
            drop(conn.into_data());
        }

        let finished: Vec<_> = self
            .state
            .ws_clients
            .iter()
            .filter(|(_, c)| c.session().is_finished())
            .map(|(h, _)| h)
            .collect();
        for h in finished {
            let Some(mut client) = self.state.ws_clients.remove(h) else {
                continue;
            };
            self.handler.cleanup_ws_client(&mut self.state, &mut client);
            log::debug!(
                "[ws] {} reaped (peer close code {:?})",
                WsClientId(h),
                client.session().peer_close_code()
            );
            drop(client.into_data());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polled(events: libc::c_short, revents: libc::c_short) -> libc::pollfd {
        libc::pollfd {
            fd: 0,
            events,
            revents,
        }
    }

    #[test]
    fn hangup_wakes_the_requested_direction_only() {
        let r = Ready::from_pollfd(&polled(libc::POLLIN, libc::POLLHUP));
        assert!(r.readable);
        assert!(!r.writable);

        let w = Ready::from_pollfd(&polled(libc::POLLOUT, libc::POLLERR));
        assert!(!w.readable);
        assert!(w.writable);
    }

    #[test]
    fn unrequested_readiness_is_ignored() {
        let r = Ready::from_pollfd(&polled(libc::POLLOUT, libc::POLLIN));
        assert!(!r.readable);
        assert!(!r.writable);
        assert!(!r.invalid);
    }

    #[test]
    fn nval_is_reported() {
        assert!(Ready::from_pollfd(&polled(libc::POLLIN, libc::POLLNVAL)).invalid);
    }
}
