//! ctlframe - single-threaded socket server core.
//!
//! One `poll` loop multiplexes three kinds of work:
//!
//! - **Control connections** on a Unix-domain socket, speaking a
//!   length-prefixed packet protocol with credential and descriptor passing.
//! - **WebSocket clients** on an optional TCP listener.
//! - **Background jobs**, time-sliced between polls by a tick budget.
//!
//! Applications plug in through the [`Handler`] trait and act on the server
//! through [`ServerState`], which every hook receives.
//!
//! # Modules
//!
//! - [`server`] - event loop, `Handler`, `ServerState`
//! - [`connection`] - control-channel state machine
//! - [`framing`] - control-channel wire format
//! - [`ws`] - WebSocket handshake, frames and sessions
//! - [`job`] - priority job queue
//! - [`watch`] - extra descriptors polled by the loop
//! - [`config`] - configuration loading

#[cfg(not(target_os = "linux"))]
compile_error!("ctlframe relies on SO_PEERCRED and MSG_CMSG_CLOEXEC and builds on Linux only");

pub mod config;
pub mod connection;
pub mod control;
pub mod daemon;
pub mod error;
pub mod framing;
pub mod job;
pub mod pool;
pub mod server;
pub mod sys;
pub mod watch;
pub mod ws;

pub use config::ServerConfig;
pub use connection::{ConnState, Connection};
pub use error::{ProtocolFault, WsSendError, WsViolation};
pub use framing::{Envelope, Packet};
pub use job::{Job, JobId, JobInfo, JobProgress, JobSpec};
pub use pool::{ConnectionId, WatchId, WsClientId};
pub use server::{ExitReason, Handler, LoopStatus, Server, ServerState};
pub use watch::Interest;
pub use ws::{Opcode, WsClient, WsFrame};
