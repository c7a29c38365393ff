//! Typed faults raised by the control-channel and WebSocket state machines.
//!
//! Process-boundary failures (binding, config loading, daemonizing) use
//! `anyhow` with context; these enums cover the faults that must be turned
//! into a wire-level reply before the peer is dropped.

use thiserror::Error;

use crate::framing::ERR_INV_OPER;
use crate::framing::ERR_PROTOCOL_ERROR;

/// A control-channel protocol fault.
///
/// Each variant maps onto a typed error reply (see [`ProtocolFault::reply_code`])
/// that is written before the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    /// Length prefix outside the configured bounds.
    #[error("bad packet length {len}, expected at most {max}")]
    BadLength {
        /// Declared length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Packet shorter than the structure the receiver needs.
    #[error("packet too small: {len} bytes, need {min}")]
    TooSmall {
        /// Actual length.
        len: usize,
        /// Minimum required length.
        min: usize,
    },

    /// Command id not recognized by the packet handler.
    #[error("invalid command {0}")]
    InvalidCommand(i16),

    /// Anything else: bad magic, truncated ancillary data, EOF mid-packet.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

impl ProtocolFault {
    /// Negative reply id sent to the peer for this fault.
    pub fn reply_code(&self) -> i16 {
        match self {
            Self::InvalidCommand(_) => -ERR_INV_OPER,
            Self::BadLength { .. } | Self::TooSmall { .. } | Self::Protocol(_) => {
                -ERR_PROTOCOL_ERROR
            }
        }
    }
}

/// A WebSocket protocol violation detected while parsing client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WsViolation {
    /// Client frame without the mask bit.
    #[error("client frame is not masked")]
    Unmasked,
    /// RSV bits set without a negotiated extension.
    #[error("reserved bits set: {0:#x}")]
    ReservedBits(u8),
    /// Opcode outside the RFC 6455 table.
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    /// Control frame fragmented or longer than 125 bytes.
    #[error("malformed control frame")]
    BadControlFrame,
    /// Continuation without a started message, or a new message mid-fragment.
    #[error("unexpected continuation state")]
    BadContinuation,
    /// Message larger than `ws_max_payload`.
    #[error("message too big: {size} bytes (max {max})")]
    TooBig {
        /// Size that would have been reached.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
}

impl WsViolation {
    /// Close status code sent to the peer.
    pub fn close_code(self) -> u16 {
        match self {
            Self::TooBig { .. } => crate::ws::frame::CLOSE_TOO_BIG,
            _ => crate::ws::frame::CLOSE_PROTOCOL_ERROR,
        }
    }
}

/// Errors from the outbound side of a WebSocket client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WsSendError {
    /// No such client (already reaped or never existed).
    #[error("unknown websocket client")]
    UnknownClient,
    /// The client has not completed the upgrade handshake.
    #[error("websocket handshake not complete")]
    NotActive,
    /// A close frame is already queued or sent.
    #[error("websocket output already closed")]
    OutputClosed,
    /// Control frame payload larger than 125 bytes.
    #[error("control frame payload too large ({0} bytes)")]
    ControlTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_command_uses_inv_oper_code() {
        assert_eq!(ProtocolFault::InvalidCommand(77).reply_code(), -32);
    }

    #[test]
    fn length_faults_use_protocol_error_code() {
        assert_eq!(ProtocolFault::BadLength { len: 9, max: 4 }.reply_code(), -10);
        assert_eq!(ProtocolFault::TooSmall { len: 1, min: 4 }.reply_code(), -10);
        assert_eq!(ProtocolFault::Protocol("eof").reply_code(), -10);
    }

    #[test]
    fn too_big_maps_to_1009() {
        let v = WsViolation::TooBig { size: 10, max: 1 };
        assert_eq!(v.close_code(), 1009);
        assert_eq!(WsViolation::Unmasked.close_code(), 1002);
    }
}
