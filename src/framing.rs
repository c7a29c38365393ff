//! Wire format of the control channel.
//!
//! Every packet, in both directions, is carried in a length-prefixed frame:
//!
//! ```text
//! [u32 LE length] [u16 LE magic = 0xf249] [i16 LE id] [command payload …]
//! |<-- prefix -->|<------------------- length bytes ------------------->|
//! ```
//!
//! The 4-byte envelope (`magic`, `id`) is the only part of the body the
//! core interprets. On requests `id` is the command code; on replies it is
//! the status (0 or positive on success, a negated error code on failure).
//!
//! The first message on a new connection is not framed: it is a single
//! 4-byte zero word carrying the peer credentials as ancillary data. The
//! same zero word, carrying `SCM_RIGHTS` descriptors, follows a request
//! whose handler asked for descriptors.

use crate::error::ProtocolFault;

/// Packet magic.
pub const MAGIC: u16 = 0xf249;

/// Size of the `{magic, id}` envelope.
pub const ENVELOPE_LEN: usize = 4;

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the credential / descriptor hand-over word.
pub const HANDOVER_WORD_LEN: usize = 4;

/// Error code for generic protocol errors.
pub const ERR_PROTOCOL_ERROR: i16 = 10;

/// Error code for unknown operations.
pub const ERR_INV_OPER: i16 = 32;

/// Decoded `{magic, id}` envelope at the start of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Packet magic; valid packets carry [`MAGIC`].
    pub magic: u16,
    /// Command code (requests) or status (replies).
    pub id: i16,
}

impl Envelope {
    /// Build a reply envelope with the given status.
    pub fn reply(id: i16) -> Self {
        Self { magic: MAGIC, id }
    }

    /// Decode the envelope from the front of a packet body.
    ///
    /// # Errors
    ///
    /// `TooSmall` if fewer than [`ENVELOPE_LEN`] bytes are present and
    /// `Protocol` on a magic mismatch.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolFault> {
        if body.len() < ENVELOPE_LEN {
            return Err(ProtocolFault::TooSmall {
                len: body.len(),
                min: ENVELOPE_LEN,
            });
        }
        let magic = u16::from_le_bytes([body[0], body[1]]);
        if magic != MAGIC {
            return Err(ProtocolFault::Protocol("bad packet magic"));
        }
        let id = i16::from_le_bytes([body[2], body[3]]);
        Ok(Self { magic, id })
    }

    /// Encode to the 4 wire bytes.
    pub fn to_bytes(self) -> [u8; ENVELOPE_LEN] {
        let m = self.magic.to_le_bytes();
        let i = self.id.to_le_bytes();
        [m[0], m[1], i[0], i[1]]
    }
}

/// A fully buffered request handed to the packet handler.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    envelope: Envelope,
    body: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Wrap a body whose envelope has already been validated.
    pub(crate) fn new(envelope: Envelope, body: &'a [u8]) -> Self {
        Self { envelope, body }
    }

    /// Command code from the envelope.
    pub fn command(&self) -> i16 {
        self.envelope.id
    }

    /// Total packet length, envelope included.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Always false: a dispatched packet holds at least the envelope.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The raw packet, envelope included.
    pub fn bytes(&self) -> &'a [u8] {
        self.body
    }

    /// Bytes following the envelope.
    pub fn payload(&self) -> &'a [u8] {
        &self.body[ENVELOPE_LEN..]
    }
}

/// Prefix `body` with its length, producing a wire frame.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Encode a bare status reply (`{magic, id}` with no payload).
pub fn encode_status(id: i16) -> Vec<u8> {
    encode_frame(&Envelope::reply(id).to_bytes())
}

/// Build a request body: envelope followed by `payload`.
///
/// Used by clients of the control channel and by tests.
pub fn encode_request(command: i16, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(ENVELOPE_LEN + payload.len());
    body.extend_from_slice(&Envelope { magic: MAGIC, id: command }.to_bytes());
    body.extend_from_slice(payload);
    encode_frame(&body)
}

/// Validate a declared packet length against the configured bounds.
pub fn check_length(len: usize, max: usize) -> Result<(), ProtocolFault> {
    if len > max {
        return Err(ProtocolFault::BadLength { len, max });
    }
    if len < ENVELOPE_LEN {
        return Err(ProtocolFault::TooSmall {
            len,
            min: ENVELOPE_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_layout() {
        let bytes = Envelope::reply(-10).to_bytes();
        assert_eq!(bytes, [0x49, 0xf2, 0xf6, 0xff]);
        assert_eq!(Envelope::parse(&bytes).unwrap().id, -10);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let err = Envelope::parse(&[0, 0, 1, 0]).unwrap_err();
        assert_eq!(err, ProtocolFault::Protocol("bad packet magic"));
    }

    #[test]
    fn parse_rejects_short_body() {
        let err = Envelope::parse(&[0x49, 0xf2]).unwrap_err();
        assert_eq!(err, ProtocolFault::TooSmall { len: 2, min: 4 });
    }

    #[test]
    fn request_frame_carries_length_prefix() {
        let frame = encode_request(3, b"abc");
        assert_eq!(&frame[..4], &7u32.to_le_bytes());
        let env = Envelope::parse(&frame[4..]).unwrap();
        assert_eq!(env.id, 3);
        assert_eq!(&frame[8..], b"abc");
    }

    #[test]
    fn length_bounds() {
        assert!(check_length(4, 16).is_ok());
        assert!(check_length(16, 16).is_ok());
        assert!(matches!(check_length(17, 16), Err(ProtocolFault::BadLength { .. })));
        assert!(matches!(check_length(0, 16), Err(ProtocolFault::TooSmall { .. })));
    }

    #[test]
    fn packet_payload_skips_envelope() {
        let body = [0x49, 0xf2, 5, 0, b'x', b'y'];
        let env = Envelope::parse(&body).unwrap();
        let packet = Packet::new(env, &body);
        assert_eq!(packet.command(), 5);
        assert_eq!(packet.len(), 6);
        assert_eq!(packet.payload(), b"xy");
    }
}
