//! RFC 6455 frame header codec.
//!
//! ```text
//!  0               1               2               3
//! |F|R|R|R| opcode|M| payload len |  extended length (0, 2 or 8)  |
//! |I|S|S|S|  (4)  |A|     (7)     |                               |
//! |N|V|V|V|       |S|             |   masking key (0 or 4 bytes)  |
//! ```
//!
//! Headers are 2..=14 bytes and are accumulated incrementally in a fixed
//! 16-byte buffer, so a header split across reads costs no allocation.

use crate::error::WsViolation;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Message too big.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Largest permitted control-frame payload.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible header (2 + 8 extended length + 4 mask).
pub const MAX_HEADER_LEN: usize = 14;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text message.
    Text,
    /// Binary message.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl Opcode {
    /// Decode a 4-bit opcode.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        })
    }

    /// The 4-bit wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment.
    pub fin: bool,
    /// RSV1..3 as the top nibble of the first byte, shifted down.
    pub rsv: u8,
    /// Raw 4-bit opcode.
    pub opcode: u8,
    /// Mask bit.
    pub masked: bool,
    /// Decoded payload length.
    pub payload_len: u64,
    /// Masking key (zero when unmasked).
    pub mask: [u8; 4],
    /// First two header bytes as received.
    pub raw: [u8; 2],
}

impl FrameHeader {
    /// Check the rules that need only the header: masking, reserved bits,
    /// known opcode and control-frame shape.
    pub fn validate(&self) -> Result<Opcode, WsViolation> {
        if !self.masked {
            return Err(WsViolation::Unmasked);
        }
        if self.rsv != 0 {
            return Err(WsViolation::ReservedBits(self.rsv));
        }
        let opcode = Opcode::from_u8(self.opcode).ok_or(WsViolation::UnknownOpcode(self.opcode))?;
        if opcode.is_control() && (!self.fin || self.payload_len > MAX_CONTROL_PAYLOAD as u64) {
            return Err(WsViolation::BadControlFrame);
        }
        Ok(opcode)
    }
}

/// Incremental header parser.
#[derive(Debug, Clone)]
pub struct HeaderParser {
    buf: [u8; 16],
    have: usize,
    need: usize,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self {
            buf: [0; 16],
            have: 0,
            need: 2,
        }
    }
}

impl HeaderParser {
    /// Bytes accumulated towards the current header.
    pub fn buffered(&self) -> usize {
        self.have
    }

    /// Feed input; returns how many bytes were consumed and the header once
    /// it is complete. The parser resets itself after yielding a header.
    pub fn feed(&mut self, input: &[u8]) -> (usize, Option<FrameHeader>) {
        let mut consumed = 0;
        loop {
            let take = (self.need - self.have).min(input.len() - consumed);
            self.buf[self.have..self.have + take]
                .copy_from_slice(&input[consumed..consumed + take]);
            self.have += take;
            consumed += take;
            if self.have < self.need {
                return (consumed, None);
            }
            if self.have == 2 {
                let mut need = 2;
                match self.buf[1] & 0x7f {
                    126 => need += 2,
                    127 => need += 8,
                    _ => {}
                }
                if self.buf[1] & 0x80 != 0 {
                    need += 4;
                }
                self.need = need;
                if self.have < self.need {
                    continue;
                }
            }
            let header = self.decode();
            self.have = 0;
            self.need = 2;
            return (consumed, Some(header));
        }
    }

    fn decode(&self) -> FrameHeader {
        let b = &self.buf;
        let masked = b[1] & 0x80 != 0;
        let (payload_len, mut pos) = match b[1] & 0x7f {
            126 => (u64::from(u16::from_be_bytes([b[2], b[3]])), 4),
            127 => {
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&b[2..10]);
                (u64::from_be_bytes(ext), 10)
            }
            n => (u64::from(n), 2),
        };
        let mut mask = [0u8; 4];
        if masked {
            mask.copy_from_slice(&b[pos..pos + 4]);
            pos += 4;
        }
        debug_assert_eq!(pos, self.need);
        FrameHeader {
            fin: b[0] & 0x80 != 0,
            rsv: (b[0] >> 4) & 0x7,
            opcode: b[0] & 0x0f,
            masked,
            payload_len,
            mask,
            raw: [b[0], b[1]],
        }
    }
}

/// XOR `data` with `mask`, where `data` starts `offset` bytes into the payload.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) & 3];
    }
}

/// Append an unmasked, final server frame to `out`.
pub fn encode_server_frame(opcode: Opcode, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(MAX_HEADER_LEN + payload.len());
    out.push(0x80 | opcode.as_u8());
    let len = payload.len();
    if len < 126 {
        out.push(len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        out.push(126);
        out.extend_from_slice(&short.to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
}

/// Append a masked client frame to `out`. Used by clients and tests.
pub fn encode_client_frame(
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
    mask: [u8; 4],
    out: &mut Vec<u8>,
) {
    let first = if fin { 0x80 } else { 0 } | opcode.as_u8();
    out.push(first);
    let len = payload.len();
    if len < 126 {
        out.push(0x80 | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        out.push(0x80 | 126);
        out.extend_from_slice(&short.to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(&mask);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], mask, 0);
}

/// Close-frame payload: big-endian status code followed by a UTF-8 reason.
///
/// Long reasons are cut at the last character boundary that fits.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let reason = &reason.as_bytes()[..end];
    let mut out = Vec::with_capacity(2 + reason.len());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(reason);
    out
}

/// Status code of a received close payload, if present.
pub fn close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_split_across_feeds() {
        let mut frame = Vec::new();
        encode_client_frame(true, Opcode::Binary, &[7; 300], [1, 2, 3, 4], &mut frame);

        let mut parser = HeaderParser::default();
        assert_eq!(parser.feed(&frame[..1]), (1, None));
        assert_eq!(parser.feed(&frame[1..3]), (2, None));
        let (used, header) = parser.feed(&frame[3..]);
        let header = header.unwrap();
        assert_eq!(used, 5);
        assert_eq!(header.payload_len, 300);
        assert_eq!(header.mask, [1, 2, 3, 4]);
        assert_eq!(header.validate(), Ok(Opcode::Binary));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn sixty_four_bit_length() {
        let bytes = [0x82, 0xff, 0, 0, 0, 0, 0, 1, 0, 0, 9, 9, 9, 9];
        let (used, header) = HeaderParser::default().feed(&bytes);
        assert_eq!(used, 14);
        assert_eq!(header.unwrap().payload_len, 65536);
    }

    #[test]
    fn validation_rules() {
        let base = FrameHeader {
            fin: true,
            rsv: 0,
            opcode: 0x1,
            masked: true,
            payload_len: 3,
            mask: [0; 4],
            raw: [0x81, 0x83],
        };
        assert_eq!(FrameHeader { masked: false, ..base }.validate(), Err(WsViolation::Unmasked));
        assert_eq!(FrameHeader { rsv: 4, ..base }.validate(), Err(WsViolation::ReservedBits(4)));
        assert_eq!(
            FrameHeader { opcode: 3, ..base }.validate(),
            Err(WsViolation::UnknownOpcode(3))
        );
        assert_eq!(
            FrameHeader { opcode: 0x9, fin: false, ..base }.validate(),
            Err(WsViolation::BadControlFrame)
        );
        assert_eq!(
            FrameHeader { opcode: 0x8, payload_len: 126, ..base }.validate(),
            Err(WsViolation::BadControlFrame)
        );
    }

    #[test]
    fn server_frame_length_forms() {
        let mut out = Vec::new();
        encode_server_frame(Opcode::Text, b"hey", &mut out);
        assert_eq!(out, [0x81, 3, b'h', b'e', b'y']);

        out.clear();
        encode_server_frame(Opcode::Binary, &[0; 200], &mut out);
        assert_eq!(&out[..4], &[0x82, 126, 0, 200]);

        out.clear();
        encode_server_frame(Opcode::Binary, &vec![0; 70_000], &mut out);
        assert_eq!(out[1], 127);
        assert_eq!(&out[2..10], &70_000u64.to_be_bytes());
    }

    #[test]
    fn mask_with_offset_matches_whole_mask() {
        let mask = [0xa, 0xb, 0xc, 0xd];
        let mut whole = *b"abcdefg";
        apply_mask(&mut whole, mask, 0);

        let mut split = *b"abcdefg";
        let (head, tail) = split.split_at_mut(3);
        apply_mask(head, mask, 0);
        apply_mask(tail, mask, 3);
        assert_eq!(whole, split);
    }

    #[test]
    fn long_reason_is_cut_on_a_char_boundary() {
        let reason = "é".repeat(100);
        let p = close_payload(CLOSE_NORMAL, &reason);
        assert_eq!(p.len(), 2 + 122);
        assert!(std::str::from_utf8(&p[2..]).is_ok());
    }

    #[test]
    fn close_payload_round_trip() {
        let p = close_payload(CLOSE_TOO_BIG, "too big");
        assert_eq!(close_code(&p), Some(1009));
        assert_eq!(&p[2..], b"too big");
        assert_eq!(close_code(&[]), None);
    }
}
