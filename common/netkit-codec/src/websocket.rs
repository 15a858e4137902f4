// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! RFC 6455 websocket frame codec.
//!
//! Only the base protocol is implemented; extensions negotiate reserved bits,
//! so any set reserved bit is a protocol error here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Control frame payloads are capped by the RFC
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return Err(Error::UnknownOpcode(value)),
        })
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBitsSet,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("control frame must not be fragmented")]
    FragmentedControlFrame,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLong(usize),
    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Binary, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Pong, payload)
    }

    /// Builds a close frame with a status code and UTF-8 reason
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(true, Opcode::Close, payload.freeze())
    }

    /// Parses a close payload into (code, reason); an empty payload is a
    /// close without a status code
    pub fn close_body(&self) -> Option<(u16, String)> {
        if self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some((code, reason))
    }

    /// Encodes the frame, masking the payload when `mask` is provided
    /// (clients mask, servers never do)
    pub fn encode<B: BufMut>(&self, mask: Option<[u8; 4]>, buf: &mut B) {
        let first = (self.fin as u8) << 7 | self.opcode as u8;
        buf.put_u8(first);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();
        if len <= 125 {
            buf.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                buf.put_slice(&key);
                for (i, byte) in self.payload.iter().enumerate() {
                    buf.put_u8(byte ^ key[i % 4]);
                }
            }
            None => buf.put_slice(&self.payload),
        }
    }

    /// Removes one complete frame from the front of `src`, if present
    pub fn decode(src: &mut BytesMut, max_payload: usize) -> Result<Option<Self>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];

        if first & 0x70 != 0 {
            return Err(Error::ReservedBitsSet);
        }

        let fin = first & 0x80 != 0;
        let opcode = Opcode::from_u8(first & 0x0F)?;
        let masked = second & 0x80 != 0;

        let mut header_len = 2;
        let len = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                header_len += 2;
                u16::from_be_bytes([src[2], src[3]]) as usize
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                header_len += 8;
                u64::from_be_bytes([
                    src[2], src[3], src[4], src[5], src[6], src[7], src[8], src[9],
                ]) as usize
            }
            n => n as usize,
        };

        if opcode.is_control() {
            if !fin {
                return Err(Error::FragmentedControlFrame);
            }
            if len > MAX_CONTROL_PAYLOAD {
                return Err(Error::ControlFrameTooLong(len));
            }
        }

        if len > max_payload {
            return Err(Error::PayloadTooLarge {
                len,
                max: max_payload,
            });
        }

        let mask_len = if masked { 4 } else { 0 };
        if src.len() < header_len + mask_len + len {
            return Ok(None);
        }

        src.advance(header_len);
        let payload = if masked {
            let mut key = [0u8; 4];
            src.copy_to_slice(&mut key);
            let mut payload = src.split_to(len);
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
            payload.freeze()
        } else {
            src.split_to(len).freeze()
        };

        Ok(Some(Self {
            fin,
            opcode,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    fn round_trip(frame: Frame, mask: Option<[u8; 4]>) {
        let mut buf = BytesMut::new();
        frame.encode(mask, &mut buf);
        let decoded = Frame::decode(&mut buf, MAX).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn unmasked_text() {
        round_trip(Frame::text(&b"hello"[..]), None);
    }

    #[test]
    fn masked_binary() {
        round_trip(Frame::binary(vec![0u8; 300]), Some([1, 2, 3, 4]));
    }

    #[test]
    fn extended_64bit_length() {
        round_trip(Frame::binary(vec![7u8; 70_000]), None);
    }

    #[test]
    fn close_code_and_reason() {
        let frame = Frame::close(1000, "bye");
        assert_eq!(frame.close_body(), Some((1000, "bye".into())));
        round_trip(frame, Some([9, 9, 9, 9]));
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xC1); // FIN + RSV1 + text
        buf.put_u8(0x00);
        assert_eq!(Frame::decode(&mut buf, MAX), Err(Error::ReservedBitsSet));
    }

    #[test]
    fn fragmented_ping_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x09); // no FIN, ping
        buf.put_u8(0x00);
        assert_eq!(
            Frame::decode(&mut buf, MAX),
            Err(Error::FragmentedControlFrame)
        );
    }

    #[test]
    fn oversize_rejected_from_header() {
        let mut buf = BytesMut::new();
        Frame::binary(vec![0u8; 200]).encode(None, &mut buf);
        assert_eq!(
            Frame::decode(&mut buf, 100),
            Err(Error::PayloadTooLarge { len: 200, max: 100 })
        );
    }

    #[test]
    fn partial_header() {
        let mut full = BytesMut::new();
        Frame::text(&b"fragmented arrival"[..]).encode(None, &mut full);

        let mut src = BytesMut::new();
        src.extend_from_slice(&full[..1]);
        assert_eq!(Frame::decode(&mut src, MAX).unwrap(), None);

        src.extend_from_slice(&full[1..]);
        let frame = Frame::decode(&mut src, MAX).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"fragmented arrival");
    }
}
