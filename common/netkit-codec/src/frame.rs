// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed stream frames.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload
//! itself. The length is validated against [`Limits`] before any payload
//! allocation happens.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Number of bytes in the frame header
pub const HEADER_LEN: usize = 4;

/// Default cap on a single frame payload (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_frame_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Limits {
    pub const fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Validates a payload length read from the wire
    pub fn check(&self, len: usize) -> Result<(), Error> {
        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Writes the header for a payload of `len` bytes
pub fn encode_header<B: BufMut>(len: usize, limits: &Limits, buf: &mut B) -> Result<(), Error> {
    limits.check(len)?;
    buf.put_u32(len as u32);
    Ok(())
}

/// Writes a whole frame (header + payload)
pub fn encode<B: BufMut>(payload: &[u8], limits: &Limits, buf: &mut B) -> Result<(), Error> {
    encode_header(payload.len(), limits, buf)?;
    buf.put_slice(payload);
    Ok(())
}

/// Removes one complete frame from the front of `src`, if present.
///
/// Returns `Ok(None)` when more input is needed. The caller is expected to
/// keep appending received bytes to `src` and retry.
pub fn decode(src: &mut BytesMut, limits: &Limits) -> Result<Option<Bytes>, Error> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    limits.check(len)?;

    if src.len() < HEADER_LEN + len {
        // reserve the rest of the frame so the read loop fills it in one pass
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    Ok(Some(src.split_to(len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let limits = Limits::default();
        let mut buf = BytesMut::new();
        encode(b"hello", &limits, &mut buf).unwrap();

        let payload = decode(&mut buf, &limits).unwrap().unwrap();
        assert_eq!(&payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload() {
        let limits = Limits::default();
        let mut buf = BytesMut::new();
        encode(b"", &limits, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let payload = decode(&mut buf, &limits).unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn partial_input() {
        let limits = Limits::default();
        let mut full = BytesMut::new();
        encode(b"partial frame", &limits, &mut full).unwrap();

        let mut src = BytesMut::new();
        for byte in &full[..full.len() - 1] {
            src.put_u8(*byte);
            assert_eq!(decode(&mut src, &limits).unwrap(), None);
        }
        src.put_u8(full[full.len() - 1]);
        let payload = decode(&mut src, &limits).unwrap().unwrap();
        assert_eq!(&payload[..], b"partial frame");
    }

    #[test]
    fn oversize_rejected_before_payload_arrives() {
        let limits = Limits::new(8);
        let mut src = BytesMut::new();
        src.put_u32(9);
        assert_eq!(
            decode(&mut src, &limits),
            Err(Error::FrameTooLarge { len: 9, max: 8 })
        );
    }

    #[test]
    fn oversize_encode_writes_nothing() {
        let limits = Limits::new(4);
        let mut buf = BytesMut::new();
        assert!(encode(b"too big", &limits, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let limits = Limits::default();
        let mut src = BytesMut::new();
        encode(b"one", &limits, &mut src).unwrap();
        encode(b"two", &limits, &mut src).unwrap();

        assert_eq!(&decode(&mut src, &limits).unwrap().unwrap()[..], b"one");
        assert_eq!(&decode(&mut src, &limits).unwrap().unwrap()[..], b"two");
        assert_eq!(decode(&mut src, &limits).unwrap(), None);
    }
}
