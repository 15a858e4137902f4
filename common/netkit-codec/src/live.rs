// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Live-media packet codecs.
//!
//! Video packets are `u64_be timestamp | u32_be len | payload`. Audio packets
//! carry a leading magic word so a receiver that lost part of the stream can
//! scan forward to the next packet boundary.

use crate::frame::Limits;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Sentinel preceding every audio packet
pub const AUDIO_MAGIC: u32 = 0xA5A5_A5A5;

const VIDEO_HEADER_LEN: usize = 8 + 4;
const AUDIO_HEADER_LEN: usize = 4 + 8 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("media payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

/// One encoded video frame with its capture timestamp in microseconds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoPacket {
    pub timestamp_micros: u64,
    pub payload: Bytes,
}

impl VideoPacket {
    pub fn new(timestamp_micros: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp_micros,
            payload: payload.into(),
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.timestamp_micros);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn encoded_len(&self) -> usize {
        VIDEO_HEADER_LEN + self.payload.len()
    }

    /// Removes one complete packet from the front of `src`, if present
    pub fn decode(src: &mut BytesMut, limits: &Limits) -> Result<Option<Self>, Error> {
        if src.len() < VIDEO_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if len > limits.max_frame_len {
            return Err(Error::PayloadTooLarge {
                len,
                max: limits.max_frame_len,
            });
        }

        if src.len() < VIDEO_HEADER_LEN + len {
            return Ok(None);
        }

        let timestamp_micros = src.get_u64();
        let _ = src.get_u32();
        let payload = src.split_to(len).freeze();

        Ok(Some(Self {
            timestamp_micros,
            payload,
        }))
    }
}

/// One audio chunk with its capture timestamp in microseconds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioPacket {
    pub timestamp_micros: u64,
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn new(timestamp_micros: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp_micros,
            payload: payload.into(),
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(AUDIO_MAGIC);
        buf.put_u64(self.timestamp_micros);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn encoded_len(&self) -> usize {
        AUDIO_HEADER_LEN + self.payload.len()
    }
}

/// Incremental audio decoder that resynchronizes on the packet magic.
///
/// Bytes that precede a magic word are discarded one at a time and counted in
/// `skipped`; a corrupted stream costs at most the bytes between two packets.
#[derive(Debug, Default)]
pub struct AudioDecoder {
    skipped: u64,
}

impl AudioDecoder {
    /// Total bytes discarded while scanning for the magic word
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn decode(
        &mut self,
        src: &mut BytesMut,
        limits: &Limits,
    ) -> Result<Option<AudioPacket>, Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }

            let word = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            if word != AUDIO_MAGIC {
                src.advance(1);
                self.skipped += 1;
                continue;
            }

            if src.len() < AUDIO_HEADER_LEN {
                return Ok(None);
            }

            let len = u32::from_be_bytes([src[12], src[13], src[14], src[15]]) as usize;
            if len > limits.max_frame_len {
                // treat an implausible length as noise that happened to
                // contain the magic word and keep scanning
                src.advance(1);
                self.skipped += 1;
                continue;
            }

            if src.len() < AUDIO_HEADER_LEN + len {
                return Ok(None);
            }

            let _ = src.get_u32();
            let timestamp_micros = src.get_u64();
            let _ = src.get_u32();
            let payload = src.split_to(len).freeze();

            return Ok(Some(AudioPacket {
                timestamp_micros,
                payload,
            }));
        }
    }
}
