//! Fixed binary headers for the A/V datagram channels
//!
//! Video (port 8889): `u32 client_id || u32 sequence || u32 frame_size`,
//! then `frame_size` bytes of codec-compressed frame.
//!
//! Audio (port 8890): `u32 client_id || u32 timestamp`, then an opaque
//! audio chunk.
//!
//! All integers big-endian. The hub validates the header, learns the
//! sender's media address from the source endpoint, and relays the datagram
//! untouched; sequence numbers and timestamps are passed through for
//! client-side reordering, never acted on here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::registry::participant::ClientId;
use crate::MAX_DATAGRAM_SIZE;

/// Video datagram header length in bytes.
pub const VIDEO_HEADER_LEN: usize = 12;

/// Audio datagram header length in bytes.
pub const AUDIO_HEADER_LEN: usize = 8;

/// Parsed video datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub client_id: ClientId,
    pub sequence: u32,
    pub frame_size: u32,
}

impl VideoHeader {
    /// Parse and validate a complete video datagram.
    ///
    /// `frame_size` must match the actual payload remainder; a mismatch
    /// means a truncated or corrupt datagram and the whole thing is dropped.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < VIDEO_HEADER_LEN {
            return Err(Error::DatagramTooShort {
                len: datagram.len(),
                need: VIDEO_HEADER_LEN,
            });
        }
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::FrameTooLarge {
                size: datagram.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let mut buf = datagram;
        let header = Self {
            client_id: buf.get_u32(),
            sequence: buf.get_u32(),
            frame_size: buf.get_u32(),
        };

        let payload_len = datagram.len() - VIDEO_HEADER_LEN;
        if header.frame_size as usize != payload_len {
            return Err(Error::DatagramLengthMismatch {
                declared: header.frame_size as usize,
                got: payload_len,
            });
        }

        Ok(header)
    }

    /// Build a complete datagram from a header and payload.
    pub fn encode(client_id: ClientId, sequence: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(VIDEO_HEADER_LEN + payload.len());
        buf.put_u32(client_id);
        buf.put_u32(sequence);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Parsed audio datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub client_id: ClientId,
    pub timestamp: u32,
}

impl AudioHeader {
    /// Parse and validate a complete audio datagram.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < AUDIO_HEADER_LEN {
            return Err(Error::DatagramTooShort {
                len: datagram.len(),
                need: AUDIO_HEADER_LEN,
            });
        }
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::FrameTooLarge {
                size: datagram.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let mut buf = datagram;
        Ok(Self {
            client_id: buf.get_u32(),
            timestamp: buf.get_u32(),
        })
    }

    /// Build a complete datagram from a header and payload.
    pub fn encode(client_id: ClientId, timestamp: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_LEN + payload.len());
        buf.put_u32(client_id);
        buf.put_u32(timestamp);
        buf.put_slice(payload);
        buf.freeze()
    }
}
