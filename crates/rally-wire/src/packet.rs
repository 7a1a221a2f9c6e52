// Packet framing: a one byte kind, a three byte big-endian body length, and
// the body itself. One packet per transport write.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

pub const HEADER_LEN: usize = 4;
// Hard limit imposed by the three length bytes.
pub const MAX_BODY_LEN: usize = 0xFF_FF_FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x03,
    Data = 0x04,
    Kick = 0x05,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::HandshakeAck),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Kick),
            other => Err(Error::InvalidPacketKind(other)),
        }
    }
}

/// A decoded frame: heartbeat and kick packets carry no body, handshake and
/// data packets carry an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub body: Bytes,
}

/// Encode a single packet into its on-wire form.
pub fn encode(kind: PacketKind, body: &[u8]) -> Result<Bytes> {
    if body.len() > MAX_BODY_LEN {
        return Err(Error::PacketTooLarge {
            got: body.len(),
            limit: MAX_BODY_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(kind as u8);
    buf.put_u8((body.len() >> 16) as u8);
    buf.put_u8((body.len() >> 8) as u8);
    buf.put_u8(body.len() as u8);
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Incremental packet decoder for a stream transport.
///
/// Bytes are fed in whatever chunks the socket produces; [`PacketDecoder::next`]
/// yields complete packets and leaves partial ones buffered.
#[derive(Debug)]
pub struct PacketDecoder {
    buf: BytesMut,
    max_body: usize,
}

impl PacketDecoder {
    pub fn new(max_body: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * 1024),
            max_body: max_body.min(MAX_BODY_LEN),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next(&mut self) -> Result<Option<Packet>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        // Validate the header before trusting the length.
        let kind = PacketKind::from_u8(self.buf[0])?;
        let length =
            ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
        if length > self.max_body {
            return Err(Error::PacketTooLarge {
                got: length,
                limit: self.max_body,
            });
        }
        if self.buf.len() < HEADER_LEN + length {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(length).freeze();
        Ok(Some(Packet { kind, body }))
    }
}
