// Message layer carried in the body of data packets.
//
// Layout: one flag byte, then (for request/response kinds) the message id as
// a little-endian base-128 varint, then (for routed kinds) either a two byte
// big-endian dictionary code or a length-prefixed inline route, then the
// payload bytes. Flag byte: bit 0 = route-is-dictionary-code, bits 1..=3 =
// message kind, bit 4 = payload deflated, bit 5 = error flag.
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::{compress, Error, Result, RouteDictionary};

const ROUTE_COMPRESS_MASK: u8 = 0x01;
const KIND_MASK: u8 = 0x0E;
const DEFLATE_MASK: u8 = 0x10;
const ERROR_MASK: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0x00,
    Notify = 0x01,
    Response = 0x02,
    Push = 0x03,
}

impl MessageKind {
    fn from_flag(flag: u8) -> Result<Self> {
        match (flag & KIND_MASK) >> 1 {
            0x00 => Ok(Self::Request),
            0x01 => Ok(Self::Notify),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Push),
            _ => Err(Error::InvalidMessageFlag(flag)),
        }
    }

    /// Request and response messages carry the client-assigned id.
    pub fn has_id(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }

    /// Responses travel without a route; the client correlates by id.
    pub fn has_route(self) -> bool {
        matches!(self, Self::Request | Self::Notify | Self::Push)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub id: u32,
    pub route: String,
    pub data: Bytes,
    pub error: bool,
}

/// Encoder/decoder bound to the negotiated route dictionary and the
/// connection-level compression setting.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    dict: Arc<RouteDictionary>,
    data_compression: bool,
}

impl MessageCodec {
    pub fn new(dict: Arc<RouteDictionary>, data_compression: bool) -> Self {
        Self {
            dict,
            data_compression,
        }
    }

    pub fn dictionary(&self) -> &RouteDictionary {
        &self.dict
    }

    pub fn compression_enabled(&self) -> bool {
        self.data_compression
    }

    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        let mut flag = (message.kind as u8) << 1;
        if message.error {
            flag |= ERROR_MASK;
        }

        let dict_code = if message.kind.has_route() {
            self.dict.code(&message.route)
        } else {
            None
        };
        if dict_code.is_some() {
            flag |= ROUTE_COMPRESS_MASK;
        }

        let mut data = message.data.clone();
        if self.data_compression {
            let packed = compress::deflate(&data)?;
            // Same rule as the handshake body: the compressed form wins only
            // when it is strictly shorter.
            if packed.len() < data.len() {
                data = Bytes::from(packed);
                flag |= DEFLATE_MASK;
            }
        }

        let mut buf = BytesMut::with_capacity(16 + message.route.len() + data.len());
        buf.put_u8(flag);
        if message.kind.has_id() {
            put_varint(&mut buf, message.id);
        }
        if message.kind.has_route() {
            match dict_code {
                Some(code) => buf.put_u16(code),
                None => {
                    if message.route.len() > u8::MAX as usize {
                        return Err(Error::RouteTooLong(message.route.clone()));
                    }
                    buf.put_u8(message.route.len() as u8);
                    buf.extend_from_slice(message.route.as_bytes());
                }
            }
        }
        buf.extend_from_slice(&data);
        Ok(buf.freeze())
    }

    pub fn decode(&self, body: Bytes) -> Result<Message> {
        let mut offset = 0usize;
        let flag = *body.first().ok_or(Error::TruncatedMessage)?;
        offset += 1;
        let kind = MessageKind::from_flag(flag)?;
        let error = flag & ERROR_MASK != 0;

        let mut id = 0u32;
        if kind.has_id() {
            let (value, read) = get_varint(&body[offset..])?;
            id = value;
            offset += read;
        }

        let mut route = String::new();
        if kind.has_route() {
            if flag & ROUTE_COMPRESS_MASK != 0 {
                if body.len() < offset + 2 {
                    return Err(Error::TruncatedMessage);
                }
                let code = u16::from_be_bytes([body[offset], body[offset + 1]]);
                offset += 2;
                route = self
                    .dict
                    .route(code)
                    .ok_or(Error::RouteNotInDictionary(code))?
                    .to_string();
            } else {
                let len = *body.get(offset).ok_or(Error::TruncatedMessage)? as usize;
                offset += 1;
                if body.len() < offset + len {
                    return Err(Error::TruncatedMessage);
                }
                route = std::str::from_utf8(&body[offset..offset + len])
                    .map_err(|_| Error::InvalidRoute)?
                    .to_string();
                offset += len;
            }
        }

        let mut data = body.slice(offset..);
        if flag & DEFLATE_MASK != 0 {
            data = Bytes::from(compress::inflate(&data)?);
        }

        Ok(Message {
            kind,
            id,
            route,
            data,
            error,
        })
    }
}

fn put_varint(buf: &mut BytesMut, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            buf.put_u8(byte | 0x80);
        } else {
            buf.put_u8(byte);
            break;
        }
    }
}

fn get_varint(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut value = 0u32;
    let mut shift = 0u32;
    for (index, byte) in bytes.iter().enumerate() {
        if shift >= 32 {
            return Err(Error::TruncatedMessage);
        }
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
    }
    Err(Error::TruncatedMessage)
}
