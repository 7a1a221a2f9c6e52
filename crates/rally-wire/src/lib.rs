// Wire format for the rally client protocol: packet framing, the message
// layer carried inside data packets, and the pre-encoded handshake and
// heartbeat frames negotiated at connection setup.

pub mod compress;
mod dictionary;
mod handshake;
mod message;
pub mod packet;

pub use compress::{deflate, inflate};
pub use dictionary::RouteDictionary;
pub use handshake::StaticFrames;
pub use message::{Message, MessageCodec, MessageKind};
pub use packet::{Packet, PacketDecoder, PacketKind, HEADER_LEN, MAX_BODY_LEN};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown packet kind {0:#04x}")]
    InvalidPacketKind(u8),
    #[error("packet body of {got} bytes exceeds limit of {limit}")]
    PacketTooLarge { got: usize, limit: usize },
    #[error("unknown message kind in flag byte {0:#04x}")]
    InvalidMessageFlag(u8),
    #[error("message body ended before all declared fields")]
    TruncatedMessage,
    #[error("route {0} is longer than 255 bytes")]
    RouteTooLong(String),
    #[error("route code {0} is not in the negotiated dictionary")]
    RouteNotInDictionary(u16),
    #[error("route is not valid utf-8")]
    InvalidRoute,
    #[error("encode handshake body: {0}")]
    Handshake(#[from] serde_json::Error),
    #[error("compression: {0}")]
    Compression(#[from] std::io::Error),
}
