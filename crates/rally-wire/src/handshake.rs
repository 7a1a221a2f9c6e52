// Pre-encoded handshake-response and heartbeat frames.
//
// Both frames depend only on connection-wide negotiated parameters, so they
// are built once when the agent factory is constructed and shared by every
// connection. A build failure here is a configuration error and fails
// factory construction instead of surfacing per connection.
use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::{compress, packet, PacketKind, Result, RouteDictionary};

#[derive(Serialize)]
struct HandshakeBody<'a> {
    code: u32,
    sys: HandshakeSys<'a>,
}

#[derive(Serialize)]
struct HandshakeSys<'a> {
    heartbeat: f64,
    dict: BTreeMap<String, u16>,
    serializer: &'a str,
}

/// The shared frame bundle injected into the agent factory.
#[derive(Debug, Clone)]
pub struct StaticFrames {
    pub handshake_response: Bytes,
    pub heartbeat: Bytes,
}

impl StaticFrames {
    pub fn build(
        heartbeat: Duration,
        dict: &RouteDictionary,
        serializer_name: &str,
        data_compression: bool,
    ) -> Result<Self> {
        let body = HandshakeBody {
            code: 200,
            sys: HandshakeSys {
                heartbeat: heartbeat.as_secs_f64(),
                dict: dict.entries(),
                serializer: serializer_name,
            },
        };
        let mut data = serde_json::to_vec(&body)?;
        if data_compression {
            let packed = compress::deflate(&data)?;
            if packed.len() < data.len() {
                data = packed;
            }
        }

        Ok(Self {
            handshake_response: packet::encode(PacketKind::Handshake, &data)?,
            heartbeat: packet::encode(PacketKind::Heartbeat, &[])?,
        })
    }
}
