// Serializer seam between handler payloads and wire bytes.
//
// The agent never interprets payload bytes; it only needs a name to announce
// in the handshake, an encode step, and the two error-payload helpers used
// when a response carries an application error.
use bytes::Bytes;
use rally_session::{AppError, Payload};

pub type Result<T> = std::result::Result<T, SerializeError>;

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("encode json payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait Serializer: Send + Sync {
    /// Name announced to clients in the handshake `sys.serializer` field.
    fn name(&self) -> &'static str;

    /// Raw payloads pass through untouched; structured payloads are encoded.
    fn encode(&self, payload: &Payload) -> Result<Bytes>;

    /// Encode an application error. Must not fail: this is the fallback for
    /// payloads that could not be serialized in the first place.
    fn error_payload(&self, err: &AppError) -> Bytes;

    /// Recover the application error from an error payload, however mangled.
    fn decode_app_error(&self, data: &[u8]) -> AppError;
}

pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Raw(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }

    fn error_payload(&self, err: &AppError) -> Bytes {
        match serde_json::to_vec(err) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => Bytes::from_static(br#"{"code":"RAL-000","msg":"unserializable error"}"#),
        }
    }

    fn decode_app_error(&self, data: &[u8]) -> AppError {
        serde_json::from_slice(data)
            .unwrap_or_else(|_| AppError::unknown(String::from_utf8_lossy(data)))
    }
}
