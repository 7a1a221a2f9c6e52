use async_trait::async_trait;
use bytes::Bytes;

use crate::{PropagateCtx, Result};

/// Outbound payload as handler code hands it over: either pre-serialized
/// bytes that must pass through untouched, or a JSON value for the
/// serializer seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Bytes),
    Json(serde_json::Value),
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Raw(bytes)
    }
}

/// Low-level network instance a session delegates to. The per-connection
/// client agent is the production implementation; tests substitute
/// recording fakes.
#[async_trait]
pub trait NetworkEntity: Send + Sync {
    /// Server-initiated message; the gating request id (if any) comes from
    /// the context's relation table.
    async fn push(&self, ctx: PropagateCtx, route: &str, payload: Payload) -> Result<()>;

    /// Response to the client request identified by `mid`.
    async fn respond_to_message(
        &self,
        ctx: PropagateCtx,
        mid: u32,
        payload: Payload,
        is_error: bool,
    ) -> Result<()>;

    /// Forced-disconnect signal to the client.
    async fn kick(&self, ctx: PropagateCtx) -> Result<()>;

    async fn close_entity(&self) -> Result<()>;

    fn remote_addr(&self) -> Option<std::net::SocketAddr>;

    /// Inter-server request. Client agents cannot route these.
    async fn send_request(
        &self,
        ctx: PropagateCtx,
        server_id: &str,
        route: &str,
        payload: Payload,
    ) -> Result<Bytes>;
}
