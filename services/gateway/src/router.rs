// Handler routing seam. The gateway decodes request frames and hands them
// here; everything application-specific lives behind this trait.
use async_trait::async_trait;
use bytes::Bytes;
use rally_session::{AppError, Payload, PropagateCtx, Session};

#[async_trait]
pub trait Router: Send + Sync {
    /// Handle one decoded request (`mid > 0`) or notify (`mid == 0`).
    /// Handlers respond through the session; a returned error is answered to
    /// the client as an error-flagged response by the caller.
    async fn dispatch(
        &self,
        ctx: PropagateCtx,
        session: Session,
        route: &str,
        mid: u32,
        payload: Bytes,
    ) -> Result<(), AppError>;
}

/// Minimal built-in router: answers `sys.ping` and rejects everything else,
/// which keeps the gateway runnable end-to-end without an application.
pub struct PingRouter;

#[async_trait]
impl Router for PingRouter {
    async fn dispatch(
        &self,
        ctx: PropagateCtx,
        session: Session,
        route: &str,
        mid: u32,
        _payload: Bytes,
    ) -> Result<(), AppError> {
        if route != "sys.ping" {
            return Err(AppError::route_not_found(route));
        }
        if mid == 0 {
            // Ping as a notify has nothing to answer.
            return Ok(());
        }
        session
            .respond_to_message(
                ctx,
                mid,
                Payload::Json(serde_json::json!({"pong": true})),
                false,
            )
            .await
            .map_err(AppError::unknown)
    }
}
