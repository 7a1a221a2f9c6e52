use serde::{Deserialize, Serialize};

/// Errors surfaced by sessions and their network entity.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("agent is closed and no longer accepts messages")]
    BrokenPipe,
    #[error("close called on an already closed session")]
    CloseClosedSession,
    #[error("notify messages carry no id and cannot be responded to")]
    SessionOnNotify,
    #[error("inter-server requests are not implemented on client agents")]
    NotImplemented,
    #[error("session already has a uid bound")]
    AlreadyBound,
    #[error("uid must not be empty")]
    IllegalUid,
}

/// Coded application error carried in error-flagged response payloads.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {msg}")]
pub struct AppError {
    pub code: String,
    pub msg: String,
}

impl AppError {
    pub const UNKNOWN_CODE: &'static str = "RAL-000";
    pub const ROUTE_NOT_FOUND_CODE: &'static str = "RAL-404";

    pub fn new(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            msg: msg.into(),
        }
    }

    /// Wrap an arbitrary failure under the unknown-error code.
    pub fn unknown(err: impl std::fmt::Display) -> Self {
        Self::new(Self::UNKNOWN_CODE, err.to_string())
    }

    pub fn route_not_found(route: &str) -> Self {
        Self::new(Self::ROUTE_NOT_FOUND_CODE, format!("route not found: {route}"))
    }
}
