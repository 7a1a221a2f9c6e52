// Session-layer domain objects shared between the gateway and handler code:
// the identity-bearing session handle, the registry that tracks live
// sessions, the network-entity contract the per-connection agent implements,
// and the explicit propagation envelope passed through every call.

mod context;
mod entity;
mod error;
mod session;

pub use context::{
    PropagateCtx, RelationData, PEER_ID_KEY, REQUEST_ID_KEY, ROUTE_KEY,
};
pub use entity::{NetworkEntity, Payload};
pub use error::{AppError, SessionError};
pub use session::{Session, SessionRegistry};

pub type Result<T> = std::result::Result<T, SessionError>;
