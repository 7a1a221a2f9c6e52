// Explicit propagation envelope.
//
// Instead of ambient task-local values, every call into the session layer
// carries a `PropagateCtx` as a first-class parameter: a string-keyed bag of
// propagated values, the per-user relation table that ties server-initiated
// messages back to the client request they belong to, and the tracing span +
// start instant for the request that produced the call.
use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Span;

// Propagation keys are enumerated here; nothing else may invent keys.
pub const ROUTE_KEY: &str = "route";
pub const PEER_ID_KEY: &str = "peer.id";
pub const REQUEST_ID_KEY: &str = "request.id";

/// Per-user relation data: which session and which client request id a
/// server-side call is acting on behalf of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationData {
    pub sess_id: i64,
    pub msg_id: u32,
}

/// The serializable portion of the envelope, shipped across server hops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Propagated {
    values: HashMap<String, String>,
    relations: HashMap<String, RelationData>,
}

#[derive(Debug, Clone)]
pub struct PropagateCtx {
    propagated: Propagated,
    span: Span,
    started: Option<Instant>,
}

impl Default for PropagateCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagateCtx {
    pub fn new() -> Self {
        Self {
            propagated: Propagated::default(),
            span: Span::none(),
            started: None,
        }
    }

    /// Envelope for an inbound client request: route key set, a request span,
    /// and the start instant used for timing metrics.
    pub fn for_request(route: &str, span: Span) -> Self {
        let mut ctx = Self {
            propagated: Propagated::default(),
            span,
            started: Some(Instant::now()),
        };
        ctx.set_value(ROUTE_KEY, route);
        ctx
    }

    pub fn set_value(&mut self, key: &str, value: impl Into<String>) {
        self.propagated.values.insert(key.to_string(), value.into());
    }

    pub fn with_value(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_value(key, value);
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.propagated.values.get(key).map(String::as_str)
    }

    pub fn route(&self) -> Option<&str> {
        self.value(ROUTE_KEY)
    }

    pub fn add_relation(&mut self, uid: &str, data: RelationData) {
        self.propagated.relations.insert(uid.to_string(), data);
    }

    pub fn with_relation(mut self, uid: &str, data: RelationData) -> Self {
        self.add_relation(uid, data);
        self
    }

    /// Relation entry for `uid`; zeroed when absent.
    pub fn relation(&self, uid: &str) -> RelationData {
        self.propagated.relations.get(uid).copied().unwrap_or_default()
    }

    pub fn relation_msg_id(&self, uid: &str) -> u32 {
        self.relation(uid).msg_id
    }

    pub fn relation_sess_id(&self, uid: &str) -> i64 {
        self.relation(uid).sess_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn started(&self) -> Option<Instant> {
        self.started
    }

    /// Record the outcome of the work this envelope was attached to inside
    /// its span. This is the last event of the span's life on this server.
    pub fn finish_span(&self, err: Option<&dyn std::fmt::Display>) {
        let _entered = self.span.enter();
        match err {
            Some(err) => tracing::debug!(error = %err, "finished with error"),
            None => tracing::trace!("finished"),
        }
    }

    /// Encode the serializable portion for cross-server propagation.
    /// Returns `None` when there is nothing to propagate.
    pub fn encode(&self) -> Option<Vec<u8>> {
        if self.propagated.values.is_empty() && self.propagated.relations.is_empty() {
            return None;
        }
        serde_json::to_vec(&self.propagated).ok()
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        let propagated: Propagated = serde_json::from_slice(data)?;
        Ok(Self {
            propagated,
            span: Span::none(),
            started: None,
        })
    }
}
