// Gateway service: accepts client connections and runs one session agent per
// connection. The agent owns the framing codec, the liveness timer, the
// ordered outbound pipeline, and the session lifecycle; handler code plugs in
// behind the `Router` seam.

pub mod agent;
pub mod config;
pub mod metrics;
pub mod observability;
pub mod router;
pub mod serialize;
pub mod server;
