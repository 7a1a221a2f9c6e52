// Heartbeat monitor: one tick per heartbeat interval.
//
// Each tick checks liveness first (no inbound activity for more than twice
// the interval kills the connection) and then emits the pre-encoded
// heartbeat frame through the normal send queue, keeping it serialized with
// user traffic instead of racing the writer for the socket.
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rally_session::PropagateCtx;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};

use crate::metrics;

use super::{ClientAgent, OutboundItem};

pub(super) async fn run_heartbeat_loop(agent: Arc<ClientAgent>, mut stop: watch::Receiver<bool>) {
    let period = agent.heartbeat_interval;
    // First tick after one full period, not immediately.
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut die = agent.die_tx.subscribe();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let last_at = agent.last_at.load(Ordering::Acquire);
                let deadline = super::unix_now() - 2 * period.as_secs() as i64;
                if last_at < deadline {
                    tracing::debug!(
                        session_id = agent.session.id(),
                        last_at,
                        deadline,
                        "session heartbeat timeout"
                    );
                    metrics::report_heartbeat_timeout();
                    break;
                }

                let frame = OutboundItem {
                    ctx: PropagateCtx::new(),
                    data: agent.frames.heartbeat.clone(),
                    message: None,
                    send_error: None,
                };
                // The send queue is never closed by producers; pair the send
                // with the shutdown signals so a dying agent cannot wedge us.
                tokio::select! {
                    result = agent.send_tx.send(frame) => {
                        let _ = result;
                    }
                    _ = async { let _ = die.wait_for(|dead| *dead).await; } => break,
                    _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
                }
            }
            _ = async { let _ = die.wait_for(|dead| *dead).await; } => break,
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
        }
    }
    let _ = agent.close().await;
}
