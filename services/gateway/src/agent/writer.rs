// Writer loop: the single drain of the send queue.
//
// Serializing all writes in one task keeps frames from interleaving on the
// byte stream and gives backpressure a single place to appear (queue depth).
// A write failure means the peer is gone: finish the item's span with the
// error, record the timing, and exit so the deferred close tears the
// connection down.
use std::sync::Arc;

use rally_wire::MessageKind;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

use crate::metrics;

use super::{ClientAgent, OutboundItem};

pub(super) async fn run_writer_loop(
    agent: Arc<ClientAgent>,
    mut send_rx: mpsc::Receiver<OutboundItem>,
    mut stop: watch::Receiver<bool>,
) {
    let mut die = agent.die_tx.subscribe();
    loop {
        tokio::select! {
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            item = send_rx.recv() => {
                let Some(item) = item else { break };
                let result = tokio::select! {
                    result = async {
                        let mut conn = agent.conn.lock().await;
                        conn.write_all(&item.data).await
                    } => result,
                    // A close while this write is wedged must not strand the
                    // agent: abort the write and fall through to shutdown.
                    _ = async { let _ = die.wait_for(|dead| *dead).await; } => break,
                };
                match result {
                    Err(err) => {
                        item.ctx.finish_span(Some(&err));
                        metrics::report_timing_from_ctx(&item.ctx, Some(&err));
                        metrics::report_write("error");
                        tracing::error!(
                            session_id = agent.session.id(),
                            error = %err,
                            "failed to write to connection"
                        );
                        break;
                    }
                    Ok(()) => {
                        if let Some(message) = &item.message {
                            // The kick gate waits on response bytes actually
                            // reaching the transport, not on queueing.
                            if message.kind == MessageKind::Response {
                                agent.record_answered(message.id);
                            }
                        }
                        item.ctx.finish_span(None);
                        // The write succeeded even for error responses; the
                        // attached error only labels the timing report.
                        metrics::report_timing_from_ctx(
                            &item.ctx,
                            item.send_error
                                .as_ref()
                                .map(|err| err as &dyn std::fmt::Display),
                        );
                        metrics::report_write("ok");
                    }
                }
            }
        }
    }
    // The writer owns the transport on the way out; close() skips shutdown
    // when it finds the write lock contended.
    {
        let mut conn = agent.conn.lock().await;
        let _ = conn.shutdown().await;
    }
    let _ = agent.close().await;
}
