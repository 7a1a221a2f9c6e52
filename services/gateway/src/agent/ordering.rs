// Ordering stage: the single consumer of the order queue and the only code
// that touches the push-delay state.
//
// The contract it enforces: a push tied to request id M, enqueued before the
// response to M, is delivered after that response. Pushes produced by
// asynchronous workers routinely arrive out of order on the producer side;
// this loop is the one chokepoint where the wire order gets fixed up.
//
// Policy, in order:
//   - a push whose own id is ahead of the last answered request starts (or
//     moves) the gate and is deferred under its id;
//   - while any gate is active, every push is deferred under the gate, even
//     one whose own id was already answered;
//   - everything else forwards immediately;
//   - a response advances the answered id, releases its own bucket in
//     insertion order, then sweeps the remaining buckets in ascending key
//     order releasing every bucket older than the answered id. Buckets at or
//     ahead of it stay parked.
//
// All three pieces of state live on this task's stack, so none of it needs
// locks. The answered id never decreases; a late response with a smaller id
// forwards immediately and releases nothing extra.
use std::collections::HashMap;
use std::sync::Arc;

use rally_wire::MessageKind;
use tokio::sync::{mpsc, watch};

use super::{ClientAgent, OutboundItem};

pub(super) async fn run_order_loop(
    agent: Arc<ClientAgent>,
    mut order_rx: mpsc::Receiver<OutboundItem>,
    mut stop: watch::Receiver<bool>,
) {
    let mut die = agent.die_tx.subscribe();
    let mut cur_msg_id: u32 = 0;
    let mut push_delay: HashMap<u32, Vec<OutboundItem>> = HashMap::new();
    let mut push_delay_mid: u32 = 0;

    loop {
        tokio::select! {
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            item = order_rx.recv() => {
                let Some(item) = item else { break };
                let (kind, id) = match &item.message {
                    Some(message) => (Some(message.kind), message.id),
                    None => (None, 0),
                };

                if kind == Some(MessageKind::Push) && id > 0 && id > cur_msg_id {
                    tracing::debug!(
                        session_id = agent.session.id(),
                        relation_id = id,
                        "deferring push behind its response"
                    );
                    push_delay.entry(id).or_default().push(item);
                    push_delay_mid = id;
                    continue;
                }

                if kind == Some(MessageKind::Push) && push_delay_mid > 0 {
                    // Any active gate holds back every push, including ones
                    // whose own id was already answered.
                    push_delay.entry(push_delay_mid).or_default().push(item);
                    continue;
                }

                forward(&agent, &mut die, item).await;

                if kind == Some(MessageKind::Response) {
                    cur_msg_id = cur_msg_id.max(id);

                    if let Some(parked) = push_delay.remove(&id) {
                        tracing::debug!(
                            session_id = agent.session.id(),
                            relation_id = id,
                            released = parked.len(),
                            "releasing pushes gated on this response"
                        );
                        for item in parked {
                            forward(&agent, &mut die, item).await;
                        }
                        push_delay_mid = 0;
                    }

                    if !push_delay.is_empty() {
                        let mut keys: Vec<u32> = push_delay.keys().copied().collect();
                        keys.sort_unstable();
                        for key in keys {
                            if key >= cur_msg_id {
                                break;
                            }
                            if let Some(parked) = push_delay.remove(&key) {
                                tracing::debug!(
                                    session_id = agent.session.id(),
                                    relation_id = key,
                                    released = parked.len(),
                                    "releasing pushes whose response already went out"
                                );
                                for item in parked {
                                    forward(&agent, &mut die, item).await;
                                }
                                push_delay_mid = 0;
                            }
                        }
                    }
                }
            }
        }
    }
    let _ = agent.close().await;
}

/// Hand one item to the writer. Paired with the die signal so a dying agent
/// never wedges this loop on a full send queue.
async fn forward(agent: &ClientAgent, die: &mut watch::Receiver<bool>, item: OutboundItem) {
    let summary = item
        .message
        .as_ref()
        .map(|message| (message.kind, message.id, message.route.clone()));
    tokio::select! {
        result = agent.send_tx.send(item) => {
            let _ = result;
        }
        _ = async { let _ = die.wait_for(|dead| *dead).await; } => {}
    }
    if let Some((kind, id, route)) = summary {
        tracing::trace!(
            session_id = agent.session.id(),
            kind = ?kind,
            id,
            route = %route,
            "forwarded to writer"
        );
    }
}
