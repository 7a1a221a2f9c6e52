// Inbound reader: caller-run loop over the transport read half.
//
// Its contract with the rest of the agent is small: refresh the liveness
// timestamp for every decoded frame, drive the handshake state machine, and
// hand decoded requests to the router. Protocol violations and read errors
// end the loop; the deferred close tears the connection down.
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use rally_session::{PropagateCtx, RelationData};
use rally_wire::{MessageKind, Packet, PacketDecoder, PacketKind};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::router::Router;

use super::{AgentState, ClientAgent};

pub async fn run_read_loop<R>(agent: Arc<ClientAgent>, router: Arc<dyn Router>, mut transport: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = PacketDecoder::new(agent.max_packet_bytes);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut die = agent.die_tx.subscribe();

    'outer: loop {
        let read = tokio::select! {
            read = transport.read_buf(&mut buf) => read,
            // A closed agent must not stay pinned behind a silent peer.
            _ = die.wait_for(|dead| *dead) => break,
        };
        match read {
            Ok(0) => {
                tracing::debug!(session_id = agent.session.id(), "peer closed the connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(
                    session_id = agent.session.id(),
                    error = %err,
                    "connection read failed"
                );
                break;
            }
        }
        decoder.feed(&buf);
        buf.clear();

        loop {
            match decoder.next() {
                Ok(Some(packet)) => {
                    if let Err(err) = process_packet(&agent, &router, packet).await {
                        tracing::warn!(
                            session_id = agent.session.id(),
                            error = %err,
                            "closing connection on inbound protocol error"
                        );
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        session_id = agent.session.id(),
                        error = %err,
                        "packet decode failed"
                    );
                    break 'outer;
                }
            }
        }
    }
    let _ = agent.close().await;
}

async fn process_packet(
    agent: &Arc<ClientAgent>,
    router: &Arc<dyn Router>,
    packet: Packet,
) -> anyhow::Result<()> {
    // Any well-formed inbound frame counts as liveness.
    agent.set_last_at();

    match packet.kind {
        PacketKind::Handshake => {
            agent
                .send_handshake_response()
                .await
                .context("send handshake response")?;
            agent.set_status(AgentState::Handshake);
            Ok(())
        }
        PacketKind::HandshakeAck => {
            agent.set_status(AgentState::Working);
            Ok(())
        }
        PacketKind::Heartbeat => Ok(()),
        PacketKind::Data => {
            if agent.status() != AgentState::Working {
                anyhow::bail!("data packet before handshake completed");
            }
            let message = agent.codec.decode(packet.body).context("decode message")?;
            match message.kind {
                MessageKind::Request | MessageKind::Notify => {
                    dispatch(agent, router, message).await;
                    Ok(())
                }
                other => anyhow::bail!("unexpected {other:?} message from client"),
            }
        }
        PacketKind::Kick => {
            // Kick is server-to-client only.
            tracing::warn!(
                session_id = agent.session.id(),
                "ignoring kick packet from client"
            );
            Ok(())
        }
    }
}

async fn dispatch(agent: &Arc<ClientAgent>, router: &Arc<dyn Router>, message: rally_wire::Message) {
    let mid = if message.kind == MessageKind::Request {
        message.id
    } else {
        0
    };
    let span = tracing::info_span!("handler", route = %message.route, mid);
    let session = agent.session();
    let mut ctx = PropagateCtx::for_request(&message.route, span);
    ctx.add_relation(
        &session.uid(),
        RelationData {
            sess_id: session.id(),
            msg_id: mid,
        },
    );

    if let Err(err) = router
        .dispatch(ctx.clone(), session, &message.route, mid, message.data)
        .await
    {
        if mid > 0 {
            agent.answer_with_error(ctx, mid, err).await;
        } else {
            tracing::debug!(error = %err, route = %message.route, "notify handler failed");
        }
    }
}
