// Tests cover the producer entry points, the ordering stage policy, the
// writer, heartbeat liveness, close fan-out, and the inbound reader, all
// over in-memory duplex transports.
use super::*;
use crate::router::{PingRouter, Router};
use crate::serialize::{JsonSerializer, SerializeError};
use anyhow::Result;
use rally_session::RelationData;
use rally_wire::{Packet, PacketDecoder};
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use tokio::io::{AsyncReadExt, AsyncWriteExt as _, DuplexStream};
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn test_factory(buffer: usize, heartbeat: Duration) -> AgentFactory {
    AgentFactory::new(
        Arc::new(JsonSerializer),
        RouteDictionary::new(Vec::<String>::new()),
        heartbeat,
        buffer,
        false,
        rally_wire::MAX_BODY_LEN,
        SessionRegistry::new(),
    )
    .expect("build factory")
}

fn wire_pair(
    factory: &AgentFactory,
    io_buffer: usize,
) -> (
    Arc<ClientAgent>,
    Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    DuplexStream,
) {
    let (server_io, client_io) = tokio::io::duplex(io_buffer);
    let (agent, reader) = factory.create(server_io, None);
    (agent, reader, client_io)
}

fn spawn_handle(agent: &Arc<ClientAgent>) {
    let agent = Arc::clone(agent);
    tokio::spawn(async move { agent.handle().await });
}

fn test_codec() -> MessageCodec {
    MessageCodec::new(Arc::new(RouteDictionary::new(Vec::<String>::new())), false)
}

fn relation_ctx(uid: &str, mid: u32) -> PropagateCtx {
    PropagateCtx::new().with_relation(
        uid,
        RelationData {
            sess_id: 1,
            msg_id: mid,
        },
    )
}

fn response_ctx(route: &str) -> PropagateCtx {
    PropagateCtx::new().with_value(ROUTE_KEY, route)
}

async fn read_packets(
    io: &mut DuplexStream,
    decoder: &mut PacketDecoder,
    count: usize,
) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut buf = [0u8; 8 * 1024];
    while packets.len() < count {
        let n = timeout(READ_TIMEOUT, io.read(&mut buf)).await??;
        anyhow::ensure!(n > 0, "transport closed after {} packets", packets.len());
        decoder.feed(&buf[..n]);
        while let Some(packet) = decoder.next()? {
            packets.push(packet);
        }
    }
    Ok(packets)
}

fn decode_data(packet: &Packet) -> Message {
    assert_eq!(packet.kind, PacketKind::Data);
    test_codec().decode(packet.body.clone()).expect("decode message")
}

#[tokio::test]
async fn response_then_gated_push_keeps_request_order() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 256 * 1024);
    agent.session().bind("player-1")?;
    spawn_handle(&agent);

    // The push is produced first but belongs to request 7, so it must wait
    // for the response to request 7.
    agent
        .push(
            relation_ctx("player-1", 7),
            "room.update",
            Payload::Json(json!({"x": 1})),
        )
        .await?;
    agent
        .respond_to_message(
            response_ctx("room.join"),
            7,
            Payload::Json(json!({"ok": true})),
            false,
        )
        .await?;

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 2).await?;
    let response = decode_data(&packets[0]);
    assert_eq!(response.kind, MessageKind::Response);
    assert_eq!(response.id, 7);
    assert!(!response.error);
    assert_eq!(response.data.as_ref(), b"{\"ok\":true}");
    let push = decode_data(&packets[1]);
    assert_eq!(push.kind, MessageKind::Push);
    assert_eq!(push.route, "room.update");

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn push_enqueued_after_response_follows_it() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 256 * 1024);
    agent.session().bind("player-1")?;
    spawn_handle(&agent);

    agent
        .respond_to_message(
            response_ctx("room.join"),
            7,
            Payload::Json(json!({"ok": true})),
            false,
        )
        .await?;
    agent
        .push(
            relation_ctx("player-1", 7),
            "room.update",
            Payload::Json(json!({"x": 2})),
        )
        .await?;

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 2).await?;
    assert_eq!(decode_data(&packets[0]).kind, MessageKind::Response);
    assert_eq!(decode_data(&packets[1]).kind, MessageKind::Push);

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn out_of_order_responses_release_stale_buckets() -> Result<()> {
    let factory = test_factory(16, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 256 * 1024);
    agent.session().bind("player-1")?;
    spawn_handle(&agent);

    // Pushes tied to requests 2, 5, and 3 arrive before any response.
    for (mid, route) in [(2, "p.two"), (5, "p.five"), (3, "p.three")] {
        agent
            .push(
                relation_ctx("player-1", mid),
                route,
                Payload::Json(json!({"mid": mid})),
            )
            .await?;
    }
    // Responses land newest-first.
    for mid in [5, 3, 2] {
        agent
            .respond_to_message(
                response_ctx("req"),
                mid,
                Payload::Json(json!({"mid": mid})),
                false,
            )
            .await?;
    }

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 6).await?;
    let messages: Vec<Message> = packets.iter().map(decode_data).collect();

    // Response 5 goes out first, releases its own bucket, then sweeps the
    // now-stale buckets 2 and 3 in ascending order. The late responses for
    // 3 and 2 pass straight through.
    assert_eq!(messages[0].kind, MessageKind::Response);
    assert_eq!(messages[0].id, 5);
    assert_eq!(messages[1].route, "p.five");
    assert_eq!(messages[2].route, "p.two");
    assert_eq!(messages[3].route, "p.three");
    assert_eq!((messages[4].kind, messages[4].id), (MessageKind::Response, 3));
    assert_eq!((messages[5].kind, messages[5].id), (MessageKind::Response, 2));

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn active_gate_defers_even_already_answered_pushes() -> Result<()> {
    let factory = test_factory(16, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 256 * 1024);
    agent.session().bind("player-1")?;
    spawn_handle(&agent);

    agent
        .respond_to_message(response_ctx("req"), 4, Payload::Json(json!({})), false)
        .await?;
    // Wait for the response to clear the pipeline so the gate state is
    // deterministic before the pushes arrive.
    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let first = read_packets(&mut client, &mut decoder, 1).await?;
    assert_eq!(decode_data(&first[0]).id, 4);

    // Push for 9 opens a gate; the push for the already-answered request 4
    // still joins that gate instead of going straight out.
    agent
        .push(relation_ctx("player-1", 9), "p.nine", Payload::Json(json!({})))
        .await?;
    agent
        .push(relation_ctx("player-1", 4), "p.four", Payload::Json(json!({})))
        .await?;
    agent
        .respond_to_message(response_ctx("req"), 9, Payload::Json(json!({})), false)
        .await?;

    let packets = read_packets(&mut client, &mut decoder, 3).await?;
    let messages: Vec<Message> = packets.iter().map(decode_data).collect();
    assert_eq!((messages[0].kind, messages[0].id), (MessageKind::Response, 9));
    assert_eq!(messages[1].route, "p.nine");
    assert_eq!(messages[2].route, "p.four");

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn respond_with_mid_zero_is_rejected_without_touching_the_pipeline() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, _client) = wire_pair(&factory, 64 * 1024);

    let err = agent
        .respond_to_message(response_ctx("req"), 0, Payload::Json(json!({})), false)
        .await
        .expect_err("notify has no response");
    assert_eq!(err, SessionError::SessionOnNotify);
    // Nothing was enqueued.
    assert_eq!(agent.order_tx.capacity(), agent.order_tx.max_capacity());

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_closes_fire_callbacks_exactly_once() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, _client) = wire_pair(&factory, 64 * 1024);

    let session_fires = Arc::new(AtomicUsize::new(0));
    let pool_fires = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = Arc::clone(&session_fires);
        agent.session().on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    let pool_counter = Arc::clone(&pool_fires);
    factory.registry().add_close_callback(move |_session| {
        pool_counter.fetch_add(1, Ordering::SeqCst);
    });
    // A panicking callback must not stop the teardown.
    agent.session().on_close(|| panic!("callback panic"));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let agent = Arc::clone(&agent);
        tasks.push(tokio::spawn(async move { agent.close().await }));
    }
    let mut ok = 0;
    let mut already_closed = 0;
    for task in tasks {
        match task.await? {
            Ok(()) => ok += 1,
            Err(SessionError::CloseClosedSession) => already_closed += 1,
            Err(other) => anyhow::bail!("unexpected close error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(already_closed, 7);
    assert_eq!(session_fires.load(Ordering::SeqCst), 3);
    assert_eq!(pool_fires.load(Ordering::SeqCst), 1);
    assert_eq!(factory.registry().count(), 0);
    Ok(())
}

#[tokio::test]
async fn sends_after_close_return_broken_pipe() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, _client) = wire_pair(&factory, 64 * 1024);
    agent.close().await?;

    let err = agent
        .push(PropagateCtx::new(), "room.update", Payload::Json(json!({})))
        .await
        .expect_err("agent is closed");
    assert_eq!(err, SessionError::BrokenPipe);
    let err = agent
        .respond_to_message(response_ctx("req"), 1, Payload::Json(json!({})), false)
        .await
        .expect_err("agent is closed");
    assert_eq!(err, SessionError::BrokenPipe);
    Ok(())
}

#[tokio::test]
async fn saturated_send_queue_sheds_the_connection() -> Result<()> {
    // One-slot send queue over a transport too small for a single frame, so
    // the writer wedges on the first push.
    let factory = test_factory(1, Duration::from_secs(60));
    let (agent, _reader, _client) = wire_pair(&factory, 64);
    spawn_handle(&agent);

    let big = Payload::Json(json!({"fill": "y".repeat(512)}));
    agent
        .push(PropagateCtx::new(), "room.update", big.clone())
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent
        .push(PropagateCtx::new(), "room.update", big.clone())
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Third producer observes zero spare capacity: the agent sheds itself
    // but the producer still sees success.
    agent
        .push(PropagateCtx::new(), "room.update", big.clone())
        .await?;
    assert_eq!(agent.status(), AgentState::Closed);

    let err = agent
        .push(PropagateCtx::new(), "room.update", big)
        .await
        .expect_err("closed after shedding");
    assert_eq!(err, SessionError::BrokenPipe);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_connection_times_out_within_one_tick() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(1));
    let (agent, _reader, _client) = wire_pair(&factory, 64 * 1024);
    spawn_handle(&agent);
    // Let the workers start their timers before moving the clock.
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Pretend the last inbound frame was long before two intervals ago.
    agent.last_at.store(unix_now() - 10, Ordering::Release);
    tokio::time::advance(Duration::from_millis(1100)).await;
    for _ in 0..100 {
        if agent.status() == AgentState::Closed {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(agent.status(), AgentState::Closed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn healthy_connection_receives_heartbeat_frames() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(1));
    let (agent, _reader, mut client) = wire_pair(&factory, 64 * 1024);
    spawn_handle(&agent);

    // last_at tracks the wall clock, which paused virtual time does not
    // move, so the connection stays healthy while ticks fire.
    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 3).await?;
    for packet in &packets {
        assert_eq!(packet.kind, PacketKind::Heartbeat);
        assert!(packet.body.is_empty());
    }

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn kick_waits_for_the_gating_response_bytes() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 256 * 1024);
    agent.session().bind("player-1")?;
    spawn_handle(&agent);

    let kicker = Arc::clone(&agent);
    let kick_task = tokio::spawn(async move {
        kicker.kick(relation_ctx("player-1", 4)).await
    });

    // The kick must not appear while request 4 is unanswered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!kick_task.is_finished());

    agent
        .push(relation_ctx("player-1", 4), "room.bye", Payload::Json(json!({})))
        .await?;
    agent
        .respond_to_message(response_ctx("req"), 4, Payload::Json(json!({})), false)
        .await?;
    kick_task.await??;

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 3).await?;
    let kinds: Vec<PacketKind> = packets.iter().map(|packet| packet.kind).collect();
    let response_at = kinds
        .iter()
        .position(|kind| *kind == PacketKind::Data)
        .expect("response on the wire");
    let kick_at = kinds
        .iter()
        .position(|kind| *kind == PacketKind::Kick)
        .expect("kick on the wire");
    assert!(response_at < kick_at, "kick before its gating response");

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn ungated_kick_bypasses_the_pipeline() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 64 * 1024);

    // No handle() here: the kick writes directly to the transport.
    agent.kick(PropagateCtx::new()).await?;
    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 1).await?;
    assert_eq!(packets[0].kind, PacketKind::Kick);

    let _ = agent.close().await;
    Ok(())
}

struct FailingSerializer;

impl crate::serialize::Serializer for FailingSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, _payload: &Payload) -> crate::serialize::Result<Bytes> {
        Err(SerializeError::Json(
            serde_json::from_str::<serde_json::Value>("").expect_err("empty input"),
        ))
    }

    fn error_payload(&self, err: &AppError) -> Bytes {
        JsonSerializer.error_payload(err)
    }

    fn decode_app_error(&self, data: &[u8]) -> AppError {
        JsonSerializer.decode_app_error(data)
    }
}

#[tokio::test]
async fn serializer_failure_substitutes_an_error_payload() -> Result<()> {
    let factory = AgentFactory::new(
        Arc::new(FailingSerializer),
        RouteDictionary::new(Vec::<String>::new()),
        Duration::from_secs(60),
        8,
        false,
        rally_wire::MAX_BODY_LEN,
        SessionRegistry::new(),
    )
    .expect("build factory");
    let (agent, _reader, mut client) = wire_pair(&factory, 64 * 1024);
    spawn_handle(&agent);

    // The producer keeps its slot and sees success.
    agent
        .push(PropagateCtx::new(), "room.update", Payload::Json(json!({"x": 1})))
        .await?;

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 1).await?;
    let message = decode_data(&packets[0]);
    assert!(message.error);
    let recovered = JsonSerializer.decode_app_error(&message.data);
    assert_eq!(recovered.code, AppError::UNKNOWN_CODE);

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn answer_with_error_travels_as_error_response() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 64 * 1024);
    spawn_handle(&agent);

    agent
        .answer_with_error(
            response_ctx("room.join"),
            9,
            AppError::new("RAL-401", "not allowed"),
        )
        .await;

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 1).await?;
    let message = decode_data(&packets[0]);
    assert_eq!(message.kind, MessageKind::Response);
    assert_eq!(message.id, 9);
    assert!(message.error);
    assert_eq!(
        JsonSerializer.decode_app_error(&message.data),
        AppError::new("RAL-401", "not allowed")
    );

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_never_corrupt_the_packet_stream() -> Result<()> {
    let factory = test_factory(64, Duration::from_secs(60));
    let (agent, _reader, mut client) = wire_pair(&factory, 1024 * 1024);
    spawn_handle(&agent);

    // Pipeline pushes from several tasks racing direct kick writes: every
    // byte on the wire must still parse as a clean packet sequence.
    let mut producers = Vec::new();
    for task_id in 0..4 {
        let agent = Arc::clone(&agent);
        producers.push(tokio::spawn(async move {
            for i in 0..25 {
                agent
                    .push(
                        PropagateCtx::new(),
                        &format!("load.{task_id}.{i}"),
                        Payload::Json(json!({"i": i})),
                    )
                    .await
                    .expect("push");
            }
        }));
    }
    for _ in 0..5 {
        agent.kick(PropagateCtx::new()).await?;
    }
    for producer in producers {
        producer.await?;
    }

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    let packets = read_packets(&mut client, &mut decoder, 105).await?;
    let pushes = packets
        .iter()
        .filter(|packet| packet.kind == PacketKind::Data)
        .count();
    let kicks = packets
        .iter()
        .filter(|packet| packet.kind == PacketKind::Kick)
        .count();
    assert_eq!(pushes, 100);
    assert_eq!(kicks, 5);
    for packet in packets.iter().filter(|packet| packet.kind == PacketKind::Data) {
        assert_eq!(decode_data(packet).kind, MessageKind::Push);
    }

    let _ = agent.close().await;
    Ok(())
}

async fn complete_handshake(
    client: &mut DuplexStream,
    decoder: &mut PacketDecoder,
) -> Result<()> {
    client
        .write_all(&packet::encode(PacketKind::Handshake, b"{}")?)
        .await?;
    let packets = read_packets(client, decoder, 1).await?;
    assert_eq!(packets[0].kind, PacketKind::Handshake);
    let body: serde_json::Value = serde_json::from_slice(&packets[0].body)?;
    assert_eq!(body["code"], 200);
    client
        .write_all(&packet::encode(PacketKind::HandshakeAck, &[])?)
        .await?;
    Ok(())
}

#[tokio::test]
async fn request_is_routed_and_answered() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, reader, mut client) = wire_pair(&factory, 256 * 1024);
    let router: Arc<dyn Router> = Arc::new(PingRouter);
    tokio::spawn(run_read_loop(Arc::clone(&agent), router, reader));
    spawn_handle(&agent);

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    complete_handshake(&mut client, &mut decoder).await?;

    let request = test_codec().encode(&Message {
        kind: MessageKind::Request,
        id: 7,
        route: "sys.ping".to_string(),
        data: Bytes::from_static(b"{}"),
        error: false,
    })?;
    client
        .write_all(&packet::encode(PacketKind::Data, &request)?)
        .await?;

    let packets = read_packets(&mut client, &mut decoder, 1).await?;
    let response = decode_data(&packets[0]);
    assert_eq!(response.kind, MessageKind::Response);
    assert_eq!(response.id, 7);
    assert!(!response.error);
    assert_eq!(response.data.as_ref(), b"{\"pong\":true}");

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn unknown_route_is_answered_with_an_error_response() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, reader, mut client) = wire_pair(&factory, 256 * 1024);
    let router: Arc<dyn Router> = Arc::new(PingRouter);
    tokio::spawn(run_read_loop(Arc::clone(&agent), router, reader));
    spawn_handle(&agent);

    let mut decoder = PacketDecoder::new(rally_wire::MAX_BODY_LEN);
    complete_handshake(&mut client, &mut decoder).await?;

    let request = test_codec().encode(&Message {
        kind: MessageKind::Request,
        id: 3,
        route: "no.such.route".to_string(),
        data: Bytes::from_static(b"{}"),
        error: false,
    })?;
    client
        .write_all(&packet::encode(PacketKind::Data, &request)?)
        .await?;

    let packets = read_packets(&mut client, &mut decoder, 1).await?;
    let response = decode_data(&packets[0]);
    assert_eq!(response.id, 3);
    assert!(response.error);
    assert_eq!(
        JsonSerializer.decode_app_error(&response.data).code,
        AppError::ROUTE_NOT_FOUND_CODE
    );

    let _ = agent.close().await;
    Ok(())
}

#[tokio::test]
async fn data_before_handshake_closes_the_connection() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, reader, mut client) = wire_pair(&factory, 64 * 1024);
    let router: Arc<dyn Router> = Arc::new(PingRouter);
    tokio::spawn(run_read_loop(Arc::clone(&agent), router, reader));
    spawn_handle(&agent);

    let request = test_codec().encode(&Message {
        kind: MessageKind::Request,
        id: 1,
        route: "sys.ping".to_string(),
        data: Bytes::from_static(b"{}"),
        error: false,
    })?;
    client
        .write_all(&packet::encode(PacketKind::Data, &request)?)
        .await?;

    // The reader rejects the early data packet and tears the agent down.
    let mut buf = [0u8; 64];
    let n = timeout(READ_TIMEOUT, client.read(&mut buf)).await??;
    assert_eq!(n, 0);
    assert_eq!(agent.status(), AgentState::Closed);
    Ok(())
}

#[tokio::test]
async fn inbound_frames_refresh_liveness() -> Result<()> {
    let factory = test_factory(8, Duration::from_secs(60));
    let (agent, reader, mut client) = wire_pair(&factory, 64 * 1024);
    let router: Arc<dyn Router> = Arc::new(PingRouter);
    tokio::spawn(run_read_loop(Arc::clone(&agent), router, reader));

    agent.last_at.store(0, Ordering::Release);
    client
        .write_all(&packet::encode(PacketKind::Heartbeat, &[])?)
        .await?;
    for _ in 0..100 {
        if agent.last_at.load(Ordering::Acquire) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(agent.last_at.load(Ordering::Acquire) > 0);

    let _ = agent.close().await;
    Ok(())
}
