// Per-connection client-session agent.
//
// One agent owns everything a single connected client needs on the server
// side: the transport write half, the session handle, the liveness timer, and
// the two-stage outbound pipeline (`order` queue -> ordering stage -> `send`
// queue -> writer). Producers on any task enqueue through `send`; only the
// ordering stage touches the push-delay state and only the writer drains the
// send queue to the socket.
//
// Lifecycle: close() fires exactly once. It flips the state, signals every
// worker through its own watch channel plus the shared die signal, runs the
// session close callbacks, and shuts the transport down. Workers re-invoke
// close() on exit, which is a no-op by then.

mod heartbeat;
mod ordering;
mod reader;
mod writer;

#[cfg(test)]
mod tests;

pub use reader::run_read_loop;

use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use rally_session::{
    AppError, NetworkEntity, Payload, PropagateCtx, ROUTE_KEY, Session, SessionError,
    SessionRegistry,
};
use rally_wire::{Message, MessageCodec, MessageKind, PacketKind, RouteDictionary, StaticFrames, packet};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};

use crate::config::GatewayConfig;
use crate::metrics;
use crate::serialize::Serializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Start = 0,
    Handshake = 1,
    Working = 2,
    Closed = 3,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Start,
            1 => Self::Handshake,
            2 => Self::Working,
            _ => Self::Closed,
        }
    }
}

/// What a producer hands to `send` before serialization.
pub(crate) struct PendingMessage {
    pub ctx: PropagateCtx,
    pub kind: MessageKind,
    pub route: String,
    pub mid: u32,
    pub payload: Payload,
    pub error: bool,
}

/// A fully encoded outbound packet travelling through the pipeline.
/// `message` is absent for pre-encoded frames (heartbeats) that skip the
/// ordering stage. Immutable after construction.
pub(crate) struct OutboundItem {
    pub ctx: PropagateCtx,
    pub data: Bytes,
    pub message: Option<Message>,
    pub send_error: Option<AppError>,
}

type ConnSink = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ClientAgent {
    session: Session,
    registry: SessionRegistry,
    state: AtomicU8,
    // Unix seconds of the last observed inbound activity.
    last_at: AtomicI64,
    heartbeat_interval: Duration,
    max_packet_bytes: usize,
    serializer: Arc<dyn Serializer>,
    codec: MessageCodec,
    frames: Arc<StaticFrames>,
    // Write half of the transport. The writer task is the only long-lived
    // writer; the handshake response and the kick fast path take the same
    // lock, so at most one write is ever in flight.
    conn: Arc<Mutex<ConnSink>>,
    remote_addr: Option<SocketAddr>,
    // Highest request id whose response bytes have reached the transport.
    // Written by the writer, read by the kick gate.
    answered_mid: AtomicU32,
    order_tx: mpsc::Sender<OutboundItem>,
    order_rx: StdMutex<Option<mpsc::Receiver<OutboundItem>>>,
    send_tx: mpsc::Sender<OutboundItem>,
    send_rx: StdMutex<Option<mpsc::Receiver<OutboundItem>>>,
    die_tx: watch::Sender<bool>,
    stop_writer: watch::Sender<bool>,
    stop_order: watch::Sender<bool>,
    stop_heartbeat: watch::Sender<bool>,
    close_lock: StdMutex<()>,
}

/// Everything shared across connections: serializer, codec, pre-encoded
/// frames, tunables, and the session registry.
pub struct AgentFactory {
    serializer: Arc<dyn Serializer>,
    codec: MessageCodec,
    frames: Arc<StaticFrames>,
    heartbeat_interval: Duration,
    buffer_size: usize,
    max_packet_bytes: usize,
    registry: SessionRegistry,
}

impl AgentFactory {
    pub fn new(
        serializer: Arc<dyn Serializer>,
        dict: RouteDictionary,
        heartbeat_interval: Duration,
        buffer_size: usize,
        data_compression: bool,
        max_packet_bytes: usize,
        registry: SessionRegistry,
    ) -> rally_wire::Result<Self> {
        // Built once here; a failure is a configuration error, not a
        // per-connection event.
        let frames = StaticFrames::build(
            heartbeat_interval,
            &dict,
            serializer.name(),
            data_compression,
        )?;
        Ok(Self {
            serializer,
            codec: MessageCodec::new(Arc::new(dict), data_compression),
            frames: Arc::new(frames),
            heartbeat_interval,
            buffer_size: buffer_size.max(1),
            max_packet_bytes,
            registry,
        })
    }

    pub fn from_config(
        config: &GatewayConfig,
        serializer: Arc<dyn Serializer>,
        registry: SessionRegistry,
    ) -> rally_wire::Result<Self> {
        Self::new(
            serializer,
            RouteDictionary::new(config.route_dictionary.clone()),
            config.heartbeat_interval(),
            config.messages_buffer_size,
            config.data_compression,
            config.max_packet_bytes,
            registry,
        )
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Build an agent over a duplex transport. Returns the agent plus the
    /// read half for the caller-run inbound reader.
    pub fn create<C>(
        &self,
        conn: C,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<ClientAgent>, Box<dyn AsyncRead + Send + Unpin>)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let (order_tx, order_rx) = mpsc::channel(self.buffer_size * 10);
        let (send_tx, send_rx) = mpsc::channel(self.buffer_size);
        let (die_tx, _) = watch::channel(false);
        let (stop_writer, _) = watch::channel(false);
        let (stop_order, _) = watch::channel(false);
        let (stop_heartbeat, _) = watch::channel(false);

        let registry = self.registry.clone();
        let agent = Arc::new_cyclic(|weak: &Weak<ClientAgent>| {
            // The session and the agent are joined by this construction-time
            // back-reference; the registry never owns the agent.
            let entity: Weak<dyn NetworkEntity> = weak.clone();
            let session = registry.new_session(entity);
            ClientAgent {
                session,
                registry: registry.clone(),
                state: AtomicU8::new(AgentState::Start as u8),
                last_at: AtomicI64::new(unix_now()),
                heartbeat_interval: self.heartbeat_interval,
                max_packet_bytes: self.max_packet_bytes,
                serializer: Arc::clone(&self.serializer),
                codec: self.codec.clone(),
                frames: Arc::clone(&self.frames),
                conn: Arc::new(Mutex::new(Box::new(write_half) as ConnSink)),
                remote_addr,
                answered_mid: AtomicU32::new(0),
                order_tx,
                order_rx: StdMutex::new(Some(order_rx)),
                send_tx,
                send_rx: StdMutex::new(Some(send_rx)),
                die_tx,
                stop_writer,
                stop_order,
                stop_heartbeat,
                close_lock: StdMutex::new(()),
            }
        });
        metrics::report_connected_clients(self.registry.count());
        (agent, Box::new(read_half))
    }
}

impl ClientAgent {
    pub fn session(&self) -> Session {
        self.session.clone()
    }

    pub fn status(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// States only advance; a late transition can never reopen a closed
    /// agent.
    pub fn set_status(&self, state: AgentState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Record inbound activity now. Called by the reader for every frame.
    pub fn set_last_at(&self) {
        self.last_at.store(unix_now(), Ordering::Release);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn answered_mid(&self) -> u32 {
        self.answered_mid.load(Ordering::Acquire)
    }

    /// Writer only, after a response write succeeds. Never moves backwards:
    /// a late response with a smaller id must not look unanswered again.
    fn record_answered(&self, id: u32) {
        self.answered_mid.fetch_max(id, Ordering::AcqRel);
    }

    /// Start the writer, ordering, and heartbeat workers, then block until
    /// the agent dies. The inbound reader is started by the caller.
    pub async fn handle(self: &Arc<Self>) {
        let Some(send_rx) = self.send_rx.lock().expect("queue lock").take() else {
            // handle() already ran for this agent.
            return;
        };
        let order_rx = self
            .order_rx
            .lock()
            .expect("queue lock")
            .take()
            .expect("order receiver present whenever send receiver is");

        tokio::spawn(writer::run_writer_loop(
            Arc::clone(self),
            send_rx,
            self.stop_writer.subscribe(),
        ));
        tokio::spawn(ordering::run_order_loop(
            Arc::clone(self),
            order_rx,
            self.stop_order.subscribe(),
        ));
        tokio::spawn(heartbeat::run_heartbeat_loop(
            Arc::clone(self),
            self.stop_heartbeat.subscribe(),
        ));

        let mut die = self.die_tx.subscribe();
        let _ = die.wait_for(|dead| *dead).await;
        // Re-fires harmlessly when a worker already closed the agent.
        let _ = self.close().await;
        tracing::debug!(
            session_id = self.session.id(),
            uid = %self.session.uid(),
            "agent handle exited"
        );
    }

    /// Server-initiated message. The gating request id comes from the
    /// context's relation entry for this session's user.
    pub async fn push(
        &self,
        ctx: PropagateCtx,
        route: &str,
        payload: Payload,
    ) -> Result<(), SessionError> {
        if self.status() == AgentState::Closed {
            return Err(SessionError::BrokenPipe);
        }
        let mid = ctx.relation_msg_id(&self.session.uid());
        self.send(PendingMessage {
            ctx,
            kind: MessageKind::Push,
            route: route.to_string(),
            mid,
            payload,
            error: false,
        })
        .await
    }

    /// Response to the client request identified by `mid`.
    pub async fn respond_to_message(
        &self,
        ctx: PropagateCtx,
        mid: u32,
        payload: Payload,
        is_error: bool,
    ) -> Result<(), SessionError> {
        if self.status() == AgentState::Closed {
            return Err(SessionError::BrokenPipe);
        }
        if mid == 0 {
            return Err(SessionError::SessionOnNotify);
        }
        let route = ctx.value(ROUTE_KEY).unwrap_or_default().to_string();
        self.send(PendingMessage {
            ctx,
            kind: MessageKind::Response,
            route,
            mid,
            payload,
            error: is_error,
        })
        .await
    }

    /// Answer a request with an application error through the session, so
    /// the error travels the same path a handler response would.
    pub async fn answer_with_error(&self, ctx: PropagateCtx, mid: u32, err: AppError) {
        ctx.finish_span(Some(&err));
        let payload = Payload::Raw(self.serializer.error_payload(&err));
        if let Err(err) = self
            .session
            .respond_to_message(ctx, mid, payload, true)
            .await
        {
            tracing::error!(error = %err, "failed to answer session with an error");
        }
    }

    /// Send a kick packet. When the context carries a gating request id the
    /// kick is held back until the response for that id has been written;
    /// otherwise it bypasses the pipeline and goes straight out.
    pub async fn kick(&self, ctx: PropagateCtx) -> Result<(), SessionError> {
        let mid = ctx.relation_msg_id(&self.session.uid());
        if self.status() == AgentState::Closed {
            tracing::debug!(
                session_id = self.session.id(),
                uid = %self.session.uid(),
                "cannot kick, session has closed"
            );
            return Ok(());
        }

        if mid > 0 {
            let mut tick = tokio::time::interval(Duration::from_millis(1));
            while self.answered_mid() < mid {
                tick.tick().await;
            }
        }

        let frame = packet::encode(PacketKind::Kick, &[]).map_err(|err| {
            tracing::error!(error = %err, "encode kick packet");
            SessionError::BrokenPipe
        })?;
        let mut conn = self.conn.lock().await;
        conn.write_all(&frame).await.map_err(|err| {
            tracing::error!(error = %err, "write kick packet");
            SessionError::BrokenPipe
        })
    }

    /// Write the pre-encoded handshake response. Legitimate direct write:
    /// it happens before any other outbound traffic exists, and it takes the
    /// same lock as the writer in any case.
    pub async fn send_handshake_response(&self) -> std::io::Result<()> {
        let mut conn = self.conn.lock().await;
        conn.write_all(&self.frames.handshake_response).await
    }

    /// Close the agent exactly once: flip the state, signal every worker,
    /// run close callbacks, drop the session from the registry, and shut the
    /// transport down. Later calls return `CloseClosedSession`.
    pub async fn close(&self) -> Result<(), SessionError> {
        {
            let _guard = self.close_lock.lock().expect("close lock");
            if self.status() == AgentState::Closed {
                return Err(SessionError::CloseClosedSession);
            }
            self.set_status(AgentState::Closed);
            tracing::debug!(
                session_id = self.session.id(),
                uid = %self.session.uid(),
                remote = ?self.remote_addr,
                "session closed"
            );

            let _ = self.stop_writer.send(true);
            let _ = self.stop_order.send(true);
            let _ = self.stop_heartbeat.send(true);
            let _ = self.die_tx.send(true);

            self.on_session_closed();
            self.registry.remove(&self.session);
            metrics::report_connected_clients(self.registry.count());
        }

        // A contended write lock means the writer is mid-write (possibly
        // wedged on a dead peer); it aborts on the die signal and performs
        // the shutdown itself on the way out.
        match self.conn.try_lock() {
            Ok(mut conn) => {
                if let Err(err) = conn.shutdown().await {
                    tracing::debug!(error = %err, "transport shutdown");
                }
            }
            Err(_) => {
                tracing::debug!(
                    session_id = self.session.id(),
                    "transport busy at close, writer will shut it down"
                );
            }
        }
        Ok(())
    }

    /// Session-level callbacks first, then pool-level ones. Each invocation
    /// is shielded so a panicking callback cannot prevent transport closure.
    fn on_session_closed(&self) {
        for callback in self.session.take_close_callbacks() {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::error!(
                    session_id = self.session.id(),
                    "session close callback panicked"
                );
            }
        }
        for callback in self.registry.close_callbacks() {
            if catch_unwind(AssertUnwindSafe(|| callback(&self.session))).is_err() {
                tracing::error!(
                    session_id = self.session.id(),
                    "pool close callback panicked"
                );
            }
        }
    }

    /// Common producer path: shed when the send queue is saturated,
    /// serialize (substituting an error payload rather than dropping the
    /// slot), encode, and hand off to the ordering stage.
    pub(crate) async fn send(&self, pending: PendingMessage) -> Result<(), SessionError> {
        if self.status() == AgentState::Closed {
            return Err(SessionError::BrokenPipe);
        }

        let spare = self.send_tx.capacity();
        metrics::report_send_queue_spare(spare);
        if spare == 0 {
            // A wedged writer means a dead or hopeless peer: shed the whole
            // connection. The message is lost but the producer sees success.
            tracing::warn!(
                session_id = self.session.id(),
                uid = %self.session.uid(),
                "send queue saturated, closing busy agent"
            );
            let _ = self.close().await;
            return Ok(());
        }

        let item = match catch_unwind(AssertUnwindSafe(|| self.encode_pending(pending))) {
            Ok(item) => item?,
            Err(_) => return Err(SessionError::BrokenPipe),
        };

        // The order queue is never closed by producers, so pair the send
        // with the die signal to avoid blocking on a dying agent.
        let mut die = self.die_tx.subscribe();
        tokio::select! {
            result = self.order_tx.send(item) => {
                let _ = result;
            }
            _ = die.wait_for(|dead| *dead) => {}
        }
        Ok(())
    }

    fn encode_pending(&self, pending: PendingMessage) -> Result<OutboundItem, SessionError> {
        let PendingMessage {
            ctx,
            kind,
            route,
            mid,
            payload,
            error,
        } = pending;

        let (data, error) = match self.serializer.encode(&payload) {
            Ok(data) => (data, error),
            Err(err) => {
                tracing::warn!(error = %err, route = %route, "payload serialization failed");
                (
                    self.serializer.error_payload(&AppError::unknown(err)),
                    true,
                )
            }
        };

        let message = Message {
            kind,
            id: mid,
            route,
            data,
            error,
        };
        let body = self.codec.encode(&message).map_err(|err| {
            tracing::error!(error = %err, "encode outbound message");
            SessionError::BrokenPipe
        })?;
        let frame = packet::encode(PacketKind::Data, &body).map_err(|err| {
            tracing::error!(error = %err, "encode outbound packet");
            SessionError::BrokenPipe
        })?;

        // Keep the application error alongside the bytes so the writer can
        // label its timing report even though the write itself succeeds.
        let send_error = message
            .error
            .then(|| self.serializer.decode_app_error(&message.data));

        Ok(OutboundItem {
            ctx,
            data: frame,
            message: Some(message),
            send_error,
        })
    }
}

impl fmt::Debug for ClientAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAgent")
            .field("session_id", &self.session.id())
            .field("state", &self.status())
            .field("remote", &self.remote_addr)
            .finish()
    }
}

#[async_trait]
impl NetworkEntity for ClientAgent {
    async fn push(
        &self,
        ctx: PropagateCtx,
        route: &str,
        payload: Payload,
    ) -> Result<(), SessionError> {
        ClientAgent::push(self, ctx, route, payload).await
    }

    async fn respond_to_message(
        &self,
        ctx: PropagateCtx,
        mid: u32,
        payload: Payload,
        is_error: bool,
    ) -> Result<(), SessionError> {
        ClientAgent::respond_to_message(self, ctx, mid, payload, is_error).await
    }

    async fn kick(&self, ctx: PropagateCtx) -> Result<(), SessionError> {
        ClientAgent::kick(self, ctx).await
    }

    async fn close_entity(&self) -> Result<(), SessionError> {
        self.close().await
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn send_request(
        &self,
        _ctx: PropagateCtx,
        _server_id: &str,
        _route: &str,
        _payload: Payload,
    ) -> Result<Bytes, SessionError> {
        Err(SessionError::NotImplemented)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
