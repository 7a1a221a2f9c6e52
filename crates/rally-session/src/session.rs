use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;

use crate::{NetworkEntity, Payload, PropagateCtx, Result, SessionError};

type OnCloseFn = Box<dyn FnOnce() + Send>;
type PoolCloseFn = Arc<dyn Fn(&Session) + Send + Sync>;

/// Identity-bearing handle for one connected client.
///
/// A session is created by the registry when its network entity (the
/// per-connection agent) is constructed, and the two stay joined by a weak
/// back-reference for the lifetime of the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: i64,
    uid: RwLock<String>,
    entity: Weak<dyn NetworkEntity>,
    on_close: Mutex<Vec<OnCloseFn>>,
    data: RwLock<HashMap<String, serde_json::Value>>,
    registry: Weak<RegistryInner>,
}

impl Session {
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Bound user id; empty until [`Session::bind`] succeeds.
    pub fn uid(&self) -> String {
        self.inner.uid.read().expect("uid lock").clone()
    }

    /// Bind the user id once and index the session by it.
    pub fn bind(&self, uid: &str) -> Result<()> {
        if uid.is_empty() {
            return Err(SessionError::IllegalUid);
        }
        {
            let mut current = self.inner.uid.write().expect("uid lock");
            if !current.is_empty() {
                return Err(SessionError::AlreadyBound);
            }
            *current = uid.to_string();
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry
                .by_uid
                .write()
                .expect("registry lock")
                .insert(uid.to_string(), self.clone());
        }
        Ok(())
    }

    /// Register a callback run when the connection closes. Each callback
    /// fires at most once.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner
            .on_close
            .lock()
            .expect("on_close lock")
            .push(Box::new(callback));
    }

    /// Drain the registered close callbacks for invocation. Draining (rather
    /// than iterating in place) is what makes re-entrant close attempts
    /// unable to fire a callback twice.
    pub fn take_close_callbacks(&self) -> Vec<OnCloseFn> {
        std::mem::take(&mut *self.inner.on_close.lock().expect("on_close lock"))
    }

    pub fn set_data(&self, key: &str, value: serde_json::Value) {
        self.inner
            .data
            .write()
            .expect("data lock")
            .insert(key.to_string(), value);
    }

    pub fn data(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.data.read().expect("data lock").get(key).cloned()
    }

    fn entity(&self) -> Result<Arc<dyn NetworkEntity>> {
        self.inner.entity.upgrade().ok_or(SessionError::BrokenPipe)
    }

    pub async fn push(&self, ctx: PropagateCtx, route: &str, payload: Payload) -> Result<()> {
        self.entity()?.push(ctx, route, payload).await
    }

    pub async fn respond_to_message(
        &self,
        ctx: PropagateCtx,
        mid: u32,
        payload: Payload,
        is_error: bool,
    ) -> Result<()> {
        self.entity()?
            .respond_to_message(ctx, mid, payload, is_error)
            .await
    }

    pub async fn kick(&self, ctx: PropagateCtx) -> Result<()> {
        self.entity()?.kick(ctx).await
    }

    pub async fn close(&self) -> Result<()> {
        self.entity()?.close_entity().await
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.entity().ok().and_then(|entity| entity.remote_addr())
    }

    pub async fn send_request(
        &self,
        ctx: PropagateCtx,
        server_id: &str,
        route: &str,
        payload: Payload,
    ) -> Result<Bytes> {
        self.entity()?
            .send_request(ctx, server_id, route, payload)
            .await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("uid", &self.uid())
            .finish()
    }
}

/// Tracks every live session by id and by bound uid, and owns the ordered
/// pool-level close callbacks invoked after a session's own callbacks.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicI64,
    by_id: RwLock<HashMap<i64, Session>>,
    by_uid: RwLock<HashMap<String, Session>>,
    on_close: RwLock<Vec<PoolCloseFn>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_session(&self, entity: Weak<dyn NetworkEntity>) -> Session {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                uid: RwLock::new(String::new()),
                entity,
                on_close: Mutex::new(Vec::new()),
                data: RwLock::new(HashMap::new()),
                registry: Arc::downgrade(&self.inner),
            }),
        };
        self.inner
            .by_id
            .write()
            .expect("registry lock")
            .insert(id, session.clone());
        session
    }

    pub fn count(&self) -> usize {
        self.inner.by_id.read().expect("registry lock").len()
    }

    pub fn session_by_id(&self, id: i64) -> Option<Session> {
        self.inner.by_id.read().expect("registry lock").get(&id).cloned()
    }

    pub fn session_by_uid(&self, uid: &str) -> Option<Session> {
        self.inner
            .by_uid
            .read()
            .expect("registry lock")
            .get(uid)
            .cloned()
    }

    pub fn remove(&self, session: &Session) {
        self.inner
            .by_id
            .write()
            .expect("registry lock")
            .remove(&session.id());
        let uid = session.uid();
        if !uid.is_empty() {
            let mut by_uid = self.inner.by_uid.write().expect("registry lock");
            if by_uid.get(&uid).map(Session::id) == Some(session.id()) {
                by_uid.remove(&uid);
            }
        }
    }

    pub fn add_close_callback(&self, callback: impl Fn(&Session) + Send + Sync + 'static) {
        self.inner
            .on_close
            .write()
            .expect("on_close lock")
            .push(Arc::new(callback));
    }

    pub fn close_callbacks(&self) -> Vec<PoolCloseFn> {
        self.inner.on_close.read().expect("on_close lock").clone()
    }
}
