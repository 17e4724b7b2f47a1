//! Sessions by destination.
//!
//! The pool maps [SessionKey]s to live sessions, aliases keys whose
//! addresses overlap onto one session, and bounds the number of sessions.
//! Sessions report back through a [PoolLink] when they stop being available
//! and when they close; the pool never removes a session on its own.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    io,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use tokio::sync::Notify;
use tracing::debug;

use crate::{
    config::{NetworkChangePolicy, PoolConf, SessionConf},
    error::SpdyError,
    key::{certificate_covers, HostPortPair, SessionKey},
    session::{spawn_pooled_session, SessionHandle, Transport},
    settings_cache::{MemorySettingsCache, SettingsCache},
};

/// What the pool needs from the network stack: name resolution and
/// connection establishment (including TLS and proxy tunnels).
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Transport: Transport;

    async fn resolve(&self, host_port: &HostPortPair) -> io::Result<Vec<SocketAddr>>;

    async fn connect(
        &self,
        key: &SessionKey,
        addrs: &[SocketAddr],
    ) -> io::Result<Connected<Self::Transport>>;
}

/// A fresh connection, ready for the session preface
pub struct Connected<T> {
    pub transport: T,
    pub is_secure: bool,
    /// Names the peer's certificate is valid for, consulted when aliasing
    pub certificate_names: Vec<String>,
}

type SessionId = u64;

struct PooledSession {
    handle: SessionHandle,
    /// Keys currently mapped to this session: its own and its aliases
    keys: Vec<SessionKey>,
    addrs: Vec<SocketAddr>,
    origin_key: SessionKey,
    is_secure: bool,
    certificate_names: Vec<String>,
}

#[derive(Default)]
struct PoolInner {
    sessions: BTreeMap<SessionId, PooledSession>,
    available: HashMap<SessionKey, SessionId>,
    by_addr: HashMap<SocketAddr, SessionId>,
    next_id: SessionId,

    /// Slots taken by connections being established
    connecting: usize,
    /// Callers waiting for a session slot
    stalled_waiters: usize,
    capacity: Rc<Notify>,
}

impl PoolInner {
    /// Forgets every key and address pointing at `id`
    fn unmap(&mut self, id: SessionId) {
        self.available.retain(|_, v| *v != id);
        self.by_addr.retain(|_, v| *v != id);
    }
}

/// A session's way back to the pool that created it
pub(crate) struct PoolLink {
    pool: Weak<RefCell<PoolInner>>,
    id: SessionId,
}

impl PoolLink {
    pub(crate) fn on_session_unavailable(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut pool = pool.borrow_mut();
        pool.unmap(self.id);
        if let Some(session) = pool.sessions.get_mut(&self.id) {
            session.keys.clear();
        }
    }

    /// Called exactly once per session, when it is fully closed
    pub(crate) fn on_session_closed(self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut pool = pool.borrow_mut();
        pool.unmap(self.id);
        if pool.sessions.remove(&self.id).is_some() {
            debug!(id = %self.id, "session removed from pool");
        }
        pool.capacity.notify_waiters();
    }

    pub(crate) fn is_pool_stalled(&self) -> bool {
        self.pool
            .upgrade()
            .and_then(|pool| pool.try_borrow().ok().map(|p| p.stalled_waiters > 0))
            .unwrap_or(false)
    }
}

/// Gives back a connecting slot if the connection attempt is abandoned
struct SlotReservation {
    pool: Rc<RefCell<PoolInner>>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        let mut pool = self.pool.borrow_mut();
        pool.connecting -= 1;
        pool.capacity.notify_waiters();
    }
}

/// Counts a caller waiting for a session slot, for as long as it waits
struct StalledWaiter {
    pool: Rc<RefCell<PoolInner>>,
}

impl Drop for StalledWaiter {
    fn drop(&mut self) {
        self.pool.borrow_mut().stalled_waiters -= 1;
    }
}

pub struct SessionPool<C: Connector> {
    inner: Rc<RefCell<PoolInner>>,
    connector: C,
    conf: PoolConf,
    session_conf: Rc<SessionConf>,
    settings_cache: Rc<dyn SettingsCache>,
}

impl<C: Connector> SessionPool<C> {
    pub fn new(connector: C, conf: PoolConf, session_conf: Rc<SessionConf>) -> Self {
        Self::with_settings_cache(
            connector,
            conf,
            session_conf,
            Rc::new(MemorySettingsCache::default()),
        )
    }

    pub fn with_settings_cache(
        connector: C,
        conf: PoolConf,
        session_conf: Rc<SessionConf>,
        settings_cache: Rc<dyn SettingsCache>,
    ) -> Self {
        Self {
            inner: Default::default(),
            connector,
            conf,
            session_conf,
            settings_cache,
        }
    }

    pub fn num_sessions(&self) -> usize {
        self.inner.borrow().sessions.len()
    }

    /// Whether callers are waiting for a session slot
    pub fn is_stalled(&self) -> bool {
        self.inner.borrow().stalled_waiters > 0
    }

    /// An available session mapped to exactly `key`, directly or as an alias
    pub fn find_available_session(&self, key: &SessionKey) -> Option<SessionHandle> {
        let inner = self.inner.borrow();
        let id = inner.available.get(key)?;
        inner.sessions.get(id).map(|s| s.handle.clone())
    }

    /// A session for `key`: an existing one, one reachable through an
    /// overlapping address, or a new connection.
    pub async fn find_or_create_session(&self, key: &SessionKey) -> Result<SessionHandle, SpdyError> {
        if let Some(handle) = self.find_available_session(key) {
            return Ok(handle);
        }

        let addrs = self
            .connector
            .resolve(&key.host_port)
            .await
            .map_err(|e| SpdyError::from_io(&e))?;

        if self.conf.enable_ip_pooling {
            if let Some(handle) = self.find_alias(key, &addrs) {
                return Ok(handle);
            }
        }

        let reservation = self.wait_for_session_slot().await;
        // somebody may have connected while we waited
        if let Some(handle) = self.find_available_session(key) {
            return Ok(handle);
        }

        let connected = self
            .connector
            .connect(key, &addrs)
            .await
            .map_err(|e| SpdyError::from_io(&e))?;
        if let Some(handle) = self.find_available_session(key) {
            debug!(%key, "lost the race to another connection, dropping ours");
            return Ok(handle);
        }

        let handle = self.insert_session(key, addrs, connected);
        drop(reservation);
        Ok(handle)
    }

    fn insert_session(
        &self,
        key: &SessionKey,
        addrs: Vec<SocketAddr>,
        connected: Connected<C::Transport>,
    ) -> SessionHandle {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };

        let link = PoolLink {
            pool: Rc::downgrade(&self.inner),
            id,
        };
        let handle = spawn_pooled_session(
            key.clone(),
            self.session_conf.clone(),
            self.settings_cache.clone(),
            Some(link),
            connected.transport,
        );

        let mut inner = self.inner.borrow_mut();
        for addr in &addrs {
            inner.by_addr.entry(*addr).or_insert(id);
        }
        inner.available.insert(key.clone(), id);
        inner.sessions.insert(
            id,
            PooledSession {
                handle: handle.clone(),
                keys: vec![key.clone()],
                addrs,
                origin_key: key.clone(),
                is_secure: connected.is_secure,
                certificate_names: connected.certificate_names,
            },
        );
        debug!(%id, %key, sessions = %inner.sessions.len(), "session added to pool");
        handle
    }

    /// Reuses a session connected to one of `addrs` for `key`, if its route
    /// and certificate allow it, and remembers the alias.
    fn find_alias(&self, key: &SessionKey, addrs: &[SocketAddr]) -> Option<SessionHandle> {
        let mut inner = self.inner.borrow_mut();
        let id = addrs.iter().find_map(|addr| {
            let id = *inner.by_addr.get(addr)?;
            let session = inner.sessions.get(&id)?;
            let origin = &session.origin_key;
            if origin.proxy != key.proxy || origin.privacy_mode != key.privacy_mode {
                return None;
            }
            if session.is_secure
                && !certificate_covers(&session.certificate_names, &key.host_port.host)
            {
                return None;
            }
            // only sessions still mapped under some key are available
            (!session.keys.is_empty()).then_some(id)
        })?;

        inner.available.insert(key.clone(), id);
        let session = inner.sessions.get_mut(&id)?;
        session.keys.push(key.clone());
        debug!(%id, %key, addrs = ?session.addrs, "aliased onto existing session");
        Some(session.handle.clone())
    }

    /// Stops `key` from resolving to its aliased session. The session
    /// itself stays open.
    pub fn remove_aliases(&self, key: &SessionKey) {
        let mut inner = self.inner.borrow_mut();
        let Some(id) = inner.available.remove(key) else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.keys.retain(|k| k != key);
        }
    }

    /// Waits until opening one more session stays within `max_sessions`,
    /// closing an idle session to make room if there is one.
    async fn wait_for_session_slot(&self) -> SlotReservation {
        let capacity = self.inner.borrow().capacity.clone();
        let mut stalled: Option<StalledWaiter> = None;

        loop {
            let notified = capacity.notified();
            {
                let mut inner = self.inner.borrow_mut();
                let used = inner.sessions.len() + inner.connecting;
                if self.conf.max_sessions.map_or(true, |max| used < max) {
                    inner.connecting += 1;
                    drop(inner);
                    drop(stalled);
                    return SlotReservation {
                        pool: self.inner.clone(),
                    };
                }
            }

            if !self.close_one_idle_session() && stalled.is_none() {
                debug!("session pool is stalled");
                self.inner.borrow_mut().stalled_waiters += 1;
                stalled = Some(StalledWaiter {
                    pool: self.inner.clone(),
                });
            }
            notified.await;
        }
    }

    /// Sessions whose removal hasn't started yet, in creation order
    fn snapshot(&self) -> Vec<SessionHandle> {
        self.inner
            .borrow()
            .sessions
            .values()
            .map(|s| s.handle.clone())
            .collect()
    }

    fn close_one_idle_session(&self) -> bool {
        let idle = self.snapshot().into_iter().find(|h| {
            !h.is_closed() && h.num_active_streams() == 0 && h.num_created_streams() == 0
        });
        match idle {
            Some(handle) => {
                debug!(key = %handle.key(), "closing idle session to make room");
                handle.close(SpdyError::ConnectionClosed);
                true
            }
            None => false,
        }
    }

    /// Closes every session that exists right now with `status`. Sessions
    /// created while this runs are left alone.
    pub fn close_current_sessions(&self, status: SpdyError) {
        for handle in self.snapshot() {
            handle.close(status.clone());
        }
    }

    /// Closes sessions with no streams at all
    pub fn close_idle_sessions(&self) {
        for handle in self.snapshot() {
            if handle.num_active_streams() == 0 && handle.num_created_streams() == 0 {
                handle.close(SpdyError::ConnectionClosed);
            }
        }
    }

    /// Closes every session and waits until they are gone
    pub async fn close_all_sessions(&self) {
        loop {
            let sessions = self.snapshot();
            if sessions.is_empty() {
                break;
            }
            for handle in &sessions {
                handle.close(SpdyError::ConnectionClosed);
            }
            for handle in &sessions {
                let _ = handle.closed().await;
            }
        }
    }

    /// The local network changed: remembered settings are dropped and every
    /// session is retired according to the configured policy.
    pub fn on_ip_address_changed(&self) {
        self.settings_cache.clear();
        let policy = self.conf.network_change_policy;
        debug!(?policy, "ip address changed");

        for handle in self.snapshot() {
            match policy {
                NetworkChangePolicy::MarkGoingAway => handle.go_away(SpdyError::NetworkChanged),
                NetworkChangePolicy::AbortStreams => handle.close(SpdyError::NetworkChanged),
            }
        }
    }
}
