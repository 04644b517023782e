//! Connection state machine and registry.
//!
//! A connection owns one accepted transport. Its lifecycle is
//! `Open → Closing → Closed`; the first `close` commits the transition with
//! a compare-and-swap, runs the pre-close hooks in order and shuts the
//! transport down. Later calls are no-ops.

use crate::runtime::poller::Poller;
use crate::runtime::transport::{self, Framing, Transport};
use crate::runtime::Token;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};
use uuid::Uuid;

/// Hook run once, in registration order, before the transport is closed.
pub type CloseHook = Box<dyn FnOnce(&Connection) + Send>;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Registered and serving requests.
    Open = 0,
    /// Close committed, hooks running.
    Closing = 1,
    /// Hooks ran and the transport is shut down.
    Closed = 2,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Open,
            1 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// String-keyed bag of values attached to a connection.
#[derive(Default)]
pub struct Properties {
    items: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Properties {
    /// Store a value, replacing any previous value under `key`.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.items.write().insert(key.into(), Arc::new(value));
    }

    /// Fetch a copy of the value under `key` if it has type `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.items
            .read()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.items.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

/// A single client connection.
pub struct Connection {
    id: Uuid,
    token: Token,
    stream: Box<dyn Transport>,
    properties: Properties,
    hooks: Mutex<Vec<CloseHook>>,
    state: AtomicU8,
    /// Set while a read/dispatch cycle is in flight.
    busy: AtomicBool,
    write_lock: Mutex<()>,
    poller: Weak<Poller>,
}

impl Connection {
    /// Wrap an accepted stream.
    ///
    /// `poller` is used to re-arm readiness after each dispatch cycle; pass
    /// `Weak::new()` for a connection that is not registered anywhere.
    pub fn new(stream: Box<dyn Transport>, generation: u32, poller: Weak<Poller>) -> Arc<Self> {
        let token = Token::new(stream.socket_descriptor(), generation);
        Arc::new(Self {
            id: Uuid::new_v4(),
            token,
            stream,
            properties: Properties::default(),
            hooks: Mutex::new(Vec::new()),
            state: AtomicU8::new(ConnState::Open as u8),
            busy: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            poller,
        })
    }

    /// Process-unique identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.token.fd()
    }

    pub fn framing(&self) -> Framing {
        self.stream.framing()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() != ConnState::Open
    }

    /// Read exactly one framed message into `buf`, returning its length.
    pub fn read_message(&self, buf: &mut [u8], length_field_size: usize) -> io::Result<usize> {
        transport::read_message(self.stream.as_ref(), buf, length_field_size)
    }

    /// Write one complete message.
    ///
    /// Writes from concurrent workers are serialized so messages never
    /// interleave on a byte stream.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        let _guard = self.write_lock.lock();
        self.stream.write(buf)
    }

    /// Write a message, closing the connection if the write fails.
    pub fn push(&self, buf: &[u8]) {
        if let Err(e) = self.write(buf) {
            debug!(conn_id = %self.id, error = %e, "Push failed, closing connection");
            self.close();
        }
    }

    /// Append hooks that run before the transport is closed.
    pub fn add_before_close_hook<F>(&self, hook: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(
                ConnState::Open as u8,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            hook(self);
        }

        if let Err(e) = self.stream.shutdown() {
            trace!(conn_id = %self.id, error = %e, "Transport shutdown failed");
        }
        self.state.store(ConnState::Closed as u8, Ordering::Release);

        debug!(conn_id = %self.id, fd = self.fd(), "Connection closed");
    }

    /// Claim the connection for one read/dispatch cycle.
    ///
    /// Returns `None` when a cycle is already in flight or the connection is
    /// closed. Dropping the guard releases the claim and re-arms the poller,
    /// so data that arrived meanwhile is reported again.
    pub fn try_dispatch(self: &Arc<Self>) -> Option<DispatchGuard> {
        if self.is_closed() {
            return None;
        }
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DispatchGuard {
                conn: Arc::clone(self),
            })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("state", &self.state())
            .finish()
    }
}

/// Exclusive claim on a connection's read/dispatch cycle.
pub struct DispatchGuard {
    conn: Arc<Connection>,
}

impl DispatchGuard {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.conn.busy.store(false, Ordering::Release);
        if self.conn.is_closed() {
            return;
        }
        if let Some(poller) = self.conn.poller.upgrade() {
            if let Err(e) = poller.rearm(self.conn.token) {
                trace!(conn_id = %self.conn.id, error = %e, "Rearm failed");
            }
        }
    }
}

/// Registry of live connections keyed by descriptor.
///
/// Lookups take the read lock; register/unregister take the write lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<RawFd, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning the entry it replaced.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connections.write().insert(conn.fd(), conn)
    }

    /// Resolve a token. Entries of another generation do not match.
    pub fn get(&self, token: Token) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .get(&token.fd())
            .filter(|conn| conn.token() == token)
            .cloned()
    }

    /// Remove the entry for `token` if it belongs to the same generation.
    pub fn remove(&self, token: Token) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write();
        match connections.get(&token.fd()) {
            Some(conn) if conn.token() == token => connections.remove(&token.fd()),
            _ => None,
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        self.get(token).is_some()
    }

    /// Snapshot of all registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
