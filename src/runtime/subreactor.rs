//! Sub-reactor shards.
//!
//! Each shard pairs a connection registry with a bounded ready-token queue
//! and is drained by its own consumer thread. Tokens are routed to shards by
//! descriptor, so independent shards never contend on a lock or a queue. A
//! single sub-reactor is the one-shard case.

use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::Token;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Callback invoked with every connection resolved from a ready token.
pub type RequestHandler = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// One registry plus its ready queue.
pub struct Shard {
    registry: ConnectionRegistry,
    sender: Sender<Token>,
    receiver: Receiver<Token>,
}

impl Shard {
    fn new(queue_capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(queue_capacity.max(1));
        Self {
            registry: ConnectionRegistry::new(),
            sender,
            receiver,
        }
    }

    pub fn register(&self, conn: Arc<Connection>) {
        if let Some(previous) = self.registry.insert(conn) {
            debug!(conn_id = %previous.id(), "Replaced stale registry entry");
        }
    }

    pub fn unregister(&self, conn: &Connection) {
        self.registry.remove(conn.token());
    }

    pub fn connection(&self, token: Token) -> Option<Arc<Connection>> {
        self.registry.get(token)
    }

    /// Queue a ready token without blocking.
    ///
    /// Returns `false` when the queue is full and the token was dropped.
    pub fn offer(&self, token: Token) -> bool {
        match self.sender.try_send(token) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Tokens currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.connections()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Drain the queue until `stop` is closed.
    ///
    /// Tokens whose connection is gone are skipped silently.
    pub fn polling(&self, stop: &Receiver<()>, on_request: &RequestHandler) {
        loop {
            crossbeam_channel::select! {
                recv(self.receiver) -> msg => match msg {
                    Ok(token) => self.dispatch(token, on_request),
                    Err(_) => return,
                },
                recv(stop) -> _ => return,
            }
        }
    }

    fn dispatch(&self, token: Token, on_request: &RequestHandler) {
        match self.registry.get(token) {
            Some(conn) => on_request(conn),
            None => trace!(fd = token.fd(), "Dropping token of closed connection"),
        }
    }
}

/// Set of shards partitioning all connections.
pub struct SubReactor {
    shards: Vec<Shard>,
}

impl SubReactor {
    /// Create `shard_count` shards with `queue_capacity` slots each.
    pub fn new(shard_count: usize, queue_capacity: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Shard::new(queue_capacity))
            .collect();
        Self { shards }
    }

    /// A sub-reactor with a single shard.
    pub fn single(queue_capacity: usize) -> Self {
        Self::new(1, queue_capacity)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `token`.
    pub fn shard(&self, token: Token) -> &Shard {
        &self.shards[token.shard(self.shards.len())]
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.shard(conn.token()).register(conn);
    }

    pub fn unregister(&self, conn: &Connection) {
        self.shard(conn.token()).unregister(conn);
    }

    pub fn connection(&self, token: Token) -> Option<Arc<Connection>> {
        self.shard(token).connection(token)
    }

    /// Route a ready token to its shard; `false` if it was dropped.
    pub fn offer(&self, token: Token) -> bool {
        self.shard(token).offer(token)
    }

    /// Every registered connection across all shards.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shards.iter().flat_map(Shard::connections).collect()
    }

    /// Total number of registered connections.
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Shard::is_empty)
    }

    /// Start one consumer thread per shard.
    pub fn polling(
        self: &Arc<Self>,
        stop: &Receiver<()>,
        on_request: RequestHandler,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.shards.len());

        for shard_id in 0..self.shards.len() {
            let sub = Arc::clone(self);
            let stop = stop.clone();
            let on_request = Arc::clone(&on_request);

            let handle = thread::Builder::new()
                .name(format!("shard-{shard_id}"))
                .spawn(move || {
                    sub.shards[shard_id].polling(&stop, &on_request);
                    trace!(shard = shard_id, "Shard consumer stopped");
                })?;
            handles.push(handle);
        }

        Ok(handles)
    }
}
