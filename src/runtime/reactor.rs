//! Main reactor: owns the poller and the sharded sub-reactor.
//!
//! The wait loop runs on the caller's thread and only moves ready tokens into
//! shard queues. Reads and dispatch happen on the shard consumers.

use crate::runtime::connection::Connection;
use crate::runtime::poller::Poller;
use crate::runtime::subreactor::{RequestHandler, SubReactor};
use crate::runtime::transport::Transport;
use crate::runtime::GenerationCounter;
use crossbeam_channel::{Receiver, TryRecvError};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Pause after a batch in which a shard queue was full; rearmed tokens are
/// re-reported on the very next wait.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(1);

/// Lifecycle callback for connection open and close.
pub type ConnectionHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

pub struct Reactor {
    poller: Arc<Poller>,
    sub_reactor: Arc<SubReactor>,
    generations: GenerationCounter,
}

impl Reactor {
    /// Create the poller and `shard_count` shards.
    pub fn new(
        poller_buffer_size: usize,
        shard_count: usize,
        queue_capacity: usize,
    ) -> io::Result<Self> {
        let poller = Arc::new(Poller::new(poller_buffer_size)?);
        let sub_reactor = Arc::new(SubReactor::new(shard_count, queue_capacity));

        debug!(
            poller_buffer_size,
            shards = sub_reactor.shard_count(),
            queue_capacity,
            "Reactor created"
        );

        Ok(Self {
            poller,
            sub_reactor,
            generations: GenerationCounter::new(),
        })
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn sub_reactor(&self) -> &Arc<SubReactor> {
        &self.sub_reactor
    }

    /// Number of registered connections across all shards.
    pub fn connection_count(&self) -> usize {
        self.sub_reactor.len()
    }

    /// Register an accepted stream with the poller and its shard.
    ///
    /// Close hooks run `on_close`, then poller removal, then shard removal.
    /// If the poller rejects the stream it is shut down and the error
    /// returned.
    pub fn initialize_connection(
        &self,
        stream: Box<dyn Transport>,
        on_open: &ConnectionHandler,
        on_close: &ConnectionHandler,
    ) -> io::Result<Arc<Connection>> {
        let generation = self.generations.next();
        let conn = Connection::new(stream, generation, Arc::downgrade(&self.poller));
        let token = conn.token();

        if let Err(e) = self.poller.add(token) {
            warn!(fd = token.fd(), error = %e, "Failed to register connection");
            conn.close();
            return Err(e);
        }

        let on_close = Arc::clone(on_close);
        conn.add_before_close_hook(move |c| on_close(c));

        let poller = Arc::downgrade(&self.poller);
        conn.add_before_close_hook(move |c| {
            if let Some(poller) = poller.upgrade() {
                if let Err(e) = poller.remove(c.token()) {
                    trace!(conn_id = %c.id(), error = %e, "Poller remove failed");
                }
            }
        });

        let sub_reactor = Arc::downgrade(&self.sub_reactor);
        conn.add_before_close_hook(move |c| {
            if let Some(sub_reactor) = sub_reactor.upgrade() {
                sub_reactor.unregister(c);
            }
        });

        on_open(&conn);
        self.sub_reactor.register(Arc::clone(&conn));

        // Closed from on_open, or raced with a peer reset: hooks already ran.
        if conn.is_closed() {
            self.sub_reactor.unregister(&conn);
            return Ok(conn);
        }

        // Data may have arrived before the shard knew the token.
        if let Err(e) = self.poller.rearm(token) {
            trace!(conn_id = %conn.id(), error = %e, "Rearm after register failed");
        }

        debug!(conn_id = %conn.id(), fd = token.fd(), generation, "Connection registered");
        Ok(conn)
    }

    /// Close every registered connection, running its close hooks.
    pub fn close_all(&self) -> usize {
        let connections = self.sub_reactor.connections();
        for conn in &connections {
            conn.close();
        }
        connections.len()
    }

    /// Run the wait loop until `stop` is closed.
    ///
    /// Shard consumers are started first and joined before this returns.
    pub fn run(&self, stop: &Receiver<()>, on_request: RequestHandler) -> io::Result<()> {
        let (shard_stop_tx, shard_stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handles = self.sub_reactor.polling(&shard_stop_rx, on_request)?;

        info!(
            shards = self.sub_reactor.shard_count(),
            batch = self.poller.capacity(),
            "Reactor started"
        );

        let result = self.wait_loop(stop);

        drop(shard_stop_tx);
        for handle in handles {
            let _ = handle.join();
        }

        match &result {
            Ok(()) => info!("Reactor stopped"),
            Err(e) => warn!(error = %e, "Reactor stopped on poller error"),
        }
        result
    }

    fn wait_loop(&self, stop: &Receiver<()>) -> io::Result<()> {
        let mut ready = Vec::with_capacity(self.poller.capacity());

        loop {
            match stop.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
            }

            self.poller.wait(&mut ready)?;

            let mut dropped = 0usize;
            for &token in &ready {
                if self.sub_reactor.offer(token) {
                    continue;
                }
                dropped += 1;
                if let Err(e) = self.poller.rearm(token) {
                    trace!(fd = token.fd(), error = %e, "Rearm of dropped token failed");
                }
            }

            if dropped > 0 {
                trace!(dropped, "Shard queue full, backing off");
                thread::sleep(QUEUE_FULL_BACKOFF);
            }
        }
    }
}
