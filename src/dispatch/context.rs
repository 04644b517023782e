//! Per-request context and the middleware chain cursor.

use crate::protocol::{Codec, CodecError, Packet, Payload};
use crate::runtime::{Connection, Reset};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One step of the middleware chain.
pub type Middleware = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Cursor position meaning "chain aborted".
const ABORT_INDEX: usize = usize::MAX / 2;

/// Chain and codec shared by every context of one pipeline.
pub struct Dispatcher {
    chain: Vec<Middleware>,
    codec: Codec,
    stopped: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(chain: Vec<Middleware>, codec: Codec) -> Self {
        Self {
            chain,
            codec,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Mark every in-flight and future request as cancelled.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn invoke(&self, ctx: &mut Context, index: usize) {
        if let Some(handler) = self.chain.get(index) {
            handler(ctx);
        }
    }
}

/// State for one request as it moves through the chain.
///
/// Contexts are pooled: `prepare` binds a connection and packet, the
/// pool's `Reset` clears them again.
pub struct Context {
    dispatcher: Arc<Dispatcher>,
    conn: Option<Arc<Connection>>,
    packet: Packet,
    response: Option<Payload>,
    index: usize,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            conn: None,
            packet: Packet::default(),
            response: None,
            index: 0,
            deadline: None,
        }
    }

    /// Connection the request arrived on.
    pub fn conn(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref()
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut self.packet
    }

    pub fn codec(&self) -> &Codec {
        &self.dispatcher.codec
    }

    /// Deserialize the request body.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.dispatcher.codec.unmarshal(&self.packet)?.into_typed()
    }

    /// Response produced by the route handler, once it ran.
    pub fn response(&self) -> Option<&Payload> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, payload: Payload) {
        self.response = Some(payload);
    }

    /// Run the next handler in the chain.
    pub fn next(&mut self) {
        if self.index < ABORT_INDEX {
            self.index += 1;
            let dispatcher = Arc::clone(&self.dispatcher);
            dispatcher.invoke(self, self.index);
        }
    }

    /// Stop the chain; later `next` calls do nothing.
    pub fn abort(&mut self) {
        self.index = ABORT_INDEX;
    }

    pub fn is_aborted(&self) -> bool {
        self.index >= ABORT_INDEX
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the server is stopping or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.dispatcher.is_stopped() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Marshal `payload` into the packet with the next sequence number and
    /// push the encoded frame to the connection.
    pub fn reply(&mut self, payload: &Payload) -> Result<(), CodecError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.packet.seq = self.packet.seq.wrapping_add(1);
        dispatcher.codec.marshal(&mut self.packet, payload)?;

        let frame = dispatcher.codec.encode(&mut self.packet)?;
        if let Some(conn) = &self.conn {
            conn.push(frame);
        }
        Ok(())
    }

    /// Bind the context to a request.
    pub(crate) fn prepare(&mut self, conn: Arc<Connection>, packet: Packet) {
        self.conn = Some(conn);
        self.packet = packet;
        self.response = None;
        self.index = 0;
        self.deadline = None;
    }

    /// Run the chain from its first handler.
    pub(crate) fn run(&mut self) {
        self.index = 0;
        let dispatcher = Arc::clone(&self.dispatcher);
        dispatcher.invoke(self, 0);
    }

    /// Detach the packet so it can go back to its pool.
    pub(crate) fn take_packet(&mut self) -> Packet {
        std::mem::take(&mut self.packet)
    }
}

impl Reset for Context {
    fn reset(&mut self) {
        self.conn = None;
        self.packet.reset();
        self.response = None;
        self.index = 0;
        self.deadline = None;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("conn", &self.conn.as_ref().map(|c| c.id()))
            .field("packet", &self.packet)
            .field("index", &self.index)
            .finish()
    }
}
