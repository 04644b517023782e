//! Reactor runtime.
//!
//! Readiness-based model built on mio (epoll on Linux, kqueue on macOS):
//! - `Poller`: readiness registration and the batched wait
//! - `Reactor`: wait loop feeding ready tokens to the shards
//! - `SubReactor`: sharded registries, each drained by its own thread
//! - `Connection`: connection state machine and close hooks
//! - `WorkerPool`: elastic threads running request processing
//! - `ObjectPool` / `BufferPool`: free-list reuse of per-message objects

mod connection;
mod poller;
mod pool;
mod reactor;
mod subreactor;
mod token;
mod transport;
mod worker;

pub use connection::{
    CloseHook, ConnState, Connection, ConnectionRegistry, DispatchGuard, Properties,
};
pub use poller::Poller;
pub use pool::{BufferPool, ObjectPool, Reset};
pub use reactor::{ConnectionHandler, Reactor};
pub use subreactor::{RequestHandler, Shard, SubReactor};
pub use token::{GenerationCounter, Token};
pub use transport::{read_message, Framing, Transport};
pub use worker::{Task, WorkerPool};
