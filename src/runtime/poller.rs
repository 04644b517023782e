//! Readiness poller built on mio.
//!
//! Readiness-based model: the poller tells us which connections have data,
//! the shard consumers then perform the reads.
//! Uses epoll on Linux, kqueue on macOS. Both are edge-triggered under mio,
//! so `rearm` exists to make still-pending readiness observable again after
//! a wakeup was dropped or skipped.

use crate::runtime::transport::Transport;
use crate::runtime::Token;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::trace;

/// Upper bound for one `wait` call when nothing becomes ready.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

struct PollState {
    poll: Poll,
    events: Events,
}

/// OS readiness wrapper.
///
/// `add`, `remove` and `rearm` go through a cloned `Registry` and may be
/// called from any thread. `wait` is serialized and belongs to the reactor's
/// wait loop.
pub struct Poller {
    state: Mutex<PollState>,
    registry: Registry,
    capacity: usize,
}

impl Poller {
    /// Create a poller reporting at most `capacity` tokens per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let capacity = capacity.max(1);

        Ok(Self {
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(capacity),
            }),
            registry,
            capacity,
        })
    }

    /// Maximum number of tokens one `wait` can report.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register read interest for a connection.
    pub fn add(&self, token: Token) -> io::Result<()> {
        let fd = token.fd();
        self.registry
            .register(&mut SourceFd(&fd), token.into(), Interest::READABLE)
    }

    /// Remove a connection from the interest set.
    pub fn remove(&self, token: Token) -> io::Result<()> {
        let fd = token.fd();
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Re-register read interest so pending readiness is reported again.
    pub fn rearm(&self, token: Token) -> io::Result<()> {
        let fd = token.fd();
        self.registry
            .reregister(&mut SourceFd(&fd), token.into(), Interest::READABLE)
    }

    /// Block until at least one token is ready or the internal timeout
    /// elapses, then fill `ready` with the batch.
    ///
    /// Interrupted system calls are retried. Returns the batch length.
    pub fn wait(&self, ready: &mut Vec<Token>) -> io::Result<usize> {
        let mut state = self.state.lock();
        let PollState { poll, events } = &mut *state;

        loop {
            match poll.poll(events, Some(WAIT_TIMEOUT)) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    trace!("poll interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        ready.clear();
        ready.extend(events.iter().map(|event| Token::from(event.token())));
        Ok(ready.len())
    }

    /// Descriptor the poller registers for a stream.
    pub fn socket_descriptor(stream: &dyn Transport) -> RawFd {
        stream.socket_descriptor()
    }
}
