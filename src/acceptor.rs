//! Listen schemas and acceptors.
//!
//! An acceptor owns one listening socket and hands every accepted stream to
//! its callback. Only plain TCP is provided; `ws` and `quic` schemas parse
//! but have no acceptor in this build.

use crate::error::{Error, Result};
use crate::runtime::Transport;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Bound on how long `shutdown` waits for the accept loop to notice.
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Callback receiving accepted streams.
pub type AcceptHandler = Arc<dyn Fn(Box<dyn Transport>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    WebSocket,
    Quic,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::WebSocket => "ws",
            Protocol::Quic => "quic",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "ws" => Ok(Protocol::WebSocket),
            "quic" => Ok(Protocol::Quic),
            other => Err(Error::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Where and how to listen, written `protocol://address`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Schema {
    pub protocol: Protocol,
    pub address: String,
}

impl Schema {
    pub fn new(protocol: Protocol, address: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(Protocol::Tcp, address)
    }

    pub fn websocket(address: impl Into<String>) -> Self {
        Self::new(Protocol::WebSocket, address)
    }

    pub fn quic(address: impl Into<String>) -> Self {
        Self::new(Protocol::Quic, address)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

impl FromStr for Schema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (protocol, address) = s
            .split_once("://")
            .ok_or_else(|| Error::InvalidSchema(s.to_string()))?;
        if address.is_empty() {
            return Err(Error::InvalidSchema(s.to_string()));
        }
        Ok(Self::new(protocol.parse()?, address))
    }
}

/// Socket options applied to accepted streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptorOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Accepts connections for one schema.
pub trait Acceptor: Send + Sync {
    fn schema(&self) -> &Schema;

    /// Bind and start accepting in the background.
    fn listen(&self, on_accept: AcceptHandler) -> Result<()>;

    /// Stop accepting and wait for the accept loop to exit.
    fn shutdown(&self);

    /// Address actually bound, once listening.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Create the acceptor for `schema`.
pub fn new_acceptor(schema: Schema, options: AcceptorOptions) -> Result<Box<dyn Acceptor>> {
    match schema.protocol {
        Protocol::Tcp => Ok(Box::new(TcpAcceptor::new(schema, options))),
        other => Err(Error::UnsupportedProtocol(other.to_string())),
    }
}

pub struct TcpAcceptor {
    schema: Schema,
    options: AcceptorOptions,
    done: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpAcceptor {
    pub fn new(schema: Schema, options: AcceptorOptions) -> Self {
        Self {
            schema,
            options,
            done: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }
}

impl Acceptor for TcpAcceptor {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn listen(&self, on_accept: AcceptHandler) -> Result<()> {
        let addr = self
            .schema
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidSchema(self.schema.to_string()))?;

        let listener = create_listener(addr)?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);

        let done = Arc::clone(&self.done);
        let options = self.options;
        let handle = thread::Builder::new()
            .name(format!("acceptor-{bound}"))
            .spawn(move || {
                if let Err(e) = accept_loop(&listener, &done, options, &on_accept) {
                    warn!(addr = %bound, error = %e, "Acceptor failed");
                }
            })?;
        *self.handle.lock() = Some(handle);

        info!(schema = %self.schema, addr = %bound, "Listening");
        Ok(())
    }

    fn shutdown(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
            debug!(schema = %self.schema, "Acceptor stopped");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn accept_loop(
    listener: &TcpListener,
    done: &AtomicBool,
    options: AcceptorOptions,
    on_accept: &AcceptHandler,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(16);
    let fd = listener.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;

    while !done.load(Ordering::Acquire) {
        match poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if events.is_empty() {
            continue;
        }

        // Drain the backlog; readiness is edge-triggered.
        loop {
            match listener.accept() {
                Ok((stream, peer)) => match configure(&stream, options) {
                    Ok(()) => {
                        debug!(peer = %peer, "Accepted connection");
                        on_accept(Box::new(stream));
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "Failed to configure stream"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }
    Ok(())
}

fn configure(stream: &TcpStream, options: AcceptorOptions) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(options.read_timeout)?;
    stream.set_write_timeout(options.write_timeout)?;
    Ok(())
}
