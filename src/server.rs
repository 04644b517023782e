//! Server facade.
//!
//! Ties the reactor, the request pipeline, the router and the acceptors
//! together. Routes, middlewares and callbacks are registered first, then
//! `run` blocks the calling thread until the stop channel closes.

use crate::acceptor::{new_acceptor, AcceptHandler, Acceptor, AcceptorOptions, Schema};
use crate::config::Config;
use crate::dispatch::{Context, Middleware, Pipeline, Router};
use crate::error::{Error, Result};
use crate::protocol::{Codec, Marshaller};
use crate::runtime::{Connection, ConnectionHandler, Reactor, Transport, WorkerPool};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Server {
    config: Config,
    reactor: Arc<Reactor>,
    router: Arc<Router>,
    codec: Codec,
    middlewares: Vec<Middleware>,
    on_connect: ConnectionHandler,
    on_disconnect: ConnectionHandler,
    schemas: Vec<Schema>,
    acceptors: Mutex<Vec<Box<dyn Acceptor>>>,
}

impl Server {
    /// Validate `config` and create the poller and shards.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let codec = Codec::new(config.length_field_size)?;
        let reactor = Reactor::new(
            config.poller_buffer_size,
            config.shard_count,
            config.queue_capacity,
        )?;

        Ok(Self {
            config,
            reactor: Arc::new(reactor),
            router: Arc::new(Router::new()),
            codec,
            middlewares: Vec::new(),
            on_connect: Arc::new(|_conn: &Connection| {}),
            on_disconnect: Arc::new(|_conn: &Connection| {}),
            schemas: Vec::new(),
            acceptors: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Replace the marshaller for its content type.
    pub fn with_marshaller(&mut self, marshaller: Arc<dyn Marshaller>) -> &mut Self {
        self.codec = self.codec.clone().with_marshaller(marshaller);
        self
    }

    /// Append a middleware; middlewares run in registration order before
    /// the router.
    pub fn use_middleware<F>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn on_connect<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_connect = Arc::new(handler);
        self
    }

    /// Runs before the connection is removed from the poller.
    pub fn on_disconnect<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_disconnect = Arc::new(handler);
        self
    }

    pub fn listen(&mut self, schema: Schema) -> &mut Self {
        self.schemas.push(schema);
        self
    }

    /// Addresses bound by the running acceptors.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors
            .lock()
            .iter()
            .filter_map(|acceptor| acceptor.local_addr())
            .collect()
    }

    /// Start the acceptors and run the reactor until `stop` is closed.
    ///
    /// On return every acceptor is stopped, all remaining connections are
    /// closed and the worker pool has drained. Connections are closed before
    /// the workers are joined so a worker blocked reading a stalled peer
    /// wakes up with EOF.
    pub fn run(&self, stop: Receiver<()>) -> Result<()> {
        if self.schemas.is_empty() {
            return Err(Error::NoListener);
        }

        let workers = Arc::new(WorkerPool::new(
            self.config.max_workers,
            self.config.worker_queue_capacity,
            self.config.worker_idle_timeout,
        ));
        let max_idle = self.config.max_workers + self.config.worker_queue_capacity;
        let pipeline = Arc::new(Pipeline::new(
            self.codec.clone(),
            Arc::clone(&self.router),
            self.middlewares.clone(),
            Arc::clone(&workers),
            self.config.max_read_buffer_size,
            max_idle,
        ));

        if let Err(e) = self.start_acceptors() {
            self.stop_acceptors();
            workers.shutdown();
            return Err(e);
        }

        info!(
            listeners = self.schemas.len(),
            shards = self.config.shard_count,
            max_workers = self.config.max_workers,
            routes = self.router.len(),
            "Server started"
        );

        let result = self.reactor.run(&stop, pipeline.request_handler());

        self.stop_acceptors();
        pipeline.stop();
        let closed = self.reactor.close_all();
        workers.shutdown();
        info!(closed, "Server shutdown complete");

        Ok(result?)
    }

    fn start_acceptors(&self) -> Result<()> {
        let options = AcceptorOptions {
            read_timeout: self.config.read_timeout,
            write_timeout: self.config.write_timeout,
        };

        for schema in &self.schemas {
            let acceptor = new_acceptor(schema.clone(), options)?;
            acceptor.listen(self.accept_handler())?;
            self.acceptors.lock().push(acceptor);
        }
        Ok(())
    }

    fn stop_acceptors(&self) {
        let acceptors: Vec<_> = self.acceptors.lock().drain(..).collect();
        for acceptor in acceptors {
            acceptor.shutdown();
            debug!(schema = %acceptor.schema(), "Listener closed");
        }
    }

    fn accept_handler(&self) -> AcceptHandler {
        let reactor = Arc::clone(&self.reactor);
        let on_connect = Arc::clone(&self.on_connect);
        let on_disconnect = Arc::clone(&self.on_disconnect);

        Arc::new(move |stream: Box<dyn Transport>| {
            if let Err(e) = reactor.initialize_connection(stream, &on_connect, &on_disconnect) {
                warn!(error = %e, "Dropping accepted connection");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::dispatch::json_handler;
    use crate::protocol::{ContentType, Payload};
    use crossbeam_channel::Sender;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::io::Write;
    use std::net::TcpStream;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    #[derive(Serialize, Deserialize)]
    struct EchoRequest {
        foo: String,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct EchoResponse {
        val: String,
    }

    fn test_config() -> Config {
        Config {
            shard_count: 2,
            max_workers: 4,
            worker_queue_capacity: 16,
            ..Config::default()
        }
    }

    fn start(server: Server) -> (Arc<Server>, Sender<()>, JoinHandle<Result<()>>, SocketAddr) {
        let server = Arc::new(server);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let runner = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run(stop_rx))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        let addr = loop {
            if let Some(addr) = server.local_addrs().first().copied() {
                break addr;
            }
            assert!(Instant::now() < deadline, "server did not start listening");
            thread::sleep(Duration::from_millis(10));
        };
        (server, stop_tx, runner, addr)
    }

    #[test]
    fn test_tcp_smoke() {
        let mut server = Server::new(test_config()).unwrap();
        server.router().route(
            1,
            json_handler(|_ctx, req: EchoRequest| Ok(EchoResponse { val: req.foo })),
        );
        server.listen(Schema::tcp("127.0.0.1:0"));
        let (_server, stop_tx, runner, addr) = start(server);

        let mut client = Client::connect(addr).unwrap();
        client.set_timeout(Some(Duration::from_secs(2))).unwrap();

        let reply = client
            .request(1, &Payload::Json(json!({"foo": "bar"})))
            .unwrap();
        assert_eq!(reply.operate, 1);
        assert_eq!(reply.seq, 1);
        assert_eq!(reply.content_type(), ContentType::Json);
        assert_eq!(reply.body(), br#"{"val":"bar"}"#);

        // Requests on one connection are answered in order.
        for i in 0..10 {
            let resp: EchoResponse = client
                .request_json(1, &EchoRequest { foo: format!("v{i}") })
                .unwrap();
            assert_eq!(resp.val, format!("v{i}"));
        }

        drop(stop_tx);
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_connection_callbacks() {
        let (open_tx, open_rx) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::unbounded();

        let mut server = Server::new(test_config()).unwrap();
        server
            .on_connect(move |conn| {
                let _ = open_tx.send(conn.id());
            })
            .on_disconnect(move |conn| {
                let _ = close_tx.send(conn.id());
            })
            .listen(Schema::tcp("127.0.0.1:0"));
        let (server, stop_tx, runner, addr) = start(server);

        let client = Client::connect(addr).unwrap();
        let opened = open_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        drop(client);
        let closed = close_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(opened, closed);

        // Still connected at shutdown: closed by the server.
        let _idle = Client::connect(addr).unwrap();
        let idle = open_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        drop(stop_tx);
        runner.join().unwrap().unwrap();
        assert_eq!(close_rx.recv_timeout(Duration::from_secs(2)).unwrap(), idle);
        assert_eq!(server.reactor().connection_count(), 0);
    }

    #[test]
    fn test_middleware_sees_requests() {
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();

        let mut server = Server::new(test_config()).unwrap();
        server.router().route(4, |_ctx| Ok(Payload::binary(&b"pong"[..])));
        server
            .use_middleware(move |ctx| {
                let _ = seen_tx.send(ctx.packet().operate);
                ctx.next();
            })
            .listen(Schema::tcp("127.0.0.1:0"));
        let (_server, stop_tx, runner, addr) = start(server);

        let mut client = Client::connect(addr).unwrap();
        client.set_timeout(Some(Duration::from_secs(2))).unwrap();
        let reply = client.request(4, &Payload::binary(&b"ping"[..])).unwrap();
        assert_eq!(reply.body(), b"pong");
        assert_eq!(seen_rx.try_recv().unwrap(), 4);

        drop(stop_tx);
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_stalled_peer_does_not_block_shard() {
        let config = Config {
            shard_count: 1,
            ..test_config()
        };
        let mut server = Server::new(config).unwrap();
        server.router().route(4, |_ctx| Ok(Payload::binary(&b"pong"[..])));
        server.listen(Schema::tcp("127.0.0.1:0"));
        let (_server, stop_tx, runner, addr) = start(server);

        // Length prefix of a 20 byte message, then nothing.
        let mut stalled = TcpStream::connect(addr).unwrap();
        stalled.write_all(&[0, 0, 0, 20]).unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut healthy = Client::connect(addr).unwrap();
        healthy.set_timeout(Some(Duration::from_secs(2))).unwrap();
        let reply = healthy.request(4, &Payload::binary(&b"ping"[..])).unwrap();
        assert_eq!(reply.body(), b"pong");

        drop(stop_tx);
        let deadline = Instant::now() + Duration::from_secs(3);
        while !runner.is_finished() {
            assert!(Instant::now() < deadline, "run did not return after stop");
            thread::sleep(Duration::from_millis(10));
        }
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn test_run_without_listener() {
        let server = Server::new(test_config()).unwrap();
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        assert!(matches!(server.run(stop_rx), Err(Error::NoListener)));
    }

    #[test]
    fn test_unsupported_protocol_fails_run() {
        let mut server = Server::new(test_config()).unwrap();
        server
            .listen(Schema::tcp("127.0.0.1:0"))
            .listen(Schema::websocket("127.0.0.1:0"));
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        assert!(matches!(
            server.run(stop_rx),
            Err(Error::UnsupportedProtocol(p)) if p == "ws"
        ));
        assert!(server.local_addrs().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            length_field_size: 0,
            ..test_config()
        };
        assert!(matches!(Server::new(config), Err(Error::Config(_))));
    }
}
