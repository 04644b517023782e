//! Request pipeline: every ready connection becomes one worker task.
//!
//! A shard consumer calls `handle_request` for every ready connection and
//! only claims it and schedules the work. Reading the message into a pooled
//! buffer, decoding, the middleware chain and the reply all run on the
//! worker pool, so a peer that stalls mid-frame holds one worker and never
//! its shard. The connection's dispatch guard travels with the task, so one
//! connection never has two requests in flight and its replies leave in
//! request order.

use crate::dispatch::context::{Context, Dispatcher, Middleware};
use crate::dispatch::router::Router;
use crate::error::Error;
use crate::protocol::{Codec, Packet};
use crate::runtime::{
    BufferPool, Connection, DispatchGuard, Framing, ObjectPool, RequestHandler, WorkerPool,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    router: Arc<Router>,
    workers: Arc<WorkerPool>,
    buffers: BufferPool,
    packets: ObjectPool<Packet>,
    contexts: ObjectPool<Context>,
}

impl Pipeline {
    /// Build the chain `middlewares` followed by the router.
    ///
    /// Read buffers are `max_read_buffer_size` bytes; a message longer than
    /// that closes its connection. `max_idle` buffers are allocated up front.
    pub fn new(
        codec: Codec,
        router: Arc<Router>,
        middlewares: Vec<Middleware>,
        workers: Arc<WorkerPool>,
        max_read_buffer_size: usize,
        max_idle: usize,
    ) -> Self {
        let mut chain = middlewares;
        chain.push(router.middleware());
        let dispatcher = Arc::new(Dispatcher::new(chain, codec));

        let contexts = {
            let dispatcher = Arc::clone(&dispatcher);
            ObjectPool::new(max_idle, move || Context::new(Arc::clone(&dispatcher)))
        };

        Self {
            dispatcher,
            router,
            workers,
            buffers: BufferPool::with_preallocated(max_read_buffer_size, max_idle),
            packets: ObjectPool::new(max_idle, Packet::default),
            contexts,
        }
    }

    pub fn codec(&self) -> &Codec {
        self.dispatcher.codec()
    }

    /// Cancel every context, current and future.
    pub fn stop(&self) {
        self.dispatcher.stop();
    }

    /// Claim `conn` and schedule reading and processing one message.
    pub fn handle_request(self: &Arc<Self>, conn: Arc<Connection>) {
        let Some(guard) = conn.try_dispatch() else {
            trace!(conn_id = %conn.id(), "Dispatch already in flight");
            return;
        };

        let pipeline = Arc::clone(self);
        if let Err(e) = self.workers.schedule(move || pipeline.serve(guard)) {
            warn!(conn_id = %conn.id(), error = %e, "Dropping request, worker pool is closed");
        }
    }

    /// Adapter for `Reactor::run`.
    pub fn request_handler(self: &Arc<Self>) -> RequestHandler {
        let pipeline = Arc::clone(self);
        Arc::new(move |conn: Arc<Connection>| pipeline.handle_request(conn))
    }

    fn serve(&self, guard: DispatchGuard) {
        let conn = Arc::clone(guard.connection());

        let mut buf = self.buffers.acquire();
        let length_field_size = self.dispatcher.codec().length_field_size();
        let n = match conn.read_message(&mut buf, length_field_size) {
            Ok(n) => n,
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "Read failed, closing connection");
                conn.close();
                self.buffers.release(buf);
                return;
            }
        };
        buf.truncate(n);

        self.process(guard, buf);
    }

    fn process(&self, guard: DispatchGuard, frame: Vec<u8>) {
        let conn = Arc::clone(guard.connection());

        let mut packet = self.packets.acquire();
        let decoded = self.dispatcher.codec().decode_into(&mut packet, frame);

        let mut ctx = self.contexts.acquire();
        ctx.prepare(Arc::clone(&conn), packet);

        match decoded {
            Ok(()) => ctx.run(),
            Err(e) => match conn.framing() {
                // One bad datagram does not poison the transport.
                Framing::Message => {
                    self.router.handle_error(&mut ctx, &Error::Codec(e));
                    ctx.abort();
                }
                Framing::LengthPrefixed => {
                    debug!(conn_id = %conn.id(), error = %e, "Decode failed, closing connection");
                    conn.close();
                }
            },
        }

        let mut packet = ctx.take_packet();
        self.buffers.release(packet.take_frame());
        self.packets.release(packet);
        self.contexts.release(ctx);

        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::router::json_handler;
    use crate::protocol::{ContentType, Payload};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixDatagram, UnixStream};
    use std::sync::Weak;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Deserialize)]
    struct EchoRequest {
        foo: String,
    }

    #[derive(Serialize)]
    struct EchoResponse {
        val: String,
    }

    fn pipeline(router: Arc<Router>, middlewares: Vec<Middleware>) -> Arc<Pipeline> {
        let workers = Arc::new(WorkerPool::new(4, 16, Duration::from_secs(1)));
        Arc::new(Pipeline::new(
            Codec::default(),
            router,
            middlewares,
            workers,
            512,
            16,
        ))
    }

    fn request(operate: i16, seq: i16, body: serde_json::Value) -> Vec<u8> {
        let codec = Codec::default();
        let mut packet = Packet::new(operate, seq, ContentType::Json);
        codec.marshal(&mut packet, &Payload::Json(body)).unwrap();
        codec.encode(&mut packet).unwrap().to_vec()
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_end_to_end_json_request() {
        let router = Arc::new(Router::new());
        router.route(
            1,
            json_handler(|_ctx, req: EchoRequest| Ok(EchoResponse { val: req.foo })),
        );
        let pipeline = pipeline(router, Vec::new());

        let (mut client, server) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let conn = Connection::new(Box::new(server), 0, Weak::new());

        client.write_all(&request(1, 5, json!({"foo": "bar"}))).unwrap();
        pipeline.handle_request(Arc::clone(&conn));

        let mut header = [0u8; 10];
        client.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(len, 0);
        client.read_exact(&mut frame[10..]).unwrap();

        let reply = Codec::default().decode(frame).unwrap();
        assert_eq!(reply.operate, 1);
        assert_eq!(reply.seq, 6);
        assert_eq!(reply.content_type(), ContentType::Json);
        assert_eq!(reply.body(), br#"{"val":"bar"}"#);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_buffer_pool_is_warmed() {
        let pipeline = pipeline(Arc::new(Router::new()), Vec::new());
        assert_eq!(pipeline.buffers.available(), 16);
        assert_eq!(pipeline.buffers.buffer_size(), 512);
    }

    #[test]
    fn test_middleware_runs_before_router() {
        let router = Arc::new(Router::new());
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        let (handled_tx, handled_rx) = crossbeam_channel::unbounded();
        router.route(9, move |_ctx| {
            let _ = handled_tx.send(());
            Ok(Payload::Json(json!(null)))
        });

        let logger: Middleware = Arc::new(move |ctx: &mut Context| {
            let _ = seen_tx.send(ctx.packet().operate);
            ctx.next();
        });
        let pipeline = pipeline(router, vec![logger]);

        let (mut client, server) = UnixStream::pair().unwrap();
        let conn = Connection::new(Box::new(server), 0, Weak::new());
        client.write_all(&request(9, 0, json!({}))).unwrap();
        pipeline.handle_request(conn);

        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 9);
        handled_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_stream_decode_error_closes_connection() {
        let pipeline = pipeline(Arc::new(Router::new()), Vec::new());

        let (mut client, server) = UnixStream::pair().unwrap();
        let conn = Connection::new(Box::new(server), 0, Weak::new());
        // Valid prefix, but shorter than the header
        client.write_all(&[0, 0, 0, 6, 0, 1]).unwrap();
        pipeline.handle_request(Arc::clone(&conn));

        assert!(wait_until(|| conn.is_closed()));
    }

    #[test]
    fn test_read_error_closes_connection() {
        let pipeline = pipeline(Arc::new(Router::new()), Vec::new());

        let (mut client, server) = UnixStream::pair().unwrap();
        let conn = Connection::new(Box::new(server), 0, Weak::new());
        // Declared length exceeds the read buffer
        client.write_all(&[0, 0, 4, 0]).unwrap();
        pipeline.handle_request(Arc::clone(&conn));

        assert!(wait_until(|| conn.is_closed()));
    }

    #[test]
    fn test_frame_decode_error_keeps_connection() {
        let router = Arc::new(Router::new());
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        router.on_error(move |_ctx, err| {
            let _ = err_tx.send(matches!(err, Error::Codec(_)));
        });
        router.route(1, |_ctx| Ok(Payload::Json(json!("ok"))));
        let pipeline = pipeline(router, Vec::new());

        let (client, server) = UnixDatagram::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let conn = Connection::new(Box::new(server), 0, Weak::new());

        client.send(&[0, 0, 0, 3, 1]).unwrap();
        pipeline.handle_request(Arc::clone(&conn));
        assert!(err_rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(!conn.is_closed());

        // The next datagram on the same connection is served normally.
        assert!(wait_until(|| conn.try_dispatch().is_some()));
        client.send(&request(1, 0, json!({}))).unwrap();
        pipeline.handle_request(Arc::clone(&conn));

        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        let reply = Codec::default().decode(buf[..n].to_vec()).unwrap();
        assert_eq!(reply.seq, 1);
        assert_eq!(reply.body(), br#""ok""#);
    }

    #[test]
    fn test_partial_frame_does_not_block_caller() {
        let router = Arc::new(Router::new());
        router.route(1, |_ctx| Ok(Payload::Json(json!("ok"))));
        let pipeline = pipeline(router, Vec::new());

        let (mut stalled, stalled_server) = UnixStream::pair().unwrap();
        let stalled_conn = Connection::new(Box::new(stalled_server), 0, Weak::new());
        // Length prefix only, the rest never arrives.
        stalled.write_all(&[0, 0, 0, 20]).unwrap();

        let (mut healthy, healthy_server) = UnixStream::pair().unwrap();
        healthy
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let healthy_conn = Connection::new(Box::new(healthy_server), 0, Weak::new());
        healthy.write_all(&request(1, 0, json!({}))).unwrap();

        let started = Instant::now();
        pipeline.handle_request(Arc::clone(&stalled_conn));
        pipeline.handle_request(Arc::clone(&healthy_conn));
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut header = [0u8; 10];
        healthy.read_exact(&mut header).unwrap();
        assert_eq!(i16::from_be_bytes([header[6], header[7]]), 1);

        // Closing the stalled connection wakes its worker with EOF.
        stalled_conn.close();
    }

    #[test]
    fn test_busy_connection_is_skipped() {
        let router = Arc::new(Router::new());
        let (handled_tx, handled_rx) = crossbeam_channel::unbounded();
        router.route(1, move |_ctx| {
            let _ = handled_tx.send(());
            Ok(Payload::Json(json!(null)))
        });
        let pipeline = pipeline(router, Vec::new());

        let (mut client, server) = UnixStream::pair().unwrap();
        let conn = Connection::new(Box::new(server), 0, Weak::new());
        client.write_all(&request(1, 0, json!({}))).unwrap();

        let guard = conn.try_dispatch().unwrap();
        pipeline.handle_request(Arc::clone(&conn));
        assert!(handled_rx.recv_timeout(Duration::from_millis(200)).is_err());

        drop(guard);
        pipeline.handle_request(Arc::clone(&conn));
        handled_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!conn.is_closed());
    }
}
