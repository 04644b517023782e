//! Blocking client for the framed protocol.

use crate::error::Result;
use crate::protocol::{Codec, Packet, Payload};
use crate::runtime::{read_message, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// One TCP connection speaking the packet protocol.
///
/// Requests are numbered from zero; the server answers with the request's
/// sequence number plus one.
pub struct Client {
    stream: TcpStream,
    codec: Codec,
    seq: i16,
    max_response_size: usize,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "Client connected");

        Ok(Self {
            stream,
            codec: Codec::default(),
            seq: 0,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        })
    }

    /// Use `codec` instead of the default 4-byte length layout.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }

    /// Apply `timeout` to both reads and writes.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)
    }

    /// Send one request and return the sequence number it carried.
    pub fn send(&mut self, operate: i16, payload: &Payload) -> Result<i16> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let mut packet = Packet::new(operate, seq, payload.content_type());
        self.codec.marshal(&mut packet, payload)?;
        let frame = self.codec.encode(&mut packet)?;
        Transport::write(&self.stream, frame)?;
        Ok(seq)
    }

    /// Block until one response packet arrives.
    pub fn receive(&mut self) -> Result<Packet> {
        let mut buf = vec![0u8; self.max_response_size];
        let n = read_message(&self.stream, &mut buf, self.codec.length_field_size())?;
        buf.truncate(n);
        Ok(self.codec.decode(buf)?)
    }

    /// Send `payload` and wait for the response.
    pub fn request(&mut self, operate: i16, payload: &Payload) -> Result<Packet> {
        self.send(operate, payload)?;
        self.receive()
    }

    /// JSON request with a typed response body.
    pub fn request_json<Req, Resp>(&mut self, operate: i16, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let reply = self.request(operate, &Payload::json(request)?)?;
        Ok(self.codec.unmarshal(&reply)?.into_typed()?)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        Transport::shutdown(&self.stream)
    }
}
