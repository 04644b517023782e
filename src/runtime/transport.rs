//! Transport streams accepted by the server.
//!
//! A transport exposes its socket descriptor directly so the poller never
//! has to introspect the stream. Framing decides how one message is read:
//! length-prefixed streams read the prefix first, frame-based transports
//! deliver one packet per read.

use bytes::Buf;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixStream};

/// How message boundaries are found on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Byte stream; each message starts with its total length.
    LengthPrefixed,
    /// Message-oriented; one transport frame is exactly one packet.
    Message,
}

/// An accepted connection stream.
///
/// Reads happen from the shard consumer that owns the connection, writes may
/// come from any worker. Implementations must accept both through `&self`.
pub trait Transport: Send + Sync + 'static {
    /// OS-level handle registered with the poller.
    fn socket_descriptor(&self) -> RawFd;

    /// Message boundary discipline of this transport.
    fn framing(&self) -> Framing {
        Framing::LengthPrefixed
    }

    /// Read available bytes (stream) or one frame (message transports).
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete message.
    fn write(&self, buf: &[u8]) -> io::Result<()>;

    /// Shut the transport down in both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn socket_descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        <&TcpStream as Read>::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        <&TcpStream as Write>::write_all(&mut &*self, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl Transport for UnixStream {
    fn socket_descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        <&UnixStream as Read>::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        <&UnixStream as Write>::write_all(&mut &*self, buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

impl Transport for UnixDatagram {
    fn socket_descriptor(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn framing(&self) -> Framing {
        Framing::Message
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let n = self.send(buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram truncated on send",
            ));
        }
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixDatagram::shutdown(self, Shutdown::Both)
    }
}

/// Read exactly one framed message into `buf`.
///
/// Returns the message length; the message occupies `buf[..n]` including
/// its length prefix. A zero-length read means the peer went away.
pub fn read_message(
    stream: &dyn Transport,
    buf: &mut [u8],
    length_field_size: usize,
) -> io::Result<usize> {
    match stream.framing() {
        Framing::Message => {
            let n = read_some(stream, buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
            }
            Ok(n)
        }
        Framing::LengthPrefixed => read_length_prefixed(stream, buf, length_field_size),
    }
}

fn read_length_prefixed(
    stream: &dyn Transport,
    buf: &mut [u8],
    length_field_size: usize,
) -> io::Result<usize> {
    if buf.len() < length_field_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "read buffer smaller than length prefix",
        ));
    }

    read_exact(stream, &mut buf[..length_field_size])?;

    let declared = (&buf[..length_field_size]).get_uint(length_field_size);
    if declared < length_field_size as u64 || declared > buf.len() as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "packet exceeded: declared {} bytes, buffer holds {}",
                declared,
                buf.len()
            ),
        ));
    }

    let length = declared as usize;
    read_exact(stream, &mut buf[length_field_size..length])?;
    Ok(length)
}

fn read_some(stream: &dyn Transport, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(buf) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn read_exact(stream: &dyn Transport, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match read_some(stream, buf)? {
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF")),
            n => buf = &mut buf[n..],
        }
    }
    Ok(())
}
