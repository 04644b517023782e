//! Decoded packet.

use crate::runtime::Reset;
use std::fmt;
use std::ops::Range;

/// Options bit selecting JSON bodies.
pub const OPTION_JSON: i16 = 0x0001;

/// Body encoding negotiated through the header options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Json,
    Binary,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Json => write!(f, "json"),
            ContentType::Binary => write!(f, "binary"),
        }
    }
}

/// One protocol message.
///
/// The packet owns the frame it was decoded from; the body is a range into
/// that frame. Use `take_frame` to hand the buffer back to its pool.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub operate: i16,
    pub seq: i16,
    pub options: i16,
    frame: Vec<u8>,
    body: Range<usize>,
}

impl Packet {
    pub fn new(operate: i16, seq: i16, content_type: ContentType) -> Self {
        let mut packet = Self {
            operate,
            seq,
            ..Self::default()
        };
        packet.set_content_type(content_type);
        packet
    }

    pub fn content_type(&self) -> ContentType {
        if self.options & OPTION_JSON != 0 {
            ContentType::Json
        } else {
            ContentType::Binary
        }
    }

    pub fn set_content_type(&mut self, content_type: ContentType) {
        match content_type {
            ContentType::Json => self.options |= OPTION_JSON,
            ContentType::Binary => self.options &= !OPTION_JSON,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.frame[self.body.clone()]
    }

    /// The whole wire frame, header included.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Detach the frame buffer, leaving the packet with an empty body.
    pub fn take_frame(&mut self) -> Vec<u8> {
        self.body = 0..0;
        std::mem::take(&mut self.frame)
    }

    /// Adopt `frame` with the body starting at `body_start`.
    pub(crate) fn set_frame(&mut self, frame: Vec<u8>, body_start: usize) {
        let end = frame.len();
        self.body = body_start.min(end)..end;
        self.frame = frame;
    }

    /// Replace the body, keeping `header_size` bytes reserved in front.
    pub(crate) fn set_body(&mut self, header_size: usize, body: &[u8]) {
        self.frame.resize(header_size, 0);
        self.frame.extend_from_slice(body);
        self.body = header_size..self.frame.len();
    }

    /// Mutable access to the reserved header bytes.
    pub(crate) fn header_mut(&mut self, header_size: usize) -> &mut [u8] {
        if self.frame.len() < header_size {
            self.set_body(header_size, &[]);
        }
        &mut self.frame[..header_size]
    }
}

impl Reset for Packet {
    fn reset(&mut self) {
        self.operate = 0;
        self.seq = 0;
        self.options = 0;
        self.frame.clear();
        self.body = 0..0;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("operate", &self.operate)
            .field("seq", &self.seq)
            .field("options", &self.options)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_bit() {
        let mut packet = Packet::new(1, 0, ContentType::Json);
        assert_eq!(packet.options, OPTION_JSON);
        assert_eq!(packet.content_type(), ContentType::Json);

        packet.options |= 0x0100;
        packet.set_content_type(ContentType::Binary);
        assert_eq!(packet.options, 0x0100);
        assert_eq!(packet.content_type(), ContentType::Binary);
    }

    #[test]
    fn test_set_body_keeps_header_room() {
        let mut packet = Packet::default();
        packet.set_body(10, b"abc");
        assert_eq!(packet.frame().len(), 13);
        assert_eq!(packet.body(), b"abc");

        packet.set_body(10, b"longer body");
        assert_eq!(packet.body(), b"longer body");
        assert_eq!(packet.frame().len(), 21);
    }

    #[test]
    fn test_take_frame_and_reset() {
        let mut packet = Packet::new(3, 4, ContentType::Binary);
        packet.set_frame(vec![0u8; 12], 10);
        assert_eq!(packet.body().len(), 2);

        let frame = packet.take_frame();
        assert_eq!(frame.len(), 12);
        assert!(packet.body().is_empty());

        packet.reset();
        assert_eq!(packet, Packet::default());
    }
}
