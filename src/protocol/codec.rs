//! Header codec.
//!
//! Wire layout, big-endian:
//!
//! ```text
//! |------------------ header ------------------|------ body ------|
//! | length (L) | operate (2) | seq (2) | options (2) |       n        |
//! ```
//!
//! `length` counts the whole message, header included. `L` defaults to 4
//! and may be 1 to 8 bytes; all offsets are fixed when the codec is built.

use crate::protocol::marshal::{BinaryMarshaller, JsonMarshaller, Marshaller, Payload};
use crate::protocol::{CodecError, ContentType, Packet};
use bytes::{Buf, BufMut};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_LENGTH_FIELD_SIZE: usize = 4;

const FIELD_SIZE: usize = 2;

/// Header field offsets, computed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeaderLayout {
    length_size: usize,
    operate_offset: usize,
    header_size: usize,
}

impl HeaderLayout {
    fn new(length_size: usize) -> Self {
        Self {
            length_size,
            operate_offset: length_size,
            header_size: length_size + 3 * FIELD_SIZE,
        }
    }

    fn max_length(&self) -> u64 {
        if self.length_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.length_size)) - 1
        }
    }
}

#[derive(Clone)]
pub struct Codec {
    layout: HeaderLayout,
    json: Arc<dyn Marshaller>,
    binary: Arc<dyn Marshaller>,
}

impl Codec {
    /// Build a codec whose length field is `length_field_size` bytes wide.
    pub fn new(length_field_size: usize) -> Result<Self, CodecError> {
        if !(1..=8).contains(&length_field_size) {
            return Err(CodecError::InvalidLengthField(length_field_size));
        }
        Ok(Self::with_layout(HeaderLayout::new(length_field_size)))
    }

    fn with_layout(layout: HeaderLayout) -> Self {
        Self {
            layout,
            json: Arc::new(JsonMarshaller),
            binary: Arc::new(BinaryMarshaller),
        }
    }

    /// Replace the marshaller for its content type.
    pub fn with_marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        match marshaller.content_type() {
            ContentType::Json => self.json = marshaller,
            ContentType::Binary => self.binary = marshaller,
        }
        self
    }

    pub fn header_size(&self) -> usize {
        self.layout.header_size
    }

    pub fn length_field_size(&self) -> usize {
        self.layout.length_size
    }

    pub fn marshaller(&self, content_type: ContentType) -> &dyn Marshaller {
        match content_type {
            ContentType::Json => self.json.as_ref(),
            ContentType::Binary => self.binary.as_ref(),
        }
    }

    /// Write the header in front of the packet body and return the frame.
    pub fn encode<'a>(&self, packet: &'a mut Packet) -> Result<&'a [u8], CodecError> {
        let header_size = self.layout.header_size;
        let (operate, seq, options) = (packet.operate, packet.seq, packet.options);

        let total = packet.frame().len().max(header_size);
        if total as u64 > self.layout.max_length() {
            return Err(CodecError::PacketTooLarge(total));
        }

        let mut header = packet.header_mut(header_size);
        header.put_uint(total as u64, self.layout.length_size);
        header.put_i16(operate);
        header.put_i16(seq);
        header.put_i16(options);

        Ok(packet.frame())
    }

    /// Decode a complete frame into a new packet.
    pub fn decode(&self, frame: Vec<u8>) -> Result<Packet, CodecError> {
        let mut packet = Packet::default();
        self.decode_into(&mut packet, frame)?;
        Ok(packet)
    }

    /// Decode `frame` into `packet`.
    ///
    /// The packet takes the frame even on failure so the caller can return
    /// it to its pool with `Packet::take_frame`.
    pub fn decode_into(&self, packet: &mut Packet, frame: Vec<u8>) -> Result<(), CodecError> {
        let header_size = self.layout.header_size;
        let len = frame.len();
        if len < header_size {
            packet.set_frame(frame, len);
            return Err(CodecError::UnexpectedMessage {
                len,
                header: header_size,
            });
        }

        let declared = (&frame[..self.layout.length_size]).get_uint(self.layout.length_size);
        if declared != len as u64 {
            packet.set_frame(frame, len);
            return Err(CodecError::UnexpectedLength {
                declared,
                actual: len,
            });
        }

        let mut fields = &frame[self.layout.operate_offset..header_size];
        packet.operate = fields.get_i16();
        packet.seq = fields.get_i16();
        packet.options = fields.get_i16();
        packet.set_frame(frame, header_size);
        Ok(())
    }

    /// Marshal `payload` with the packet's content type into its body.
    pub fn marshal(&self, packet: &mut Packet, payload: &Payload) -> Result<(), CodecError> {
        let body = self.marshaller(packet.content_type()).marshal(payload)?;
        packet.set_body(self.layout.header_size, &body);
        Ok(())
    }

    /// Unmarshal the packet body with its content type.
    pub fn unmarshal(&self, packet: &Packet) -> Result<Payload, CodecError> {
        self.marshaller(packet.content_type())
            .unmarshal(packet.body())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::with_layout(HeaderLayout::new(DEFAULT_LENGTH_FIELD_SIZE))
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").field("layout", &self.layout).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(codec: &Codec, operate: i16, seq: i16, ct: ContentType, payload: Payload) -> Vec<u8> {
        let mut packet = Packet::new(operate, seq, ct);
        codec.marshal(&mut packet, &payload).unwrap();
        codec.encode(&mut packet).unwrap().to_vec()
    }

    #[test]
    fn test_wire_layout() {
        let codec = Codec::default();
        let frame = encoded(&codec, 1, 1, ContentType::Json, Payload::Json(json!({"foo": "bar"})));

        assert_eq!(codec.header_size(), 10);
        assert_eq!(&frame[..10], &[0, 0, 0, 23, 0, 1, 0, 1, 0, 1]);
        assert_eq!(&frame[10..], br#"{"foo":"bar"}"#);
    }

    #[test]
    fn test_round_trip() {
        let codec = Codec::default();
        let cases = [
            (1, 1, ContentType::Json, Payload::Json(json!({"foo": "bar"}))),
            (-7, i16::MAX, ContentType::Binary, Payload::binary(vec![1u8, 2, 3])),
            (0, i16::MIN, ContentType::Binary, Payload::binary(Vec::new())),
        ];

        for (operate, seq, ct, payload) in cases {
            let frame = encoded(&codec, operate, seq, ct, payload.clone());
            let packet = codec.decode(frame).unwrap();

            assert_eq!(packet.operate, operate);
            assert_eq!(packet.seq, seq);
            assert_eq!(packet.content_type(), ct);
            assert_eq!(codec.unmarshal(&packet).unwrap(), payload);
        }
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let codec = Codec::default();
        let frame = encoded(&codec, 2, 5, ContentType::Binary, Payload::binary(&b"body"[..]));

        for len in 0..codec.header_size() {
            let err = codec.decode(frame[..len].to_vec()).unwrap_err();
            assert!(matches!(err, CodecError::UnexpectedMessage { .. }), "len {len}");
        }
        for len in codec.header_size()..frame.len() {
            let err = codec.decode(frame[..len].to_vec()).unwrap_err();
            assert!(matches!(err, CodecError::UnexpectedLength { .. }), "len {len}");
        }
    }

    #[test]
    fn test_failed_decode_keeps_frame() {
        let codec = Codec::default();
        let mut packet = Packet::default();
        let frame = vec![0u8, 0, 0, 99, 0, 1, 0, 0, 0, 0, 1];

        assert!(codec.decode_into(&mut packet, frame).is_err());
        assert_eq!(packet.take_frame().len(), 11);
    }

    #[test]
    fn test_custom_length_field() {
        let codec = Codec::new(2).unwrap();
        assert_eq!(codec.header_size(), 8);

        let frame = encoded(&codec, 9, 3, ContentType::Binary, Payload::binary(&b"xy"[..]));
        assert_eq!(&frame[..2], &[0, 10]);

        let packet = codec.decode(frame).unwrap();
        assert_eq!(packet.operate, 9);
        assert_eq!(packet.body(), b"xy");
    }

    #[test]
    fn test_packet_too_large_for_length_field() {
        let codec = Codec::new(1).unwrap();
        let mut packet = Packet::new(1, 1, ContentType::Binary);
        codec
            .marshal(&mut packet, &Payload::binary(vec![0u8; 300]))
            .unwrap();

        assert!(matches!(
            codec.encode(&mut packet),
            Err(CodecError::PacketTooLarge(307))
        ));
    }

    #[test]
    fn test_invalid_length_field_size() {
        assert!(Codec::new(0).is_err());
        assert!(Codec::new(9).is_err());
        assert!(Codec::new(8).is_ok());
    }

    #[test]
    fn test_encode_in_place_after_decode() {
        let codec = Codec::default();
        let frame = encoded(&codec, 4, 10, ContentType::Json, Payload::Json(json!([1, 2])));

        let mut packet = codec.decode(frame).unwrap();
        packet.seq = packet.seq.wrapping_add(1);
        let out = codec.encode(&mut packet).unwrap().to_vec();

        let again = codec.decode(out).unwrap();
        assert_eq!(again.seq, 11);
        assert_eq!(again.body(), b"[1,2]");
    }
}
