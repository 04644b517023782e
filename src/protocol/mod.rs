//! Wire protocol: packet framing, header codec and body marshalling.

mod codec;
mod marshal;
mod packet;

pub use codec::{Codec, DEFAULT_LENGTH_FIELD_SIZE};
pub use marshal::{BinaryMarshaller, JsonMarshaller, Marshaller, Payload};
pub use packet::{ContentType, Packet, OPTION_JSON};

use thiserror::Error;

/// Framing and marshalling failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected message: {len} bytes is shorter than the {header} byte header")]
    UnexpectedMessage { len: usize, header: usize },

    #[error("unexpected packet length: header declares {declared}, frame has {actual}")]
    UnexpectedLength { declared: u64, actual: usize },

    #[error("packet exceeded: {0} bytes does not fit the length field")]
    PacketTooLarge(usize),

    #[error("unsupported payload for {0} content")]
    UnsupportedPayload(ContentType),

    #[error("invalid length field size {0}, expected 1 to 8 bytes")]
    InvalidLengthField(usize),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
