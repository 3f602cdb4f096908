use bytes::Bytes;
use prost::Message;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::CodecError;
use crate::message::{BusMessage, MessageContainer};

/// Frames above this size are treated as a corrupt stream.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Wrap `message` in a [`MessageContainer`] and encode it.
pub fn encode(message: &BusMessage) -> Bytes {
    let container = MessageContainer {
        type_name: message.type_name().to_string(),
        message: Some(message.clone()),
    };
    Bytes::from(container.encode_to_vec())
}

/// Decode a container and check its type tag against the payload variant.
pub fn decode(buf: &[u8]) -> Result<BusMessage, CodecError> {
    let container = MessageContainer::decode(buf)?;
    let Some(message) = container.message else {
        return Err(CodecError::UnknownType(container.type_name));
    };
    if message.type_name() != container.type_name {
        return Err(CodecError::TypeMismatch {
            tag: container.type_name,
            actual: message.type_name(),
        });
    }
    Ok(message)
}

/// `[u32 little-endian length][payload]` framing used by the TCP mesh.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}
