//! Typed message codecs with resumable, incremental decoding.

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::Protocol;

pub mod cbor;

/// Serializer/deserializer for one protocol, parametrized by the protocol
/// state the message is sent or expected in.
pub trait Codec<P: Protocol> {
    /// Encode a message legal from `state`. One encoding per message.
    fn encode(&self, state: &P::State, message: &P::Message) -> Result<Vec<u8>, CodecError>;

    /// Begin decoding the next message expected in `state`.
    fn start_decode(&self, state: &P::State) -> Box<dyn MessageDecode<P>>;
}

/// A resumable decoder for a single message.
pub trait MessageDecode<P: Protocol>: Send {
    /// Feed the next chunk of input. `None` signals end-of-input; a
    /// decoder holding an incomplete message must fail on it.
    fn feed(self: Box<Self>, chunk: Option<&[u8]>) -> DecodeStep<P>;
}

/// Result of feeding one chunk into a [`MessageDecode`].
pub enum DecodeStep<P: Protocol> {
    /// More input is required.
    Partial(Box<dyn MessageDecode<P>>),
    /// A full message was decoded; `leftover` holds the unconsumed tail,
    /// which seeds the next decode.
    Done {
        message: P::Message,
        leftover: Bytes,
    },
    /// The input does not decode to any message legal from the state the
    /// decoder was started in.
    Fail { reason: CodecError, leftover: Bytes },
}

/// Codec failures, on either the encode or decode side.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("input ended inside a message")]
    Truncated,
    #[error("message exceeds limit: {got} > {max} bytes")]
    MessageTooLarge { max: usize, got: usize },
    #[error("version {0} is not recognised")]
    UnknownVersion(u64),
}

impl CodecError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        CodecError::Malformed(detail.into())
    }
}
