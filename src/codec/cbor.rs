//! Incremental decode adapter for CBOR message parsers.
//!
//! `minicbor` parses complete items only, so incremental decoding works by
//! accumulating chunks and re-attempting a full parse after each one. A
//! parse that ran off the end of the buffer reports [`CodecError::Truncated`],
//! which the adapter treats as "need more input" while the stream is open
//! and as a hard failure once end-of-input is signalled.

use std::convert::Infallible;
use std::marker::PhantomData;

use bytes::Bytes;
use minicbor::Decoder;

use super::{CodecError, DecodeStep, MessageDecode};
use crate::protocol::Protocol;

impl From<minicbor::decode::Error> for CodecError {
    fn from(err: minicbor::decode::Error) -> Self {
        if err.is_end_of_input() {
            CodecError::Truncated
        } else {
            CodecError::Malformed(err.to_string())
        }
    }
}

impl From<minicbor::encode::Error<Infallible>> for CodecError {
    fn from(err: minicbor::encode::Error<Infallible>) -> Self {
        CodecError::Encode(err.to_string())
    }
}

/// An accumulating [`MessageDecode`] over a CBOR item parser.
///
/// `parse` must consume exactly one message starting at the decoder's
/// current position; bytes past that position become leftover.
pub struct CborDecode<P, F> {
    buf: Vec<u8>,
    max_bytes: usize,
    parse: F,
    _marker: PhantomData<fn() -> P>,
}

impl<P, F> CborDecode<P, F>
where
    P: Protocol + 'static,
    F: Fn(&mut Decoder<'_>) -> Result<P::Message, CodecError> + Send + 'static,
{
    pub fn new(max_bytes: usize, parse: F) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
            parse,
            _marker: PhantomData,
        }
    }

    fn attempt(mut self: Box<Self>, at_eof: bool) -> DecodeStep<P> {
        let mut dec = Decoder::new(&self.buf);
        match (self.parse)(&mut dec) {
            Ok(message) => {
                let leftover = Bytes::copy_from_slice(&self.buf[dec.position()..]);
                DecodeStep::Done { message, leftover }
            }
            Err(CodecError::Truncated) if !at_eof => DecodeStep::Partial(self),
            Err(reason) => {
                let leftover = Bytes::from(std::mem::take(&mut self.buf));
                DecodeStep::Fail { reason, leftover }
            }
        }
    }
}

impl<P, F> MessageDecode<P> for CborDecode<P, F>
where
    P: Protocol + 'static,
    F: Fn(&mut Decoder<'_>) -> Result<P::Message, CodecError> + Send + 'static,
{
    fn feed(mut self: Box<Self>, chunk: Option<&[u8]>) -> DecodeStep<P> {
        match chunk {
            Some(chunk) => {
                let got = self.buf.len().saturating_add(chunk.len());
                if got > self.max_bytes {
                    let reason = CodecError::MessageTooLarge {
                        max: self.max_bytes,
                        got,
                    };
                    let leftover = Bytes::from(std::mem::take(&mut self.buf));
                    return DecodeStep::Fail { reason, leftover };
                }
                self.buf.extend_from_slice(chunk);
                self.attempt(false)
            }
            None => self.attempt(true),
        }
    }
}
