//! Abstract byte channels and an in-memory duplex pair.

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, TryRecvError, unbounded};
use thiserror::Error;

/// Channel failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

/// Outcome of a non-blocking receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TryRecv {
    /// A chunk of at least one byte.
    Data(Bytes),
    /// Nothing available right now.
    Empty,
    /// Orderly close; no further data will arrive.
    Closed,
}

/// A bidirectional, in-order, opaque byte transport.
///
/// Chunk boundaries carry no meaning: a receiver may observe any split of
/// the sent byte stream, and reassembly is the codec's job. Duplication
/// and reordering are forbidden.
pub trait Channel {
    /// Append bytes to the ordered stream. May block on backpressure.
    fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;

    /// Block for the next chunk; `None` on orderly close.
    fn recv(&mut self) -> Result<Option<Bytes>, ChannelError>;

    /// Non-blocking receive.
    fn try_recv(&mut self) -> Result<TryRecv, ChannelError>;

    /// Close the channel: subsequent `send`s fail and `recv` returns `None`.
    fn close(&mut self);
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        (**self).send(bytes)
    }

    fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        (**self).recv()
    }

    fn try_recv(&mut self) -> Result<TryRecv, ChannelError> {
        (**self).try_recv()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// One end of an in-process duplex byte channel.
///
/// Built on `crossbeam` queues; used by tests and by hosts that run both
/// peers inside one process.
pub struct InMemoryChannel {
    tx: Option<Sender<Bytes>>,
    rx: Receiver<Bytes>,
    /// When set, outgoing sends are split into chunks of at most this many
    /// bytes, exercising receivers against arbitrary chunk boundaries.
    chunk_bytes: Option<usize>,
    closed: bool,
}

impl InMemoryChannel {
    /// A connected pair of channel ends.
    pub fn pair() -> (InMemoryChannel, InMemoryChannel) {
        Self::pair_inner(None)
    }

    /// A connected pair whose sends are fragmented into chunks of at most
    /// `chunk_bytes` bytes.
    pub fn pair_chunked(chunk_bytes: usize) -> (InMemoryChannel, InMemoryChannel) {
        Self::pair_inner(Some(chunk_bytes.max(1)))
    }

    fn pair_inner(chunk_bytes: Option<usize>) -> (InMemoryChannel, InMemoryChannel) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let a = InMemoryChannel {
            tx: Some(a_tx),
            rx: b_rx,
            chunk_bytes,
            closed: false,
        };
        let b = InMemoryChannel {
            tx: Some(b_tx),
            rx: a_rx,
            chunk_bytes,
            closed: false,
        };
        (a, b)
    }

    fn push(&self, chunk: Bytes) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(chunk).map_err(|_| ChannelError::Closed)
    }
}

impl Channel for InMemoryChannel {
    fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        match self.chunk_bytes {
            None => self.push(Bytes::copy_from_slice(bytes)),
            Some(limit) => {
                for chunk in bytes.chunks(limit) {
                    self.push(Bytes::copy_from_slice(chunk))?;
                }
                Ok(())
            }
        }
    }

    fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        if self.closed {
            return Ok(None);
        }
        match self.rx.recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(_) => Ok(None),
        }
    }

    fn try_recv(&mut self) -> Result<TryRecv, ChannelError> {
        if self.closed {
            return Ok(TryRecv::Closed);
        }
        match self.rx.try_recv() {
            Ok(chunk) => Ok(TryRecv::Data(chunk)),
            Err(TryRecvError::Empty) => Ok(TryRecv::Empty),
            Err(TryRecvError::Disconnected) => Ok(TryRecv::Closed),
        }
    }

    fn close(&mut self) {
        self.tx = None;
        self.closed = true;
    }
}
