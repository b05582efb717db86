use thiserror::Error;

use crate::channel::ChannelError;
use crate::codec::CodecError;
use crate::driver::DriverFailure;
use crate::handshake::HandshakeError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the per-subsystem errors
/// for hosts that want a single type at their boundary.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] DriverFailure),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
