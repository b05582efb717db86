#![forbid(unsafe_code)]

//! A typed session-protocol engine.
//!
//! A protocol is described once — states, per-state agency, and declared
//! message transitions — and both endpoints are written as [`Peer`]
//! programs: suspendable instruction trees that yield, await, pipeline,
//! and finish. The [`Driver`] executes a peer against an abstract byte
//! [`Channel`] through an incremental [`Codec`], enforcing agency,
//! transition soundness, and pipeline queue discipline at every step.
//!
//! The [`handshake`] module is the bundled concrete instance: a CBOR
//! version-negotiation protocol with client and server peers, refusal
//! reasons, and simultaneous-open resolution.

pub mod channel;
pub mod codec;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod limits;
pub mod protocol;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the engine surface at the crate root for convenience.
pub use crate::channel::{Channel, ChannelError, InMemoryChannel, TryRecv};
pub use crate::codec::{Codec, CodecError, DecodeStep, MessageDecode};
pub use crate::driver::{
    CancelToken, Driver, DriverError, DriverEvent, DriverFailure, DriverState,
};
pub use crate::limits::Limits;
pub use crate::protocol::{
    Agency, Peer, PeerBuildError, PeerRole, Protocol, RelativeAgency, UnexpectedMessage,
};
