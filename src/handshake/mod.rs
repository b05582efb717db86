//! Version-negotiation handshake.
//!
//! A three-state protocol: the client proposes a set of versions with
//! per-version parameters, the server accepts one (possibly refining its
//! parameters) or refuses, and the session ends. When both endpoints are
//! configured to initiate, each receives the other's proposal where it
//! expected a confirmation and resolves the negotiation locally
//! (simultaneous open).

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::codec::CodecError;
use crate::driver::DriverFailure;
use crate::protocol::{Agency, Protocol};

mod client;
mod codec;
mod server;

pub use client::{client_peer, run_client};
pub use codec::HandshakeCodec;
pub use server::{run_server, server_peer};

/// A protocol version tag as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionNumber(u64);

impl VersionNumber {
    pub const fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Application-supplied behaviour of one version's parameters.
///
/// Parameters are opaque to the engine: each version encodes and decodes
/// exactly one CBOR item, validates a server's selection, and negotiates
/// a common refinement.
pub trait VersionParams: Clone + fmt::Debug + Send + 'static {
    /// Whether this application knows how to decode `version`'s params.
    fn known_version(version: VersionNumber) -> bool;

    /// Write the parameters as exactly one CBOR item.
    fn encode_params(
        &self,
        version: VersionNumber,
        enc: &mut Encoder<&mut Vec<u8>>,
    ) -> Result<(), CodecError>;

    /// Read the parameters for a known `version`.
    fn decode_params(version: VersionNumber, dec: &mut Decoder<'_>) -> Result<Self, CodecError>;

    /// Client-side check of the parameters a server accepted with.
    fn acceptable(&self, offered: &Self) -> Result<(), String>;

    /// Combine our parameters with the remote's for the same version.
    ///
    /// Must be symmetric: `a.negotiate(b)` and `b.negotiate(a)` return the
    /// same value. Simultaneous open relies on both sides computing the
    /// agreed parameters independently; the engine does not verify the
    /// symmetry, but the handshake tests exercise it.
    fn negotiate(&self, remote: &Self) -> Result<Self, String>;
}

/// The versions a proposal carried, keyed ascending, plus the raw tags of
/// versions this side could not decode parameters for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionMap<D> {
    known: BTreeMap<VersionNumber, D>,
    unknown: Vec<u64>,
}

impl<D> VersionMap<D> {
    pub fn from_known(known: BTreeMap<VersionNumber, D>) -> Self {
        Self {
            known,
            unknown: Vec::new(),
        }
    }

    pub(crate) fn from_parts(known: BTreeMap<VersionNumber, D>, unknown: Vec<u64>) -> Self {
        Self { known, unknown }
    }

    pub fn known(&self) -> &BTreeMap<VersionNumber, D> {
        &self.known
    }

    pub fn unknown(&self) -> &[u64] {
        &self.unknown
    }

    /// Every version tag the proposal carried, ascending.
    pub fn raw_tags(&self) -> Vec<u64> {
        let mut tags: Vec<u64> = self
            .known
            .keys()
            .map(|version| version.get())
            .chain(self.unknown.iter().copied())
            .collect();
        tags.sort_unstable();
        tags
    }
}

/// Handshake protocol states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Client agency: awaiting the proposal.
    Propose,
    /// Server agency: awaiting the verdict.
    Confirm,
    /// Terminal.
    Done,
}

/// Handshake messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeMessage<D> {
    /// The initiator's version proposal.
    ProposeVersions(VersionMap<D>),
    /// A proposal received where a verdict was expected: the remote also
    /// initiated (simultaneous open). Never encoded explicitly.
    CrossedVersions(VersionMap<D>),
    /// The server's selection, with its (possibly refined) parameters.
    AcceptVersion(VersionNumber, D),
    /// The server's refusal.
    Refuse(RefuseReason),
}

/// Why a server refused a proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefuseReason {
    /// No common version; echoes what the server supports and every raw
    /// tag the client sent.
    VersionMismatch {
        server_known: Vec<VersionNumber>,
        client_tags: Vec<u64>,
    },
    /// The server could not decode the parameters for a version.
    DecodeFailure {
        version: VersionNumber,
        message: String,
    },
    /// The version was acceptable but its parameters were not.
    Refused {
        version: VersionNumber,
        message: String,
    },
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefuseReason::VersionMismatch {
                server_known,
                client_tags,
            } => {
                let known: Vec<String> = server_known.iter().map(|v| v.to_string()).collect();
                write!(
                    f,
                    "version mismatch: server knows [{}], client sent {:?}",
                    known.join(", "),
                    client_tags
                )
            }
            RefuseReason::DecodeFailure { version, message } => {
                write!(f, "params for {version} failed to decode: {message}")
            }
            RefuseReason::Refused { version, message } => {
                write!(f, "{version} refused: {message}")
            }
        }
    }
}

/// Marker type instantiating [`Protocol`] for the handshake over a
/// parameter type `D`.
pub struct Handshake<D> {
    _params: PhantomData<fn() -> D>,
}

impl<D: VersionParams> Protocol for Handshake<D> {
    type State = HandshakeState;
    type Message = HandshakeMessage<D>;

    fn agency(state: &HandshakeState) -> Agency {
        match state {
            HandshakeState::Propose => Agency::Client,
            HandshakeState::Confirm => Agency::Server,
            HandshakeState::Done => Agency::Nobody,
        }
    }

    fn transition(
        state: &HandshakeState,
        message: &HandshakeMessage<D>,
    ) -> Option<HandshakeState> {
        match (state, message) {
            (HandshakeState::Propose, HandshakeMessage::ProposeVersions(_)) => {
                Some(HandshakeState::Confirm)
            }
            (HandshakeState::Confirm, HandshakeMessage::CrossedVersions(_))
            | (HandshakeState::Confirm, HandshakeMessage::AcceptVersion(_, _))
            | (HandshakeState::Confirm, HandshakeMessage::Refuse(_)) => Some(HandshakeState::Done),
            _ => None,
        }
    }
}

/// A successful negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Negotiated<D> {
    pub version: VersionNumber,
    pub params: D,
}

/// Handshake failures surfaced to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The remote server refused the proposal on the wire.
    #[error("peer refused: {0}")]
    Refused(RefuseReason),
    /// The server accepted a version not in our proposal, or with
    /// parameters we cannot accept.
    #[error("invalid server selection of {version}: {reason}")]
    InvalidServerSelection {
        version: VersionNumber,
        reason: String,
    },
    /// The server accepted with a version tag whose parameters we cannot
    /// decode.
    #[error("server selected unrecognised version {0}")]
    NotRecognisedVersion(VersionNumber),
    /// Simultaneous open with no common version; nothing was sent and the
    /// caller should close the channel.
    #[error("no common version with peer")]
    NoCommonVersion {
        local: Vec<VersionNumber>,
        remote: Vec<u64>,
    },
    /// Simultaneous open where the symmetric negotiation produced
    /// parameters this side rejects; the caller should close the channel.
    #[error("negotiated parameters rejected: {0}")]
    ParamsRejected(String),
    /// Transport- or protocol-level failure.
    #[error(transparent)]
    Driver(#[from] DriverFailure),
}

/// Highest version present in both maps.
pub(crate) fn highest_common<D>(
    local: &BTreeMap<VersionNumber, D>,
    remote: &BTreeMap<VersionNumber, D>,
) -> Option<VersionNumber> {
    local
        .keys()
        .rev()
        .find(|version| remote.contains_key(version))
        .copied()
}
