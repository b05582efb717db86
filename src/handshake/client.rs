//! Handshake client: propose, then accept the server's verdict.

use std::collections::BTreeMap;

use super::{
    Handshake, HandshakeCodec, HandshakeError, HandshakeMessage, HandshakeState, Negotiated,
    VersionMap, VersionNumber, VersionParams, highest_common,
};
use crate::channel::Channel;
use crate::codec::CodecError;
use crate::driver::{Driver, DriverFailure, DriverState};
use crate::limits::Limits;
use crate::protocol::{Peer, PeerRole, UnexpectedMessage};

type ClientResult<D> = Result<Negotiated<D>, HandshakeError>;

/// The client peer: yield the proposal, await accept, refuse, or a
/// crossed proposal (simultaneous open).
pub fn client_peer<D: VersionParams>(
    proposal: BTreeMap<VersionNumber, D>,
) -> Peer<Handshake<D>, ClientResult<D>> {
    let offer = VersionMap::from_known(proposal.clone());
    Peer::yield_message(
        HandshakeState::Propose,
        HandshakeMessage::ProposeVersions(offer),
        Peer::await_message(HandshakeState::Confirm, move |message| match message {
            HandshakeMessage::AcceptVersion(version, params) => Ok(Peer::done(
                HandshakeState::Done,
                accept_outcome(&proposal, version, params),
            )),
            HandshakeMessage::Refuse(reason) => {
                tracing::debug!(%reason, "handshake refused by peer");
                Ok(Peer::done(
                    HandshakeState::Done,
                    Err(HandshakeError::Refused(reason)),
                ))
            }
            HandshakeMessage::CrossedVersions(remote) => Ok(Peer::done(
                HandshakeState::Done,
                crossed_outcome(&proposal, &remote),
            )),
            HandshakeMessage::ProposeVersions(_) => Err(UnexpectedMessage::new(
                "proposal while awaiting the server verdict",
            )),
        }),
    )
}

fn accept_outcome<D: VersionParams>(
    proposal: &BTreeMap<VersionNumber, D>,
    version: VersionNumber,
    params: D,
) -> ClientResult<D> {
    let Some(local) = proposal.get(&version) else {
        return Err(HandshakeError::InvalidServerSelection {
            version,
            reason: "not in proposal".into(),
        });
    };
    if let Err(reason) = local.acceptable(&params) {
        return Err(HandshakeError::InvalidServerSelection { version, reason });
    }
    tracing::debug!(%version, "handshake accepted");
    Ok(Negotiated { version, params })
}

/// Resolve a simultaneous open: both sides ran the client and each now
/// holds the other's proposal. Both apply the same deterministic
/// selection; nothing further is sent, and on failure the caller closes
/// the channel.
fn crossed_outcome<D: VersionParams>(
    proposal: &BTreeMap<VersionNumber, D>,
    remote: &VersionMap<D>,
) -> ClientResult<D> {
    let Some(version) = highest_common(proposal, remote.known()) else {
        tracing::debug!("simultaneous open with no common version");
        return Err(HandshakeError::NoCommonVersion {
            local: proposal.keys().copied().collect(),
            remote: remote.raw_tags(),
        });
    };
    let ours = &proposal[&version];
    let theirs = &remote.known()[&version];
    let params = ours
        .negotiate(theirs)
        .map_err(HandshakeError::ParamsRejected)?;
    if let Err(reason) = ours.acceptable(&params) {
        return Err(HandshakeError::ParamsRejected(reason));
    }
    tracing::debug!(%version, "simultaneous open resolved");
    Ok(Negotiated { version, params })
}

/// Run the client handshake over `channel` and return the negotiation
/// outcome. The channel stays open; its lifecycle belongs to the caller.
pub fn run_client<D, Ch>(
    channel: &mut Ch,
    proposal: BTreeMap<VersionNumber, D>,
    limits: &Limits,
) -> ClientResult<D>
where
    D: VersionParams,
    Ch: Channel,
{
    let codec = HandshakeCodec::new(limits.clone());
    let mut driver =
        Driver::new(PeerRole::Client, codec, channel).with_limits(limits.clone());
    match driver.run_peer(client_peer(proposal), DriverState::new()) {
        Ok((outcome, _dstate)) => outcome,
        Err(err) => Err(match err.failure {
            // The accept carried a version tag we cannot decode params for.
            DriverFailure::Codec(CodecError::UnknownVersion(tag)) => {
                HandshakeError::NotRecognisedVersion(VersionNumber::new(tag))
            }
            failure => HandshakeError::Driver(failure),
        }),
    }
}
