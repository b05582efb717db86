//! Handshake server: await the proposal, pick the highest common version.

use std::collections::BTreeMap;

use super::{
    Handshake, HandshakeCodec, HandshakeError, HandshakeMessage, HandshakeState, Negotiated,
    RefuseReason, VersionNumber, VersionParams, highest_common,
};
use crate::channel::Channel;
use crate::driver::{Driver, DriverState};
use crate::limits::Limits;
use crate::protocol::{Peer, PeerRole, UnexpectedMessage};

type ServerResult<D> = Result<Negotiated<D>, HandshakeError>;

/// The server peer: await the client proposal, then accept the highest
/// common version with negotiated parameters, or refuse.
pub fn server_peer<D: VersionParams>(
    supported: BTreeMap<VersionNumber, D>,
) -> Peer<Handshake<D>, ServerResult<D>> {
    Peer::await_message(HandshakeState::Propose, move |message| match message {
        HandshakeMessage::ProposeVersions(client_map) => {
            let Some(version) = highest_common(&supported, client_map.known()) else {
                let reason = RefuseReason::VersionMismatch {
                    server_known: supported.keys().copied().collect(),
                    client_tags: client_map.raw_tags(),
                };
                tracing::debug!(%reason, "refusing proposal");
                return Ok(refuse(reason));
            };
            let ours = &supported[&version];
            let theirs = &client_map.known()[&version];
            match ours.negotiate(theirs) {
                Ok(params) => {
                    tracing::debug!(%version, "accepting proposal");
                    Ok(Peer::yield_message(
                        HandshakeState::Confirm,
                        HandshakeMessage::AcceptVersion(version, params.clone()),
                        Peer::done(HandshakeState::Done, Ok(Negotiated { version, params })),
                    ))
                }
                Err(message) => {
                    let reason = RefuseReason::Refused { version, message };
                    tracing::debug!(%reason, "refusing proposal");
                    Ok(refuse(reason))
                }
            }
        }
        _ => Err(UnexpectedMessage::new(
            "only a proposal is expected from the client",
        )),
    })
}

fn refuse<D: VersionParams>(reason: RefuseReason) -> Peer<Handshake<D>, ServerResult<D>> {
    Peer::yield_message(
        HandshakeState::Confirm,
        HandshakeMessage::Refuse(reason.clone()),
        Peer::done(HandshakeState::Done, Err(HandshakeError::Refused(reason))),
    )
}

/// Run the server handshake over `channel` and return the negotiation
/// outcome. The channel stays open; its lifecycle belongs to the caller.
pub fn run_server<D, Ch>(
    channel: &mut Ch,
    supported: BTreeMap<VersionNumber, D>,
    limits: &Limits,
) -> ServerResult<D>
where
    D: VersionParams,
    Ch: Channel,
{
    let codec = HandshakeCodec::new(limits.clone());
    let mut driver =
        Driver::new(PeerRole::Server, codec, channel).with_limits(limits.clone());
    match driver.run_peer(server_peer(supported), DriverState::new()) {
        Ok((outcome, _dstate)) => outcome,
        Err(err) => Err(HandshakeError::Driver(err.failure)),
    }
}
