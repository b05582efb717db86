//! End-to-end handshake scenarios over in-memory channels.

use std::collections::BTreeMap;
use std::thread;

use minicbor::{Decoder, Encoder};

use miniproto::channel::{Channel, InMemoryChannel};
use miniproto::codec::CodecError;
use miniproto::driver::{Driver, DriverFailure, DriverState};
use miniproto::handshake::{
    Handshake, HandshakeCodec, HandshakeError, HandshakeMessage, HandshakeState, Negotiated,
    RefuseReason, VersionNumber, VersionParams, run_client, run_server,
};
use miniproto::limits::Limits;
use miniproto::protocol::{Peer, PeerRole};

/// Flow-control window parameters; versions 1 through 8 are decodable.
///
/// Negotiation takes the smaller window and rejects a zero result, and a
/// client accepts any window at or below what it offered. `negotiate` is
/// symmetric, as simultaneous open requires.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Window(u64);

impl VersionParams for Window {
    fn known_version(version: VersionNumber) -> bool {
        (1..=8).contains(&version.get())
    }

    fn encode_params(
        &self,
        _version: VersionNumber,
        enc: &mut Encoder<&mut Vec<u8>>,
    ) -> Result<(), CodecError> {
        enc.u64(self.0)?;
        Ok(())
    }

    fn decode_params(_version: VersionNumber, dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Window(dec.u64()?))
    }

    fn acceptable(&self, offered: &Self) -> Result<(), String> {
        if offered.0 <= self.0 {
            Ok(())
        } else {
            Err(format!("window {} above offered {}", offered.0, self.0))
        }
    }

    fn negotiate(&self, remote: &Self) -> Result<Self, String> {
        let window = self.0.min(remote.0);
        if window == 0 {
            Err("params out of range".to_string())
        } else {
            Ok(Window(window))
        }
    }
}

fn versions(entries: &[(u64, u64)]) -> BTreeMap<VersionNumber, Window> {
    entries
        .iter()
        .map(|(tag, window)| (VersionNumber::new(*tag), Window(*window)))
        .collect()
}

fn v(tag: u64) -> VersionNumber {
    VersionNumber::new(tag)
}

fn run_pair(
    client_versions: BTreeMap<VersionNumber, Window>,
    server_versions: BTreeMap<VersionNumber, Window>,
) -> (
    Result<Negotiated<Window>, HandshakeError>,
    Result<Negotiated<Window>, HandshakeError>,
) {
    let (mut client_end, mut server_end) = InMemoryChannel::pair();
    let limits = Limits::handshake();
    let server_limits = limits.clone();
    let server = thread::spawn(move || {
        let outcome = run_server(&mut server_end, server_versions, &server_limits);
        (outcome, server_end)
    });
    let client_outcome = run_client(&mut client_end, client_versions, &limits);
    let (server_outcome, _server_end) = server.join().unwrap();
    (client_outcome, server_outcome)
}

#[test]
fn accepts_the_highest_common_version() {
    let (client, server) = run_pair(
        versions(&[(1, 10), (2, 20), (3, 30)]),
        versions(&[(2, 22), (3, 20), (4, 40)]),
    );

    // v3 is the top shared version; the server refines the window to the
    // smaller of the two sides.
    let expected = Negotiated {
        version: v(3),
        params: Window(20),
    };
    assert_eq!(client.unwrap(), expected);
    assert_eq!(server.unwrap(), expected);
}

#[test]
fn version_mismatch_is_refused_with_both_sides_listed() {
    let (client, server) = run_pair(versions(&[(1, 10), (2, 20)]), versions(&[(3, 30), (4, 40)]));

    let expected = RefuseReason::VersionMismatch {
        server_known: vec![v(3), v(4)],
        client_tags: vec![1, 2],
    };
    assert_eq!(client.unwrap_err(), HandshakeError::Refused(expected.clone()));
    assert_eq!(server.unwrap_err(), HandshakeError::Refused(expected));
}

#[test]
fn bad_params_are_refused_with_the_version_named() {
    // A zero window makes negotiation fail on the server.
    let (client, server) = run_pair(versions(&[(1, 0)]), versions(&[(1, 5)]));

    let expected = RefuseReason::Refused {
        version: v(1),
        message: "params out of range".to_string(),
    };
    assert_eq!(client.unwrap_err(), HandshakeError::Refused(expected.clone()));
    assert_eq!(server.unwrap_err(), HandshakeError::Refused(expected));
}

/// An adversarial server that accepts whatever version it pleases,
/// ignoring the proposal.
fn rogue_server(
    mut end: InMemoryChannel,
    accept: VersionNumber,
    params: Window,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let peer: Peer<Handshake<Window>, ()> =
            Peer::await_message(HandshakeState::Propose, move |_| {
                Ok(Peer::yield_message(
                    HandshakeState::Confirm,
                    HandshakeMessage::AcceptVersion(accept, params),
                    Peer::done(HandshakeState::Done, ()),
                ))
            });
        let codec = HandshakeCodec::new(Limits::handshake());
        let mut driver = Driver::new(PeerRole::Server, codec, &mut end);
        driver.run_peer(peer, DriverState::new()).unwrap();
    })
}

#[test]
fn selection_outside_the_proposal_is_invalid() {
    let (mut client_end, server_end) = InMemoryChannel::pair();
    let server = rogue_server(server_end, v(3), Window(30));

    let outcome = run_client(
        &mut client_end,
        versions(&[(1, 10), (2, 20)]),
        &Limits::handshake(),
    );
    assert_eq!(
        outcome.unwrap_err(),
        HandshakeError::InvalidServerSelection {
            version: v(3),
            reason: "not in proposal".to_string(),
        }
    );
    server.join().unwrap();
}

#[test]
fn selection_with_an_unknown_version_tag_is_not_recognised() {
    let (mut client_end, server_end) = InMemoryChannel::pair();
    let server = rogue_server(server_end, v(9), Window(30));

    let outcome = run_client(&mut client_end, versions(&[(1, 10)]), &Limits::handshake());
    assert_eq!(
        outcome.unwrap_err(),
        HandshakeError::NotRecognisedVersion(v(9))
    );
    server.join().unwrap();
}

#[test]
fn simultaneous_open_resolves_symmetrically() {
    let (mut left_end, mut right_end) = InMemoryChannel::pair();
    let limits = Limits::handshake();
    let proposal = versions(&[(1, 30), (2, 30), (3, 30)]);

    let remote_proposal = proposal.clone();
    let remote_limits = limits.clone();
    let remote = thread::spawn(move || {
        let outcome = run_client(&mut right_end, remote_proposal, &remote_limits);
        (outcome, right_end)
    });
    let local = run_client(&mut left_end, proposal, &limits);
    let (remote, _right_end) = remote.join().unwrap();

    // negotiate(p, p) = p, so both sides land on the same pair.
    let expected = Negotiated {
        version: v(3),
        params: Window(30),
    };
    assert_eq!(local.unwrap(), expected);
    assert_eq!(remote.unwrap(), expected);
}

#[test]
fn simultaneous_open_without_common_version_closes_locally() {
    let (mut left_end, mut right_end) = InMemoryChannel::pair();
    let limits = Limits::handshake();

    let remote_limits = limits.clone();
    let remote = thread::spawn(move || {
        let outcome = run_client(&mut right_end, versions(&[(2, 20)]), &remote_limits);
        (outcome, right_end)
    });
    let local = run_client(&mut left_end, versions(&[(1, 10)]), &limits);
    let (remote, _right_end) = remote.join().unwrap();

    assert_eq!(
        local.unwrap_err(),
        HandshakeError::NoCommonVersion {
            local: vec![v(1)],
            remote: vec![2],
        }
    );
    assert_eq!(
        remote.unwrap_err(),
        HandshakeError::NoCommonVersion {
            local: vec![v(2)],
            remote: vec![1],
        }
    );
}

#[test]
fn unsorted_proposal_on_the_wire_is_a_decode_error() {
    let (mut raw_end, mut server_end) = InMemoryChannel::pair();

    // Hand-rolled proposal with keys out of ascending order.
    let mut bytes = Vec::new();
    let mut enc = Encoder::new(&mut bytes);
    enc.array(2).unwrap();
    enc.u64(0).unwrap();
    enc.map(2).unwrap();
    enc.u64(2).unwrap();
    enc.u64(20).unwrap();
    enc.u64(1).unwrap();
    enc.u64(10).unwrap();
    raw_end.send(&bytes).unwrap();

    let outcome = run_server(&mut server_end, versions(&[(1, 10), (2, 20)]), &Limits::handshake());
    assert_eq!(
        outcome.unwrap_err(),
        HandshakeError::Driver(DriverFailure::Codec(CodecError::Malformed(
            "version keys not in ascending order".to_string()
        )))
    );
}

#[test]
fn handshake_survives_arbitrary_chunking() {
    // Fragment every send into tiny random-sized chunks so decoding is
    // forced through the incremental path.
    let chunk = rand::random_range(1..=4);
    let (mut client_end, mut server_end) = InMemoryChannel::pair_chunked(chunk);
    let limits = Limits::handshake();

    let server_limits = limits.clone();
    let server = thread::spawn(move || {
        let outcome = run_server(&mut server_end, versions(&[(3, 15), (4, 40)]), &server_limits);
        (outcome, server_end)
    });
    let client = run_client(
        &mut client_end,
        versions(&[(1, 10), (2, 20), (3, 30)]),
        &limits,
    );
    let (server, _server_end) = server.join().unwrap();

    let expected = Negotiated {
        version: v(3),
        params: Window(15),
    };
    assert_eq!(client.unwrap(), expected);
    assert_eq!(server.unwrap(), expected);
}

#[test]
fn peer_disconnect_before_verdict_is_unexpected_eof() {
    let (mut client_end, mut server_end) = InMemoryChannel::pair();
    // Close the remote's sending side but keep its receiver alive so the
    // proposal still goes out; the await then sees orderly close.
    server_end.close();

    let outcome = run_client(&mut client_end, versions(&[(1, 10)]), &Limits::handshake());
    assert_eq!(
        outcome.unwrap_err(),
        HandshakeError::Driver(DriverFailure::UnexpectedEof)
    );
    drop(server_end);
}
