//! Driver-level pipelining over a synthetic request/response protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use minicbor::Decoder;

use miniproto::channel::{Channel, InMemoryChannel};
use miniproto::codec::cbor::CborDecode;
use miniproto::codec::{Codec, CodecError, MessageDecode};
use miniproto::driver::{Driver, DriverEvent, DriverState};
use miniproto::protocol::{Agency, Peer, PeerRole, Protocol, UnexpectedMessage};

/// One client-agency request state, one server-agency response state, and
/// a terminal state reached by a goodbye.
struct PingPong;

#[derive(Clone, Debug, PartialEq, Eq)]
enum PingPongState {
    Req,
    Resp,
    Halt,
}

#[derive(Debug, PartialEq, Eq)]
enum PingPongMessage {
    Ask(u64),
    Reply(u64),
    Bye,
}

impl Protocol for PingPong {
    type State = PingPongState;
    type Message = PingPongMessage;

    fn agency(state: &PingPongState) -> Agency {
        match state {
            PingPongState::Req => Agency::Client,
            PingPongState::Resp => Agency::Server,
            PingPongState::Halt => Agency::Nobody,
        }
    }

    fn transition(state: &PingPongState, message: &PingPongMessage) -> Option<PingPongState> {
        match (state, message) {
            (PingPongState::Req, PingPongMessage::Ask(_)) => Some(PingPongState::Resp),
            (PingPongState::Resp, PingPongMessage::Reply(_)) => Some(PingPongState::Req),
            (PingPongState::Req, PingPongMessage::Bye) => Some(PingPongState::Halt),
            _ => None,
        }
    }
}

struct PingPongCodec;

impl Codec<PingPong> for PingPongCodec {
    fn encode(
        &self,
        _state: &PingPongState,
        message: &PingPongMessage,
    ) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        let mut enc = minicbor::Encoder::new(&mut buf);
        match message {
            PingPongMessage::Ask(value) => {
                enc.array(2)?;
                enc.u64(0)?;
                enc.u64(*value)?;
            }
            PingPongMessage::Reply(value) => {
                enc.array(2)?;
                enc.u64(1)?;
                enc.u64(*value)?;
            }
            PingPongMessage::Bye => {
                enc.array(1)?;
                enc.u64(2)?;
            }
        }
        Ok(buf)
    }

    fn start_decode(&self, _state: &PingPongState) -> Box<dyn MessageDecode<PingPong>> {
        Box::new(CborDecode::new(1024, |dec: &mut Decoder<'_>| {
            let len = dec
                .array()?
                .ok_or_else(|| CodecError::malformed("indefinite-length message"))?;
            match (dec.u64()?, len) {
                (0, 2) => Ok(PingPongMessage::Ask(dec.u64()?)),
                (1, 2) => Ok(PingPongMessage::Reply(dec.u64()?)),
                (2, 1) => Ok(PingPongMessage::Bye),
                (tag, _) => Err(CodecError::malformed(format!("unknown tag {tag}"))),
            }
        }))
    }
}

/// Serve one reply per ask until the goodbye; returns how many were served.
fn server_loop(served: u64) -> Peer<PingPong, u64> {
    Peer::await_message(PingPongState::Req, move |message| match message {
        PingPongMessage::Ask(value) => Ok(Peer::yield_message(
            PingPongState::Resp,
            PingPongMessage::Reply(value * 2),
            Peer::effect(move || server_loop(served + 1)),
        )),
        PingPongMessage::Bye => Ok(Peer::done(PingPongState::Halt, served)),
        PingPongMessage::Reply(_) => Err(UnexpectedMessage::new("reply sent to the server")),
    })
}

/// Issue `total` pipelined asks before collecting anything, then drain the
/// pipeline in order and say goodbye.
fn pipelined_client(total: u64) -> Peer<PingPong, Vec<u64>> {
    pump(0, total)
}

fn pump(next: u64, total: u64) -> Peer<PingPong, Vec<u64>> {
    if next < total {
        Peer::yield_pipelined(
            PingPongState::Req,
            PingPongMessage::Ask(next),
            pump(next + 1, total),
        )
    } else {
        drain(0, total, Vec::new())
    }
}

fn drain(collected: u64, total: u64, mut acc: Vec<u64>) -> Peer<PingPong, Vec<u64>> {
    if collected < total {
        Peer::collect(PingPongState::Resp, None, move |message| {
            let PingPongMessage::Reply(value) = message else {
                return Err(UnexpectedMessage::new("expected a reply"));
            };
            acc.push(value);
            Ok(Peer::collect_done(drain(collected + 1, total, acc)))
        })
    } else {
        Peer::yield_message(
            PingPongState::Req,
            PingPongMessage::Bye,
            Peer::done(PingPongState::Halt, acc),
        )
    }
}

#[test]
fn n_pipelined_asks_produce_n_replies_in_order() {
    const N: u64 = 5;
    let (client_end, mut server_end) = InMemoryChannel::pair();

    let server = thread::spawn(move || {
        let mut driver = Driver::new(PeerRole::Server, PingPongCodec, &mut server_end);
        let (served, _) = driver
            .run_peer(server_loop(0), DriverState::new())
            .unwrap();
        served
    });

    let events: Arc<Mutex<Vec<DriverEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut driver = Driver::new(PeerRole::Client, PingPongCodec, client_end)
        .with_observer(move |event| sink.lock().unwrap().push(event));
    let (replies, dstate) = driver
        .run_peer(pipelined_client(N), DriverState::new())
        .unwrap();

    assert_eq!(replies, vec![0, 2, 4, 6, 8]);
    assert!(dstate.leftover().is_empty());
    assert!(!dstate.has_partial());
    assert_eq!(server.join().unwrap(), N);

    // Queue depth must climb 1..N as asks go out, then fall N-1..0 as the
    // replies are collected.
    let depths: Vec<usize> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            DriverEvent::PipelinePushed { depth } => Some(*depth),
            DriverEvent::PipelinePopped { depth } => Some(*depth),
            _ => None,
        })
        .collect();
    let expected: Vec<usize> = (1..=N as usize).chain((0..N as usize).rev()).collect();
    assert_eq!(depths, expected);
}

#[test]
fn interleaved_collects_keep_the_pipeline_in_order() {
    let (client_end, mut server_end) = InMemoryChannel::pair();

    let server = thread::spawn(move || {
        let mut driver = Driver::new(PeerRole::Server, PingPongCodec, &mut server_end);
        driver
            .run_peer(server_loop(0), DriverState::new())
            .unwrap()
            .0
    });

    // Ask twice, collect one, ask again, then drain the remaining two.
    let peer: Peer<PingPong, Vec<u64>> = Peer::yield_pipelined(
        PingPongState::Req,
        PingPongMessage::Ask(10),
        Peer::yield_pipelined(
            PingPongState::Req,
            PingPongMessage::Ask(11),
            Peer::collect(PingPongState::Resp, None, |message| {
                let PingPongMessage::Reply(first) = message else {
                    return Err(UnexpectedMessage::new("expected a reply"));
                };
                Ok(Peer::collect_done(Peer::yield_pipelined(
                    PingPongState::Req,
                    PingPongMessage::Ask(12),
                    drain(1, 3, vec![first]),
                )))
            }),
        ),
    );

    let mut driver = Driver::new(PeerRole::Client, PingPongCodec, client_end);
    let (replies, _) = driver.run_peer(peer, DriverState::new()).unwrap();
    assert_eq!(replies, vec![20, 22, 24]);
    assert_eq!(server.join().unwrap(), 3);
}

#[test]
fn nonblocking_collect_runs_the_alternative_and_preserves_the_partial() {
    let (client_end, mut test_end) = InMemoryChannel::pair();

    let reply = PingPongCodec
        .encode(&PingPongState::Resp, &PingPongMessage::Reply(14))
        .unwrap();
    let (head, tail) = reply.split_at(1);
    // Half a reply is on the wire before the client runs: the non-blocking
    // collect must start decoding, find it incomplete, and step aside.
    test_end.send(head).unwrap();

    let alt_ran = Arc::new(AtomicBool::new(false));
    let alt_flag = Arc::clone(&alt_ran);
    let tail = tail.to_vec();

    let finish = |message: PingPongMessage| {
        let PingPongMessage::Reply(value) = message else {
            return Err(UnexpectedMessage::new("expected a reply"));
        };
        Ok(Peer::collect_done(Peer::yield_message(
            PingPongState::Req,
            PingPongMessage::Bye,
            Peer::done(PingPongState::Halt, value),
        )))
    };

    let alt = Peer::effect(move || {
        alt_flag.store(true, Ordering::Release);
        // Deliver the rest of the reply, then collect for real.
        test_end.send(&tail).unwrap();
        Peer::collect(PingPongState::Resp, None, finish)
    });

    let peer: Peer<PingPong, u64> = Peer::yield_pipelined(
        PingPongState::Req,
        PingPongMessage::Ask(7),
        Peer::collect(PingPongState::Resp, Some(alt), finish),
    );

    let mut driver = Driver::new(PeerRole::Client, PingPongCodec, client_end);
    let (value, dstate) = driver.run_peer(peer, DriverState::new()).unwrap();
    assert_eq!(value, 14);
    assert!(alt_ran.load(Ordering::Acquire));
    assert!(!dstate.has_partial());
    assert!(dstate.leftover().is_empty());
}
