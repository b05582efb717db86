//! The driver: executes a peer program against a channel through a codec.
//!
//! The driver owns the channel for the duration of a run, enforces agency
//! and transition soundness on every instruction, and accounts for
//! outstanding pipelined responses. It never retries and never closes the
//! channel; on failure it hands the current driver state (including
//! leftover bytes) back to the caller for drain or diagnosis.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use crate::channel::{Channel, ChannelError, TryRecv};
use crate::codec::{Codec, CodecError, DecodeStep, MessageDecode};
use crate::limits::Limits;
use crate::protocol::{AwaitFn, Peer, PeerBuildError, PeerRole, Protocol, RelativeAgency};

mod cancel;

pub use cancel::CancelToken;

/// Events emitted as the driver steps a peer, for metrics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverEvent {
    MessageSent,
    MessageReceived,
    /// A pipelined send was queued; `depth` is the queue depth after it.
    PipelinePushed { depth: usize },
    /// A collected response was popped; `depth` is the queue depth after.
    PipelinePopped { depth: usize },
}

type Observer = Box<dyn FnMut(DriverEvent) + Send>;

/// Ways a driver run can fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DriverFailure {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("channel closed while awaiting an expected message")]
    UnexpectedEof,
    #[error("protocol violation in state {state}: {detail}")]
    ProtocolViolation { state: String, detail: String },
    #[error("agency violation: {role} peer attempted {operation} in state {state}")]
    AgencyViolation {
        state: String,
        role: PeerRole,
        operation: &'static str,
    },
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("cancelled")]
    Cancelled,
}

impl From<PeerBuildError> for DriverFailure {
    fn from(err: PeerBuildError) -> Self {
        match err {
            PeerBuildError::Agency {
                state,
                role,
                operation,
            } => DriverFailure::AgencyViolation {
                state,
                role,
                operation,
            },
            PeerBuildError::Transition { state, detail } => {
                DriverFailure::ProtocolViolation { state, detail }
            }
            PeerBuildError::Queue { operation, detail } => DriverFailure::ProtocolViolation {
                state: format!("<{operation}>"),
                detail,
            },
        }
    }
}

/// A failed run: the failure plus the driver state at the point of
/// failure, so callers can inspect leftover bytes.
pub struct DriverError<P: Protocol> {
    pub failure: DriverFailure,
    pub dstate: DriverState<P>,
}

impl<P: Protocol> fmt::Debug for DriverError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverError")
            .field("failure", &self.failure)
            .field("dstate", &self.dstate)
            .finish()
    }
}

impl<P: Protocol> fmt::Display for DriverError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.failure, f)
    }
}

impl<P: Protocol> std::error::Error for DriverError<P> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure)
    }
}

/// Per-connection driver state (`dstate`): leftover bytes from the last
/// decode, a preserved partial decoder from a non-blocking collect, and
/// the time of the last send for host timeout accounting.
pub struct DriverState<P: Protocol> {
    leftover: Bytes,
    partial: Option<Box<dyn MessageDecode<P>>>,
    last_send: Option<Instant>,
}

impl<P: Protocol> DriverState<P> {
    pub fn new() -> Self {
        Self {
            leftover: Bytes::new(),
            partial: None,
            last_send: None,
        }
    }

    /// Bytes received but not yet consumed by any decode.
    pub fn leftover(&self) -> &Bytes {
        &self.leftover
    }

    /// Whether a partially-decoded response is being held.
    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Time of the most recent send, if any.
    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }
}

impl<P: Protocol> Default for DriverState<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> fmt::Debug for DriverState<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverState")
            .field("leftover_bytes", &self.leftover.len())
            .field("partial", &self.partial.is_some())
            .field("last_send", &self.last_send)
            .finish()
    }
}

/// Binds a role, codec, and channel; executes peer programs.
pub struct Driver<P: Protocol, C, Ch> {
    role: PeerRole,
    codec: C,
    channel: Ch,
    limits: Limits,
    cancel: Option<CancelToken>,
    observer: Option<Observer>,
    _protocol: PhantomData<fn() -> P>,
}

enum ReadOutcome<M> {
    Message(M),
    /// Non-blocking read: nothing complete yet, partial preserved.
    NotReady,
}

impl<P, C, Ch> Driver<P, C, Ch>
where
    P: Protocol,
    C: Codec<P>,
    Ch: Channel,
{
    pub fn new(role: PeerRole, codec: C, channel: Ch) -> Self {
        Self {
            role,
            codec,
            channel,
            limits: Limits::default(),
            cancel: None,
            observer: None,
            _protocol: PhantomData,
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Install a cancellation token. Blocking receives then poll so the
    /// token is observed within `limits.cancel_poll_ms`.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_observer(mut self, observer: impl FnMut(DriverEvent) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn channel_mut(&mut self) -> &mut Ch {
        &mut self.channel
    }

    /// Release the channel after a run; the caller owns its lifecycle.
    pub fn into_channel(self) -> Ch {
        self.channel
    }

    /// Run `peer` to completion.
    ///
    /// Returns the peer's final value together with the final driver
    /// state, or the failure paired with the state at the point of
    /// failure.
    pub fn run_peer<A>(
        &mut self,
        peer: Peer<P, A>,
        dstate: DriverState<P>,
    ) -> Result<(A, DriverState<P>), DriverError<P>> {
        // Reject what the program spine already contradicts before
        // touching the wire; the loop re-checks each continuation as it
        // unfolds.
        if let Err(err) = peer.validate(self.role) {
            return Err(DriverError {
                failure: err.into(),
                dstate,
            });
        }
        let mut run = Run {
            driver: self,
            dstate,
            tracked: None,
            pending: VecDeque::new(),
            last_collected: None,
            front_collected: false,
        };
        match run.execute(peer) {
            Ok(value) => Ok((value, run.dstate)),
            Err(failure) => Err(DriverError {
                failure,
                dstate: run.dstate,
            }),
        }
    }
}

struct Run<'d, P: Protocol, C, Ch> {
    driver: &'d mut Driver<P, C, Ch>,
    dstate: DriverState<P>,
    /// Authoritative protocol state, or `None` while it is indeterminate:
    /// at start (the first instruction's witness is adopted) and between a
    /// pipelined send and the drain of its replies.
    tracked: Option<P::State>,
    /// States in which each outstanding pipelined response will be decoded,
    /// front first.
    pending: VecDeque<P::State>,
    /// Target state of the most recently collected response; re-seeds
    /// `tracked` when the pipeline drains.
    last_collected: Option<P::State>,
    front_collected: bool,
}

impl<P, C, Ch> Run<'_, P, C, Ch>
where
    P: Protocol,
    C: Codec<P>,
    Ch: Channel,
{
    fn execute<A>(&mut self, mut peer: Peer<P, A>) -> Result<A, DriverFailure> {
        loop {
            self.check_cancelled()?;
            peer = match peer {
                Peer::Effect(thunk) => thunk(),
                Peer::Done(state, value) => {
                    self.check_witness(&state)?;
                    if !self.pending.is_empty() {
                        return Err(self.protocol_violation(
                            &state,
                            format!(
                                "peer terminated with {} outstanding pipelined responses",
                                self.pending.len()
                            ),
                        ));
                    }
                    if !P::is_terminal(&state) {
                        return Err(self.agency_violation(&state, "done"));
                    }
                    tracing::debug!(state = ?state, "peer done");
                    return Ok(value);
                }
                Peer::Yield {
                    state,
                    message,
                    next,
                } => {
                    if !self.pending.is_empty() {
                        return Err(self.protocol_violation(
                            &state,
                            "yield while pipelined responses are outstanding",
                        ));
                    }
                    self.check_witness(&state)?;
                    self.check_agency(&state, RelativeAgency::We, "yield")?;
                    let next_state = self.check_transition(&state, &message)?;
                    self.send_message(&state, &message)?;
                    self.tracked = Some(next_state);
                    *next
                }
                Peer::Await { state, k } => {
                    if !self.pending.is_empty() {
                        return Err(self.protocol_violation(
                            &state,
                            "await while pipelined responses are outstanding",
                        ));
                    }
                    self.check_witness(&state)?;
                    self.check_agency(&state, RelativeAgency::They, "await")?;
                    let ReadOutcome::Message(message) = self.read_message(&state, true)? else {
                        return Err(self.protocol_violation(&state, "blocking read yielded nothing"));
                    };
                    let next_state = self.check_transition(&state, &message)?;
                    self.tracked = Some(next_state);
                    self.continue_with(&state, k, message)?
                }
                Peer::YieldPipelined {
                    state,
                    message,
                    next,
                } => {
                    self.check_witness(&state)?;
                    self.check_agency(&state, RelativeAgency::We, "yield-pipelined")?;
                    let reply_state = self.check_transition(&state, &message)?;
                    self.send_message(&state, &message)?;
                    self.pending.push_back(reply_state);
                    self.tracked = None;
                    let depth = self.pending.len();
                    tracing::trace!(depth, "pipelined send queued");
                    self.emit(DriverEvent::PipelinePushed { depth });
                    *next
                }
                Peer::Collect { state, alt, k } => {
                    let Some(front) = self.pending.front().cloned() else {
                        return Err(self.protocol_violation(
                            &state,
                            "collect with no outstanding pipelined response",
                        ));
                    };
                    if self.front_collected {
                        return Err(self.protocol_violation(
                            &state,
                            "collect before the previous response was popped",
                        ));
                    }
                    if state != front {
                        return Err(self.protocol_violation(
                            &state,
                            format!(
                                "collect witness does not match queued response state {front:?}"
                            ),
                        ));
                    }
                    self.check_agency(&state, RelativeAgency::They, "collect")?;
                    match (self.read_message(&state, alt.is_none())?, alt) {
                        (ReadOutcome::Message(message), _) => {
                            let next_state = self.check_transition(&state, &message)?;
                            self.last_collected = Some(next_state);
                            self.front_collected = true;
                            self.continue_with(&state, k, message)?
                        }
                        (ReadOutcome::NotReady, Some(alt)) => *alt,
                        (ReadOutcome::NotReady, None) => {
                            return Err(
                                self.protocol_violation(&state, "blocking read yielded nothing")
                            );
                        }
                    }
                }
                Peer::CollectDone(next) => {
                    if self.pending.is_empty() {
                        return Err(DriverFailure::ProtocolViolation {
                            state: "<pipeline>".to_string(),
                            detail: "collect-done with no outstanding pipelined response".into(),
                        });
                    }
                    if !self.front_collected {
                        return Err(DriverFailure::ProtocolViolation {
                            state: "<pipeline>".to_string(),
                            detail: "collect-done before the response was collected".into(),
                        });
                    }
                    self.pending.pop_front();
                    self.front_collected = false;
                    let depth = self.pending.len();
                    tracing::trace!(depth, "pipelined response popped");
                    self.emit(DriverEvent::PipelinePopped { depth });
                    if self.pending.is_empty() {
                        // Pipeline drained: the last reply's target state is
                        // authoritative again.
                        self.tracked = self.last_collected.take();
                    }
                    *next
                }
            };
        }
    }

    fn continue_with<A>(
        &mut self,
        state: &P::State,
        k: AwaitFn<P, A>,
        message: P::Message,
    ) -> Result<Peer<P, A>, DriverFailure> {
        k(message).map_err(|err| self.protocol_violation(state, err.detail().to_string()))
    }

    fn send_message(
        &mut self,
        state: &P::State,
        message: &P::Message,
    ) -> Result<(), DriverFailure> {
        let bytes = self.driver.codec.encode(state, message)?;
        self.driver.channel.send(&bytes)?;
        self.dstate.last_send = Some(Instant::now());
        tracing::trace!(state = ?state, bytes = bytes.len(), "message sent");
        self.emit(DriverEvent::MessageSent);
        Ok(())
    }

    /// Decode the next message expected in `state`, resuming any preserved
    /// partial decoder and consuming leftover bytes before touching the
    /// channel. With `blocking` false the channel is only polled, and an
    /// incomplete decode is preserved in the driver state.
    fn read_message(
        &mut self,
        state: &P::State,
        blocking: bool,
    ) -> Result<ReadOutcome<P::Message>, DriverFailure> {
        let mut decoder = match self.dstate.partial.take() {
            Some(partial) => partial,
            None => self.driver.codec.start_decode(state),
        };
        let mut chunk: Option<Bytes> = if self.dstate.leftover.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.dstate.leftover))
        };
        let mut at_eof = false;
        loop {
            let step = match chunk.take() {
                Some(chunk) => decoder.feed(Some(&chunk)),
                None if at_eof => decoder.feed(None),
                None if blocking => match self.recv_chunk()? {
                    Some(next) => decoder.feed(Some(&next)),
                    None => {
                        at_eof = true;
                        decoder.feed(None)
                    }
                },
                None => match self.driver.channel.try_recv()? {
                    TryRecv::Data(next) => decoder.feed(Some(&next)),
                    TryRecv::Empty => {
                        self.dstate.partial = Some(decoder);
                        return Ok(ReadOutcome::NotReady);
                    }
                    TryRecv::Closed => {
                        at_eof = true;
                        decoder.feed(None)
                    }
                },
            };
            match step {
                DecodeStep::Partial(next) => {
                    if at_eof {
                        // A decoder must resolve once end-of-input is fed.
                        return Err(DriverFailure::UnexpectedEof);
                    }
                    decoder = next;
                }
                DecodeStep::Done { message, leftover } => {
                    self.dstate.leftover = leftover;
                    tracing::trace!(state = ?state, message = ?message, "message received");
                    self.emit(DriverEvent::MessageReceived);
                    return Ok(ReadOutcome::Message(message));
                }
                DecodeStep::Fail { reason, leftover } => {
                    self.dstate.leftover = leftover;
                    return Err(match reason {
                        CodecError::Truncated if at_eof => DriverFailure::UnexpectedEof,
                        reason => {
                            tracing::warn!(state = ?state, %reason, "decode failed");
                            DriverFailure::Codec(reason)
                        }
                    });
                }
            }
        }
    }

    /// Blocking receive of one chunk; polls when a cancel token is
    /// installed so cancellation is observed promptly.
    fn recv_chunk(&mut self) -> Result<Option<Bytes>, DriverFailure> {
        match &self.driver.cancel {
            None => Ok(self.driver.channel.recv()?),
            Some(token) => {
                let token = token.clone();
                let interval = Duration::from_millis(self.driver.limits.cancel_poll_ms.max(1));
                loop {
                    if token.is_cancelled() {
                        return Err(DriverFailure::Cancelled);
                    }
                    match self.driver.channel.try_recv()? {
                        TryRecv::Data(chunk) => return Ok(Some(chunk)),
                        TryRecv::Closed => return Ok(None),
                        TryRecv::Empty => std::thread::sleep(interval),
                    }
                }
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), DriverFailure> {
        match &self.driver.cancel {
            Some(token) if token.is_cancelled() => Err(DriverFailure::Cancelled),
            _ => Ok(()),
        }
    }

    fn check_witness(&self, witness: &P::State) -> Result<(), DriverFailure> {
        match &self.tracked {
            Some(tracked) if tracked != witness => Err(DriverFailure::ProtocolViolation {
                state: format!("{tracked:?}"),
                detail: format!("peer state witness {witness:?} does not match driver state"),
            }),
            _ => Ok(()),
        }
    }

    fn check_agency(
        &self,
        state: &P::State,
        required: RelativeAgency,
        operation: &'static str,
    ) -> Result<(), DriverFailure> {
        if P::agency(state).relative_to(self.driver.role) == required {
            Ok(())
        } else {
            Err(self.agency_violation(state, operation))
        }
    }

    fn check_transition(
        &self,
        state: &P::State,
        message: &P::Message,
    ) -> Result<P::State, DriverFailure> {
        P::transition(state, message).ok_or_else(|| {
            self.protocol_violation(
                state,
                format!("message {message:?} is not a declared transition"),
            )
        })
    }

    fn protocol_violation(&self, state: &P::State, detail: impl Into<String>) -> DriverFailure {
        DriverFailure::ProtocolViolation {
            state: format!("{state:?}"),
            detail: detail.into(),
        }
    }

    fn agency_violation(&self, state: &P::State, operation: &'static str) -> DriverFailure {
        DriverFailure::AgencyViolation {
            state: format!("{state:?}"),
            role: self.driver.role,
            operation,
        }
    }

    fn emit(&mut self, event: DriverEvent) {
        if let Some(observer) = &mut self.driver.observer {
            observer(event);
        }
    }
}
