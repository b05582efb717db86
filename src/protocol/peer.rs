//! Peer programs: lazy, suspendable instruction trees.

use thiserror::Error;

use super::{PeerRole, Protocol, RelativeAgency};

/// A continuation invoked with a decoded inbound message.
///
/// Returning `Err` signals that the peer cannot handle a message the
/// protocol nonetheless declares legal from the current state; the driver
/// surfaces it as a protocol violation.
pub type AwaitFn<P, A> = Box<
    dyn FnOnce(<P as Protocol>::Message) -> Result<Peer<P, A>, UnexpectedMessage> + Send + 'static,
>;

type EffectFn<P, A> = Box<dyn FnOnce() -> Peer<P, A> + Send + 'static>;

/// Raised by an `Await`/`Collect` continuation for a message it has no
/// handler for.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("peer cannot handle message: {detail}")]
pub struct UnexpectedMessage {
    detail: String,
}

impl UnexpectedMessage {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

/// One side of a session protocol, producing a final value of type `A`.
///
/// Every instruction that touches the wire carries the protocol state it
/// expects to be in as a runtime witness. The driver checks the witness
/// against its own tracked state wherever that state is determined, and
/// checks agency and declared transitions on every step.
pub enum Peer<P: Protocol, A> {
    /// Run a host-side effect producing the next peer program.
    Effect(EffectFn<P, A>),
    /// Terminate with a value. Legal only in a terminal state with no
    /// outstanding pipelined responses.
    Done(P::State, A),
    /// Send a message and continue in the transition's target state.
    Yield {
        state: P::State,
        message: P::Message,
        next: Box<Peer<P, A>>,
    },
    /// Block for an inbound message; the continuation picks the next peer
    /// from the decoded message.
    Await { state: P::State, k: AwaitFn<P, A> },
    /// Send a message without awaiting its reply; the reply is queued as
    /// an outstanding response and the program continues with the
    /// pipeline one deeper.
    YieldPipelined {
        state: P::State,
        message: P::Message,
        next: Box<Peer<P, A>>,
    },
    /// Consume the front outstanding response. With `alt` present the
    /// collect is non-blocking: if no complete response is available from
    /// already-buffered input, the driver preserves the partial decode
    /// and runs `alt` instead.
    Collect {
        state: P::State,
        alt: Option<Box<Peer<P, A>>>,
        k: AwaitFn<P, A>,
    },
    /// Pop the front outstanding response after it has been collected.
    CollectDone(Box<Peer<P, A>>),
}

impl<P: Protocol, A> Peer<P, A> {
    pub fn effect(f: impl FnOnce() -> Peer<P, A> + Send + 'static) -> Self {
        Peer::Effect(Box::new(f))
    }

    pub fn done(state: P::State, value: A) -> Self {
        Peer::Done(state, value)
    }

    pub fn yield_message(state: P::State, message: P::Message, next: Peer<P, A>) -> Self {
        Peer::Yield {
            state,
            message,
            next: Box::new(next),
        }
    }

    pub fn await_message(
        state: P::State,
        k: impl FnOnce(P::Message) -> Result<Peer<P, A>, UnexpectedMessage> + Send + 'static,
    ) -> Self {
        Peer::Await {
            state,
            k: Box::new(k),
        }
    }

    pub fn yield_pipelined(state: P::State, message: P::Message, next: Peer<P, A>) -> Self {
        Peer::YieldPipelined {
            state,
            message,
            next: Box::new(next),
        }
    }

    pub fn collect(
        state: P::State,
        alt: Option<Peer<P, A>>,
        k: impl FnOnce(P::Message) -> Result<Peer<P, A>, UnexpectedMessage> + Send + 'static,
    ) -> Self {
        Peer::Collect {
            state,
            alt: alt.map(Box::new),
            k: Box::new(k),
        }
    }

    pub fn collect_done(next: Peer<P, A>) -> Self {
        Peer::CollectDone(Box::new(next))
    }

    /// Name of the instruction at the head of the program, for diagnostics.
    pub fn instruction(&self) -> &'static str {
        match self {
            Peer::Effect(_) => "effect",
            Peer::Done(_, _) => "done",
            Peer::Yield { .. } => "yield",
            Peer::Await { .. } => "await",
            Peer::YieldPipelined { .. } => "yield-pipelined",
            Peer::Collect { .. } => "collect",
            Peer::CollectDone(_) => "collect-done",
        }
    }

    /// Check the statically-visible spine of the program for `role`:
    /// agency of each instruction, declared transitions of every send,
    /// and pipeline queue discipline.
    ///
    /// Continuations behind `Effect`, `Await`, and `Collect` closures are
    /// opaque here; the driver applies the same checks to them as they
    /// unfold.
    pub fn validate(&self, role: PeerRole) -> Result<(), PeerBuildError> {
        validate_spine(self, role, None, 0)
    }
}

/// Rejected at peer construction: the program spine contradicts the
/// protocol.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PeerBuildError {
    #[error("agency violation: {role} peer attempted {operation} in state {state}")]
    Agency {
        state: String,
        role: PeerRole,
        operation: &'static str,
    },
    #[error("illegal transition from {state}: {detail}")]
    Transition { state: String, detail: String },
    #[error("queue discipline violation at {operation}: {detail}")]
    Queue {
        operation: &'static str,
        detail: String,
    },
}

fn validate_spine<P: Protocol, A>(
    peer: &Peer<P, A>,
    role: PeerRole,
    tracked: Option<P::State>,
    depth: usize,
) -> Result<(), PeerBuildError> {
    let continuity = |witness: &P::State| match &tracked {
        Some(tracked) if tracked != witness => Err(PeerBuildError::Transition {
            state: format!("{tracked:?}"),
            detail: format!("instruction witnesses state {witness:?}"),
        }),
        _ => Ok(()),
    };
    let agency = |state: &P::State, required: RelativeAgency, operation: &'static str| {
        if P::agency(state).relative_to(role) == required {
            Ok(())
        } else {
            Err(PeerBuildError::Agency {
                state: format!("{state:?}"),
                role,
                operation,
            })
        }
    };
    let empty_queue = |operation: &'static str| {
        if depth == 0 {
            Ok(())
        } else {
            Err(PeerBuildError::Queue {
                operation,
                detail: format!("{depth} pipelined responses outstanding"),
            })
        }
    };
    let declared = |state: &P::State, message: &P::Message| {
        P::transition(state, message).ok_or_else(|| PeerBuildError::Transition {
            state: format!("{state:?}"),
            detail: format!("message {message:?} is not a declared transition"),
        })
    };

    match peer {
        Peer::Effect(_) => Ok(()),
        Peer::Done(state, _) => {
            empty_queue("done")?;
            continuity(state)?;
            if P::is_terminal(state) {
                Ok(())
            } else {
                Err(PeerBuildError::Agency {
                    state: format!("{state:?}"),
                    role,
                    operation: "done",
                })
            }
        }
        Peer::Yield {
            state,
            message,
            next,
        } => {
            empty_queue("yield")?;
            continuity(state)?;
            agency(state, RelativeAgency::We, "yield")?;
            let next_state = declared(state, message)?;
            validate_spine(next, role, Some(next_state), depth)
        }
        Peer::Await { state, .. } => {
            empty_queue("await")?;
            continuity(state)?;
            agency(state, RelativeAgency::They, "await")
        }
        Peer::YieldPipelined {
            state,
            message,
            next,
        } => {
            continuity(state)?;
            agency(state, RelativeAgency::We, "yield-pipelined")?;
            declared(state, message)?;
            validate_spine(next, role, None, depth + 1)
        }
        Peer::Collect { state, alt, .. } => {
            if depth == 0 {
                return Err(PeerBuildError::Queue {
                    operation: "collect",
                    detail: "no pipelined response outstanding".into(),
                });
            }
            agency(state, RelativeAgency::They, "collect")?;
            match alt {
                Some(alt) => validate_spine(alt, role, None, depth),
                None => Ok(()),
            }
        }
        Peer::CollectDone(next) => {
            if depth == 0 {
                return Err(PeerBuildError::Queue {
                    operation: "collect-done",
                    detail: "no pipelined response outstanding".into(),
                });
            }
            validate_spine(next, role, None, depth - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Agency;

    struct Flip;

    impl Protocol for Flip {
        type State = bool;
        type Message = ();

        fn agency(state: &bool) -> Agency {
            if *state { Agency::Client } else { Agency::Nobody }
        }

        fn transition(state: &bool, _message: &()) -> Option<bool> {
            if *state { Some(false) } else { None }
        }
    }

    #[test]
    fn effect_thunks_are_deferred() {
        let peer: Peer<Flip, u32> = Peer::effect(|| Peer::done(false, 7));
        let Peer::Effect(thunk) = peer else {
            panic!("expected effect");
        };
        let Peer::Done(state, value) = thunk() else {
            panic!("expected done");
        };
        assert!(!state);
        assert_eq!(value, 7);
    }

    #[test]
    fn instruction_names_cover_all_cases() {
        let done: Peer<Flip, ()> = Peer::done(false, ());
        assert_eq!(done.instruction(), "done");
        let yld: Peer<Flip, ()> = Peer::yield_message(true, (), Peer::done(false, ()));
        assert_eq!(yld.instruction(), "yield");
        let awt: Peer<Flip, ()> = Peer::await_message(true, |_| Ok(Peer::done(false, ())));
        assert_eq!(awt.instruction(), "await");
    }

    #[test]
    fn validate_accepts_a_well_formed_spine() {
        let peer: Peer<Flip, ()> = Peer::yield_message(true, (), Peer::done(false, ()));
        assert_eq!(peer.validate(PeerRole::Client), Ok(()));
    }

    #[test]
    fn validate_rejects_sends_against_agency() {
        let peer: Peer<Flip, ()> = Peer::yield_message(true, (), Peer::done(false, ()));
        assert!(matches!(
            peer.validate(PeerRole::Server),
            Err(PeerBuildError::Agency {
                operation: "yield",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_done_outside_a_terminal_state() {
        let peer: Peer<Flip, ()> = Peer::done(true, ());
        assert!(matches!(
            peer.validate(PeerRole::Client),
            Err(PeerBuildError::Agency {
                operation: "done",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_collect_done_on_an_empty_queue() {
        let peer: Peer<Flip, ()> = Peer::collect_done(Peer::done(false, ()));
        assert!(matches!(
            peer.validate(PeerRole::Client),
            Err(PeerBuildError::Queue {
                operation: "collect-done",
                ..
            })
        ));
    }
}
