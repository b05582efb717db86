//! Protocol descriptors: states, agency, and declared transitions.

use std::fmt;

mod peer;

pub use peer::{AwaitFn, Peer, PeerBuildError, UnexpectedMessage};

/// Which party may send the next message in a given protocol state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Agency {
    Client,
    Server,
    /// Terminal: nobody may send.
    Nobody,
}

/// The role a peer plays on its end of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Client,
    Server,
}

/// Agency seen from one peer's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelativeAgency {
    /// We hold agency: we may send.
    We,
    /// The remote peer holds agency: we may only receive.
    They,
    /// Terminal state.
    Nobody,
}

impl Agency {
    /// Resolve absolute agency against a peer's role.
    pub fn relative_to(self, role: PeerRole) -> RelativeAgency {
        match (self, role) {
            (Agency::Client, PeerRole::Client) | (Agency::Server, PeerRole::Server) => {
                RelativeAgency::We
            }
            (Agency::Client, PeerRole::Server) | (Agency::Server, PeerRole::Client) => {
                RelativeAgency::They
            }
            (Agency::Nobody, _) => RelativeAgency::Nobody,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Client => write!(f, "client"),
            PeerRole::Server => write!(f, "server"),
        }
    }
}

/// Static description of a session protocol.
///
/// A protocol is a set of states, an agency assignment per state, and a
/// labelled transition relation. Both the agency and the legal outgoing
/// transitions are total functions of the current state; the driver and
/// codecs reject anything `transition` rejects.
pub trait Protocol {
    type State: Clone + Eq + fmt::Debug + Send + 'static;
    type Message: fmt::Debug + Send + 'static;

    /// Who may send in `state`.
    fn agency(state: &Self::State) -> Agency;

    /// The target state of `message` sent from `state`, or `None` when the
    /// message is not a declared transition from `state`.
    fn transition(state: &Self::State, message: &Self::Message) -> Option<Self::State>;

    /// A state is terminal iff nobody holds agency in it.
    fn is_terminal(state: &Self::State) -> bool {
        Self::agency(state) == Agency::Nobody
    }
}
