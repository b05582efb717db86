//! Safety limits (normative defaults).

/// Bounds applied while buffering and decoding wire input.
///
/// Values are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum bytes a single message decode may accumulate.
    pub max_message_bytes: usize,
    /// Maximum entries in a version-proposal map.
    pub max_versions: usize,
    /// Maximum bytes of refusal text accepted from a peer.
    pub max_refuse_text_bytes: usize,
    /// Poll interval for cancellation-aware blocking receives.
    pub cancel_poll_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_bytes: 16 * 1024 * 1024,
            max_versions: 256,
            max_refuse_text_bytes: 4 * 1024,
            cancel_poll_ms: 10,
        }
    }
}

impl Limits {
    /// Tight limits suitable for the version-negotiation handshake, which
    /// exchanges only small control messages.
    pub fn handshake() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            ..Self::default()
        }
    }
}
