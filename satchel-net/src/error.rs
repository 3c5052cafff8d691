use libp2p::PeerId;
use thiserror::Error;

/// Errors surfaced by the transport fabric and message handler.
///
/// Transport errors on a single stream never kill the node: the stream is
/// closed and the error propagates to the caller, nothing more.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("Dial failed: {0}")]
    DialFailed(String),
    #[error("Not connected to peer {0}")]
    NotConnected(PeerId),
    #[error("Multiaddr is missing a /p2p/<peer> component")]
    MissingPeerId,
    #[error("Send timed out")]
    SendTimeout,
    #[error("Request timed out")]
    Timeout,
    #[error("Request was cancelled")]
    Cancelled,
    #[error("Stream reset or closed by remote")]
    StreamReset,
    #[error("Oversize message: {len} bytes exceeds the {max} byte limit")]
    OversizeMessage { len: usize, max: usize },
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("Envelope `from` field does not match the transport identity: claimed {claimed}, actual {actual}")]
    FromSpoofed { claimed: String, actual: PeerId },
    #[error("The node is shutting down")]
    Shutdown,
}

impl NetError {
    /// The stable error kind string used in logs and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DialFailed(_) => "dial-failed",
            Self::NotConnected(_) => "peer-not-connected",
            Self::MissingPeerId => "bad-multiaddr",
            Self::SendTimeout => "send-timeout",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::StreamReset => "stream-reset",
            Self::OversizeMessage { .. } => "oversize-message",
            Self::MalformedEnvelope(_) => "framing-error",
            Self::FromSpoofed { .. } => "from-field-spoofed",
            Self::Shutdown => "shutdown",
        }
    }
}
