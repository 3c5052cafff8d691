use satchel_chain::tx::TxError;
use satchel_wire::ChannelId;
use thiserror::Error;

use crate::channel::ChannelState;

/// Channel-state errors. Receiver-side failures map onto `reject`-shaped
/// responses to the sender; local state is never changed on error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("Channel id {0} already in use with different parameters")]
    IdReused(ChannelId),
    #[error("Channel is {actual}, operation requires {required}")]
    WrongState {
        required: ChannelState,
        actual: ChannelState,
    },
    #[error(
        "Capacity {capacity} outside accepted range [{min}, {max}] sats"
    )]
    CapacityOutOfRange { capacity: u64, min: u64, max: u64 },
    #[error("Stale sequence number: expected {expected}, got {got}")]
    StaleSequence { expected: u64, got: u64 },
    #[error("New balances do not sum to the channel capacity")]
    BalanceImbalance,
    #[error("Insufficient balance: tried to move {amount} of {available} sats")]
    InsufficientBalance { amount: u64, available: u64 },
    #[error("Message sender is not a party to this channel")]
    WrongPeer,
    #[error("Commitment signature did not verify")]
    BadSignature,
    #[error("Malformed public key")]
    BadPublicKey,
    #[error("Transaction construction failed: {0}")]
    Tx(#[from] TxError),
    #[error("Persistence failed: {0:#}")]
    Persist(#[source] anyhow::Error),
}

impl ChannelError {
    /// The stable error kind string carried in reject messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownChannel(_) => "unknown-channel",
            Self::IdReused(_) => "id-reused",
            Self::WrongState { .. } => "wrong-state",
            Self::CapacityOutOfRange { .. } => "capacity-out-of-range",
            Self::StaleSequence { .. } => "stale-sequence",
            Self::BalanceImbalance => "balance-imbalance",
            Self::InsufficientBalance { .. } => "insufficient-balance",
            Self::WrongPeer => "wrong-peer",
            Self::BadSignature => "bad-signature",
            Self::BadPublicKey => "bad-public-key",
            Self::Tx(_) => "tx-construction",
            Self::Persist(_) => "persistence",
        }
    }

    /// Whether the fault lies with the remote party's message (vs. a local
    /// failure). Drives the 4xx-vs-5xx split on the control plane.
    pub fn is_remote_fault(&self) -> bool {
        !matches!(self, Self::Tx(_) | Self::Persist(_))
    }
}
