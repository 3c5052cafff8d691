//! The per-channel entity.

use bitcoin::{OutPoint, Txid};
use common::time::TimestampMs;
use satchel_chain::tx::{CommitmentParams, PartyBalance};
use satchel_wire::ChannelId;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// Channel lifecycle states.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Created by the initiator; awaiting the responder's accept.
    Pending,
    /// Live; payments may flow.
    Open,
    /// Cooperative close initiated; awaiting counter-signature.
    Closing,
    /// Settlement broadcast recorded; frozen.
    Closed,
    /// Reserved for unilateral paths. No protocol exists behind this state
    /// yet; nothing transitions out of it.
    Disputed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Disputed => "disputed",
        };
        write!(f, "{s}")
    }
}

/// A payment channel, always viewed from the local node's perspective:
/// `local_balance + remote_balance == capacity` at all times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub state: ChannelState,
    pub local_peer_id: String,
    pub remote_peer_id: String,
    pub local_pub_key: PublicKey,
    pub remote_pub_key: PublicKey,
    /// Total satoshis committed to the channel. Immutable after creation.
    pub capacity: u64,
    pub local_balance: u64,
    pub remote_balance: u64,
    /// Incremented by exactly one per accepted payment.
    pub sequence_number: u64,
    pub funding_txid: Option<Txid>,
    pub funding_output_index: Option<u32>,
    /// The settlement broadcast id, recorded when the channel closes.
    pub close_txid: Option<Txid>,
    /// Absolute chain-level time (seconds) after which the funding output
    /// becomes unilaterally spendable by the latest commitment.
    pub n_lock_time: u64,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl Channel {
    /// The on-chain 2-of-2 outpoint. Before funding is recorded both
    /// parties deterministically fall back to the null outpoint, so
    /// commitment signatures exchanged in the simplified (unfunded) flow
    /// still agree.
    pub fn funding_outpoint(&self) -> OutPoint {
        match (self.funding_txid, self.funding_output_index) {
            (Some(txid), Some(vout)) => OutPoint::new(txid, vout),
            _ => OutPoint::null(),
        }
    }

    /// The commitment parameters for a prospective state of this channel.
    pub fn commitment_params(
        &self,
        new_local_balance: u64,
        new_remote_balance: u64,
        new_sequence_number: u64,
        fee_sats: u64,
    ) -> CommitmentParams {
        CommitmentParams {
            funding_outpoint: self.funding_outpoint(),
            capacity_sats: self.capacity,
            local: PartyBalance {
                pubkey: self.local_pub_key,
                balance_sats: new_local_balance,
            },
            remote: PartyBalance {
                pubkey: self.remote_pub_key,
                balance_sats: new_remote_balance,
            },
            sequence_number: new_sequence_number,
            lock_time: self.n_lock_time,
            fee_sats,
        }
    }

    /// The 2-of-2 funding script for this channel's key pair.
    pub fn funding_script(&self) -> bitcoin::ScriptBuf {
        satchel_chain::script::multisig_2of2(
            &self.local_pub_key,
            &self.remote_pub_key,
        )
    }
}

/// Which way a recorded payment moved value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentDirection {
    Outbound,
    Inbound,
}

/// One accepted payment, as appended to the per-channel payment log.
/// Balances are from the local node's perspective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub channel_id: ChannelId,
    pub direction: PaymentDirection,
    pub amount: u64,
    pub new_sequence_number: u64,
    pub new_local_balance: u64,
    pub new_remote_balance: u64,
    /// DER signature over the commitment for the new state, hex.
    pub signature: String,
    pub timestamp: TimestampMs,
}
