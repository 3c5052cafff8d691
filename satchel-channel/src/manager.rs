//! The channel manager: enforces channel lifecycle and balance invariants.
//!
//! Concurrency: per-channel operations are serialized by a per-channel
//! async lock held across the whole verify-then-commit sequence. The
//! channel map itself is only locked for lookups and insertions, so
//! operations on different channels proceed in parallel.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bitcoin::{consensus::encode::serialize, Transaction, Txid};
use common::time::TimestampMs;
use satchel_chain::{keys::PaymentKeypair, tx};
use satchel_wire::{envelope::ChannelUpdatePayload, ChannelId};
use secp256k1::{ecdsa::Signature, PublicKey};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, ChannelState, PaymentDirection, PaymentRecord},
    error::ChannelError,
    persister::ChannelPersister,
};

/// The policy knobs the manager enforces.
#[derive(Clone, Debug)]
pub struct ChannelManagerConfig {
    pub min_capacity: u64,
    pub max_capacity: u64,
    /// Total fee reserved by commitment and settlement transactions.
    pub commitment_fee_sats: u64,
}

/// An optimistically applied outgoing payment, carrying enough state to
/// roll the channel back if the counterparty rejects it. The sender must
/// not re-increment the sequence when retrying after a transient error;
/// rolling back and re-creating yields the same sequence number.
#[derive(Clone, Debug)]
pub struct OutboundPayment {
    pub payload: ChannelUpdatePayload,
    prev_sequence: u64,
    prev_local_balance: u64,
    prev_remote_balance: u64,
}

/// The outcome of initiating a cooperative close.
pub struct CloseInitiation {
    pub channel: Channel,
    /// The unsigned settlement transaction.
    pub settlement: Transaction,
    /// Our signature over it.
    pub signature: Signature,
}

/// The outcome of counter-signing a cooperative close.
#[derive(Debug)]
pub struct CloseCounterSign {
    pub channel: Channel,
    /// The fully signed, immediately broadcastable settlement.
    pub settlement: Transaction,
    /// Our signature over it.
    pub signature: Signature,
}

pub struct ChannelManager {
    config: ChannelManagerConfig,
    local_peer_id: String,
    keypair: PaymentKeypair,
    persister: Arc<dyn ChannelPersister>,
    channels: std::sync::Mutex<HashMap<ChannelId, Arc<AsyncMutex<Channel>>>>,
}

impl ChannelManager {
    pub fn new(
        config: ChannelManagerConfig,
        local_peer_id: String,
        keypair: PaymentKeypair,
        persister: Arc<dyn ChannelPersister>,
    ) -> Self {
        Self {
            config,
            local_peer_id,
            keypair,
            persister,
            channels: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The local payment public key, as sent in channel negotiation.
    pub fn local_pubkey(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Restore persisted channels at startup.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let channels = self.persister.load_channels().await?;
        let count = channels.len();
        let mut map = self.channels.lock().unwrap();
        for channel in channels {
            map.insert(channel.id, Arc::new(AsyncMutex::new(channel)));
        }
        Ok(count)
    }

    /// Initiator side: create a channel proposal.
    ///
    /// The creator commits the full capacity, so it starts with
    /// `local_balance == capacity` and a zero remote balance.
    pub async fn create(
        &self,
        remote_peer_id: &str,
        remote_pub_key: PublicKey,
        capacity: u64,
        lifetime: Duration,
    ) -> Result<Channel, ChannelError> {
        self.check_capacity(capacity)?;

        let now = TimestampMs::now();
        let channel = Channel {
            id: ChannelId::generate(),
            state: ChannelState::Pending,
            local_peer_id: self.local_peer_id.clone(),
            remote_peer_id: remote_peer_id.to_owned(),
            local_pub_key: self.keypair.public_key(),
            remote_pub_key,
            capacity,
            local_balance: capacity,
            remote_balance: 0,
            sequence_number: 0,
            funding_txid: None,
            funding_output_index: None,
            close_txid: None,
            n_lock_time: now.as_secs() + lifetime.as_secs(),
            created_at: now,
            updated_at: now,
        };

        self.persister
            .persist_channel(&channel)
            .await
            .map_err(ChannelError::Persist)?;

        self.channels
            .lock()
            .unwrap()
            .insert(channel.id, Arc::new(AsyncMutex::new(channel.clone())));

        info!(channel_id = %channel.id, capacity, "Created channel");
        Ok(channel)
    }

    /// Responder side: register the counterpart of a remote open proposal,
    /// with mirrored balances and the same lock time.
    ///
    /// Idempotent on repeated accepts of the same id with matching
    /// arguments; fails with `id-reused` otherwise.
    pub async fn accept(
        &self,
        id: ChannelId,
        remote_peer_id: &str,
        remote_pub_key: PublicKey,
        capacity: u64,
        n_lock_time: u64,
    ) -> Result<Channel, ChannelError> {
        if let Some(existing) = self.entry(id) {
            let existing = existing.lock().await;
            let matches = existing.remote_peer_id == remote_peer_id
                && existing.remote_pub_key == remote_pub_key
                && existing.capacity == capacity
                && existing.n_lock_time == n_lock_time;
            return if matches {
                Ok(existing.clone())
            } else {
                Err(ChannelError::IdReused(id))
            };
        }

        self.check_capacity(capacity)?;

        let now = TimestampMs::now();
        let channel = Channel {
            id,
            state: ChannelState::Pending,
            local_peer_id: self.local_peer_id.clone(),
            remote_peer_id: remote_peer_id.to_owned(),
            local_pub_key: self.keypair.public_key(),
            remote_pub_key,
            capacity,
            local_balance: 0,
            remote_balance: capacity,
            sequence_number: 0,
            funding_txid: None,
            funding_output_index: None,
            close_txid: None,
            n_lock_time,
            created_at: now,
            updated_at: now,
        };

        self.persister
            .persist_channel(&channel)
            .await
            .map_err(ChannelError::Persist)?;

        self.channels
            .lock()
            .unwrap()
            .insert(id, Arc::new(AsyncMutex::new(channel.clone())));

        info!(channel_id = %id, capacity, "Accepted channel");
        Ok(channel)
    }

    /// Record the on-chain 2-of-2 outpoint. Permitted only while pending.
    pub async fn set_funding(
        &self,
        id: ChannelId,
        txid: Txid,
        vout: u32,
    ) -> Result<Channel, ChannelError> {
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;
        require_state(&channel, ChannelState::Pending)?;

        let mut updated = channel.clone();
        updated.funding_txid = Some(txid);
        updated.funding_output_index = Some(vout);
        updated.updated_at = TimestampMs::now();

        self.persist(&updated).await?;
        *channel = updated.clone();
        Ok(updated)
    }

    /// Transition `pending -> open`. In the simplified flow this happens
    /// right after the responder's accept, before the funding output
    /// confirms.
    pub async fn open(&self, id: ChannelId) -> Result<Channel, ChannelError> {
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;
        require_state(&channel, ChannelState::Pending)?;

        let mut updated = channel.clone();
        updated.state = ChannelState::Open;
        updated.updated_at = TimestampMs::now();

        self.persist(&updated).await?;
        *channel = updated.clone();
        info!(channel_id = %id, "Channel open");
        Ok(updated)
    }

    /// Initiator side: handle the responder's accept. Verifies the echoed
    /// public key against the one the channel was created with, then opens.
    pub async fn confirm_accept(
        &self,
        id: ChannelId,
        responder_pub_key: PublicKey,
    ) -> Result<Channel, ChannelError> {
        {
            let entry =
                self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
            let channel = entry.lock().await;
            require_state(&channel, ChannelState::Pending)?;
            if channel.remote_pub_key != responder_pub_key {
                return Err(ChannelError::BadPublicKey);
            }
        }
        self.open(id).await
    }

    /// Sender side: produce a payment for `amount` satoshis and apply it
    /// optimistically. The caller rolls back via [`rollback_payment`] if
    /// the counterparty rejects.
    ///
    /// [`rollback_payment`]: Self::rollback_payment
    pub async fn create_payment(
        &self,
        id: ChannelId,
        amount: u64,
    ) -> Result<OutboundPayment, ChannelError> {
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;
        require_state(&channel, ChannelState::Open)?;

        if amount > channel.local_balance {
            return Err(ChannelError::InsufficientBalance {
                amount,
                available: channel.local_balance,
            });
        }

        let new_sequence = channel.sequence_number + 1;
        let new_local = channel.local_balance - amount;
        let new_remote = channel.remote_balance + amount;

        let signature = self.sign_commitment(
            &channel,
            new_local,
            new_remote,
            new_sequence,
        )?;

        let payload = ChannelUpdatePayload {
            channel_id: id,
            amount,
            new_sequence_number: new_sequence,
            new_local_balance: new_local,
            new_remote_balance: new_remote,
            signature: hex::encode(signature.serialize_der()),
            timestamp: TimestampMs::now(),
        };

        let outbound = OutboundPayment {
            payload: payload.clone(),
            prev_sequence: channel.sequence_number,
            prev_local_balance: channel.local_balance,
            prev_remote_balance: channel.remote_balance,
        };

        let mut updated = channel.clone();
        updated.sequence_number = new_sequence;
        updated.local_balance = new_local;
        updated.remote_balance = new_remote;
        updated.updated_at = payload.timestamp;

        let record = PaymentRecord {
            channel_id: id,
            direction: PaymentDirection::Outbound,
            amount,
            new_sequence_number: new_sequence,
            new_local_balance: new_local,
            new_remote_balance: new_remote,
            signature: payload.signature.clone(),
            timestamp: payload.timestamp,
        };

        self.persist(&updated).await?;
        self.persister
            .append_payment(&record)
            .await
            .map_err(ChannelError::Persist)?;
        *channel = updated;

        debug!(channel_id = %id, amount, sequence = new_sequence, "Sent payment");
        Ok(outbound)
    }

    /// Roll back an optimistically applied outgoing payment after the
    /// counterparty rejected it. Only possible while no newer payment has
    /// been applied on top; sequence numbers are never re-incremented.
    pub async fn rollback_payment(
        &self,
        payment: &OutboundPayment,
    ) -> Result<(), ChannelError> {
        let id = payment.payload.channel_id;
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;

        if channel.sequence_number != payment.payload.new_sequence_number {
            return Err(ChannelError::StaleSequence {
                expected: payment.payload.new_sequence_number,
                got: channel.sequence_number,
            });
        }

        let mut updated = channel.clone();
        updated.sequence_number = payment.prev_sequence;
        updated.local_balance = payment.prev_local_balance;
        updated.remote_balance = payment.prev_remote_balance;
        updated.updated_at = TimestampMs::now();

        self.persist(&updated).await?;
        *channel = updated;

        warn!(channel_id = %id, "Rolled back rejected payment");
        Ok(())
    }

    /// Receiver side: verify and commit an inbound payment update.
    ///
    /// The wire payload expresses balances from the sender's perspective;
    /// we swap local and remote when applying. The per-channel lock is
    /// held across the whole verify-then-commit sequence.
    pub async fn process_payment(
        &self,
        from_peer_id: &str,
        payload: &ChannelUpdatePayload,
    ) -> Result<PaymentRecord, ChannelError> {
        let id = payload.channel_id;
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;

        if channel.remote_peer_id != from_peer_id {
            return Err(ChannelError::WrongPeer);
        }
        require_state(&channel, ChannelState::Open)?;

        // Perspective swap: the sender's "local" is our "remote".
        let new_local = payload.new_remote_balance;
        let new_remote = payload.new_local_balance;
        let new_sequence = payload.new_sequence_number;

        if new_sequence != channel.sequence_number + 1 {
            return Err(ChannelError::StaleSequence {
                expected: channel.sequence_number + 1,
                got: new_sequence,
            });
        }

        match new_local.checked_add(new_remote) {
            Some(sum) if sum == channel.capacity => (),
            _ => return Err(ChannelError::BalanceImbalance),
        }

        // The sender spends from its own balance, which is our remote.
        if payload.amount > channel.remote_balance {
            return Err(ChannelError::InsufficientBalance {
                amount: payload.amount,
                available: channel.remote_balance,
            });
        }

        // The declared amount must match the declared balance movement.
        let amount_consistent = new_local
            == channel.local_balance + payload.amount
            && new_remote == channel.remote_balance - payload.amount;
        if !amount_consistent {
            return Err(ChannelError::BalanceImbalance);
        }

        let signature_der = hex::decode(&payload.signature)
            .map_err(|_| ChannelError::BadSignature)?;
        let params = channel.commitment_params(
            new_local,
            new_remote,
            new_sequence,
            self.config.commitment_fee_sats,
        );
        let commitment = tx::build_commitment_tx(&params)?;
        let verified = tx::verify_channel_signature(
            &commitment,
            &channel.funding_script(),
            channel.capacity,
            &channel.remote_pub_key,
            &signature_der,
        );
        if !verified {
            return Err(ChannelError::BadSignature);
        }

        let mut updated = channel.clone();
        updated.sequence_number = new_sequence;
        updated.local_balance = new_local;
        updated.remote_balance = new_remote;
        updated.updated_at = TimestampMs::now();

        let record = PaymentRecord {
            channel_id: id,
            direction: PaymentDirection::Inbound,
            amount: payload.amount,
            new_sequence_number: new_sequence,
            new_local_balance: new_local,
            new_remote_balance: new_remote,
            signature: payload.signature.clone(),
            timestamp: payload.timestamp,
        };

        self.persist(&updated).await?;
        self.persister
            .append_payment(&record)
            .await
            .map_err(ChannelError::Persist)?;
        *channel = updated;

        debug!(
            channel_id = %id,
            amount = payload.amount,
            sequence = new_sequence,
            "Received payment"
        );
        Ok(record)
    }

    /// Initiate a cooperative close: `open -> closing`, freezing the
    /// sequence number as final, and produce the settlement carrying the
    /// final balance split plus our signature.
    pub async fn close(
        &self,
        id: ChannelId,
    ) -> Result<CloseInitiation, ChannelError> {
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;
        require_state(&channel, ChannelState::Open)?;

        let (settlement, signature) = self.build_settlement(&channel)?;

        let mut updated = channel.clone();
        updated.state = ChannelState::Closing;
        updated.updated_at = TimestampMs::now();

        self.persist(&updated).await?;
        *channel = updated.clone();

        info!(channel_id = %id, "Closing channel cooperatively");
        Ok(CloseInitiation {
            channel: updated,
            settlement,
            signature,
        })
    }

    /// Responder side of a cooperative close: verify the initiator's
    /// settlement against our own view of the final balances, counter-sign
    /// it, and transition to closing. The returned transaction is fully
    /// signed and immediately broadcastable.
    pub async fn counter_sign_close(
        &self,
        from_peer_id: &str,
        id: ChannelId,
        settlement_hex: &str,
        signature_hex: &str,
    ) -> Result<CloseCounterSign, ChannelError> {
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;

        if channel.remote_peer_id != from_peer_id {
            return Err(ChannelError::WrongPeer);
        }
        require_state(&channel, ChannelState::Open)?;

        // Rebuild the settlement from our perspective; the initiator's
        // blob must match it byte for byte.
        let (expected, _) = self.build_settlement_unsigned(&channel)?;
        let presented = tx::tx_from_hex(settlement_hex)?;
        if serialize(&presented) != serialize(&expected) {
            return Err(ChannelError::BalanceImbalance);
        }

        let their_sig_der = hex::decode(signature_hex)
            .map_err(|_| ChannelError::BadSignature)?;
        let funding_script = channel.funding_script();
        if !tx::verify_channel_signature(
            &expected,
            &funding_script,
            channel.capacity,
            &channel.remote_pub_key,
            &their_sig_der,
        ) {
            return Err(ChannelError::BadSignature);
        }
        let their_sig = Signature::from_der(&their_sig_der)
            .map_err(|_| ChannelError::BadSignature)?;

        let our_sig = tx::sign_channel_tx(
            &expected,
            &funding_script,
            channel.capacity,
            &self.keypair,
        )?;

        let mut settlement = expected;
        tx::finalize_channel_tx(
            &mut settlement,
            &channel.local_pub_key,
            &our_sig,
            &channel.remote_pub_key,
            &their_sig,
        );

        let mut updated = channel.clone();
        updated.state = ChannelState::Closing;
        updated.updated_at = TimestampMs::now();

        self.persist(&updated).await?;
        *channel = updated.clone();

        Ok(CloseCounterSign {
            channel: updated,
            settlement,
            signature: our_sig,
        })
    }

    /// `closing -> closed`, recording the settlement broadcast id.
    pub async fn finalize_close(
        &self,
        id: ChannelId,
        close_txid: Txid,
    ) -> Result<Channel, ChannelError> {
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;
        require_state(&channel, ChannelState::Closing)?;

        let mut updated = channel.clone();
        updated.state = ChannelState::Closed;
        updated.close_txid = Some(close_txid);
        updated.updated_at = TimestampMs::now();

        self.persist(&updated).await?;
        *channel = updated.clone();

        info!(channel_id = %id, %close_txid, "Channel closed");
        Ok(updated)
    }

    /// Park a channel in the disputed state. No dispute protocol exists;
    /// this only freezes the channel against further cooperative use.
    pub async fn mark_disputed(
        &self,
        id: ChannelId,
    ) -> Result<Channel, ChannelError> {
        let entry = self.entry(id).ok_or(ChannelError::UnknownChannel(id))?;
        let mut channel = entry.lock().await;

        let mut updated = channel.clone();
        updated.state = ChannelState::Disputed;
        updated.updated_at = TimestampMs::now();

        self.persist(&updated).await?;
        *channel = updated.clone();

        warn!(channel_id = %id, "Channel marked disputed");
        Ok(updated)
    }

    /// A point-in-time copy of one channel.
    pub async fn get(&self, id: ChannelId) -> Option<Channel> {
        let entry = self.entry(id)?;
        let channel = entry.lock().await;
        Some(channel.clone())
    }

    /// Point-in-time copies of every channel.
    pub async fn list(&self) -> Vec<Channel> {
        let entries: Vec<_> =
            self.channels.lock().unwrap().values().cloned().collect();
        let mut channels = Vec::with_capacity(entries.len());
        for entry in entries {
            channels.push(entry.lock().await.clone());
        }
        channels.sort_by_key(|c| c.created_at);
        channels
    }

    // --- Internal helpers --- //

    fn entry(&self, id: ChannelId) -> Option<Arc<AsyncMutex<Channel>>> {
        self.channels.lock().unwrap().get(&id).cloned()
    }

    fn check_capacity(&self, capacity: u64) -> Result<(), ChannelError> {
        if capacity < self.config.min_capacity
            || capacity > self.config.max_capacity
        {
            return Err(ChannelError::CapacityOutOfRange {
                capacity,
                min: self.config.min_capacity,
                max: self.config.max_capacity,
            });
        }
        Ok(())
    }

    async fn persist(&self, channel: &Channel) -> Result<(), ChannelError> {
        self.persister
            .persist_channel(channel)
            .await
            .map_err(ChannelError::Persist)
    }

    fn sign_commitment(
        &self,
        channel: &Channel,
        new_local: u64,
        new_remote: u64,
        new_sequence: u64,
    ) -> Result<Signature, ChannelError> {
        let params = channel.commitment_params(
            new_local,
            new_remote,
            new_sequence,
            self.config.commitment_fee_sats,
        );
        let commitment = tx::build_commitment_tx(&params)?;
        Ok(tx::sign_channel_tx(
            &commitment,
            &channel.funding_script(),
            channel.capacity,
            &self.keypair,
        )?)
    }

    fn build_settlement_unsigned(
        &self,
        channel: &Channel,
    ) -> Result<(Transaction, ()), ChannelError> {
        let params = channel.commitment_params(
            channel.local_balance,
            channel.remote_balance,
            channel.sequence_number,
            self.config.commitment_fee_sats,
        );
        Ok((tx::build_settlement_tx(&params)?, ()))
    }

    fn build_settlement(
        &self,
        channel: &Channel,
    ) -> Result<(Transaction, Signature), ChannelError> {
        let (settlement, ()) = self.build_settlement_unsigned(channel)?;
        let signature = tx::sign_channel_tx(
            &settlement,
            &channel.funding_script(),
            channel.capacity,
            &self.keypair,
        )?;
        Ok((settlement, signature))
    }
}

fn require_state(
    channel: &Channel,
    required: ChannelState,
) -> Result<(), ChannelError> {
    if channel.state != required {
        return Err(ChannelError::WrongState {
            required,
            actual: channel.state,
        });
    }
    Ok(())
}
