//! Abstract on-chain services. The node consumes these as opaque
//! byte-in / txid-out collaborators; implementations live outside the
//! core and are injected at construction.

use async_trait::async_trait;
use bitcoin::{ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

/// A spendable output owned by the local payment key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub satoshis: u64,
    pub script_pubkey: ScriptBuf,
}

/// Broadcasts a raw transaction to the chain network.
#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    async fn broadcast(&self, raw_tx: &[u8]) -> anyhow::Result<Txid>;
}

/// Enumerates spendable outputs for the local payment key.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn get_utxos(&self) -> anyhow::Result<Vec<Utxo>>;
}

/// Fetches merkle proofs for confirmed transactions.
#[async_trait]
pub trait ProofSource: Send + Sync {
    /// Returns `None` while the transaction is not yet confirmed.
    async fn get_proof(&self, txid: Txid) -> anyhow::Result<Option<Vec<u8>>>;
}
