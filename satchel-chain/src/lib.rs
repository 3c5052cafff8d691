//! Deterministic transaction construction and signature handling for the
//! three channel transaction types (funding, commitment, settlement), plus
//! the abstract on-chain services the node consumes.
//!
//! This layer is stateless: every function is a pure function of its
//! inputs, and two parties constructing the same logical transaction
//! produce byte-identical results.

/// Payment-system keys (secp256k1, distinct from the transport identity).
pub mod keys;
/// Locking script construction.
pub mod script;
/// Abstract on-chain services: broadcast, utxo lookup, merkle proofs.
pub mod service;
/// The forkid sighash preimage.
pub mod sighash;
/// Funding / commitment / settlement construction and signatures.
pub mod tx;

pub use keys::PaymentKeypair;
pub use service::{ProofSource, TxBroadcaster, Utxo, UtxoSource};

use std::sync::OnceLock;

use secp256k1::{All, Secp256k1};

/// The shared secp256k1 context. Verification-capable contexts are
/// expensive to create, so build one on first use and keep it.
pub(crate) fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}
