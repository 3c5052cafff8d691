//! The forkid sighash preimage.
//!
//! The chain commits signatures over a preimage that includes the spent
//! output's locking script and amount, with the fork id bit set in the
//! sighash type. The digest is the double-SHA256 of:
//!
//! ```text
//! nVersion || hashPrevouts || hashSequence || outpoint || scriptCode ||
//! amount || nSequence || hashOutputs || nLockTime || sighashType
//! ```

use bitcoin::{
    consensus::Encodable,
    hashes::{sha256d, Hash},
    Script, Transaction,
};
use thiserror::Error;

/// SIGHASH_ALL with the fork id bit set.
pub const SIGHASH_ALL_FORKID: u32 = 0x41;

#[derive(Debug, Error)]
pub enum SighashError {
    #[error("Input index {index} out of bounds ({num_inputs} inputs)")]
    InputIndexOutOfBounds { index: usize, num_inputs: usize },
}

/// Compute the signature digest for `tx`'s input at `input_index`, which
/// spends an output locked by `script_code` worth `amount_sats`.
pub fn sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    amount_sats: u64,
) -> Result<[u8; 32], SighashError> {
    let input = tx.input.get(input_index).ok_or(
        SighashError::InputIndexOutOfBounds {
            index: input_index,
            num_inputs: tx.input.len(),
        },
    )?;

    let mut prevouts = Vec::new();
    let mut sequences = Vec::new();
    for txin in &tx.input {
        txin.previous_output
            .consensus_encode(&mut prevouts)
            .expect("writing to a Vec never fails");
        txin.sequence
            .consensus_encode(&mut sequences)
            .expect("writing to a Vec never fails");
    }

    let mut outputs = Vec::new();
    for txout in &tx.output {
        txout
            .consensus_encode(&mut outputs)
            .expect("writing to a Vec never fails");
    }

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage
        .extend_from_slice(sha256d::Hash::hash(&prevouts).as_byte_array());
    preimage
        .extend_from_slice(sha256d::Hash::hash(&sequences).as_byte_array());
    input
        .previous_output
        .consensus_encode(&mut preimage)
        .expect("writing to a Vec never fails");
    script_code
        .to_owned()
        .consensus_encode(&mut preimage)
        .expect("writing to a Vec never fails");
    preimage.extend_from_slice(&amount_sats.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.0.to_le_bytes());
    preimage
        .extend_from_slice(sha256d::Hash::hash(&outputs).as_byte_array());
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&SIGHASH_ALL_FORKID.to_le_bytes());

    Ok(sha256d::Hash::hash(&preimage).to_byte_array())
}
