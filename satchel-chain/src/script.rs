//! Locking script construction.

use bitcoin::{
    opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2},
    script::Builder,
    PublicKey as BitcoinPublicKey, ScriptBuf,
};
use secp256k1::PublicKey;

/// The 2-of-2 bare multisig predicate over the two channel public keys.
///
/// Keys are embedded in lexicographic order of their compressed
/// serialization, independent of which party was initiator, so both
/// parties derive byte-identical funding scripts.
pub fn multisig_2of2(a: &PublicKey, b: &PublicKey) -> ScriptBuf {
    let (first, second) = sort_keys(a, b);
    Builder::new()
        .push_opcode(OP_PUSHNUM_2)
        .push_key(&BitcoinPublicKey::new(first))
        .push_key(&BitcoinPublicKey::new(second))
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// The two channel keys in lexicographic order of their compressed
/// serialization. This ordering decides both the multisig key slots and
/// the signature slots when unlocking.
pub fn sort_keys(a: &PublicKey, b: &PublicKey) -> (PublicKey, PublicKey) {
    if a.serialize() <= b.serialize() {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

/// A standard pay-to-public-key-hash output script for `pk`.
pub fn p2pkh(pk: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&BitcoinPublicKey::new(*pk).pubkey_hash())
}

#[cfg(test)]
mod test {
    use crate::keys::PaymentKeypair;

    use super::*;

    #[test]
    fn multisig_key_order_is_initiator_independent() {
        let a = PaymentKeypair::generate().public_key();
        let b = PaymentKeypair::generate().public_key();

        assert_eq!(multisig_2of2(&a, &b), multisig_2of2(&b, &a));

        let (first, second) = sort_keys(&a, &b);
        assert!(first.serialize() <= second.serialize());
        let (first2, second2) = sort_keys(&b, &a);
        assert_eq!(first, first2);
        assert_eq!(second, second2);
    }

    #[test]
    fn multisig_script_shape() {
        let a = PaymentKeypair::generate().public_key();
        let b = PaymentKeypair::generate().public_key();
        let script = multisig_2of2(&a, &b);

        let bytes = script.as_bytes();
        // OP_2, two 33-byte key pushes, OP_2, OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 1 + 34 + 34 + 1 + 1);
        assert_eq!(bytes[0], OP_PUSHNUM_2.to_u8());
        assert_eq!(*bytes.last().unwrap(), OP_CHECKMULTISIG.to_u8());
    }

    #[test]
    fn p2pkh_script_is_standard() {
        let pk = PaymentKeypair::generate().public_key();
        assert!(p2pkh(&pk).is_p2pkh());
    }
}
