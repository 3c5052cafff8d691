//! The payment-system keypair.
//!
//! Distinct from the transport identity key: this is a secp256k1 pair used
//! for transaction signing and address derivation. The core accepts the
//! secret pre-loaded; generation exists for first-run provisioning.

use bitcoin::{Address, Network, PublicKey as BitcoinPublicKey};
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey};
use thiserror::Error;

use crate::secp;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid secret key bytes")]
    BadSecretKey,
    #[error("Invalid public key")]
    BadPublicKey,
}

/// A secp256k1 keypair for transaction signing.
#[derive(Clone)]
pub struct PaymentKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl PaymentKeypair {
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret =
            SecretKey::from_slice(bytes).map_err(|_| KeyError::BadSecretKey)?;
        let public = PublicKey::from_secret_key(secp(), &secret);
        Ok(Self { secret, public })
    }

    /// Generate a fresh keypair from OS entropy. Used once at first run.
    pub fn generate() -> Self {
        // from_slice rejects zero and >= the curve order; with 32 bytes of
        // OS entropy a retry is a once-per-universe event, but loop anyway.
        loop {
            let bytes = common::id::random_array::<32>();
            if let Ok(keypair) = Self::from_secret_bytes(&bytes) {
                return keypair;
            }
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// The compressed public key, hex-encoded as carried in channel
    /// negotiation payloads.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    /// The default receive address: P2PKH over the compressed pubkey.
    pub fn p2pkh_address(&self, network: Network) -> Address {
        Address::p2pkh(BitcoinPublicKey::new(self.public), network)
    }

    /// Sign a 32-byte sighash digest.
    pub fn sign_digest(&self, digest: [u8; 32]) -> Signature {
        let msg = Message::from_digest(digest);
        secp().sign_ecdsa(&msg, &self.secret)
    }
}

impl std::fmt::Debug for PaymentKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret half.
        f.debug_struct("PaymentKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Parse a compressed public key from its hex wire encoding.
pub fn parse_pubkey_hex(s: &str) -> Result<PublicKey, KeyError> {
    let bytes = hex::decode(s).map_err(|_| KeyError::BadPublicKey)?;
    PublicKey::from_slice(&bytes).map_err(|_| KeyError::BadPublicKey)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pubkey_hex_roundtrip() {
        let keypair = PaymentKeypair::generate();
        let parsed = parse_pubkey_hex(&keypair.public_key_hex()).unwrap();
        assert_eq!(parsed, keypair.public_key());
    }

    #[test]
    fn bad_pubkey_hex_rejected() {
        assert!(parse_pubkey_hex("zz").is_err());
        assert!(parse_pubkey_hex("02aabb").is_err());
    }

    #[test]
    fn zero_secret_rejected() {
        assert!(PaymentKeypair::from_secret_bytes(&[0u8; 32]).is_err());
    }
}
