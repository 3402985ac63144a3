//! Swarm identity primitives.
//!
//! Every node owns an Ed25519 key pair.  The 20-byte [`Address`] derived from
//! the public key is the node's identity on the wire: gossip envelopes are
//! signed with the private key, and verifying an envelope recovers the
//! sender's address.  Because Ed25519 signatures do not embed the signer, the
//! wire [`Signature`] carries the 32-byte public key ahead of the 64-byte
//! detached signature; verification checks the signature against the embedded
//! key and derives the address from it.
//!
//! Secret key material is zeroized on drop.

#![forbid(unsafe_code)]

use std::fmt;

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of a derived address in bytes.
pub const ADDRESS_LEN: usize = 20;
/// Length of a wire signature: public key followed by the detached signature.
pub const SIGNATURE_LEN: usize = PUBLIC_KEY_LEN + 64;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("byte slice has the wrong length")]
    BadLength,
    #[error("malformed public key")]
    InvalidKey,
    #[error("signature verification failed")]
    InvalidSignature,
}

/// Raw Ed25519 public key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Derive the node address for this key.
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// 20-byte node address: the truncated BLAKE3 digest of the public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(#[serde(with = "serde_bytes")] pub [u8; ADDRESS_LEN]);

impl Address {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = blake3::hash(key.as_bytes());
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ADDRESS_LEN]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Wire signature: the signer's public key plus the detached signature over
/// the message.  Verification recovers the signer's address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    public_key: PublicKey,
    signature: [u8; 64],
}

impl Signature {
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out[..PUBLIC_KEY_LEN].copy_from_slice(&self.public_key.0);
        out[PUBLIC_KEY_LEN..].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(CryptoError::BadLength);
        }
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&bytes[..PUBLIC_KEY_LEN]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[PUBLIC_KEY_LEN..]);
        Ok(Self {
            public_key: PublicKey(public_key),
            signature,
        })
    }

    /// Verify the signature over `message` and return the signer's address.
    pub fn verify(&self, message: &[u8]) -> Result<Address, CryptoError> {
        let key = VerifyingKey::from_bytes(&self.public_key.0)
            .map_err(|_| CryptoError::InvalidKey)?;
        let signature = DalekSignature::from_bytes(&self.signature);
        key.verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(self.public_key.address())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(by {})", self.public_key.address())
    }
}

/// An Ed25519 signing key pair with its derived address.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh key pair from OS randomness.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Deterministic key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let seed = Zeroizing::new(*seed);
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn address(&self) -> Address {
        self.public.address()
    }

    /// Produce a wire signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            public_key: self.public,
            signature: self.signing.sign(message).to_bytes(),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_keypairs_are_deterministic() {
        let a = Keypair::from_seed(&[7u8; 32]);
        let b = Keypair::from_seed(&[7u8; 32]);
        assert_eq!(a.address(), b.address());
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn sign_recovers_signer_address() {
        let keys = Keypair::generate();
        let signature = keys.sign(b"delta");
        let recovered = signature.verify(b"delta").expect("verify");
        assert_eq!(recovered, keys.address());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let keys = Keypair::generate();
        let signature = keys.sign(b"delta");
        assert!(matches!(
            signature.verify(b"delt4"),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn substituted_key_fails_verification() {
        let alice = Keypair::generate();
        let mallory = Keypair::generate();
        let mut bytes = alice.sign(b"hello").to_bytes();
        bytes[..PUBLIC_KEY_LEN].copy_from_slice(mallory.public_key().as_bytes());
        let forged = Signature::from_bytes(&bytes).expect("length");
        assert!(forged.verify(b"hello").is_err());
    }

    #[test]
    fn signature_round_trips_through_bytes() {
        let keys = Keypair::generate();
        let signature = keys.sign(b"payload");
        let restored = Signature::from_bytes(&signature.to_bytes()).expect("length");
        assert_eq!(restored, signature);
        assert_eq!(restored.verify(b"payload").unwrap(), keys.address());
    }

    #[test]
    fn short_signature_slice_is_rejected() {
        assert!(matches!(
            Signature::from_bytes(&[0u8; 40]),
            Err(CryptoError::BadLength)
        ));
    }
}
