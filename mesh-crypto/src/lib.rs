//! Cryptographic primitives for the mesh core: identity keypairs, signing,
//! verification, and content hashing.
//!
//! Adapted from the Ed25519 and BLAKE3 layers of a larger post-quantum
//! crypto crate; the post-quantum and symmetric-cipher layers are dropped
//! here since the mesh core only needs sign/verify/hash.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;
use zeroize::Zeroize;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key length: expected {PUBLIC_KEY_LEN}, got {0}")]
    InvalidPublicKeyLength(usize),
    #[error("invalid signature length: expected {SIGNATURE_LEN}, got {0}")]
    InvalidSignatureLength(usize),
    #[error("malformed public key bytes")]
    MalformedPublicKey,
}

/// A content hash: a BLAKE3 digest uniquely identifying a message for
/// deduplication. Collisions are assumed not to occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; HASH_LEN]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        ContentHash(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A 32-byte Ed25519 public key, the root of a node's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidPublicKeyLength(bytes.len()));
        }
        let mut arr = [0u8; PUBLIC_KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(PublicKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::MalformedPublicKey)
    }
}

/// An Ed25519 signature over a canonical message encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "BigArray")] pub [u8; SIGNATURE_LEN]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidSignatureLength(bytes.len()));
        }
        let mut arr = [0u8; SIGNATURE_LEN];
        arr.copy_from_slice(bytes);
        Ok(Signature(arr))
    }

    pub fn zeroed() -> Self {
        Signature([0u8; SIGNATURE_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

/// A node's long-term signing keypair. The secret half is zeroized on drop.
pub struct Keypair {
    signing_key: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh keypair using the OS RNG.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        let public = PublicKey(signing_key.verifying_key().to_bytes());
        Self { signing_key, public }
    }

    /// Reconstruct a keypair from a 32-byte seed (for persisted identities).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let public = PublicKey(signing_key.verifying_key().to_bytes());
        Self { signing_key, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: Ed25519Signature = self.signing_key.sign(message);
        Signature(sig.to_bytes())
    }
}

/// Verify a signature over `message` against `public_key`. Malformed keys or
/// signatures verify as `false` rather than erroring, matching the ingress
/// contract that an invalid signature simply causes a drop.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let Ok(verifying_key) = public_key.verifying_key() else {
        return false;
    };
    let sig = Ed25519Signature::from_bytes(&signature.0);
    verifying_key.verify(message, &sig).is_ok()
}

/// Content hash over arbitrary bytes (sole input: the canonical encoding
/// with signature zero-filled, by convention of the caller).
pub fn content_hash(data: &[u8]) -> ContentHash {
    ContentHash::of(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::generate();
        let msg = b"hello mesh";
        let sig = kp.sign(msg);
        assert!(verify(&kp.public_key(), msg, &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello mesh");
        assert!(!verify(&kp.public_key(), b"hello mesh!", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();
        let sig = kp1.sign(b"hello mesh");
        assert!(!verify(&kp2.public_key(), b"hello mesh", &sig));
    }

    #[test]
    fn content_hash_is_deterministic_and_sensitive() {
        let a = content_hash(b"payload-a");
        let b = content_hash(b"payload-a");
        let c = content_hash(b"payload-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn malformed_signature_length_rejected() {
        assert!(Signature::from_bytes(&[0u8; 10]).is_err());
    }
}
