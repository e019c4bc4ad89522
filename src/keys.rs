//! secp256k1 key pairs and fixed-width key/signature bytes

use crate::error::{ConsensusError, Result};
use crate::hash::hash160;
use crate::types::{Hash, PubKeyHash};
use secp256k1::{ecdsa::Signature, All, Message, Secp256k1, SecretKey};
use std::sync::OnceLock;

/// Compressed public key bytes
pub type PubKeyBytes = [u8; 33];

/// Compact (r, s) signature bytes
pub type SigBytes = [u8; 64];

fn secp() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(SecretKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(secp256k1::PublicKey);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(SecretKey::new(&mut rand::thread_rng()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self(SecretKey::from_slice(bytes)?))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(secp256k1::PublicKey::from_secret_key(secp(), &self.0))
    }

    /// Sign a 32-byte digest
    pub fn sign(&self, digest: &Hash) -> Result<SigBytes> {
        let msg = Message::from_digest_slice(digest)?;
        Ok(secp().sign_ecdsa(&msg, &self.0).serialize_compact())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self(secp256k1::PublicKey::from_slice(bytes)?))
    }

    pub fn to_bytes(&self) -> PubKeyBytes {
        self.0.serialize()
    }

    pub fn hash(&self) -> PubKeyHash {
        hash160(&self.to_bytes())
    }

    /// Verify a compact signature over a 32-byte digest
    pub fn verify(&self, digest: &Hash, sig: &SigBytes) -> bool {
        let Ok(msg) = Message::from_digest_slice(digest) else {
            return false;
        };
        let Ok(sig) = Signature::from_compact(sig) else {
            return false;
        };
        secp().verify_ecdsa(&msg, &sig, &self.0).is_ok()
    }
}

/// Parse key bytes, mapping failures to a key error naming `what`
pub fn parse_public_key(bytes: &PubKeyBytes, what: &str) -> Result<PublicKey> {
    PublicKey::from_bytes(bytes).map_err(|e| ConsensusError::Key(format!("{}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash256;

    #[test]
    fn test_sign_verify() {
        let key = PrivateKey::generate();
        let digest = hash256(b"message");
        let sig = key.sign(&digest).unwrap();
        assert!(key.public_key().verify(&digest, &sig));
    }

    #[test]
    fn test_verify_wrong_digest_fails() {
        let key = PrivateKey::generate();
        let sig = key.sign(&hash256(b"a")).unwrap();
        assert!(!key.public_key().verify(&hash256(b"b"), &sig));
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let digest = hash256(b"a");
        let sig = key.sign(&digest).unwrap();
        assert!(!other.public_key().verify(&digest, &sig));
    }

    #[test]
    fn test_garbage_signature_fails() {
        let key = PrivateKey::generate();
        assert!(!key.public_key().verify(&hash256(b"a"), &[0xffu8; 64]));
    }

    #[test]
    fn test_private_key_bytes_roundtrip() {
        let key = PrivateKey::generate();
        let back = PrivateKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(back.public_key(), key.public_key());
    }

    #[test]
    fn test_public_key_bytes() {
        let key = PrivateKey::generate().public_key();
        let bytes = key.to_bytes();
        assert!(bytes[0] == 0x02 || bytes[0] == 0x03);
        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), key);
        assert!(PublicKey::from_bytes(&[0u8; 33]).is_err());
    }
}
