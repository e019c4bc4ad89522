//! Hash primitives used for identities, addresses and signature digests

use crate::types::{Hash, PubKeyHash};
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Double SHA-256: identity of headers, transactions and merkle nodes
pub fn hash256(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// Single SHA-256
pub fn sha256(data: &[u8]) -> Hash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(data));
    hash
}

/// RIPEMD-160(SHA-256(data)): address of a witness script
pub fn hash160(data: &[u8]) -> PubKeyHash {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Ripemd160::digest(Sha256::digest(data)));
    hash
}

/// Display form of a hash: hex with the byte order reversed, so the
/// most significant byte of the 256-bit value comes first
pub fn to_hex(hash: &Hash) -> String {
    let mut swapped = *hash;
    swapped.reverse();
    hex::encode(swapped)
}

/// Parse the display form produced by [`to_hex`]
pub fn from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Some(hash)
}
