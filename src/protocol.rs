//! Wire payloads produced for the networking layer
//!
//! Pure data, encoded with the same binary scheme as chain records.

use crate::encoding::{write_u32, write_var_bytes, write_varint, Decodable, Encodable, Reader};
use crate::error::{ConsensusError, Result};
use crate::hash::to_hex;
use crate::merkle::{BitSet, MerkleMatch, MerkleTree};
use crate::types::{Block, BlockHeader, Hash, Height};

/// Headers answer: a run of headers plus the sender's tip heights
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersMsg {
    pub headers: Vec<BlockHeader>,
    pub best_height: Height,
    pub last_height: Height,
}

impl Encodable for HeadersMsg {
    fn encode(&self, w: &mut Vec<u8>) {
        write_varint(w, self.headers.len() as u64);
        for header in &self.headers {
            header.encode(w);
        }
        write_u32(w, self.best_height);
        write_u32(w, self.last_height);
    }
}

impl Decodable for HeadersMsg {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let n = r.read_count(BlockHeader::SIZE)?;
        let mut headers = Vec::with_capacity(n);
        for _ in 0..n {
            headers.push(BlockHeader::decode(r)?);
        }
        Ok(Self { headers, best_height: r.read_u32()?, last_height: r.read_u32()? })
    }
}

/// Header paging request
///
/// A zero `start` means the first header when paging forward and the last
/// header when paging backward. `skip` nodes are passed over in the paging
/// direction; a positive `limit` pages forward, a negative one backward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMsg {
    pub start: Hash,
    pub skip: u32,
    pub limit: i32,
}

impl GetHeadersMsg {
    pub fn forward(start: Hash, skip: u32, limit: u32) -> Self {
        Self { start, skip, limit: limit.min(i32::MAX as u32) as i32 }
    }

    pub fn backward(start: Hash, skip: u32, limit: u32) -> Self {
        Self { start, skip, limit: -(limit.min(i32::MAX as u32) as i32) }
    }
}

impl Encodable for GetHeadersMsg {
    fn encode(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.start);
        write_varint(w, self.skip as u64);
        w.extend_from_slice(&self.limit.to_le_bytes());
    }
}

impl Decodable for GetHeadersMsg {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            start: r.read_array::<32>()?,
            skip: r.read_varint_u32()?,
            limit: i32::from_le_bytes(r.read_array::<4>()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMsg {
    pub block: Block,
}

impl Encodable for BlockMsg {
    fn encode(&self, w: &mut Vec<u8>) {
        self.block.encode(w);
    }
}

impl Decodable for BlockMsg {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { block: Block::decode(r)? })
    }
}

/// Inclusion proof of one transaction in a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProofMsg {
    pub txid: Hash,
    /// Leaf count of the block's tree
    pub trans: u32,
    pub hashes: Vec<Hash>,
    /// Flag bits, least significant first
    pub bits: Vec<u8>,
}

impl MerkleProofMsg {
    pub fn new(txid: Hash, tree: &MerkleTree) -> Self {
        Self {
            txid,
            trans: tree.trans() as u32,
            hashes: tree.hashes().to_vec(),
            bits: tree.bits().as_bytes().to_vec(),
        }
    }

    pub fn tree(&self) -> MerkleTree {
        MerkleTree::from_parts(self.trans as usize, self.hashes.clone(), &BitSet::from_bytes(self.bits.clone()))
    }

    /// Check the proof against a block's merkle root and that it proves `txid`
    pub fn verify(&self, root: &Hash) -> Result<MerkleMatch> {
        let found = self.tree().verify(root)?;
        if !found.matches.iter().any(|(_, id)| *id == self.txid) {
            return Err(ConsensusError::BlockValidation(format!(
                "merkle proof does not include {}",
                to_hex(&self.txid)
            )));
        }
        Ok(found)
    }
}

impl Encodable for MerkleProofMsg {
    fn encode(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.txid);
        write_varint(w, self.trans as u64);
        write_varint(w, self.hashes.len() as u64);
        for hash in &self.hashes {
            w.extend_from_slice(hash);
        }
        write_var_bytes(w, &self.bits);
    }
}

impl Decodable for MerkleProofMsg {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let txid = r.read_array::<32>()?;
        let trans = r.read_varint_u32()?;
        let n = r.read_count(32)?;
        let mut hashes = Vec::with_capacity(n);
        for _ in 0..n {
            hashes.push(r.read_array::<32>()?);
        }
        Ok(Self { txid, trans, hashes, bits: r.read_var_bytes()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash256;
    use crate::merkle::merkle_root;

    fn ids(n: u32) -> Vec<Hash> {
        (0..n).map(|i| hash256(&i.to_le_bytes())).collect()
    }

    fn proof(ids: &[Hash], index: usize) -> MerkleProofMsg {
        let mut matched = BitSet::new(ids.len());
        matched.set(index);
        MerkleProofMsg::new(ids[index], &MerkleTree::build(ids, &matched).unwrap())
    }

    #[test]
    fn test_merkle_proof_verifies() {
        let ids = ids(7);
        let root = merkle_root(&ids).unwrap();
        let msg = proof(&ids, 4);
        let found = msg.verify(&root).unwrap();
        assert_eq!(found.matches, vec![(4, ids[4])]);

        let decoded = MerkleProofMsg::from_bytes(&msg.to_bytes()).unwrap();
        decoded.verify(&root).unwrap();
    }

    #[test]
    fn test_merkle_proof_wrong_txid() {
        let ids = ids(5);
        let root = merkle_root(&ids).unwrap();
        let mut msg = proof(&ids, 1);
        msg.txid = ids[2];
        assert!(msg.verify(&root).is_err());
    }

    #[test]
    fn test_merkle_proof_wrong_root() {
        let ids = ids(5);
        let msg = proof(&ids, 0);
        assert!(msg.verify(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_get_headers_direction() {
        let msg = GetHeadersMsg::backward([1u8; 32], 2, 10);
        assert_eq!(msg.limit, -10);
        assert_eq!(GetHeadersMsg::from_bytes(&msg.to_bytes()).unwrap(), msg);
        assert_eq!(GetHeadersMsg::forward([0u8; 32], 0, u32::MAX).limit, i32::MAX);
    }

    #[test]
    fn test_headers_msg_rejects_truncated() {
        let msg = HeadersMsg { headers: vec![], best_height: 3, last_height: 4 };
        let bytes = msg.to_bytes();
        assert_eq!(HeadersMsg::from_bytes(&bytes).unwrap(), msg);
        assert!(HeadersMsg::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
