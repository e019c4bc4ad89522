//! Merkle tree over transaction ids with partial-tree (inclusion proof) support
//!
//! A partial tree is a depth-first traversal: one flag bit per visited node
//! (set when the subtree contains an interesting leaf), and one hash for
//! every node where traversal stops (a leaf, or a subtree with no match).

use crate::error::{ConsensusError, Result};
use crate::hash::hash256;
use crate::types::Hash;

/// Bit vector, least significant bit of each byte first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitSet {
    bytes: Vec<u8>,
}

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self { bytes: vec![0u8; (len + 7) / 8] }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_bools(bits: &[bool]) -> Self {
        let mut set = Self::new(bits.len());
        for (i, &b) in bits.iter().enumerate() {
            if b {
                set.set(i);
            }
        }
        set
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Capacity in bits
    pub fn len(&self) -> usize {
        self.bytes.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Setting a bit past the end grows the set
    pub fn set(&mut self, i: usize) {
        if i >= self.len() {
            self.bytes.resize(i / 8 + 1, 0);
        }
        self.bytes[i >> 3] |= 1 << (i & 7);
    }

    /// Bits past the end read as unset
    pub fn test(&self, i: usize) -> bool {
        self.bytes.get(i >> 3).map_or(false, |b| b & (1 << (i & 7)) != 0)
    }

    pub fn to_bools(&self) -> Vec<bool> {
        (0..self.len()).map(|i| self.test(i)).collect()
    }
}

/// Leaves found while extracting a partial tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleMatch {
    pub root: Hash,
    /// (leaf position, leaf hash) for every interesting leaf
    pub matches: Vec<(usize, Hash)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    trans: usize,
    hashes: Vec<Hash>,
    bits: Vec<bool>,
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    hash256(&data)
}

fn bad_tree(reason: &str) -> ConsensusError {
    ConsensusError::BlockValidation(format!("bad merkle tree: {}", reason))
}

/// Root over all ids; odd levels duplicate their last node
pub fn merkle_root(ids: &[Hash]) -> Result<Hash> {
    if ids.is_empty() {
        return Err(bad_tree("no transactions"));
    }
    let mut level = ids.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    Ok(level[0])
}

impl MerkleTree {
    /// Build a partial tree over `ids`, keeping the paths to leaves where `matched` is set
    pub fn build(ids: &[Hash], matched: &BitSet) -> Result<Self> {
        if ids.is_empty() {
            return Err(bad_tree("no transactions"));
        }
        let mut tree = Self { trans: ids.len(), hashes: Vec::new(), bits: Vec::new() };
        let height = tree.height();
        tree.build_node(height, 0, ids, matched);
        Ok(tree)
    }

    /// Reassemble a tree received from a peer
    pub fn from_parts(trans: usize, hashes: Vec<Hash>, bits: &BitSet) -> Self {
        Self { trans, hashes, bits: bits.to_bools() }
    }

    pub fn trans(&self) -> usize {
        self.trans
    }

    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    pub fn bits(&self) -> BitSet {
        BitSet::from_bools(&self.bits)
    }

    fn width(&self, height: u32) -> usize {
        (self.trans + (1 << height) - 1) >> height
    }

    fn height(&self) -> u32 {
        let mut h = 0;
        while self.width(h) > 1 {
            h += 1;
        }
        h
    }

    fn calc_hash(&self, height: u32, pos: usize, ids: &[Hash]) -> Hash {
        if height == 0 {
            return ids[pos];
        }
        let left = self.calc_hash(height - 1, pos * 2, ids);
        let right = if pos * 2 + 1 < self.width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1, ids)
        } else {
            left
        };
        hash_pair(&left, &right)
    }

    fn build_node(&mut self, height: u32, pos: usize, ids: &[Hash], matched: &BitSet) {
        let start = pos << height;
        let end = ((pos + 1) << height).min(self.trans);
        let is_match = (start..end).any(|p| matched.test(p));
        self.bits.push(is_match);
        if height == 0 || !is_match {
            let hash = self.calc_hash(height, pos, ids);
            self.hashes.push(hash);
        } else {
            self.build_node(height - 1, pos * 2, ids, matched);
            if pos * 2 + 1 < self.width(height - 1) {
                self.build_node(height - 1, pos * 2 + 1, ids, matched);
            }
        }
    }

    fn extract_node(
        &self,
        height: u32,
        pos: usize,
        nbits: &mut usize,
        nhash: &mut usize,
        matches: &mut Vec<(usize, Hash)>,
    ) -> Result<Hash> {
        let is_match = *self.bits.get(*nbits).ok_or_else(|| bad_tree("ran out of flag bits"))?;
        *nbits += 1;
        if height == 0 || !is_match {
            let hash = *self.hashes.get(*nhash).ok_or_else(|| bad_tree("ran out of hashes"))?;
            *nhash += 1;
            if height == 0 && is_match {
                matches.push((pos, hash));
            }
            return Ok(hash);
        }
        let left = self.extract_node(height - 1, pos * 2, nbits, nhash, matches)?;
        let right = if pos * 2 + 1 < self.width(height - 1) {
            let right = self.extract_node(height - 1, pos * 2 + 1, nbits, nhash, matches)?;
            // Identical siblings would allow a duplicated-leaf forgery
            if left == right {
                return Err(bad_tree("identical sibling hashes"));
            }
            right
        } else {
            left
        };
        Ok(hash_pair(&left, &right))
    }

    /// Recompute the root and collect the interesting leaves
    ///
    /// Fails when the flag bits or hash list are inconsistent with the tree
    /// shape implied by the leaf count.
    pub fn extract(&self) -> Result<MerkleMatch> {
        if self.trans == 0 {
            return Err(bad_tree("no transactions"));
        }
        if self.hashes.len() > self.trans {
            return Err(bad_tree("more hashes than transactions"));
        }
        if self.bits.len() < self.hashes.len() {
            return Err(bad_tree("fewer flag bits than hashes"));
        }
        let mut nbits = 0;
        let mut nhash = 0;
        let mut matches = Vec::new();
        let root = self.extract_node(self.height(), 0, &mut nbits, &mut nhash, &mut matches)?;
        // Unused bits may only be byte padding
        if (nbits + 7) / 8 != (self.bits.len() + 7) / 8 {
            return Err(bad_tree("unused flag bits"));
        }
        if nhash != self.hashes.len() {
            return Err(bad_tree("unused hashes"));
        }
        Ok(MerkleMatch { root, matches })
    }

    pub fn extract_root(&self) -> Result<Hash> {
        Ok(self.extract()?.root)
    }

    /// Extract and require the root to equal `root`
    pub fn verify(&self, root: &Hash) -> Result<MerkleMatch> {
        let found = self.extract()?;
        if &found.root != root {
            return Err(bad_tree("root mismatch"));
        }
        Ok(found)
    }
}
