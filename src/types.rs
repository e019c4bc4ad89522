//! Core ledger types and their binary encoding

use crate::constants::{INVALID_HEIGHT, MAX_MONEY};
use crate::encoding::{write_u32, write_var_bytes, write_varint, Decodable, Encodable, Reader};
use crate::error::{ConsensusError, Result};
use crate::hash::hash256;
use crate::script::Script;
use serde::{Deserialize, Serialize};

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Owner address: hash160 of a witness script's key set
pub type PubKeyHash = [u8; 20];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Amount in base units
pub type Amount = i64;

/// Block height
pub type Height = u32;

/// Reference to a prior transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// Coinbase sentinel: zero hash, index 0
    pub fn null() -> Self {
        Self { hash: [0u8; 32], index: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Amount,
    pub script_pubkey: Script,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

/// Block header: 80 bytes encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Encoded header size
    pub const SIZE: usize = 80;

    /// Header identity: hash256 of the encoded header
    pub fn id(&self) -> Hash {
        hash256(&self.to_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Chain tip for which ledger state has been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestValue {
    pub id: Hash,
    pub height: Height,
}

impl BestValue {
    pub fn empty() -> Self {
        Self { id: [0u8; 32], height: INVALID_HEIGHT }
    }

    pub fn is_valid(&self) -> bool {
        self.height != INVALID_HEIGHT
    }

    /// Height of the block that would extend this tip
    pub fn next(&self) -> Height {
        if self.is_valid() {
            self.height + 1
        } else {
            0
        }
    }
}

impl Default for BestValue {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// ENCODING
// ============================================================================

impl Encodable for OutPoint {
    fn encode(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.hash);
        write_varint(w, self.index as u64);
    }
}

impl Decodable for OutPoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { hash: r.read_array::<32>()?, index: r.read_varint_u32()? })
    }
}

impl Encodable for TransactionInput {
    fn encode(&self, w: &mut Vec<u8>) {
        self.prevout.encode(w);
        write_var_bytes(w, self.script_sig.as_bytes());
        write_u32(w, self.sequence);
    }
}

impl Decodable for TransactionInput {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            prevout: OutPoint::decode(r)?,
            script_sig: Script::from(r.read_var_bytes()?),
            sequence: r.read_u32()?,
        })
    }
}

impl Encodable for TransactionOutput {
    fn encode(&self, w: &mut Vec<u8>) {
        write_varint(w, self.value.max(0) as u64);
        write_var_bytes(w, self.script_pubkey.as_bytes());
    }
}

impl Decodable for TransactionOutput {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let value = r.read_varint()?;
        if value > MAX_MONEY as u64 {
            return Err(ConsensusError::AmountRange(format!("output value {} exceeds MAX_MONEY", value)));
        }
        Ok(Self { value: value as Amount, script_pubkey: Script::from(r.read_var_bytes()?) })
    }
}

impl Encodable for Transaction {
    fn encode(&self, w: &mut Vec<u8>) {
        write_u32(w, self.version);
        write_varint(w, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(w);
        }
        write_varint(w, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(w);
        }
        write_u32(w, self.lock_time);
    }
}

impl Decodable for Transaction {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.read_u32()?;
        // 32 hash + index + script len + 4 sequence
        let n_in = r.read_count(38)?;
        let mut inputs = Vec::with_capacity(n_in);
        for _ in 0..n_in {
            inputs.push(TransactionInput::decode(r)?);
        }
        let n_out = r.read_count(2)?;
        let mut outputs = Vec::with_capacity(n_out);
        for _ in 0..n_out {
            outputs.push(TransactionOutput::decode(r)?);
        }
        let lock_time = r.read_u32()?;
        Ok(Self { version, inputs, outputs, lock_time })
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, w: &mut Vec<u8>) {
        write_u32(w, self.version);
        w.extend_from_slice(&self.prev_block_hash);
        w.extend_from_slice(&self.merkle_root);
        write_u32(w, self.timestamp);
        write_u32(w, self.bits);
        write_u32(w, self.nonce);
    }

    fn encoded_size(&self) -> usize {
        Self::SIZE
    }
}

impl Decodable for BlockHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            version: r.read_u32()?,
            prev_block_hash: r.read_array::<32>()?,
            merkle_root: r.read_array::<32>()?,
            timestamp: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }
}

impl Encodable for Block {
    fn encode(&self, w: &mut Vec<u8>) {
        self.header.encode(w);
        write_varint(w, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(w);
        }
    }
}

impl Decodable for Block {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let header = BlockHeader::decode(r)?;
        let n = r.read_count(10)?;
        let mut transactions = Vec::with_capacity(n);
        for _ in 0..n {
            transactions.push(Transaction::decode(r)?);
        }
        Ok(Self { header, transactions })
    }
}

impl Encodable for BestValue {
    fn encode(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.id);
        write_u32(w, self.height);
    }
}

impl Decodable for BestValue {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { id: r.read_array::<32>()?, height: r.read_u32()? })
    }
}
