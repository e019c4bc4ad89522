//! Key-value storage interface and binary key layout
//!
//! Single-byte prefixes partition the keyspace:
//! - `B` + block id: header record (header, height, body/revert chunk refs)
//! - `T` + txid: transaction location (block id, position)
//! - `C` + pkh + txid + varint index: owner coin index
//! - `U` + txid + varint index: unspent output record
//! - `A` + pkh + height (BE) + txid + kind + varint index: account history

use crate::chunk::ChunkRef;
use crate::encoding::{write_u32, write_varint, Decodable, Encodable, Reader};
use crate::error::{ConsensusError, Result};
use crate::types::{Amount, BlockHeader, Hash, Height, OutPoint, PubKeyHash};
use parking_lot::RwLock;
use std::collections::BTreeMap;

pub const HEADER_PREFIX: u8 = b'B';
pub const TX_PREFIX: u8 = b'T';
pub const COIN_PREFIX: u8 = b'C';
pub const UTXO_PREFIX: u8 = b'U';
pub const HISTORY_PREFIX: u8 = b'A';

/// Best-tip pointer
pub const BEST_KEY: &[u8] = b"BestBlockKey";
/// Last linked header pointer
pub const LAST_HEADER_KEY: &[u8] = b"LastHeaderKey";

/// One write in an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOperation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Put { key: key.into(), value: value.into() }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            BatchOperation::Put { key, .. } | BatchOperation::Delete { key } => key,
        }
    }
}

impl Encodable for BatchOperation {
    fn encode(&self, w: &mut Vec<u8>) {
        match self {
            BatchOperation::Put { key, value } => {
                w.push(0);
                crate::encoding::write_var_bytes(w, key);
                crate::encoding::write_var_bytes(w, value);
            }
            BatchOperation::Delete { key } => {
                w.push(1);
                crate::encoding::write_var_bytes(w, key);
            }
        }
    }
}

impl Decodable for BatchOperation {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        match r.read_u8()? {
            0 => Ok(BatchOperation::Put { key: r.read_var_bytes()?, value: r.read_var_bytes()? }),
            1 => Ok(BatchOperation::Delete { key: r.read_var_bytes()? }),
            tag => Err(ConsensusError::Serialization(format!("unknown batch operation tag {}", tag))),
        }
    }
}

/// Ordered key-value store with atomic batches
///
/// Implementations synchronize internally; callers serialize writers.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// All pairs whose key starts with `prefix`, in key order
    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation or none
    fn write_batch(&self, operations: Vec<BatchOperation>) -> Result<()>;
}

/// In-memory ordered store
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of the full contents
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.read().clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, operations: Vec<BatchOperation>) -> Result<()> {
        // One write guard for the whole batch: readers see all or nothing
        let mut data = self.data.write();
        for op in operations {
            match op {
                BatchOperation::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// KEY LAYOUT
// ============================================================================

pub fn header_key(id: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(HEADER_PREFIX);
    key.extend_from_slice(id);
    key
}

pub fn tx_key(txid: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(TX_PREFIX);
    key.extend_from_slice(txid);
    key
}

pub fn coin_prefix(pkh: &PubKeyHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(COIN_PREFIX);
    key.extend_from_slice(pkh);
    key
}

pub fn coin_key(pkh: &PubKeyHash, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = coin_prefix(pkh);
    outpoint.encode(&mut key);
    key
}

/// Split a coin key back into owner and outpoint
pub fn parse_coin_key(key: &[u8]) -> Result<(PubKeyHash, OutPoint)> {
    let mut r = Reader::new(key);
    if r.read_u8()? != COIN_PREFIX {
        return Err(ConsensusError::Storage("not a coin key".to_string()));
    }
    let pkh = r.read_array::<20>()?;
    let outpoint = OutPoint::decode(&mut r)?;
    r.finish()?;
    Ok((pkh, outpoint))
}

pub fn utxo_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = vec![UTXO_PREFIX];
    outpoint.encode(&mut key);
    key
}

pub fn history_prefix(pkh: &PubKeyHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(HISTORY_PREFIX);
    key.extend_from_slice(pkh);
    key
}

/// Big-endian height keeps history in chain order under prefix scans
pub fn history_key(pkh: &PubKeyHash, entry: &HistoryEntry) -> Vec<u8> {
    let mut key = history_prefix(pkh);
    key.extend_from_slice(&entry.height.to_be_bytes());
    key.extend_from_slice(&entry.txid);
    key.push(entry.kind as u8);
    write_varint(&mut key, entry.index as u64);
    key
}

// ============================================================================
// RECORDS
// ============================================================================

/// Persisted chain node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub header: BlockHeader,
    pub height: Height,
    pub blk: Option<ChunkRef>,
    pub rev: Option<ChunkRef>,
}

fn encode_chunk_ref(w: &mut Vec<u8>, chunk: &Option<ChunkRef>) {
    match chunk {
        Some(c) => {
            w.push(1);
            c.encode(w);
        }
        None => w.push(0),
    }
}

fn decode_chunk_ref(r: &mut Reader<'_>) -> Result<Option<ChunkRef>> {
    match r.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(ChunkRef::decode(r)?)),
        tag => Err(ConsensusError::Serialization(format!("invalid chunk ref tag {}", tag))),
    }
}

impl Encodable for HeaderRecord {
    fn encode(&self, w: &mut Vec<u8>) {
        self.header.encode(w);
        write_u32(w, self.height);
        encode_chunk_ref(w, &self.blk);
        encode_chunk_ref(w, &self.rev);
    }
}

impl Decodable for HeaderRecord {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            header: BlockHeader::decode(r)?,
            height: r.read_u32()?,
            blk: decode_chunk_ref(r)?,
            rev: decode_chunk_ref(r)?,
        })
    }
}

/// Where a confirmed transaction lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    pub block_id: Hash,
    pub index: u32,
}

impl Encodable for TxLocation {
    fn encode(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.block_id);
        write_varint(w, self.index as u64);
    }
}

impl Decodable for TxLocation {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { block_id: r.read_array::<32>()?, index: r.read_varint_u32()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HistoryKind {
    /// Output credited to the account
    Credit = 0,
    /// Account coin spent by an input
    Debit = 1,
}

/// One account history line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub height: Height,
    pub txid: Hash,
    pub kind: HistoryKind,
    /// Output index for credits, input index for debits
    pub index: u32,
    pub value: Amount,
}

impl HistoryEntry {
    pub fn encode_value(&self) -> Vec<u8> {
        let mut w = Vec::new();
        write_varint(&mut w, self.value.max(0) as u64);
        w
    }

    pub fn from_kv(key: &[u8], value: &[u8]) -> Result<Self> {
        let mut r = Reader::new(key);
        if r.read_u8()? != HISTORY_PREFIX {
            return Err(ConsensusError::Storage("not a history key".to_string()));
        }
        r.read_array::<20>()?;
        let height = u32::from_be_bytes(r.read_array::<4>()?);
        let txid = r.read_array::<32>()?;
        let kind = match r.read_u8()? {
            0 => HistoryKind::Credit,
            1 => HistoryKind::Debit,
            other => return Err(ConsensusError::Serialization(format!("unknown history kind {}", other))),
        };
        let index = r.read_varint_u32()?;
        r.finish()?;
        let mut v = Reader::new(value);
        let amount = v.read_varint()? as Amount;
        v.finish()?;
        Ok(Self { height, txid, kind, index, value: amount })
    }
}
