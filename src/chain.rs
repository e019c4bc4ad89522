//! Chain index: the header arena, best tip and ledger state transitions
//!
//! Nodes live in a vector indexed by height; the id map holds heights only.
//! Headers may run ahead of the best tip (header-only nodes); a body is
//! attached by [`ChainIndex::update_block`], which commits the block's ledger
//! changes together with the record needed to revert them.
//!
//! Lock order is chain state, then mempool.

use crate::block::{check_block_structure, check_coinbase_value, new_coinbase};
use crate::cache::DecodeCache;
use crate::chunk::{ChunkRef, ChunkStore, FileChunkStore, MemoryChunkStore};
use crate::coin::{Coin, CoinView, Coins, CoinsState, Utxo};
use crate::config::ChainConfig;
use crate::constants::*;
use crate::encoding::{Decodable, Encodable};
use crate::error::{ConsensusError, Result};
use crate::hash::to_hex;
use crate::listener::{ChainEvent, ChainListener};
use crate::mempool::Mempool;
use crate::merkle::{BitSet, MerkleTree};
use crate::pow::{calculate_work_required, check_proof_of_work, coinbase_reward, is_retarget_height, min_pow_bits};
use crate::protocol::{GetHeadersMsg, HeadersMsg, MerkleProofMsg};
use crate::storage::*;
use crate::transaction::{check_transaction, SpendContext};
use crate::types::*;
use crate::uint256::U256;
use crate::undo::{Changeset, LedgerBatch};
use parking_lot::{RwLock, RwLockReadGuard};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Space kept free for the coinbase when filling a block from the pool
const COINBASE_RESERVE: usize = 1000;

/// One linked header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode {
    pub header: BlockHeader,
    pub id: Hash,
    pub height: Height,
    /// Stored block body, once attached
    pub blk: Option<ChunkRef>,
    /// Stored revert record, once attached
    pub rev: Option<ChunkRef>,
}

impl ChainNode {
    pub fn has_body(&self) -> bool {
        self.blk.is_some()
    }

    fn record(&self) -> HeaderRecord {
        HeaderRecord { header: self.header.clone(), height: self.height, blk: self.blk, rev: self.rev }
    }
}

/// Storage collaborators of a chain index
#[derive(Clone)]
pub struct ChainStorage {
    pub kv: Arc<dyn KeyValueStore>,
    pub blocks: Arc<dyn ChunkStore>,
    pub reverts: Arc<dyn ChunkStore>,
}

impl ChainStorage {
    pub fn in_memory(chunk_file_size: u64) -> Self {
        Self {
            kv: Arc::new(MemoryStore::new()),
            blocks: Arc::new(MemoryChunkStore::new(chunk_file_size)),
            reverts: Arc::new(MemoryChunkStore::new(chunk_file_size)),
        }
    }

    /// Block and revert chunk files under `dir`, records in `kv`
    pub fn with_chunk_dir(kv: Arc<dyn KeyValueStore>, dir: impl AsRef<Path>, chunk_file_size: u64) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            kv,
            blocks: Arc::new(FileChunkStore::open(dir, "blk", chunk_file_size)?),
            reverts: Arc::new(FileChunkStore::open(dir, "rev", chunk_file_size)?),
        })
    }
}

#[derive(Default)]
struct ChainState {
    nodes: Vec<ChainNode>,
    ids: std::collections::HashMap<Hash, Height>,
    best: BestValue,
}

/// Median of the timestamps of the (up to) 11 nodes before `end`
fn median_time_of(nodes: &[ChainNode], end: usize) -> u32 {
    let end = end.min(nodes.len());
    let start = end.saturating_sub(MEDIAN_TIME_SPAN);
    let mut times: Vec<u32> = nodes[start..end].iter().map(|n| n.header.timestamp).collect();
    if times.is_empty() {
        return 0;
    }
    times.sort_unstable();
    times[times.len() / 2]
}

fn now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs().min(u32::MAX as u64) as u32)
}

/// Coins as seen through a pending block's ledger batch
struct LedgerView<'a, 'b> {
    batch: &'a LedgerBatch<'b>,
    nodes: &'a [ChainNode],
}

impl CoinView for LedgerView<'_, '_> {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        match self.batch.get(&utxo_key(outpoint))? {
            Some(bytes) => Ok(Some(Utxo::decode_at(*outpoint, &bytes)?)),
            None => Ok(None),
        }
    }

    fn block_time(&self, height: Height) -> Option<u32> {
        self.nodes.get(height as usize).map(|n| n.header.timestamp)
    }
}

/// Confirmed coins overlaid with outputs of pooled transactions
struct PoolView<'a> {
    store: &'a dyn KeyValueStore,
    pool: &'a Mempool,
    nodes: &'a [ChainNode],
}

impl CoinView for PoolView<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        match self.store.get(&utxo_key(outpoint))? {
            Some(bytes) => Ok(Some(Utxo::decode_at(*outpoint, &bytes)?)),
            None => Ok(self.pool.output(outpoint)),
        }
    }

    fn block_time(&self, height: Height) -> Option<u32> {
        self.nodes.get(height as usize).map(|n| n.header.timestamp)
    }
}

/// ApplyTransaction: 𝒯𝒳 × 𝒰𝒮 → 𝒰𝒮
///
/// 1. For each input of a non-coinbase tx: delete its unspent record and
///    owner index entry, record a debit in the owner's history
/// 2. For each output: create the unspent record and owner index entry,
///    record a credit in the owner's history
/// 3. Record the transaction location
///
/// Everything is resolved before the first write, so a failure leaves the
/// batch untouched apart from storage errors.
fn apply_transaction(batch: &mut LedgerBatch<'_>, tx: &Transaction, location: TxLocation, height: Height) -> Result<()> {
    let txid = tx.id();
    let coinbase = tx.is_coinbase();

    let mut spent = Vec::new();
    if !coinbase {
        for input in &tx.inputs {
            let bytes = batch.get(&utxo_key(&input.prevout))?.ok_or_else(|| {
                ConsensusError::CoinUnavailable(format!(
                    "{}:{} missing or spent",
                    to_hex(&input.prevout.hash),
                    input.prevout.index
                ))
            })?;
            spent.push(Utxo::decode_at(input.prevout, &bytes)?);
        }
    }
    let created = tx
        .outputs
        .iter()
        .enumerate()
        .map(|(index, output)| Utxo::new(txid, index as u32, output, coinbase, height, false))
        .collect::<Result<Vec<_>>>()?;

    for (index, utxo) in spent.iter().enumerate() {
        let outpoint = utxo.coin.outpoint();
        batch.delete(utxo_key(&outpoint))?;
        batch.delete(coin_key(&utxo.coin.pkh, &outpoint))?;
        let entry =
            HistoryEntry { height, txid, kind: HistoryKind::Debit, index: index as u32, value: utxo.coin.value };
        batch.put(history_key(&utxo.coin.pkh, &entry), entry.encode_value())?;
    }
    for utxo in &created {
        let outpoint = utxo.coin.outpoint();
        batch.put(utxo_key(&outpoint), utxo.to_bytes())?;
        let mut value = Vec::new();
        utxo.coin.encode_value(&mut value);
        batch.put(coin_key(&utxo.coin.pkh, &outpoint), value)?;
        let entry = HistoryEntry {
            height,
            txid,
            kind: HistoryKind::Credit,
            index: utxo.coin.index,
            value: utxo.coin.value,
        };
        batch.put(history_key(&utxo.coin.pkh, &entry), entry.encode_value())?;
    }
    batch.put(tx_key(&txid), location.to_bytes())?;
    Ok(())
}

/// The chain of linked headers and the ledger state of its best tip
pub struct ChainIndex {
    state: RwLock<ChainState>,
    store: Arc<dyn KeyValueStore>,
    blocks: Arc<dyn ChunkStore>,
    reverts: Arc<dyn ChunkStore>,
    cache: DecodeCache,
    pool: Arc<Mempool>,
    listener: Arc<dyn ChainListener>,
    config: ChainConfig,
    limit: U256,
}

impl ChainIndex {
    /// Open an index over `storage`, reloading any chain already stored
    ///
    /// The arena is rebuilt by walking back from the last-header pointer to
    /// genesis; the best pointer must name a node on that chain.
    pub fn open(
        config: ChainConfig,
        storage: ChainStorage,
        pool: Arc<Mempool>,
        listener: Arc<dyn ChainListener>,
    ) -> Result<Self> {
        config.validate()?;
        let limit = config.pow_limit()?;
        let state = Self::load_state(storage.kv.as_ref())?;
        info!(headers = state.nodes.len(), best = state.best.height, "chain index opened");
        Ok(Self {
            state: RwLock::new(state),
            store: storage.kv,
            blocks: storage.blocks,
            reverts: storage.reverts,
            cache: DecodeCache::new(config.cache_bytes),
            pool,
            listener,
            config,
            limit,
        })
    }

    fn load_state(store: &dyn KeyValueStore) -> Result<ChainState> {
        let mut state = ChainState::default();
        if let Some(bytes) = store.get(LAST_HEADER_KEY)? {
            let mut id: Hash = bytes
                .as_slice()
                .try_into()
                .map_err(|_| ConsensusError::Storage("malformed last header pointer".to_string()))?;
            loop {
                let bytes = store
                    .get(&header_key(&id))?
                    .ok_or_else(|| ConsensusError::Storage(format!("missing header record {}", to_hex(&id))))?;
                let record = HeaderRecord::from_bytes(&bytes)?;
                if record.header.id() != id {
                    return Err(ConsensusError::Storage(format!("header record {} has wrong id", to_hex(&id))));
                }
                if state.nodes.last().map_or(false, |after| Some(after.height) != record.height.checked_add(1)) {
                    return Err(ConsensusError::Storage(format!("header {} height out of sequence", to_hex(&id))));
                }
                let prev = record.header.prev_block_hash;
                let height = record.height;
                state.nodes.push(ChainNode { header: record.header, id, height, blk: record.blk, rev: record.rev });
                if height == 0 {
                    break;
                }
                id = prev;
            }
            state.nodes.reverse();
            for node in &state.nodes {
                state.ids.insert(node.id, node.height);
            }
        }
        if let Some(bytes) = store.get(BEST_KEY)? {
            let best = BestValue::from_bytes(&bytes)?;
            let consistent = state
                .nodes
                .get(best.height as usize)
                .map_or(false, |node| node.id == best.id && node.has_body());
            if !consistent {
                return Err(ConsensusError::Storage(format!(
                    "best block {} at height {} not on the header chain",
                    to_hex(&best.id),
                    best.height
                )));
            }
            state.best = best;
        }
        Ok(state)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<Mempool> {
        &self.pool
    }

    /// Network target floor
    pub fn pow_limit(&self) -> &U256 {
        &self.limit
    }

    pub fn best(&self) -> BestValue {
        self.state.read().best
    }

    /// Number of linked headers
    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<ChainNode> {
        self.state.read().nodes.first().cloned()
    }

    /// Last linked header, possibly ahead of the best tip
    pub fn last(&self) -> Option<ChainNode> {
        self.state.read().nodes.last().cloned()
    }

    pub fn get_by_height(&self, height: Height) -> Option<ChainNode> {
        self.state.read().nodes.get(height as usize).cloned()
    }

    pub fn get_by_id(&self, id: &Hash) -> Option<ChainNode> {
        let state = self.state.read();
        let height = *state.ids.get(id)?;
        state.nodes.get(height as usize).cloned()
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.state.read().ids.contains_key(id)
    }

    /// Header whose body should be fetched next: the successor of the best tip
    pub fn next_to_sync(&self) -> Option<ChainNode> {
        let state = self.state.read();
        state.nodes.get(state.best.next() as usize).cloned()
    }

    /// Iterate from `height` toward the tip (or toward genesis when backward)
    ///
    /// The iterator holds the read lock until dropped.
    pub fn iter_from(&self, height: Height, forward: bool) -> ChainIter<'_> {
        ChainIter { state: self.state.read(), next: Some(height as usize), forward }
    }

    /// Median time past of the last header
    pub fn median_time(&self) -> u32 {
        let state = self.state.read();
        median_time_of(&state.nodes, state.nodes.len())
    }

    /// Bits required for the next header
    pub fn next_bits(&self) -> Result<u32> {
        let state = self.state.read();
        self.expected_bits(&state.nodes, state.nodes.len() as Height)
    }

    fn expected_bits(&self, nodes: &[ChainNode], height: Height) -> Result<u32> {
        let Some(prev) = height.checked_sub(1).and_then(|h| nodes.get(h as usize)) else {
            return min_pow_bits(&self.config);
        };
        if !is_retarget_height(height, &self.config) {
            return Ok(prev.header.bits);
        }
        let reference = nodes.get((height - self.config.pow_span) as usize).ok_or_else(|| {
            ConsensusError::ChainLink(format!("no retarget reference for height {}", height))
        })?;
        calculate_work_required(prev.header.timestamp, reference.header.timestamp, prev.header.bits, &self.config)
    }

    // ============================================================================
    // STATE TRANSITIONS
    // ============================================================================

    /// LinkHeader: ℋ × 𝒞 → 𝒞
    ///
    /// 1. Genesis: prev id zero (and equal to the configured genesis, if any)
    /// 2. Otherwise: prev id equals the last header's id, time strictly increases
    /// 3. bits equal the retarget rule for the new height
    /// 4. id satisfies the target
    /// 5. Persist the header record and the last-header pointer, append a header-only node
    pub fn link_header(&self, header: BlockHeader) -> Result<Height> {
        let mut state = self.state.write();
        self.link_header_locked(&mut state, header)
    }

    fn link_header_locked(&self, state: &mut ChainState, header: BlockHeader) -> Result<Height> {
        let id = header.id();
        if state.ids.contains_key(&id) {
            return Err(ConsensusError::ChainLink(format!("header {} already linked", to_hex(&id))));
        }
        let height = state.nodes.len() as Height;
        match state.nodes.last() {
            None => {
                if header.prev_block_hash != [0u8; 32] {
                    return Err(ConsensusError::ChainLink("genesis header has a previous id".to_string()));
                }
                if let Some(genesis) = self.config.genesis_id()? {
                    if genesis != id {
                        return Err(ConsensusError::ChainLink(format!(
                            "genesis {} does not match configured {}",
                            to_hex(&id),
                            to_hex(&genesis)
                        )));
                    }
                }
            }
            Some(tip) => {
                if header.prev_block_hash != tip.id {
                    return Err(ConsensusError::ChainLink(format!(
                        "header {} does not extend tip {}",
                        to_hex(&id),
                        to_hex(&tip.id)
                    )));
                }
                if header.timestamp <= tip.header.timestamp {
                    return Err(ConsensusError::ChainLink(format!(
                        "header time {} not after previous {}",
                        header.timestamp, tip.header.timestamp
                    )));
                }
            }
        }
        let bits = self.expected_bits(&state.nodes, height)?;
        if header.bits != bits {
            return Err(ConsensusError::ChainLink(format!(
                "header bits {:#010x}, expected {:#010x}",
                header.bits, bits
            )));
        }
        check_proof_of_work(&id, header.bits, &self.limit).map_err(|e| ConsensusError::ChainLink(e.to_string()))?;

        let node = ChainNode { header, id, height, blk: None, rev: None };
        self.store.write_batch(vec![
            BatchOperation::put(header_key(&id), node.record().to_bytes()),
            BatchOperation::put(LAST_HEADER_KEY, id.to_vec()),
        ])?;
        state.ids.insert(id, height);
        state.nodes.push(node);
        debug!(id = %to_hex(&id), height, "linked header");
        self.listener.on_event(&ChainEvent::HeaderLinked { id, height });
        Ok(height)
    }

    /// UpdateBlock: ℬ × 𝒞 → 𝒞
    ///
    /// 1. The block's header must be linked at best.next()
    /// 2. Proof of work and block structure (size, coinbase, merkle root, repeated spends)
    /// 3. Every transaction validated in order against the coin set as
    ///    updated by the transactions before it
    /// 4. Coinbase value ≤ reward + fees
    /// 5. Append the body and the revert record, then commit the ledger
    ///    changes and the node's chunk pointers in one batch
    /// 6. Advance the best tip and evict the block's transactions from the pool
    pub fn update_block(&self, block: &Block) -> Result<()> {
        let mut state = self.state.write();
        let result = self.attach_body(&mut state, block);
        if let Err(e) = &result {
            warn!(id = %to_hex(&block.id()), error = %e, "block rejected");
        }
        result
    }

    fn attach_body(&self, state: &mut ChainState, block: &Block) -> Result<()> {
        let height = state.best.next();
        let id = block.id();
        let node = state
            .nodes
            .get(height as usize)
            .ok_or_else(|| ConsensusError::ChainLink(format!("no header linked at height {}", height)))?;
        if node.id != id {
            return Err(ConsensusError::ChainLink(format!(
                "block {} is not the header linked at height {}",
                to_hex(&id),
                height
            )));
        }
        check_proof_of_work(&id, block.header.bits, &self.limit)?;
        check_block_structure(block, height)?;

        let ctx = SpendContext {
            next_height: height,
            median_time: median_time_of(&state.nodes, height as usize),
            enforce_spend_check: true,
        };
        let mut batch = LedgerBatch::new(self.store.as_ref());
        let mut fees: Amount = 0;
        for (index, tx) in block.transactions.iter().enumerate() {
            let fee = {
                let view = LedgerView { batch: &batch, nodes: &state.nodes };
                check_transaction(tx, &view, &ctx)?
            };
            fees = fees
                .checked_add(fee)
                .filter(|f| *f <= MAX_MONEY)
                .ok_or_else(|| ConsensusError::AmountRange("block fees exceed MAX_MONEY".to_string()))?;
            apply_transaction(&mut batch, tx, TxLocation { block_id: id, index: index as u32 }, height)?;
        }
        check_coinbase_value(block, height, fees, &self.config)?;
        batch.put(BEST_KEY.to_vec(), BestValue { id, height }.to_bytes())?;
        let changeset = batch.into_changeset();

        let body = block.to_bytes();
        let blk = self.blocks.append(&body)?;
        let rev = self.reverts.append(&changeset.to_bytes())?;
        let mut attached = node.clone();
        attached.blk = Some(blk);
        attached.rev = Some(rev);

        let mut ops = changeset.apply;
        ops.push(BatchOperation::put(header_key(&id), attached.record().to_bytes()));
        self.store.write_batch(ops)?;

        state.nodes[height as usize] = attached;
        state.best = BestValue { id, height };
        self.pool.del_txs(&block.transactions);
        let size = body.len();
        self.cache.put_block(id, Arc::new(block.clone()), size);
        info!(id = %to_hex(&id), height, fees, "best tip advanced");
        self.listener.on_event(&ChainEvent::BlockLinked { id, height, txs: block.transactions.len() });
        Ok(())
    }

    /// UnlinkLast: 𝒞 → 𝒞
    ///
    /// Remove the last header. When it is the best tip its revert record is
    /// applied first, restoring the coin set, indexes and best pointer.
    /// Returns the removed id, or `None` on an empty chain.
    pub fn unlink_last(&self) -> Result<Option<Hash>> {
        let mut state = self.state.write();
        let result = self.detach_last(&mut state);
        if let Err(e) = &result {
            error!(error = %e, "failed to unlink chain tip");
        }
        result
    }

    fn detach_last(&self, state: &mut ChainState) -> Result<Option<Hash>> {
        let Some(tip) = state.nodes.last().cloned() else {
            return Ok(None);
        };
        let is_best = state.best.is_valid() && state.best.id == tip.id;

        let mut ops = Vec::new();
        let mut body = None;
        if is_best {
            let rev = tip.rev.ok_or_else(|| {
                ConsensusError::Storage(format!("block {} has no revert record", to_hex(&tip.id)))
            })?;
            let changeset = Changeset::from_bytes(&self.reverts.read(&rev)?)?;
            if let Some(blk) = tip.blk {
                body = Some(Block::from_bytes(&self.blocks.read(&blk)?)?);
            }
            ops = changeset.undo;
        }
        ops.push(BatchOperation::delete(header_key(&tip.id)));
        let prev = tip.height.checked_sub(1).and_then(|h| state.nodes.get(h as usize));
        match prev {
            Some(prev) => ops.push(BatchOperation::put(LAST_HEADER_KEY, prev.id.to_vec())),
            None => ops.push(BatchOperation::delete(LAST_HEADER_KEY)),
        }
        self.store.write_batch(ops)?;

        state.nodes.pop();
        state.ids.remove(&tip.id);
        if is_best {
            state.best = match state.nodes.last() {
                Some(node) => BestValue { id: node.id, height: node.height },
                None => BestValue::empty(),
            };
            match &body {
                Some(block) => self.cache.remove_block(&tip.id, block),
                None => self.cache.remove(&tip.id),
            }
            info!(id = %to_hex(&tip.id), height = tip.height, "best tip reverted");
            self.listener.on_event(&ChainEvent::BlockUnlinked { id: tip.id, height: tip.height });
        } else {
            debug!(id = %to_hex(&tip.id), height = tip.height, "unlinked header");
        }
        Ok(Some(tip.id))
    }

    /// LinkHeader followed by UpdateBlock under one write lock; a rejected
    /// body unlinks its header again
    pub fn link_block(&self, block: &Block) -> Result<Height> {
        let mut state = self.state.write();
        let height = self.link_header_locked(&mut state, block.header.clone())?;
        if let Err(e) = self.attach_body(&mut state, block) {
            warn!(id = %to_hex(&block.id()), error = %e, "block rejected");
            if state.nodes.last().map_or(false, |node| node.id == block.id()) {
                if let Err(revert) = self.detach_last(&mut state) {
                    error!(error = %revert, "failed to unlink rejected header");
                    return Err(revert);
                }
            }
            return Err(e);
        }
        Ok(height)
    }

    // ============================================================================
    // BLOCK ASSEMBLY
    // ============================================================================

    /// NewBlock: 𝒞 × 𝒫 → ℬ
    ///
    /// 1. Requires the best tip to be the last header
    /// 2. time = max(now, median + 1, prev time + 1), bits from the retarget rule
    /// 3. Pool candidates that are final and sequence-unlocked are revalidated
    ///    in order against the coin set as updated by earlier candidates;
    ///    failures are skipped
    /// 4. Coinbase pays reward + fees to `miner`
    ///
    /// The returned block is not mined.
    pub fn new_block(&self, miner: PubKeyHash, ext: &[u8]) -> Result<Block> {
        let state = self.state.read();
        let height = state.best.next();
        if height as usize != state.nodes.len() {
            return Err(ConsensusError::ChainLink(format!(
                "headers linked ahead of best height {}",
                state.best.height
            )));
        }
        let median = median_time_of(&state.nodes, state.nodes.len());
        let (prev_id, timestamp) = match state.nodes.last() {
            Some(prev) => (prev.id, now().max(median.saturating_add(1)).max(prev.header.timestamp.saturating_add(1))),
            None => ([0u8; 32], now()),
        };
        let bits = self.expected_bits(&state.nodes, height)?;
        let ctx = SpendContext { next_height: height, median_time: median, enforce_spend_check: true };

        let candidates = {
            let view = PoolView { store: self.store.as_ref(), pool: &self.pool, nodes: &state.nodes };
            self.pool.get_txs(MAX_BLOCK_SIZE - COINBASE_RESERVE, &view, &ctx)
        };
        let mut batch = LedgerBatch::new(self.store.as_ref());
        let mut fees: Amount = 0;
        let mut transactions = Vec::with_capacity(candidates.len() + 1);
        for tx in candidates {
            let checked = {
                let view = LedgerView { batch: &batch, nodes: &state.nodes };
                check_transaction(&tx, &view, &ctx)
            };
            let fee = match checked.and_then(|fee| {
                apply_transaction(&mut batch, &tx, TxLocation { block_id: [0u8; 32], index: 0 }, height)?;
                Ok(fee)
            }) {
                Ok(fee) => fee,
                Err(e) => {
                    warn!(id = %to_hex(&tx.id()), error = %e, "skipped pool transaction");
                    continue;
                }
            };
            fees = fees.saturating_add(fee).min(MAX_MONEY);
            transactions.push(tx);
        }

        let reward = coinbase_reward(height, &self.config)
            .checked_add(fees)
            .ok_or_else(|| ConsensusError::AmountRange("reward plus fees overflows".to_string()))?;
        transactions.insert(0, new_coinbase(height, miner, reward, ext)?);
        let mut block = Block {
            header: BlockHeader { version: 1, prev_block_hash: prev_id, merkle_root: [0u8; 32], timestamp, bits, nonce: 0 },
            transactions,
        };
        block.set_merkle_root()?;
        self.listener.on_event(&ChainEvent::BlockCreated { height, txs: block.transactions.len() });
        Ok(block)
    }

    /// Validate a transaction against confirmed and pooled coins, then pool it
    pub fn submit_tx(&self, tx: Transaction) -> Result<Hash> {
        let state = self.state.read();
        if tx.is_coinbase() {
            return Err(ConsensusError::TransactionValidation("coinbase transaction outside a block".to_string()));
        }
        for output in &tx.outputs {
            output.script_pubkey.pkh()?;
        }
        let next = state.best.next();
        let ctx = SpendContext {
            next_height: next,
            median_time: median_time_of(&state.nodes, next as usize),
            enforce_spend_check: true,
        };
        let view = PoolView { store: self.store.as_ref(), pool: &self.pool, nodes: &state.nodes };
        check_transaction(&tx, &view, &ctx)?;
        let id = tx.id();
        self.pool.push_back(tx)?;
        self.listener.on_event(&ChainEvent::TxAdmitted { id });
        Ok(id)
    }

    // ============================================================================
    // QUERIES
    // ============================================================================

    /// Unspent confirmed output at `outpoint`
    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        let _state = self.state.read();
        match self.store.get(&utxo_key(outpoint))? {
            Some(bytes) => Ok(Some(Utxo::decode_at(*outpoint, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Decoded block body, through the cache
    pub fn get_block(&self, id: &Hash) -> Result<Option<Arc<Block>>> {
        let state = self.state.read();
        self.load_block(&state, id)
    }

    /// Cache fills happen under the state lock, so an unlink cannot
    /// interleave between the lookup and the insert
    fn load_block(&self, state: &ChainState, id: &Hash) -> Result<Option<Arc<Block>>> {
        if let Some(block) = self.cache.get_block(id) {
            return Ok(Some(block));
        }
        let node = state.ids.get(id).and_then(|height| state.nodes.get(*height as usize));
        let Some(blk) = node.and_then(|node| node.blk) else {
            return Ok(None);
        };
        let bytes = self.blocks.read(&blk)?;
        let block = Arc::new(Block::from_bytes(&bytes)?);
        self.cache.put_block(*id, Arc::clone(&block), bytes.len());
        Ok(Some(block))
    }

    /// Location of a confirmed transaction
    pub fn tx_location(&self, txid: &Hash) -> Result<Option<TxLocation>> {
        match self.store.get(&tx_key(txid))? {
            Some(bytes) => Ok(Some(TxLocation::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Confirmed transaction, through the cache
    pub fn get_tx(&self, txid: &Hash) -> Result<Option<Arc<Transaction>>> {
        let state = self.state.read();
        if let Some(tx) = self.cache.get_tx(txid) {
            return Ok(Some(tx));
        }
        let Some(location) = self.tx_location(txid)? else {
            return Ok(None);
        };
        let block = self.load_block(&state, &location.block_id)?.ok_or_else(|| {
            ConsensusError::Storage(format!("block {} of transaction {} missing", to_hex(&location.block_id), to_hex(txid)))
        })?;
        let tx = block.transactions.get(location.index as usize).cloned().ok_or_else(|| {
            ConsensusError::Storage(format!("transaction {} index {} out of range", to_hex(txid), location.index))
        })?;
        let tx = Arc::new(tx);
        self.cache.put_tx(*txid, Arc::clone(&tx), tx.encoded_size());
        Ok(Some(tx))
    }

    /// ListCoins: confirmed coins not claimed by the pool, plus pool-created coins
    pub fn list_coins(&self, pkh: &PubKeyHash) -> Result<Coins> {
        let _state = self.state.read();
        let mut coins = Vec::new();
        for (key, value) in self.store.prefix_scan(&coin_prefix(pkh))? {
            let (owner, outpoint) = parse_coin_key(&key)?;
            if self.pool.find_coin(&outpoint).is_some() {
                continue;
            }
            let mut r = crate::encoding::Reader::new(&value);
            let coin = Coin::decode_value(owner, outpoint, &mut r)?;
            r.finish()?;
            coins.push(coin);
        }
        coins.extend(self.pool.pool_coins(pkh));
        Ok(Coins(coins))
    }

    /// Balance split at the next block height
    pub fn balance(&self, pkh: &PubKeyHash) -> Result<CoinsState> {
        let coins = self.list_coins(pkh)?;
        Ok(coins.state(self.best().next()))
    }

    /// Account history in chain order
    pub fn history(&self, pkh: &PubKeyHash) -> Result<Vec<HistoryEntry>> {
        self.store
            .prefix_scan(&history_prefix(pkh))?
            .iter()
            .map(|(key, value)| HistoryEntry::from_kv(key, value))
            .collect()
    }

    /// Page through headers
    pub fn get_headers(&self, msg: &GetHeadersMsg) -> HeadersMsg {
        let state = self.state.read();
        let mut reply = HeadersMsg {
            headers: Vec::new(),
            best_height: state.best.height,
            last_height: state.nodes.last().map_or(INVALID_HEIGHT, |n| n.height),
        };
        let count = (msg.limit.unsigned_abs() as usize).min(MAX_HEADERS_PER_MSG);
        if count == 0 || state.nodes.is_empty() {
            return reply;
        }
        let forward = msg.limit > 0;
        let start = if msg.start == [0u8; 32] {
            if forward {
                0
            } else {
                state.nodes.len() - 1
            }
        } else {
            match state.ids.get(&msg.start) {
                Some(height) => *height as usize,
                None => return reply,
            }
        };
        let skip = msg.skip as usize;
        if forward {
            reply.headers = state.nodes.iter().skip(start.saturating_add(skip)).take(count).map(|n| n.header.clone()).collect();
        } else if let Some(first) = start.checked_sub(skip) {
            reply.headers = state.nodes[..=first].iter().rev().take(count).map(|n| n.header.clone()).collect();
        }
        reply
    }

    /// Inclusion proof for a confirmed transaction
    pub fn merkle_proof(&self, txid: &Hash) -> Result<MerkleProofMsg> {
        let state = self.state.read();
        let location = self
            .tx_location(txid)?
            .ok_or_else(|| ConsensusError::CoinUnavailable(format!("transaction {} not confirmed", to_hex(txid))))?;
        let block = self.load_block(&state, &location.block_id)?.ok_or_else(|| {
            ConsensusError::Storage(format!("block {} missing", to_hex(&location.block_id)))
        })?;
        let ids = block.txids();
        let mut matched = BitSet::new(ids.len());
        matched.set(location.index as usize);
        let tree = MerkleTree::build(&ids, &matched)?;
        Ok(MerkleProofMsg::new(*txid, &tree))
    }
}

/// Walks chain nodes under a held read lock
pub struct ChainIter<'a> {
    state: RwLockReadGuard<'a, ChainState>,
    next: Option<usize>,
    forward: bool,
}

impl Iterator for ChainIter<'_> {
    type Item = ChainNode;

    fn next(&mut self) -> Option<ChainNode> {
        let index = self.next?;
        let node = self.state.nodes.get(index).cloned()?;
        self.next = if self.forward { index.checked_add(1) } else { index.checked_sub(1) };
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::tests::RecordingListener;
    use crate::listener::NoopListener;

    fn chain() -> ChainIndex {
        let config = ChainConfig::regtest();
        let storage = ChainStorage::in_memory(config.chunk_file_size);
        let pool = Arc::new(Mempool::new(config.pool_capacity));
        ChainIndex::open(config, storage, pool, Arc::new(NoopListener)).unwrap()
    }

    fn mined(chain: &ChainIndex, miner: PubKeyHash) -> Block {
        let mut block = chain.new_block(miner, &[]).unwrap();
        assert!(block.mine(u32::MAX, chain.pow_limit()).unwrap());
        block
    }

    #[test]
    fn test_median_time() {
        let node = |t| ChainNode {
            header: BlockHeader { version: 1, prev_block_hash: [0u8; 32], merkle_root: [0u8; 32], timestamp: t, bits: 0, nonce: 0 },
            id: [0u8; 32],
            height: 0,
            blk: None,
            rev: None,
        };
        assert_eq!(median_time_of(&[], 0), 0);
        let nodes: Vec<ChainNode> = [5, 1, 9].into_iter().map(node).collect();
        assert_eq!(median_time_of(&nodes, 3), 5);
        let nodes: Vec<ChainNode> = (1..=20).map(node).collect();
        // last 11 are 10..=20
        assert_eq!(median_time_of(&nodes, 20), 15);
        assert_eq!(median_time_of(&nodes, 5), 3);
    }

    #[test]
    fn test_link_genesis_and_next() {
        let chain = chain();
        assert!(chain.is_empty());
        assert!(!chain.best().is_valid());
        let genesis = mined(&chain, [1u8; 20]);
        assert_eq!(chain.link_block(&genesis).unwrap(), 0);
        assert_eq!(chain.best(), BestValue { id: genesis.id(), height: 0 });
        let next = mined(&chain, [1u8; 20]);
        assert_eq!(next.header.prev_block_hash, genesis.id());
        chain.link_block(&next).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get_by_id(&next.id()).unwrap().height, 1);
    }

    #[test]
    fn test_header_rules() {
        let chain = chain();
        let genesis = mined(&chain, [1u8; 20]);
        chain.link_block(&genesis).unwrap();
        assert!(matches!(chain.link_header(genesis.header.clone()), Err(ConsensusError::ChainLink(_))));

        let mut block = chain.new_block([1u8; 20], &[]).unwrap();
        block.header.timestamp = genesis.header.timestamp;
        block.mine(u32::MAX, chain.pow_limit()).unwrap();
        assert!(matches!(chain.link_header(block.header.clone()), Err(ConsensusError::ChainLink(_))));

        let mut block = chain.new_block([1u8; 20], &[]).unwrap();
        block.header.prev_block_hash = [9u8; 32];
        block.mine(u32::MAX, chain.pow_limit()).unwrap();
        assert!(matches!(chain.link_header(block.header.clone()), Err(ConsensusError::ChainLink(_))));

        let mut block = chain.new_block([1u8; 20], &[]).unwrap();
        block.header.bits = 0x1f00ffff;
        assert!(matches!(chain.link_header(block.header.clone()), Err(ConsensusError::ChainLink(_))));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_header_only_then_body() {
        let chain = chain();
        let genesis = mined(&chain, [1u8; 20]);
        chain.link_header(genesis.header.clone()).unwrap();
        assert!(!chain.best().is_valid());
        assert_eq!(chain.next_to_sync().unwrap().id, genesis.id());
        assert!(chain.new_block([1u8; 20], &[]).is_err());
        chain.update_block(&genesis).unwrap();
        assert!(chain.next_to_sync().is_none());
        assert!(chain.get_by_height(0).unwrap().has_body());
    }

    #[test]
    fn test_update_block_rejects_wrong_body() {
        let chain = chain();
        let genesis = mined(&chain, [1u8; 20]);
        chain.link_header(genesis.header.clone()).unwrap();
        let mut other = genesis.clone();
        other.transactions[0].outputs[0].value += 1;
        assert!(chain.update_block(&other).is_err());
        assert!(!chain.best().is_valid());
    }

    #[test]
    fn test_unlink_header_only_and_empty() {
        let chain = chain();
        assert_eq!(chain.unlink_last().unwrap(), None);
        let genesis = mined(&chain, [1u8; 20]);
        chain.link_header(genesis.header.clone()).unwrap();
        assert_eq!(chain.unlink_last().unwrap(), Some(genesis.id()));
        assert!(chain.is_empty());
        assert_eq!(chain.unlink_last().unwrap(), None);
    }

    #[test]
    fn test_iteration_both_ways() {
        let chain = chain();
        for _ in 0..4 {
            let block = mined(&chain, [1u8; 20]);
            chain.link_block(&block).unwrap();
        }
        let forward: Vec<Height> = chain.iter_from(1, true).map(|n| n.height).collect();
        assert_eq!(forward, vec![1, 2, 3]);
        let backward: Vec<Height> = chain.iter_from(2, false).map(|n| n.height).collect();
        assert_eq!(backward, vec![2, 1, 0]);
    }

    #[test]
    fn test_events_emitted() {
        let config = ChainConfig::regtest();
        let listener = Arc::new(RecordingListener::default());
        let chain = ChainIndex::open(
            config.clone(),
            ChainStorage::in_memory(config.chunk_file_size),
            Arc::new(Mempool::new(10)),
            listener.clone(),
        )
        .unwrap();
        let genesis = mined(&chain, [1u8; 20]);
        chain.link_block(&genesis).unwrap();
        chain.unlink_last().unwrap();
        let events = listener.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ChainEvent::BlockCreated { height: 0, txs: 1 },
                ChainEvent::HeaderLinked { id: genesis.id(), height: 0 },
                ChainEvent::BlockLinked { id: genesis.id(), height: 0, txs: 1 },
                ChainEvent::BlockUnlinked { id: genesis.id(), height: 0 },
            ]
        );
    }

    #[test]
    fn test_get_block_and_tx() {
        let chain = chain();
        let genesis = mined(&chain, [1u8; 20]);
        chain.link_block(&genesis).unwrap();
        assert_eq!(*chain.get_block(&genesis.id()).unwrap().unwrap(), genesis);
        let txid = genesis.transactions[0].id();
        assert_eq!(*chain.get_tx(&txid).unwrap().unwrap(), genesis.transactions[0]);
        assert!(chain.get_tx(&[7u8; 32]).unwrap().is_none());
    }

    #[test]
    fn test_unlinked_block_not_served_from_cache() {
        let chain = chain();
        let genesis = mined(&chain, [1u8; 20]);
        chain.link_block(&genesis).unwrap();
        let tip = mined(&chain, [1u8; 20]);
        chain.link_block(&tip).unwrap();
        let txid = tip.transactions[0].id();
        chain.cache.clear();
        assert!(chain.get_tx(&txid).unwrap().is_some());
        assert!(chain.cache.get_block(&tip.id()).is_some());

        chain.unlink_last().unwrap();
        assert!(chain.cache.get_block(&tip.id()).is_none());
        assert!(chain.cache.get_tx(&txid).is_none());
        assert!(chain.get_block(&tip.id()).unwrap().is_none());
        assert!(chain.get_tx(&txid).unwrap().is_none());
        assert!(chain.get_block(&genesis.id()).unwrap().is_some());
    }

    // ============================================================================
    // LINK BLOCK ATOMICITY
    // ============================================================================

    #[test]
    fn test_rejected_body_unlinks_only_its_header() {
        let chain = chain();
        let miner = [1u8; 20];
        let genesis = mined(&chain, miner);
        chain.link_block(&genesis).unwrap();
        let ahead = mined(&chain, miner);
        chain.link_header(ahead.header.clone()).unwrap();

        // Extends the header-only tip, so its body cannot attach at best + 1
        let mut orphan = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: ahead.id(),
                merkle_root: [0u8; 32],
                timestamp: ahead.header.timestamp + 1,
                bits: ahead.header.bits,
                nonce: 0,
            },
            transactions: vec![new_coinbase(2, miner, coinbase_reward(2, chain.config()), &[]).unwrap()],
        };
        orphan.set_merkle_root().unwrap();
        assert!(orphan.mine(u32::MAX, chain.pow_limit()).unwrap());

        assert!(matches!(chain.link_block(&orphan), Err(ConsensusError::ChainLink(_))));
        assert!(!chain.contains(&orphan.id()));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.last().unwrap().id, ahead.id());
        assert_eq!(chain.store.get(LAST_HEADER_KEY).unwrap(), Some(ahead.id().to_vec()));
        assert_eq!(chain.best().id, genesis.id());
    }
}
