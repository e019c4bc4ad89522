//! Transaction pool: FIFO of unconfirmed transactions
//!
//! Insertion order is block-assembly order. Every output a pooled
//! transaction spends is indexed as claimed, so a second spend is either
//! rejected or replaces the first by sequence.

use crate::coin::{Coin, CoinView, Utxo};
use crate::encoding::Encodable;
use crate::error::{ConsensusError, Result};
use crate::hash::to_hex;
use crate::transaction::{check_sequence_lock, is_final, SpendContext};
use crate::types::*;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Default)]
struct PoolInner {
    txs: IndexMap<Hash, Transaction>,
    /// Spent outpoint → id of the pooled transaction spending it
    claimed: HashMap<OutPoint, Hash>,
}

impl PoolInner {
    fn insert(&mut self, id: Hash, tx: Transaction) {
        for input in &tx.inputs {
            self.claimed.insert(input.prevout, id);
        }
        self.txs.insert(id, tx);
    }

    fn remove(&mut self, id: &Hash) -> Option<Transaction> {
        let tx = self.txs.shift_remove(id)?;
        for input in &tx.inputs {
            if self.claimed.get(&input.prevout) == Some(id) {
                self.claimed.remove(&input.prevout);
            }
        }
        Some(tx)
    }

    /// Remove a transaction and every pooled transaction spending its outputs
    fn remove_with_descendants(&mut self, id: &Hash, removed: &mut Vec<Hash>) {
        let mut stack = vec![*id];
        while let Some(next) = stack.pop() {
            let Some(tx) = self.remove(&next) else {
                continue;
            };
            removed.push(next);
            for index in 0..tx.outputs.len() as u32 {
                if let Some(child) = self.claimed.get(&OutPoint::new(next, index)) {
                    stack.push(*child);
                }
            }
        }
    }
}

/// Bounded pool of signed, validated transactions
pub struct Mempool {
    inner: RwLock<PoolInner>,
    capacity: usize,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self { inner: RwLock::new(PoolInner::default()), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.inner.read().txs.contains_key(id)
    }

    pub fn get(&self, id: &Hash) -> Option<Transaction> {
        self.inner.read().txs.get(id).cloned()
    }

    /// All pooled transactions in insertion order
    pub fn txs(&self) -> Vec<Transaction> {
        self.inner.read().txs.values().cloned().collect()
    }

    /// PushBack: 𝒯𝒳 × 𝒫 → 𝒫
    ///
    /// 1. Reject if the id is already pooled
    /// 2. For every input claiming an already-claimed output, the new sequence
    ///    must be strictly greater than the claimant's; those claimants (and
    ///    their descendants) are evicted
    /// 3. Reject if the pool would exceed capacity
    /// 4. Append and index the claimed outputs
    ///
    /// The transaction is expected to be validated already. Returns the ids
    /// of evicted transactions.
    pub fn push_back(&self, tx: Transaction) -> Result<Vec<Hash>> {
        let id = tx.id();
        let mut inner = self.inner.write();
        match Self::admit(&mut inner, self.capacity, id, tx) {
            Ok(evicted) => {
                debug!(id = %to_hex(&id), evicted = evicted.len(), size = inner.txs.len(), "pooled transaction");
                Ok(evicted)
            }
            Err(e) => {
                warn!(id = %to_hex(&id), error = %e, "pool rejected transaction");
                Err(e)
            }
        }
    }

    fn admit(inner: &mut PoolInner, capacity: usize, id: Hash, tx: Transaction) -> Result<Vec<Hash>> {
        if inner.txs.contains_key(&id) {
            return Err(ConsensusError::TxExists(to_hex(&id)));
        }

        let mut replaced = HashSet::new();
        for input in &tx.inputs {
            let Some(claimant) = inner.claimed.get(&input.prevout) else {
                continue;
            };
            let pooled = inner
                .txs
                .get(claimant)
                .and_then(|t| t.inputs.iter().find(|i| i.prevout == input.prevout))
                .map_or(0, |i| i.sequence);
            if input.sequence <= pooled {
                return Err(ConsensusError::PoolConflict(format!(
                    "{}:{} already claimed by {} with sequence {}",
                    to_hex(&input.prevout.hash),
                    input.prevout.index,
                    to_hex(claimant),
                    pooled
                )));
            }
            replaced.insert(*claimant);
        }

        // Collect the full eviction set before mutating
        let mut evicted = Vec::new();
        if !replaced.is_empty() {
            let mut probe = PoolInner { txs: inner.txs.clone(), claimed: inner.claimed.clone() };
            for claimant in &replaced {
                probe.remove_with_descendants(claimant, &mut evicted);
            }
            if tx.inputs.iter().any(|i| evicted.contains(&i.prevout.hash)) {
                return Err(ConsensusError::PoolConflict(format!(
                    "{} spends an output of a transaction it replaces",
                    to_hex(&id)
                )));
            }
            if probe.txs.len() >= capacity {
                return Err(ConsensusError::PoolFull(format!("{} transactions", probe.txs.len())));
            }
            *inner = probe;
        } else if inner.txs.len() >= capacity {
            return Err(ConsensusError::PoolFull(format!("{} transactions", inner.txs.len())));
        }

        inner.insert(id, tx);
        Ok(evicted)
    }

    /// Del: remove one transaction; its dependents stay pooled
    pub fn del(&self, id: &Hash) -> Option<Transaction> {
        self.inner.write().remove(id)
    }

    /// Remove a block's transactions and every pooled transaction that
    /// conflicts with them. Returns the number of removed transactions.
    pub fn del_txs(&self, confirmed: &[Transaction]) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        let ids: HashSet<Hash> = confirmed.iter().map(|tx| tx.id()).collect();
        for id in &ids {
            if inner.remove(id).is_some() {
                removed += 1;
            }
        }
        let mut conflicts = Vec::new();
        for tx in confirmed.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.inputs {
                if let Some(claimant) = inner.claimed.get(&input.prevout).copied() {
                    inner.remove_with_descendants(&claimant, &mut conflicts);
                }
            }
        }
        for id in &conflicts {
            debug!(id = %to_hex(id), "evicted transaction conflicting with block");
        }
        removed + conflicts.len()
    }

    /// GetTxs: 𝒫 × ℕ → 𝒯𝒳*
    ///
    /// Walk in insertion order and stop before the encoded size would exceed
    /// `budget`. Skipped: transactions not final at `ctx`, and those with an
    /// input that `view` cannot resolve or whose relative sequence lock is
    /// still closed.
    pub fn get_txs(&self, budget: usize, view: &dyn CoinView, ctx: &SpendContext) -> Vec<Transaction> {
        // The view may read pool outputs, so it runs on a snapshot
        let candidates: Vec<Transaction> = self.inner.read().txs.values().cloned().collect();
        let mut selected = Vec::new();
        let mut used = 0usize;
        for tx in candidates {
            if !is_final(&tx, ctx.next_height, ctx.median_time) {
                continue;
            }
            let unlocked = tx.inputs.iter().all(|input| match view.utxo(&input.prevout) {
                Ok(Some(utxo)) => check_sequence_lock(input.sequence, &utxo, view, ctx).is_ok(),
                _ => false,
            });
            if !unlocked {
                debug!(id = %to_hex(&tx.id()), "pool transaction not yet spendable");
                continue;
            }
            let size = tx.encoded_size();
            if used + size > budget {
                break;
            }
            used += size;
            selected.push(tx);
        }
        selected
    }

    /// FindCoin: id of the pooled transaction spending `outpoint`, if any
    pub fn find_coin(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.inner.read().claimed.get(outpoint).copied()
    }

    /// Output created by a pooled transaction, as a pool coin
    pub fn output(&self, outpoint: &OutPoint) -> Option<Utxo> {
        let inner = self.inner.read();
        let tx = inner.txs.get(&outpoint.hash)?;
        let output = tx.outputs.get(outpoint.index as usize)?;
        Utxo::new(outpoint.hash, outpoint.index, output, false, 0, true).ok()
    }

    /// Unclaimed outputs of pooled transactions owned by `pkh`
    pub fn pool_coins(&self, pkh: &PubKeyHash) -> Vec<Coin> {
        let inner = self.inner.read();
        let mut coins = Vec::new();
        for (id, tx) in &inner.txs {
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(*id, index as u32);
                if inner.claimed.contains_key(&outpoint) {
                    continue;
                }
                match output.script_pubkey.pkh() {
                    Ok(owner) if owner == *pkh => {}
                    _ => continue,
                }
                if let Ok(utxo) = Utxo::new(*id, index as u32, output, false, 0, true) {
                    coins.push(utxo.coin);
                }
            }
        }
        coins
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.txs.clear();
        inner.claimed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
    use crate::script::Script;

    fn tx(prev: OutPoint, sequence: u32, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout: prev, script_sig: Script::default(), sequence }],
            outputs: vec![TransactionOutput { value, script_pubkey: Script::locked([4u8; 20], &[]).unwrap() }],
            lock_time: 0,
        }
    }

    fn op(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    #[test]
    fn test_push_back_and_order() {
        let pool = Mempool::new(10);
        let a = tx(op(1), 0, 10);
        let b = tx(op(2), 0, 20);
        pool.push_back(a.clone()).unwrap();
        pool.push_back(b.clone()).unwrap();
        assert_eq!(pool.txs(), vec![a.clone(), b]);
        assert_eq!(pool.find_coin(&op(1)), Some(a.id()));
        assert!(pool.find_coin(&op(3)).is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let pool = Mempool::new(10);
        let a = tx(op(1), 0, 10);
        pool.push_back(a.clone()).unwrap();
        assert!(matches!(pool.push_back(a), Err(ConsensusError::TxExists(_))));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let pool = Mempool::new(2);
        pool.push_back(tx(op(1), 0, 1)).unwrap();
        pool.push_back(tx(op(2), 0, 1)).unwrap();
        let err = pool.push_back(tx(op(3), 0, 1)).unwrap_err();
        assert!(matches!(err, ConsensusError::PoolFull(_)));
        assert!(err.is_pool_rejection());
    }

    // ============================================================================
    // REPLACEMENT TESTS
    // ============================================================================

    #[test]
    fn test_conflict_without_higher_sequence() {
        let pool = Mempool::new(10);
        pool.push_back(tx(op(1), 5, 10)).unwrap();
        assert!(matches!(pool.push_back(tx(op(1), 5, 9)), Err(ConsensusError::PoolConflict(_))));
        assert!(matches!(pool.push_back(tx(op(1), 4, 9)), Err(ConsensusError::PoolConflict(_))));
    }

    #[test]
    fn test_replace_by_sequence_evicts_descendants() {
        let pool = Mempool::new(10);
        let original = tx(op(1), 5, 10);
        let child = tx(OutPoint::new(original.id(), 0), 0, 9);
        pool.push_back(original.clone()).unwrap();
        pool.push_back(child.clone()).unwrap();

        let replacement = tx(op(1), 6, 8);
        let evicted = pool.push_back(replacement.clone()).unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&original.id()) && evicted.contains(&child.id()));
        assert_eq!(pool.txs(), vec![replacement.clone()]);
        assert_eq!(pool.find_coin(&op(1)), Some(replacement.id()));
    }

    #[test]
    fn test_del_txs_removes_confirmed_and_conflicts() {
        let pool = Mempool::new(10);
        let confirmed = tx(op(1), 0, 10);
        let conflicting = tx(op(2), 0, 10);
        let unrelated = tx(op(3), 0, 10);
        pool.push_back(confirmed.clone()).unwrap();
        pool.push_back(conflicting).unwrap();
        pool.push_back(unrelated.clone()).unwrap();

        let mut rival = tx(op(2), 9, 1);
        rival.outputs[0].value = 2;
        assert_eq!(pool.del_txs(&[confirmed, rival]), 2);
        assert_eq!(pool.txs(), vec![unrelated]);
        assert!(pool.find_coin(&op(2)).is_none());
    }

    #[test]
    fn test_del_keeps_dependents() {
        let pool = Mempool::new(10);
        let parent = tx(op(1), 0, 10);
        let child = tx(OutPoint::new(parent.id(), 0), 0, 9);
        pool.push_back(parent.clone()).unwrap();
        pool.push_back(child.clone()).unwrap();
        assert!(pool.del(&parent.id()).is_some());
        assert_eq!(pool.txs(), vec![child]);
    }

    // ============================================================================
    // SELECTION TESTS
    // ============================================================================

    /// Every outpoint resolves to a confirmed coin at `height`, except
    /// outputs of pooled transactions, which resolve as pool coins
    struct ConfirmedAt<'a> {
        height: Height,
        pool: &'a Mempool,
    }

    impl CoinView for ConfirmedAt<'_> {
        fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
            if let Some(utxo) = self.pool.output(outpoint) {
                return Ok(Some(utxo));
            }
            let out = TransactionOutput { value: 100, script_pubkey: Script::locked([4u8; 20], &[])? };
            Ok(Some(Utxo::new(outpoint.hash, outpoint.index, &out, false, self.height, false)?))
        }

        fn block_time(&self, _height: Height) -> Option<u32> {
            Some(0)
        }
    }

    fn ctx(next_height: Height, median_time: u32) -> SpendContext {
        SpendContext { next_height, median_time, enforce_spend_check: true }
    }

    #[test]
    fn test_get_txs_budget_and_finality() {
        let pool = Mempool::new(10);
        let a = tx(op(1), 0, 1);
        let mut locked = tx(op(2), 0, 1);
        locked.lock_time = 50;
        let c = tx(op(3), 0, 1);
        pool.push_back(a.clone()).unwrap();
        pool.push_back(locked.clone()).unwrap();
        pool.push_back(c.clone()).unwrap();
        let view = ConfirmedAt { height: 0, pool: &pool };

        assert_eq!(pool.get_txs(usize::MAX, &view, &ctx(10, LOCKTIME_THRESHOLD)), vec![a.clone(), c.clone()]);
        assert_eq!(pool.get_txs(usize::MAX, &view, &ctx(51, 0)), vec![a.clone(), locked, c]);
        assert_eq!(pool.get_txs(a.encoded_size(), &view, &ctx(10, 0)), vec![a]);
        assert!(pool.get_txs(0, &view, &ctx(10, 0)).is_empty());
    }

    #[test]
    fn test_get_txs_skips_sequence_locked() {
        let pool = Mempool::new(10);
        let open = tx(op(1), 0, 1);
        let height_locked = tx(op(2), 5, 1);
        let parent = tx(op(3), SEQUENCE_FINAL, 50);
        let child = tx(OutPoint::new(parent.id(), 0), 1, 40);
        for t in [&open, &height_locked, &parent, &child] {
            pool.push_back(t.clone()).unwrap();
        }
        let view = ConfirmedAt { height: 10, pool: &pool };

        // Coins confirmed at 10 unlock a 5-block lock at 15
        assert_eq!(pool.get_txs(usize::MAX, &view, &ctx(14, 0)), vec![open.clone(), parent.clone()]);
        assert_eq!(pool.get_txs(usize::MAX, &view, &ctx(15, 0)), vec![open, height_locked, parent]);
    }

    #[test]
    fn test_pool_coins_and_outputs() {
        let pool = Mempool::new(10);
        let parent = tx(op(1), SEQUENCE_FINAL, 10);
        pool.push_back(parent.clone()).unwrap();
        let coins = pool.pool_coins(&[4u8; 20]);
        assert_eq!(coins.len(), 1);
        assert!(coins[0].pool);
        assert_eq!(coins[0].value, 10);
        assert!(pool.pool_coins(&[5u8; 20]).is_empty());
        assert!(pool.output(&OutPoint::new(parent.id(), 0)).is_some());
        assert!(pool.output(&OutPoint::new(parent.id(), 1)).is_none());

        // Once spent by another pooled transaction the coin is hidden
        pool.push_back(tx(OutPoint::new(parent.id(), 0), 0, 9)).unwrap();
        assert_eq!(pool.pool_coins(&[4u8; 20]).len(), 1);
        assert_eq!(pool.pool_coins(&[4u8; 20])[0].value, 9);
    }
}
