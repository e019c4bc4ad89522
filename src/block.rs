//! Block validation functions

use crate::config::ChainConfig;
use crate::constants::*;
use crate::encoding::Encodable;
use crate::error::{ConsensusError, Result};
use crate::hash::to_hex;
use crate::merkle::merkle_root;
use crate::pow::{check_pow_bits, coinbase_reward};
use crate::script::Script;
use crate::types::*;
use crate::uint256::U256;
use std::collections::HashSet;

impl Block {
    /// Block identity: the header id
    pub fn id(&self) -> Hash {
        self.header.id()
    }

    /// Encoded block size in bytes
    pub fn size(&self) -> usize {
        self.encoded_size()
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.id()).collect()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Merkle root over the transaction ids
    pub fn compute_merkle_root(&self) -> Result<Hash> {
        merkle_root(&self.txids())
    }

    /// Recompute the header's merkle root from the transactions
    pub fn set_merkle_root(&mut self) -> Result<()> {
        self.header.merkle_root = self.compute_merkle_root()?;
        Ok(())
    }

    /// MineBlock: ℬ × ℕ → ℬ × {success, failure}
    ///
    /// 1. Expand the header bits into a target
    /// 2. Try up to `tries` nonces starting at the current one
    /// 3. Stop at the first nonce whose header id is ≤ target
    ///
    /// On failure the nonce is left advanced past the tried range.
    pub fn mine(&mut self, tries: u32, limit: &U256) -> Result<bool> {
        let target = check_pow_bits(self.header.bits, limit)?;
        for _ in 0..tries {
            if U256::from_bytes(&self.header.id()) <= target {
                return Ok(true);
            }
            self.header.nonce = self.header.nonce.wrapping_add(1);
        }
        Ok(false)
    }
}

/// Coinbase transaction paying `value` to `miner` at `height`
pub fn new_coinbase(height: Height, miner: PubKeyHash, value: Amount, ext: &[u8]) -> Result<Transaction> {
    Ok(Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig: Script::coinbase(height, ext)?,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput { value, script_pubkey: Script::locked(miner, &[])? }],
        lock_time: 0,
    })
}

/// CheckBlock (context free): ℬ × ℕ → {valid, invalid}
///
/// 1. |txs| > 0 and |b| ≤ MAX_BLOCK_SIZE
/// 2. txs[0] is a coinbase whose script records `height`
/// 3. No other transaction is a coinbase
/// 4. header.merkle_root = MerkleRoot(txids)
/// 5. No outpoint spent twice across the block
pub fn check_block_structure(block: &Block, height: Height) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(ConsensusError::BlockValidation("block has no transactions".to_string()));
    }
    let size = block.size();
    if size > MAX_BLOCK_SIZE {
        return Err(ConsensusError::SizeLimitExceeded(format!("block {} bytes", size)));
    }

    let coinbase = block
        .coinbase()
        .ok_or_else(|| ConsensusError::BlockValidation("first transaction is not a coinbase".to_string()))?;
    let coinbase_height = coinbase.coinbase_height()?;
    if coinbase_height != height {
        return Err(ConsensusError::BlockValidation(format!(
            "coinbase height {} at block height {}",
            coinbase_height, height
        )));
    }
    if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(ConsensusError::BlockValidation("multiple coinbase transactions".to_string()));
    }

    let root = block.compute_merkle_root()?;
    if root != block.header.merkle_root {
        return Err(ConsensusError::BlockValidation(format!(
            "merkle root {} does not match header {}",
            to_hex(&root),
            to_hex(&block.header.merkle_root)
        )));
    }

    check_repeated_spend(block)
}

/// CheckRepeatedSpend: no two inputs of the block reference the same output
pub fn check_repeated_spend(block: &Block) -> Result<()> {
    let mut spent = HashSet::new();
    for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
        for input in &tx.inputs {
            if !spent.insert(input.prevout) {
                return Err(ConsensusError::BlockValidation(format!(
                    "output {}:{} spent twice in block",
                    to_hex(&input.prevout.hash),
                    input.prevout.index
                )));
            }
        }
    }
    Ok(())
}

/// Coinbase outputs may claim at most the block reward plus the fees
pub fn check_coinbase_value(block: &Block, height: Height, fees: Amount, config: &ChainConfig) -> Result<()> {
    let coinbase = block
        .coinbase()
        .ok_or_else(|| ConsensusError::BlockValidation("first transaction is not a coinbase".to_string()))?;
    let claimed = coinbase.output_total()?;
    let allowed = coinbase_reward(height, config)
        .checked_add(fees)
        .ok_or_else(|| ConsensusError::AmountRange("reward plus fees overflows".to_string()))?;
    if claimed > allowed {
        return Err(ConsensusError::BlockValidation(format!(
            "coinbase claims {} but reward plus fees is {}",
            claimed, allowed
        )));
    }
    Ok(())
}
