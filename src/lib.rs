//! # Ledger Core
//!
//! Chain index and ledger validation engine for a proof-of-work node with
//! multisignature accounts.
//!
//! ## Architecture
//!
//! Leaves first:
//! - Codec, hashing and 256-bit arithmetic (`encoding`, `hash`, `uint256`)
//! - Proof of work and merkle trees (`pow`, `merkle`)
//! - Scripts, keys, accounts and signature hashing (`script`, `keys`, `account`, `sign`)
//! - Coins and transaction validation (`coin`, `transaction`, `block`)
//! - Mempool (`mempool`)
//! - Storage collaborators and reversible batches (`storage`, `chunk`, `undo`, `cache`)
//! - Chain index (`chain`) with its wire payloads (`protocol`) and events (`listener`)
//!
//! ## Design Principles
//!
//! 1. **Validate, then commit**: every block is fully validated against an
//!    overlay before one atomic batch is written
//! 2. **Reversible by construction**: each committed block stores the exact
//!    undo list that restores the prior ledger state
//! 3. **Explicit ownership**: the chain index and mempool are constructed
//!    instances shared through [`LedgerNode`], never globals
//! 4. **Exact Version Pinning**: consensus-critical cryptography is pinned
//!    to exact versions
//!
//! ## Usage
//!
//! ```rust
//! use ledger_core::{Account, ChainConfig, LedgerNode};
//!
//! let node = LedgerNode::in_memory(ChainConfig::regtest()).unwrap();
//! let miner = Account::new(1, 1, false).unwrap();
//! node.mine_block(miner.pkh()).unwrap();
//! assert_eq!(node.balance(&miner.pkh()).unwrap().sum, 50 * ledger_core::COIN);
//! ```

pub mod account;
pub mod block;
pub mod cache;
pub mod chain;
pub mod chunk;
pub mod coin;
pub mod config;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod keys;
pub mod listener;
pub mod mempool;
pub mod merkle;
pub mod pow;
pub mod protocol;
pub mod script;
pub mod sign;
pub mod storage;
pub mod transaction;
pub mod transfer;
pub mod types;
pub mod uint256;
pub mod undo;

// Re-export commonly used types
pub use account::Account;
pub use chain::{ChainIndex, ChainNode, ChainStorage};
pub use coin::{Coin, Coins, CoinsState};
pub use config::ChainConfig;
pub use constants::*;
pub use error::{ConsensusError, Result};
pub use listener::{ChainEvent, ChainListener, NoopListener, TracingListener};
pub use mempool::Mempool;
pub use transfer::TransferBuilder;
pub use types::*;

use std::sync::Arc;
use tracing::info;

/// Application context: owns the chain index and the mempool it feeds from
///
/// # Examples
///
/// ```
/// use ledger_core::{ChainConfig, LedgerNode};
///
/// let node = LedgerNode::in_memory(ChainConfig::regtest()).unwrap();
/// assert!(node.chain().is_empty());
/// ```
pub struct LedgerNode {
    config: ChainConfig,
    chain: Arc<ChainIndex>,
    pool: Arc<Mempool>,
}

impl LedgerNode {
    /// Open a node over existing storage, reloading the stored chain
    pub fn open(config: ChainConfig, storage: ChainStorage, listener: Arc<dyn ChainListener>) -> Result<Self> {
        let pool = Arc::new(Mempool::new(config.pool_capacity));
        let chain = Arc::new(ChainIndex::open(config.clone(), storage, Arc::clone(&pool), listener)?);
        Ok(Self { config, chain, pool })
    }

    /// Fresh node on in-memory storage, logging events through `tracing`
    pub fn in_memory(config: ChainConfig) -> Result<Self> {
        let storage = ChainStorage::in_memory(config.chunk_file_size);
        Self::open(config, storage, Arc::new(TracingListener))
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<ChainIndex> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<Mempool> {
        &self.pool
    }

    /// Validate and pool a transaction
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash> {
        self.chain.submit_tx(tx)
    }

    /// Assemble a block on the best tip paying `miner`, search a nonce and link it
    pub fn mine_block(&self, miner: PubKeyHash) -> Result<Block> {
        let mut block = self.chain.new_block(miner, &[])?;
        if !block.mine(u32::MAX, self.chain.pow_limit())? {
            return Err(ConsensusError::InvalidProofOfWork(format!(
                "nonce space exhausted at height {}",
                self.chain.best().next()
            )));
        }
        let height = self.chain.link_block(&block)?;
        info!(height, txs = block.transactions.len(), "mined block");
        Ok(block)
    }

    /// Balance split at the next block height
    pub fn balance(&self, pkh: &PubKeyHash) -> Result<CoinsState> {
        self.chain.balance(pkh)
    }

    /// Build, sign and pool a transfer
    pub fn transfer(&self, builder: &TransferBuilder<'_>) -> Result<Hash> {
        let tx = builder.build(&self.chain)?;
        self.submit_transaction(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_node_in_memory() {
        let node = LedgerNode::in_memory(ChainConfig::regtest()).unwrap();
        assert!(node.chain().is_empty());
        assert!(node.pool().is_empty());
        assert_eq!(node.config().pool_capacity, ChainConfig::default().pool_capacity);
    }

    #[test]
    fn test_mine_block_pays_miner() {
        let node = LedgerNode::in_memory(ChainConfig::regtest()).unwrap();
        let miner = Account::new(1, 1, false).unwrap();
        let block = node.mine_block(miner.pkh()).unwrap();
        assert_eq!(node.chain().best().id, block.id());
        let state = node.balance(&miner.pkh()).unwrap();
        assert_eq!(state.sum, 50 * COIN);
        assert_eq!(state.matured, 0);
        assert_eq!(state.immature, 50 * COIN);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ChainConfig { pow_span: 0, ..ChainConfig::regtest() };
        assert!(LedgerNode::in_memory(config).is_err());
    }
}
