//! Chain lifecycle events and their observers

use crate::hash::to_hex;
use crate::types::{Hash, Height};
use tracing::info;

/// Lifecycle events raised by the chain index and mempool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A candidate block was assembled on the best tip
    BlockCreated { height: Height, txs: usize },
    /// A header was appended to the header chain
    HeaderLinked { id: Hash, height: Height },
    /// A block body was validated and its ledger changes committed
    BlockLinked { id: Hash, height: Height, txs: usize },
    /// The tip was reverted and removed
    BlockUnlinked { id: Hash, height: Height },
    /// A transaction entered the mempool
    TxAdmitted { id: Hash },
}

pub trait ChainListener: Send + Sync {
    fn on_event(&self, event: &ChainEvent);
}

/// Logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl ChainListener for TracingListener {
    fn on_event(&self, event: &ChainEvent) {
        match event {
            ChainEvent::BlockCreated { height, txs } => info!(height, txs, "block created"),
            ChainEvent::HeaderLinked { id, height } => info!(id = %to_hex(id), height, "header linked"),
            ChainEvent::BlockLinked { id, height, txs } => {
                info!(id = %to_hex(id), height, txs, "block linked")
            }
            ChainEvent::BlockUnlinked { id, height } => info!(id = %to_hex(id), height, "block unlinked"),
            ChainEvent::TxAdmitted { id } => info!(id = %to_hex(id), "transaction admitted"),
        }
    }
}

/// Ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ChainListener for NoopListener {
    fn on_event(&self, _event: &ChainEvent) {}
}
