//! Byte-bounded LRU cache of decoded blocks and transactions

use crate::types::{Block, Hash, Transaction};
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum CacheEntry {
    Block(Arc<Block>),
    Tx(Arc<Transaction>),
}

struct Slot {
    entry: CacheEntry,
    size: usize,
}

struct Inner {
    lru: LruCache<Hash, Slot>,
    bytes: usize,
}

/// Decoded objects keyed by id, evicted by total encoded size
pub struct DecodeCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl DecodeCache {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(Inner { lru: LruCache::unbounded(), bytes: 0 }), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total encoded size of cached entries
    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, id: Hash, entry: CacheEntry, size: usize) {
        // Never admit an entry that alone exceeds the budget
        if size > self.capacity {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.put(id, Slot { entry, size }) {
            inner.bytes -= old.size;
        }
        inner.bytes += size;
        while inner.bytes > self.capacity {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => inner.bytes -= evicted.size,
                None => break,
            }
        }
    }

    pub fn put_block(&self, id: Hash, block: Arc<Block>, size: usize) {
        self.insert(id, CacheEntry::Block(block), size);
    }

    pub fn put_tx(&self, id: Hash, tx: Arc<Transaction>, size: usize) {
        self.insert(id, CacheEntry::Tx(tx), size);
    }

    pub fn get_block(&self, id: &Hash) -> Option<Arc<Block>> {
        match self.inner.lock().lru.get(id) {
            Some(Slot { entry: CacheEntry::Block(block), .. }) => Some(Arc::clone(block)),
            _ => None,
        }
    }

    pub fn get_tx(&self, id: &Hash) -> Option<Arc<Transaction>> {
        match self.inner.lock().lru.get(id) {
            Some(Slot { entry: CacheEntry::Tx(tx), .. }) => Some(Arc::clone(tx)),
            _ => None,
        }
    }

    pub fn remove(&self, id: &Hash) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.pop(id) {
            inner.bytes -= old.size;
        }
    }

    /// Drop a block and every transaction it carries
    pub fn remove_block(&self, id: &Hash, block: &Block) {
        self.remove(id);
        for tx in &block.transactions {
            self.remove(&tx.id());
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.bytes = 0;
    }
}
