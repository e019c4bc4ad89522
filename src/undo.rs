//! Reversible ledger mutations
//!
//! A block's ledger effect is recorded as a [`Changeset`]: the operations that
//! apply it and the operations that restore every touched key to its prior
//! value. Both lists are built together by [`LedgerBatch`] before anything is
//! written, so a failed validation simply drops the batch.

use crate::encoding::{write_varint, Decodable, Encodable, Reader};
use crate::error::Result;
use crate::storage::{BatchOperation, KeyValueStore};
use std::collections::HashMap;

/// Paired apply / undo operation lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    pub apply: Vec<BatchOperation>,
    pub undo: Vec<BatchOperation>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty()
    }
}

fn encode_ops(w: &mut Vec<u8>, ops: &[BatchOperation]) {
    write_varint(w, ops.len() as u64);
    for op in ops {
        op.encode(w);
    }
}

fn decode_ops(r: &mut Reader<'_>) -> Result<Vec<BatchOperation>> {
    let n = r.read_count(2)?;
    let mut ops = Vec::with_capacity(n);
    for _ in 0..n {
        ops.push(BatchOperation::decode(r)?);
    }
    Ok(ops)
}

impl Encodable for Changeset {
    fn encode(&self, w: &mut Vec<u8>) {
        encode_ops(w, &self.apply);
        encode_ops(w, &self.undo);
    }
}

impl Decodable for Changeset {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { apply: decode_ops(r)?, undo: decode_ops(r)? })
    }
}

/// Write overlay over a store that remembers each key's value before its first write
pub struct LedgerBatch<'a> {
    store: &'a dyn KeyValueStore,
    /// Pending value per key; `None` is a pending delete
    pending: HashMap<Vec<u8>, Option<Vec<u8>>>,
    /// Keys in first-touch order with their original value
    original: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    ops: Vec<BatchOperation>,
}

impl<'a> LedgerBatch<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store, pending: HashMap::new(), original: Vec::new(), ops: Vec::new() }
    }

    /// Read through the overlay
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.store.get(key),
        }
    }

    fn touch(&mut self, key: &[u8]) -> Result<()> {
        if !self.pending.contains_key(key) {
            let prior = self.store.get(key)?;
            self.original.push((key.to_vec(), prior));
        }
        Ok(())
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.touch(&key)?;
        self.pending.insert(key.clone(), Some(value.clone()));
        self.ops.push(BatchOperation::Put { key, value });
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) -> Result<()> {
        self.touch(&key)?;
        self.pending.insert(key.clone(), None);
        self.ops.push(BatchOperation::Delete { key });
        Ok(())
    }

    /// Finish recording: undo restores originals in reverse first-touch order
    pub fn into_changeset(self) -> Changeset {
        let undo = self
            .original
            .into_iter()
            .rev()
            .map(|(key, prior)| match prior {
                Some(value) => BatchOperation::Put { key, value },
                None => BatchOperation::Delete { key },
            })
            .collect();
        Changeset { apply: self.ops, undo }
    }
}
