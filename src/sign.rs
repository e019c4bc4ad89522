//! Signature hash and per-input signing / verification

use crate::account::Account;
use crate::encoding::{write_u32, write_var_bytes, write_varint, Encodable};
use crate::error::{ConsensusError, Result};
use crate::hash::{hash256, to_hex};
use crate::types::{Hash, Transaction, TransactionOutput};

/// Sub-hashes shared by every input's signature hash
///
/// Holds a shared borrow of the transaction, so the cached hashes cannot
/// outlive a structural change to it.
pub struct SigHashCache<'a> {
    tx: &'a Transaction,
    inputs_hash: Hash,
    outputs_hash: Hash,
}

impl<'a> SigHashCache<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        let mut inputs = Vec::with_capacity(tx.inputs.len() * 33);
        for input in &tx.inputs {
            input.prevout.encode(&mut inputs);
        }
        let mut outputs = Vec::new();
        for output in &tx.outputs {
            output.encode(&mut outputs);
        }
        Self { tx, inputs_hash: hash256(&inputs), outputs_hash: hash256(&outputs) }
    }

    pub fn transaction(&self) -> &'a Transaction {
        self.tx
    }

    /// SignatureHash: 𝒯𝒳 × ℕ × 𝒯 → ℍ
    ///
    /// hash256(version ‖ H(input refs) ‖ this input ref ‖ this input's script for id
    ///         ‖ spent output script ‖ spent output amount ‖ H(outputs))
    pub fn signature_hash(&self, index: usize, spent: &TransactionOutput) -> Result<Hash> {
        let input = self.tx.inputs.get(index).ok_or_else(|| {
            ConsensusError::TransactionValidation(format!("input index {} out of range", index))
        })?;
        let mut data = Vec::with_capacity(256);
        write_u32(&mut data, self.tx.version);
        data.extend_from_slice(&self.inputs_hash);
        input.prevout.encode(&mut data);
        write_var_bytes(&mut data, input.script_sig.for_id().as_bytes());
        write_var_bytes(&mut data, spent.script_pubkey.as_bytes());
        write_varint(&mut data, spent.value.max(0) as u64);
        data.extend_from_slice(&self.outputs_hash);
        Ok(hash256(&data))
    }
}

/// Verifies inputs of one transaction, sharing a single sighash cache
pub struct Signer<'a> {
    cache: SigHashCache<'a>,
}

impl<'a> Signer<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self { cache: SigHashCache::new(tx) }
    }

    /// Verify input `index` against the output it spends
    ///
    /// 1. Decode the witness script and check its shape
    /// 2. Require hash(witness keys) == owner hash of the spent output
    /// 3. Walk signatures against the signature hash
    pub fn verify(&self, index: usize, spent: &TransactionOutput) -> Result<()> {
        let tx = self.cache.transaction();
        let input = tx.inputs.get(index).ok_or_else(|| {
            ConsensusError::TransactionValidation(format!("input index {} out of range", index))
        })?;
        let witness = input.script_sig.to_witness()?;
        let pkh = spent.script_pubkey.pkh()?;
        if witness.hash() != pkh {
            return Err(ConsensusError::ScriptMismatch(format!(
                "input {} witness does not match output of {}",
                index,
                to_hex(&input.prevout.hash)
            )));
        }
        let digest = self.cache.signature_hash(index, spent)?;
        witness.verify(&digest)
    }
}

/// Sign every input of `tx`: `spent[i]` is the output input `i` spends and
/// `accounts[i]` the account owning it
pub fn sign_transaction(tx: &mut Transaction, spent: &[TransactionOutput], accounts: &[&Account]) -> Result<()> {
    if spent.len() != tx.inputs.len() || accounts.len() != tx.inputs.len() {
        return Err(ConsensusError::TransactionValidation(format!(
            "{} inputs but {} spent outputs and {} accounts",
            tx.inputs.len(),
            spent.len(),
            accounts.len()
        )));
    }
    for (i, (out, account)) in spent.iter().zip(accounts).enumerate() {
        if out.script_pubkey.pkh()? != account.pkh() {
            return Err(ConsensusError::ScriptMismatch(format!("input {} is not owned by the signing account", i)));
        }
        tx.inputs[i].script_sig = account.witness_script().to_script();
    }
    let digests = {
        let cache = SigHashCache::new(tx);
        (0..spent.len())
            .map(|i| cache.signature_hash(i, &spent[i]))
            .collect::<Result<Vec<_>>>()?
    };
    for (i, digest) in digests.iter().enumerate() {
        tx.inputs[i].script_sig = accounts[i].sign_witness(digest)?.to_script();
    }
    Ok(())
}
