//! Transaction identity and validation

use crate::coin::{CoinView, Utxo};
use crate::constants::*;
use crate::encoding::{write_u32, write_var_bytes, write_varint, Encodable};
use crate::error::{ConsensusError, Result};
use crate::hash::{hash256, to_hex};
use crate::sign::Signer;
use crate::types::*;
use std::collections::HashSet;

impl Transaction {
    /// Transaction identity: hash256 of the encoding with witness signatures removed
    pub fn id(&self) -> Hash {
        hash256(&self.id_bytes())
    }

    fn id_bytes(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(self.encoded_size());
        write_u32(&mut w, self.version);
        write_varint(&mut w, self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.encode(&mut w);
            write_var_bytes(&mut w, input.script_sig.for_id().as_bytes());
            write_u32(&mut w, input.sequence);
        }
        write_varint(&mut w, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(&mut w);
        }
        write_u32(&mut w, self.lock_time);
        w
    }

    /// Single input spending the null outpoint with a coinbase script
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null() && self.inputs[0].script_sig.is_coinbase()
    }

    /// Height recorded in a coinbase script
    pub fn coinbase_height(&self) -> Result<Height> {
        if !self.is_coinbase() {
            return Err(ConsensusError::TransactionValidation("not a coinbase transaction".to_string()));
        }
        Ok(self.inputs[0].script_sig.to_coinbase()?.height)
    }

    pub fn output_total(&self) -> Result<Amount> {
        sum_amounts(self.outputs.iter().map(|o| o.value))
    }
}

/// Sum amounts, each and the running total bounded by [0, MAX_MONEY]
pub fn sum_amounts(values: impl IntoIterator<Item = Amount>) -> Result<Amount> {
    let mut total: Amount = 0;
    for value in values {
        if !(0..=MAX_MONEY).contains(&value) {
            return Err(ConsensusError::AmountRange(format!("amount {} outside [0, MAX_MONEY]", value)));
        }
        total = total
            .checked_add(value)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or_else(|| ConsensusError::AmountRange("amount sum exceeds MAX_MONEY".to_string()))?;
    }
    Ok(total)
}

/// CheckTransaction (context free): 𝒯𝒳 → {valid, invalid}
///
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. No two inputs spend the same outpoint
/// 3. |tx| ≤ MAX_TX_SIZE
/// 4. ∀o ∈ outs: 0 ≤ o.value ≤ MAX_MONEY, and Σ o.value ≤ MAX_MONEY
/// 5. Coinbase script well formed; null outpoints only in a coinbase
pub fn check_structure(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(ConsensusError::TransactionValidation("no inputs".to_string()));
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::TransactionValidation("no outputs".to_string()));
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ConsensusError::TransactionValidation(format!(
                "input {}:{} spent twice",
                to_hex(&input.prevout.hash),
                input.prevout.index
            )));
        }
    }

    let size = tx.encoded_size();
    if size > MAX_TX_SIZE {
        return Err(ConsensusError::SizeLimitExceeded(format!("transaction {} bytes", size)));
    }

    tx.output_total()?;

    if tx.is_coinbase() {
        tx.inputs[0].script_sig.to_coinbase()?;
    } else if tx.inputs.iter().any(|i| i.prevout.is_null()) {
        return Err(ConsensusError::TransactionValidation("null outpoint outside coinbase".to_string()));
    }
    Ok(())
}

/// IsFinal: 𝒯𝒳 × ℕ × ℕ → {true, false}
///
/// Lock time 0 is final; below LOCKTIME_THRESHOLD it is a height, otherwise
/// a unix time. A transaction whose inputs all carry SEQUENCE_FINAL is final
/// regardless of lock time.
pub fn is_final(tx: &Transaction, height: Height, time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { time };
    if tx.lock_time < cutoff {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// Context for spending checks
#[derive(Debug, Clone, Copy)]
pub struct SpendContext {
    /// Height of the block that would include the transaction
    pub next_height: Height,
    /// Median time past of the current tip
    pub median_time: u32,
    /// Apply lock-time finality and relative sequence locks
    pub enforce_spend_check: bool,
}

/// Relative lock of one input against the coin it spends
///
/// Bit 31 disables; bit 22 selects a time lock of `value << 9` seconds over a
/// height lock of `value` blocks; the low 16 bits carry `value`.
pub fn check_sequence_lock(sequence: u32, utxo: &Utxo, view: &dyn CoinView, ctx: &SpendContext) -> Result<()> {
    if sequence & SEQUENCE_DISABLE_FLAG != 0 {
        return Ok(());
    }
    let value = sequence & SEQUENCE_MASK;
    if value == 0 {
        return Ok(());
    }
    let outpoint = utxo.coin.outpoint();
    let locked = |what: String| -> Result<()> {
        Err(ConsensusError::TransactionValidation(format!(
            "input {}:{} sequence locked: {}",
            to_hex(&outpoint.hash),
            outpoint.index,
            what
        )))
    };
    // Unconfirmed coins have no confirmation point to count from
    if utxo.coin.pool {
        return locked("spent coin unconfirmed".to_string());
    }
    if sequence & SEQUENCE_TYPE_FLAG != 0 {
        let base = view.block_time(utxo.coin.height).ok_or_else(|| {
            ConsensusError::CoinUnavailable(format!("no block time at height {}", utxo.coin.height))
        })?;
        let unlock = base as u64 + ((value as u64) << SEQUENCE_GRANULARITY);
        if (ctx.median_time as u64) < unlock {
            return locked(format!("median time {} before {}", ctx.median_time, unlock));
        }
    } else {
        let unlock = utxo.coin.height as u64 + value as u64;
        if (ctx.next_height as u64) < unlock {
            return locked(format!("height {} before {}", ctx.next_height, unlock));
        }
    }
    Ok(())
}

/// Resolve every input to a mature unspent output
pub fn resolve_inputs(tx: &Transaction, view: &dyn CoinView, spend_height: Height) -> Result<Vec<Utxo>> {
    tx.inputs
        .iter()
        .map(|input| {
            let utxo = view.utxo(&input.prevout)?.ok_or_else(|| {
                ConsensusError::CoinUnavailable(format!(
                    "{}:{} missing or spent",
                    to_hex(&input.prevout.hash),
                    input.prevout.index
                ))
            })?;
            if !utxo.coin.is_mature(spend_height) {
                return Err(ConsensusError::CoinUnavailable(format!(
                    "{}:{} immature at height {}",
                    to_hex(&input.prevout.hash),
                    input.prevout.index,
                    spend_height
                )));
            }
            Ok(utxo)
        })
        .collect()
}

/// CheckTransaction: 𝒯𝒳 × 𝒞𝒱 × ctx → ℤ (fee)
///
/// 1. Structural checks (see [`check_structure`])
/// 2. A coinbase carries no fee and no signatures: return 0
/// 3. If enforcing spend checks: finality and relative sequence locks
/// 4. Every input resolves to a mature coin; input and output sums in range
/// 5. Σ inputs ≥ Σ outputs; fee = difference
/// 6. Verify every input's witness against the coin it spends
pub fn check_transaction(tx: &Transaction, view: &dyn CoinView, ctx: &SpendContext) -> Result<Amount> {
    check_structure(tx)?;
    if tx.is_coinbase() {
        return Ok(0);
    }

    let utxos = resolve_inputs(tx, view, ctx.next_height)?;

    if ctx.enforce_spend_check {
        if !is_final(tx, ctx.next_height, ctx.median_time) {
            return Err(ConsensusError::TransactionValidation(format!(
                "lock time {} not reached",
                tx.lock_time
            )));
        }
        for (input, utxo) in tx.inputs.iter().zip(&utxos) {
            check_sequence_lock(input.sequence, utxo, view, ctx)?;
        }
    }

    let input_total = sum_amounts(utxos.iter().map(|u| u.output.value))?;
    let output_total = tx.output_total()?;
    if output_total > input_total {
        return Err(ConsensusError::AmountRange(format!(
            "outputs {} exceed inputs {}",
            output_total, input_total
        )));
    }

    let signer = Signer::new(tx);
    for (i, utxo) in utxos.iter().enumerate() {
        signer.verify(i, &utxo.output)?;
    }

    Ok(input_total - output_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::coin::Coin;
    use crate::script::Script;
    use crate::sign::sign_transaction;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestView {
        utxos: HashMap<OutPoint, Utxo>,
        times: HashMap<Height, u32>,
    }

    impl CoinView for TestView {
        fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
            Ok(self.utxos.get(outpoint).cloned())
        }

        fn block_time(&self, height: Height) -> Option<u32> {
            self.times.get(&height).copied()
        }
    }

    fn ctx(next_height: Height) -> SpendContext {
        SpendContext { next_height, median_time: 1_000_000, enforce_spend_check: true }
    }

    /// A view holding one coin of `value` owned by `account`, plus a signed spend of it
    fn funded(account: &Account, value: Amount, coinbase: bool, height: Height, pay: Amount) -> (TestView, Transaction) {
        let output = TransactionOutput { value, script_pubkey: account.locked_script(&[]).unwrap() };
        let outpoint = OutPoint::new([5u8; 32], 1);
        let utxo = Utxo::new(outpoint.hash, outpoint.index, &output, coinbase, height, false).unwrap();
        let mut view = TestView::default();
        view.utxos.insert(outpoint, utxo);
        view.times.insert(height, 500_000);
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TransactionInput { prevout: outpoint, script_sig: Script::default(), sequence: SEQUENCE_FINAL }],
            outputs: vec![TransactionOutput { value: pay, script_pubkey: account.locked_script(&[]).unwrap() }],
            lock_time: 0,
        };
        sign_transaction(&mut tx, &[output], &[account]).unwrap();
        (view, tx)
    }

    fn coinbase_tx(height: Height) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: Script::coinbase(height, &[]).unwrap(),
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value: 50 * COIN, script_pubkey: Script::locked([1u8; 20], &[]).unwrap() }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_id_excludes_signatures() {
        let account = Account::new(1, 1, false).unwrap();
        let (_, signed) = funded(&account, 1000, false, 1, 900);
        let mut unsigned = signed.clone();
        unsigned.inputs[0].script_sig = account.witness_script().to_script();
        assert_eq!(signed.id(), unsigned.id());
        assert_ne!(signed.to_bytes(), unsigned.to_bytes());
    }

    #[test]
    fn test_id_covers_outputs_and_lock_time() {
        let tx = coinbase_tx(1);
        let mut other = tx.clone();
        other.lock_time = 1;
        assert_ne!(tx.id(), other.id());
        let mut other = tx.clone();
        other.outputs[0].value -= 1;
        assert_ne!(tx.id(), other.id());
    }

    #[test]
    fn test_coinbase_detection() {
        let cb = coinbase_tx(3);
        assert!(cb.is_coinbase());
        assert_eq!(cb.coinbase_height().unwrap(), 3);
        check_structure(&cb).unwrap();
    }

    #[test]
    fn test_coinbase_check_returns_zero_fee() {
        let view = TestView::default();
        assert_eq!(check_transaction(&coinbase_tx(3), &view, &ctx(3)).unwrap(), 0);
    }

    // ============================================================================
    // STRUCTURE TESTS
    // ============================================================================

    #[test]
    fn test_no_inputs_rejected() {
        let mut tx = coinbase_tx(1);
        tx.inputs.clear();
        assert!(check_structure(&tx).is_err());
    }

    #[test]
    fn test_duplicate_inputs_rejected() {
        let account = Account::new(1, 1, false).unwrap();
        let (_, mut tx) = funded(&account, 1000, false, 1, 900);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(matches!(check_structure(&tx), Err(ConsensusError::TransactionValidation(_))));
    }

    #[test]
    fn test_negative_output_rejected() {
        let mut tx = coinbase_tx(1);
        tx.outputs[0].value = -1;
        assert!(matches!(check_structure(&tx), Err(ConsensusError::AmountRange(_))));
    }

    #[test]
    fn test_output_sum_overflow_rejected() {
        let mut tx = coinbase_tx(1);
        tx.outputs[0].value = MAX_MONEY;
        tx.outputs.push(tx.outputs[0].clone());
        assert!(matches!(check_structure(&tx), Err(ConsensusError::AmountRange(_))));
    }

    #[test]
    fn test_null_outpoint_outside_coinbase() {
        let mut tx = coinbase_tx(1);
        tx.inputs.push(TransactionInput {
            prevout: OutPoint::new([1u8; 32], 0),
            script_sig: Script::default(),
            sequence: 0,
        });
        assert!(check_structure(&tx).is_err());
    }

    // ============================================================================
    // SPEND TESTS
    // ============================================================================

    #[test]
    fn test_valid_spend_returns_fee() {
        let account = Account::new(2, 1, false).unwrap();
        let (view, tx) = funded(&account, 1000, false, 1, 900);
        assert_eq!(check_transaction(&tx, &view, &ctx(2)).unwrap(), 100);
    }

    #[test]
    fn test_missing_coin() {
        let account = Account::new(1, 1, false).unwrap();
        let (_, tx) = funded(&account, 1000, false, 1, 900);
        let empty = TestView::default();
        assert!(matches!(check_transaction(&tx, &empty, &ctx(2)), Err(ConsensusError::CoinUnavailable(_))));
    }

    #[test]
    fn test_immature_coinbase_spend() {
        let account = Account::new(1, 1, false).unwrap();
        let (view, tx) = funded(&account, 1000, true, 10, 900);
        assert!(matches!(check_transaction(&tx, &view, &ctx(109)), Err(ConsensusError::CoinUnavailable(_))));
        assert_eq!(check_transaction(&tx, &view, &ctx(110)).unwrap(), 100);
    }

    #[test]
    fn test_outputs_exceed_inputs() {
        let account = Account::new(1, 1, false).unwrap();
        let (view, tx) = funded(&account, 1000, false, 1, 1001);
        assert!(matches!(check_transaction(&tx, &view, &ctx(2)), Err(ConsensusError::AmountRange(_))));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let account = Account::new(1, 1, false).unwrap();
        let (view, mut tx) = funded(&account, 1000, false, 1, 900);
        tx.outputs[0].value = 800;
        assert!(matches!(
            check_transaction(&tx, &view, &ctx(2)),
            Err(ConsensusError::InsufficientSignatures(_))
        ));
    }

    // ============================================================================
    // LOCK TIME TESTS
    // ============================================================================

    #[test]
    fn test_is_final_height_and_time() {
        let mut tx = coinbase_tx(1);
        tx.inputs[0].sequence = 0;
        assert!(is_final(&tx, 0, 0));
        tx.lock_time = 10;
        assert!(!is_final(&tx, 10, 0));
        assert!(is_final(&tx, 11, 0));
        tx.lock_time = LOCKTIME_THRESHOLD + 100;
        assert!(!is_final(&tx, 1_000_000, LOCKTIME_THRESHOLD + 100));
        assert!(is_final(&tx, 0, LOCKTIME_THRESHOLD + 101));
        tx.inputs[0].sequence = SEQUENCE_FINAL;
        assert!(is_final(&tx, 0, 0));
    }

    fn utxo_at(height: Height, pool: bool) -> Utxo {
        Utxo {
            coin: Coin { pkh: [0u8; 20], txid: [1u8; 32], index: 0, value: 1, coinbase: false, height, pool },
            output: TransactionOutput { value: 1, script_pubkey: Script::default() },
        }
    }

    #[test]
    fn test_sequence_height_lock() {
        let view = TestView::default();
        let utxo = utxo_at(10, false);
        assert!(check_sequence_lock(5, &utxo, &view, &ctx(14)).is_err());
        check_sequence_lock(5, &utxo, &view, &ctx(15)).unwrap();
        check_sequence_lock(5 | SEQUENCE_DISABLE_FLAG, &utxo, &view, &ctx(11)).unwrap();
    }

    #[test]
    fn test_sequence_time_lock() {
        let mut view = TestView::default();
        view.times.insert(10, 1_000_000 - 1024);
        let utxo = utxo_at(10, false);
        // two units of 512 seconds
        check_sequence_lock(SEQUENCE_TYPE_FLAG | 2, &utxo, &view, &ctx(11)).unwrap();
        assert!(check_sequence_lock(SEQUENCE_TYPE_FLAG | 3, &utxo, &view, &ctx(11)).is_err());
    }

    #[test]
    fn test_sequence_lock_on_pool_coin() {
        let view = TestView::default();
        let utxo = utxo_at(0, true);
        check_sequence_lock(0, &utxo, &view, &ctx(1)).unwrap();
        assert!(check_sequence_lock(1, &utxo, &view, &ctx(1000)).is_err());
    }
}
