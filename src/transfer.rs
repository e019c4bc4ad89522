//! Building signed transfers from account coins

use crate::account::Account;
use crate::chain::ChainIndex;
use crate::coin::Coin;
use crate::constants::SEQUENCE_FINAL;
use crate::error::{ConsensusError, Result};
use crate::hash::to_hex;
use crate::script::Script;
use crate::sign::sign_transaction;
use crate::transaction::sum_amounts;
use crate::types::*;
use tracing::debug;

/// Pays destinations from the coins of one or more accounts
///
/// Only accounts whose held keys can satisfy their witness script are
/// spent from. Change goes to the account at `keep`.
#[derive(Debug, Clone)]
pub struct TransferBuilder<'a> {
    accounts: Vec<&'a Account>,
    destinations: Vec<(PubKeyHash, Amount)>,
    keep: usize,
    fee: Amount,
    ext: Vec<u8>,
    sequence: u32,
    lock_time: u32,
}

impl<'a> TransferBuilder<'a> {
    pub fn new() -> Self {
        Self {
            accounts: Vec::new(),
            destinations: Vec::new(),
            keep: 0,
            fee: 0,
            ext: Vec::new(),
            sequence: SEQUENCE_FINAL,
            lock_time: 0,
        }
    }

    pub fn from_account(mut self, account: &'a Account) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn pay(mut self, to: PubKeyHash, amount: Amount) -> Self {
        self.destinations.push((to, amount));
        self
    }

    /// Index into the source accounts receiving the change
    pub fn keep(mut self, index: usize) -> Self {
        self.keep = index;
        self
    }

    pub fn fee(mut self, fee: Amount) -> Self {
        self.fee = fee;
        self
    }

    /// Extension payload carried by every destination output
    pub fn ext(mut self, ext: &[u8]) -> Self {
        self.ext = ext.to_vec();
        self
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn lock_time(mut self, lock_time: u32) -> Self {
        self.lock_time = lock_time;
        self
    }

    /// Select coins, build outputs and sign every input
    ///
    /// 1. need = Σ destinations + fee
    /// 2. Walk the signing accounts' unclaimed coins mature at the next
    ///    height until their sum covers need
    /// 3. Outputs: destinations, then change to `keep` if non-zero
    pub fn build(&self, chain: &ChainIndex) -> Result<Transaction> {
        if self.destinations.is_empty() {
            return Err(ConsensusError::TransactionValidation("transfer has no destinations".to_string()));
        }
        let change_to = self
            .accounts
            .get(self.keep)
            .ok_or_else(|| ConsensusError::Key(format!("change account {} out of range", self.keep)))?
            .pkh();
        let need = sum_amounts(self.destinations.iter().map(|(_, v)| *v).chain(std::iter::once(self.fee)))?;

        let spend_height = chain.best().next();
        let mut selected: Vec<(Coin, &Account)> = Vec::new();
        let mut total: Amount = 0;
        'accounts: for account in self.accounts.iter().copied().filter(|a| a.can_sign()) {
            let coins = chain.list_coins(&account.pkh())?;
            for coin in coins.matured(spend_height) {
                if total >= need {
                    break 'accounts;
                }
                total = sum_amounts([total, coin.value])?;
                selected.push((coin.clone(), account));
            }
        }
        if total < need {
            return Err(ConsensusError::CoinUnavailable(format!("spendable {} below required {}", total, need)));
        }

        let mut outputs = Vec::with_capacity(self.destinations.len() + 1);
        for (to, amount) in &self.destinations {
            outputs.push(TransactionOutput { value: *amount, script_pubkey: Script::locked(*to, &self.ext)? });
        }
        if total > need {
            outputs.push(TransactionOutput { value: total - need, script_pubkey: Script::locked(change_to, &[])? });
        }

        let mut spent = Vec::with_capacity(selected.len());
        for (coin, _) in &selected {
            let outpoint = coin.outpoint();
            let utxo = match chain.utxo(&outpoint)? {
                Some(utxo) => utxo,
                None => chain.pool().output(&outpoint).ok_or_else(|| {
                    ConsensusError::CoinUnavailable(format!("{}:{} vanished", to_hex(&outpoint.hash), outpoint.index))
                })?,
            };
            spent.push(utxo.output);
        }

        let mut tx = Transaction {
            version: 1,
            inputs: selected
                .iter()
                .map(|(coin, _)| TransactionInput {
                    prevout: coin.outpoint(),
                    script_sig: Script::default(),
                    sequence: self.sequence,
                })
                .collect(),
            outputs,
            lock_time: self.lock_time,
        };
        let signers: Vec<&Account> = selected.iter().map(|(_, account)| *account).collect();
        sign_transaction(&mut tx, &spent, &signers)?;
        debug!(id = %to_hex(&tx.id()), inputs = tx.inputs.len(), fee = self.fee, "built transfer");
        Ok(tx)
    }
}

impl Default for TransferBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}
