//! Coin (UTXO) records, maturity and balance aggregation

use crate::constants::COINBASE_MATURITY;
use crate::encoding::{write_var_bytes, write_varint, Encodable, Reader};
use crate::error::{ConsensusError, Result};
use crate::script::Script;
use crate::types::{Amount, Hash, Height, OutPoint, PubKeyHash, TransactionOutput};
use serde::{Deserialize, Serialize};

/// A spendable output owned by `pkh`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub pkh: PubKeyHash,
    pub txid: Hash,
    pub index: u32,
    pub value: Amount,
    pub coinbase: bool,
    /// Creating block height; meaningless for pool coins
    pub height: Height,
    /// Created by a pooled, unconfirmed transaction
    #[serde(default)]
    pub pool: bool,
}

impl Coin {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.index)
    }

    /// IsMature: 𝒞 × ℕ → {true, false}
    ///
    /// Pool coins and confirmed non-coinbase coins are always mature; a
    /// coinbase coin needs spend_height - height ≥ COINBASE_MATURITY.
    pub fn is_mature(&self, spend_height: Height) -> bool {
        if self.pool || !self.coinbase {
            return true;
        }
        spend_height >= self.height && spend_height - self.height >= COINBASE_MATURITY
    }

    /// Value part of the owner-index record: varint amount, coinbase flag, varint height
    pub fn encode_value(&self, w: &mut Vec<u8>) {
        write_varint(w, self.value.max(0) as u64);
        w.push(self.coinbase as u8);
        write_varint(w, self.height as u64);
    }

    pub fn decode_value(pkh: PubKeyHash, outpoint: OutPoint, r: &mut Reader<'_>) -> Result<Self> {
        let value = r.read_varint()?;
        let coinbase = match r.read_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(ConsensusError::Serialization(format!("invalid coinbase flag {}", other)));
            }
        };
        let height = r.read_varint_u32()?;
        Ok(Self {
            pkh,
            txid: outpoint.hash,
            index: outpoint.index,
            value: value as Amount,
            coinbase,
            height,
            pool: false,
        })
    }
}

/// A coin together with the output that created it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub coin: Coin,
    pub output: TransactionOutput,
}

impl Utxo {
    /// Unspent record for output `index` of transaction `txid`
    pub fn new(txid: Hash, index: u32, output: &TransactionOutput, coinbase: bool, height: Height, pool: bool) -> Result<Self> {
        let pkh = output.script_pubkey.pkh()?;
        Ok(Self {
            coin: Coin { pkh, txid, index, value: output.value, coinbase, height, pool },
            output: output.clone(),
        })
    }
}

impl Encodable for Utxo {
    fn encode(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.coin.pkh);
        self.coin.encode_value(w);
        write_var_bytes(w, self.output.script_pubkey.as_bytes());
    }
}

impl Utxo {
    /// Decode a confirmed record stored under `outpoint`
    pub fn decode_at(outpoint: OutPoint, bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let pkh = r.read_array::<20>()?;
        let coin = Coin::decode_value(pkh, outpoint, &mut r)?;
        let script = Script::from(r.read_var_bytes()?);
        r.finish()?;
        let output = TransactionOutput { value: coin.value, script_pubkey: script };
        Ok(Self { coin, output })
    }
}

/// Read access to spendable outputs, used by transaction validation
pub trait CoinView {
    /// Unspent output at `outpoint`, if any
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>>;

    /// Timestamp of the block at `height` on the active chain
    fn block_time(&self, height: Height) -> Option<u32>;
}

/// Amount breakdown at a given spend height
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinsState {
    /// Spendable now
    pub matured: Amount,
    /// Confirmed coinbase still maturing
    pub immature: Amount,
    /// Created by pooled transactions
    pub pool: Amount,
    pub sum: Amount,
}

impl std::fmt::Display for CoinsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "matured = {}, immature = {}, pool = {}, sum = {}",
            self.matured, self.immature, self.pool, self.sum
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coins(pub Vec<Coin>);

impl Coins {
    pub fn balance(&self) -> Amount {
        self.0.iter().map(|c| c.value).sum()
    }

    pub fn state(&self, spend_height: Height) -> CoinsState {
        let mut state = CoinsState::default();
        for coin in &self.0 {
            if coin.pool {
                state.pool += coin.value;
            } else if coin.is_mature(spend_height) {
                state.matured += coin.value;
            } else {
                state.immature += coin.value;
            }
            state.sum += coin.value;
        }
        state
    }

    /// Coins spendable at `spend_height`, pool coins included
    pub fn matured(&self, spend_height: Height) -> Vec<&Coin> {
        self.0.iter().filter(|c| c.is_mature(spend_height)).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coin> {
        self.0.iter()
    }
}

impl From<Vec<Coin>> for Coins {
    fn from(coins: Vec<Coin>) -> Self {
        Coins(coins)
    }
}
