//! Script families: coinbase, witness (multisig unlocking) and locked (pay-to-hash)
//!
//! Every script starts with a type byte:
//! - `0` coinbase: `[0][height u32][var ext]`
//! - `1` witness: `[1][num][less][arb][varint n][n × 33 pk][varint m][m × 64 sig]`
//! - `2` locked: `[2][pkh 20][var ext]`

use crate::constants::*;
use crate::encoding::{write_u32, write_var_bytes, write_varint, Decodable, Encodable, Reader};
use crate::error::{ConsensusError, Result};
use crate::hash::hash160;
use crate::keys::{parse_public_key, PubKeyBytes, SigBytes};
use crate::types::{ByteString, Hash, Height, PubKeyHash};
use serde::{Deserialize, Serialize};

pub const SCRIPT_COINBASE_TYPE: u8 = 0;
pub const SCRIPT_WITNESS_TYPE: u8 = 1;
pub const SCRIPT_LOCKED_TYPE: u8 = 2;

/// Raw script bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Script(ByteString);

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }
}

impl Script {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn script_type(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn is_coinbase(&self) -> bool {
        self.script_type() == Some(SCRIPT_COINBASE_TYPE)
    }

    pub fn is_witness(&self) -> bool {
        self.script_type() == Some(SCRIPT_WITNESS_TYPE)
    }

    pub fn is_locked(&self) -> bool {
        self.script_type() == Some(SCRIPT_LOCKED_TYPE)
    }

    pub fn coinbase(height: Height, ext: &[u8]) -> Result<Script> {
        let script = Script(CoinbaseScript { height, ext: ext.to_vec() }.to_bytes());
        script.to_coinbase()?;
        Ok(script)
    }

    pub fn locked(pkh: PubKeyHash, ext: &[u8]) -> Result<Script> {
        let locked = LockedScript { pkh, ext: ext.to_vec() };
        locked.check()?;
        Ok(Script(locked.to_bytes()))
    }

    pub fn to_coinbase(&self) -> Result<CoinbaseScript> {
        if !self.is_coinbase() {
            return Err(ConsensusError::ScriptMismatch("not a coinbase script".to_string()));
        }
        if self.len() < MIN_COINBASE_SCRIPT_SIZE || self.len() > MAX_COINBASE_SCRIPT_SIZE {
            return Err(ConsensusError::SizeLimitExceeded(format!(
                "coinbase script length {} outside [{}, {}]",
                self.len(),
                MIN_COINBASE_SCRIPT_SIZE,
                MAX_COINBASE_SCRIPT_SIZE
            )));
        }
        CoinbaseScript::from_bytes(&self.0)
    }

    pub fn to_witness(&self) -> Result<WitnessScript> {
        if !self.is_witness() {
            return Err(ConsensusError::ScriptMismatch("not a witness script".to_string()));
        }
        let witness = WitnessScript::from_bytes(&self.0)?;
        witness.check()?;
        Ok(witness)
    }

    pub fn to_locked(&self) -> Result<LockedScript> {
        if !self.is_locked() {
            return Err(ConsensusError::ScriptMismatch("not a locked script".to_string()));
        }
        let locked = LockedScript::from_bytes(&self.0)?;
        locked.check()?;
        Ok(locked)
    }

    /// Owner hash of a locked script
    pub fn pkh(&self) -> Result<PubKeyHash> {
        Ok(self.to_locked()?.pkh)
    }

    /// Form used for transaction identity: witness signatures removed
    pub fn for_id(&self) -> Script {
        match self.to_witness() {
            Ok(mut witness) => {
                witness.sigs.clear();
                Script(witness.to_bytes())
            }
            Err(_) => self.clone(),
        }
    }
}

/// Hash of a key set: identity of a witness script and of the account that owns it
pub fn hash_pks(num: u8, less: u8, arb: u8, pks: &[PubKeyBytes]) -> PubKeyHash {
    let mut data = Vec::with_capacity(3 + pks.len() * 33);
    data.push(num);
    data.push(less);
    data.push(arb);
    for pk in pks {
        data.extend_from_slice(pk);
    }
    hash160(&data)
}

/// Check (num, less, arb) shape
///
/// 1 ≤ less ≤ num ≤ 16; with arbitration, arb = num - 1, less < num and num ≥ 3
pub fn check_threshold(num: u8, less: u8, arb: u8) -> Result<()> {
    if less == 0 || less > num || num as usize > ACCOUNT_KEY_MAX_SIZE {
        return Err(ConsensusError::ScriptMismatch(format!(
            "invalid threshold num={} less={}",
            num, less
        )));
    }
    if arb != ARB_DISABLED && (num < 3 || less >= num || arb != num - 1) {
        return Err(ConsensusError::ScriptMismatch(format!(
            "invalid arbitration index {} for num={} less={}",
            arb, num, less
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseScript {
    pub height: Height,
    pub ext: ByteString,
}

impl Encodable for CoinbaseScript {
    fn encode(&self, w: &mut Vec<u8>) {
        w.push(SCRIPT_COINBASE_TYPE);
        write_u32(w, self.height);
        // A bare height needs no length prefix
        if !self.ext.is_empty() {
            write_var_bytes(w, &self.ext);
        }
    }
}

impl Decodable for CoinbaseScript {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_u8()?;
        let height = r.read_u32()?;
        let ext = if r.is_empty() { Vec::new() } else { r.read_var_bytes()? };
        Ok(Self { height, ext })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedScript {
    pub pkh: PubKeyHash,
    pub ext: ByteString,
}

impl LockedScript {
    pub fn check(&self) -> Result<()> {
        if self.ext.len() > MAX_EXT_SIZE {
            return Err(ConsensusError::SizeLimitExceeded(format!(
                "locked script ext {} bytes",
                self.ext.len()
            )));
        }
        Ok(())
    }
}

impl Encodable for LockedScript {
    fn encode(&self, w: &mut Vec<u8>) {
        w.push(SCRIPT_LOCKED_TYPE);
        w.extend_from_slice(&self.pkh);
        write_var_bytes(w, &self.ext);
    }
}

impl Decodable for LockedScript {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_u8()?;
        Ok(Self { pkh: r.read_array::<20>()?, ext: r.read_var_bytes()? })
    }
}

/// Multisig unlocking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessScript {
    pub num: u8,
    pub less: u8,
    pub arb: u8,
    pub pks: Vec<PubKeyBytes>,
    pub sigs: Vec<SigBytes>,
}

impl WitnessScript {
    pub fn arb_enabled(&self) -> bool {
        self.arb != ARB_DISABLED
    }

    pub fn check(&self) -> Result<()> {
        check_threshold(self.num, self.less, self.arb)?;
        if self.pks.len() != self.num as usize {
            return Err(ConsensusError::ScriptMismatch(format!(
                "witness carries {} keys, expected {}",
                self.pks.len(),
                self.num
            )));
        }
        if self.sigs.len() > self.num as usize {
            return Err(ConsensusError::ScriptMismatch(format!(
                "witness carries {} signatures for {} keys",
                self.sigs.len(),
                self.num
            )));
        }
        Ok(())
    }

    pub fn hash(&self) -> PubKeyHash {
        hash_pks(self.num, self.less, self.arb, &self.pks)
    }

    pub fn to_script(&self) -> Script {
        Script(self.to_bytes())
    }

    /// Walk keys and signatures in lock-step against `digest`
    ///
    /// 1. For each key k, test the next unconsumed signature
    /// 2. On success consume it and decrement the required count
    /// 3. A valid signature from the arbitration key satisfies the script alone
    /// 4. Stop when the count reaches zero or either list is exhausted
    pub fn verify(&self, digest: &Hash) -> Result<()> {
        self.check()?;
        let mut remaining = self.less as usize;
        let mut cursor = 0usize;
        for (k, pk) in self.pks.iter().enumerate() {
            if remaining == 0 || cursor >= self.sigs.len() {
                break;
            }
            let key = parse_public_key(pk, "witness key")?;
            if !key.verify(digest, &self.sigs[cursor]) {
                continue;
            }
            cursor += 1;
            remaining -= 1;
            if self.arb_enabled() && k == self.arb as usize {
                remaining = 0;
            }
        }
        if remaining > 0 {
            return Err(ConsensusError::InsufficientSignatures(format!(
                "{} of {} required signatures missing",
                remaining, self.less
            )));
        }
        Ok(())
    }
}

impl Encodable for WitnessScript {
    fn encode(&self, w: &mut Vec<u8>) {
        w.push(SCRIPT_WITNESS_TYPE);
        w.push(self.num);
        w.push(self.less);
        w.push(self.arb);
        write_varint(w, self.pks.len() as u64);
        for pk in &self.pks {
            w.extend_from_slice(pk);
        }
        write_varint(w, self.sigs.len() as u64);
        for sig in &self.sigs {
            w.extend_from_slice(sig);
        }
    }
}

impl Decodable for WitnessScript {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        r.read_u8()?;
        let num = r.read_u8()?;
        let less = r.read_u8()?;
        let arb = r.read_u8()?;
        let n = r.read_count(33)?;
        let mut pks = Vec::with_capacity(n);
        for _ in 0..n {
            pks.push(r.read_array::<33>()?);
        }
        let m = r.read_count(64)?;
        let mut sigs = Vec::with_capacity(m);
        for _ in 0..m {
            sigs.push(r.read_array::<64>()?);
        }
        Ok(Self { num, less, arb, pks, sigs })
    }
}
