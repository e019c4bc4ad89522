//! Account key material mirroring a witness script's key set

use crate::constants::ARB_DISABLED;
use crate::error::{ConsensusError, Result};
use crate::hash::hash256;
use crate::keys::{PrivateKey, PubKeyBytes, PublicKey, SigBytes};
use crate::script::{check_threshold, hash_pks, Script, WitnessScript};
use crate::types::{Hash, PubKeyHash};
use serde::{Deserialize, Serialize};

/// Exported form: hex keys, missing private keys as null
#[derive(Serialize, Deserialize)]
struct AccountJson {
    num: u8,
    less: u8,
    arb: u8,
    pubs: Vec<String>,
    pris: Vec<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct Account {
    num: u8,
    less: u8,
    arb: u8,
    pubs: Vec<PublicKey>,
    /// Parallel to `pubs`; `None` where this holder lacks the private key
    pris: Vec<Option<PrivateKey>>,
}

impl Account {
    /// Generate `num` fresh key pairs requiring `less` signatures
    ///
    /// With `arb` set, the last key is the arbitration key.
    pub fn new(num: u8, less: u8, arb: bool) -> Result<Self> {
        let arb = if arb { num.saturating_sub(1) } else { ARB_DISABLED };
        let pris: Vec<PrivateKey> = (0..num).map(|_| PrivateKey::generate()).collect();
        let account = Self {
            num,
            less,
            arb,
            pubs: pris.iter().map(PrivateKey::public_key).collect(),
            pris: pris.into_iter().map(Some).collect(),
        };
        account.check()?;
        Ok(account)
    }

    pub fn check(&self) -> Result<()> {
        check_threshold(self.num, self.less, self.arb)?;
        if self.pubs.len() != self.num as usize || self.pris.len() != self.num as usize {
            return Err(ConsensusError::Key(format!(
                "account holds {} public keys, expected {}",
                self.pubs.len(),
                self.num
            )));
        }
        for (i, (pubk, pri)) in self.pubs.iter().zip(&self.pris).enumerate() {
            if let Some(pri) = pri {
                if pri.public_key() != *pubk {
                    return Err(ConsensusError::Key(format!("private key {} does not match its public key", i)));
                }
            }
        }
        Ok(())
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    pub fn less(&self) -> u8 {
        self.less
    }

    pub fn arb(&self) -> u8 {
        self.arb
    }

    /// Copy holding only the private keys at `indices`
    pub fn retain_keys(&self, indices: &[usize]) -> Self {
        let mut account = self.clone();
        for (i, pri) in account.pris.iter_mut().enumerate() {
            if !indices.contains(&i) {
                *pri = None;
            }
        }
        account
    }

    pub fn has_private(&self, index: usize) -> bool {
        matches!(self.pris.get(index), Some(Some(_)))
    }

    /// Whether the held private keys can satisfy the witness script
    pub fn can_sign(&self) -> bool {
        let held = self.pris.iter().filter(|p| p.is_some()).count();
        held >= self.less as usize || (self.arb != ARB_DISABLED && self.has_private(self.arb as usize))
    }

    pub fn pks(&self) -> Vec<PubKeyBytes> {
        self.pubs.iter().map(PublicKey::to_bytes).collect()
    }

    /// Address: hash of (num, less, arb, pubkeys)
    pub fn pkh(&self) -> PubKeyHash {
        hash_pks(self.num, self.less, self.arb, &self.pks())
    }

    pub fn witness_script(&self) -> WitnessScript {
        WitnessScript { num: self.num, less: self.less, arb: self.arb, pks: self.pks(), sigs: Vec::new() }
    }

    pub fn locked_script(&self, ext: &[u8]) -> Result<Script> {
        Script::locked(self.pkh(), ext)
    }

    /// Sign with the key at `index`
    pub fn sign(&self, index: usize, digest: &Hash) -> Result<SigBytes> {
        match self.pris.get(index) {
            Some(Some(pri)) => pri.sign(digest),
            Some(None) => Err(ConsensusError::Key(format!("private key {} not held", index))),
            None => Err(ConsensusError::Key(format!("key index {} out of range", index))),
        }
    }

    /// Witness script carrying a signature from every held private key, in key order
    pub fn sign_witness(&self, digest: &Hash) -> Result<WitnessScript> {
        let mut witness = self.witness_script();
        for (i, pri) in self.pris.iter().enumerate() {
            if pri.is_some() {
                witness.sigs.push(self.sign(i, digest)?);
            }
        }
        Ok(witness)
    }

    /// Export as hex(JSON ‖ first 4 bytes of hash256(JSON))
    pub fn dump(&self) -> Result<String> {
        let json = AccountJson {
            num: self.num,
            less: self.less,
            arb: self.arb,
            pubs: self.pubs.iter().map(|p| hex::encode(p.to_bytes())).collect(),
            pris: self.pris.iter().map(|p| p.as_ref().map(|k| hex::encode(k.to_bytes()))).collect(),
        };
        let mut data = serde_json::to_vec(&json).map_err(|e| ConsensusError::Serialization(e.to_string()))?;
        let checksum = hash256(&data);
        data.extend_from_slice(&checksum[..4]);
        Ok(hex::encode(data))
    }

    pub fn load(s: &str) -> Result<Self> {
        let data = hex::decode(s).map_err(|e| ConsensusError::Serialization(format!("account hex: {}", e)))?;
        if data.len() < 4 {
            return Err(ConsensusError::Serialization("account dump too short".to_string()));
        }
        let (body, checksum) = data.split_at(data.len() - 4);
        if hash256(body)[..4] != *checksum {
            return Err(ConsensusError::Serialization("account checksum mismatch".to_string()));
        }
        let json: AccountJson =
            serde_json::from_slice(body).map_err(|e| ConsensusError::Serialization(e.to_string()))?;
        let pubs = json
            .pubs
            .iter()
            .map(|s| {
                let bytes = hex::decode(s).map_err(|e| ConsensusError::Key(e.to_string()))?;
                PublicKey::from_bytes(&bytes)
            })
            .collect::<Result<Vec<_>>>()?;
        let pris = json
            .pris
            .iter()
            .map(|p| match p {
                None => Ok(None),
                Some(s) => {
                    let bytes = hex::decode(s).map_err(|e| ConsensusError::Key(e.to_string()))?;
                    PrivateKey::from_bytes(&bytes).map(Some)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let account = Self { num: json.num, less: json.less, arb: json.arb, pubs, pris };
        account.check()?;
        Ok(account)
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.less, self.num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account() {
        let account = Account::new(3, 2, false).unwrap();
        assert_eq!(account.arb(), ARB_DISABLED);
        assert!(account.can_sign());
        assert_eq!(account.to_string(), "2-3");
    }

    #[test]
    fn test_new_account_with_arbiter() {
        let account = Account::new(3, 2, true).unwrap();
        assert_eq!(account.arb(), 2);
    }

    #[test]
    fn test_new_account_invalid_shape() {
        assert!(Account::new(0, 1, false).is_err());
        assert!(Account::new(2, 3, false).is_err());
        assert!(Account::new(17, 1, false).is_err());
        assert!(Account::new(2, 1, true).is_err());
    }

    #[test]
    fn test_pkh_matches_witness_hash() {
        let account = Account::new(2, 1, false).unwrap();
        assert_eq!(account.pkh(), account.witness_script().hash());
        assert_eq!(account.locked_script(&[]).unwrap().pkh().unwrap(), account.pkh());
    }

    #[test]
    fn test_pkh_depends_on_threshold() {
        let a = Account::new(3, 2, false).unwrap();
        let mut b = a.clone();
        b.less = 1;
        assert_ne!(a.pkh(), b.pkh());
    }

    #[test]
    fn test_retain_keys_limits_signing() {
        let account = Account::new(3, 2, false).unwrap();
        let partial = account.retain_keys(&[1]);
        assert!(!partial.can_sign());
        assert!(partial.sign(0, &[1u8; 32]).is_err());
        assert!(partial.sign(1, &[1u8; 32]).is_ok());
        assert_eq!(partial.pkh(), account.pkh());
    }

    #[test]
    fn test_arbiter_alone_can_sign() {
        let account = Account::new(3, 2, true).unwrap().retain_keys(&[2]);
        assert!(account.can_sign());
    }

    #[test]
    fn test_sign_witness_verifies() {
        let account = Account::new(3, 2, false).unwrap();
        let digest = [5u8; 32];
        let witness = account.sign_witness(&digest).unwrap();
        assert_eq!(witness.sigs.len(), 3);
        witness.verify(&digest).unwrap();
    }

    #[test]
    fn test_dump_load() {
        let account = Account::new(3, 2, true).unwrap().retain_keys(&[0, 2]);
        let dumped = account.dump().unwrap();
        let loaded = Account::load(&dumped).unwrap();
        assert_eq!(loaded.pkh(), account.pkh());
        assert!(loaded.has_private(0));
        assert!(!loaded.has_private(1));
        assert!(loaded.has_private(2));
    }

    #[test]
    fn test_load_rejects_bad_checksum() {
        let account = Account::new(1, 1, false).unwrap();
        let mut dumped = account.dump().unwrap();
        let last = dumped.pop().unwrap();
        dumped.push(if last == '0' { '1' } else { '0' });
        assert!(matches!(Account::load(&dumped), Err(ConsensusError::Serialization(_))));
    }
}
