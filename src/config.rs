//! Per-network chain parameters

use crate::constants::COIN;
use crate::error::{ConsensusError, Result};
use crate::hash;
use crate::types::{Amount, Hash};
use crate::uint256::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Largest permitted target, big-endian hex
    pub pow_limit: String,
    /// Blocks between difficulty retargets
    pub pow_span: u32,
    /// Expected seconds per retarget span
    pub pow_time: u32,
    /// Reward halving interval in blocks
    pub halving: u32,
    pub initial_reward: Amount,
    /// Fixed genesis id (display hex); any zero-prev header is accepted when absent
    pub genesis: Option<String>,
    /// Decode cache capacity in bytes
    pub cache_bytes: usize,
    /// Maximum mempool entries
    pub pool_capacity: usize,
    /// Chunk file rotation size in bytes
    pub chunk_file_size: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            pow_limit: format!("00{}", "f".repeat(62)),
            pow_span: 2016,
            pow_time: 2016 * 600,
            halving: 210_000,
            initial_reward: 50 * COIN,
            genesis: None,
            cache_bytes: 64 * 1024 * 1024,
            pool_capacity: 10_000,
            chunk_file_size: 128 * 1024 * 1024,
        }
    }
}

impl ChainConfig {
    /// Trivial difficulty for local testing
    pub fn regtest() -> Self {
        Self {
            pow_limit: format!("7f{}", "f".repeat(62)),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: ChainConfig = serde_json::from_str(json)
            .map_err(|e| ConsensusError::Config(format!("invalid config json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConsensusError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.pow_limit()?.is_zero() {
            return Err(ConsensusError::Config("pow_limit is zero".to_string()));
        }
        if self.pow_span == 0 || self.pow_time == 0 {
            return Err(ConsensusError::Config("pow_span and pow_time must be non-zero".to_string()));
        }
        if self.halving == 0 {
            return Err(ConsensusError::Config("halving must be non-zero".to_string()));
        }
        if self.initial_reward < 0 || self.initial_reward > crate::constants::MAX_MONEY {
            return Err(ConsensusError::Config(format!("initial_reward {} out of range", self.initial_reward)));
        }
        if self.cache_bytes == 0 || self.pool_capacity == 0 || self.chunk_file_size == 0 {
            return Err(ConsensusError::Config("capacities must be non-zero".to_string()));
        }
        self.genesis_id()?;
        Ok(())
    }

    pub fn pow_limit(&self) -> Result<U256> {
        U256::from_hex(&self.pow_limit)
    }

    pub fn genesis_id(&self) -> Result<Option<Hash>> {
        match &self.genesis {
            None => Ok(None),
            Some(s) => hash::from_hex(s)
                .map(Some)
                .ok_or_else(|| ConsensusError::Config(format!("invalid genesis id: {}", s))),
        }
    }
}
