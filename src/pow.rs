//! Proof of work and difficulty retargeting

use crate::config::ChainConfig;
use crate::error::{ConsensusError, Result};
use crate::hash;
use crate::types::{Amount, Hash, Height};
use crate::uint256::U256;

/// Decode compact bits into a usable target
///
/// Rejects negative or overflowing encodings, a zero target, and any target
/// above the network floor `limit`.
pub fn check_pow_bits(bits: u32, limit: &U256) -> Result<U256> {
    let decoded = U256::from_compact(bits);
    if decoded.negative {
        return Err(ConsensusError::InvalidProofOfWork(format!("negative target bits {:#010x}", bits)));
    }
    if decoded.overflow {
        return Err(ConsensusError::InvalidProofOfWork(format!("overflowing target bits {:#010x}", bits)));
    }
    if decoded.target.is_zero() {
        return Err(ConsensusError::InvalidProofOfWork(format!("zero target bits {:#010x}", bits)));
    }
    if decoded.target > *limit {
        return Err(ConsensusError::InvalidProofOfWork(format!(
            "target bits {:#010x} above network limit",
            bits
        )));
    }
    Ok(decoded.target)
}

/// CheckProofOfWork: ℍ × ℕ → {valid, invalid}
///
/// Formula: U256(id) ≤ ExpandTarget(bits), with the id read as a
/// little-endian 256-bit number.
pub fn check_proof_of_work(id: &Hash, bits: u32, limit: &U256) -> Result<()> {
    let target = check_pow_bits(bits, limit)?;
    if U256::from_bytes(id) > target {
        return Err(ConsensusError::InvalidProofOfWork(format!(
            "hash {} above target {:#010x}",
            hash::to_hex(id),
            bits
        )));
    }
    Ok(())
}

/// Clamp elapsed seconds to [span/4, span*4]
pub fn clamp_timespan(elapsed: i64, span: u32) -> u64 {
    let min = (span / 4) as i64;
    let max = span as i64 * 4;
    elapsed.clamp(min, max) as u64
}

/// CalculateWorkRequired: ℕ × ℕ × ℕ → ℕ
///
/// 1. Let elapsed = clamp(current_time - reference_time, span/4, span*4)
/// 2. Let target = ExpandTarget(current_bits) × elapsed / span
/// 3. Return Compact(min(target, limit))
pub fn calculate_work_required(
    current_time: u32,
    reference_time: u32,
    current_bits: u32,
    config: &ChainConfig,
) -> Result<u32> {
    let limit = config.pow_limit()?;
    let span = config.pow_time;
    let elapsed = clamp_timespan(current_time as i64 - reference_time as i64, span);

    let current = check_pow_bits(current_bits, &limit)?;
    let (scaled, overflow) = current.overflowing_mul_u64(elapsed);
    let target = if overflow {
        limit
    } else {
        scaled
            .checked_div(&U256::from_u64(span as u64))
            .ok_or_else(|| ConsensusError::Config("pow_time is zero".to_string()))?
    };
    let target = if target > limit { limit } else { target };
    Ok(target.to_compact(false))
}

/// Easiest allowed bits: the network floor in compact form
pub fn min_pow_bits(config: &ChainConfig) -> Result<u32> {
    Ok(config.pow_limit()?.to_compact(false))
}

/// Whether the block at `height` starts a new retarget span
pub fn is_retarget_height(height: Height, config: &ChainConfig) -> bool {
    height > 0 && height % config.pow_span == 0
}

/// GetCoinbaseReward: ℕ → ℤ
///
/// Formula: initial_reward >> ⌊height / halving⌋, zero after 64 halvings
pub fn coinbase_reward(height: Height, config: &ChainConfig) -> Amount {
    let halvings = height / config.halving;
    if halvings >= 64 {
        return 0;
    }
    config.initial_reward >> halvings
}
