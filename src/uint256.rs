//! 256-bit unsigned integer for proof-of-work targets
//!
//! Little-endian limbs: `0[0]` holds the least significant 64 bits. Block
//! hashes are interpreted as little-endian 256-bit numbers, so
//! `U256::from_bytes(&id)` orders ids the same way the target does.

use crate::error::{ConsensusError, Result};
use crate::types::Hash;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct U256([u64; 4]);

/// Result of decoding a compact target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    pub negative: bool,
    pub overflow: bool,
}

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Number of significant bits
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }

        result
    }

    /// Wrapping addition
    pub fn wrapping_add(&self, other: &U256) -> U256 {
        let mut out = U256::zero();
        let mut carry = 0u128;
        for i in 0..4 {
            let n = self.0[i] as u128 + other.0[i] as u128 + carry;
            out.0[i] = n as u64;
            carry = n >> 64;
        }
        out
    }

    /// Wrapping subtraction
    pub fn wrapping_sub(&self, other: &U256) -> U256 {
        let mut out = U256::zero();
        let mut borrow = false;
        for i in 0..4 {
            let (d1, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (d2, b2) = d1.overflowing_sub(borrow as u64);
            out.0[i] = d2;
            borrow = b1 || b2;
        }
        out
    }

    /// Multiply by a u64, reporting whether the product overflowed 256 bits
    pub fn overflowing_mul_u64(&self, value: u64) -> (U256, bool) {
        let mut out = U256::zero();
        let mut carry = 0u128;
        for i in 0..4 {
            let n = self.0[i] as u128 * value as u128 + carry;
            out.0[i] = n as u64;
            carry = n >> 64;
        }
        (out, carry != 0)
    }

    /// Long division by shift-and-subtract
    pub fn checked_div(&self, divisor: &U256) -> Option<U256> {
        if divisor.is_zero() {
            return None;
        }
        let mut quotient = U256::zero();
        let nbits = self.bits();
        let dbits = divisor.bits();
        if dbits > nbits {
            return Some(quotient);
        }
        let mut num = *self;
        let mut shift = nbits - dbits;
        let mut div = divisor.shl(shift);
        loop {
            if num >= div {
                num = num.wrapping_sub(&div);
                quotient.0[(shift / 64) as usize] |= 1u64 << (shift % 64);
            }
            if shift == 0 {
                break;
            }
            div = div.shr(1);
            shift -= 1;
        }
        Some(quotient)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, &word) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &Hash) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut le = [0u8; 8];
            le.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(le);
        }
        U256(words)
    }

    /// Parse big-endian hex (most significant digit first), at most 64 digits
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim_start_matches("0x");
        if s.is_empty() || s.len() > 64 {
            return Err(ConsensusError::Config(format!("invalid 256-bit hex length: {}", s.len())));
        }
        let padded = format!("{:0>64}", s);
        let mut be = hex::decode(&padded)
            .map_err(|e| ConsensusError::Config(format!("invalid 256-bit hex: {}", e)))?;
        be.reverse();
        let mut le = [0u8; 32];
        le.copy_from_slice(&be);
        Ok(U256::from_bytes(&le))
    }

    /// Big-endian hex, 64 digits
    pub fn to_hex(&self) -> String {
        let mut be = self.to_bytes();
        be.reverse();
        hex::encode(be)
    }

    /// Decode the compact form: 1 byte exponent, 3 byte signed-magnitude mantissa
    ///
    /// target = mantissa * 256^(exponent - 3)
    pub fn from_compact(compact: u32) -> CompactTarget {
        let size = compact >> 24;
        let mut word = compact & 0x007fffff;
        let target = if size <= 3 {
            word >>= 8 * (3 - size);
            U256::from_u64(word as u64)
        } else {
            U256::from_u64(word as u64).shl(8 * (size - 3))
        };
        let negative = word != 0 && (compact & 0x00800000) != 0;
        let overflow = word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
        CompactTarget { target, negative, overflow }
    }

    /// Encode into compact form
    pub fn to_compact(&self, negative: bool) -> u32 {
        let mut size = (self.bits() + 7) / 8;
        let mut compact = if size <= 3 {
            self.low_u64() << (8 * (3 - size))
        } else {
            self.shr(8 * (size - 3)).low_u64()
        };
        // The mantissa sign bit is set: shift into the next exponent
        if compact & 0x00800000 != 0 {
            compact >>= 8;
            size += 1;
        }
        compact |= (size as u64) << 24;
        if negative && (compact & 0x007fffff) != 0 {
            compact |= 0x00800000;
        }
        compact as u32
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl std::fmt::Display for U256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero() {
        assert!(U256::zero().is_zero());
        assert_eq!(U256::zero().bits(), 0);
    }

    #[test]
    fn test_bits() {
        assert_eq!(U256::from_u64(1).bits(), 1);
        assert_eq!(U256::from_u64(0x80).bits(), 8);
        assert_eq!(U256::from_u64(1).shl(200).bits(), 201);
    }

    #[test]
    fn test_shl_shr_inverse() {
        let v = U256::from_u64(0x12345678);
        for shift in [0u32, 1, 8, 63, 64, 65, 127, 200] {
            assert_eq!(v.shl(shift).shr(shift), v, "shift {}", shift);
        }
    }

    #[test]
    fn test_shift_out_of_range() {
        let v = U256::from_u64(0x12345678);
        assert!(v.shl(300).is_zero());
        assert!(v.shr(300).is_zero());
    }

    #[test]
    fn test_add_sub_carry() {
        let a = U256::from_u64(u64::MAX);
        let b = U256::from_u64(1);
        let sum = a.wrapping_add(&b);
        assert_eq!(sum, U256::from_u64(1).shl(64));
        assert_eq!(sum.wrapping_sub(&b), a);
    }

    #[test]
    fn test_mul_div() {
        let a = U256::from_u64(0xffff).shl(208);
        let (m, overflow) = a.overflowing_mul_u64(3);
        assert!(!overflow);
        assert_eq!(m.checked_div(&U256::from_u64(3)).unwrap(), a);
    }

    #[test]
    fn test_mul_overflow_detected() {
        let (_, overflow) = U256::MAX.overflowing_mul_u64(2);
        assert!(overflow);
    }

    #[test]
    fn test_div_by_zero() {
        assert!(U256::from_u64(5).checked_div(&U256::zero()).is_none());
    }

    #[test]
    fn test_div_small() {
        let q = U256::from_u64(100).checked_div(&U256::from_u64(7)).unwrap();
        assert_eq!(q, U256::from_u64(14));
        let q = U256::from_u64(3).checked_div(&U256::from_u64(7)).unwrap();
        assert!(q.is_zero());
    }

    #[test]
    fn test_ordering() {
        let small = U256::from_u64(0x12345678);
        let large = U256::from_u64(1).shl(128);
        assert!(small < large);
        assert_eq!(small.cmp(&small), Ordering::Equal);
    }

    #[test]
    fn test_bytes_roundtrip_le() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x78;
        bytes[31] = 0x01;
        let v = U256::from_bytes(&bytes);
        assert_eq!(v.bits(), 249);
        assert_eq!(v.to_bytes(), bytes);
    }

    #[test]
    fn test_hex() {
        let v = U256::from_hex("00ffff").unwrap();
        assert_eq!(v, U256::from_u64(0xffff));
        assert!(U256::from_hex("").is_err());
        assert!(U256::from_hex("xyz").is_err());
        assert_eq!(U256::from_hex(&v.to_hex()).unwrap(), v);
    }

    // ============================================================================
    // COMPACT ENCODING
    // ============================================================================

    #[test]
    fn test_compact_classic_target() {
        let c = U256::from_compact(0x1d00ffff);
        assert!(!c.negative && !c.overflow);
        assert_eq!(c.target, U256::from_u64(0xffff).shl(8 * 26));
        assert_eq!(c.target.to_compact(false), 0x1d00ffff);
    }

    #[test]
    fn test_compact_small_exponent() {
        let c = U256::from_compact(0x01123456);
        assert_eq!(c.target, U256::from_u64(0x12));
        assert_eq!(c.target.to_compact(false), 0x01120000);
    }

    #[test]
    fn test_compact_negative() {
        let c = U256::from_compact(0x04923456);
        assert!(c.negative);
        assert_eq!(c.target.to_compact(true), 0x04923456);
    }

    #[test]
    fn test_compact_overflow() {
        let c = U256::from_compact(0xff123456);
        assert!(c.overflow);
    }

    #[test]
    fn test_compact_zero_mantissa() {
        let c = U256::from_compact(0x1d000000);
        assert!(c.target.is_zero());
        assert!(!c.negative && !c.overflow);
    }

    #[test]
    fn test_compact_sign_bit_moves_exponent() {
        // 0x80 needs a leading zero byte to stay positive
        let v = U256::from_u64(0x80);
        assert_eq!(v.to_compact(false), 0x02008000);
        assert_eq!(U256::from_compact(0x02008000).target, v);
    }

    #[test]
    fn test_compact_of_regtest_limit() {
        let limit = U256::from_hex(&format!("7f{}", "f".repeat(62))).unwrap();
        assert_eq!(limit.to_compact(false), 0x207fffff);
    }
}
