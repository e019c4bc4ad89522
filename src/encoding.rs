//! Binary record encoding
//!
//! All persisted and wire records use the same scheme:
//! - fixed-width integers are little-endian
//! - counts and amounts are continuation-bit varints (7 bits per byte, low group first)
//! - hashes are raw 32 or 20 byte arrays
//! - byte strings are a varint length followed by the bytes

use crate::error::{ConsensusError, Result};

/// Longest varint accepted for a u64
const MAX_VARINT_LEN: usize = 10;

/// Types with a canonical binary encoding
pub trait Encodable {
    fn encode(&self, w: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = Vec::new();
        self.encode(&mut w);
        w
    }

    fn encoded_size(&self) -> usize {
        self.to_bytes().len()
    }
}

/// Types that can be decoded from their canonical encoding
pub trait Decodable: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self>;

    /// Decode a whole record, rejecting trailing bytes
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let value = Self::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

/// Write a continuation-bit varint
pub fn write_varint(w: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        w.push((value as u8) | 0x80);
        value >>= 7;
    }
    w.push(value as u8);
}

/// Write a length-prefixed byte string
pub fn write_var_bytes(w: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(w, bytes.len() as u64);
    w.extend_from_slice(bytes);
}

pub fn write_u32(w: &mut Vec<u8>, value: u32) {
    w.extend_from_slice(&value.to_le_bytes());
}

/// Cursor over an encoded record
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail unless every byte was consumed
    pub fn finish(&self) -> Result<()> {
        if !self.is_empty() {
            return Err(ConsensusError::Serialization(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ConsensusError::Serialization(format!(
                "unexpected end of data: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let group = (byte & 0x7f) as u64;
            // The tenth byte may only carry the top bit of a u64
            if i == MAX_VARINT_LEN - 1 && group > 1 {
                return Err(ConsensusError::Serialization("varint overflow".to_string()));
            }
            value |= group << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ConsensusError::Serialization("varint too long".to_string()))
    }

    /// Read a varint that must fit in u32
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let value = self.read_varint()?;
        u32::try_from(value)
            .map_err(|_| ConsensusError::Serialization(format!("varint {} exceeds u32", value)))
    }

    /// Read a collection count, bounded by what the remaining input could possibly hold
    pub fn read_count(&mut self, min_item_size: usize) -> Result<usize> {
        let count = self.read_varint()? as usize;
        if count.saturating_mul(min_item_size.max(1)) > self.remaining() {
            return Err(ConsensusError::Serialization(format!(
                "count {} exceeds remaining input",
                count
            )));
        }
        Ok(count)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count(1)?;
        Ok(self.read_bytes(len)?.to_vec())
    }
}
