//! Bit-addressable buffer backing cell content.
//!
//! A BitBuffer has a fixed capacity in bits, a write length that grows with
//! every append, and an independent read cursor. Bits are stored most
//! significant bit first within each byte.
//!
//! ## Top-upped arrays
//!
//! On the wire a buffer is stored as whole bytes. If the bit length is not a
//! multiple of 8, a single `1` completion tag is written right after the last
//! data bit and the rest of the byte is zero-filled, so the exact length can
//! be recovered without a separate length field.

use std::fmt;

use num_bigint::{BigInt, BigUint};
use num_traits::{One, Signed, Zero};

use crate::{CellError, CellResult, MAX_CELL_BITS};

/// Bit buffer with a write cursor (its length) and a read cursor.
#[derive(Debug, Clone)]
pub struct BitBuffer {
    /// Backing bytes, always exactly `ceil(len / 8)` long.
    data: Vec<u8>,
    /// Maximum number of bits this buffer accepts.
    capacity: usize,
    /// Number of bits written.
    len: usize,
    /// Next bit to read.
    read_pos: usize,
}

impl BitBuffer {
    /// Create an empty buffer that accepts up to `capacity` bits.
    pub fn new(capacity: usize) -> Self {
        BitBuffer {
            data: Vec::with_capacity(capacity.div_ceil(8)),
            capacity,
            len: 0,
            read_pos: 0,
        }
    }

    /// Create an empty buffer sized for cell content (1023 bits).
    pub fn for_cell() -> Self {
        Self::new(MAX_CELL_BITS)
    }

    /// Create a buffer holding the first `bit_len` bits of `bytes`.
    ///
    /// The capacity equals `bit_len`, so the buffer is full on return.
    pub fn from_bytes(bytes: &[u8], bit_len: usize) -> CellResult<Self> {
        if bit_len > bytes.len() * 8 {
            return Err(CellError::NotEnoughBits {
                need: bit_len,
                have: bytes.len() * 8,
            });
        }

        let mut buffer = BitBuffer {
            data: bytes[..bit_len.div_ceil(8)].to_vec(),
            capacity: bit_len,
            len: bit_len,
            read_pos: 0,
        };
        buffer.clear_tail();
        Ok(buffer)
    }

    /// Reconstruct a buffer from its top-upped byte representation.
    ///
    /// If `full_bytes` is false, the completion tag is searched for in the
    /// last 7 bits of the final byte, cleared, and the length is set to the
    /// tag position.
    pub fn from_top_upped(bytes: &[u8], full_bytes: bool) -> CellResult<Self> {
        let mut data = bytes.to_vec();
        let mut len = data.len() * 8;

        if !full_bytes {
            if let Some(last) = data.last_mut() {
                let tag = last.trailing_zeros() as usize;
                // A tag in the most significant bit would mean an empty last byte
                if tag >= 7 {
                    return Err(CellError::InvalidPadding);
                }
                *last &= !(1u8 << tag);
                len -= tag + 1;
            }
        }

        Ok(BitBuffer {
            data,
            capacity: len,
            len,
            read_pos: 0,
        })
    }

    /// Get the top-upped byte representation of the written bits.
    pub fn to_top_upped(&self) -> Vec<u8> {
        let mut result = self.data.clone();
        let remainder = self.len % 8;
        if remainder != 0 {
            if let Some(last) = result.last_mut() {
                *last |= 1 << (7 - remainder);
            }
        }
        result
    }

    /// Parse a Fift-style hex string (`_` suffix marks a completion tag).
    pub fn from_fift_hex(s: &str) -> CellResult<Self> {
        let s = s.trim();
        let (digits, tagged) = match s.strip_suffix('_') {
            Some(digits) => (digits, true),
            None => (s, false),
        };

        let mut buffer = BitBuffer::new(digits.len() * 4);
        for c in digits.chars() {
            let nibble = c
                .to_digit(16)
                .ok_or_else(|| CellError::InvalidHex(format!("unexpected character {:?}", c)))?;
            buffer.write_uint(nibble as u64, 4)?;
        }

        if tagged {
            let tag = (0..buffer.len)
                .rev()
                .find(|&i| buffer.bit_at(i))
                .ok_or_else(|| CellError::InvalidHex("missing completion tag".to_string()))?;
            buffer.truncate(tag);
        }

        buffer.capacity = buffer.len;
        Ok(buffer)
    }

    /// Render the written bits as Fift-style upper-case hex.
    ///
    /// Lengths that are not a multiple of 4 get a completion tag and a `_`
    /// suffix.
    pub fn to_fift_hex(&self) -> String {
        if self.len % 4 == 0 {
            let mut hex = hex::encode_upper(&self.data);
            if self.len % 8 != 0 {
                hex.pop();
            }
            return hex;
        }

        let mut padded = self.clone();
        padded.capacity = self.len.next_multiple_of(4);
        padded.push_bit(true);
        while padded.len % 4 != 0 {
            padded.push_bit(false);
        }

        let mut hex = padded.to_fift_hex();
        hex.push('_');
        hex
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Append a single bit.
    pub fn write_bit(&mut self, bit: bool) -> CellResult<()> {
        self.ensure_capacity(1)?;
        self.push_bit(bit);
        Ok(())
    }

    /// Append a sequence of bits.
    pub fn write_bits(&mut self, bits: &[bool]) -> CellResult<()> {
        self.ensure_capacity(bits.len())?;
        for &bit in bits {
            self.push_bit(bit);
        }
        Ok(())
    }

    /// Append an unsigned integer of up to 64 bits, most significant bit first.
    pub fn write_uint(&mut self, value: u64, bits: usize) -> CellResult<()> {
        if bits > 64 {
            return Err(CellError::InvalidBitLength(bits));
        }
        if bits < 64 && value >> bits != 0 {
            return Err(CellError::ValueTooWide { bits });
        }
        self.ensure_capacity(bits)?;

        for i in (0..bits).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
        Ok(())
    }

    /// Append a signed integer of up to 64 bits in two's complement.
    ///
    /// With `bits == 1` only `-1` (bit 1) and `0` (bit 0) are representable.
    pub fn write_int(&mut self, value: i64, bits: usize) -> CellResult<()> {
        if bits > 64 {
            return Err(CellError::InvalidBitLength(bits));
        }
        if bits == 0 {
            return if value == 0 {
                Ok(())
            } else {
                Err(CellError::ValueTooWide { bits })
            };
        }

        let limit = 1i128 << (bits - 1);
        let wide = value as i128;
        if wide < -limit || wide >= limit {
            return Err(CellError::ValueTooWide { bits });
        }

        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        self.write_uint(value as u64 & mask, bits)
    }

    /// Append an arbitrary-precision unsigned integer in exactly `bits` bits.
    pub fn write_big_uint(&mut self, value: &BigUint, bits: usize) -> CellResult<()> {
        if value.bits() > bits as u64 {
            return Err(CellError::ValueTooWide { bits });
        }
        self.ensure_capacity(bits)?;

        for i in (0..bits).rev() {
            self.push_bit(value.bit(i as u64));
        }
        Ok(())
    }

    /// Append an arbitrary-precision signed integer in exactly `bits` bits.
    ///
    /// Negative values are stored as a set sign bit followed by
    /// `value + 2^(bits-1)` in the remaining `bits - 1` bits.
    pub fn write_big_int(&mut self, value: &BigInt, bits: usize) -> CellResult<()> {
        if bits == 0 {
            return if value.is_zero() {
                Ok(())
            } else {
                Err(CellError::ValueTooWide { bits })
            };
        }

        let limit = BigInt::one() << (bits - 1);
        if value >= &limit || value < &-&limit {
            return Err(CellError::ValueTooWide { bits });
        }

        let encoded = if value.is_negative() {
            (BigInt::one() << bits) + value
        } else {
            value.clone()
        };
        self.write_big_uint(encoded.magnitude(), bits)
    }

    /// Append one byte.
    pub fn write_u8(&mut self, value: u8) -> CellResult<()> {
        self.write_uint(value as u64, 8)
    }

    /// Append a byte array.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> CellResult<()> {
        self.ensure_capacity(bytes.len() * 8)?;
        for &byte in bytes {
            for i in (0..8).rev() {
                self.push_bit((byte >> i) & 1 == 1);
            }
        }
        Ok(())
    }

    /// Append all written bits of another buffer.
    pub fn write_buffer(&mut self, other: &BitBuffer) -> CellResult<()> {
        self.ensure_capacity(other.len)?;
        for i in 0..other.len {
            self.push_bit(other.bit_at(i));
        }
        Ok(())
    }

    /// Append a `VarUInteger max_bytes`: the byte length of `value` in
    /// `ceil(log2(max_bytes))` bits, then `value` in that many bytes.
    pub fn write_var_uint(&mut self, value: &BigUint, max_bytes: usize) -> CellResult<()> {
        let len_bits = var_uint_len_bits(max_bytes)?;
        let byte_len = (value.bits() as usize).div_ceil(8);
        if byte_len >= max_bytes {
            return Err(CellError::ValueTooWide {
                bits: (max_bytes - 1) * 8,
            });
        }
        self.ensure_capacity(len_bits + byte_len * 8)?;

        self.write_uint(byte_len as u64, len_bits)?;
        self.write_big_uint(value, byte_len * 8)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Read the next bit.
    pub fn read_bit(&mut self) -> CellResult<bool> {
        self.ensure_readable(1)?;
        let bit = self.bit_at(self.read_pos);
        self.read_pos += 1;
        Ok(bit)
    }

    /// Read `count` bits.
    pub fn read_bits(&mut self, count: usize) -> CellResult<Vec<bool>> {
        self.ensure_readable(count)?;
        let bits = (self.read_pos..self.read_pos + count)
            .map(|i| self.bit_at(i))
            .collect();
        self.read_pos += count;
        Ok(bits)
    }

    /// Read an unsigned integer of up to 64 bits.
    pub fn read_uint(&mut self, bits: usize) -> CellResult<u64> {
        if bits > 64 {
            return Err(CellError::InvalidBitLength(bits));
        }
        self.ensure_readable(bits)?;

        let mut result: u64 = 0;
        for _ in 0..bits {
            result = (result << 1) | (self.bit_at(self.read_pos) as u64);
            self.read_pos += 1;
        }
        Ok(result)
    }

    /// Read a signed integer of up to 64 bits (two's complement).
    pub fn read_int(&mut self, bits: usize) -> CellResult<i64> {
        if bits == 0 {
            return Ok(0);
        }

        let unsigned = self.read_uint(bits)?;

        // Sign extend if needed
        if bits < 64 && unsigned & (1u64 << (bits - 1)) != 0 {
            let mask = !((1u64 << bits) - 1);
            Ok((unsigned | mask) as i64)
        } else {
            Ok(unsigned as i64)
        }
    }

    /// Read an arbitrary-precision unsigned integer of `bits` bits.
    pub fn read_big_uint(&mut self, bits: usize) -> CellResult<BigUint> {
        self.ensure_readable(bits)?;

        let mut value = BigUint::zero();
        for _ in 0..bits {
            value <<= 1;
            if self.bit_at(self.read_pos) {
                value += 1u32;
            }
            self.read_pos += 1;
        }
        Ok(value)
    }

    /// Read an arbitrary-precision signed integer of `bits` bits.
    pub fn read_big_int(&mut self, bits: usize) -> CellResult<BigInt> {
        if bits == 0 {
            return Ok(BigInt::zero());
        }
        self.ensure_readable(bits)?;

        let negative = self.read_bit()?;
        let rest = BigInt::from(self.read_big_uint(bits - 1)?);
        if negative {
            Ok(rest - (BigInt::one() << (bits - 1)))
        } else {
            Ok(rest)
        }
    }

    /// Read a `VarUInteger max_bytes`. The cursor is left untouched on error.
    pub fn read_var_uint(&mut self, max_bytes: usize) -> CellResult<BigUint> {
        let len_bits = var_uint_len_bits(max_bytes)?;
        let start = self.read_pos;
        let byte_len = self.read_uint(len_bits)? as usize;
        match self.read_big_uint(byte_len * 8) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.read_pos = start;
                Err(e)
            }
        }
    }

    /// Read `count` whole bytes.
    pub fn read_bytes(&mut self, count: usize) -> CellResult<Vec<u8>> {
        self.ensure_readable(count * 8)?;
        let mut result = Vec::with_capacity(count);
        for _ in 0..count {
            result.push(self.read_uint(8)? as u8);
        }
        Ok(result)
    }

    /// Advance the read cursor by `count` bits.
    pub fn skip(&mut self, count: usize) -> CellResult<()> {
        self.ensure_readable(count)?;
        self.read_pos += count;
        Ok(())
    }

    /// Move the read cursor back to the first bit.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Get the bit at `index`.
    pub fn get_bit(&self, index: usize) -> CellResult<bool> {
        if index >= self.len {
            return Err(CellError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(self.bit_at(index))
    }

    /// Number of bits written.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bits have been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of bits this buffer accepts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bits that can still be written.
    pub fn bits_left_for_write(&self) -> usize {
        self.capacity - self.len
    }

    /// Number of bits between the read cursor and the end.
    pub fn bits_left_for_read(&self) -> usize {
        self.len - self.read_pos
    }

    /// Current read cursor position.
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Raw bytes; bits past `len` in the last byte are zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bit_at(&self, index: usize) -> bool {
        (self.data[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    fn push_bit(&mut self, bit: bool) {
        let byte_index = self.len / 8;
        if byte_index >= self.data.len() {
            self.data.push(0);
        }
        if bit {
            self.data[byte_index] |= 1 << (7 - self.len % 8);
        }
        self.len += 1;
    }

    fn truncate(&mut self, len: usize) {
        self.len = len;
        self.data.truncate(len.div_ceil(8));
        self.read_pos = self.read_pos.min(len);
        self.clear_tail();
    }

    fn clear_tail(&mut self) {
        let remainder = self.len % 8;
        if remainder != 0 {
            if let Some(last) = self.data.last_mut() {
                *last &= !(0xFFu8 >> remainder);
            }
        }
    }

    fn ensure_capacity(&self, bits: usize) -> CellResult<()> {
        if self.len + bits > self.capacity {
            return Err(CellError::CapacityExceeded {
                requested: self.len + bits,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn ensure_readable(&self, bits: usize) -> CellResult<()> {
        let have = self.bits_left_for_read();
        if bits > have {
            return Err(CellError::NotEnoughBits { need: bits, have });
        }
        Ok(())
    }
}

impl Default for BitBuffer {
    fn default() -> Self {
        Self::for_cell()
    }
}

impl PartialEq for BitBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.data == other.data
    }
}

impl Eq for BitBuffer {}

impl fmt::Display for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_fift_hex())
    }
}

/// Width of the length prefix of a `VarUInteger max_bytes`.
fn var_uint_len_bits(max_bytes: usize) -> CellResult<usize> {
    if max_bytes < 2 {
        return Err(CellError::InvalidBitLength(max_bytes));
    }
    Ok((usize::BITS - (max_bytes - 1).leading_zeros()) as usize)
}
