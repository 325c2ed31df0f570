//! Sequential reader over a cell.
//!
//! A CellSlice walks a cell's bits through its own read cursor and hands out
//! references in order as [`CellId`]s.

use num_bigint::{BigInt, BigUint};
use num_traits::ToPrimitive;

use crate::{BitBuffer, Cell, CellError, CellId, CellResult};

/// Read cursor over the bits and references of a [`Cell`].
///
/// # Example
///
/// ```
/// use ton_boc::Cell;
///
/// let mut cell = Cell::new();
/// cell.store_u32(0x12345678).unwrap();
///
/// let mut slice = cell.parse();
/// assert_eq!(slice.load_u32().unwrap(), 0x12345678);
/// assert!(slice.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct CellSlice<'a> {
    cell: &'a Cell,
    bits: BitBuffer,
    ref_offset: usize,
}

impl<'a> CellSlice<'a> {
    /// Start at the first bit and first reference of `cell`.
    pub fn new(cell: &'a Cell) -> Self {
        let mut bits = cell.bits().clone();
        bits.rewind();
        CellSlice {
            cell,
            bits,
            ref_offset: 0,
        }
    }

    pub fn load_bit(&mut self) -> CellResult<bool> {
        self.bits.read_bit()
    }

    pub fn load_bits(&mut self, count: usize) -> CellResult<Vec<bool>> {
        self.bits.read_bits(count)
    }

    pub fn load_u8(&mut self) -> CellResult<u8> {
        self.load_uint(8).map(|v| v as u8)
    }

    pub fn load_u16(&mut self) -> CellResult<u16> {
        self.load_uint(16).map(|v| v as u16)
    }

    pub fn load_u32(&mut self) -> CellResult<u32> {
        self.load_uint(32).map(|v| v as u32)
    }

    pub fn load_u64(&mut self) -> CellResult<u64> {
        self.load_uint(64)
    }

    pub fn load_i8(&mut self) -> CellResult<i8> {
        self.load_int(8).map(|v| v as i8)
    }

    pub fn load_i16(&mut self) -> CellResult<i16> {
        self.load_int(16).map(|v| v as i16)
    }

    pub fn load_i32(&mut self) -> CellResult<i32> {
        self.load_int(32).map(|v| v as i32)
    }

    pub fn load_i64(&mut self) -> CellResult<i64> {
        self.load_int(64)
    }

    /// Load an unsigned integer of up to 64 bits.
    pub fn load_uint(&mut self, bits: usize) -> CellResult<u64> {
        self.bits.read_uint(bits)
    }

    /// Load a signed integer of up to 64 bits.
    pub fn load_int(&mut self, bits: usize) -> CellResult<i64> {
        self.bits.read_int(bits)
    }

    /// Load an unsigned integer of any width.
    pub fn load_big_uint(&mut self, bits: usize) -> CellResult<BigUint> {
        self.bits.read_big_uint(bits)
    }

    /// Load a signed integer of any width.
    pub fn load_big_int(&mut self, bits: usize) -> CellResult<BigInt> {
        self.bits.read_big_int(bits)
    }

    pub fn load_bytes(&mut self, count: usize) -> CellResult<Vec<u8>> {
        self.bits.read_bytes(count)
    }

    /// Load a `VarUInteger max_bytes`.
    pub fn load_var_uint(&mut self, max_bytes: usize) -> CellResult<BigUint> {
        self.bits.read_var_uint(max_bytes)
    }

    /// Load a nanoton amount stored as `VarUInteger 16`.
    pub fn load_coins(&mut self) -> CellResult<u128> {
        self.load_var_uint(16)?
            .to_u128()
            .ok_or(CellError::ValueTooWide { bits: 128 })
    }

    /// Load a unary number: `n` set bits terminated by a clear bit.
    pub fn load_unary(&mut self) -> CellResult<usize> {
        let start = self.bits.read_position();
        let mut n = 0;
        loop {
            let bit = self.bits.get_bit(start + n).map_err(|_| CellError::NotEnoughBits {
                need: n + 1,
                have: n,
            })?;
            if !bit {
                break;
            }
            n += 1;
        }
        self.bits.skip(n + 1)?;
        Ok(n)
    }

    /// Load the presence bit of a `Maybe` field.
    pub fn load_maybe(&mut self) -> CellResult<bool> {
        self.load_bit()
    }

    /// Load the next reference.
    pub fn load_ref(&mut self) -> CellResult<CellId> {
        let id = self.cell.reference(self.ref_offset).ok_or(CellError::NotEnoughRefs {
            need: 1,
            have: 0,
        })?;
        self.ref_offset += 1;
        Ok(id)
    }

    pub fn skip_bits(&mut self, count: usize) -> CellResult<()> {
        self.bits.skip(count)
    }

    pub fn skip_refs(&mut self, count: usize) -> CellResult<()> {
        let have = self.refs_left();
        if count > have {
            return Err(CellError::NotEnoughRefs { need: count, have });
        }
        self.ref_offset += count;
        Ok(())
    }

    pub fn bits_left(&self) -> usize {
        self.bits.bits_left_for_read()
    }

    pub fn refs_left(&self) -> usize {
        self.cell.reference_count() - self.ref_offset
    }

    /// True when no bits and no references are left.
    pub fn is_empty(&self) -> bool {
        self.bits_left() == 0 && self.refs_left() == 0
    }

    /// The cell being read.
    pub fn cell(&self) -> &'a Cell {
        self.cell
    }
}
