//! Cell level masks.
//!
//! Bit `n - 1` of a mask is set when level `n` carries its own hash. Level 0
//! is always significant. Ordinary cells inherit the union of their
//! children's masks, Merkle cells shift it down by one, and a pruned branch
//! declares its mask in its second data byte.
//!
//! Reference: ton-blockchain/ton/crypto/vm/cells/LevelMask.h

use std::ops::BitOr;

/// Highest cell level.
pub const MAX_LEVEL: u8 = 3;

/// Three-bit set of significant levels above level 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LevelMask(u8);

impl LevelMask {
    /// Wrap a raw mask. Bits above the third are discarded.
    #[inline]
    pub const fn new(mask: u8) -> Self {
        LevelMask(mask & 0b111)
    }

    /// Mask with only `level` significant (empty for level 0).
    #[inline]
    pub const fn one_level(level: u8) -> Self {
        if level == 0 {
            LevelMask(0)
        } else {
            LevelMask::new(1 << (level - 1))
        }
    }

    /// Raw mask bits.
    #[inline]
    pub const fn mask(self) -> u8 {
        self.0
    }

    /// Cell level: position of the highest set bit, 0 for an empty mask.
    #[inline]
    pub const fn level(self) -> u8 {
        8 - self.0.leading_zeros() as u8
    }

    /// Number of set bits. For a cell hashed at level `l` this is the slot of
    /// that hash among the cell's stored hashes when applied to `apply(l)`.
    #[inline]
    pub const fn hash_index(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Number of hashes a cell with this mask carries.
    #[inline]
    pub const fn hashes_count(self) -> usize {
        self.hash_index() + 1
    }

    /// Keep only the bits of levels `1..=level`.
    #[inline]
    pub const fn apply(self, level: u8) -> Self {
        if level == 0 {
            LevelMask(0)
        } else if level >= 8 {
            self
        } else {
            LevelMask(self.0 & ((1u8 << level) - 1))
        }
    }

    /// Mask of a Merkle cell over a child with this mask.
    #[inline]
    pub const fn shift_right(self) -> Self {
        LevelMask(self.0 >> 1)
    }

    /// Whether level `level` carries its own hash.
    #[inline]
    pub const fn is_significant(self, level: u8) -> bool {
        level == 0 || (self.0 >> (level - 1)) & 1 != 0
    }

    /// Significant levels in ascending order, up to and including `level()`.
    pub fn significant_levels(self) -> impl Iterator<Item = u8> {
        (0..=self.level()).filter(move |&level| self.is_significant(level))
    }
}

impl BitOr for LevelMask {
    type Output = LevelMask;

    fn bitor(self, rhs: LevelMask) -> LevelMask {
        LevelMask(self.0 | rhs.0)
    }
}

impl From<u8> for LevelMask {
    fn from(mask: u8) -> Self {
        LevelMask::new(mask)
    }
}
