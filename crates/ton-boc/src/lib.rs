//! TON Cell trees and Bag of Cells (BoC) Library
//!
//! This crate implements the canonical binary encoding of TON cell trees:
//!
//! - **BitBuffer**: Bit-addressable content buffer with write and read cursors
//! - **Cell** / **CellArena**: Cells holding up to 1023 bits and 4 references,
//!   stored in an arena and addressed by [`CellId`]
//! - **CellSlice**: Sequential reader over a cell
//! - **BagOfCells**: The binary envelope for a rooted cell graph
//! - **CellHasher**: Per-level representation hashes and depths
//! - **MerkleProver**: Merkle proofs over a pruned subset of a tree
//!
//! # Overview
//!
//! In TON, all data is stored as cells. A cell contains:
//! - Up to 1023 bits of data
//! - Up to 4 references to other cells
//!
//! References form a DAG (Directed Acyclic Graph). Cells are kept in a
//! [`CellArena`], so a child can be shared by several parents and a cycle
//! in malformed input is detected instead of followed forever.
//!
//! # Example
//!
//! ```
//! use ton_boc::{BagOfCells, Cell, CellArena};
//!
//! let mut arena = CellArena::new();
//!
//! let mut child = Cell::new();
//! child.store_u32(0xDEADBEEF).unwrap();
//! let child = arena.insert(child);
//!
//! let mut root = Cell::new();
//! root.store_u32(0x12345678).unwrap();
//! root.add_reference(child).unwrap();
//! let root = arena.insert(root);
//!
//! let hash = arena.hash(root).unwrap();
//!
//! let bytes = BagOfCells::from_root(arena, root).serialize().unwrap();
//! let decoded = BagOfCells::deserialize(&bytes).unwrap();
//! let decoded_root = decoded.single_root().unwrap();
//! assert_eq!(decoded.arena().hash(decoded_root).unwrap(), hash);
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;

mod bits;
mod boc;
mod cell;
mod hasher;
mod level_mask;
mod proof;
mod slice;

pub use bits::BitBuffer;
pub use boc::{BagOfCells, BocOptions};
pub use cell::{Cell, CellArena, CellId};
pub use hasher::{CellHash, CellHasher, HashedTree, ImmutableCell, NodeId, DEPTH_BYTES, HASH_BYTES};
pub use level_mask::{LevelMask, MAX_LEVEL};
pub use proof::{Cursor, MerkleProver};
pub use slice::CellSlice;

/// Errors that can occur during Cell/BoC operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellError {
    /// A write would grow a buffer past its declared capacity.
    #[error("Capacity exceeded: {requested} bits requested, capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// The value does not fit into the requested number of bits.
    #[error("Value does not fit into {bits} bits")]
    ValueTooWide { bits: usize },

    /// Invalid bit length for a fixed-width operation.
    #[error("Invalid bit length: {0}")]
    InvalidBitLength(usize),

    /// Not enough bits available.
    #[error("Not enough bits: need {need}, have {have}")]
    NotEnoughBits { need: usize, have: usize },

    /// Not enough references available.
    #[error("Not enough refs: need {need}, have {have}")]
    NotEnoughRefs { need: usize, have: usize },

    /// An index points outside of the addressed collection.
    #[error("Index out of range: {index} (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Top-upped array has no completion tag in its last byte.
    #[error("Invalid padding: completion tag not found")]
    InvalidPadding,

    /// The cell has too many references (max 4).
    #[error("Too many cell references: {0} (max 4)")]
    TooManyReferences(usize),

    /// The reference graph contains a cycle.
    #[error("Circular reference through cell {0}")]
    CircularReference(usize),

    /// A serialized cell references a cell stored before it.
    #[error("Broken topological order: cell {cell} references cell {reference}")]
    BrokenTopology { cell: usize, reference: usize },

    /// CRC32C checksum mismatch.
    #[error("CRC32C mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The tree is deeper than [`MAX_CELL_DEPTH`].
    #[error("Cell depth exceeds {0}")]
    DepthExceeded(usize),

    /// Operation is not supported for this cell type.
    #[error("Unsupported cell type: {0:?}")]
    UnsupportedCellType(CellType),

    /// Expected single root but found multiple or none.
    #[error("Expected single root, found {0}")]
    UnexpectedRootCount(usize),

    /// Unexpected end of data.
    #[error("Unexpected end of data")]
    UnexpectedEof,

    /// Invalid BoC format.
    #[error("Invalid BoC format: {0}")]
    InvalidBoc(String),

    /// Invalid cell type.
    #[error("Invalid cell type: {0}")]
    InvalidCellType(u8),

    /// Exotic cell content does not match its type's layout.
    #[error("Invalid exotic cell: {0}")]
    InvalidExoticCell(String),

    /// Invalid hex encoding.
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    /// Invalid base64 encoding.
    #[error("Invalid base64: {0}")]
    InvalidBase64(String),
}

/// Result type for Cell/BoC operations.
pub type CellResult<T> = Result<T, CellError>;

/// Maximum number of bits in a cell's data.
pub const MAX_CELL_BITS: usize = 1023;

/// Maximum number of references a cell can have.
pub const MAX_CELL_REFS: usize = 4;

/// Maximum depth of a cell tree.
/// Reference: ton-blockchain/ton/crypto/vm/cells/CellTraits.h max_depth = 1024
pub const MAX_CELL_DEPTH: usize = 1024;

/// BoC magic number for generic BoC.
pub const BOC_GENERIC_MAGIC: u32 = 0xb5ee9c72;

/// BoC magic number for indexed BoC.
pub const BOC_INDEXED_MAGIC: u32 = 0x68ff65f3;

/// BoC magic number for indexed CRC32 BoC.
pub const BOC_INDEXED_CRC32_MAGIC: u32 = 0xacc3a728;

/// Cell type indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CellType {
    /// Ordinary data cell.
    #[default]
    Ordinary = 0,
    /// Pruned branch (for Merkle proofs).
    PrunedBranch = 1,
    /// Library reference.
    Library = 2,
    /// Merkle proof cell.
    MerkleProof = 3,
    /// Merkle update cell.
    MerkleUpdate = 4,
}

impl CellType {
    /// Check if this is an exotic (non-ordinary) cell type.
    pub fn is_exotic(&self) -> bool {
        *self != CellType::Ordinary
    }

    /// Check if this is a Merkle proof or Merkle update cell.
    ///
    /// Children of Merkle cells are hashed one level deeper.
    pub fn is_merkle(&self) -> bool {
        matches!(self, CellType::MerkleProof | CellType::MerkleUpdate)
    }

    /// Convert from u8 to CellType.
    pub fn from_u8(value: u8) -> CellResult<Self> {
        match value {
            0 => Ok(CellType::Ordinary),
            1 => Ok(CellType::PrunedBranch),
            2 => Ok(CellType::Library),
            3 => Ok(CellType::MerkleProof),
            4 => Ok(CellType::MerkleUpdate),
            _ => Err(CellError::InvalidCellType(value)),
        }
    }

    /// Decode the type tag stored in the first data byte of an exotic cell.
    pub fn from_exotic_tag(tag: u8) -> CellResult<Self> {
        match Self::from_u8(tag)? {
            CellType::Ordinary => Err(CellError::InvalidCellType(tag)),
            cell_type => Ok(cell_type),
        }
    }
}

/// Compute SHA256 hash of the input data.
fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Compute CRC32-C checksum (Castagnoli polynomial).
fn crc32c(data: &[u8]) -> u32 {
    const CRC32C: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);
    CRC32C.checksum(data)
}
