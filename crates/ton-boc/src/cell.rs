//! Cells and the arena that owns them.
//!
//! A [`Cell`] holds up to 1023 bits of content and up to 4 references. The
//! references are [`CellId`]s into a [`CellArena`], so one child can be
//! shared by several parents. Nothing here prevents a reference cycle from
//! being built; cycles are reported by [`CellHasher`](crate::CellHasher) and
//! by serialization.

use std::fmt;

use num_bigint::{BigInt, BigUint};

use crate::{
    BitBuffer, CellError, CellHash, CellHasher, CellResult, CellSlice, CellType, LevelMask,
    MAX_CELL_BITS, MAX_CELL_REFS,
};

/// Stable handle of a cell inside a [`CellArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(usize);

impl CellId {
    /// Position of the cell in its arena.
    pub fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for CellId {
    fn from(index: usize) -> Self {
        CellId(index)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A TON cell: content bits, child references, type and declared level mask.
///
/// The declared level mask is authoritative for pruned branches only. For
/// every other type the effective mask is derived from the children when
/// the cell is hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    bits: BitBuffer,
    references: Vec<CellId>,
    cell_type: CellType,
    level_mask: LevelMask,
}

impl Cell {
    /// Create an empty ordinary cell.
    pub fn new() -> Self {
        Self::exotic(CellType::Ordinary)
    }

    /// Create an empty cell of the given type.
    pub fn exotic(cell_type: CellType) -> Self {
        Cell {
            bits: BitBuffer::for_cell(),
            references: Vec::new(),
            cell_type,
            level_mask: LevelMask::default(),
        }
    }

    /// Assemble a cell from decoded parts.
    pub fn from_parts(
        cell_type: CellType,
        bits: BitBuffer,
        references: Vec<CellId>,
        level_mask: LevelMask,
    ) -> CellResult<Self> {
        if bits.len() > MAX_CELL_BITS {
            return Err(CellError::CapacityExceeded {
                requested: bits.len(),
                capacity: MAX_CELL_BITS,
            });
        }
        if references.len() > MAX_CELL_REFS {
            return Err(CellError::TooManyReferences(references.len()));
        }

        Ok(Cell {
            bits,
            references,
            cell_type,
            level_mask,
        })
    }

    // ========================================================================
    // Storing content
    // ========================================================================

    /// Store a single bit.
    pub fn store_bit(&mut self, bit: bool) -> CellResult<&mut Self> {
        self.bits.write_bit(bit)?;
        Ok(self)
    }

    /// Store a sequence of bits.
    pub fn store_bits(&mut self, bits: &[bool]) -> CellResult<&mut Self> {
        self.bits.write_bits(bits)?;
        Ok(self)
    }

    pub fn store_u8(&mut self, value: u8) -> CellResult<&mut Self> {
        self.store_uint(value as u64, 8)
    }

    pub fn store_u16(&mut self, value: u16) -> CellResult<&mut Self> {
        self.store_uint(value as u64, 16)
    }

    pub fn store_u32(&mut self, value: u32) -> CellResult<&mut Self> {
        self.store_uint(value as u64, 32)
    }

    pub fn store_u64(&mut self, value: u64) -> CellResult<&mut Self> {
        self.store_uint(value, 64)
    }

    pub fn store_i8(&mut self, value: i8) -> CellResult<&mut Self> {
        self.store_int(value as i64, 8)
    }

    pub fn store_i16(&mut self, value: i16) -> CellResult<&mut Self> {
        self.store_int(value as i64, 16)
    }

    pub fn store_i32(&mut self, value: i32) -> CellResult<&mut Self> {
        self.store_int(value as i64, 32)
    }

    pub fn store_i64(&mut self, value: i64) -> CellResult<&mut Self> {
        self.store_int(value, 64)
    }

    /// Store an unsigned integer with a specific bit width (at most 64).
    pub fn store_uint(&mut self, value: u64, bits: usize) -> CellResult<&mut Self> {
        self.bits.write_uint(value, bits)?;
        Ok(self)
    }

    /// Store a signed integer with a specific bit width (at most 64).
    pub fn store_int(&mut self, value: i64, bits: usize) -> CellResult<&mut Self> {
        self.bits.write_int(value, bits)?;
        Ok(self)
    }

    /// Store an arbitrary-precision unsigned integer in `bits` bits.
    pub fn store_big_uint(&mut self, value: &BigUint, bits: usize) -> CellResult<&mut Self> {
        self.bits.write_big_uint(value, bits)?;
        Ok(self)
    }

    /// Store an arbitrary-precision signed integer in `bits` bits.
    pub fn store_big_int(&mut self, value: &BigInt, bits: usize) -> CellResult<&mut Self> {
        self.bits.write_big_int(value, bits)?;
        Ok(self)
    }

    /// Store raw bytes.
    pub fn store_bytes(&mut self, bytes: &[u8]) -> CellResult<&mut Self> {
        self.bits.write_bytes(bytes)?;
        Ok(self)
    }

    /// Append the written bits of a buffer.
    pub fn store_buffer(&mut self, buffer: &BitBuffer) -> CellResult<&mut Self> {
        self.bits.write_buffer(buffer)?;
        Ok(self)
    }

    /// Store a `VarUInteger max_bytes`.
    pub fn store_var_uint(&mut self, value: &BigUint, max_bytes: usize) -> CellResult<&mut Self> {
        self.bits.write_var_uint(value, max_bytes)?;
        Ok(self)
    }

    /// Store a nanoton amount as `VarUInteger 16`.
    pub fn store_coins(&mut self, nanotons: u128) -> CellResult<&mut Self> {
        self.store_var_uint(&BigUint::from(nanotons), 16)
    }

    /// Append a child reference.
    pub fn add_reference(&mut self, child: CellId) -> CellResult<&mut Self> {
        if self.references.len() >= MAX_CELL_REFS {
            return Err(CellError::TooManyReferences(self.references.len() + 1));
        }
        self.references.push(child);
        Ok(self)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Number of content bits.
    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    /// Content buffer.
    pub fn bits(&self) -> &BitBuffer {
        &self.bits
    }

    /// Content bytes; bits past `bit_len` in the last byte are zero.
    pub fn data(&self) -> &[u8] {
        self.bits.as_bytes()
    }

    pub fn references(&self) -> &[CellId] {
        &self.references
    }

    pub fn reference(&self, index: usize) -> Option<CellId> {
        self.references.get(index).copied()
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn is_exotic(&self) -> bool {
        self.cell_type.is_exotic()
    }

    /// Declared level mask.
    pub fn level_mask(&self) -> LevelMask {
        self.level_mask
    }

    pub fn set_level_mask(&mut self, mask: LevelMask) {
        self.level_mask = mask;
    }

    /// Start reading the cell from its first bit and first reference.
    pub fn parse(&self) -> CellSlice<'_> {
        CellSlice::new(self)
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of a cell graph.
///
/// Ids are indices into the arena and stay valid for its lifetime. Cells are
/// never removed.
#[derive(Debug, Clone, Default)]
pub struct CellArena {
    cells: Vec<Cell>,
}

impl CellArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a cell into the arena.
    pub fn insert(&mut self, cell: Cell) -> CellId {
        self.cells.push(cell);
        CellId(self.cells.len() - 1)
    }

    /// Insert an empty ordinary cell.
    pub fn new_cell(&mut self) -> CellId {
        self.insert(Cell::new())
    }

    /// Get a cell by id.
    pub fn get(&self, id: CellId) -> CellResult<&Cell> {
        let len = self.cells.len();
        self.cells
            .get(id.0)
            .ok_or(CellError::IndexOutOfRange { index: id.0, len })
    }

    /// Get a cell by id for modification.
    ///
    /// Modifying a cell after it was hashed or serialized does not update
    /// results already produced.
    pub fn get_mut(&mut self, id: CellId) -> CellResult<&mut Cell> {
        let len = self.cells.len();
        self.cells
            .get_mut(id.0)
            .ok_or(CellError::IndexOutOfRange { index: id.0, len })
    }

    /// Add `child` as the next reference of `parent`.
    pub fn add_reference(&mut self, parent: CellId, child: CellId) -> CellResult<()> {
        self.get(child)?;
        self.get_mut(parent)?.add_reference(child)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Ids of all cells in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = CellId> {
        (0..self.cells.len()).map(CellId)
    }

    /// Representation hash of a cell (level 0 for ordinary trees).
    pub fn hash(&self, id: CellId) -> CellResult<CellHash> {
        CellHasher::new(self).hash(id)
    }

    /// Representation hash as lowercase hex.
    pub fn hash_hex(&self, id: CellId) -> CellResult<String> {
        CellHasher::new(self).hash_hex(id)
    }

    /// Representation depth of a cell.
    pub fn depth(&self, id: CellId) -> CellResult<u16> {
        CellHasher::new(self).depth(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cell() {
        let cell = Cell::new();
        assert_eq!(cell.bit_len(), 0);
        assert_eq!(cell.reference_count(), 0);
        assert_eq!(cell.cell_type(), CellType::Ordinary);
        assert!(!cell.is_exotic());
        assert_eq!(cell.level_mask(), LevelMask::default());
        assert!(cell.data().is_empty());
    }

    #[test]
    fn test_store_chain() {
        let mut cell = Cell::new();
        cell.store_u8(0xAB)
            .unwrap()
            .store_bit(true)
            .unwrap()
            .store_i16(-2)
            .unwrap();

        assert_eq!(cell.bit_len(), 25);
        assert_eq!(cell.data(), &[0xAB, 0xFF, 0xFF, 0x00]);
    }

    #[test]
    fn test_store_overflow() {
        let mut cell = Cell::new();
        cell.store_bytes(&[0u8; 127]).unwrap();
        cell.store_uint(0, 7).unwrap();
        assert!(matches!(
            cell.store_bit(false),
            Err(CellError::CapacityExceeded { .. })
        ));
        assert_eq!(cell.bit_len(), MAX_CELL_BITS);
    }

    #[test]
    fn test_fifth_reference() {
        let mut arena = CellArena::new();
        let child = arena.new_cell();
        let mut cell = Cell::new();
        for _ in 0..4 {
            cell.add_reference(child).unwrap();
        }
        assert_eq!(
            cell.add_reference(child).unwrap_err(),
            CellError::TooManyReferences(5)
        );
        assert_eq!(cell.reference_count(), 4);
    }

    #[test]
    fn test_arena_ids() {
        let mut arena = CellArena::new();
        assert!(arena.is_empty());

        let a = arena.new_cell();
        let b = arena.insert(Cell::exotic(CellType::Library));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.ids().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(arena.get(b).unwrap().cell_type(), CellType::Library);
        assert_eq!(b.to_string(), "#1");
    }

    #[test]
    fn test_arena_add_reference() {
        let mut arena = CellArena::new();
        let parent = arena.new_cell();
        let child = arena.new_cell();

        arena.add_reference(parent, child).unwrap();
        assert_eq!(arena.get(parent).unwrap().reference(0), Some(child));

        assert_eq!(
            arena.add_reference(parent, CellId::from(7)),
            Err(CellError::IndexOutOfRange { index: 7, len: 2 })
        );
        assert_eq!(
            arena.add_reference(CellId::from(9), child),
            Err(CellError::IndexOutOfRange { index: 9, len: 2 })
        );
        assert_eq!(arena.get(parent).unwrap().reference_count(), 1);
    }

    #[test]
    fn test_shared_child() {
        let mut arena = CellArena::new();
        let child = arena.new_cell();
        let mut root = Cell::new();
        root.add_reference(child).unwrap();
        root.add_reference(child).unwrap();
        let root = arena.insert(root);

        let cell = arena.get(root).unwrap();
        assert_eq!(cell.references(), &[child, child]);
    }

    #[test]
    fn test_from_parts_limits() {
        let bits = BitBuffer::from_bytes(&[0u8; 128], 1024).unwrap();
        assert!(matches!(
            Cell::from_parts(CellType::Ordinary, bits, Vec::new(), LevelMask::default()),
            Err(CellError::CapacityExceeded { requested: 1024, .. })
        ));

        let refs = vec![CellId::from(0); 5];
        assert_eq!(
            Cell::from_parts(CellType::Ordinary, BitBuffer::for_cell(), refs, LevelMask::default()),
            Err(CellError::TooManyReferences(5))
        );
    }

    #[test]
    fn test_empty_cell_hash() {
        let mut arena = CellArena::new();
        let id = arena.new_cell();
        assert_eq!(
            arena.hash_hex(id).unwrap(),
            "96a296d224f285c67bee93c30f8a309157f0daa35dc5b87e410b78630a09cfc7"
        );
        assert_eq!(arena.depth(id).unwrap(), 0);
    }

    #[test]
    fn test_mutation_changes_hash() {
        let mut arena = CellArena::new();
        let id = arena.new_cell();
        let before = arena.hash(id).unwrap();
        arena.get_mut(id).unwrap().store_bit(true).unwrap();
        assert_ne!(arena.hash(id).unwrap(), before);
    }
}
