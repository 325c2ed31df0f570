//! Per-level cell hashing.
//!
//! [`CellHasher`] walks a [`CellArena`] and produces a [`HashedTree`]: one
//! [`ImmutableCell`] per reachable cell, holding the effective level mask
//! and a (hash, depth) pair for each significant level.
//!
//! ## Representation
//!
//! The hash at a significant level `i` is SHA-256 over:
//!
//! ```text
//! d1(mask.apply(i)) || d2 || data-or-previous-hash || child depths || child hashes
//! ```
//!
//! The first computed level uses the top-upped content; higher levels chain
//! the previous level's hash. Children are taken at level `i`, or `i + 1`
//! below Merkle cells. A pruned branch carries the hashes and depths of its
//! lower levels in its content and only computes its own level.
//!
//! Reference: ton-blockchain/ton/crypto/vm/cells/DataCell.cpp

use std::collections::{HashMap, HashSet};

use crate::{
    sha256, BitBuffer, CellArena, CellError, CellId, CellResult, CellType, LevelMask,
    MAX_CELL_DEPTH, MAX_LEVEL,
};

/// Hash size in bytes (SHA-256).
pub const HASH_BYTES: usize = 32;

/// Serialized depth size in bytes.
pub const DEPTH_BYTES: usize = 2;

/// SHA-256 cell hash.
pub type CellHash = [u8; HASH_BYTES];

/// Index of an [`ImmutableCell`] inside a [`HashedTree`].
pub type NodeId = usize;

/// Hashed, read-only snapshot of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableCell {
    cell_type: CellType,
    bits: BitBuffer,
    references: Vec<NodeId>,
    level_mask: LevelMask,
    /// Computed hashes. For pruned branches only the own level is computed.
    hashes: Vec<CellHash>,
    depths: Vec<u16>,
}

impl ImmutableCell {
    /// Hash at `level`. Levels above the cell's own level give the
    /// representation hash.
    pub fn hash(&self, level: u8) -> CellHash {
        let index = self.level_mask.apply(level).hash_index();
        let offset = self.stored_levels();
        if index < offset {
            let start = 2 + index * HASH_BYTES;
            let mut hash = [0u8; HASH_BYTES];
            hash.copy_from_slice(&self.bits.as_bytes()[start..start + HASH_BYTES]);
            hash
        } else {
            self.hashes[index - offset]
        }
    }

    /// Depth at `level`.
    pub fn depth(&self, level: u8) -> u16 {
        let index = self.level_mask.apply(level).hash_index();
        let offset = self.stored_levels();
        if index < offset {
            let start = 2 + offset * HASH_BYTES + index * DEPTH_BYTES;
            let data = self.bits.as_bytes();
            u16::from_be_bytes([data[start], data[start + 1]])
        } else {
            self.depths[index - offset]
        }
    }

    /// Hash at the highest level.
    pub fn repr_hash(&self) -> CellHash {
        self.hash(MAX_LEVEL)
    }

    /// Depth at the highest level.
    pub fn repr_depth(&self) -> u16 {
        self.depth(MAX_LEVEL)
    }

    pub fn level(&self) -> u8 {
        self.level_mask.level()
    }

    /// Effective level mask.
    pub fn level_mask(&self) -> LevelMask {
        self.level_mask
    }

    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn bits(&self) -> &BitBuffer {
        &self.bits
    }

    /// Children as node indices of the same tree.
    pub fn references(&self) -> &[NodeId] {
        &self.references
    }

    /// Serialization descriptor bytes `[d1, d2]`.
    pub fn descriptors(&self) -> [u8; 2] {
        self.descriptors_at(MAX_LEVEL)
    }

    /// Descriptor bytes with the level mask restricted to `level`.
    pub fn descriptors_at(&self, level: u8) -> [u8; 2] {
        let d1 = self.references.len() as u8
            + 8 * self.cell_type.is_exotic() as u8
            + 32 * self.level_mask.apply(level).mask();
        let bit_len = self.bits.len();
        let d2 = (bit_len.div_ceil(8) + bit_len / 8) as u8;
        [d1, d2]
    }

    /// Number of lower-level hashes stored in the content.
    fn stored_levels(&self) -> usize {
        if self.cell_type == CellType::PrunedBranch {
            self.level_mask.hash_index()
        } else {
            0
        }
    }
}

/// Snapshot of every cell a [`CellHasher`] has visited.
///
/// Children always precede their parents.
#[derive(Debug, Clone, Default)]
pub struct HashedTree {
    nodes: Vec<ImmutableCell>,
}

impl HashedTree {
    pub fn get(&self, id: NodeId) -> CellResult<&ImmutableCell> {
        self.nodes.get(id).ok_or(CellError::IndexOutOfRange {
            index: id,
            len: self.nodes.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImmutableCell> {
        self.nodes.iter()
    }

    pub(crate) fn node(&self, id: NodeId) -> &ImmutableCell {
        &self.nodes[id]
    }
}

/// Hashes cells of an arena, memoizing every visited cell.
///
/// A hasher borrows the arena for its whole lifetime, so cells cannot change
/// between two lookups of the same hasher.
#[derive(Debug)]
pub struct CellHasher<'a> {
    arena: &'a CellArena,
    tree: HashedTree,
    memo: HashMap<CellId, NodeId>,
    in_progress: HashSet<CellId>,
}

impl<'a> CellHasher<'a> {
    pub fn new(arena: &'a CellArena) -> Self {
        CellHasher {
            arena,
            tree: HashedTree::default(),
            memo: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Representation hash of a cell.
    pub fn hash(&mut self, id: CellId) -> CellResult<CellHash> {
        self.hash_at(id, MAX_LEVEL)
    }

    /// Hash of a cell at `level`.
    pub fn hash_at(&mut self, id: CellId, level: u8) -> CellResult<CellHash> {
        let node = self.snapshot(id)?;
        Ok(self.tree.node(node).hash(level))
    }

    /// Representation depth of a cell.
    pub fn depth(&mut self, id: CellId) -> CellResult<u16> {
        self.depth_at(id, MAX_LEVEL)
    }

    pub fn depth_at(&mut self, id: CellId, level: u8) -> CellResult<u16> {
        let node = self.snapshot(id)?;
        Ok(self.tree.node(node).depth(level))
    }

    /// Representation hash as lowercase hex.
    pub fn hash_hex(&mut self, id: CellId) -> CellResult<String> {
        Ok(hex::encode(self.hash(id)?))
    }

    /// Hash `id` and everything it references; return its node index.
    pub fn snapshot(&mut self, id: CellId) -> CellResult<NodeId> {
        let result = self.visit(id, 0);
        if result.is_err() {
            self.in_progress.clear();
        }
        result
    }

    /// Snapshots produced so far.
    pub fn tree(&self) -> &HashedTree {
        &self.tree
    }

    pub fn into_tree(self) -> HashedTree {
        self.tree
    }

    fn visit(&mut self, id: CellId, stack_depth: usize) -> CellResult<NodeId> {
        if let Some(&node) = self.memo.get(&id) {
            return Ok(node);
        }
        if stack_depth > MAX_CELL_DEPTH {
            return Err(CellError::DepthExceeded(MAX_CELL_DEPTH));
        }
        if !self.in_progress.insert(id) {
            return Err(CellError::CircularReference(id.index()));
        }

        let arena = self.arena;
        let cell = arena.get(id)?;
        let mut references = Vec::with_capacity(cell.reference_count());
        for &child in cell.references() {
            references.push(self.visit(child, stack_depth + 1)?);
        }
        self.in_progress.remove(&id);

        let node = hash_cell(
            &self.tree,
            cell.cell_type(),
            cell.bits().clone(),
            references,
            cell.level_mask(),
        )?;
        self.tree.nodes.push(node);
        let index = self.tree.nodes.len() - 1;
        self.memo.insert(id, index);
        Ok(index)
    }
}

/// Validate one cell against its already hashed children and compute all of
/// its levels.
fn hash_cell(
    tree: &HashedTree,
    cell_type: CellType,
    bits: BitBuffer,
    references: Vec<NodeId>,
    declared_mask: LevelMask,
) -> CellResult<ImmutableCell> {
    let children: Vec<&ImmutableCell> = references.iter().map(|&r| tree.node(r)).collect();
    let level_mask = effective_level_mask(cell_type, &bits, &children, declared_mask)?;

    let mut cell = ImmutableCell {
        cell_type,
        bits,
        references,
        level_mask,
        hashes: Vec::with_capacity(level_mask.hashes_count()),
        depths: Vec::with_capacity(level_mask.hashes_count()),
    };

    let offset = cell.stored_levels();
    let child_shift = cell_type.is_merkle() as u8;

    for (hash_index, level) in level_mask.significant_levels().enumerate() {
        if hash_index < offset {
            continue;
        }

        let mut repr = Vec::with_capacity(2 + 128 + children.len() * (HASH_BYTES + DEPTH_BYTES));
        repr.extend_from_slice(&cell.descriptors_at(level));
        match cell.hashes.last() {
            Some(previous) if hash_index > offset => repr.extend_from_slice(previous),
            _ => repr.extend_from_slice(&cell.bits.to_top_upped()),
        }

        let child_level = level + child_shift;
        let mut depth = 0u16;
        for child in &children {
            let child_depth = child.depth(child_level);
            if child_depth as usize >= MAX_CELL_DEPTH {
                return Err(CellError::DepthExceeded(MAX_CELL_DEPTH));
            }
            repr.extend_from_slice(&child_depth.to_be_bytes());
            depth = depth.max(child_depth + 1);
        }
        for child in &children {
            repr.extend_from_slice(&child.hash(child_level));
        }

        cell.hashes.push(sha256(&repr));
        cell.depths.push(depth);
    }

    Ok(cell)
}

fn effective_level_mask(
    cell_type: CellType,
    bits: &BitBuffer,
    children: &[&ImmutableCell],
    declared_mask: LevelMask,
) -> CellResult<LevelMask> {
    let data = bits.as_bytes();
    if cell_type.is_exotic() {
        if bits.len() < 8 {
            return Err(invalid_exotic(cell_type, "missing type byte"));
        }
        if data[0] != cell_type as u8 {
            return Err(invalid_exotic(cell_type, "type byte does not match"));
        }
    }

    match cell_type {
        CellType::Ordinary => Ok(children
            .iter()
            .fold(LevelMask::default(), |mask, child| mask | child.level_mask)),

        CellType::PrunedBranch => {
            expect_refs(cell_type, children, 0)?;
            if bits.len() < 16 {
                return Err(invalid_exotic(cell_type, "missing level mask byte"));
            }
            let stored = data[1];
            if stored == 0 || stored > 0b111 {
                return Err(invalid_exotic(
                    cell_type,
                    &format!("invalid level mask {}", stored),
                ));
            }
            let mask = LevelMask::new(stored);
            if mask != declared_mask {
                return Err(invalid_exotic(
                    cell_type,
                    &format!(
                        "level mask {} differs from declared {}",
                        stored,
                        declared_mask.mask()
                    ),
                ));
            }
            let levels = mask.hash_index();
            expect_bits(cell_type, bits, 16 + levels * (HASH_BYTES + DEPTH_BYTES) * 8)?;
            Ok(mask)
        }

        CellType::Library => {
            expect_refs(cell_type, children, 0)?;
            expect_bits(cell_type, bits, 8 + HASH_BYTES * 8)?;
            Ok(LevelMask::default())
        }

        CellType::MerkleProof => {
            expect_refs(cell_type, children, 1)?;
            expect_bits(cell_type, bits, 8 + (HASH_BYTES + DEPTH_BYTES) * 8)?;
            check_merkle_child(cell_type, data, 1, 1 + HASH_BYTES, children[0])?;
            Ok(children[0].level_mask.shift_right())
        }

        CellType::MerkleUpdate => {
            expect_refs(cell_type, children, 2)?;
            expect_bits(cell_type, bits, 8 + 2 * (HASH_BYTES + DEPTH_BYTES) * 8)?;
            let depths = 1 + 2 * HASH_BYTES;
            for (i, child) in children.iter().enumerate() {
                check_merkle_child(
                    cell_type,
                    data,
                    1 + i * HASH_BYTES,
                    depths + i * DEPTH_BYTES,
                    child,
                )?;
            }
            Ok((children[0].level_mask | children[1].level_mask).shift_right())
        }
    }
}

fn check_merkle_child(
    cell_type: CellType,
    data: &[u8],
    hash_at: usize,
    depth_at: usize,
    child: &ImmutableCell,
) -> CellResult<()> {
    if data[hash_at..hash_at + HASH_BYTES] != child.hash(0) {
        return Err(invalid_exotic(cell_type, "stored hash does not match child"));
    }
    let depth = u16::from_be_bytes([data[depth_at], data[depth_at + 1]]);
    if depth != child.depth(0) {
        return Err(invalid_exotic(
            cell_type,
            &format!("stored depth {} does not match child depth {}", depth, child.depth(0)),
        ));
    }
    Ok(())
}

fn expect_refs(cell_type: CellType, children: &[&ImmutableCell], count: usize) -> CellResult<()> {
    if children.len() != count {
        return Err(invalid_exotic(
            cell_type,
            &format!("expected {} references, got {}", count, children.len()),
        ));
    }
    Ok(())
}

fn expect_bits(cell_type: CellType, bits: &BitBuffer, len: usize) -> CellResult<()> {
    if bits.len() != len {
        return Err(invalid_exotic(
            cell_type,
            &format!("expected {} bits, got {}", len, bits.len()),
        ));
    }
    Ok(())
}

fn invalid_exotic(cell_type: CellType, reason: &str) -> CellError {
    CellError::InvalidExoticCell(format!("{:?}: {}", cell_type, reason))
}
