//! Merkle proof construction.
//!
//! A proof is a copy of a cell tree in which selected subtrees are replaced
//! by pruned branches. A pruned branch stores the level-0 hash and depth of
//! the subtree it replaces, so the level-0 hash of the copy equals the hash
//! of the original tree. The copy is wrapped in a MerkleProof cell that
//! records that hash.
//!
//! ```
//! use ton_boc::{BagOfCells, Cell, CellArena, CellType, MerkleProver};
//!
//! let mut arena = CellArena::new();
//! let mut secret = Cell::new();
//! secret.store_u64(42).unwrap();
//! let secret = arena.insert(secret);
//! let mut root = Cell::new();
//! root.store_u8(1).unwrap();
//! root.add_reference(secret).unwrap();
//! let root = arena.insert(root);
//!
//! let prover = MerkleProver::new(&arena, root).unwrap();
//! prover.cursor().reference(0).unwrap().prune();
//! let bytes = prover.create_proof().unwrap();
//!
//! let (proof, proof_root) = BagOfCells::deserialize_single_root(&bytes).unwrap();
//! assert_eq!(proof.get(proof_root).unwrap().cell_type(), CellType::MerkleProof);
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::{
    BagOfCells, BocOptions, Cell, CellArena, CellError, CellHash, CellHasher, CellId, CellResult,
    CellType, HashedTree, LevelMask, NodeId,
};

/// Builds Merkle proofs over a hashed snapshot of a tree.
///
/// Nodes are marked for pruning through [`Cursor`]s. A cell reachable over
/// several paths is a single node, so pruning it affects every occurrence.
#[derive(Debug)]
pub struct MerkleProver {
    tree: HashedTree,
    root: NodeId,
    pruned: RefCell<HashSet<NodeId>>,
}

impl MerkleProver {
    /// Hash the tree under `root`.
    pub fn new(arena: &CellArena, root: CellId) -> CellResult<Self> {
        let mut hasher = CellHasher::new(arena);
        let root = hasher.snapshot(root)?;
        Ok(MerkleProver {
            tree: hasher.into_tree(),
            root,
            pruned: RefCell::new(HashSet::new()),
        })
    }

    /// Cursor at the root.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            prover: self,
            node: self.root,
        }
    }

    /// Level-0 hash of the original root.
    pub fn root_hash(&self) -> CellHash {
        self.tree.node(self.root).hash(0)
    }

    /// Level-0 depth of the original root.
    pub fn root_depth(&self) -> u16 {
        self.tree.node(self.root).depth(0)
    }

    /// Build the proof as a bag whose single root is the MerkleProof cell.
    pub fn build_proof(&self) -> CellResult<BagOfCells> {
        let mut arena = CellArena::new();
        let mut memo = HashMap::new();
        let inner = self.rebuild(self.root, &mut arena, &mut memo)?;
        let inner_mask = arena.get(inner)?.level_mask();

        let mut proof = Cell::exotic(CellType::MerkleProof);
        proof
            .store_u8(CellType::MerkleProof as u8)?
            .store_bytes(&self.root_hash())?
            .store_u16(self.root_depth())?
            .add_reference(inner)?;
        proof.set_level_mask(inner_mask.shift_right());
        let root = arena.insert(proof);

        debug!(
            "Built Merkle proof: {} cells, {} pruned",
            arena.len(),
            self.pruned.borrow().len()
        );
        Ok(BagOfCells::from_root(arena, root))
    }

    /// Build the proof and serialize it without index and checksum.
    pub fn create_proof(&self) -> CellResult<Vec<u8>> {
        self.build_proof()?
            .serialize_with_options(&BocOptions::plain())
    }

    fn rebuild(
        &self,
        node: NodeId,
        arena: &mut CellArena,
        memo: &mut HashMap<NodeId, CellId>,
    ) -> CellResult<CellId> {
        if let Some(&id) = memo.get(&node) {
            return Ok(id);
        }

        let source = self.tree.node(node);
        if source.cell_type().is_merkle() {
            return Err(CellError::UnsupportedCellType(source.cell_type()));
        }
        let cell = if self.pruned.borrow().contains(&node) {
            let mut branch = Cell::exotic(CellType::PrunedBranch);
            branch
                .store_u8(CellType::PrunedBranch as u8)?
                .store_u8(1)?
                .store_bytes(&source.hash(0))?
                .store_u16(source.depth(0))?;
            branch.set_level_mask(LevelMask::one_level(1));
            branch
        } else {
            let mut copy = Cell::exotic(source.cell_type());
            copy.store_buffer(source.bits())?;
            let mut mask = source.level_mask();
            for &child in source.references() {
                let child = self.rebuild(child, arena, memo)?;
                mask = mask | arena.get(child)?.level_mask();
                copy.add_reference(child)?;
            }
            copy.set_level_mask(mask);
            copy
        };

        let id = arena.insert(cell);
        memo.insert(node, id);
        Ok(id)
    }
}

/// Position in the tree of a [`MerkleProver`].
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    prover: &'a MerkleProver,
    node: NodeId,
}

impl<'a> Cursor<'a> {
    /// Replace this subtree with a pruned branch in proofs built afterwards.
    pub fn prune(&self) {
        self.prover.pruned.borrow_mut().insert(self.node);
    }

    /// Whether this subtree is marked for pruning.
    pub fn is_pruned(&self) -> bool {
        self.prover.pruned.borrow().contains(&self.node)
    }

    /// Cursor at the `index`-th child.
    pub fn reference(&self, index: usize) -> CellResult<Cursor<'a>> {
        let references = self.prover.tree.node(self.node).references();
        let node = *references.get(index).ok_or(CellError::NotEnoughRefs {
            need: index + 1,
            have: references.len(),
        })?;
        Ok(Cursor {
            prover: self.prover,
            node,
        })
    }

    /// Snapshot node under the cursor. Cells reachable over several paths
    /// share one node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Level-0 hash of the subtree.
    pub fn hash(&self) -> CellHash {
        self.prover.tree.node(self.node).hash(0)
    }

    pub fn cell_type(&self) -> CellType {
        self.prover.tree.node(self.node).cell_type()
    }

    pub fn reference_count(&self) -> usize {
        self.prover.tree.node(self.node).references().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root -> (left -> leaf, right)
    fn sample_tree() -> (CellArena, CellId) {
        let mut arena = CellArena::new();
        let mut leaf = Cell::new();
        leaf.store_u32(0xCAFEBABE).unwrap();
        let leaf = arena.insert(leaf);

        let mut left = Cell::new();
        left.store_u8(1).unwrap();
        left.add_reference(leaf).unwrap();
        let left = arena.insert(left);

        let mut right = Cell::new();
        right.store_bytes(b"right").unwrap();
        let right = arena.insert(right);

        let mut root = Cell::new();
        root.store_u16(0xF00D).unwrap();
        root.add_reference(left).unwrap();
        root.add_reference(right).unwrap();
        let root = arena.insert(root);
        (arena, root)
    }

    fn proof_parts(bag: &BagOfCells) -> (CellId, CellId) {
        let root = bag.single_root().unwrap();
        let inner = bag.arena().get(root).unwrap().reference(0).unwrap();
        (root, inner)
    }

    #[test]
    fn test_proof_without_pruning() {
        let (arena, root) = sample_tree();
        let prover = MerkleProver::new(&arena, root).unwrap();
        assert_eq!(prover.root_hash(), arena.hash(root).unwrap());
        assert_eq!(prover.root_depth(), 2);

        let bag = prover.build_proof().unwrap();
        let (proof_root, inner) = proof_parts(&bag);
        let proof = bag.arena().get(proof_root).unwrap();
        assert_eq!(proof.cell_type(), CellType::MerkleProof);
        assert_eq!(proof.bit_len(), 280);
        assert_eq!(&proof.data()[1..33], &prover.root_hash());

        assert_eq!(bag.arena().hash(inner).unwrap(), arena.hash(root).unwrap());
        assert_eq!(bag.arena().len(), 5);
    }

    #[test]
    fn test_pruned_child_keeps_root_hash() {
        let (arena, root) = sample_tree();
        let prover = MerkleProver::new(&arena, root).unwrap();
        let left = prover.cursor().reference(0).unwrap();
        left.prune();
        assert!(left.is_pruned());

        let bag = prover.build_proof().unwrap();
        let (proof_root, inner) = proof_parts(&bag);

        let mut hasher = CellHasher::new(bag.arena());
        assert_eq!(hasher.hash_at(inner, 0).unwrap(), prover.root_hash());
        assert_eq!(hasher.depth_at(inner, 0).unwrap(), prover.root_depth());
        // The proof cell itself is back at level 0
        let proof_node = hasher.snapshot(proof_root).unwrap();
        assert_eq!(hasher.tree().get(proof_node).unwrap().level(), 0);

        let inner_cell = bag.arena().get(inner).unwrap();
        assert_eq!(inner_cell.level_mask(), LevelMask::new(1));
        let pruned = bag.arena().get(inner_cell.reference(0).unwrap()).unwrap();
        assert_eq!(pruned.cell_type(), CellType::PrunedBranch);
        assert_eq!(pruned.reference_count(), 0);
        assert_eq!(&pruned.data()[2..34], &left.hash());

        // leaf is gone: proof, root, pruned left, right
        assert_eq!(bag.arena().len(), 4);
    }

    #[test]
    fn test_prune_root() {
        let (arena, root) = sample_tree();
        let prover = MerkleProver::new(&arena, root).unwrap();
        prover.cursor().prune();

        let bytes = prover.create_proof().unwrap();
        let (proof, proof_root) = BagOfCells::deserialize_single_root(&bytes).unwrap();
        let inner = proof.get(proof_root).unwrap().reference(0).unwrap();
        assert_eq!(proof.get(inner).unwrap().cell_type(), CellType::PrunedBranch);
        assert_eq!(
            CellHasher::new(&proof).hash_at(inner, 0).unwrap(),
            arena.hash(root).unwrap()
        );
    }

    #[test]
    fn test_create_proof_is_plain() {
        let (arena, root) = sample_tree();
        let prover = MerkleProver::new(&arena, root).unwrap();
        let bytes = prover.create_proof().unwrap();
        // generic magic, no index, no checksum, size_bytes 1
        assert_eq!(&bytes[..5], &[0xb5, 0xee, 0x9c, 0x72, 0x01]);
    }

    #[test]
    fn test_cursor_navigation() {
        let (arena, root) = sample_tree();
        let prover = MerkleProver::new(&arena, root).unwrap();
        let cursor = prover.cursor();
        assert_eq!(cursor.reference_count(), 2);
        assert_eq!(cursor.cell_type(), CellType::Ordinary);

        let leaf = cursor.reference(0).unwrap().reference(0).unwrap();
        assert_eq!(leaf.reference_count(), 0);
        assert_eq!(
            leaf.reference(0).unwrap_err(),
            CellError::NotEnoughRefs { need: 1, have: 0 }
        );
        assert_eq!(
            cursor.reference(2).unwrap_err(),
            CellError::NotEnoughRefs { need: 3, have: 2 }
        );
    }

    #[test]
    fn test_shared_subtree_emitted_once() {
        let mut arena = CellArena::new();
        let mut shared = Cell::new();
        shared.store_u8(9).unwrap();
        let shared = arena.insert(shared);
        let root = arena.new_cell();
        arena.add_reference(root, shared).unwrap();
        arena.add_reference(root, shared).unwrap();

        let prover = MerkleProver::new(&arena, root).unwrap();
        let bag = prover.build_proof().unwrap();
        let (_, inner) = proof_parts(&bag);
        let inner_cell = bag.arena().get(inner).unwrap();
        assert_eq!(inner_cell.reference(0), inner_cell.reference(1));
        assert_eq!(bag.arena().len(), 3);
    }

    #[test]
    fn test_merkle_cell_not_supported() {
        let (mut arena, root) = sample_tree();
        let inner_prover = MerkleProver::new(&arena, root).unwrap();
        let nested = inner_prover.build_proof().unwrap();
        let (nested_arena, nested_root) = nested.into_parts();
        let nested_root = nested_root[0];

        // Rebuild the nested proof inside the original arena
        let mut translated = HashMap::new();
        for id in nested_arena.ids() {
            let cell = nested_arena.get(id).unwrap();
            let refs: Vec<CellId> = cell.references().iter().map(|r| translated[r]).collect();
            let copy =
                Cell::from_parts(cell.cell_type(), cell.bits().clone(), refs, cell.level_mask())
                    .unwrap();
            translated.insert(id, arena.insert(copy));
        }

        let mut top = Cell::new();
        top.add_reference(translated[&nested_root]).unwrap();
        let top = arena.insert(top);

        let prover = MerkleProver::new(&arena, top).unwrap();
        assert_eq!(
            prover.build_proof().unwrap_err(),
            CellError::UnsupportedCellType(CellType::MerkleProof)
        );

        // A pruned Merkle cell is rejected as well
        let nested = prover.cursor().reference(0).unwrap();
        nested.prune();
        assert_eq!(nested.cell_type(), CellType::MerkleProof);
        assert_eq!(
            prover.create_proof().unwrap_err(),
            CellError::UnsupportedCellType(CellType::MerkleProof)
        );

        // Pruning above it hides it
        prover.cursor().prune();
        assert!(prover.build_proof().is_ok());
    }
}
