//! Known byte-level vectors and malformed bags.

use num_bigint::BigUint;
use ton_boc::{BagOfCells, BocOptions, Cell, CellArena, CellError, CellId, CellType, LevelMask};

const EMPTY_CELL_HASH: &str = "96a296d224f285c67bee93c30f8a309157f0daa35dc5b87e410b78630a09cfc7";

/// Root over two 33-cell chains ending in 0xAA and 0xBB, no index, no CRC.
const TWO_CHAINS_BOC: &str = concat!(
    "b5ee9c720102430100010a000200010201021f0301021f2301021e0401021d0501021c06",
    "01021b0701021a08010219090102180a0102170b0102160c0102150d0102140e0102130f",
    "01021210010211110102101201020f1301020e1401020d1501020c1601020b1701020a18",
    "010209190102081a0102071b0102061c0102051d0102041e0102031f0102022001020121",
    "010200220002aa01021e2401021d2501021c2601021b2701021a28010219290102182a01",
    "02172b0102162c0102152d0102142e0102132f01021230010211310102103201020f3301",
    "020e3401020d3501020c3601020b3701020a38010209390102083a0102073b0102063c01",
    "02053d0102043e0102033f0102024001020141010200420002bb",
);

#[test]
fn empty_cell_bag() {
    let mut arena = CellArena::new();
    let root = arena.new_cell();
    assert_eq!(arena.hash_hex(root).unwrap(), EMPTY_CELL_HASH);

    let bag = BagOfCells::from_root(arena, root);
    let bytes = bag.serialize().unwrap();
    assert_eq!(
        bytes,
        vec![
            0xb5, 0xee, 0x9c, 0x72, 0x41, 0x01, 0x01, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x4c,
            0xac, 0xb9, 0xcd
        ]
    );
    assert_eq!(bag.to_base64().unwrap(), "te6cckEBAQEAAgAAAEysuc0=");

    let (arena, root) = BagOfCells::deserialize_single_root(&bytes).unwrap();
    assert_eq!(arena.hash_hex(root).unwrap(), EMPTY_CELL_HASH);
}

#[test]
fn two_cell_bag_from_base64() {
    let bag = BagOfCells::from_base64("te6cckEBAgEACgABAqsBAAgSNFZ4NDG7Qg==").unwrap();
    let root = bag.single_root().unwrap();
    let arena = bag.arena();

    let mut slice = arena.get(root).unwrap().parse();
    assert_eq!(slice.load_u8().unwrap(), 0xAB);
    let child = slice.load_ref().unwrap();
    assert!(slice.is_empty());

    let mut slice = arena.get(child).unwrap().parse();
    assert_eq!(slice.load_u32().unwrap(), 0x12345678);

    assert_eq!(
        arena.hash_hex(root).unwrap(),
        "1435c083475305fc86f7b07c964ec7823320d82c31c830c9e53acc8448947d69"
    );
    assert_eq!(
        bag.to_hex().unwrap(),
        "b5ee9c7241010201000a000102ab010008123456783431bb42"
    );
}

#[test]
fn url_safe_base64_accepted() {
    let mut arena = CellArena::new();
    let mut cell = Cell::new();
    cell.store_bytes(&[0xfb, 0xff, 0xbf]).unwrap();
    let root = arena.insert(cell);
    let bytes = BagOfCells::from_root(arena, root).serialize().unwrap();

    use base64::Engine;
    let url_safe = base64::engine::general_purpose::URL_SAFE.encode(&bytes);
    let decoded = BagOfCells::from_base64(&url_safe).unwrap();
    let root = decoded.single_root().unwrap();
    assert_eq!(decoded.arena().get(root).unwrap().data(), &[0xfb, 0xff, 0xbf]);
}

#[test]
fn uint_533_then_bit() {
    let mut arena = CellArena::new();
    let mut cell = Cell::new();
    cell.store_big_uint(&BigUint::from(533u32), 15).unwrap();
    cell.store_bit(true).unwrap();
    let root = arena.insert(cell);

    let bytes = BagOfCells::from_root(arena, root).serialize().unwrap();
    let (arena, root) = BagOfCells::deserialize_single_root(&bytes).unwrap();

    let mut slice = arena.get(root).unwrap().parse();
    assert_eq!(slice.load_big_uint(15).unwrap(), BigUint::from(533u32));
    assert!(slice.load_bit().unwrap());
}

#[test]
fn cycle_is_rejected() {
    let mut arena = CellArena::new();
    let a = arena.new_cell();
    let b = arena.new_cell();
    let c = arena.new_cell();
    arena.add_reference(a, b).unwrap();
    arena.add_reference(b, c).unwrap();
    arena.add_reference(c, a).unwrap();

    let bag = BagOfCells::from_root(arena, a);
    assert!(matches!(
        bag.serialize(),
        Err(CellError::CircularReference(_))
    ));
}

#[test]
fn backward_reference_is_rejected() {
    // cell 0: empty, cell 1: references cell 0
    let bytes = hex::decode("b5ee9c72010102010005010000010000").unwrap();
    assert_eq!(
        BagOfCells::deserialize(&bytes).unwrap_err(),
        CellError::BrokenTopology {
            cell: 1,
            reference: 0
        }
    );
}

#[test]
fn every_flipped_byte_is_detected() {
    let mut arena = CellArena::new();
    let mut child = Cell::new();
    child.store_bytes(b"payload").unwrap();
    let child = arena.insert(child);
    let mut root = Cell::new();
    root.store_u16(7).unwrap();
    root.add_reference(child).unwrap();
    let root = arena.insert(root);

    let bytes = BagOfCells::from_root(arena, root)
        .serialize_with_options(&BocOptions::indexed())
        .unwrap();

    for i in 0..bytes.len() {
        let mut corrupted = bytes.clone();
        corrupted[i] ^= 0x10;
        let result = BagOfCells::deserialize(&corrupted);
        if i >= 5 {
            assert!(
                matches!(result, Err(CellError::ChecksumMismatch { .. })),
                "byte {}: {:?}",
                i,
                result
            );
        } else {
            assert!(result.is_err(), "byte {}", i);
        }
    }
}

#[test]
fn pruned_branch_survives_roundtrip() {
    let mut arena = CellArena::new();
    let mut hidden = Cell::new();
    hidden.store_u64(0xDEAD_BEEF_CAFE_BABE).unwrap();
    let hidden = arena.insert(hidden);
    let hash = arena.hash(hidden).unwrap();

    let mut pruned = Cell::exotic(CellType::PrunedBranch);
    pruned
        .store_u8(1)
        .unwrap()
        .store_u8(1)
        .unwrap()
        .store_bytes(&hash)
        .unwrap()
        .store_u16(0)
        .unwrap();
    pruned.set_level_mask(LevelMask::new(1));
    let pruned = arena.insert(pruned);
    let root = arena.new_cell();
    arena.add_reference(root, pruned).unwrap();

    let bag = BagOfCells::from_root(arena, root);
    let bytes = bag.serialize().unwrap();
    // root d1: 1 reference, level mask 1
    assert_eq!(bytes[11], 0x21);

    let decoded = BagOfCells::deserialize(&bytes).unwrap();
    let root = decoded.single_root().unwrap();
    assert_eq!(
        decoded.arena().hash(root).unwrap(),
        bag.arena().hash(bag.roots()[0]).unwrap()
    );
    let pruned = decoded.arena().get(root).unwrap().reference(0).unwrap();
    let cell = decoded.arena().get(pruned).unwrap();
    assert_eq!(cell.cell_type(), CellType::PrunedBranch);
    assert_eq!(cell.level_mask().mask(), 1);
    assert_eq!(pruned, CellId::from(1));
}

/// A chain of `len` cells: a leaf holding `leaf`, wrapped by cells holding
/// 0, 1, 2, ...
fn chain(arena: &mut CellArena, leaf: u8, len: u8) -> CellId {
    let mut cell = Cell::new();
    cell.store_u8(leaf).unwrap();
    let mut id = arena.insert(cell);
    for i in 0..len - 1 {
        let mut cell = Cell::new();
        cell.store_u8(i).unwrap();
        cell.add_reference(id).unwrap();
        id = arena.insert(cell);
    }
    id
}

#[test]
fn heavy_subtrees_use_canonical_order() {
    let mut arena = CellArena::new();
    let left = chain(&mut arena, 0xAA, 33);
    let right = chain(&mut arena, 0xBB, 33);
    let root = arena.new_cell();
    arena.add_reference(root, left).unwrap();
    arena.add_reference(root, right).unwrap();

    let bag = BagOfCells::from_root(arena, root);
    let bytes = bag.serialize_with_options(&BocOptions::plain()).unwrap();
    assert_eq!(hex::encode(&bytes), TWO_CHAINS_BOC);

    // Both chain heads are stored right after the root
    let decoded = BagOfCells::deserialize(&bytes).unwrap();
    let root = decoded.single_root().unwrap();
    assert_eq!(
        decoded.arena().get(root).unwrap().references(),
        &[CellId::from(1), CellId::from(2)]
    );
    assert_eq!(
        decoded.serialize_with_options(&BocOptions::plain()).unwrap(),
        bytes
    );
}
