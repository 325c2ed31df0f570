//! Bag of Cells (BoC) serialization format.
//!
//! A bag stores a rooted cell DAG as a flat, topologically ordered list:
//! every cell appears after all cells that reference it, so each stored
//! reference index is greater than the index of the cell holding it.
//! Identical subtrees are stored once.
//!
//! ## Layout
//!
//! ```text
//! magic (4) | flags (1) | off_bytes (1)
//! cell_count | root_count | absent_count      (size_bytes each)
//! tot_cells_size                              (off_bytes)
//! root indices                                (size_bytes each)
//! [index: cumulative cell end offsets]        (off_bytes each)
//! cells: d1 | d2 | data | reference indices
//! [CRC32C of everything above, little-endian]
//! ```
//!
//! Reference: ton-blockchain/ton/crypto/vm/boc.cpp

use std::collections::{HashMap, HashSet};

use base64::Engine;
use tracing::{debug, trace};

use crate::{
    crc32c, BitBuffer, Cell, CellArena, CellError, CellHash, CellHasher, CellId, CellResult,
    CellType, HashedTree, LevelMask, NodeId, BOC_GENERIC_MAGIC, BOC_INDEXED_CRC32_MAGIC,
    BOC_INDEXED_MAGIC, DEPTH_BYTES, HASH_BYTES, MAX_CELL_REFS,
};

/// Serialization settings for [`BagOfCells`].
///
/// The default writes a CRC32C and no index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BocOptions {
    /// Store the offset index after the root list.
    pub with_index: bool,
    /// Append a CRC32C checksum.
    pub with_crc32: bool,
    /// Mark cells referenced more than once in the index. Requires the index.
    pub with_cache_bits: bool,
    /// Two user flag bits carried in the header.
    pub flags: u8,
}

impl Default for BocOptions {
    fn default() -> Self {
        BocOptions {
            with_index: false,
            with_crc32: true,
            with_cache_bits: false,
            flags: 0,
        }
    }
}

impl BocOptions {
    /// No index, no checksum.
    pub fn plain() -> Self {
        BocOptions {
            with_crc32: false,
            ..Self::default()
        }
    }

    /// Index and checksum.
    pub fn indexed() -> Self {
        BocOptions {
            with_index: true,
            ..Self::default()
        }
    }

    pub fn index(mut self, enabled: bool) -> Self {
        self.with_index = enabled;
        self
    }

    pub fn crc32(mut self, enabled: bool) -> Self {
        self.with_crc32 = enabled;
        self
    }

    pub fn cache_bits(mut self, enabled: bool) -> Self {
        self.with_cache_bits = enabled;
        self
    }

    pub fn user_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    fn validate(&self) -> CellResult<()> {
        if self.with_cache_bits && !self.with_index {
            return Err(CellError::InvalidBoc(
                "cache bits require an index".to_string(),
            ));
        }
        if self.flags > 0b11 {
            return Err(CellError::InvalidBoc(format!(
                "flags {} do not fit into 2 bits",
                self.flags
            )));
        }
        Ok(())
    }
}

/// Bag of Cells: an arena together with its root cells.
#[derive(Debug, Clone)]
pub struct BagOfCells {
    arena: CellArena,
    roots: Vec<CellId>,
}

impl BagOfCells {
    /// Create a bag with the given roots.
    pub fn new(arena: CellArena, roots: Vec<CellId>) -> Self {
        BagOfCells { arena, roots }
    }

    /// Create a bag with a single root.
    pub fn from_root(arena: CellArena, root: CellId) -> Self {
        Self::new(arena, vec![root])
    }

    pub fn roots(&self) -> &[CellId] {
        &self.roots
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn arena(&self) -> &CellArena {
        &self.arena
    }

    pub fn into_parts(self) -> (CellArena, Vec<CellId>) {
        (self.arena, self.roots)
    }

    /// The only root (errors if not exactly one).
    pub fn single_root(&self) -> CellResult<CellId> {
        match self.roots.as_slice() {
            [root] => Ok(*root),
            roots => Err(CellError::UnexpectedRootCount(roots.len())),
        }
    }

    /// Serialize with the default options (CRC32C, no index).
    pub fn serialize(&self) -> CellResult<Vec<u8>> {
        self.serialize_with_options(&BocOptions::default())
    }

    /// Serialize with explicit options.
    pub fn serialize_with_options(&self, options: &BocOptions) -> CellResult<Vec<u8>> {
        if self.roots.is_empty() {
            return Err(CellError::InvalidBoc("no root cells".to_string()));
        }
        options.validate()?;

        let mut hasher = CellHasher::new(&self.arena);
        let root_nodes = self
            .roots
            .iter()
            .map(|&root| hasher.snapshot(root))
            .collect::<CellResult<Vec<_>>>()?;
        let tree = hasher.into_tree();

        let order = TopologicalOrder::build(&tree, &root_nodes)?;
        let cell_count = order.cells.len();
        let size_bytes = bytes_needed(cell_count);

        let mut cells_data = Vec::new();
        let mut ends = Vec::with_capacity(cell_count);
        for &node in &order.cells {
            let cell = tree.node(node);
            cells_data.extend_from_slice(&cell.descriptors());
            cells_data.extend_from_slice(&cell.bits().to_top_upped());
            for &child in cell.references() {
                let index = order.index_of(&tree, child)?;
                put_uint(&mut cells_data, index as u64, size_bytes);
            }
            ends.push(cells_data.len());
        }

        let total_size = cells_data.len();
        let off_bytes = if options.with_cache_bits {
            bytes_needed(total_size * 2)
        } else {
            bytes_needed(total_size)
        };

        let mut result = Vec::with_capacity(32 + cells_data.len());
        result.extend_from_slice(&BOC_GENERIC_MAGIC.to_be_bytes());
        result.push(
            (options.with_index as u8) << 7
                | (options.with_crc32 as u8) << 6
                | (options.with_cache_bits as u8) << 5
                | options.flags << 3
                | size_bytes as u8,
        );
        result.push(off_bytes as u8);
        put_uint(&mut result, cell_count as u64, size_bytes);
        put_uint(&mut result, self.roots.len() as u64, size_bytes);
        put_uint(&mut result, 0, size_bytes);
        put_uint(&mut result, total_size as u64, off_bytes);

        for &root in &root_nodes {
            put_uint(&mut result, order.index_of(&tree, root)? as u64, size_bytes);
        }

        if options.with_index {
            for (i, &end) in ends.iter().enumerate() {
                let entry = if options.with_cache_bits {
                    end * 2 + order.should_cache[i] as usize
                } else {
                    end
                };
                put_uint(&mut result, entry as u64, off_bytes);
            }
        }

        result.extend_from_slice(&cells_data);

        if options.with_crc32 {
            let crc = crc32c(&result);
            result.extend_from_slice(&crc.to_le_bytes());
        }

        debug!(
            "Serialized bag of cells: {} cells, {} roots, {} bytes",
            cell_count,
            self.roots.len(),
            result.len()
        );
        Ok(result)
    }

    /// Serialize with default options as lowercase hex.
    pub fn to_hex(&self) -> CellResult<String> {
        Ok(hex::encode(self.serialize()?))
    }

    /// Serialize with default options as standard base64.
    pub fn to_base64(&self) -> CellResult<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.serialize()?))
    }

    /// Deserialize from bytes.
    ///
    /// Supports all three BoC formats:
    /// - `0xb5ee9c72` - generic BoC with a flags byte
    /// - `0x68ff65f3` - indexed BoC
    /// - `0xacc3a728` - indexed BoC with CRC32C
    pub fn deserialize(data: &[u8]) -> CellResult<Self> {
        let mut reader = ByteReader::new(data);
        let magic = u32::from_be_bytes([
            reader.read_u8()?,
            reader.read_u8()?,
            reader.read_u8()?,
            reader.read_u8()?,
        ]);

        let header_byte = reader.read_u8()?;
        let (has_idx, has_crc, has_cache_bits, size_bytes) = match magic {
            BOC_GENERIC_MAGIC => (
                header_byte & 0x80 != 0,
                header_byte & 0x40 != 0,
                header_byte & 0x20 != 0,
                (header_byte & 0x07) as usize,
            ),
            BOC_INDEXED_MAGIC => (true, false, false, header_byte as usize),
            BOC_INDEXED_CRC32_MAGIC => (true, true, false, header_byte as usize),
            _ => {
                return Err(CellError::InvalidBoc(format!(
                    "unknown magic {:08x}",
                    magic
                )))
            }
        };

        if has_crc {
            if data.len() < reader.position() + 4 {
                return Err(CellError::UnexpectedEof);
            }
            let body_len = data.len() - 4;
            let expected = u32::from_le_bytes([
                data[body_len],
                data[body_len + 1],
                data[body_len + 2],
                data[body_len + 3],
            ]);
            let actual = crc32c(&data[..body_len]);
            if expected != actual {
                return Err(CellError::ChecksumMismatch { expected, actual });
            }
            reader.limit(body_len);
        }

        if !(1..=4).contains(&size_bytes) {
            return Err(CellError::InvalidBoc(format!(
                "invalid size_bytes {}",
                size_bytes
            )));
        }
        let off_bytes = reader.read_u8()? as usize;
        if !(1..=8).contains(&off_bytes) {
            return Err(CellError::InvalidBoc(format!(
                "invalid off_bytes {}",
                off_bytes
            )));
        }
        if has_cache_bits && !has_idx {
            return Err(CellError::InvalidBoc(
                "cache bits without an index".to_string(),
            ));
        }

        let cell_count = reader.read_uint(size_bytes)? as usize;
        let root_count = reader.read_uint(size_bytes)? as usize;
        let absent_count = reader.read_uint(size_bytes)? as usize;
        let total_size = reader.read_uint(off_bytes)? as usize;

        if root_count == 0 {
            return Err(CellError::InvalidBoc("no root cells".to_string()));
        }
        if root_count + absent_count > cell_count {
            return Err(CellError::InvalidBoc(format!(
                "{} roots and {} absent cells exceed {} cells",
                root_count, absent_count, cell_count
            )));
        }

        trace!(
            "BoC header: {} cells, {} roots, {} bytes of cells, idx={} crc={}",
            cell_count,
            root_count,
            total_size,
            has_idx,
            has_crc
        );

        let mut roots = Vec::with_capacity(root_count.min(reader.remaining()));
        for _ in 0..root_count {
            let index = reader.read_uint(size_bytes)? as usize;
            if index >= cell_count {
                return Err(CellError::IndexOutOfRange {
                    index,
                    len: cell_count,
                });
            }
            roots.push(CellId::from(index));
        }

        let index = if has_idx {
            let mut entries = Vec::with_capacity(cell_count.min(reader.remaining()));
            for _ in 0..cell_count {
                entries.push(reader.read_uint(off_bytes)?);
            }
            Some(entries)
        } else {
            None
        };

        let cells_data = reader.read_slice(total_size)?;
        if reader.remaining() != 0 {
            return Err(CellError::InvalidBoc(format!(
                "{} trailing bytes",
                reader.remaining()
            )));
        }

        let (cells, ends) = parse_cells(cells_data, cell_count, size_bytes)?;
        check_topology(&cells)?;

        if let Some(entries) = index {
            for (i, (&entry, &end)) in entries.iter().zip(&ends).enumerate() {
                let offset = if has_cache_bits { entry >> 1 } else { entry };
                if offset != end as u64 {
                    return Err(CellError::InvalidBoc(format!(
                        "index entry {} is {}, cell ends at {}",
                        i, offset, end
                    )));
                }
            }
        }

        let mut arena = CellArena::new();
        for cell in cells {
            arena.insert(cell);
        }

        debug!(
            "Deserialized bag of cells: {} cells, {} roots",
            cell_count, root_count
        );
        Ok(BagOfCells { arena, roots })
    }

    /// Deserialize from a hex string.
    pub fn from_hex(hex_str: &str) -> CellResult<Self> {
        Self::deserialize(&decode_hex(hex_str)?)
    }

    /// Deserialize from a base64 string (standard or URL-safe alphabet).
    pub fn from_base64(base64_str: &str) -> CellResult<Self> {
        Self::deserialize(&decode_base64(base64_str)?)
    }

    /// Deserialize a bag that must have exactly one root.
    pub fn deserialize_single_root(data: &[u8]) -> CellResult<(CellArena, CellId)> {
        let bag = Self::deserialize(data)?;
        let root = bag.single_root()?;
        Ok((bag.arena, root))
    }

    pub fn deserialize_single_root_hex(hex_str: &str) -> CellResult<(CellArena, CellId)> {
        Self::deserialize_single_root(&decode_hex(hex_str)?)
    }

    pub fn deserialize_single_root_base64(base64_str: &str) -> CellResult<(CellArena, CellId)> {
        Self::deserialize_single_root(&decode_base64(base64_str)?)
    }
}

/// Weight budget split between the subtrees of one cell when ordering.
const MAX_CELL_WEIGHT: usize = 64;

/// Ordering progress of one imported cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Fresh,
    Previsited,
    Visited,
    Allocated(usize),
}

#[derive(Debug)]
struct OrderEntry {
    node: NodeId,
    /// Children as positions in import order.
    references: Vec<usize>,
    weight: usize,
    should_cache: bool,
    slot: Slot,
}

impl OrderEntry {
    /// Zero-weight cells are placed ahead of their siblings' subtrees.
    fn is_special(&self) -> bool {
        self.weight == 0
    }
}

/// Parent-first ordering of a hashed tree, deduplicated by representation
/// hash.
///
/// Cells are imported depth-first and weighted by subtree size, capped at
/// [`MAX_CELL_WEIGHT`]. Heavy subtrees lose weight, and cells whose subtree
/// no longer fits become special and are emitted before the bulk of their
/// descendants. This matches the order written by `boc.cpp`.
struct TopologicalOrder {
    cells: Vec<NodeId>,
    should_cache: Vec<bool>,
    positions: HashMap<CellHash, usize>,
}

impl TopologicalOrder {
    fn build(tree: &HashedTree, roots: &[NodeId]) -> CellResult<Self> {
        let mut builder = OrderBuilder {
            tree,
            entries: Vec::new(),
            imported: HashMap::new(),
            in_progress: HashSet::new(),
            allocated: Vec::new(),
        };

        let roots = roots
            .iter()
            .map(|&root| builder.import(root))
            .collect::<CellResult<Vec<_>>>()?;
        builder.rebalance();

        for &root in &roots {
            builder.previsit(root);
            builder.visit(root);
        }
        for &root in &roots {
            builder.allocate(root);
        }

        // Allocation puts children before parents
        let mut cells = Vec::with_capacity(builder.allocated.len());
        let mut should_cache = Vec::with_capacity(builder.allocated.len());
        for &entry in builder.allocated.iter().rev() {
            cells.push(builder.entries[entry].node);
            should_cache.push(builder.entries[entry].should_cache);
        }
        let positions = cells
            .iter()
            .enumerate()
            .map(|(i, &node)| (tree.node(node).repr_hash(), i))
            .collect();

        Ok(TopologicalOrder {
            cells,
            should_cache,
            positions,
        })
    }

    fn index_of(&self, tree: &HashedTree, node: NodeId) -> CellResult<usize> {
        self.positions
            .get(&tree.node(node).repr_hash())
            .copied()
            .ok_or_else(|| CellError::InvalidBoc(format!("node {} was not ordered", node)))
    }
}

struct OrderBuilder<'t> {
    tree: &'t HashedTree,
    entries: Vec<OrderEntry>,
    imported: HashMap<CellHash, usize>,
    in_progress: HashSet<CellHash>,
    allocated: Vec<usize>,
}

impl OrderBuilder<'_> {
    /// Import `node` and its subtree, returning its position in import order.
    fn import(&mut self, node: NodeId) -> CellResult<usize> {
        let tree = self.tree;
        let cell = tree.node(node);
        let hash = cell.repr_hash();
        if let Some(&position) = self.imported.get(&hash) {
            self.entries[position].should_cache = true;
            return Ok(position);
        }
        if !self.in_progress.insert(hash) {
            return Err(CellError::CircularReference(node));
        }

        let mut references = Vec::with_capacity(cell.references().len());
        let mut weight = 1;
        for &child in cell.references() {
            let position = self.import(child)?;
            weight += self.entries[position].weight;
            references.push(position);
        }
        self.in_progress.remove(&hash);

        let position = self.entries.len();
        self.imported.insert(hash, position);
        self.entries.push(OrderEntry {
            node,
            references,
            weight: weight.min(255),
            should_cache: false,
            slot: Slot::Fresh,
        });
        Ok(position)
    }

    /// Split each cell's weight budget between its children, then mark the
    /// cells whose subtrees exceed their share as special.
    fn rebalance(&mut self) {
        for i in (0..self.entries.len()).rev() {
            let references = self.entries[i].references.clone();
            let count = references.len();
            let mut budget = MAX_CELL_WEIGHT - 1;
            let mut heavy = count;
            let mut light = [false; MAX_CELL_REFS];

            for (j, &child) in references.iter().enumerate() {
                let limit = (MAX_CELL_WEIGHT - 1 + j) / count;
                if self.entries[child].weight <= limit {
                    budget -= self.entries[child].weight;
                    heavy -= 1;
                    light[j] = true;
                }
            }

            if heavy > 0 {
                for (j, &child) in references.iter().enumerate() {
                    if !light[j] {
                        budget += 1;
                        let limit = budget / heavy;
                        let entry = &mut self.entries[child];
                        entry.weight = entry.weight.min(limit);
                    }
                }
            }
        }

        for i in 0..self.entries.len() {
            let sum = 1 + self.entries[i]
                .references
                .iter()
                .map(|&child| self.entries[child].weight)
                .sum::<usize>();
            let entry = &mut self.entries[i];
            entry.weight = if sum <= entry.weight { sum } else { 0 };
        }
    }

    fn previsit(&mut self, i: usize) {
        if self.entries[i].slot != Slot::Fresh {
            return;
        }
        for j in (0..self.entries[i].references.len()).rev() {
            let child = self.entries[i].references[j];
            if self.entries[child].is_special() {
                self.visit(child);
            } else {
                self.previsit(child);
            }
        }
        self.entries[i].slot = Slot::Previsited;
    }

    fn visit(&mut self, i: usize) {
        if matches!(self.entries[i].slot, Slot::Visited | Slot::Allocated(_)) {
            return;
        }
        if self.entries[i].is_special() {
            self.previsit(i);
        }
        for j in (0..self.entries[i].references.len()).rev() {
            self.visit(self.entries[i].references[j]);
        }
        for j in (0..self.entries[i].references.len()).rev() {
            self.allocate(self.entries[i].references[j]);
        }
        self.entries[i].slot = Slot::Visited;
    }

    fn allocate(&mut self, i: usize) -> usize {
        if let Slot::Allocated(index) = self.entries[i].slot {
            return index;
        }
        let index = self.allocated.len();
        self.allocated.push(i);
        self.entries[i].slot = Slot::Allocated(index);
        index
    }
}

/// Parse `cell_count` cell representations; return the cells and the end
/// offset of each.
fn parse_cells(
    data: &[u8],
    cell_count: usize,
    size_bytes: usize,
) -> CellResult<(Vec<Cell>, Vec<usize>)> {
    let mut reader = ByteReader::new(data);
    let mut cells = Vec::with_capacity(cell_count.min(data.len() / 2));
    let mut ends = Vec::with_capacity(cells.capacity());

    for _ in 0..cell_count {
        let d1 = reader.read_u8()?;
        let d2 = reader.read_u8()?;

        let ref_count = (d1 & 0x07) as usize;
        if ref_count > MAX_CELL_REFS {
            return Err(CellError::InvalidBoc(format!(
                "cell {} has {} references",
                cells.len(),
                ref_count
            )));
        }
        let is_exotic = d1 & 0x08 != 0;
        let with_hashes = d1 & 0x10 != 0;
        let level_mask = LevelMask::new(d1 >> 5);

        if with_hashes {
            reader.read_slice(level_mask.hashes_count() * (HASH_BYTES + DEPTH_BYTES))?;
        }

        let content = reader.read_slice((d2 as usize).div_ceil(2))?;
        let bits = BitBuffer::from_top_upped(content, d2 % 2 == 0)?;

        let cell_type = if is_exotic {
            let tag = content.first().ok_or_else(|| {
                CellError::InvalidBoc(format!("exotic cell {} has no type byte", cells.len()))
            })?;
            CellType::from_exotic_tag(*tag)?
        } else {
            CellType::Ordinary
        };

        let mut references = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            references.push(CellId::from(reader.read_uint(size_bytes)? as usize));
        }

        cells.push(Cell::from_parts(cell_type, bits, references, level_mask)?);
        ends.push(reader.position());
    }

    if reader.remaining() != 0 {
        return Err(CellError::InvalidBoc(format!(
            "{} unused bytes in cell data",
            reader.remaining()
        )));
    }

    Ok((cells, ends))
}

/// Check that every reference points forward, walking cells from last to first.
fn check_topology(cells: &[Cell]) -> CellResult<()> {
    for (i, cell) in cells.iter().enumerate().rev() {
        for reference in cell.references() {
            let r = reference.index();
            if r >= cells.len() {
                return Err(CellError::IndexOutOfRange {
                    index: r,
                    len: cells.len(),
                });
            }
            if r < i {
                return Err(CellError::BrokenTopology {
                    cell: i,
                    reference: r,
                });
            }
        }
    }
    Ok(())
}

fn decode_hex(hex_str: &str) -> CellResult<Vec<u8>> {
    hex::decode(hex_str.trim()).map_err(|e| CellError::InvalidHex(e.to_string()))
}

fn decode_base64(base64_str: &str) -> CellResult<Vec<u8>> {
    let input = base64_str.trim();
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(input))
        .map_err(|e| CellError::InvalidBase64(e.to_string()))
}

/// Minimum number of bytes to represent `value` (at least 1).
fn bytes_needed(value: usize) -> usize {
    let bits = (usize::BITS - value.leading_zeros()) as usize;
    bits.div_ceil(8).max(1)
}

/// Append the low `bytes` bytes of `value`, big-endian.
fn put_uint(out: &mut Vec<u8>, value: u64, bytes: usize) {
    out.extend_from_slice(&value.to_be_bytes()[8 - bytes..]);
}

/// Bounds-checked big-endian reader.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    /// Stop reading at `end`.
    fn limit(&mut self, end: usize) {
        self.data = &self.data[..end];
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u8(&mut self) -> CellResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CellError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_slice(&mut self, len: usize) -> CellResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CellError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_uint(&mut self, bytes: usize) -> CellResult<u64> {
        Ok(self
            .read_slice(bytes)?
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }
}
