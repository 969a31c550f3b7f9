#![forbid(unsafe_code)]

use crate::visitor::Visitor;
use bkt_error::{BktError, Result};
use bkt_ondisk::{EntrySetInfo, Geometry, Header, NodeHeader};
use bkt_storage::{NodeAllocator, NodeBuffer, Storage, SubStorage};
use bkt_types::{EntrySize, NodeSize, read_le_i64};
use std::sync::Arc;
use tracing::debug;

/// Persistent, read-only, two-level index mapping a virtual byte offset to
/// the entry whose half-open range covers it.
///
/// The tree caches its L1 node in memory; L2 nodes and entry sets are read
/// from the two storage views on demand. Lookups go through a [`Visitor`]
/// obtained from [`BucketTree::visitor`].
#[derive(Debug)]
pub struct BucketTree {
    allocator: Option<Arc<dyn NodeAllocator>>,
    node_storage: Option<SubStorage>,
    entry_storage: Option<SubStorage>,
    node_l1: Option<NodeBuffer>,
    node_size: usize,
    entry_size: usize,
    entry_count: i32,
    entry_count_per_node: i32,
    offset_count: i32,
    entry_set_count: i32,
    node_l2_count: i32,
    l1_count: i32,
    start_offset: i64,
    end_offset: i64,
}

/// Parse and verify a freshly read L1 node, returning its header and the
/// tree's start offset.
fn verify_l1_node(
    bytes: &[u8],
    offset_count: i32,
    expected_count: i32,
    has_l2: bool,
) -> Result<(NodeHeader, i64)> {
    let header = NodeHeader::parse(bytes)?;
    header.verify(0, offset_count)?;
    if header.count != expected_count {
        return Err(BktError::InvalidNodeEntryCount {
            index: 0,
            count: header.count,
            capacity: expected_count,
        });
    }

    // With inline entry-set offsets on L1, the first covered address sits
    // in the first slot past the L2 keys; otherwise in slot 0.
    let first_slot = if has_l2 && header.count < offset_count {
        header.count as usize
    } else {
        0
    };
    let start = read_le_i64(bytes, Geometry::key_slot_offset(first_slot))?;
    if start < 0 || header.offset != start {
        return Err(BktError::InvalidNodeEntryOffset {
            index: 0,
            offset: header.offset,
        });
    }
    Ok((header, start))
}

impl BucketTree {
    fn vacant() -> Self {
        Self {
            allocator: None,
            node_storage: None,
            entry_storage: None,
            node_l1: None,
            node_size: 0,
            entry_size: 0,
            entry_count: 0,
            entry_count_per_node: 0,
            offset_count: 0,
            entry_set_count: 0,
            node_l2_count: 0,
            l1_count: 0,
            start_offset: 0,
            end_offset: 0,
        }
    }

    /// Open a tree over `node_storage` and `entry_storage`.
    ///
    /// Reads and verifies the header, loads the L1 node into an
    /// allocator-owned buffer, and derives the virtual range: the start
    /// from the L1 node, the end from the last entry set. Fails with
    /// `InvalidFormat` on header or geometry mismatch,
    /// `InvalidNodeEntryCount` / `InvalidNodeEntryOffset` on structural
    /// damage, and `OutOfMemory` if the allocator declines; every failure
    /// leaves no allocation behind.
    pub fn initialize(
        allocator: Arc<dyn NodeAllocator>,
        node_storage: SubStorage,
        entry_storage: SubStorage,
        node_size: NodeSize,
        entry_size: EntrySize,
        entry_count: i32,
    ) -> Result<Self> {
        let geometry = Geometry::new(node_size, entry_size, entry_count)?;

        let mut header_bytes = [0u8; Header::SIZE];
        node_storage.read_at(0, &mut header_bytes)?;
        let header = Header::parse(&header_bytes)?;
        header.verify()?;
        if header.entry_count != entry_count {
            return Err(BktError::format(format!(
                "header entry count {} does not match expected {entry_count}",
                header.entry_count
            )));
        }

        if entry_count == 0 {
            // The persisted image is the bare header; the tree covers
            // nothing and lookups report OutOfRange.
            let mut tree = Self::vacant();
            tree.node_size = geometry.node_size();
            return Ok(tree);
        }

        let node_needed = Header::SIZE as u64 + geometry.node_storage_size() as u64;
        if node_storage.size()? < node_needed {
            return Err(BktError::format(format!(
                "node storage holds {} bytes, layout needs {node_needed}",
                node_storage.size()?
            )));
        }
        let entry_needed = geometry.entry_storage_size() as u64;
        if entry_storage.size()? < entry_needed {
            return Err(BktError::format(format!(
                "entry storage holds {} bytes, layout needs {entry_needed}",
                entry_storage.size()?
            )));
        }

        let mut node_l1 = NodeBuffer::allocate(&allocator, geometry.node_size())?;
        node_storage.read_at(geometry.l1_node_offset(), node_l1.as_mut_slice())?;
        let (l1_header, start_offset) = verify_l1_node(
            node_l1.as_slice(),
            geometry.offset_count_per_node(),
            geometry.l1_child_count(),
            geometry.has_l2(),
        )?;

        // The exclusive end of the last entry set is the tree's end.
        let last_set = geometry.entry_set_count() - 1;
        let mut leaf_bytes = [0u8; NodeHeader::SIZE];
        entry_storage.read_at(geometry.entry_set_offset(last_set), &mut leaf_bytes)?;
        let leaf = NodeHeader::parse(&leaf_bytes)?;
        leaf.verify(last_set, geometry.entry_count_per_node())?;
        let end_offset = leaf.offset;
        if end_offset < start_offset {
            return Err(BktError::InvalidNodeEntryOffset {
                index: last_set,
                offset: end_offset,
            });
        }

        debug!(
            target: "bkt::tree",
            event = "initialize",
            node_size = geometry.node_size(),
            entry_size = geometry.entry_size(),
            entry_count,
            entry_set_count = geometry.entry_set_count(),
            node_l2_count = geometry.node_l2_count(),
            start = start_offset,
            end = end_offset,
        );

        Ok(Self {
            allocator: Some(allocator),
            node_storage: Some(node_storage),
            entry_storage: Some(entry_storage),
            node_l1: Some(node_l1),
            node_size: geometry.node_size(),
            entry_size: geometry.entry_size(),
            entry_count,
            entry_count_per_node: geometry.entry_count_per_node(),
            offset_count: geometry.offset_count_per_node(),
            entry_set_count: geometry.entry_set_count(),
            node_l2_count: geometry.node_l2_count(),
            l1_count: l1_header.count,
            start_offset,
            end_offset,
        })
    }

    /// Degenerate empty-tree form for `entry_count == 0` without backing
    /// storage. The tree reports `is_empty()` and every lookup fails with
    /// `OutOfRange`.
    #[must_use]
    pub fn initialize_empty(node_size: NodeSize, end_offset: i64) -> Self {
        debug!(
            target: "bkt::tree",
            event = "initialize_empty",
            node_size = node_size.get(),
            end = end_offset,
        );
        let mut tree = Self::vacant();
        tree.node_size = node_size.get();
        tree.end_offset = end_offset;
        tree
    }

    /// Release the cached L1 node and clear all geometry. Idempotent;
    /// dropping the tree has the same effect.
    pub fn finalize(&mut self) {
        *self = Self::vacant();
    }

    /// Re-read the L1 node from the node storage into the existing buffer,
    /// for when the underlying storage is known to have been re-opened.
    /// Geometry is preserved; the fresh node is re-verified.
    pub fn invalidate_cache(&mut self) -> Result<()> {
        let (Some(node_storage), Some(node_l1)) = (&self.node_storage, &mut self.node_l1) else {
            return Ok(());
        };
        node_storage.read_at(NodeHeader::SIZE as u64, node_l1.as_mut_slice())?;
        let has_l2 = self.offset_count < self.entry_set_count;
        let expected = if has_l2 {
            self.node_l2_count
        } else {
            self.entry_set_count
        };
        let (header, start) =
            verify_l1_node(node_l1.as_slice(), self.offset_count, expected, has_l2)?;
        self.l1_count = header.count;
        self.start_offset = start;
        debug!(target: "bkt::tree", event = "invalidate_cache", start);
        Ok(())
    }

    /// Position `visitor` on the entry whose range contains
    /// `virtual_address`, allocating the visitor's entry buffer on first
    /// use. Fails with `OutOfRange` when the address is not covered.
    pub fn find(&self, visitor: &mut Visitor<'_>, virtual_address: i64) -> Result<()> {
        assert!(
            std::ptr::eq(self, visitor.tree()),
            "visitor belongs to a different tree"
        );
        visitor.find(virtual_address)
    }

    /// A fresh, unpositioned cursor over this tree.
    #[must_use]
    pub fn visitor(&self) -> Visitor<'_> {
        Visitor::new(self)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.node_size > 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_size == 0
    }

    #[must_use]
    pub fn entry_count(&self) -> i32 {
        self.entry_count
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    #[must_use]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// First covered virtual address.
    #[must_use]
    pub fn start(&self) -> i64 {
        self.start_offset
    }

    /// Exclusive end of the covered range.
    #[must_use]
    pub fn end(&self) -> i64 {
        self.end_offset
    }

    /// Bytes covered: `end - start`.
    #[must_use]
    pub fn size(&self) -> i64 {
        self.end_offset - self.start_offset
    }

    #[must_use]
    pub fn includes(&self, offset: i64) -> bool {
        self.start_offset <= offset && offset < self.end_offset
    }

    #[must_use]
    pub fn includes_range(&self, offset: i64, size: i64) -> bool {
        size > 0 && self.start_offset <= offset && size <= self.end_offset - offset
    }

    /// The allocator shared by this tree and its visitors; `None` for
    /// empty or finalized trees.
    #[must_use]
    pub fn allocator(&self) -> Option<&Arc<dyn NodeAllocator>> {
        self.allocator.as_ref()
    }

    // ── Internals shared with the visitor and the scan ──────────────────

    pub(crate) fn l1_bytes(&self) -> Option<&[u8]> {
        self.node_l1.as_ref().map(NodeBuffer::as_slice)
    }

    pub(crate) fn l1_count(&self) -> i32 {
        self.l1_count
    }

    pub(crate) fn offset_count(&self) -> i32 {
        self.offset_count
    }

    pub(crate) fn entry_count_per_node(&self) -> i32 {
        self.entry_count_per_node
    }

    pub(crate) fn entry_set_count(&self) -> i32 {
        self.entry_set_count
    }

    pub(crate) fn has_l2(&self) -> bool {
        self.offset_count < self.entry_set_count
    }

    /// True when the L1 node carries inline entry-set offsets in its
    /// unused key slots.
    pub(crate) fn is_offset_l2_on_l1(&self) -> bool {
        self.has_l2() && self.l1_count < self.offset_count
    }

    /// Entry-set index addressed by `offset_index` of L2 node
    /// `node_index`, compensating for the inline offsets on L1.
    pub(crate) fn entry_set_index(&self, node_index: i32, offset_index: i32) -> i32 {
        (self.offset_count - self.l1_count) + self.offset_count * node_index + offset_index
    }

    pub(crate) fn l2_node_offset(&self, node_index: i32) -> u64 {
        NodeHeader::SIZE as u64 + (1 + node_index as u64) * self.node_size as u64
    }

    pub(crate) fn entry_set_offset(&self, set_index: i32) -> u64 {
        set_index as u64 * self.node_size as u64
    }

    pub(crate) fn entry_offset(&self, set_index: i32, entry_index: i32) -> u64 {
        self.entry_set_offset(set_index)
            + NodeHeader::SIZE as u64
            + entry_index as u64 * self.entry_size as u64
    }

    /// Node-internal byte offset of an entry.
    pub(crate) fn entry_slot_offset(&self, entry_index: usize) -> usize {
        NodeHeader::SIZE + entry_index * self.entry_size
    }

    pub(crate) fn node_storage_ref(&self) -> Result<&SubStorage> {
        self.node_storage
            .as_ref()
            .ok_or_else(|| BktError::format("tree has no node storage"))
    }

    pub(crate) fn entry_storage_ref(&self) -> Result<&SubStorage> {
        self.entry_storage
            .as_ref()
            .ok_or_else(|| BktError::format("tree has no entry storage"))
    }

    pub(crate) fn allocator_ref(&self) -> Result<&Arc<dyn NodeAllocator>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BktError::format("tree has no allocator"))
    }

    /// Read and verify one entry set's header plus its derived range
    /// (`end` from the header offset, `start` from the first entry).
    pub(crate) fn read_entry_set_info(&self, set_index: i32) -> Result<EntrySetInfo> {
        let entry_storage = self.entry_storage_ref()?;
        let set_offset = self.entry_set_offset(set_index);

        let mut header_bytes = [0u8; NodeHeader::SIZE];
        entry_storage.read_at(set_offset, &mut header_bytes)?;
        let header = NodeHeader::parse(&header_bytes)?;
        header.verify(set_index, self.entry_count_per_node)?;

        let mut start_bytes = [0u8; 8];
        entry_storage.read_at(set_offset + NodeHeader::SIZE as u64, &mut start_bytes)?;
        let info = EntrySetInfo::from_header(header, i64::from_le_bytes(start_bytes));
        info.verify_range()?;
        Ok(info)
    }
}
