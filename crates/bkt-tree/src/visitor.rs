#![forbid(unsafe_code)]

use crate::entry::{ContinuousEntry, TreeEntry};
use crate::scan::{ContinuousReadingInfo, ContinuousReadingParam};
use crate::tree::BucketTree;
use bkt_error::{BktError, Result};
use bkt_ondisk::{EntrySetInfo, Geometry, NodeHeader};
use bkt_storage::{NodeBuffer, Storage, SubStorage};
use bkt_types::{OFFSET_KEY_SIZE, ensure_slice, read_le_i64};
use tracing::{debug, trace};

/// Cursor positioned on a single entry of a [`BucketTree`].
///
/// Owns a scratch buffer of exactly one entry, allocated from the tree's
/// allocator on first use and released when the visitor is dropped. A
/// visitor may be reused across `find` calls but never outlives its tree.
#[derive(Debug)]
pub struct Visitor<'a> {
    tree: &'a BucketTree,
    entry: Option<NodeBuffer>,
    entry_index: i32,
    entry_set: EntrySetInfo,
    entry_set_count: i32,
}

fn out_of_range(tree: &BucketTree, offset: i64) -> BktError {
    BktError::OutOfRange {
        offset,
        start: tree.start(),
        end: tree.end(),
    }
}

/// Binary search for the largest index in `[0, count)` whose key does not
/// exceed `target`. Keys must be sorted ascending; `None` when even the
/// first key exceeds `target`.
fn search_largest_le<F>(count: usize, target: i64, mut key_at: F) -> Result<Option<usize>>
where
    F: FnMut(usize) -> Result<i64>,
{
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if key_at(mid)? <= target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo.checked_sub(1))
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(tree: &'a BucketTree) -> Self {
        Self {
            tree,
            entry: None,
            entry_index: -1,
            entry_set: EntrySetInfo::default(),
            entry_set_count: tree.entry_set_count(),
        }
    }

    /// The tree this cursor reads.
    #[must_use]
    pub fn tree(&self) -> &BucketTree {
        self.tree
    }

    /// Whether the cursor is positioned on an entry.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.entry_index >= 0
    }

    #[must_use]
    pub fn can_move_next(&self) -> bool {
        self.is_valid()
            && (self.entry_index + 1 < self.entry_set.count
                || self.entry_set.index + 1 < self.entry_set_count)
    }

    #[must_use]
    pub fn can_move_previous(&self) -> bool {
        self.is_valid() && (self.entry_index > 0 || self.entry_set.index > 0)
    }

    /// Raw bytes of the current entry, valid until the next move.
    #[must_use]
    pub fn get(&self) -> &[u8] {
        assert!(self.is_valid(), "visitor is not positioned on an entry");
        let Some(entry) = &self.entry else {
            unreachable!("a positioned visitor owns its entry buffer");
        };
        entry.as_slice()
    }

    /// The current entry decoded as `E`. `E::SIZE` must equal the tree's
    /// entry size.
    #[must_use]
    pub fn get_as<E: TreeEntry>(&self) -> E {
        assert_eq!(
            E::SIZE,
            self.tree.entry_size(),
            "entry type width does not match the tree's entry size"
        );
        E::parse(self.get())
    }

    /// Start offset of the current entry's half-open range.
    #[must_use]
    pub fn entry_offset(&self) -> i64 {
        // Entries lead with their LE virtual offset.
        read_le_i64(self.get(), 0).unwrap_or_default()
    }

    /// Look ahead from the current entry and compute how much a caller may
    /// fuse into one physical read of at most `size` bytes starting at
    /// `offset`. Does not move the cursor.
    pub fn scan_continuous_reading<E: ContinuousEntry>(
        &self,
        info: &mut ContinuousReadingInfo,
        offset: i64,
        size: usize,
    ) -> Result<()> {
        assert!(self.is_valid(), "visitor is not positioned on an entry");
        let param = ContinuousReadingParam {
            offset,
            size,
            entry_set: self.entry_set,
            entry_index: self.entry_index,
            entry: self.get_as::<E>(),
        };
        self.tree.scan_continuous_reading(info, &param)
    }

    // ── Positioning ─────────────────────────────────────────────────────

    pub(crate) fn find(&mut self, virtual_address: i64) -> Result<()> {
        let tree = self.tree;
        if tree.is_empty() || !tree.includes(virtual_address) {
            return Err(out_of_range(tree, virtual_address));
        }

        if self.entry.is_none() {
            self.entry = Some(NodeBuffer::allocate(
                tree.allocator_ref()?,
                tree.entry_size(),
            )?);
        }

        let l1 = tree
            .l1_bytes()
            .ok_or_else(|| BktError::format("tree has no cached L1 node"))?;
        let l1_count = tree.l1_count() as usize;
        let offset_count = tree.offset_count() as usize;
        let key_at = |slot: usize| read_le_i64(l1, Geometry::key_slot_offset(slot));

        let entry_set_index = if tree.has_l2() {
            // Addresses below the first L2 key are indexed by the inline
            // entry-set offsets stored in the L1 node's remaining slots.
            if tree.is_offset_l2_on_l1() && virtual_address < key_at(0)? {
                let inline_count = offset_count - l1_count;
                let slot = search_largest_le(inline_count, virtual_address, |j| {
                    key_at(l1_count + j)
                })?
                .ok_or_else(|| out_of_range(tree, virtual_address))?;
                slot as i32
            } else {
                let node_index = search_largest_le(l1_count, virtual_address, key_at)?
                    .ok_or_else(|| out_of_range(tree, virtual_address))?;
                self.find_entry_set(virtual_address, node_index as i32)?
            }
        } else {
            let slot = search_largest_le(l1_count, virtual_address, key_at)?
                .ok_or_else(|| out_of_range(tree, virtual_address))?;
            slot as i32
        };

        if entry_set_index < 0 || entry_set_index >= self.entry_set_count {
            return Err(BktError::format(format!(
                "entry set index {entry_set_index} outside [0, {})",
                self.entry_set_count
            )));
        }

        self.find_entry(virtual_address, entry_set_index)?;
        trace!(
            target: "bkt::visitor",
            event = "find",
            virtual_address,
            entry_set_index,
            entry_index = self.entry_index,
        );
        Ok(())
    }

    /// Descend through L2 node `node_index` to the entry-set index whose
    /// range contains `virtual_address`. Prefers a whole-node scratch
    /// buffer; falls back to per-key storage reads when the allocator
    /// declines.
    fn find_entry_set(&self, virtual_address: i64, node_index: i32) -> Result<i32> {
        let tree = self.tree;
        let node_storage = tree.node_storage_ref()?;
        let node_offset = tree.l2_node_offset(node_index);

        if let Some(mut scratch) = NodeBuffer::try_allocate(tree.allocator_ref()?, tree.node_size())
        {
            node_storage.read_at(node_offset, scratch.as_mut_slice())?;
            self.find_entry_set_in_node(virtual_address, node_index, scratch.as_slice())
        } else {
            debug!(
                target: "bkt::visitor",
                event = "scratch_fallback",
                tier = "l2",
                node_index,
            );
            self.find_entry_set_in_storage(virtual_address, node_index, node_storage, node_offset)
        }
    }

    fn find_entry_set_in_node(
        &self,
        virtual_address: i64,
        node_index: i32,
        node: &[u8],
    ) -> Result<i32> {
        let tree = self.tree;
        let header = NodeHeader::parse(node)?;
        header.verify(node_index, tree.offset_count())?;
        let key_at = |slot: usize| read_le_i64(node, Geometry::key_slot_offset(slot));
        if header.offset != key_at(0)? {
            return Err(BktError::InvalidNodeEntryOffset {
                index: node_index,
                offset: header.offset,
            });
        }
        let offset_index = search_largest_le(header.count as usize, virtual_address, key_at)?
            .ok_or_else(|| out_of_range(tree, virtual_address))?;
        Ok(tree.entry_set_index(node_index, offset_index as i32))
    }

    fn find_entry_set_in_storage(
        &self,
        virtual_address: i64,
        node_index: i32,
        node_storage: &SubStorage,
        node_offset: u64,
    ) -> Result<i32> {
        let tree = self.tree;
        let mut header_bytes = [0u8; NodeHeader::SIZE];
        node_storage.read_at(node_offset, &mut header_bytes)?;
        let header = NodeHeader::parse(&header_bytes)?;
        header.verify(node_index, tree.offset_count())?;

        let key_at = |slot: usize| -> Result<i64> {
            let mut bytes = [0u8; OFFSET_KEY_SIZE];
            node_storage.read_at(
                node_offset + Geometry::key_slot_offset(slot) as u64,
                &mut bytes,
            )?;
            Ok(i64::from_le_bytes(bytes))
        };
        if header.offset != key_at(0)? {
            return Err(BktError::InvalidNodeEntryOffset {
                index: node_index,
                offset: header.offset,
            });
        }
        let offset_index = search_largest_le(header.count as usize, virtual_address, key_at)?
            .ok_or_else(|| out_of_range(tree, virtual_address))?;
        Ok(tree.entry_set_index(node_index, offset_index as i32))
    }

    /// Load entry set `entry_set_index` and position on the entry whose
    /// range contains `virtual_address`.
    fn find_entry(&mut self, virtual_address: i64, entry_set_index: i32) -> Result<()> {
        let tree = self.tree;
        let entry_storage = tree.entry_storage_ref()?;

        if let Some(mut scratch) = NodeBuffer::try_allocate(tree.allocator_ref()?, tree.node_size())
        {
            entry_storage.read_at(tree.entry_set_offset(entry_set_index), scratch.as_mut_slice())?;
            let node = scratch.as_slice();

            let header = NodeHeader::parse(node)?;
            header.verify(entry_set_index, tree.entry_count_per_node())?;
            let info = EntrySetInfo::from_header(header, read_le_i64(node, NodeHeader::SIZE)?);
            info.verify_range()?;
            if !info.contains(virtual_address) {
                return Err(BktError::InvalidNodeEntryOffset {
                    index: entry_set_index,
                    offset: info.start,
                });
            }

            let entry_index = search_largest_le(info.count as usize, virtual_address, |j| {
                read_le_i64(node, tree.entry_slot_offset(j))
            })?
            .ok_or_else(|| out_of_range(tree, virtual_address))?;

            let bytes = ensure_slice(node, tree.entry_slot_offset(entry_index), tree.entry_size())?;
            self.entry_buffer_mut()?.as_mut_slice().copy_from_slice(bytes);
            self.entry_set = info;
            self.entry_index = entry_index as i32;
            Ok(())
        } else {
            debug!(
                target: "bkt::visitor",
                event = "scratch_fallback",
                tier = "entry_set",
                entry_set_index,
            );
            let info = tree.read_entry_set_info(entry_set_index)?;
            if !info.contains(virtual_address) {
                return Err(BktError::InvalidNodeEntryOffset {
                    index: entry_set_index,
                    offset: info.start,
                });
            }

            let entry_index = search_largest_le(info.count as usize, virtual_address, |j| {
                let mut bytes = [0u8; OFFSET_KEY_SIZE];
                entry_storage.read_at(tree.entry_offset(entry_set_index, j as i32), &mut bytes)?;
                Ok(i64::from_le_bytes(bytes))
            })?
            .ok_or_else(|| out_of_range(tree, virtual_address))?;

            self.load_entry(entry_set_index, entry_index as i32)?;
            self.entry_set = info;
            self.entry_index = entry_index as i32;
            Ok(())
        }
    }

    /// Read one entry's bytes into the visitor's buffer, staging through a
    /// temporary so a failed read leaves the visible entry intact.
    fn load_entry(&mut self, set_index: i32, entry_index: i32) -> Result<()> {
        let tree = self.tree;
        let mut staged = vec![0u8; tree.entry_size()];
        tree.entry_storage_ref()?
            .read_at(tree.entry_offset(set_index, entry_index), &mut staged)?;
        self.entry_buffer_mut()?.as_mut_slice().copy_from_slice(&staged);
        Ok(())
    }

    fn entry_buffer_mut(&mut self) -> Result<&mut NodeBuffer> {
        self.entry
            .as_mut()
            .ok_or_else(|| BktError::format("visitor entry buffer not allocated"))
    }

    // ── Moves ───────────────────────────────────────────────────────────

    /// Advance to the next entry, crossing into the next entry set when
    /// the boundary is reached. Fails with `OutOfRange` at the last entry;
    /// on any failure the previous position stays visible.
    pub fn move_next(&mut self) -> Result<()> {
        let tree = self.tree;
        if !self.is_valid() {
            return Err(out_of_range(tree, tree.end()));
        }

        if self.entry_index + 1 < self.entry_set.count {
            self.load_entry(self.entry_set.index, self.entry_index + 1)?;
            self.entry_index += 1;
            return Ok(());
        }

        let next_set = self.entry_set.index + 1;
        if next_set >= self.entry_set_count {
            return Err(out_of_range(tree, self.entry_set.end));
        }
        let info = tree.read_entry_set_info(next_set)?;
        if info.start != self.entry_set.end {
            return Err(BktError::InvalidNodeEntryOffset {
                index: next_set,
                offset: info.start,
            });
        }
        self.load_entry(next_set, 0)?;
        self.entry_set = info;
        self.entry_index = 0;
        Ok(())
    }

    /// Step back to the previous entry, crossing into the previous entry
    /// set when the boundary is reached. Fails with `OutOfRange` at the
    /// first entry; on any failure the previous position stays visible.
    pub fn move_previous(&mut self) -> Result<()> {
        let tree = self.tree;
        if !self.is_valid() {
            return Err(out_of_range(tree, tree.start()));
        }

        if self.entry_index > 0 {
            self.load_entry(self.entry_set.index, self.entry_index - 1)?;
            self.entry_index -= 1;
            return Ok(());
        }

        let prev_set = self.entry_set.index - 1;
        if prev_set < 0 {
            return Err(out_of_range(tree, self.entry_set.start));
        }
        let info = tree.read_entry_set_info(prev_set)?;
        if info.end != self.entry_set.start {
            return Err(BktError::InvalidNodeEntryOffset {
                index: prev_set,
                offset: info.end,
            });
        }
        self.load_entry(prev_set, info.count - 1)?;
        self.entry_set = info;
        self.entry_index = info.count - 1;
        Ok(())
    }
}
