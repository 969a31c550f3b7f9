#![forbid(unsafe_code)]

use crate::format::NodeHeader;
use bkt_error::{BktError, Result};
use bkt_types::{EntrySize, NodeSize, OFFSET_KEY_SIZE};
use serde::{Deserialize, Serialize};

/// Derived layout constants for one bucket tree.
///
/// Computed once from `(node_size, entry_size, entry_count)`; all node,
/// key, and entry byte offsets are pure arithmetic over these fields, so
/// the tree never materializes a pointer graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    node_size: usize,
    entry_size: usize,
    entry_count: i32,
    entry_count_per_node: i32,
    offset_count_per_node: i32,
    entry_set_count: i32,
    node_l2_count: i32,
}

impl Geometry {
    #[allow(clippy::cast_possible_truncation)] // all counts bounded by offset_count_per_node
    pub fn new(node_size: NodeSize, entry_size: EntrySize, entry_count: i32) -> Result<Self> {
        let node_size = node_size.get();
        let entry_size = entry_size.get();
        if node_size < entry_size + NodeHeader::SIZE {
            return Err(BktError::format(format!(
                "node size {node_size} too small for entry size {entry_size}"
            )));
        }
        if entry_count < 0 {
            return Err(BktError::format(format!(
                "negative entry count {entry_count}"
            )));
        }

        let payload = node_size - NodeHeader::SIZE;
        let entry_count_per_node = (payload / entry_size) as i64;
        let offset_count_per_node = (payload / OFFSET_KEY_SIZE) as i64;
        let entry_set_count = if entry_count == 0 {
            0
        } else {
            (i64::from(entry_count) as u64).div_ceil(entry_count_per_node as u64) as i64
        };
        let node_l2_count = if entry_set_count <= offset_count_per_node {
            0
        } else {
            let chunk_count = (entry_set_count as u64).div_ceil(offset_count_per_node as u64) as i64;
            if chunk_count > offset_count_per_node {
                return Err(BktError::format(format!(
                    "{entry_count} entries exceed the capacity of a {node_size}-byte node tree"
                )));
            }
            ((entry_set_count - (offset_count_per_node - (chunk_count - 1))) as u64)
                .div_ceil(offset_count_per_node as u64) as i64
        };

        Ok(Self {
            node_size,
            entry_size,
            entry_count,
            entry_count_per_node: entry_count_per_node as i32,
            offset_count_per_node: offset_count_per_node as i32,
            entry_set_count: entry_set_count as i32,
            node_l2_count: node_l2_count as i32,
        })
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    #[must_use]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[must_use]
    pub fn entry_count(&self) -> i32 {
        self.entry_count
    }

    /// Entries a full entry set holds.
    #[must_use]
    pub fn entry_count_per_node(&self) -> i32 {
        self.entry_count_per_node
    }

    /// s64 keys an index node holds.
    #[must_use]
    pub fn offset_count_per_node(&self) -> i32 {
        self.offset_count_per_node
    }

    #[must_use]
    pub fn entry_set_count(&self) -> i32 {
        self.entry_set_count
    }

    /// Physical L2 nodes. Zero when the L1 node indexes all entry sets.
    #[must_use]
    pub fn node_l2_count(&self) -> i32 {
        self.node_l2_count
    }

    /// An L2 tier exists iff the entry sets outnumber the L1 key slots.
    #[must_use]
    pub fn has_l2(&self) -> bool {
        self.entry_set_count > self.offset_count_per_node
    }

    /// Children the L1 node indexes directly: L2 nodes when an L2 tier
    /// exists, entry sets otherwise.
    #[must_use]
    pub fn l1_child_count(&self) -> i32 {
        if self.has_l2() {
            self.node_l2_count
        } else {
            self.entry_set_count
        }
    }

    /// Entry-set index addressed by `offset_index` within L2 node
    /// `node_index`, compensating for the entry-set offsets stored inline
    /// in the L1 node's unused key slots.
    #[must_use]
    pub fn entry_set_index(&self, l1_count: i32, node_index: i32, offset_index: i32) -> i32 {
        (self.offset_count_per_node - l1_count)
            + self.offset_count_per_node * node_index
            + offset_index
    }

    // ── Byte offsets ────────────────────────────────────────────────────

    /// Offset of the L1 node within the node storage.
    #[must_use]
    pub fn l1_node_offset(&self) -> u64 {
        NodeHeader::SIZE as u64
    }

    /// Offset of L2 node `node_index` within the node storage.
    #[must_use]
    pub fn l2_node_offset(&self, node_index: i32) -> u64 {
        NodeHeader::SIZE as u64 + (1 + node_index as u64) * self.node_size as u64
    }

    /// Offset of entry set `set_index` within the entry storage.
    #[must_use]
    pub fn entry_set_offset(&self, set_index: i32) -> u64 {
        set_index as u64 * self.node_size as u64
    }

    /// Offset of entry `entry_index` of entry set `set_index` within the
    /// entry storage.
    #[must_use]
    pub fn entry_offset(&self, set_index: i32, entry_index: i32) -> u64 {
        self.entry_set_offset(set_index)
            + NodeHeader::SIZE as u64
            + entry_index as u64 * self.entry_size as u64
    }

    /// Node-internal byte offset of key slot `slot`.
    #[must_use]
    pub fn key_slot_offset(slot: usize) -> usize {
        NodeHeader::SIZE + slot * OFFSET_KEY_SIZE
    }

    /// Node-internal byte offset of entry `entry_index`.
    #[must_use]
    pub fn entry_slot_offset(&self, entry_index: usize) -> usize {
        NodeHeader::SIZE + entry_index * self.entry_size
    }

    // ── Storage-size queries ────────────────────────────────────────────

    /// Bytes of node storage (L1 plus any L2 nodes), excluding the header.
    #[must_use]
    pub fn node_storage_size(&self) -> i64 {
        if self.entry_count == 0 {
            0
        } else {
            (1 + i64::from(self.node_l2_count)) * self.node_size as i64
        }
    }

    /// Bytes of entry storage (all entry-set nodes).
    #[must_use]
    pub fn entry_storage_size(&self) -> i64 {
        if self.entry_count == 0 {
            0
        } else {
            i64::from(self.entry_set_count) * self.node_size as i64
        }
    }
}

/// Bytes the tree header occupies.
#[must_use]
pub fn query_header_storage_size() -> i64 {
    NodeHeader::SIZE as i64
}

/// Bytes of node storage a tree with this geometry needs.
pub fn query_node_storage_size(
    node_size: NodeSize,
    entry_size: EntrySize,
    entry_count: i32,
) -> Result<i64> {
    Ok(Geometry::new(node_size, entry_size, entry_count)?.node_storage_size())
}

/// Bytes of entry storage a tree with this geometry needs.
pub fn query_entry_storage_size(
    node_size: NodeSize,
    entry_size: EntrySize,
    entry_count: i32,
) -> Result<i64> {
    Ok(Geometry::new(node_size, entry_size, entry_count)?.entry_storage_size())
}

// ── Tests ───────────────────────────────────────────────────────────────────
