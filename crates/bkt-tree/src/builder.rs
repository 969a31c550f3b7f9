#![forbid(unsafe_code)]

use bkt_error::{BktError, Result};
use bkt_ondisk::{Geometry, Header, NodeHeader};
use bkt_types::{EntrySize, NodeSize, read_le_i64};
use tracing::debug;

/// The two storage images a finished build produces, laid out exactly as
/// the tree reads them: header + L1 + L2 nodes, then the entry sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltTree {
    pub node_image: Vec<u8>,
    pub entry_image: Vec<u8>,
}

/// Offline packager for bucket tree images.
///
/// Entries are appended in ascending virtual order; `finish` lays out the
/// entry sets and the index tier(s). Image sizes always match the
/// storage-size queries for the declared geometry.
#[derive(Debug)]
pub struct BucketTreeBuilder {
    geometry: Geometry,
    entries: Vec<u8>,
    offsets: Vec<i64>,
}

impl BucketTreeBuilder {
    pub fn new(node_size: NodeSize, entry_size: EntrySize, entry_count: i32) -> Result<Self> {
        let geometry = Geometry::new(node_size, entry_size, entry_count)?;
        Ok(Self {
            geometry,
            entries: Vec::new(),
            offsets: Vec::new(),
        })
    }

    /// Append one entry. Its leading 8 bytes must be a non-negative
    /// virtual offset strictly greater than the previous entry's.
    pub fn push_entry(&mut self, entry: &[u8]) -> Result<()> {
        if entry.len() != self.geometry.entry_size() {
            return Err(BktError::format(format!(
                "entry is {} bytes, tree entries are {}",
                entry.len(),
                self.geometry.entry_size()
            )));
        }
        if self.offsets.len() as i64 >= i64::from(self.geometry.entry_count()) {
            return Err(BktError::format(format!(
                "tree declared {} entries",
                self.geometry.entry_count()
            )));
        }
        let offset = read_le_i64(entry, 0)?;
        if offset < 0 {
            return Err(BktError::format(format!("negative entry offset {offset}")));
        }
        if let Some(&last) = self.offsets.last() {
            if offset <= last {
                return Err(BktError::format(format!(
                    "entry offset {offset:#x} not above predecessor {last:#x}"
                )));
            }
        }
        self.offsets.push(offset);
        self.entries.extend_from_slice(entry);
        Ok(())
    }

    /// Lay out the images. `end_offset` is the exclusive end of the last
    /// entry's range and must exceed the last entry's offset.
    pub fn finish(self, end_offset: i64) -> Result<BuiltTree> {
        let geometry = self.geometry;
        let entry_count = geometry.entry_count() as usize;
        if self.offsets.len() != entry_count {
            return Err(BktError::format(format!(
                "{} of {entry_count} declared entries were pushed",
                self.offsets.len()
            )));
        }

        if entry_count == 0 {
            return Ok(BuiltTree {
                node_image: Header::format(0).encode().to_vec(),
                entry_image: Vec::new(),
            });
        }
        if end_offset <= self.offsets[entry_count - 1] {
            return Err(BktError::format(format!(
                "end offset {end_offset:#x} not above last entry {:#x}",
                self.offsets[entry_count - 1]
            )));
        }

        let node_size = geometry.node_size();
        let entry_size = geometry.entry_size();
        let per_node = geometry.entry_count_per_node() as usize;
        let set_count = geometry.entry_set_count() as usize;
        let offset_count = geometry.offset_count_per_node() as usize;

        // A set starts at its first entry; it ends where the next begins.
        let set_start = |set: usize| self.offsets[set * per_node];
        let set_end = |set: usize| {
            if set + 1 < set_count {
                set_start(set + 1)
            } else {
                end_offset
            }
        };

        // ── Entry sets ──────────────────────────────────────────────────
        let mut entry_image = vec![0u8; set_count * node_size];
        for set in 0..set_count {
            let first = set * per_node;
            let count = per_node.min(entry_count - first);
            let node = &mut entry_image[set * node_size..(set + 1) * node_size];
            let header = NodeHeader {
                index: set as i32,
                count: count as i32,
                offset: set_end(set),
            };
            node[..NodeHeader::SIZE].copy_from_slice(&header.encode());
            let bytes = &self.entries[first * entry_size..(first + count) * entry_size];
            node[NodeHeader::SIZE..NodeHeader::SIZE + bytes.len()].copy_from_slice(bytes);
        }

        // ── Index tier(s) ───────────────────────────────────────────────
        let node_l2_count = geometry.node_l2_count() as usize;
        let mut node_image = vec![0u8; Header::SIZE + (1 + node_l2_count) * node_size];
        node_image[..Header::SIZE]
            .copy_from_slice(&Header::format(geometry.entry_count()).encode());

        fn write_key(node: &mut [u8], slot: usize, key: i64) {
            let at = Geometry::key_slot_offset(slot);
            node[at..at + 8].copy_from_slice(&key.to_le_bytes());
        }

        if !geometry.has_l2() {
            let l1 = &mut node_image[Header::SIZE..Header::SIZE + node_size];
            let header = NodeHeader {
                index: 0,
                count: set_count as i32,
                offset: set_start(0),
            };
            l1[..NodeHeader::SIZE].copy_from_slice(&header.encode());
            for set in 0..set_count {
                write_key(l1, set, set_start(set));
            }
        } else {
            // The L1 node's slack slots index the leading entry sets
            // inline; the L2 nodes cover the rest.
            let inline_count = offset_count - node_l2_count;
            debug_assert!(inline_count + node_l2_count * offset_count >= set_count);

            let l1 = &mut node_image[Header::SIZE..Header::SIZE + node_size];
            let header = NodeHeader {
                index: 0,
                count: node_l2_count as i32,
                offset: set_start(0),
            };
            l1[..NodeHeader::SIZE].copy_from_slice(&header.encode());
            for node in 0..node_l2_count {
                write_key(l1, node, set_start(inline_count + node * offset_count));
            }
            for inline in 0..inline_count {
                write_key(l1, node_l2_count + inline, set_start(inline));
            }

            for node in 0..node_l2_count {
                let first_set = inline_count + node * offset_count;
                if first_set >= set_count {
                    return Err(BktError::format(format!(
                        "L2 node {node} covers no entry sets"
                    )));
                }
                let count = offset_count.min(set_count - first_set);
                let at = Header::SIZE + (1 + node) * node_size;
                let l2 = &mut node_image[at..at + node_size];
                let header = NodeHeader {
                    index: node as i32,
                    count: count as i32,
                    offset: set_start(first_set),
                };
                l2[..NodeHeader::SIZE].copy_from_slice(&header.encode());
                for slot in 0..count {
                    write_key(l2, slot, set_start(first_set + slot));
                }
            }
        }

        debug_assert_eq!(
            node_image.len() as i64,
            bkt_ondisk::query_header_storage_size() + geometry.node_storage_size()
        );
        debug_assert_eq!(entry_image.len() as i64, geometry.entry_storage_size());

        debug!(
            target: "bkt::builder",
            event = "finish",
            entry_count,
            entry_set_count = set_count,
            node_l2_count,
            end = end_offset,
        );

        Ok(BuiltTree {
            node_image,
            entry_image,
        })
    }
}
