#![forbid(unsafe_code)]
//! Bucket tree: a persistent, read-only, two-level index over a large
//! virtual address space.
//!
//! Given a 64-bit virtual offset, the tree returns the fixed-width entry
//! whose half-open range covers it, supports ordered forward/backward
//! traversal through a [`Visitor`], and offers a continuous-reading
//! pre-scan that tells consumers how many adjacent entries one physical
//! read can satisfy. The sparse, indirect, and patch storages of the
//! filesystem layer sit on top of this index.
//!
//! The on-disk layout (see `bkt-ondisk`) is a 16-byte header, one cached
//! L1 node, an optional L2 tier, and a run of entry-set nodes; all node
//! fetches below L1 stream through caller-supplied [`bkt_storage`] views.

mod builder;
mod entry;
mod scan;
mod tree;
mod visitor;

pub use builder::{BucketTreeBuilder, BuiltTree};
pub use entry::{ContinuousEntry, TreeEntry};
pub use scan::ContinuousReadingInfo;
pub use tree::BucketTree;
pub use visitor::Visitor;

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bkt_error::BktError;
    use bkt_storage::{
        AlignedBuf, CountingAllocator, HeapAllocator, MemStorage, NodeAllocator, Storage,
        SubStorage,
    };
    use bkt_types::{EntrySize, NodeSize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Test entry: leading virtual offset plus a physical target offset.
    /// A negative physical offset marks a fragment that never fuses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MapEntry {
        offset: i64,
        physical: i64,
    }

    impl MapEntry {
        fn encode(self) -> [u8; 16] {
            let mut out = [0u8; 16];
            out[..8].copy_from_slice(&self.offset.to_le_bytes());
            out[8..].copy_from_slice(&self.physical.to_le_bytes());
            out
        }
    }

    impl TreeEntry for MapEntry {
        const SIZE: usize = 16;

        fn parse(bytes: &[u8]) -> Self {
            let mut offset = [0u8; 8];
            let mut physical = [0u8; 8];
            offset.copy_from_slice(&bytes[..8]);
            physical.copy_from_slice(&bytes[8..16]);
            Self {
                offset: i64::from_le_bytes(offset),
                physical: i64::from_le_bytes(physical),
            }
        }

        fn virtual_offset(&self) -> i64 {
            self.offset
        }
    }

    impl ContinuousEntry for MapEntry {
        fn allows_fusion(&self) -> bool {
            self.physical >= 0
        }

        fn is_fusible_after(&self, prev: &Self) -> bool {
            prev.physical >= 0
                && self.physical == prev.physical + (self.offset - prev.offset)
        }
    }

    /// Allocator granting a fixed number of allocations, then denying.
    #[derive(Debug)]
    struct QuotaAllocator {
        remaining: AtomicI32,
    }

    impl QuotaAllocator {
        fn new(quota: i32) -> Self {
            Self {
                remaining: AtomicI32::new(quota),
            }
        }
    }

    impl NodeAllocator for QuotaAllocator {
        fn allocate(&self, size: usize, align: usize) -> Option<AlignedBuf> {
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                Some(AlignedBuf::zeroed(size, align))
            } else {
                None
            }
        }

        fn release(&self, _size: usize) {}
    }

    fn storages(built: &BuiltTree) -> (SubStorage, SubStorage) {
        let node: Arc<dyn Storage> = Arc::new(MemStorage::new(built.node_image.clone()));
        let entry: Arc<dyn Storage> = Arc::new(MemStorage::new(built.entry_image.clone()));
        (
            SubStorage::whole(node).unwrap(),
            SubStorage::whole(entry).unwrap(),
        )
    }

    fn build_linear(
        node_size: usize,
        entry_count: i32,
        stride: i64,
        end_offset: i64,
    ) -> BuiltTree {
        let mut builder = BucketTreeBuilder::new(
            NodeSize::new(node_size).unwrap(),
            EntrySize::new(16).unwrap(),
            entry_count,
        )
        .unwrap();
        for i in 0..i64::from(entry_count) {
            builder
                .push_entry(&MapEntry {
                    offset: i * stride,
                    physical: i * stride,
                }
                .encode())
                .unwrap();
        }
        builder.finish(end_offset).unwrap()
    }

    fn open(
        built: &BuiltTree,
        allocator: Arc<dyn NodeAllocator>,
        node_size: usize,
        entry_count: i32,
    ) -> BucketTree {
        let (node, entry) = storages(built);
        BucketTree::initialize(
            allocator,
            node,
            entry,
            NodeSize::new(node_size).unwrap(),
            EntrySize::new(16).unwrap(),
            entry_count,
        )
        .unwrap()
    }

    #[test]
    fn empty_tree_rejects_lookups() {
        let tree = BucketTree::initialize_empty(NodeSize::new(16_384).unwrap(), 0);
        assert!(tree.is_initialized());
        assert!(tree.is_empty());
        assert_eq!(tree.entry_count(), 0);

        let mut visitor = tree.visitor();
        let err = tree.find(&mut visitor, 0).unwrap_err();
        assert!(matches!(err, BktError::OutOfRange { .. }));
        assert!(!visitor.is_valid());
    }

    #[test]
    fn zero_entry_image_initializes_as_empty() {
        let built = BucketTreeBuilder::new(
            NodeSize::new(1024).unwrap(),
            EntrySize::new(16).unwrap(),
            0,
        )
        .unwrap()
        .finish(0)
        .unwrap();
        assert_eq!(built.node_image.len(), 16);
        assert!(built.entry_image.is_empty());

        let tree = open(&built, Arc::new(HeapAllocator), 1024, 0);
        assert!(tree.is_empty());
        let mut visitor = tree.visitor();
        assert!(tree.find(&mut visitor, 0).is_err());
    }

    #[test]
    fn single_leaf_lookup() {
        // Entries at 0, 100, ..., 900; the leaf ends at 1000.
        let built = build_linear(1024, 10, 100, 1000);
        let tree = open(&built, Arc::new(HeapAllocator), 1024, 10);

        assert_eq!(tree.start(), 0);
        assert_eq!(tree.end(), 1000);
        assert_eq!(tree.size(), 1000);
        assert!(tree.includes(999));
        assert!(!tree.includes(1000));
        assert!(tree.includes_range(0, 1000));
        assert!(!tree.includes_range(0, 1001));
        assert!(!tree.includes_range(0, 0));

        let mut visitor = tree.visitor();
        tree.find(&mut visitor, 150).unwrap();
        assert_eq!(visitor.get_as::<MapEntry>().offset, 100);

        visitor.move_next().unwrap();
        assert_eq!(visitor.get_as::<MapEntry>().offset, 200);

        tree.find(&mut visitor, 999).unwrap();
        assert_eq!(visitor.get_as::<MapEntry>().offset, 900);
        assert!(!visitor.can_move_next());

        assert!(matches!(
            tree.find(&mut visitor, 1000),
            Err(BktError::OutOfRange { .. })
        ));
    }

    #[test]
    fn moves_at_the_ends_keep_position() {
        let built = build_linear(1024, 10, 100, 1000);
        let tree = open(&built, Arc::new(HeapAllocator), 1024, 10);

        let mut visitor = tree.visitor();
        tree.find(&mut visitor, 0).unwrap();
        assert!(!visitor.can_move_previous());
        let err = visitor.move_previous().unwrap_err();
        assert!(matches!(err, BktError::OutOfRange { .. }));
        assert_eq!(visitor.get_as::<MapEntry>().offset, 0);

        tree.find(&mut visitor, 999).unwrap();
        assert!(visitor.move_next().is_err());
        assert_eq!(visitor.get_as::<MapEntry>().offset, 900);
    }

    #[test]
    fn multi_set_traversal_is_monotonic() {
        // 200 entries over 4 entry sets, no L2 tier.
        let built = build_linear(1024, 200, 10, 2000);
        let tree = open(&built, Arc::new(HeapAllocator), 1024, 200);

        let mut visitor = tree.visitor();
        tree.find(&mut visitor, 0).unwrap();
        let mut last = visitor.get_as::<MapEntry>().offset;
        let mut visited = 1;
        while visitor.can_move_next() {
            visitor.move_next().unwrap();
            let offset = visitor.get_as::<MapEntry>().offset;
            assert!(offset > last, "offsets must strictly increase");
            last = offset;
            visited += 1;
        }
        assert_eq!(visited, 200);

        // And all the way back.
        while visitor.can_move_previous() {
            visitor.move_previous().unwrap();
            visited -= 1;
        }
        assert_eq!(visited, 1);
        assert_eq!(visitor.get_as::<MapEntry>().offset, 0);
    }

    #[test]
    fn out_of_memory_fails_clean() {
        let built = build_linear(1024, 10, 100, 1000);
        let counting = Arc::new(CountingAllocator::new(Arc::new(QuotaAllocator::new(0))));
        let (node, entry) = storages(&built);
        let err = BucketTree::initialize(
            Arc::clone(&counting) as Arc<dyn NodeAllocator>,
            node,
            entry,
            NodeSize::new(1024).unwrap(),
            EntrySize::new(16).unwrap(),
            10,
        )
        .unwrap_err();
        assert!(matches!(err, BktError::OutOfMemory { size: 1024 }));
        assert_eq!(counting.outstanding(), 0);
    }

    #[test]
    fn allocations_balance_across_tree_and_visitor_lifetimes() {
        let built = build_linear(1024, 200, 10, 2000);
        let counting = Arc::new(CountingAllocator::new(Arc::new(HeapAllocator)));
        {
            let tree = open(
                &built,
                Arc::clone(&counting) as Arc<dyn NodeAllocator>,
                1024,
                200,
            );
            let mut visitor = tree.visitor();
            tree.find(&mut visitor, 555).unwrap();
            visitor.move_next().unwrap();
            assert!(counting.outstanding() >= 1024 + 16);
        }
        assert_eq!(counting.outstanding(), 0);
    }

    #[test]
    fn scratch_fallback_matches_buffered_lookup() {
        let built = build_linear(1024, 200, 10, 2000);
        let buffered = open(&built, Arc::new(HeapAllocator), 1024, 200);
        // Quota covers the L1 node and the visitor's entry buffer only;
        // every scratch request is denied.
        let starved = open(&built, Arc::new(QuotaAllocator::new(2)), 1024, 200);

        let mut expected = buffered.visitor();
        let mut actual = starved.visitor();
        for va in [0, 5, 9, 631, 1259, 1999] {
            buffered.find(&mut expected, va).unwrap();
            starved.find(&mut actual, va).unwrap();
            assert_eq!(
                expected.get_as::<MapEntry>(),
                actual.get_as::<MapEntry>(),
                "lookup of {va} diverged"
            );
        }
    }

    #[test]
    fn finalize_is_idempotent() {
        let built = build_linear(1024, 10, 100, 1000);
        let mut tree = open(&built, Arc::new(HeapAllocator), 1024, 10);
        assert!(tree.is_initialized());
        tree.finalize();
        assert!(!tree.is_initialized());
        tree.finalize();
        assert!(!tree.is_initialized());
    }

    #[test]
    fn initialize_rejects_header_mismatch() {
        let built = build_linear(1024, 10, 100, 1000);
        let (node, entry) = storages(&built);
        let err = BucketTree::initialize(
            Arc::new(HeapAllocator),
            node,
            entry,
            NodeSize::new(1024).unwrap(),
            EntrySize::new(16).unwrap(),
            11,
        )
        .unwrap_err();
        assert!(matches!(err, BktError::InvalidFormat { .. }));
    }

    #[test]
    fn initialize_rejects_corrupt_magic() {
        let mut built = build_linear(1024, 10, 100, 1000);
        built.node_image[0] = b'X';
        let (node, entry) = storages(&built);
        let err = BucketTree::initialize(
            Arc::new(HeapAllocator),
            node,
            entry,
            NodeSize::new(1024).unwrap(),
            EntrySize::new(16).unwrap(),
            10,
        )
        .unwrap_err();
        assert!(matches!(err, BktError::InvalidFormat { .. }));
    }

    #[test]
    fn initialize_rejects_corrupt_l1_count() {
        let mut built = build_linear(1024, 10, 100, 1000);
        // L1 node header count lives at node image offset 16 + 4.
        built.node_image[20] = 99;
        let (node, entry) = storages(&built);
        let err = BucketTree::initialize(
            Arc::new(HeapAllocator),
            node,
            entry,
            NodeSize::new(1024).unwrap(),
            EntrySize::new(16).unwrap(),
            10,
        )
        .unwrap_err();
        assert!(matches!(err, BktError::InvalidNodeEntryCount { .. }));
    }

    #[test]
    fn initialize_rejects_truncated_entry_storage() {
        let mut built = build_linear(1024, 200, 10, 2000);
        built.entry_image.truncate(3 * 1024);
        let (node, entry) = storages(&built);
        let err = BucketTree::initialize(
            Arc::new(HeapAllocator),
            node,
            entry,
            NodeSize::new(1024).unwrap(),
            EntrySize::new(16).unwrap(),
            200,
        )
        .unwrap_err();
        assert!(matches!(err, BktError::InvalidFormat { .. }));
    }

    #[test]
    fn invalidate_cache_preserves_lookups() {
        let built = build_linear(1024, 10, 100, 1000);
        let node_mem = Arc::new(MemStorage::new(built.node_image.clone()));
        let entry_mem: Arc<dyn Storage> = Arc::new(MemStorage::new(built.entry_image.clone()));
        let node_sub =
            SubStorage::whole(Arc::clone(&node_mem) as Arc<dyn Storage>).unwrap();
        let entry_sub = SubStorage::whole(entry_mem).unwrap();

        let mut tree = BucketTree::initialize(
            Arc::new(HeapAllocator),
            node_sub,
            entry_sub,
            NodeSize::new(1024).unwrap(),
            EntrySize::new(16).unwrap(),
            10,
        )
        .unwrap();

        // Overwrite the L1 node with a byte-identical copy, then refresh.
        node_mem
            .write_at(16, &built.node_image[16..16 + 1024])
            .unwrap();
        tree.invalidate_cache().unwrap();

        let mut visitor = tree.visitor();
        tree.find(&mut visitor, 450).unwrap();
        assert_eq!(visitor.get_as::<MapEntry>().offset, 400);
    }

    #[test]
    #[should_panic(expected = "not positioned")]
    fn get_panics_before_find() {
        let built = build_linear(1024, 10, 100, 1000);
        let tree = open(&built, Arc::new(HeapAllocator), 1024, 10);
        let visitor = tree.visitor();
        let _ = visitor.get();
    }

    #[test]
    #[should_panic(expected = "different tree")]
    fn find_rejects_foreign_visitor() {
        let built = build_linear(1024, 10, 100, 1000);
        let tree_a = open(&built, Arc::new(HeapAllocator), 1024, 10);
        let tree_b = open(&built, Arc::new(HeapAllocator), 1024, 10);
        let mut visitor = tree_b.visitor();
        let _ = tree_a.find(&mut visitor, 0);
    }

    #[test]
    fn builder_rejects_disorder_and_miscounts() {
        let node_size = NodeSize::new(1024).unwrap();
        let entry_size = EntrySize::new(16).unwrap();

        let mut builder = BucketTreeBuilder::new(node_size, entry_size, 2).unwrap();
        builder
            .push_entry(&MapEntry {
                offset: 100,
                physical: 0,
            }
            .encode())
            .unwrap();
        assert!(
            builder
                .push_entry(&MapEntry {
                    offset: 100,
                    physical: 0,
                }
                .encode())
                .is_err()
        );

        let builder = BucketTreeBuilder::new(node_size, entry_size, 2).unwrap();
        assert!(builder.finish(1000).is_err());

        let mut builder = BucketTreeBuilder::new(node_size, entry_size, 1).unwrap();
        builder
            .push_entry(&MapEntry {
                offset: 100,
                physical: 0,
            }
            .encode())
            .unwrap();
        assert!(builder.finish(100).is_err());
    }
}
