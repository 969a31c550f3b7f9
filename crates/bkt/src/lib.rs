#![forbid(unsafe_code)]
//! bktfs public API facade.
//!
//! Re-exports the bucket tree and its supporting types through one stable
//! external interface. Downstream storages (sparse, indirect, patch)
//! depend on this crate.

pub use bkt_error::{BktError, Result};
pub use bkt_ondisk::{
    EntrySetInfo, Geometry, Header, NodeHeader, query_entry_storage_size,
    query_header_storage_size, query_node_storage_size,
};
pub use bkt_storage::{
    AlignedBuf, CountingAllocator, HeapAllocator, MemStorage, NodeAllocator, NodeBuffer, Storage,
    SubStorage,
};
pub use bkt_tree::{
    BucketTree, BucketTreeBuilder, BuiltTree, ContinuousEntry, ContinuousReadingInfo, TreeEntry,
    Visitor,
};
pub use bkt_types::{EntrySize, NodeSize};
