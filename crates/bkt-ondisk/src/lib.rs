#![forbid(unsafe_code)]
//! On-disk format for the bucket tree.
//!
//! Pure parsing crate — no I/O, no side effects. Parses and encodes the
//! tree header and node headers, and computes all derived geometry
//! (per-node capacities, entry-set counts, L2 node counts, storage-size
//! queries, byte offsets of nodes, keys, and entries).

mod format;
mod geometry;

pub use format::{EntrySetInfo, Header, NodeHeader};
pub use geometry::{
    Geometry, query_entry_storage_size, query_header_storage_size, query_node_storage_size,
};
