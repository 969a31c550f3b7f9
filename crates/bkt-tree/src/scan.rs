#![forbid(unsafe_code)]

use crate::entry::{ContinuousEntry, TreeEntry};
use crate::tree::BucketTree;
use bkt_error::{BktError, Result};
use bkt_ondisk::EntrySetInfo;
use bkt_storage::{NodeBuffer, Storage, SubStorage};
use bkt_types::ensure_slice;
use tracing::{debug, trace};

/// Result of a continuous-reading pre-scan.
///
/// `read_size` is the total fusible payload starting at the scanned
/// offset (zero means "do not coalesce"); `skip_count` is how many
/// subsequent entries the fused read already covers; `done` tells the
/// consumer to stop asking for scans altogether.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuousReadingInfo {
    read_size: usize,
    skip_count: i32,
    done: bool,
}

impl ContinuousReadingInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set_skip_count(&mut self, count: i32) {
        assert!(count >= 0, "skip count must be non-negative");
        self.skip_count = count;
    }

    #[must_use]
    pub fn skip_count(&self) -> i32 {
        self.skip_count
    }

    /// Decrement the skip count and report whether a new scan is needed.
    pub fn check_need_scan(&mut self) -> bool {
        self.skip_count -= 1;
        self.skip_count <= 0
    }

    /// Mark the scan finished for good: no further coalescing is possible.
    pub fn done(&mut self) {
        self.read_size = 0;
        self.done = true;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_read_size(&mut self, size: usize) {
        self.read_size = size;
    }

    #[must_use]
    pub fn read_size(&self) -> usize {
        self.read_size
    }

    /// Whether a fused read is worthwhile.
    #[must_use]
    pub fn can_do(&self) -> bool {
        self.read_size > 0
    }
}

/// Snapshot of a visitor's position handed to the scan, so the scan walks
/// shadow state and never disturbs the visible cursor.
pub(crate) struct ContinuousReadingParam<E> {
    pub offset: i64,
    pub size: usize,
    pub entry_set: EntrySetInfo,
    pub entry_index: i32,
    pub entry: E,
}

/// Entry reads for the scan: a whole-set scratch buffer when the allocator
/// grants one, direct per-entry storage reads otherwise.
struct EntryReader<'a> {
    tree: &'a BucketTree,
    storage: &'a SubStorage,
    scratch: Option<(NodeBuffer, i32)>,
    staged: Vec<u8>,
}

impl<'a> EntryReader<'a> {
    fn new(tree: &'a BucketTree, storage: &'a SubStorage) -> Result<Self> {
        let scratch =
            NodeBuffer::try_allocate(tree.allocator_ref()?, tree.node_size()).map(|buf| (buf, -1));
        if scratch.is_none() {
            debug!(target: "bkt::scan", event = "scratch_fallback");
        }
        Ok(Self {
            tree,
            storage,
            scratch,
            staged: vec![0u8; tree.entry_size()],
        })
    }

    /// Fill the scratch buffer with `set_index`'s node, if there is one.
    fn load_set(&mut self, set_index: i32) -> Result<()> {
        if let Some((buf, loaded)) = &mut self.scratch {
            if *loaded != set_index {
                self.storage
                    .read_at(self.tree.entry_set_offset(set_index), buf.as_mut_slice())?;
                *loaded = set_index;
            }
        }
        Ok(())
    }

    fn entry<E: TreeEntry>(&mut self, set_index: i32, entry_index: i32) -> Result<E> {
        if let Some((buf, loaded)) = &self.scratch {
            if *loaded == set_index {
                let bytes = ensure_slice(
                    buf.as_slice(),
                    self.tree.entry_slot_offset(entry_index as usize),
                    self.tree.entry_size(),
                )?;
                return Ok(E::parse(bytes));
            }
        }
        self.storage
            .read_at(self.tree.entry_offset(set_index, entry_index), &mut self.staged)?;
        Ok(E::parse(&self.staged))
    }
}

impl BucketTree {
    /// Walk forward from the parameter position, accumulating payload
    /// spans while each following entry is fusible with its predecessor,
    /// the accumulated bytes stay within `param.size`, and entries remain
    /// (following fusible chains across entry-set boundaries).
    pub(crate) fn scan_continuous_reading<E: ContinuousEntry>(
        &self,
        out: &mut ContinuousReadingInfo,
        param: &ContinuousReadingParam<E>,
    ) -> Result<()> {
        out.reset();
        if param.size == 0 {
            return Ok(());
        }

        let mut prev = param.entry;
        if !prev.allows_fusion() {
            out.done();
            return Ok(());
        }
        if prev.virtual_offset() > param.offset {
            return Err(BktError::OutOfRange {
                offset: param.offset,
                start: self.start(),
                end: self.end(),
            });
        }

        let entry_storage = self.entry_storage_ref()?;
        let size_limit = i64::try_from(param.size).unwrap_or(i64::MAX);
        let end_request = param.offset.saturating_add(size_limit);

        let mut reader = EntryReader::new(self, entry_storage)?;
        let mut set = param.entry_set;
        let mut index = param.entry_index;
        let mut cursor = param.offset;
        let mut accumulated: i64 = 0;
        let mut skip_count: i32 = 0;
        let mut first = true;
        reader.load_set(set.index)?;

        loop {
            // Boundary of the accepted entry's payload, plus the candidate
            // continuation entry if one exists.
            let (boundary, next) = if index + 1 < set.count {
                let entry: E = reader.entry(set.index, index + 1)?;
                let offset = entry.virtual_offset();
                if offset > set.end {
                    return Err(BktError::InvalidNodeEntryOffset {
                        index: set.index,
                        offset,
                    });
                }
                (offset, Some((entry, set, index + 1)))
            } else if set.index + 1 < self.entry_set_count() {
                let info = self.read_entry_set_info(set.index + 1)?;
                if info.start != set.end {
                    return Err(BktError::InvalidNodeEntryOffset {
                        index: info.index,
                        offset: info.start,
                    });
                }
                let entry: E = reader.entry(info.index, 0)?;
                (set.end, Some((entry, info, 0)))
            } else {
                (set.end, None)
            };

            if boundary <= cursor {
                return Err(BktError::InvalidNodeEntryOffset {
                    index: set.index,
                    offset: boundary,
                });
            }
            let span = boundary - cursor;
            let Some(total) = accumulated.checked_add(span) else {
                break;
            };
            if total > size_limit {
                break;
            }
            accumulated = total;
            cursor = boundary;
            if first {
                first = false;
            } else {
                skip_count += 1;
            }
            if cursor >= end_request {
                break;
            }

            match next {
                None => break,
                Some((entry, next_set, next_index)) => {
                    if !entry.allows_fusion() || !entry.is_fusible_after(&prev) {
                        break;
                    }
                    if next_set.index != set.index {
                        reader.load_set(next_set.index)?;
                    }
                    set = next_set;
                    index = next_index;
                    prev = entry;
                }
            }
        }

        // Fusing fewer than two entries is pointless.
        if skip_count > 0 {
            out.set_read_size(usize::try_from(accumulated).unwrap_or(usize::MAX));
            out.set_skip_count(skip_count);
        }
        trace!(
            target: "bkt::scan",
            event = "scan",
            offset = param.offset,
            read_size = out.read_size(),
            skip_count = out.skip_count(),
        );
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
