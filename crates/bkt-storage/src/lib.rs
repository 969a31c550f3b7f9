#![forbid(unsafe_code)]
//! Storage views and allocator-scoped buffers.
//!
//! Provides the read-only `Storage` trait, `SubStorage` windows over a
//! shared parent storage, an in-memory storage, and the `NodeAllocator`
//! trait with the `NodeBuffer` type that couples a buffer's lifetime to
//! its allocator's accounting.

use bkt_error::{BktError, Result};
use bkt_types::NODE_ALIGNMENT;
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

// ── Storage ─────────────────────────────────────────────────────────────────

/// Read-only byte-addressable storage.
///
/// Reads may block; everything else in this workspace is non-blocking.
/// Implementations are shared between readers, so reads take `&self`.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Total size in bytes.
    fn size(&self) -> Result<u64>;
}

fn out_of_bounds(offset: u64, len: usize, size: u64) -> BktError {
    BktError::Storage(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("read of {len} bytes at {offset} exceeds storage size {size}"),
    ))
}

/// In-memory storage.
///
/// The write side is not part of the `Storage` trait; it exists for
/// builders and for tests that re-write images under a live reader.
pub struct MemStorage {
    data: RwLock<Vec<u8>>,
}

impl MemStorage {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let len = data.len() as u64;
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| out_of_bounds(offset, bytes.len(), len))?;
        if end > len {
            return Err(out_of_bounds(offset, bytes.len(), len));
        }
        data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }
}

impl fmt::Debug for MemStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemStorage")
            .field("len", &self.data.read().len())
            .finish()
    }
}

impl Storage for MemStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let len = data.len() as u64;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| out_of_bounds(offset, buf.len(), len))?;
        if end > len {
            return Err(out_of_bounds(offset, buf.len(), len));
        }
        buf.copy_from_slice(&data[offset as usize..end as usize]);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

/// A cheap, cloneable window into a shared parent storage.
#[derive(Debug, Clone)]
pub struct SubStorage {
    base: Arc<dyn Storage>,
    offset: u64,
    size: u64,
}

impl SubStorage {
    /// Window `[offset, offset + size)` of `base`. The window must lie
    /// within the parent.
    pub fn new(base: Arc<dyn Storage>, offset: u64, size: u64) -> Result<Self> {
        let base_size = base.size()?;
        let end = offset
            .checked_add(size)
            .ok_or_else(|| out_of_bounds(offset, size as usize, base_size))?;
        if end > base_size {
            return Err(out_of_bounds(offset, size as usize, base_size));
        }
        Ok(Self { base, offset, size })
    }

    /// The whole of `base` as a window.
    pub fn whole(base: Arc<dyn Storage>) -> Result<Self> {
        let size = base.size()?;
        Ok(Self {
            base,
            offset: 0,
            size,
        })
    }
}

impl Storage for SubStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| out_of_bounds(offset, buf.len(), self.size))?;
        if end > self.size {
            return Err(out_of_bounds(offset, buf.len(), self.size));
        }
        self.base.read_at(self.offset + offset, buf)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

// ── Aligned buffers ─────────────────────────────────────────────────────────

/// Owned zeroed buffer whose exposed slice starts at a requested power-of-two
/// alignment. Stays fully safe by over-allocating and exposing a subslice.
#[derive(Debug)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    #[must_use]
    pub fn zeroed(len: usize, align: usize) -> Self {
        let align = align.max(1).next_power_of_two();
        let storage = vec![0u8; len + align - 1];
        let misalignment = (storage.as_ptr() as usize) & (align - 1);
        let start = if misalignment == 0 {
            0
        } else {
            align - misalignment
        };
        trace!(
            target: "bkt::storage",
            event = "buffer_alloc",
            size = len,
            alignment = align
        );
        Self {
            storage,
            start,
            len,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.start + self.len);
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fill_zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Scoped provider of aligned node buffers, shared by a tree and its
/// visitors.
pub trait NodeAllocator: Send + Sync + fmt::Debug {
    /// Returns `None` when the allocation cannot be satisfied.
    fn allocate(&self, size: usize, align: usize) -> Option<AlignedBuf>;

    /// Accounting hook invoked when a buffer allocated here is released.
    fn release(&self, size: usize);
}

/// Allocator backed by the global heap. Never fails.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl NodeAllocator for HeapAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<AlignedBuf> {
        Some(AlignedBuf::zeroed(size, align))
    }

    fn release(&self, _size: usize) {}
}

/// Wrapper that tracks outstanding bytes of an inner allocator.
#[derive(Debug)]
pub struct CountingAllocator {
    inner: Arc<dyn NodeAllocator>,
    outstanding: AtomicUsize,
}

impl CountingAllocator {
    #[must_use]
    pub fn new(inner: Arc<dyn NodeAllocator>) -> Self {
        Self {
            inner,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated and not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl NodeAllocator for CountingAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<AlignedBuf> {
        let buf = self.inner.allocate(size, align)?;
        self.outstanding.fetch_add(size, Ordering::Relaxed);
        Some(buf)
    }

    fn release(&self, size: usize) {
        self.outstanding.fetch_sub(size, Ordering::Relaxed);
        self.inner.release(size);
    }
}

/// Allocator-owned node buffer. Aligned to [`NODE_ALIGNMENT`]; reports its
/// bytes back to the allocator when dropped.
#[derive(Debug)]
pub struct NodeBuffer {
    allocator: Arc<dyn NodeAllocator>,
    buf: AlignedBuf,
}

impl NodeBuffer {
    /// Allocate `size` bytes, failing with `OutOfMemory` when the
    /// allocator declines.
    pub fn allocate(allocator: &Arc<dyn NodeAllocator>, size: usize) -> Result<Self> {
        Self::try_allocate(allocator, size).ok_or(BktError::OutOfMemory { size })
    }

    /// Allocate `size` bytes, returning `None` when the allocator
    /// declines. Used for optional scratch buffers.
    #[must_use]
    pub fn try_allocate(allocator: &Arc<dyn NodeAllocator>, size: usize) -> Option<Self> {
        let buf = allocator.allocate(size, NODE_ALIGNMENT)?;
        Some(Self {
            allocator: Arc::clone(allocator),
            buf,
        })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn fill_zero(&mut self) {
        self.buf.fill_zero();
    }
}

impl Drop for NodeBuffer {
    fn drop(&mut self) {
        self.allocator.release(self.buf.len());
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
